//! Context creation installs the configured log level.

mod common;

use common::*;
use symheap_rust::*;

#[test]
fn test_context_applies_configured_log_level() {
    let config = ConfigBuilder::new().log_level("trace").build().unwrap();
    let attrs = set_attributes(0, 1, 16 * KIB, unique_endpoint("logging"))
        .unwrap()
        .with_config(config)
        .unwrap();
    let _ctx = Context::create(attrs).unwrap();

    // An explicit RUST_LOG filter takes precedence over the config.
    if std::env::var_os("RUST_LOG").is_none() {
        assert_eq!(log::max_level(), log::LevelFilter::Trace);
    }
}
