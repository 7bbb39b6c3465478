//! Teams: affine `(start, stride, size)` subsets of the global rank space.
//!
//! A team is a plain value. Splitting composes the affine maps, so a team
//! always knows its members in global terms without consulting its parent
//! again. Non-members hold a valid description whose `my_pe` is `None`.

use crate::core::error::{Result, SymHeapError};
use crate::core::types::Rank;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Affine rank subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team {
    global_start: Rank,
    global_stride: usize,
    size: usize,
    my_pe: Option<usize>,
}

impl Team {
    /// Team containing every rank of a world of `world_size`, seen from
    /// global rank `my_rank`.
    pub fn world(my_rank: Rank, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(SymHeapError::invalid_argument(
                "world_size",
                world_size,
                "must be positive",
            ));
        }
        Ok(Team {
            global_start: 0,
            global_stride: 1,
            size: world_size,
            my_pe: (my_rank < world_size).then_some(my_rank),
        })
    }

    /// Split `parent` into the members `start, start + stride, ...` (parent
    /// indices), `size` of them.
    pub fn split_strided(parent: &Team, start: usize, stride: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SymHeapError::invalid_argument("size", size, "must be positive"));
        }
        if stride == 0 {
            return Err(SymHeapError::invalid_argument(
                "stride",
                stride,
                "must be positive",
            ));
        }
        let last = (size - 1)
            .checked_mul(stride)
            .and_then(|span| span.checked_add(start))
            .filter(|&last| last < parent.size)
            .ok_or_else(|| {
                SymHeapError::invalid_argument(
                    "size",
                    size,
                    format!(
                        "start {} stride {} runs past parent of {} members",
                        start, stride, parent.size
                    ),
                )
            })?;

        let global_start = parent.global_start + start * parent.global_stride;
        let global_stride = parent.global_stride * stride;
        let my_pe = parent.my_pe.and_then(|index| {
            (index >= start && (index - start) % stride == 0 && index <= last)
                .then(|| (index - start) / stride)
        });

        let team = Team {
            global_start,
            global_stride,
            size,
            my_pe,
        };
        log::debug!("split team {} from {}", team, parent);
        Ok(team)
    }

    /// This rank's index in the team, `None` if it is not a member.
    pub fn my_pe(&self) -> Option<usize> {
        self.my_pe
    }

    /// Number of members.
    pub fn n_pes(&self) -> usize {
        self.size
    }

    /// Global rank of member `index`.
    pub fn global_rank(&self, index: usize) -> Option<Rank> {
        (index < self.size).then(|| self.global_start + index * self.global_stride)
    }

    /// Member index of `global_rank`, if it belongs to the team.
    pub fn local_index(&self, global_rank: Rank) -> Option<usize> {
        if global_rank < self.global_start {
            return None;
        }
        let distance = global_rank - self.global_start;
        if distance % self.global_stride != 0 {
            return None;
        }
        let index = distance / self.global_stride;
        (index < self.size).then_some(index)
    }

    /// Whether `global_rank` is a member.
    pub fn contains(&self, global_rank: Rank) -> bool {
        self.local_index(global_rank).is_some()
    }

    /// Map member `index` of `self` to its index in `dst`.
    pub fn translate_pe(&self, index: usize, dst: &Team) -> Option<usize> {
        self.global_rank(index)
            .and_then(|global| dst.local_index(global))
    }

    /// Release the team. Teams hold no shared resources, so this only
    /// consumes the value.
    pub fn destroy(self) {
        log::debug!("destroy team {}", self);
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "team(start={}, stride={}, size={})",
            self.global_start, self.global_stride, self.size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_team() {
        let world = Team::world(2, 8).unwrap();
        assert_eq!(world.my_pe(), Some(2));
        assert_eq!(world.n_pes(), 8);
        assert_eq!(world.global_rank(7), Some(7));
        assert_eq!(world.global_rank(8), None);
        assert!(Team::world(0, 0).is_err());
    }

    #[test]
    fn test_odd_ranks_team() {
        let n = 8;
        for rank in 0..n {
            let world = Team::world(rank, n).unwrap();
            let odd = Team::split_strided(&world, 1, 2, n / 2).unwrap();
            if rank % 2 == 1 {
                assert_eq!(odd.my_pe(), Some((rank - 1) / 2));
            } else {
                assert_eq!(odd.my_pe(), None);
            }
            for k in 0..n / 2 {
                assert_eq!(odd.translate_pe(k, &world), Some(1 + 2 * k));
            }
            for even in (0..n).step_by(2) {
                assert_eq!(world.translate_pe(even, &odd), None);
            }
        }
    }

    #[test]
    fn test_nested_split_composes() {
        let world = Team::world(5, 16).unwrap();
        let odd = Team::split_strided(&world, 1, 2, 8).unwrap();
        // Members 1, 3, 5, 7 of `odd`: global 3, 7, 11, 15.
        let nested = Team::split_strided(&odd, 1, 2, 4).unwrap();
        assert_eq!(nested.global_rank(0), Some(3));
        assert_eq!(nested.global_rank(3), Some(15));
        assert!(nested.contains(11));
        assert!(!nested.contains(5));
        assert_eq!(nested.my_pe(), None);
        assert_eq!(nested.translate_pe(2, &odd), Some(5));
        assert_eq!(odd.translate_pe(0, &nested), None);
        nested.destroy();
    }

    #[test]
    fn test_invalid_splits() {
        let world = Team::world(0, 8).unwrap();
        assert!(Team::split_strided(&world, 0, 1, 0).is_err());
        assert!(Team::split_strided(&world, 0, 0, 2).is_err());
        assert!(Team::split_strided(&world, 1, 2, 5).is_err());
        assert!(Team::split_strided(&world, 8, 1, 1).is_err());
        assert!(Team::split_strided(&world, 0, usize::MAX, 3).is_err());
        assert!(Team::split_strided(&world, 7, 1, 1).is_ok());
    }

    #[test]
    fn test_translate_out_of_range_index() {
        let world = Team::world(0, 4).unwrap();
        let pair = Team::split_strided(&world, 0, 2, 2).unwrap();
        assert_eq!(pair.translate_pe(2, &world), None);
        assert_eq!(world.translate_pe(2, &pair), Some(1));
    }
}
