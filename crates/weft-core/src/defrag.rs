//! Fragmented packet reassembly.
//!
//! Datagrams larger than the path MTU arrive as a head frame plus up to
//! fifteen continuation fragments, in arbitrary order. The defragmenter
//! keys partial assemblies by `(path, packet id)` in a sharded map:
//! distinct keys proceed in parallel, mutations on one key are
//! serialized by its shard. Completion moves the collected slices out
//! to the caller in one step, so no half-assembled state is ever
//! observable.
//!
//! The head of a fragmented packet arrives as index 0 declaring a total
//! of 0; the real total rides in whichever continuation is seen first.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::buf::{Slice, SliceVector};
use crate::protocol::MAX_PACKET_FRAGMENTS;

/// Outcome of feeding one fragment to the defragmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleResult {
    /// All fragments present; the slices were moved into the caller's
    /// vector in ascending index order and the record deleted.
    Complete,
    /// Fragment stored; more are outstanding.
    Accepted,
    /// This index already holds a slice. First fragment wins; the
    /// incoming copy is dropped, which keeps retransmissions idempotent.
    DuplicateFragment,
    /// Index out of range, impossible total, or a total disagreeing
    /// with what this assembly already committed to.
    InvalidFragment,
    /// The per-path budget of in-flight assemblies was exhausted; the
    /// oldest assembly on the path was evicted to admit this one.
    TooManyFragmentsForPath,
}

struct Assembly {
    path_id: u64,
    first_seen: i64,
    /// Declared fragment count; 0 until a continuation carries it.
    total: u8,
    slices: [Option<Slice>; MAX_PACKET_FRAGMENTS],
}

impl Assembly {
    fn is_complete(&self) -> bool {
        self.total != 0 && self.slices[..self.total as usize].iter().all(Option::is_some)
    }
}

/// Maps `(path, packet id)` to a partially reassembled packet.
pub struct Defragmenter {
    assemblies: DashMap<(u64, u64), Assembly>,
}

impl Defragmenter {
    /// Create an empty defragmenter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            assemblies: DashMap::new(),
        }
    }

    /// Feed one fragment.
    ///
    /// On [`AssembleResult::Complete`] the assembled slices are written
    /// to `out` in ascending fragment index and the record is deleted.
    /// Memory stays bounded: at most `max_per_path` assemblies exist
    /// per path, with the oldest evicted to admit new work.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        &self,
        packet_id: u64,
        out: &mut SliceVector,
        fragment: Slice,
        fragment_no: u8,
        total_fragments: u8,
        now: i64,
        path_id: u64,
        max_per_path: usize,
    ) -> AssembleResult {
        if fragment_no as usize >= MAX_PACKET_FRAGMENTS
            || total_fragments as usize > MAX_PACKET_FRAGMENTS
            || (total_fragments != 0 && fragment_no >= total_fragments)
        {
            return AssembleResult::InvalidFragment;
        }

        let key = (path_id, packet_id);
        let mut evicted = false;
        if !self.assemblies.contains_key(&key) {
            evicted = self.enforce_path_budget(path_id, max_per_path);
        }

        let result = match self.assemblies.entry(key) {
            Entry::Occupied(mut occ) => {
                let a = occ.get_mut();
                if total_fragments != 0 && a.total != 0 && a.total != total_fragments {
                    return AssembleResult::InvalidFragment;
                }
                if a.total != 0 && fragment_no >= a.total {
                    return AssembleResult::InvalidFragment;
                }
                if total_fragments != 0 {
                    a.total = total_fragments;
                }
                let slot = &mut a.slices[fragment_no as usize];
                if slot.is_some() {
                    return AssembleResult::DuplicateFragment;
                }
                *slot = Some(fragment);

                if a.is_complete() {
                    let mut done = occ.remove();
                    let total = done.total as usize;
                    out.extend(done.slices[..total].iter_mut().filter_map(Option::take));
                    AssembleResult::Complete
                } else {
                    AssembleResult::Accepted
                }
            }
            Entry::Vacant(vac) => {
                let mut a = Assembly {
                    path_id,
                    first_seen: now,
                    total: total_fragments,
                    slices: std::array::from_fn(|_| None),
                };
                a.slices[fragment_no as usize] = Some(fragment);
                if a.is_complete() {
                    let total = a.total as usize;
                    out.extend(a.slices[..total].iter_mut().filter_map(Option::take));
                    AssembleResult::Complete
                } else {
                    vac.insert(a);
                    AssembleResult::Accepted
                }
            }
        };

        if evicted && result == AssembleResult::Accepted {
            AssembleResult::TooManyFragmentsForPath
        } else {
            result
        }
    }

    /// Number of in-flight assemblies (all paths).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.assemblies.len()
    }

    /// Evict the oldest assembly for `path_id` if the path is at its
    /// budget. Returns whether an eviction happened.
    fn enforce_path_budget(&self, path_id: u64, max_per_path: usize) -> bool {
        let mut count = 0usize;
        let mut oldest: Option<((u64, u64), i64)> = None;
        for entry in self.assemblies.iter() {
            if entry.value().path_id != path_id {
                continue;
            }
            count += 1;
            let seen = entry.value().first_seen;
            if oldest.is_none_or(|(_, t)| seen < t) {
                oldest = Some((*entry.key(), seen));
            }
        }
        if count < max_per_path {
            return false;
        }
        if let Some((key, _)) = oldest {
            self.assemblies.remove(&key);
            return true;
        }
        false
    }
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufPool;
    use std::sync::Arc;

    fn slice_of(pool: &BufPool, bytes: &[u8]) -> Slice {
        let mut buf = pool.get();
        buf[..bytes.len()].copy_from_slice(bytes);
        Slice::new(Arc::new(buf), 0, bytes.len())
    }

    fn joined(out: &SliceVector) -> Vec<u8> {
        out.iter().flat_map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn head_then_continuations_complete() {
        let pool = BufPool::new();
        let d = Defragmenter::new();
        let mut out = SliceVector::new();

        // Head: index 0, total unknown.
        assert_eq!(
            d.assemble(7, &mut out, slice_of(&pool, b"head|"), 0, 0, 1000, 1, 32),
            AssembleResult::Accepted
        );
        // Continuations carry the real total.
        assert_eq!(
            d.assemble(7, &mut out, slice_of(&pool, b"two|"), 2, 3, 1001, 1, 32),
            AssembleResult::Accepted
        );
        assert_eq!(
            d.assemble(7, &mut out, slice_of(&pool, b"one|"), 1, 3, 1002, 1, 32),
            AssembleResult::Complete
        );
        assert_eq!(joined(&out), b"head|one|two|");
        assert_eq!(d.in_flight(), 0);
    }

    #[test]
    fn duplicate_is_first_win() {
        let pool = BufPool::new();
        let d = Defragmenter::new();
        let mut out = SliceVector::new();

        d.assemble(9, &mut out, slice_of(&pool, b"first"), 1, 3, 0, 1, 32);
        assert_eq!(
            d.assemble(9, &mut out, slice_of(&pool, b"again"), 1, 3, 1, 1, 32),
            AssembleResult::DuplicateFragment
        );

        d.assemble(9, &mut out, slice_of(&pool, b"h"), 0, 0, 2, 1, 32);
        assert_eq!(
            d.assemble(9, &mut out, slice_of(&pool, b"t"), 2, 3, 3, 1, 32),
            AssembleResult::Complete
        );
        assert_eq!(joined(&out), b"hfirstt");
    }

    #[test]
    fn index_and_total_validation() {
        let pool = BufPool::new();
        let d = Defragmenter::new();
        let mut out = SliceVector::new();

        // Index beyond declared total.
        assert_eq!(
            d.assemble(1, &mut out, slice_of(&pool, b"x"), 3, 3, 0, 1, 32),
            AssembleResult::InvalidFragment
        );
        // Impossible total.
        assert_eq!(
            d.assemble(2, &mut out, slice_of(&pool, b"x"), 0, 17, 0, 1, 32),
            AssembleResult::InvalidFragment
        );
        // Total disagreement with an established assembly.
        d.assemble(3, &mut out, slice_of(&pool, b"x"), 1, 4, 0, 1, 32);
        assert_eq!(
            d.assemble(3, &mut out, slice_of(&pool, b"y"), 2, 5, 1, 1, 32),
            AssembleResult::InvalidFragment
        );
        // The invalid fragment did not disturb the assembly.
        assert_eq!(d.in_flight(), 1);
    }

    #[test]
    fn path_budget_evicts_oldest() {
        let pool = BufPool::new();
        let d = Defragmenter::new();
        let mut out = SliceVector::new();

        for i in 0..4u64 {
            d.assemble(i, &mut out, slice_of(&pool, b"x"), 0, 0, i as i64, 1, 4);
        }
        assert_eq!(d.in_flight(), 4);

        // Fifth assembly on the path: oldest (packet 0) evicted.
        assert_eq!(
            d.assemble(99, &mut out, slice_of(&pool, b"x"), 0, 0, 50, 1, 4),
            AssembleResult::TooManyFragmentsForPath
        );
        assert_eq!(d.in_flight(), 4);

        // Packet 0 must restart from scratch.
        assert_eq!(
            d.assemble(0, &mut out, slice_of(&pool, b"x"), 1, 2, 60, 1, 4),
            AssembleResult::TooManyFragmentsForPath
        );

        // A different path is unaffected by path 1's budget.
        assert_eq!(
            d.assemble(7, &mut out, slice_of(&pool, b"x"), 0, 0, 70, 2, 4),
            AssembleResult::Accepted
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any arrival order yields bytewise-identical assembly.
            #[test]
            fn assembly_is_order_independent(
                order in Just((0u8..6).collect::<Vec<_>>()).prop_shuffle(),
            ) {
                let pool = BufPool::new();
                let d = Defragmenter::new();
                let mut out = SliceVector::new();

                let mut completions = 0;
                for (step, &i) in order.iter().enumerate() {
                    let body = vec![i; 40];
                    let total = if i == 0 { 0 } else { 6 };
                    let r = d.assemble(42, &mut out, super::slice_of(&pool, &body), i, total, step as i64, 1, 32);
                    match r {
                        AssembleResult::Complete => completions += 1,
                        AssembleResult::Accepted => {}
                        other => prop_assert!(false, "unexpected result {other:?}"),
                    }
                }
                prop_assert_eq!(completions, 1);

                let expected: Vec<u8> = (0u8..6).flat_map(|i| vec![i; 40]).collect();
                prop_assert_eq!(super::joined(&out), expected);
            }
        }
    }
}
