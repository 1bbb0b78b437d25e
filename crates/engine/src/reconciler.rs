//! Groups per-variation analysis events into complete ranked bundles

use tracing::debug;

use crate::uci::AnalysisEvent;

/// Accumulates engine events until one event per requested variation has
/// arrived, in rank order, for the same search instant.
///
/// Engines interleave, restart and drop variations mid-search; correctness
/// here depends only on rank ordering, never on timing. An event whose rank
/// does not extend the accumulator indicates a desynchronized stream: the
/// accumulator is discarded and the event dropped, and accumulation resumes
/// at the next rank-1 event.
#[derive(Debug)]
pub struct BundleReconciler {
    target_len: usize,
    pending: Vec<AnalysisEvent>,
}

impl BundleReconciler {
    pub fn new(target_len: usize) -> Self {
        Self {
            target_len,
            pending: Vec::with_capacity(target_len),
        }
    }

    /// Feed one event; returns a complete bundle of `target_len` events,
    /// best variation first, once one is assembled.
    pub fn push(&mut self, event: AnalysisEvent) -> Option<Vec<AnalysisEvent>> {
        let Some(rank) = event.multipv else {
            debug!(?event, "event without variation rank, ignoring");
            return None;
        };

        if rank as usize != self.pending.len() + 1 {
            debug!(rank, expected = self.pending.len() + 1, "desynchronized event, resetting bundle");
            self.pending.clear();
            return None;
        }

        self.pending.push(event);
        if self.pending.len() == self.target_len {
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(rank: Option<u32>) -> AnalysisEvent {
        AnalysisEvent {
            multipv: rank,
            ..Default::default()
        }
    }

    #[test]
    fn test_emits_complete_bundles() {
        let mut reconciler = BundleReconciler::new(2);
        assert!(reconciler.push(event(Some(1))).is_none());
        let bundle = reconciler.push(event(Some(2))).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle[0].multipv, Some(1));
        assert_eq!(bundle[1].multipv, Some(2));
    }

    #[test]
    fn test_discards_desynchronized_segment() {
        // The 1,3 segment is desynchronized: 3 resets the bundle and 2 is
        // dropped, then accumulation resumes at the next rank-1 event.
        let ranks = [1, 2, 3, 1, 2, 3, 1, 3, 2, 1, 2, 3];
        let mut reconciler = BundleReconciler::new(3);
        let mut bundles = 0;
        for rank in ranks {
            if reconciler.push(event(Some(rank))).is_some() {
                bundles += 1;
            }
        }
        assert_eq!(bundles, 3);
    }

    #[test]
    fn test_ignores_events_without_rank() {
        let mut reconciler = BundleReconciler::new(2);
        assert!(reconciler.push(event(Some(1))).is_none());
        assert!(reconciler.push(event(None)).is_none());
        // The rankless event did not disturb the accumulator.
        assert!(reconciler.push(event(Some(2))).is_some());
    }

    #[test]
    fn test_single_variation_bundles() {
        let mut reconciler = BundleReconciler::new(1);
        assert!(reconciler.push(event(Some(1))).is_some());
        assert!(reconciler.push(event(Some(1))).is_some());
    }
}
