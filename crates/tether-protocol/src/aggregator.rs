//! Send aggregation: diverting a contiguous id range away from the
//! immediate send path.
//!
//! An aggregator claims an [`IdRange`]. While attached to a
//! [`Handler`](crate::Handler), every packet sent with an id in that
//! range is handed to [`SendAggregator::process`] instead of being
//! framed and written. The aggregator decides when to put bytes on the
//! wire, which happens in [`SendAggregator::flush`].
//!
//! Flushes are driven by the link: the most recently used aggregator is
//! flushed as soon as a packet goes anywhere else (another aggregator or
//! the direct path). That keeps the relative order of aggregated and
//! direct packets intact on the wire.

use std::ops::RangeInclusive;

use tracing::trace;

use crate::{Link, PacketId};

/// A contiguous run of packet ids, `first ..= first + count - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdRange {
    pub first: PacketId,
    pub count: u32,
}

impl IdRange {
    pub fn new(first: PacketId, count: u32) -> Self {
        Self { first, count }
    }

    /// A range holding exactly one id.
    pub fn single(id: PacketId) -> Self {
        Self::new(id, 1)
    }

    /// Last id in the range, or `None` for an empty range.
    pub fn last(&self) -> Option<PacketId> {
        match self.count {
            0 => None,
            n => Some(self.first.saturating_add(n - 1)),
        }
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.last().is_some_and(|last| self.first <= id && id <= last)
    }

    /// `true` when the two ranges share at least one id. An empty range
    /// overlaps nothing.
    pub fn overlaps(&self, other: &IdRange) -> bool {
        if self.count == 0 || other.count == 0 {
            return false;
        }
        let end = |r: &IdRange| u64::from(r.first) + u64::from(r.count);
        end(self) > u64::from(other.first) && end(other) > u64::from(self.first)
    }

    pub fn ids(&self) -> RangeInclusive<PacketId> {
        match self.last() {
            Some(last) => self.first..=last,
            #[allow(clippy::reversed_empty_ranges)]
            None => 1..=0,
        }
    }
}

/// A sink that takes over sending for a range of packet ids.
///
/// `process` receives the already encoded body of each packet in range.
/// `flush` must write whatever is held back through
/// [`Link::write_frame`]; sending through [`Link::send`] from inside a
/// flush would route the packet back through the aggregators.
pub trait SendAggregator<S, C> {
    /// Ids this aggregator claims. Must not change while attached.
    fn range(&self) -> IdRange;

    fn process(&mut self, id: PacketId, body: &[u8]);

    fn flush(&mut self, link: &mut Link<S, C>);

    /// Drops anything held back without sending it.
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// BatchAggregator
// ---------------------------------------------------------------------------

/// Holds frames back and writes them as one batch on flush.
///
/// Frames keep their original ids and their relative order.
#[derive(Debug, Clone)]
pub struct BatchAggregator {
    range: IdRange,
    frames: Vec<(PacketId, Vec<u8>)>,
}

impl BatchAggregator {
    pub fn new(range: IdRange) -> Self {
        Self {
            range,
            frames: Vec::new(),
        }
    }

    /// Number of frames waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.frames.len()
    }
}

impl<S, C> SendAggregator<S, C> for BatchAggregator
where
    S: tether_stream::ByteStream,
    C: crate::Codec,
{
    fn range(&self) -> IdRange {
        self.range
    }

    fn process(&mut self, id: PacketId, body: &[u8]) {
        self.frames.push((id, body.to_vec()));
    }

    fn flush(&mut self, link: &mut Link<S, C>) {
        if self.frames.is_empty() {
            return;
        }
        trace!(frames = self.frames.len(), first = self.range.first, "flushing batch");
        for (id, body) in self.frames.drain(..) {
            if !link.write_frame(id, &body) {
                break;
            }
        }
        self.frames.clear();
    }

    fn reset(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_bounds() {
        let range = IdRange::new(10, 3);
        assert!(!range.contains(9));
        assert!(range.contains(10));
        assert!(range.contains(12));
        assert!(!range.contains(13));
    }

    #[test]
    fn test_empty_range_contains_nothing() {
        let range = IdRange::new(10, 0);
        assert!(!range.contains(10));
        assert_eq!(range.ids().count(), 0);
    }

    #[test]
    fn test_overlap_is_symmetric() {
        let a = IdRange::new(1, 4);
        let b = IdRange::new(4, 2);
        let c = IdRange::new(5, 2);
        assert!(a.overlaps(&b) && b.overlaps(&a));
        assert!(!a.overlaps(&c) && !c.overlaps(&a));
    }

    #[test]
    fn test_empty_range_overlaps_nothing() {
        let empty = IdRange::new(3, 0);
        let around = IdRange::new(1, 5);
        assert!(!empty.overlaps(&around) && !around.overlaps(&empty));
        assert!(!empty.overlaps(&empty));
        assert!(!empty.contains(3));
    }

    #[test]
    fn test_overlap_near_the_top_of_the_id_space() {
        let a = IdRange::new(u32::MAX - 1, 2);
        assert!(a.overlaps(&IdRange::single(u32::MAX)));
        assert_eq!(a.last(), Some(u32::MAX));
    }
}
