use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::core::{BlockOffset, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(pub u64);

/// A text range anchored to block identity rather than to absolute offsets, so
/// reordering blocks or splitting leaves never moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRange {
    pub start: BlockOffset,
    pub end: BlockOffset,
}

#[derive(Debug, Clone, Default)]
pub struct RangeMarkers {
    next: u64,
    ranges: BTreeMap<MarkerId, MarkerRange>,
}

impl RangeMarkers {
    pub fn insert(&mut self, range: MarkerRange) -> MarkerId {
        self.next += 1;
        let id = MarkerId(self.next);
        self.ranges.insert(id, range);
        id
    }

    pub fn get(&self, id: MarkerId) -> Option<MarkerRange> {
        self.ranges.get(&id).copied()
    }

    pub fn remove(&mut self, id: MarkerId) -> Option<MarkerRange> {
        self.ranges.remove(&id)
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MarkerId, MarkerRange)> + '_ {
        self.ranges.iter().map(|(id, range)| (*id, *range))
    }

    /// Text typed exactly at a range boundary lands outside the range.
    pub(crate) fn text_inserted(&mut self, block: NodeId, at: usize, len: usize) {
        if len == 0 {
            return;
        }
        for range in self.ranges.values_mut() {
            if range.start.block == block && range.start.offset >= at {
                range.start.offset += len;
            }
            if range.end.block == block && range.end.offset > at {
                range.end.offset += len;
            }
        }
    }

    pub(crate) fn text_removed(&mut self, block: NodeId, removed: Range<usize>) {
        let len = removed.end.saturating_sub(removed.start);
        if len == 0 {
            return;
        }
        for range in self.ranges.values_mut() {
            for point in [&mut range.start, &mut range.end] {
                if point.block != block || point.offset <= removed.start {
                    continue;
                }
                if point.offset >= removed.end {
                    point.offset -= len;
                } else {
                    point.offset = removed.start;
                }
            }
        }
    }

    /// A leaf covering `from_range` of block `from` now starts at `to_offset`
    /// in block `to`. Endpoints inside the leaf travel with it: a start at the
    /// leaf's first byte and an end at its last byte count as inside. The
    /// rest of both blocks shift as for a removal followed by an insertion.
    pub(crate) fn text_moved(
        &mut self,
        from: NodeId,
        from_range: Range<usize>,
        to: NodeId,
        to_offset: usize,
    ) {
        let len = from_range.end.saturating_sub(from_range.start);
        if len == 0 || (from == to && from_range.start == to_offset) {
            return;
        }
        for range in self.ranges.values_mut() {
            for (point, is_start) in [(&mut range.start, true), (&mut range.end, false)] {
                let inside = point.block == from
                    && if is_start {
                        from_range.start <= point.offset && point.offset < from_range.end
                    } else {
                        from_range.start < point.offset && point.offset <= from_range.end
                    };
                if inside {
                    *point = BlockOffset {
                        block: to,
                        offset: to_offset + (point.offset - from_range.start),
                    };
                    continue;
                }
                if point.block == from && point.offset >= from_range.end {
                    point.offset -= len;
                }
                if point.block == to
                    && (point.offset > to_offset || (is_start && point.offset == to_offset))
                {
                    point.offset += len;
                }
            }
        }
    }

    pub(crate) fn blocks_removed(&mut self, blocks: &[NodeId]) {
        self.ranges.retain(|_, range| {
            !blocks.contains(&range.start.block) && !blocks.contains(&range.end.block)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(block: u64, offset: usize) -> BlockOffset {
        BlockOffset {
            block: NodeId(block),
            offset,
        }
    }

    #[test]
    fn insertion_before_range_shifts_both_ends() {
        let mut markers = RangeMarkers::default();
        let id = markers.insert(MarkerRange {
            start: at(2, 4),
            end: at(2, 8),
        });

        markers.text_inserted(NodeId(2), 0, 3);
        assert_eq!(markers.get(id).map(|r| (r.start.offset, r.end.offset)), Some((7, 11)));

        markers.text_inserted(NodeId(2), 11, 5);
        assert_eq!(markers.get(id).map(|r| r.end.offset), Some(11));
    }

    #[test]
    fn removal_overlapping_start_collapses_onto_removed_start() {
        let mut markers = RangeMarkers::default();
        let id = markers.insert(MarkerRange {
            start: at(2, 4),
            end: at(3, 2),
        });

        markers.text_removed(NodeId(2), 2..6);
        let range = markers.get(id).unwrap();
        assert_eq!(range.start, at(2, 2));
        assert_eq!(range.end, at(3, 2));

        markers.blocks_removed(&[NodeId(3)]);
        assert!(markers.is_empty());
    }

    #[test]
    fn moved_leaf_carries_its_endpoints_to_the_new_block() {
        let mut markers = RangeMarkers::default();
        let inside = markers.insert(MarkerRange {
            start: at(2, 6),
            end: at(2, 11),
        });
        let before = markers.insert(MarkerRange {
            start: at(2, 0),
            end: at(2, 2),
        });
        let target = markers.insert(MarkerRange {
            start: at(3, 0),
            end: at(3, 3),
        });

        // Leaf 2..11 of block 2 moves to the front of block 3.
        markers.text_moved(NodeId(2), 2..11, NodeId(3), 0);

        let range = markers.get(inside).unwrap();
        assert_eq!((range.start, range.end), (at(3, 4), at(3, 9)));
        let range = markers.get(before).unwrap();
        assert_eq!((range.start, range.end), (at(2, 0), at(2, 2)));
        let range = markers.get(target).unwrap();
        assert_eq!((range.start, range.end), (at(3, 9), at(3, 12)));
    }

    #[test]
    fn leaves_moved_one_by_one_keep_a_spanning_range() {
        let mut markers = RangeMarkers::default();
        let id = markers.insert(MarkerRange {
            start: at(3, 4),
            end: at(3, 9),
        });

        // "two " then "three" are appended to block 2, which holds "one".
        markers.text_moved(NodeId(3), 0..4, NodeId(2), 3);
        markers.text_moved(NodeId(3), 0..5, NodeId(2), 7);
        markers.blocks_removed(&[NodeId(3)]);

        let range = markers.get(id).unwrap();
        assert_eq!((range.start, range.end), (at(2, 7), at(2, 12)));
    }
}
