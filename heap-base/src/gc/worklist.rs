use std::mem::size_of;

use crate::gc::Address;
use crate::mem::ptr_width_usize;

const SEGMENT_SIZE: usize = 1024;
const SEGMENT_ENTRY_CAPACITY: usize = (SEGMENT_SIZE - 2 * size_of::<usize>()) / ptr_width_usize();

/// Fixed-capacity block of pending objects.
pub struct WorklistSegment {
    entries: Vec<Address>,
}

impl WorklistSegment {
    pub fn new() -> WorklistSegment {
        WorklistSegment {
            entries: Vec::with_capacity(SEGMENT_ENTRY_CAPACITY),
        }
    }

    pub fn push(&mut self, address: Address) -> bool {
        if self.entries.len() < SEGMENT_ENTRY_CAPACITY {
            self.entries.push(address);
            true
        } else {
            false
        }
    }

    pub fn pop(&mut self) -> Option<Address> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// List of segments shared between marking phases.
pub struct Worklist {
    segments: Vec<WorklistSegment>,
}

impl Worklist {
    pub fn new() -> Worklist {
        Worklist {
            segments: Vec::new(),
        }
    }

    pub fn append(&mut self, other: &mut Worklist) {
        self.segments.append(&mut other.segments);
    }

    fn push_segment(&mut self, segment: WorklistSegment) {
        debug_assert!(!segment.is_empty());
        self.segments.push(segment);
    }

    fn pop_segment(&mut self) -> Option<WorklistSegment> {
        self.segments.pop()
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|segment| segment.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

/// Marking worklist of the heap thread: a push and a pop segment in front of
/// the global segment list.
pub struct MarkingWorklist {
    push_segment: WorklistSegment,
    pop_segment: WorklistSegment,
    global: Worklist,
}

impl MarkingWorklist {
    pub fn new() -> MarkingWorklist {
        MarkingWorklist {
            push_segment: WorklistSegment::new(),
            pop_segment: WorklistSegment::new(),
            global: Worklist::new(),
        }
    }

    pub fn push(&mut self, object: Address) {
        if !self.push_segment.push(object) {
            let full = std::mem::replace(&mut self.push_segment, WorklistSegment::new());
            self.global.push_segment(full);
            let pushed = self.push_segment.push(object);
            debug_assert!(pushed);
        }
    }

    pub fn pop(&mut self) -> Option<Address> {
        if let Some(object) = self.pop_segment.pop() {
            return Some(object);
        }

        if let Some(object) = self.push_segment.pop() {
            return Some(object);
        }

        let segment = self.global.pop_segment()?;
        self.pop_segment = segment;
        self.pop_segment.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.push_segment.is_empty() && self.pop_segment.is_empty() && self.global.is_empty()
    }

    pub fn len(&self) -> usize {
        self.push_segment.len() + self.pop_segment.len() + self.global.len()
    }

    /// Removes all entries, used to hand them to parallel markers.
    pub fn drain(&mut self) -> Vec<Address> {
        let mut result = Vec::with_capacity(self.len());

        while let Some(object) = self.pop() {
            result.push(object);
        }

        result
    }

    pub fn clear(&mut self) {
        self.push_segment = WorklistSegment::new();
        self.pop_segment = WorklistSegment::new();
        self.global.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::gc::Address;

    use super::{MarkingWorklist, Worklist, WorklistSegment, SEGMENT_ENTRY_CAPACITY};

    #[test]
    fn segments_in_worklist() {
        let mut worklist = Worklist::new();
        const SEGMENTS: usize = 10;

        for size in 1..=SEGMENTS {
            let mut seg = WorklistSegment::new();
            for _ in 0..size {
                seg.push(Address::null());
            }
            assert_eq!(seg.len(), size);
            worklist.push_segment(seg);
        }

        assert_eq!(worklist.len(), SEGMENTS * (SEGMENTS + 1) / 2);
        let mut popped = 0;

        while let Some(seg) = worklist.pop_segment() {
            assert_eq!(seg.len(), SEGMENTS - popped);
            popped += 1;
        }

        assert_eq!(popped, SEGMENTS);
        assert!(worklist.is_empty());
    }

    #[test]
    fn push_into_segment() {
        let mut seg = WorklistSegment::new();
        for idx in 0..SEGMENT_ENTRY_CAPACITY {
            assert_eq!(seg.len(), idx);
            assert!(seg.push(Address::null()));
        }
        assert_eq!(seg.len(), SEGMENT_ENTRY_CAPACITY);
        assert!(!seg.push(Address::null()));
    }

    #[test]
    fn pop_from_segment() {
        let mut seg = WorklistSegment::new();
        assert!(seg.push(1.into()));
        assert!(seg.push(2.into()));
        assert_eq!(seg.pop().expect("missing").to_usize(), 2);
        assert_eq!(seg.pop().expect("missing").to_usize(), 1);
        assert!(seg.pop().is_none());
    }

    #[test]
    fn marking_worklist_spills_into_segments() {
        let mut worklist = MarkingWorklist::new();
        let entries = 3 * SEGMENT_ENTRY_CAPACITY + 7;

        for value in 0..entries {
            worklist.push(Address::from(value * 8));
        }

        assert_eq!(worklist.len(), entries);

        let mut seen = vec![false; entries];

        while let Some(object) = worklist.pop() {
            let index = object.to_usize() / 8;
            assert!(!seen[index]);
            seen[index] = true;
        }

        assert!(seen.iter().all(|&seen| seen));
        assert!(worklist.is_empty());
    }

    #[test]
    fn drain_empties_worklist() {
        let mut worklist = MarkingWorklist::new();
        worklist.push(8.into());
        worklist.push(16.into());

        let drained = worklist.drain();
        assert_eq!(drained.len(), 2);
        assert!(worklist.is_empty());

        worklist.push(24.into());
        worklist.clear();
        assert!(worklist.pop().is_none());
    }

    #[test]
    fn append_moves_segments() {
        let mut first = Worklist::new();
        let mut second = Worklist::new();

        let mut seg = WorklistSegment::new();
        seg.push(8.into());
        second.push_segment(seg);

        first.append(&mut second);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
