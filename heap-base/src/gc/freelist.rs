use crate::gc::object::FREE_SPACE_MIN_SIZE;
use crate::gc::{fill_region, Region, K};

const SIZE_CLASSES: usize = 6;

const SIZE_TINY: usize = FREE_SPACE_MIN_SIZE;
const SIZE_SMALL: usize = 64;
const SIZE_MEDIUM: usize = 256;
const SIZE_LARGE: usize = K;
const SIZE_XLARGE: usize = 4 * K;
const SIZE_HUGE: usize = 16 * K;

const SIZES: [usize; SIZE_CLASSES] = [
    SIZE_TINY,
    SIZE_SMALL,
    SIZE_MEDIUM,
    SIZE_LARGE,
    SIZE_XLARGE,
    SIZE_HUGE,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
    XLarge,
    Huge,
}

impl SizeClass {
    const ALL: [SizeClass; SIZE_CLASSES] = [
        SizeClass::Tiny,
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
        SizeClass::XLarge,
        SizeClass::Huge,
    ];

    /// Class containing entries of `size` bytes.
    fn next_down(size: usize) -> SizeClass {
        assert!(size >= SIZE_TINY);

        for class in SizeClass::ALL.iter().rev() {
            if size >= class.min_size() {
                return *class;
            }
        }

        SizeClass::Tiny
    }

    /// Smallest class in which every entry has at least `size` bytes.
    fn next_up(size: usize) -> SizeClass {
        for class in SizeClass::ALL {
            if class.min_size() >= size {
                return class;
            }
        }

        SizeClass::Huge
    }

    fn idx(self) -> usize {
        self as usize
    }

    fn min_size(self) -> usize {
        SIZES[self.idx()]
    }
}

/// Segregated free list of a space. Entries are regions already covered by
/// a free space object.
pub struct FreeList {
    classes: Vec<Vec<Region>>,
    free_bytes: usize,
}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList {
            classes: vec![Vec::new(); SIZE_CLASSES],
            free_bytes: 0,
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.free_bytes == 0
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(|class| class.len()).sum()
    }

    /// Adds the region; regions too small for an entry are only filled.
    pub fn add(&mut self, region: Region) {
        fill_region(region.start, region.end);
        let size = region.size();

        if size < SIZE_TINY {
            return;
        }

        let class = SizeClass::next_down(size);
        self.classes[class.idx()].push(region);
        self.free_bytes += size;
    }

    /// Removes and returns an entry of at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Option<Region> {
        let first = SizeClass::next_up(size);

        for class in SizeClass::ALL.iter().skip(first.idx()) {
            if let Some(index) = self.find_in_class(*class, size) {
                return Some(self.take(*class, index));
            }
        }

        if size >= SIZE_TINY {
            let class = SizeClass::next_down(size);

            if let Some(index) = self.find_in_class(class, size) {
                return Some(self.take(class, index));
            }
        }

        None
    }

    fn find_in_class(&self, class: SizeClass, size: usize) -> Option<usize> {
        self.classes[class.idx()]
            .iter()
            .rposition(|region| region.size() >= size)
    }

    fn take(&mut self, class: SizeClass, index: usize) -> Region {
        let region = self.classes[class.idx()].swap_remove(index);
        self.free_bytes -= region.size();
        region
    }

    /// Drops all entries inside `chunk`.
    pub fn remove_chunk(&mut self, chunk: Region) {
        let mut removed = 0;

        for class in &mut self.classes {
            class.retain(|region| {
                if chunk.fully_contains(region) {
                    removed += region.size();
                    false
                } else {
                    true
                }
            });
        }

        self.free_bytes -= removed;
    }

    pub fn clear(&mut self) {
        for class in &mut self.classes {
            class.clear();
        }

        self.free_bytes = 0;
    }
}
