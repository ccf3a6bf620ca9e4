use std::collections::BTreeMap;

use fixedbitset::FixedBitSet;

use crate::gc::chunk::{
    AllocationSpace, ChunkFlags, ChunkId, MemoryChunk, CHUNK_AREA_SIZE, CHUNK_HEADER_SIZE,
};
use crate::gc::object::{TypeDescriptor, WORD_SIZE};
use crate::gc::page_backend::PageBackend;
use crate::gc::{Address, Region};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(usize);

impl SpaceId {
    pub fn to_usize(self) -> usize {
        self.0
    }
}

/// Additional regular space registered by the embedder when the heap is
/// created.
#[derive(Copy, Clone, Debug)]
pub struct CustomSpaceConfig {
    pub name: &'static str,
    pub compactable: bool,
}

pub struct Space {
    id: SpaceId,
    kind: AllocationSpace,
    name: &'static str,
    compactable: bool,
    chunks: Vec<ChunkId>,
}

impl Space {
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Custom spaces are regular old spaces.
    pub fn kind(&self) -> AllocationSpace {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_compactable(&self) -> bool {
        self.compactable
    }

    pub fn chunks(&self) -> &[ChunkId] {
        &self.chunks
    }
}

/// Heap-side data of a chunk. Owned by the raw heap, the chunk only knows
/// its index.
pub struct ChunkMetadata {
    base: Address,
    size: usize,
    space: SpaceId,
    kind: AllocationSpace,
    live_bytes: Option<usize>,
    object_starts: FixedBitSet,
}

impl ChunkMetadata {
    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn kind(&self) -> AllocationSpace {
        self.kind
    }

    pub fn is_large(&self) -> bool {
        self.kind.is_large()
    }

    pub fn area(&self) -> Region {
        Region::new(self.base.offset(CHUNK_HEADER_SIZE), self.base.offset(self.size))
    }

    pub fn chunk(&self) -> &'static MemoryChunk {
        MemoryChunk::from_address(self.base)
    }

    /// Live bytes found by the last sweep, `None` for chunks that were not
    /// swept yet.
    pub fn live_bytes(&self) -> Option<usize> {
        self.live_bytes
    }

    pub fn set_live_bytes(&mut self, live_bytes: usize) {
        self.live_bytes = Some(live_bytes);
    }

    fn bit_index(&self, object: Address) -> usize {
        object.offset_from(self.area().start) / WORD_SIZE
    }

    pub fn record_object_start(&mut self, object: Address) {
        if !self.is_large() {
            let index = self.bit_index(object);
            self.object_starts.insert(index);
        }
    }

    pub fn replace_object_starts(&mut self, object_starts: FixedBitSet) {
        if !self.is_large() {
            debug_assert_eq!(object_starts.len(), self.object_starts.len());
            self.object_starts = object_starts;
        }
    }

    /// Resolves a possibly interior pointer to the start of the object
    /// containing it.
    pub fn find_object_start(&self, addr: Address) -> Option<Address> {
        let area = self.area();

        if !area.contains(addr) {
            return None;
        }

        let candidate = if self.is_large() {
            area.start
        } else {
            let index = self.bit_index(addr);
            let previous = (0..=index)
                .rev()
                .find(|&index| self.object_starts.contains(index))?;
            area.start.offset(previous * WORD_SIZE)
        };

        let object = candidate.to_obj();

        if object.header().is_forwarded() || object.is_filler_or_free_space() {
            return None;
        }

        if addr < candidate.offset(object.size()) {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn empty_object_starts() -> FixedBitSet {
        FixedBitSet::with_capacity(CHUNK_AREA_SIZE / WORD_SIZE)
    }
}

/// Calls `f` for every object in `area`, including fillers and free space.
/// Forwarded objects are reported with the descriptor of their copy.
pub fn walk_objects<F>(area: Region, mut f: F)
where
    F: FnMut(Address, &'static TypeDescriptor, usize),
{
    let mut scan = area.start;

    while scan < area.end {
        let object = scan.to_obj();
        let header = object.header();

        let (descriptor, size) = match header.forwarding_address() {
            Some(target) => {
                let copy = target.to_obj();
                (copy.descriptor(), copy.size())
            }
            None => (object.descriptor(), object.size()),
        };

        f(scan, descriptor, size);
        scan = scan.offset(size);
    }

    debug_assert_eq!(scan, area.end);
}

/// Spaces and the metadata arena of all chunks.
pub struct RawHeap {
    spaces: Vec<Space>,
    metadata: Vec<Option<ChunkMetadata>>,
    free_ids: Vec<ChunkId>,
    chunks_by_address: BTreeMap<Address, ChunkId>,
}

impl RawHeap {
    pub fn new(custom_spaces: &[CustomSpaceConfig]) -> RawHeap {
        let mut spaces = Vec::new();

        for kind in AllocationSpace::ALL {
            spaces.push(Space {
                id: SpaceId(spaces.len()),
                kind,
                name: kind.name(),
                compactable: matches!(kind, AllocationSpace::Old | AllocationSpace::Trusted),
                chunks: Vec::new(),
            });
        }

        for config in custom_spaces {
            spaces.push(Space {
                id: SpaceId(spaces.len()),
                kind: AllocationSpace::Old,
                name: config.name,
                compactable: config.compactable,
                chunks: Vec::new(),
            });
        }

        RawHeap {
            spaces,
            metadata: Vec::new(),
            free_ids: Vec::new(),
            chunks_by_address: BTreeMap::new(),
        }
    }

    pub fn space_id(kind: AllocationSpace) -> SpaceId {
        SpaceId(kind as usize)
    }

    /// Id of the n-th custom space.
    pub fn custom_space_id(&self, index: usize) -> Option<SpaceId> {
        let id = AllocationSpace::ALL.len() + index;

        if id < self.spaces.len() {
            Some(SpaceId(id))
        } else {
            None
        }
    }

    pub fn space(&self, id: SpaceId) -> &Space {
        &self.spaces[id.0]
    }

    pub fn spaces(&self) -> &[Space] {
        &self.spaces
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    /// Registers a committed chunk and writes its header.
    pub fn add_chunk(
        &mut self,
        space: SpaceId,
        base: Address,
        size: usize,
        flags: ChunkFlags,
    ) -> ChunkId {
        let kind = self.spaces[space.0].kind;

        let object_starts = if kind.is_large() {
            FixedBitSet::new()
        } else {
            ChunkMetadata::empty_object_starts()
        };

        let metadata = ChunkMetadata {
            base,
            size,
            space,
            kind,
            live_bytes: None,
            object_starts,
        };

        let id = match self.free_ids.pop() {
            Some(id) => {
                self.metadata[id.to_usize()] = Some(metadata);
                id
            }

            None => {
                self.metadata.push(Some(metadata));
                ChunkId::from(self.metadata.len() - 1)
            }
        };

        MemoryChunk::initialize(base, id, kind, size, flags);
        self.spaces[space.0].chunks.push(id);
        self.chunks_by_address.insert(base, id);
        id
    }

    /// Unregisters the chunk. The caller hands the memory back to the page
    /// backend.
    pub fn remove_chunk(&mut self, id: ChunkId) -> ChunkMetadata {
        let metadata = match self.metadata[id.to_usize()].take() {
            Some(metadata) => metadata,
            None => panic!("chunk {:?} already removed", id),
        };

        self.spaces[metadata.space.0]
            .chunks
            .retain(|&chunk| chunk != id);
        self.chunks_by_address.remove(&metadata.base);
        self.free_ids.push(id);
        metadata
    }

    /// Moves a chunk into another space of the same size class. The chunk
    /// header must be writable.
    pub fn move_chunk(&mut self, id: ChunkId, to: SpaceId) {
        let kind = self.spaces[to.0].kind;
        let from = {
            let metadata = self.metadata_mut(id);
            let from = metadata.space;
            metadata.space = to;
            metadata.kind = kind;
            metadata.chunk().set_space(kind);
            from
        };

        self.spaces[from.0].chunks.retain(|&chunk| chunk != id);
        self.spaces[to.0].chunks.push(id);
    }

    pub fn metadata(&self, id: ChunkId) -> &ChunkMetadata {
        match self.metadata[id.to_usize()] {
            Some(ref metadata) => metadata,
            None => panic!("chunk {:?} already removed", id),
        }
    }

    pub fn metadata_mut(&mut self, id: ChunkId) -> &mut ChunkMetadata {
        match self.metadata[id.to_usize()] {
            Some(ref mut metadata) => metadata,
            None => panic!("chunk {:?} already removed", id),
        }
    }

    pub fn chunk_for_address(&self, addr: Address) -> Option<ChunkId> {
        let (&base, &id) = self.chunks_by_address.range(..=addr).next_back()?;

        if addr < base.offset(self.metadata(id).size) {
            Some(id)
        } else {
            None
        }
    }

    /// All chunks in address order.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks_by_address.values().copied().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks_by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks_by_address.is_empty()
    }

    /// Unregisters every chunk and returns its memory.
    pub fn release_all(&mut self, page_backend: &mut PageBackend) {
        for id in self.chunk_ids() {
            let metadata = self.remove_chunk(id);
            release_chunk_memory(&metadata, page_backend);
        }
    }
}

pub fn release_chunk_memory(metadata: &ChunkMetadata, page_backend: &mut PageBackend) {
    if metadata.is_large() {
        page_backend.free_large_chunk(metadata.base, metadata.size);
    } else {
        page_backend.free_normal_chunk(metadata.base, metadata.kind.is_executable());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::chunk::CHUNK_SIZE;
    use crate::gc::fill_region;
    use crate::gc::object::{FixedArray, FIXED_ARRAY_TYPE};
    use crate::gc::platform::DefaultPlatform;

    #[test]
    fn standard_and_custom_spaces() {
        let heap = RawHeap::new(&[CustomSpaceConfig {
            name: "nodes",
            compactable: true,
        }]);

        assert_eq!(heap.space_count(), AllocationSpace::ALL.len() + 1);
        assert_eq!(
            heap.space(RawHeap::space_id(AllocationSpace::Code)).kind(),
            AllocationSpace::Code
        );

        let custom = heap.custom_space_id(0).expect("custom space");
        assert_eq!(heap.space(custom).name(), "nodes");
        assert_eq!(heap.space(custom).kind(), AllocationSpace::Old);
        assert!(heap.space(custom).is_compactable());
        assert!(heap.custom_space_id(1).is_none());
    }

    #[test]
    fn chunk_lookup_and_id_reuse() {
        let mut backend = PageBackend::new(DefaultPlatform::new(), None);
        let mut heap = RawHeap::new(&[]);
        let old = RawHeap::space_id(AllocationSpace::Old);

        let first_base = backend.allocate_normal_chunk(false).expect("chunk");
        let second_base = backend.allocate_normal_chunk(false).expect("chunk");
        let first = heap.add_chunk(old, first_base, CHUNK_SIZE, ChunkFlags::empty());
        let second = heap.add_chunk(old, second_base, CHUNK_SIZE, ChunkFlags::empty());

        assert_eq!(heap.chunk_for_address(first_base.offset(100)), Some(first));
        assert_eq!(heap.chunk_for_address(second_base), Some(second));
        assert_eq!(heap.chunk_for_address(Address::from(8)), None);
        assert_eq!(MemoryChunk::from_address(second_base).metadata_id(), second);
        assert_eq!(heap.space(old).chunks(), &[first, second]);

        let metadata = heap.remove_chunk(first);
        release_chunk_memory(&metadata, &mut backend);
        assert_eq!(heap.chunk_for_address(first_base.offset(100)), None);

        let third_base = backend.allocate_normal_chunk(false).expect("chunk");
        let third = heap.add_chunk(old, third_base, CHUNK_SIZE, ChunkFlags::empty());
        assert_eq!(third, first);

        heap.release_all(&mut backend);
        assert!(heap.is_empty());
        assert_eq!(backend.committed_bytes(), 0);
    }

    #[test]
    fn interior_pointers_resolve_to_object_start() {
        let mut backend = PageBackend::new(DefaultPlatform::new(), None);
        let mut heap = RawHeap::new(&[]);
        let old = RawHeap::space_id(AllocationSpace::Old);
        let base = backend.allocate_normal_chunk(false).expect("chunk");
        let id = heap.add_chunk(old, base, CHUNK_SIZE, ChunkFlags::empty());

        let area = heap.metadata(id).area();
        fill_region(area.start, area.end);

        let object = area.start.offset(64);
        object.to_obj().header().setup(&FIXED_ARRAY_TYPE, false);
        FixedArray::initialize(object, 4);
        heap.metadata_mut(id).record_object_start(object);
        fill_region(object.offset(48), area.end);

        let metadata = heap.metadata(id);
        assert_eq!(metadata.find_object_start(object), Some(object));
        assert_eq!(metadata.find_object_start(object.offset(47)), Some(object));
        assert_eq!(metadata.find_object_start(object.offset(48)), None);
        assert_eq!(metadata.find_object_start(area.start), None);
        assert_eq!(metadata.find_object_start(base), None);

        heap.release_all(&mut backend);
    }

    #[test]
    fn walk_objects_covers_area() {
        let mut memory = vec![0usize; 16];
        let start = Address::from_ptr(memory.as_mut_ptr());
        start.to_obj().header().setup(&FIXED_ARRAY_TYPE, false);
        FixedArray::initialize(start, 2);
        fill_region(start.offset(32), start.offset(40));
        fill_region(start.offset(40), start.offset(128));

        let mut sizes = Vec::new();
        walk_objects(Region::new(start, start.offset(128)), |_, descriptor, size| {
            sizes.push((descriptor.name, size));
        });

        assert_eq!(
            sizes,
            vec![("FixedArray", 32), ("Filler", 8), ("FreeSpace", 88)]
        );
    }
}
