//! Allocation of the built-in object layouts. Objects are fully
//! initialized before they are handed out.

use crate::error::{fatal, FatalError, HeapError};
use crate::gc::chunk::AllocationSpace;
use crate::gc::heap_base::HeapBase;
use crate::gc::object::{
    ConsString, FixedArray, Header, JsObject, SeqString, ThinString, TypeDescriptor, TypeTag,
    CONS_STRING_TYPE, FIXED_ARRAY_TYPE, FIXED_DOUBLE_ARRAY_TYPE, SEQ_STRING_TYPE,
    THIN_STRING_TYPE, WEAK_FIXED_ARRAY_TYPE, WORD_SIZE,
};
use crate::gc::space::RawHeap;
use crate::gc::Address;
use crate::mem;

/// Length of any string layout, `None` for other objects.
pub fn string_length(object: Address) -> Option<usize> {
    match object.to_obj().descriptor().tag {
        TypeTag::SeqString => Some(SeqString::length(object)),
        TypeTag::ConsString => Some(object.to_obj().word_at(ConsString::LENGTH_OFFSET)),
        TypeTag::ThinString => string_length(ThinString::actual(object)),
        _ => None,
    }
}

fn expect_string_length(object: Address) -> usize {
    string_length(object).unwrap_or_else(|| {
        fatal(FatalError::WrongLayout {
            name: object.to_obj().descriptor().name,
            expected: "string",
        })
    })
}

impl HeapBase {
    /// Allocates in the regular old space.
    pub fn allocate(&mut self, descriptor: &'static TypeDescriptor, size: usize) -> Address {
        let space = RawHeap::space_id(AllocationSpace::Old);
        self.allocate_in_space(space, descriptor, size)
    }

    /// Like `allocate`, for a size computed from embedder input. An
    /// overflowing size goes to the out-of-memory handler.
    fn allocate_checked(
        &mut self,
        descriptor: &'static TypeDescriptor,
        size: Option<usize>,
    ) -> Address {
        let size = self.size_or_out_of_memory(size, descriptor.name);
        self.allocate(descriptor, size)
    }

    fn size_or_out_of_memory(&self, size: Option<usize>, context: &'static str) -> usize {
        match size {
            Some(size) => size,
            None => self.out_of_memory(&HeapError::OutOfMemory {
                requested: usize::MAX,
                context,
            }),
        }
    }

    pub fn allocate_fixed_array(&mut self, length: usize) -> Address {
        let object = self.allocate_checked(&FIXED_ARRAY_TYPE, FixedArray::checked_size_for(length));
        FixedArray::initialize(object, length);
        object
    }

    pub fn allocate_weak_fixed_array(&mut self, length: usize) -> Address {
        let object =
            self.allocate_checked(&WEAK_FIXED_ARRAY_TYPE, FixedArray::checked_size_for(length));
        FixedArray::initialize(object, length);
        object
    }

    pub fn allocate_fixed_double_array(&mut self, values: &[f64]) -> Address {
        let object = self.allocate_checked(
            &FIXED_DOUBLE_ARRAY_TYPE,
            FixedArray::checked_size_for(values.len()),
        );
        FixedArray::initialize(object, values.len());

        for (index, value) in values.iter().enumerate() {
            let offset = FixedArray::HEADER_SIZE + index * WORD_SIZE;
            object.to_obj().set_word_at(offset, value.to_bits() as usize);
        }

        object
    }

    /// Allocates a struct with all fields zeroed.
    pub fn allocate_struct(&mut self, descriptor: &'static TypeDescriptor) -> Address {
        if descriptor.tag != TypeTag::Struct {
            fatal(FatalError::WrongLayout {
                name: descriptor.name,
                expected: "struct",
            });
        }

        let object = self.allocate(descriptor, descriptor.instance_size);
        clear_body(object, descriptor.instance_size);
        object
    }

    /// Allocates a JS object with empty properties, elements and fields.
    pub fn allocate_js_object(&mut self, descriptor: &'static TypeDescriptor) -> Address {
        if !matches!(
            descriptor.tag,
            TypeTag::JsObjectFast | TypeTag::JsApiObject
        ) {
            fatal(FatalError::WrongLayout {
                name: descriptor.name,
                expected: "JS object",
            });
        }

        let size = self.size_or_out_of_memory(
            JsObject::checked_size_for(descriptor.embedder_fields, descriptor.in_object_fields),
            descriptor.name,
        );
        let object = self.allocate(descriptor, size);
        clear_body(object, size);
        object
    }

    pub fn allocate_seq_string(&mut self, content: &[u8]) -> Address {
        let object =
            self.allocate_checked(&SEQ_STRING_TYPE, SeqString::checked_size_for(content.len()));
        SeqString::initialize(object, content);
        object
    }

    /// `first` and `second` stay rooted while the allocation may collect.
    pub fn allocate_cons_string(&mut self, first: Address, second: Address) -> Address {
        let length = self.size_or_out_of_memory(
            expect_string_length(first).checked_add(expect_string_length(second)),
            CONS_STRING_TYPE.name,
        );
        let first = self.persistent(first);
        let second = self.persistent(second);

        let object = self.allocate(&CONS_STRING_TYPE, ConsString::SIZE);
        clear_body(object, ConsString::SIZE);
        object
            .to_obj()
            .set_word_at(ConsString::LENGTH_OFFSET, length);
        self.store(object, ConsString::FIRST_OFFSET, first.get());
        self.store(object, ConsString::SECOND_OFFSET, second.get());
        object
    }

    pub fn allocate_thin_string(&mut self, actual: Address) -> Address {
        expect_string_length(actual);
        let actual = self.persistent(actual);

        let object = self.allocate(&THIN_STRING_TYPE, ThinString::SIZE);
        clear_body(object, ThinString::SIZE);
        self.store(object, ThinString::ACTUAL_OFFSET, actual.get());
        object
    }
}

fn clear_body(object: Address, size: usize) {
    mem::fill_bytes(object.offset(Header::size()), size - Header::size(), 0);
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;

    use crate::error::HeapError;
    use crate::gc::heap_base::{GcConfig, HeapBase};
    use crate::gc::object::{ConsString, FixedArray, SeqString, ThinString, TypeDescriptor, WORD_SIZE};
    use crate::gc::platform::DefaultPlatform;
    use crate::gc::stats::DetailLevel;
    use crate::HeapFlags;

    use super::string_length;

    fn heap() -> HeapBase {
        let flags = HeapFlags {
            gc_workers: 1,
            gc_verify: true,
            ..HeapFlags::default()
        };

        HeapBase::new(flags, DefaultPlatform::new()).expect("heap")
    }

    #[test]
    fn strings_survive_collections() {
        let mut heap = heap();

        let hello = heap.allocate_seq_string(b"hello ");
        let world = heap.allocate_seq_string(b"world");
        let cons = heap.allocate_cons_string(hello, world);
        let thin = heap.allocate_thin_string(cons);
        let root = heap.persistent(thin);

        heap.collect_garbage(GcConfig::major());

        let thin = root.get();
        let cons = ThinString::actual(thin);
        assert_eq!(string_length(thin), Some(11));
        assert!(!ConsString::is_flat(cons));
        assert_eq!(SeqString::content(ConsString::first(cons)), b"hello ");
        assert_eq!(SeqString::content(ConsString::second(cons)), b"world");
    }

    #[test]
    fn struct_fields_keep_objects_alive() {
        let mut heap = heap();
        let descriptor = TypeDescriptor::new_struct(
            "Pair",
            3 * WORD_SIZE,
            vec![WORD_SIZE as u32, 2 * WORD_SIZE as u32],
        );

        let pair = heap.allocate_struct(descriptor);
        let _root = heap.persistent(pair);
        let element = heap.allocate_fixed_array(3);
        heap.store(pair, WORD_SIZE, element);

        heap.collect_garbage(GcConfig::major());

        let stored = pair.to_obj().slot(WORD_SIZE).get();
        assert_eq!(stored, element);
        assert_eq!(FixedArray::length(stored), 3);
        assert!(pair.to_obj().slot(2 * WORD_SIZE).get().is_null());
    }

    #[test]
    fn object_statistics_count_allocations() {
        let mut heap = heap();
        let point = TypeDescriptor::new_js_api_object("Point", 1, 2);

        let objects = [
            heap.allocate_js_object(point),
            heap.allocate_fixed_double_array(&[1.5, 2.5]),
            heap.allocate_weak_fixed_array(2),
        ];
        let _roots: Vec<_> = objects.iter().map(|&object| heap.persistent(object)).collect();

        heap.collect_garbage(GcConfig::major());
        let stats = heap.collect_statistics(DetailLevel::Detailed);
        let old = stats
            .space_statistics
            .iter()
            .find(|space| space.name == "old_space")
            .expect("old space");

        assert_eq!(old.object_statistics["Point"].count, 1);
        assert_eq!(old.object_statistics["FixedDoubleArray"].count, 1);
        assert_eq!(old.object_statistics["WeakFixedArray"].count, 1);

        let doubles = objects[1];
        let second = doubles.to_obj().word_at(FixedArray::HEADER_SIZE + WORD_SIZE);
        assert_eq!(f64::from_bits(second as u64), 2.5);
    }

    #[test]
    fn overflowing_array_length_reaches_oom_handler() {
        let mut heap = heap();
        let requested = Rc::new(Cell::new(0));
        let inner = requested.clone();
        heap.set_oom_callback(Box::new(move |error: &HeapError| {
            inner.set(error.requested_size())
        }));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            heap.allocate_fixed_array(usize::MAX / 8);
        }));

        assert!(result.is_err());
        assert_eq!(requested.get(), usize::MAX);
    }

    #[test]
    fn string_length_of_other_layouts() {
        let mut heap = heap();
        let array = heap.allocate_fixed_array(2);
        let string = heap.allocate_seq_string(b"abc");

        assert_eq!(string_length(array), None);
        assert_eq!(string_length(string), Some(3));
    }

    #[test]
    #[should_panic(expected = "type FixedArray cannot be used as string")]
    fn cons_string_of_non_string_is_fatal() {
        let mut heap = heap();
        let array = heap.allocate_fixed_array(1);
        let string = heap.allocate_seq_string(b"x");
        heap.allocate_cons_string(string, array);
    }

    #[test]
    #[should_panic(expected = "type Pair cannot be used as JS object")]
    fn js_object_from_struct_descriptor_is_fatal() {
        let mut heap = heap();
        let descriptor = TypeDescriptor::new_struct("Pair", 3 * WORD_SIZE, vec![WORD_SIZE as u32]);
        heap.allocate_js_object(descriptor);
    }
}
