use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{fatal, FatalError};
use crate::gc::body;
use crate::gc::root::Slot;
use crate::gc::Address;
use crate::mem;

const DESCRIPTOR_MAGIC: u32 = 0x7e5c_d1a7;

const FWDPTR_BIT: usize = 1;
const MARK_BIT: usize = 2;
const HEADER_TAG_MASK: usize = FWDPTR_BIT | MARK_BIT;

pub const WORD_SIZE: usize = mem::ptr_width_usize();
pub const FREE_SPACE_MIN_SIZE: usize = 2 * WORD_SIZE;

/// Layout class of an object. Every descriptor has exactly one tag and the
/// visitor dispatches on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    FixedArray,
    FixedDoubleArray,
    WeakFixedArray,
    Struct,
    JsObjectFast,
    JsApiObject,
    SeqString,
    ConsString,
    ThinString,
    Filler,
    FreeSpace,
}

impl TypeTag {
    pub const ALL: [TypeTag; 11] = [
        TypeTag::FixedArray,
        TypeTag::FixedDoubleArray,
        TypeTag::WeakFixedArray,
        TypeTag::Struct,
        TypeTag::JsObjectFast,
        TypeTag::JsApiObject,
        TypeTag::SeqString,
        TypeTag::ConsString,
        TypeTag::ThinString,
        TypeTag::Filler,
        TypeTag::FreeSpace,
    ];

    pub fn is_filler_or_free_space(self) -> bool {
        matches!(self, TypeTag::Filler | TypeTag::FreeSpace)
    }
}

/// Immutable shape of an object. Descriptors live for the whole process, the
/// object header points directly at them.
#[derive(Debug)]
pub struct TypeDescriptor {
    magic: u32,
    pub tag: TypeTag,
    pub name: &'static str,
    /// Object size for fixed-size layouts, 0 for variable-sized ones.
    pub instance_size: usize,
    /// Byte offsets of strong references, only used for structs.
    pub ref_offsets: &'static [u32],
    pub embedder_fields: usize,
    pub in_object_fields: usize,
}

fn js_object_instance_size(embedder_fields: usize, in_object_fields: usize) -> usize {
    JsObject::checked_size_for(embedder_fields, in_object_fields)
        .unwrap_or_else(|| fatal(FatalError::OutOfMemory { requested: usize::MAX }))
}

impl TypeDescriptor {
    const fn builtin(tag: TypeTag, name: &'static str, instance_size: usize) -> TypeDescriptor {
        TypeDescriptor {
            magic: DESCRIPTOR_MAGIC,
            tag,
            name,
            instance_size,
            ref_offsets: &[],
            embedder_fields: 0,
            in_object_fields: 0,
        }
    }

    /// Creates a struct shape. Reference offsets must be word aligned and
    /// point behind the header.
    pub fn new_struct(
        name: &'static str,
        instance_size: usize,
        ref_offsets: Vec<u32>,
    ) -> &'static TypeDescriptor {
        assert!(instance_size >= Header::size());
        assert!(mem::is_aligned(instance_size, WORD_SIZE));

        for &offset in &ref_offsets {
            let offset = offset as usize;
            assert!(offset >= Header::size() && offset + WORD_SIZE <= instance_size);
            assert!(mem::is_aligned(offset, WORD_SIZE));
        }

        Box::leak(Box::new(TypeDescriptor {
            magic: DESCRIPTOR_MAGIC,
            tag: TypeTag::Struct,
            name,
            instance_size,
            ref_offsets: ref_offsets.leak(),
            embedder_fields: 0,
            in_object_fields: 0,
        }))
    }

    pub fn new_js_object(name: &'static str, in_object_fields: usize) -> &'static TypeDescriptor {
        Box::leak(Box::new(TypeDescriptor {
            magic: DESCRIPTOR_MAGIC,
            tag: TypeTag::JsObjectFast,
            name,
            instance_size: js_object_instance_size(0, in_object_fields),
            ref_offsets: &[],
            embedder_fields: 0,
            in_object_fields,
        }))
    }

    pub fn new_js_api_object(
        name: &'static str,
        embedder_fields: usize,
        in_object_fields: usize,
    ) -> &'static TypeDescriptor {
        Box::leak(Box::new(TypeDescriptor {
            magic: DESCRIPTOR_MAGIC,
            tag: TypeTag::JsApiObject,
            name,
            instance_size: js_object_instance_size(embedder_fields, in_object_fields),
            ref_offsets: &[],
            embedder_fields,
            in_object_fields,
        }))
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.magic == DESCRIPTOR_MAGIC
    }

    pub fn address(&'static self) -> Address {
        Address::from_ptr(self as *const TypeDescriptor)
    }
}

pub static FIXED_ARRAY_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::FixedArray, "FixedArray", 0);
pub static FIXED_DOUBLE_ARRAY_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::FixedDoubleArray, "FixedDoubleArray", 0);
pub static WEAK_FIXED_ARRAY_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::WeakFixedArray, "WeakFixedArray", 0);
pub static SEQ_STRING_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::SeqString, "SeqString", 0);
pub static CONS_STRING_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::ConsString, "ConsString", ConsString::SIZE);
pub static THIN_STRING_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::ThinString, "ThinString", ThinString::SIZE);
pub static FILLER_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::Filler, "Filler", Header::size());
pub static FREE_SPACE_TYPE: TypeDescriptor =
    TypeDescriptor::builtin(TypeTag::FreeSpace, "FreeSpace", 0);

/// Header word: descriptor address with the mark bit, or a forwarding
/// address with the forwarding bit.
#[repr(C)]
pub struct Header {
    word: AtomicUsize,
}

impl Header {
    #[inline(always)]
    pub const fn size() -> usize {
        WORD_SIZE
    }

    pub fn setup(&self, descriptor: &'static TypeDescriptor, marked: bool) {
        let mut word = descriptor.address().to_usize();
        debug_assert_eq!(word & HEADER_TAG_MASK, 0);

        if marked {
            word |= MARK_BIT;
        }

        self.word.store(word, Ordering::Release);
    }

    #[inline(always)]
    pub fn raw(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn descriptor_address(&self) -> Address {
        (self.raw() & !HEADER_TAG_MASK).into()
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        (self.raw() & MARK_BIT) != 0
    }

    /// Sets the mark bit, returns true for the thread that changed it.
    #[inline(always)]
    pub fn try_mark(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);

        loop {
            if (current & MARK_BIT) != 0 {
                return false;
            }

            debug_assert_eq!(current & FWDPTR_BIT, 0);

            match self.word.compare_exchange_weak(
                current,
                current | MARK_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline(always)]
    pub fn mark(&self) {
        self.word.fetch_or(MARK_BIT, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn clear_mark(&self) {
        self.word.fetch_and(!MARK_BIT, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        (self.raw() & FWDPTR_BIT) != 0
    }

    pub fn forwarding_address(&self) -> Option<Address> {
        let raw = self.raw();

        if (raw & FWDPTR_BIT) != 0 {
            Some((raw & !FWDPTR_BIT).into())
        } else {
            None
        }
    }

    pub fn install_forwarding_address(&self, target: Address) {
        debug_assert!(mem::is_aligned(target.to_usize(), WORD_SIZE));
        self.word
            .store(target.to_usize() | FWDPTR_BIT, Ordering::Release);
    }
}

#[repr(C)]
pub struct Obj {
    header: Header,
    data: u8,
}

impl Obj {
    #[inline(always)]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        Address::from_ptr(self as *const _)
    }

    /// Type descriptor of a non-forwarded object. Anything else is a broken
    /// heap.
    #[inline(always)]
    pub fn descriptor(&self) -> &'static TypeDescriptor {
        let raw = self.header.raw();

        if (raw & FWDPTR_BIT) != 0 {
            fatal(FatalError::UnknownTypeDescriptor {
                object: self.address(),
            });
        }

        let descriptor = raw & !HEADER_TAG_MASK;

        if descriptor == 0 {
            fatal(FatalError::UnknownTypeDescriptor {
                object: self.address(),
            });
        }

        let descriptor = unsafe { &*(descriptor as *const TypeDescriptor) };

        if !descriptor.is_valid() {
            fatal(FatalError::UnknownTypeDescriptor {
                object: self.address(),
            });
        }

        descriptor
    }

    pub fn size(&self) -> usize {
        body::object_size(self.descriptor(), self.address())
    }

    pub fn is_filler(&self) -> bool {
        self.descriptor().tag == TypeTag::Filler
    }

    pub fn is_free_space(&self) -> bool {
        self.descriptor().tag == TypeTag::FreeSpace
    }

    pub fn is_filler_or_free_space(&self) -> bool {
        self.descriptor().tag.is_filler_or_free_space()
    }

    #[inline(always)]
    pub fn word_at(&self, offset: usize) -> usize {
        unsafe { *self.address().offset(offset).to_ptr::<usize>() }
    }

    #[inline(always)]
    pub fn set_word_at(&self, offset: usize, value: usize) {
        unsafe {
            *self.address().offset(offset).to_mut_ptr::<usize>() = value;
        }
    }

    #[inline(always)]
    pub fn slot(&self, offset: usize) -> Slot {
        Slot::at(self.address().offset(offset))
    }
}

/// header, length, elements. Shared by fixed arrays, double arrays and weak
/// arrays.
pub struct FixedArray;

impl FixedArray {
    pub const LENGTH_OFFSET: usize = WORD_SIZE;
    pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

    /// Size of an existing array. New lengths go through `checked_size_for`.
    pub const fn size_for(length: usize) -> usize {
        FixedArray::HEADER_SIZE + length * WORD_SIZE
    }

    pub fn checked_size_for(length: usize) -> Option<usize> {
        length
            .checked_mul(WORD_SIZE)?
            .checked_add(FixedArray::HEADER_SIZE)
    }

    pub fn length(object: Address) -> usize {
        object.to_obj().word_at(FixedArray::LENGTH_OFFSET)
    }

    pub fn initialize(object: Address, length: usize) {
        let obj = object.to_obj();
        obj.set_word_at(FixedArray::LENGTH_OFFSET, length);
        mem::fill_bytes(
            object.offset(FixedArray::HEADER_SIZE),
            length * WORD_SIZE,
            0,
        );
    }

    pub fn element_slot(object: Address, index: usize) -> Slot {
        debug_assert!(index < FixedArray::length(object));
        Slot::at(object.offset(FixedArray::HEADER_SIZE + index * WORD_SIZE))
    }

    pub fn get(object: Address, index: usize) -> Address {
        FixedArray::element_slot(object, index).get()
    }
}

/// header, properties, elements, embedder fields, in-object fields
pub struct JsObject;

impl JsObject {
    pub const PROPERTIES_OFFSET: usize = WORD_SIZE;
    pub const ELEMENTS_OFFSET: usize = 2 * WORD_SIZE;
    pub const HEADER_SIZE: usize = 3 * WORD_SIZE;

    pub const fn size_for(embedder_fields: usize, in_object_fields: usize) -> usize {
        JsObject::HEADER_SIZE + (embedder_fields + in_object_fields) * WORD_SIZE
    }

    pub fn checked_size_for(embedder_fields: usize, in_object_fields: usize) -> Option<usize> {
        embedder_fields
            .checked_add(in_object_fields)?
            .checked_mul(WORD_SIZE)?
            .checked_add(JsObject::HEADER_SIZE)
    }

    pub fn embedder_field_offset(index: usize) -> usize {
        JsObject::HEADER_SIZE + index * WORD_SIZE
    }

    pub fn in_object_field_offset(descriptor: &TypeDescriptor, index: usize) -> usize {
        debug_assert!(index < descriptor.in_object_fields);
        JsObject::HEADER_SIZE + (descriptor.embedder_fields + index) * WORD_SIZE
    }
}

/// header, length, bytes
pub struct SeqString;

impl SeqString {
    pub const LENGTH_OFFSET: usize = WORD_SIZE;
    pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

    pub fn size_for(length: usize) -> usize {
        mem::align_usize_up(SeqString::HEADER_SIZE + length, WORD_SIZE)
    }

    pub fn checked_size_for(length: usize) -> Option<usize> {
        let unaligned = SeqString::HEADER_SIZE.checked_add(length)?;
        mem::checked_align_usize_up(unaligned, WORD_SIZE)
    }

    pub fn length(object: Address) -> usize {
        object.to_obj().word_at(SeqString::LENGTH_OFFSET)
    }

    pub fn initialize(object: Address, content: &[u8]) {
        object
            .to_obj()
            .set_word_at(SeqString::LENGTH_OFFSET, content.len());
        let size = SeqString::size_for(content.len());
        let data = object.offset(SeqString::HEADER_SIZE);
        mem::fill_bytes(data, size - SeqString::HEADER_SIZE, 0);

        unsafe {
            std::ptr::copy_nonoverlapping(content.as_ptr(), data.to_mut_ptr::<u8>(), content.len());
        }
    }

    pub fn content(object: Address) -> &'static [u8] {
        let length = SeqString::length(object);
        let data = object.offset(SeqString::HEADER_SIZE);
        unsafe { std::slice::from_raw_parts(data.to_ptr::<u8>(), length) }
    }
}

/// header, length, first, second
pub struct ConsString;

impl ConsString {
    pub const LENGTH_OFFSET: usize = WORD_SIZE;
    pub const FIRST_OFFSET: usize = 2 * WORD_SIZE;
    pub const SECOND_OFFSET: usize = 3 * WORD_SIZE;
    pub const SIZE: usize = 4 * WORD_SIZE;

    pub fn first(object: Address) -> Address {
        object.to_obj().slot(ConsString::FIRST_OFFSET).get()
    }

    pub fn second(object: Address) -> Address {
        object.to_obj().slot(ConsString::SECOND_OFFSET).get()
    }

    /// A cons string whose second part is the empty string can be replaced by
    /// its first part.
    pub fn is_flat(object: Address) -> bool {
        let second = ConsString::second(object);

        second.is_non_null()
            && second.to_obj().descriptor().tag == TypeTag::SeqString
            && SeqString::length(second) == 0
    }
}

/// header, actual
pub struct ThinString;

impl ThinString {
    pub const ACTUAL_OFFSET: usize = WORD_SIZE;
    pub const SIZE: usize = 2 * WORD_SIZE;

    pub fn actual(object: Address) -> Address {
        object.to_obj().slot(ThinString::ACTUAL_OFFSET).get()
    }
}

/// header, size
pub struct FreeSpace;

impl FreeSpace {
    pub const SIZE_OFFSET: usize = WORD_SIZE;

    pub fn set_size(object: Address, size: usize) {
        debug_assert!(size >= FREE_SPACE_MIN_SIZE);
        object.to_obj().set_word_at(FreeSpace::SIZE_OFFSET, size);
    }

    pub fn size(object: Address) -> usize {
        object.to_obj().word_at(FreeSpace::SIZE_OFFSET)
    }
}
