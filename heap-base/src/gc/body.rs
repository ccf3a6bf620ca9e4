//! Per-layout size computation and reference iteration.

use crate::gc::object::{
    ConsString, FixedArray, FreeSpace, Header, JsObject, SeqString, ThinString, TypeDescriptor,
    TypeTag, WORD_SIZE,
};
use crate::gc::root::Slot;
use crate::gc::visitor::ObjectVisitor;
use crate::gc::Address;

pub trait BodyDescriptor {
    fn size_of(descriptor: &TypeDescriptor, object: Address) -> usize;

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        descriptor: &TypeDescriptor,
        object: Address,
        size: usize,
        visitor: &mut V,
    );
}

fn visit_pointers<V: ObjectVisitor + ?Sized>(
    visitor: &mut V,
    host: Address,
    start: usize,
    end: usize,
) {
    let mut offset = start;

    while offset < end {
        visitor.visit_pointer(host, Slot::at(host.offset(offset)));
        offset += WORD_SIZE;
    }
}

pub struct FixedArrayBody;

impl BodyDescriptor for FixedArrayBody {
    fn size_of(_descriptor: &TypeDescriptor, object: Address) -> usize {
        FixedArray::size_for(FixedArray::length(object))
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        object: Address,
        size: usize,
        visitor: &mut V,
    ) {
        visit_pointers(visitor, object, FixedArray::HEADER_SIZE, size);
    }
}

pub struct FixedDoubleArrayBody;

impl BodyDescriptor for FixedDoubleArrayBody {
    fn size_of(_descriptor: &TypeDescriptor, object: Address) -> usize {
        FixedArray::size_for(FixedArray::length(object))
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        _object: Address,
        _size: usize,
        _visitor: &mut V,
    ) {
        // raw doubles
    }
}

pub struct WeakFixedArrayBody;

impl BodyDescriptor for WeakFixedArrayBody {
    fn size_of(_descriptor: &TypeDescriptor, object: Address) -> usize {
        FixedArray::size_for(FixedArray::length(object))
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        object: Address,
        size: usize,
        visitor: &mut V,
    ) {
        let mut offset = FixedArray::HEADER_SIZE;

        while offset < size {
            visitor.visit_weak_pointer(object, Slot::at(object.offset(offset)));
            offset += WORD_SIZE;
        }
    }
}

pub struct StructBody;

impl BodyDescriptor for StructBody {
    fn size_of(descriptor: &TypeDescriptor, _object: Address) -> usize {
        descriptor.instance_size
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        descriptor: &TypeDescriptor,
        object: Address,
        _size: usize,
        visitor: &mut V,
    ) {
        for &offset in descriptor.ref_offsets {
            visitor.visit_pointer(object, Slot::at(object.offset(offset as usize)));
        }
    }
}

/// Covers fast JS objects and API objects; only the latter have embedder
/// fields.
pub struct JsObjectBody;

impl BodyDescriptor for JsObjectBody {
    fn size_of(descriptor: &TypeDescriptor, _object: Address) -> usize {
        descriptor.instance_size
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        descriptor: &TypeDescriptor,
        object: Address,
        size: usize,
        visitor: &mut V,
    ) {
        visit_pointers(
            visitor,
            object,
            JsObject::PROPERTIES_OFFSET,
            JsObject::HEADER_SIZE,
        );

        let embedder_end = JsObject::embedder_field_offset(descriptor.embedder_fields);

        for index in 0..descriptor.embedder_fields {
            let offset = JsObject::embedder_field_offset(index);
            visitor.visit_embedder_field(object, Slot::at(object.offset(offset)));
        }

        visit_pointers(visitor, object, embedder_end, size);
    }
}

pub struct SeqStringBody;

impl BodyDescriptor for SeqStringBody {
    fn size_of(_descriptor: &TypeDescriptor, object: Address) -> usize {
        SeqString::size_for(SeqString::length(object))
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        _object: Address,
        _size: usize,
        _visitor: &mut V,
    ) {
    }
}

pub struct ConsStringBody;

impl BodyDescriptor for ConsStringBody {
    fn size_of(_descriptor: &TypeDescriptor, _object: Address) -> usize {
        ConsString::SIZE
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        object: Address,
        _size: usize,
        visitor: &mut V,
    ) {
        visit_pointers(
            visitor,
            object,
            ConsString::FIRST_OFFSET,
            ConsString::SIZE,
        );
    }
}

pub struct ThinStringBody;

impl BodyDescriptor for ThinStringBody {
    fn size_of(_descriptor: &TypeDescriptor, _object: Address) -> usize {
        ThinString::SIZE
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        object: Address,
        _size: usize,
        visitor: &mut V,
    ) {
        visitor.visit_pointer(
            object,
            Slot::at(object.offset(ThinString::ACTUAL_OFFSET)),
        );
    }
}

pub struct FillerBody;

impl BodyDescriptor for FillerBody {
    fn size_of(_descriptor: &TypeDescriptor, _object: Address) -> usize {
        Header::size()
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        _object: Address,
        _size: usize,
        _visitor: &mut V,
    ) {
    }
}

pub struct FreeSpaceBody;

impl BodyDescriptor for FreeSpaceBody {
    fn size_of(_descriptor: &TypeDescriptor, object: Address) -> usize {
        FreeSpace::size(object)
    }

    fn iterate_body<V: ObjectVisitor + ?Sized>(
        _descriptor: &TypeDescriptor,
        _object: Address,
        _size: usize,
        _visitor: &mut V,
    ) {
    }
}

pub fn object_size(descriptor: &TypeDescriptor, object: Address) -> usize {
    match descriptor.tag {
        TypeTag::FixedArray => FixedArrayBody::size_of(descriptor, object),
        TypeTag::FixedDoubleArray => FixedDoubleArrayBody::size_of(descriptor, object),
        TypeTag::WeakFixedArray => WeakFixedArrayBody::size_of(descriptor, object),
        TypeTag::Struct => StructBody::size_of(descriptor, object),
        TypeTag::JsObjectFast | TypeTag::JsApiObject => JsObjectBody::size_of(descriptor, object),
        TypeTag::SeqString => SeqStringBody::size_of(descriptor, object),
        TypeTag::ConsString => ConsStringBody::size_of(descriptor, object),
        TypeTag::ThinString => ThinStringBody::size_of(descriptor, object),
        TypeTag::Filler => FillerBody::size_of(descriptor, object),
        TypeTag::FreeSpace => FreeSpaceBody::size_of(descriptor, object),
    }
}
