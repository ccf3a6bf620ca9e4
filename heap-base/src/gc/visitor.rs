//! Type-tag dispatch over object bodies.

use crate::error::{fatal, FatalError};
use crate::gc::body::{
    self, BodyDescriptor, ConsStringBody, FillerBody, FixedArrayBody, FixedDoubleArrayBody,
    FreeSpaceBody, JsObjectBody, SeqStringBody, StructBody, ThinStringBody, WeakFixedArrayBody,
};
use crate::gc::object::{TypeDescriptor, TypeTag};
use crate::gc::root::Slot;
use crate::gc::Address;

/// Callbacks for the references of a single object.
pub trait ObjectVisitor {
    fn visit_pointer(&mut self, host: Address, slot: Slot);

    fn visit_weak_pointer(&mut self, host: Address, slot: Slot) {
        self.visit_pointer(host, slot);
    }

    /// Embedder fields hold values owned by the embedder, they are never
    /// traced.
    fn visit_embedder_field(&mut self, _host: Address, _slot: Slot) {}

    fn visit_map_pointer(&mut self, _host: Address, _descriptor: &'static TypeDescriptor) {}
}

/// Visitor over whole objects. `visit` returns the number of bytes the
/// object occupies.
pub trait HeapVisitor: ObjectVisitor + Sized {
    /// The caller always knows the object size and uses
    /// `visit_with_known_size`.
    const USE_PRECOMPUTED_OBJECT_SIZE: bool = false;
    const CAN_ENCOUNTER_FILLER_OR_FREE_SPACE: bool = true;
    const SHOULD_VISIT_MAP_POINTER: bool = true;

    fn visit(&mut self, object: Address) -> usize {
        if Self::USE_PRECOMPUTED_OBJECT_SIZE {
            fatal(FatalError::WrongVisitOverload { object });
        }

        let descriptor = object.to_obj().descriptor();
        dispatch(self, descriptor, object, None)
    }

    fn visit_with_known_size(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        debug_assert_eq!(size, body::object_size(descriptor, object));
        dispatch(self, descriptor, object, Some(size))
    }

    fn visit_fixed_array(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        FixedArrayBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_fixed_double_array(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        FixedDoubleArrayBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_weak_fixed_array(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        WeakFixedArrayBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_struct(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        StructBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_js_object_fast(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        JsObjectBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_js_api_object(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        JsObjectBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_seq_string(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        SeqStringBody::iterate_body(descriptor, object, size, self);
        size
    }

    /// Entry for objects that may be replaced by one of their fields, see
    /// `ConsString::is_flat`.
    fn visit_shortcut_candidate(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        self.visit_cons_string(descriptor, object, size)
    }

    fn visit_cons_string(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        ConsStringBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_thin_string(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        ThinStringBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_filler(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        FillerBody::iterate_body(descriptor, object, size, self);
        size
    }

    fn visit_free_space(
        &mut self,
        descriptor: &'static TypeDescriptor,
        object: Address,
        size: usize,
    ) -> usize {
        FreeSpaceBody::iterate_body(descriptor, object, size, self);
        size
    }
}

fn dispatch<V: HeapVisitor>(
    visitor: &mut V,
    descriptor: &'static TypeDescriptor,
    object: Address,
    size: Option<usize>,
) -> usize {
    let tag = descriptor.tag;

    if !V::CAN_ENCOUNTER_FILLER_OR_FREE_SPACE && tag.is_filler_or_free_space() {
        fatal(FatalError::UnexpectedFillerOrFreeSpace { object });
    }

    let size = match size {
        Some(size) => size,
        None => body::object_size(descriptor, object),
    };

    if V::SHOULD_VISIT_MAP_POINTER {
        visitor.visit_map_pointer(object, descriptor);
    }

    match tag {
        TypeTag::FixedArray => visitor.visit_fixed_array(descriptor, object, size),
        TypeTag::FixedDoubleArray => visitor.visit_fixed_double_array(descriptor, object, size),
        TypeTag::WeakFixedArray => visitor.visit_weak_fixed_array(descriptor, object, size),
        TypeTag::Struct => visitor.visit_struct(descriptor, object, size),
        TypeTag::JsObjectFast => visitor.visit_js_object_fast(descriptor, object, size),
        TypeTag::JsApiObject => visitor.visit_js_api_object(descriptor, object, size),
        TypeTag::SeqString => visitor.visit_seq_string(descriptor, object, size),
        TypeTag::ConsString => visitor.visit_shortcut_candidate(descriptor, object, size),
        TypeTag::ThinString => visitor.visit_thin_string(descriptor, object, size),
        TypeTag::Filler => visitor.visit_filler(descriptor, object, size),
        TypeTag::FreeSpace => visitor.visit_free_space(descriptor, object, size),
    }
}
