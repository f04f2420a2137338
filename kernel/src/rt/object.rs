//! Object headers, field storage, boxing and nullable boxing.
//!
//! Every heap object begins with one word: the pointer to its type
//! descriptor. Fields follow as pointer-width slots, so every field is
//! aligned to the platform pointer width. Boxing a value type copies the
//! value payload into a fresh object whose header names the value type;
//! unboxing demands the exact same type and treats a mismatch as a fatal
//! invariant violation (raised as a managed cast exception by callers).
//!
//! The core runs without a collector: objects live until shutdown, like
//! every other runtime structure here.

use core::ptr::NonNull;

use alloc::alloc::{alloc_zeroed, Layout};

use crate::jit::il::{Value, ValueKind};
use crate::rt::types::{self, TypeDescriptor, TypeId};

/// Header word at offset 0 of every managed object.
#[repr(C)]
struct ObjectHeader {
    ty: &'static TypeDescriptor,
}

const HEADER_SIZE: usize = core::mem::size_of::<ObjectHeader>();
const SLOT_SIZE: usize = core::mem::size_of::<u64>();

/// Reference to a managed object (its header address).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ObjRef(NonNull<u8>);

// SAFETY: managed objects are immortal and field access is word-sized;
// cross-thread visibility follows the runtime's own synchronization.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// Allocate a zeroed instance of `ty`.
    pub fn allocate(ty: &'static TypeDescriptor) -> Self {
        let size = HEADER_SIZE + ty.instance_size;
        let layout = Layout::from_size_align(size.max(HEADER_SIZE), SLOT_SIZE)
            .expect("object layout");
        // SAFETY: non-zero size, valid alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("managed heap exhausted");
        // SAFETY: freshly allocated, correctly sized for the header.
        unsafe {
            (raw as *mut ObjectHeader).write(ObjectHeader { ty });
        }
        Self(ptr)
    }

    /// The descriptor named by this object's header.
    pub fn type_of(&self) -> &'static TypeDescriptor {
        // SAFETY: constructed only by `allocate`, which writes the header.
        unsafe { (*(self.0.as_ptr() as *const ObjectHeader)).ty }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Rebuild a reference from a raw header pointer.
    ///
    /// # Safety
    /// `ptr` must originate from [`ObjRef::as_ptr`].
    pub unsafe fn from_ptr(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    fn slot_ptr(&self, index: usize) -> *mut u64 {
        debug_assert!(index < self.type_of().fields.len(), "field out of range");
        // SAFETY: the allocation covers header + instance_size.
        unsafe { self.0.as_ptr().add(HEADER_SIZE + index * SLOT_SIZE) as *mut u64 }
    }

    /// Raw 64-bit read of field `index`.
    pub fn raw_field(&self, index: usize) -> u64 {
        // SAFETY: slot_ptr bounds-checked against the descriptor.
        unsafe { self.slot_ptr(index).read() }
    }

    /// Raw 64-bit write of field `index`.
    pub fn set_raw_field(&self, index: usize, raw: u64) {
        // SAFETY: slot_ptr bounds-checked against the descriptor.
        unsafe { self.slot_ptr(index).write(raw) }
    }

    /// Typed read of field `index`, decoded by the declared field kind.
    pub fn field(&self, index: usize) -> Value {
        let kind = self.type_of().fields[index].kind;
        decode(kind, self.raw_field(index))
    }

    /// Typed write of field `index`.
    pub fn set_field(&self, index: usize, value: Value) {
        self.set_raw_field(index, encode(value));
    }
}

/// Encode a value into its 64-bit field representation.
pub fn encode(value: Value) -> u64 {
    match value {
        Value::I32(v) => v as i64 as u64,
        Value::I64(v) => v as u64,
        Value::F64(v) => v.to_bits(),
        Value::Ref(obj) => obj.as_ptr() as u64,
        Value::Null => 0,
        Value::Fn(m) => m.0 as u64,
    }
}

/// Decode a 64-bit field representation under a declared kind.
pub fn decode(kind: ValueKind, raw: u64) -> Value {
    match kind {
        ValueKind::I32 => Value::I32(raw as i64 as i32),
        ValueKind::I64 => Value::I64(raw as i64),
        ValueKind::F64 => Value::F64(f64::from_bits(raw)),
        ValueKind::Ref => {
            if raw == 0 {
                Value::Null
            } else {
                // SAFETY: non-zero Ref slots only ever hold header
                // pointers produced by `encode`.
                Value::Ref(unsafe { ObjRef::from_ptr(raw as *mut u8).unwrap() })
            }
        }
    }
}

/// Box a single-slot value under the given value-type descriptor: header
/// plus a copy of the value immediately after it.
pub fn box_value(ty: TypeId, value: Value) -> ObjRef {
    let desc = types::get(ty);
    debug_assert_eq!(desc.fields.len(), 1, "boxed payload is one slot");
    let obj = ObjRef::allocate(desc);
    obj.set_raw_field(0, encode(value));
    obj
}

/// Unbox: the header must name exactly the requested value type.
pub fn unbox(obj: ObjRef, expected: TypeId) -> Result<Value, &'static TypeDescriptor> {
    let actual = obj.type_of();
    if actual.id != expected {
        return Err(actual);
    }
    Ok(obj.field(0))
}

/// Nullable boxing: no value boxes to a null reference, a present value
/// boxes to the plain boxed underlying value.
pub fn box_nullable(ty: TypeId, has_value: bool, value: Value) -> Value {
    if has_value {
        Value::Ref(box_value(ty, value))
    } else {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::builtins;

    #[test]
    fn box_then_unbox_is_identity() {
        builtins::ensure();
        let boxed = box_value(builtins::int32(), Value::I32(-7));
        assert_eq!(boxed.type_of().id, builtins::int32());
        assert_eq!(unbox(boxed, builtins::int32()), Ok(Value::I32(-7)));
    }

    #[test]
    fn unbox_mismatch_reports_actual_type() {
        builtins::ensure();
        let boxed = box_value(builtins::int32(), Value::I32(1));
        let err = unbox(boxed, builtins::int64()).unwrap_err();
        assert_eq!(err.id, builtins::int32());
    }

    #[test]
    fn nullable_box_follows_has_value() {
        builtins::ensure();
        assert_eq!(
            box_nullable(builtins::int32(), false, Value::I32(9)),
            Value::Null
        );
        match box_nullable(builtins::int32(), true, Value::I32(9)) {
            Value::Ref(obj) => assert_eq!(unbox(obj, builtins::int32()), Ok(Value::I32(9))),
            other => panic!("expected boxed value, got {:?}", other),
        }
    }

    #[test]
    fn field_encoding_round_trips() {
        assert_eq!(decode(ValueKind::I32, encode(Value::I32(-5))), Value::I32(-5));
        assert_eq!(
            decode(ValueKind::F64, encode(Value::F64(2.5))),
            Value::F64(2.5)
        );
        assert_eq!(decode(ValueKind::Ref, 0), Value::Null);
    }
}
