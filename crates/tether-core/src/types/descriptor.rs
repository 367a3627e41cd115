//! Structural type descriptors.
//!
//! A [`TypeDescriptor`] is the explicit IR every marshalling step pattern
//! matches over: reachability, native-type derivation and value encoding.
//! Nested descriptors are shared through [`TypeRef`] so that "unchanged"
//! can be observed as pointer identity with [`Arc::ptr_eq`].

use std::fmt;
use std::sync::Arc;

use super::ffi::{FfiType, PointerWidth};

/// Shared handle to an immutable descriptor.
pub type TypeRef = Arc<TypeDescriptor>;

/// Shape of a value, independent of where it lives.
///
/// Equality is structural: two records with the same name, fields and
/// packing are equal even if they were built separately.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor
{
    /// A primitive machine value
    Scalar(FfiType),
    /// A pointer to a value of the target type
    ///
    /// A target of `Scalar(Void)` is an opaque pointer whose pointee type is
    /// taken from the object it points at.
    Pointer(TypeRef),
    /// A C struct
    Record(Record),
    /// A fixed-length C array
    Array
    {
        element: TypeRef,
        len: usize,
    },
}

/// A C struct: ordered named fields with optional packing.
#[derive(Debug, Clone, PartialEq)]
pub struct Record
{
    pub name: String,
    pub fields: Vec<Field>,
    /// Maximum field alignment, like `#pragma pack(n)`
    pub packing: Option<u32>,
}

/// One named field of a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field
{
    pub name: String,
    pub ty: TypeRef,
}

/// Field offsets and overall size of a record on a given target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout
{
    pub offsets: Vec<usize>,
    pub size: usize,
    pub alignment: usize,
}

impl TypeDescriptor
{
    #[must_use]
    pub fn scalar(ty: FfiType) -> TypeRef
    {
        Arc::new(TypeDescriptor::Scalar(ty))
    }

    #[must_use]
    pub fn pointer(target: TypeRef) -> TypeRef
    {
        Arc::new(TypeDescriptor::Pointer(target))
    }

    /// `void*`
    #[must_use]
    pub fn opaque_pointer() -> TypeRef
    {
        Self::pointer(Self::scalar(FfiType::Void))
    }

    #[must_use]
    pub fn array(element: TypeRef, len: usize) -> TypeRef
    {
        Arc::new(TypeDescriptor::Array { element, len })
    }

    /// `uint8_t[len]`, the shape recorded for byte-buffer arguments.
    #[must_use]
    pub fn bytes(len: usize) -> TypeRef
    {
        Self::array(Self::scalar(FfiType::UInt8), len)
    }

    /// A naturally aligned record.
    pub fn record<N, I, S>(name: N, fields: I) -> TypeRef
    where
        N: Into<String>,
        I: IntoIterator<Item = (S, TypeRef)>,
        S: Into<String>,
    {
        Arc::new(TypeDescriptor::Record(Record::new(name, fields, None)))
    }

    /// A record with an explicit packing.
    pub fn packed_record<N, I, S>(name: N, fields: I, packing: u32) -> TypeRef
    where
        N: Into<String>,
        I: IntoIterator<Item = (S, TypeRef)>,
        S: Into<String>,
    {
        Arc::new(TypeDescriptor::Record(Record::new(name, fields, Some(packing))))
    }

    /// Whether this is `void*`.
    #[must_use]
    pub fn is_opaque_pointer(&self) -> bool
    {
        matches!(self, TypeDescriptor::Pointer(target) if **target == TypeDescriptor::Scalar(FfiType::Void))
    }

    /// Size in bytes on a target of the given pointer width.
    #[must_use]
    pub fn size(&self, width: PointerWidth) -> usize
    {
        match self {
            TypeDescriptor::Scalar(ty) => ty.size(width),
            TypeDescriptor::Pointer(_) => width.bytes(),
            TypeDescriptor::Record(record) => record.layout(width).size,
            TypeDescriptor::Array { element, len } => element.size(width) * len,
        }
    }

    /// Natural alignment on a target of the given pointer width.
    #[must_use]
    pub fn alignment(&self, width: PointerWidth) -> usize
    {
        match self {
            TypeDescriptor::Scalar(ty) => ty.size(width).max(1),
            TypeDescriptor::Pointer(_) => width.bytes(),
            TypeDescriptor::Record(record) => record.layout(width).alignment,
            TypeDescriptor::Array { element, .. } => element.alignment(width),
        }
    }
}

impl Record
{
    pub fn new<N, I, S>(name: N, fields: I, packing: Option<u32>) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (S, TypeRef)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(name, ty)| Field { name: name.into(), ty })
                .collect(),
            packing,
        }
    }

    /// Compute C layout: each field aligned to `min(natural, packing)`,
    /// total size rounded up to the record's alignment.
    #[must_use]
    pub fn layout(&self, width: PointerWidth) -> RecordLayout
    {
        let cap = self.packing.map(|pack| (pack as usize).max(1));
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut offset = 0;
        let mut alignment = 1;

        for field in &self.fields {
            let natural = field.ty.alignment(width);
            let align = cap.map_or(natural, |cap| natural.min(cap));
            offset = round_up(offset, align);
            offsets.push(offset);
            offset += field.ty.size(width);
            alignment = alignment.max(align);
        }

        RecordLayout {
            offsets,
            size: round_up(offset, alignment),
            alignment,
        }
    }
}

fn round_up(value: usize, align: usize) -> usize
{
    value.div_ceil(align) * align
}

impl fmt::Display for TypeDescriptor
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            TypeDescriptor::Scalar(ty) => write!(f, "{ty}"),
            TypeDescriptor::Pointer(target) => write!(f, "{target}*"),
            TypeDescriptor::Record(record) => write!(f, "struct {}", record.name),
            TypeDescriptor::Array { element, len } => write!(f, "{element}[{len}]"),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn unicode_string() -> TypeRef
    {
        TypeDescriptor::record(
            "UNICODE_STRING",
            [
                ("Length", TypeDescriptor::scalar(FfiType::UShort)),
                ("MaximumLength", TypeDescriptor::scalar(FfiType::UShort)),
                ("Buffer", TypeDescriptor::pointer(TypeDescriptor::scalar(FfiType::UInt16))),
            ],
        )
    }

    #[test]
    fn test_record_layout_pads_pointer_field()
    {
        let TypeDescriptor::Record(record) = &*unicode_string() else {
            unreachable!()
        };

        let wide = record.layout(PointerWidth::Bits64);
        assert_eq!(wide.offsets, vec![0, 2, 8]);
        assert_eq!(wide.size, 16);

        let narrow = record.layout(PointerWidth::Bits32);
        assert_eq!(narrow.offsets, vec![0, 2, 4]);
        assert_eq!(narrow.size, 8);
    }

    #[test]
    fn test_packing_caps_alignment()
    {
        let packed = TypeDescriptor::packed_record(
            "PACKED",
            [
                ("tag", TypeDescriptor::scalar(FfiType::UInt8)),
                ("value", TypeDescriptor::scalar(FfiType::UInt64)),
            ],
            1,
        );
        assert_eq!(packed.size(PointerWidth::Bits64), 9);
        assert_eq!(packed.alignment(PointerWidth::Bits64), 1);
    }

    #[test]
    fn test_array_size()
    {
        assert_eq!(TypeDescriptor::bytes(4).size(PointerWidth::Bits64), 4);
        let words = TypeDescriptor::array(TypeDescriptor::scalar(FfiType::UInt16), 3);
        assert_eq!(words.size(PointerWidth::Bits32), 6);
        assert_eq!(words.alignment(PointerWidth::Bits32), 2);
    }

    #[test]
    fn test_structural_equality()
    {
        assert_eq!(unicode_string(), unicode_string());
        assert!(TypeDescriptor::opaque_pointer().is_opaque_pointer());
        assert!(!TypeDescriptor::pointer(unicode_string()).is_opaque_pointer());
    }
}
