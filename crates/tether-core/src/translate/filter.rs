//! Which local addresses get translated.

use crate::types::{Address, PointerWidth};

const KERNEL_BASE_32: u64 = 0x8000_0000;
const KERNEL_MASK_64: u64 = 0xff00_0000_0000_0000;

/// Decides whether a pointer refers to caller memory worth translating.
///
/// Null pointers and addresses in the target's privileged range are left
/// alone: they already mean something on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFilter
{
    width: PointerWidth,
}

impl AddressFilter
{
    #[must_use]
    pub const fn new(width: PointerWidth) -> Self
    {
        Self { width }
    }

    /// Whether `address` lies in the privileged half of the address space.
    ///
    /// 32-bit targets: `address >= 0x8000_0000`.
    /// 64-bit targets: any bit set in the top byte.
    #[must_use]
    pub const fn is_privileged(self, address: Address) -> bool
    {
        match self.width {
            PointerWidth::Bits32 => address.value() >= KERNEL_BASE_32,
            PointerWidth::Bits64 => address.value() & KERNEL_MASK_64 != 0,
        }
    }

    /// Whether a pointer should be followed and copied to the target.
    #[must_use]
    pub const fn accepts(self, address: Address) -> bool
    {
        !address.is_null() && !self.is_privileged(address)
    }
}
