//! Addresses, local or remote.

use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// A 64-bit address.
///
/// The same type names an object in a client-side [`LocalMemory`] arena and a
/// region in the target, so translated arguments can carry either. Narrower
/// targets still store the full `u64`; whether it fits is checked when the
/// address is written at the target's pointer width.
///
/// ```rust
/// use tether_core::types::Address;
///
/// let unicode_string = Address::new(0x1_0000);
/// let buffer_field = unicode_string + 8;
/// assert_eq!(buffer_field.to_string(), "0x0000000000010008");
/// ```
///
/// [`LocalMemory`]: crate::translate::LocalMemory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(u64);

impl Address
{
    /// `NULL`
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self
    {
        Self(raw)
    }

    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// `self + offset`, or `None` past the top of the address space.
    #[must_use]
    pub const fn checked_add(self, offset: u64) -> Option<Self>
    {
        match self.0.checked_add(offset) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl From<u64> for Address
{
    fn from(raw: u64) -> Self
    {
        Self(raw)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.value()
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:#018x}", self.0)
    }
}

/// Wraps on overflow.
impl Add<u64> for Address
{
    type Output = Self;

    fn add(self, offset: u64) -> Self
    {
        Self(self.0.wrapping_add(offset))
    }
}
