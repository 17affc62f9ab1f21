//! Virtual address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed virtual address in a target process
///
/// Image bases, thread start addresses and exception addresses all travel
/// through debug events as `Address` so they can't be confused with sizes,
/// offsets or symbol counts.
///
/// ## Example
///
/// ```rust
/// use debugport_core::types::Address;
///
/// let base = Address::from(0x40_0000);
/// let entry = base + 0x1200;
/// assert_eq!(entry.value(), 0x40_1200);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// This is equivalent to `Address::from(value)` but can be used in const contexts.
    ///
    /// ```rust
    /// use debugport_core::types::Address;
    ///
    /// const IMAGE_BASE: Address = Address::new(0x1_4000_0000);
    /// assert_eq!(IMAGE_BASE.value(), 0x1_4000_0000);
    /// ```
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// Used to turn an image-relative entry point into an absolute address.
    ///
    /// ```rust
    /// use debugport_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_display_is_zero_padded_hex()
    {
        assert_eq!(Address::from(0x1000).to_string(), "0x0000000000001000");
    }

    #[test]
    fn test_null_address()
    {
        assert!(Address::ZERO.is_null());
        assert!(!Address::new(1).is_null());
    }
}
