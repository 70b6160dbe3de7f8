use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU128;

const SHIFT: u32 = u128::BITS - u32::BITS;
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const MASK_16: u128 = !((u16::MAX as u128) << SHIFT);

/// 16-, 32-, or 128-bit UUID ([Vol 3] Part B, Section 2.5.1).
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uuid(NonZeroU128);

impl Uuid {
    /// Client Characteristic Configuration descriptor
    /// ([Vol 3] Part G, Section 3.3.3.3).
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Self = uuid16(0x2902);
    /// Generic Access service.
    pub const GENERIC_ACCESS: Self = uuid16(0x1800);
    /// Generic Attribute service.
    pub const GENERIC_ATTRIBUTE: Self = uuid16(0x1801);
    /// Service Changed characteristic ([Vol 3] Part G, Section 7.1).
    pub const SERVICE_CHANGED: Self = uuid16(0x2A05);

    /// Creates a UUID from a `u128`.
    #[inline]
    #[must_use]
    pub const fn new(v: u128) -> Option<Self> {
        match NonZeroU128::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Converts an assigned 16-bit Bluetooth SIG UUID to `u16`.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> Option<u16> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u16;
        if self.0.get() & MASK_16 == BASE && v > 0 {
            Some(v)
        } else {
            None
        }
    }
}

/// Creates an assigned 16-bit SIG UUID from a `u16`.
///
/// # Panics
///
/// Panics if `v` is zero.
#[inline]
#[must_use]
pub const fn uuid16(v: u16) -> Uuid {
    assert!(v != 0, "invalid 16-bit UUID");
    match Uuid::new((v as u128) << SHIFT | BASE) {
        Some(u) => u,
        None => unreachable!(),
    }
}

impl Debug for Uuid {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(v) = self.as_u16() {
            write!(f, "{v:#06X}")
        } else {
            let v = self.0.get();
            write!(
                f,
                "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                (v & ((1 << 48) - 1)) as u64
            )
        }
    }
}

impl Display for Uuid {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Uuid> for u128 {
    #[inline]
    fn from(u: Uuid) -> Self {
        u.0.get()
    }
}
