//! NaN-boxed runtime values.
//!
//! The runtime stores every value in 64 bits: doubles as themselves, and
//! everything else under a tag in the top 16 bits, a region no canonical
//! double can occupy. Cell pointers ride in the low 48 bits of a tagged
//! word, so a raw memory word holding a boxed cell reference is *not* a
//! canonical pointer; conservative scanning has to unpack it before any
//! address-range test.

use crate::cell::CellPtr;

const TAG_SHIFT: u32 = 48;

const UNDEFINED_TAG: u64 = 0xFFF9;
const NULL_TAG: u64 = 0xFFFA;
const BOOL_TAG: u64 = 0xFFFB;
const INT32_TAG: u64 = 0xFFFC;
const CELL_TAG: u64 = 0xFFFE;

/// All NaNs are canonicalized to this payload so tag space above it stays
/// unreachable from real doubles.
const CANON_NAN: u64 = 0x7FF8_0000_0000_0000;

const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// A 64-bit NaN-boxed value.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The `undefined` value.
    #[must_use]
    pub const fn undefined() -> Self {
        Self(UNDEFINED_TAG << TAG_SHIFT)
    }

    /// The `null` value.
    #[must_use]
    pub const fn null() -> Self {
        Self(NULL_TAG << TAG_SHIFT)
    }

    /// Boxes a boolean.
    #[must_use]
    pub const fn from_bool(b: bool) -> Self {
        Self((BOOL_TAG << TAG_SHIFT) | b as u64)
    }

    /// Boxes a 32-bit integer.
    #[must_use]
    pub const fn from_i32(i: i32) -> Self {
        Self((INT32_TAG << TAG_SHIFT) | (i as u32 as u64))
    }

    /// Boxes a double. NaNs are canonicalized so they cannot alias a tag.
    #[must_use]
    pub fn from_f64(d: f64) -> Self {
        if d.is_nan() {
            Self(CANON_NAN)
        } else {
            Self(d.to_bits())
        }
    }

    /// Boxes a cell reference. The pointer's low 48 bits are stored; the
    /// resulting bit pattern is non-canonical and useless as an address
    /// until [`extract_pointer_bits`](Self::extract_pointer_bits) undoes it.
    #[must_use]
    pub fn from_cell(cell: CellPtr) -> Self {
        let addr = cell.addr() as u64;
        Self((CELL_TAG << TAG_SHIFT) | (addr & PAYLOAD_MASK))
    }

    /// The raw 64-bit encoding.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this value holds a cell reference.
    #[must_use]
    pub const fn is_cell(self) -> bool {
        Self::encodes_cell(self.0)
    }

    /// The referenced cell.
    ///
    /// # Panics
    ///
    /// Panics if the value does not hold a cell reference.
    #[must_use]
    pub fn as_cell(self) -> CellPtr {
        assert!(self.is_cell(), "value does not hold a cell");
        // SAFETY: the payload was a cell slot address when boxed.
        unsafe { CellPtr::from_addr(Self::extract_pointer_bits(self.0)) }
    }

    /// Whether a raw 64-bit word carries the cell tag. Used on words of
    /// unknown provenance during conservative scanning.
    #[must_use]
    pub const fn encodes_cell(bits: u64) -> bool {
        (bits >> TAG_SHIFT) == CELL_TAG
    }

    /// Recovers the canonical pointer hidden in a cell-tagged word by
    /// sign-extending the 48-bit payload.
    #[must_use]
    pub const fn extract_pointer_bits(bits: u64) -> usize {
        (((bits & PAYLOAD_MASK) as i64) << 16 >> 16) as usize
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 >> TAG_SHIFT {
            UNDEFINED_TAG => write!(f, "Value(undefined)"),
            NULL_TAG => write!(f, "Value(null)"),
            BOOL_TAG => write!(f, "Value({})", self.0 & 1 == 1),
            INT32_TAG => write!(f, "Value({})", self.0 as u32 as i32),
            CELL_TAG => write!(f, "Value(cell {:#x})", Self::extract_pointer_bits(self.0)),
            _ => write!(f, "Value({})", f64::from_bits(self.0)),
        }
    }
}
