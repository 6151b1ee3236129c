use crate::Address;

/// Tag constants.
const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;
const REF_SHIFT: u32 = 2;

/// A tagged 64-bit value stored in heap slots and roots.
///
/// Encoding:
/// - **Fixnum**:    `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **Reference**: `...XXXX01`: word address shifted left by two.
///
/// Word address 0 is never handed out by the heap, so the reference with
/// address 0 doubles as the null reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const NULL: Self = Self(REF_TAG);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "fixnum overflow: {n}"
        );
        Self((n << 1) as u64)
    }

    /// # Safety
    ///
    /// The value must be a fixnum.
    #[inline(always)]
    pub unsafe fn to_i64(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.0 as i64) >> 1
    }

    #[inline(always)]
    pub fn as_fixnum(self) -> Option<i64> {
        self.is_fixnum().then(|| (self.0 as i64) >> 1)
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == REF_TAG
    }

    /// A reference to a heap object (not null, not a fixnum).
    #[inline(always)]
    pub const fn is_heap_ref(self) -> bool {
        self.is_ref() && !self.is_null()
    }

    #[inline(always)]
    pub fn from_address(addr: Address) -> Self {
        debug_assert!(addr != 0, "address 0 is the null reference");
        debug_assert!((addr as u64) >> (64 - REF_SHIFT) == 0, "address too large");
        Self(((addr as u64) << REF_SHIFT) | REF_TAG)
    }

    #[inline(always)]
    pub fn address(self) -> Address {
        debug_assert!(self.is_ref());
        (self.0 >> REF_SHIFT) as Address
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NULL
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(n) = self.as_fixnum() {
            write!(f, "Fixnum({n})")
        } else if self.is_null() {
            write!(f, "Null")
        } else if self.is_ref() {
            write!(f, "Ref(0x{:x})", self.address())
        } else {
            write!(f, "Raw(0x{:016x})", self.0)
        }
    }
}
