use crate::Address;

const TAG_MASK: u64 = 0b11;
const LOCKED_TAG: u64 = 0b00;
const NORMAL_TAG: u64 = 0b01;
const DEAD_SPAN_TAG: u64 = 0b10;
const GC_TAG: u64 = 0b11;

const BIASED_BIT: u64 = 1 << 2;
const AGE_SHIFT: u32 = 3;
const AGE_MASK: u64 = 0xf;
const PAYLOAD_SHIFT: u32 = 8;
const PAYLOAD_MASK: u64 = u32::MAX as u64;
const ADDRESS_SHIFT: u32 = 2;

/// Decoded view of a [`MarkWord`]. Exactly one interpretation is valid at a
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkState {
    /// Neutral header. `hash == 0` means no identity hash was assigned yet.
    Unlocked { hash: u32, age: u8 },
    /// Biased towards a mutator thread.
    Biased { thread: u32, age: u8 },
    /// Held by a lock owner; the displaced header lives with the owner.
    Locked { owner: u32, age: u8 },
    /// Reached by the full collector's mark phase.
    Marked,
    /// Relocated (or being relocated) to the given address.
    Forwarded(Address),
    /// First object of a dead run; the next live object starts at the address.
    DeadSpan(Address),
}

/// The first word of every heap object.
///
/// ```text
/// tag 0b01  normal:    [payload:32 @8] [_:1] [age:4 @3] [biased:1 @2] [01]
/// tag 0b00  locked:    [owner:32 @8]   [_:1] [age:4 @3] [0]          [00]
/// tag 0b11  gc:        [address @2]                                 [11]
///                      address 0 = marked, otherwise forwarded
/// tag 0b10  dead span: [next live address @2]                       [10]
/// ```
///
/// The GC states overwrite whatever synchronization state the word held, so
/// marks for which [`MarkWord::must_be_preserved`] holds are saved before
/// the word is repurposed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(u64);

impl MarkWord {
    pub const MAX_AGE: u8 = AGE_MASK as u8;

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Unlocked, unhashed, age 0.
    #[inline(always)]
    pub const fn prototype() -> Self {
        Self(NORMAL_TAG)
    }

    pub fn unlocked(hash: u32, age: u8) -> Self {
        debug_assert!(age <= Self::MAX_AGE);
        Self(((hash as u64) << PAYLOAD_SHIFT) | ((age as u64) << AGE_SHIFT) | NORMAL_TAG)
    }

    pub fn biased(thread: u32, age: u8) -> Self {
        debug_assert!(age <= Self::MAX_AGE);
        Self(
            ((thread as u64) << PAYLOAD_SHIFT)
                | ((age as u64) << AGE_SHIFT)
                | BIASED_BIT
                | NORMAL_TAG,
        )
    }

    pub fn locked(owner: u32, age: u8) -> Self {
        debug_assert!(age <= Self::MAX_AGE);
        Self(((owner as u64) << PAYLOAD_SHIFT) | ((age as u64) << AGE_SHIFT) | LOCKED_TAG)
    }

    #[inline(always)]
    pub const fn marked() -> Self {
        Self(GC_TAG)
    }

    #[inline(always)]
    pub fn forwarded(addr: Address) -> Self {
        debug_assert!(addr != 0, "cannot forward to the null address");
        Self(((addr as u64) << ADDRESS_SHIFT) | GC_TAG)
    }

    #[inline(always)]
    pub fn dead_span(next_live: Address) -> Self {
        Self(((next_live as u64) << ADDRESS_SHIFT) | DEAD_SPAN_TAG)
    }

    pub fn state(self) -> MarkState {
        let age = ((self.0 >> AGE_SHIFT) & AGE_MASK) as u8;
        let payload = ((self.0 >> PAYLOAD_SHIFT) & PAYLOAD_MASK) as u32;
        match self.0 & TAG_MASK {
            NORMAL_TAG if self.0 & BIASED_BIT != 0 => MarkState::Biased { thread: payload, age },
            NORMAL_TAG => MarkState::Unlocked { hash: payload, age },
            LOCKED_TAG => MarkState::Locked { owner: payload, age },
            DEAD_SPAN_TAG => MarkState::DeadSpan((self.0 >> ADDRESS_SHIFT) as Address),
            _ => match (self.0 >> ADDRESS_SHIFT) as Address {
                0 => MarkState::Marked,
                addr => MarkState::Forwarded(addr),
            },
        }
    }

    #[inline(always)]
    pub const fn is_marked(self) -> bool {
        self.0 == GC_TAG
    }

    #[inline(always)]
    pub const fn is_forwarded(self) -> bool {
        self.0 & TAG_MASK == GC_TAG && self.0 != GC_TAG
    }

    #[inline(always)]
    pub const fn is_dead_span(self) -> bool {
        self.0 & TAG_MASK == DEAD_SPAN_TAG
    }

    /// Marked, forwarded or a dead span: the word no longer carries
    /// synchronization state.
    #[inline(always)]
    pub const fn is_gc_state(self) -> bool {
        self.0 & 0b10 != 0
    }

    /// # Panics
    ///
    /// Panics unless the mark is [`MarkState::Forwarded`].
    #[inline]
    pub fn forwardee(self) -> Address {
        match self.state() {
            MarkState::Forwarded(addr) => addr,
            other => panic!("forwardee() on non-forwarded mark {other:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics unless the mark is [`MarkState::DeadSpan`].
    #[inline]
    pub fn next_live(self) -> Address {
        match self.state() {
            MarkState::DeadSpan(addr) => addr,
            other => panic!("next_live() on mark {other:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics when the mark holds a GC state.
    #[inline]
    pub fn age(self) -> u8 {
        match self.state() {
            MarkState::Unlocked { age, .. }
            | MarkState::Biased { age, .. }
            | MarkState::Locked { age, .. } => age,
            other => panic!("age() on mark {other:?}"),
        }
    }

    pub fn with_age(self, age: u8) -> Self {
        assert!(!self.is_gc_state(), "with_age() on mark {:?}", self.state());
        debug_assert!(age <= Self::MAX_AGE);
        Self((self.0 & !(AGE_MASK << AGE_SHIFT)) | ((age as u64) << AGE_SHIFT))
    }

    /// Saturates at [`MarkWord::MAX_AGE`].
    pub fn incr_age(self) -> Self {
        let age = self.age();
        if age == Self::MAX_AGE { self } else { self.with_age(age + 1) }
    }

    /// Identity hash of an unlocked mark, 0 when none was assigned.
    pub fn hash(self) -> u32 {
        match self.state() {
            MarkState::Unlocked { hash, .. } => hash,
            _ => 0,
        }
    }

    /// Whether the mark carries state that cannot be rebuilt from
    /// [`MarkWord::prototype`] once the word is repurposed.
    pub fn must_be_preserved(self) -> bool {
        match self.state() {
            MarkState::Unlocked { hash, .. } => hash != 0,
            MarkState::Biased { .. } | MarkState::Locked { .. } => true,
            _ => false,
        }
    }
}

impl Default for MarkWord {
    fn default() -> Self {
        Self::prototype()
    }
}

impl core::fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MarkWord({:?})", self.state())
    }
}
