mod header;
mod layout;
mod value;

pub use header::{MarkState, MarkWord};
pub use layout::*;
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, i64::MAX >> 2, i64::MIN >> 2] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert_eq!(unsafe { v.to_i64() }, n);
            assert_eq!(v.as_fixnum(), Some(n));
        }
    }

    #[test]
    fn fixnum_zero_is_zero_bits() {
        assert_eq!(Value::from_i64(0).raw(), 0);
    }

    #[test]
    fn null_is_a_reference_to_address_zero() {
        assert!(Value::NULL.is_ref());
        assert!(Value::NULL.is_null());
        assert!(!Value::NULL.is_heap_ref());
        assert_eq!(Value::NULL.address(), 0);
        assert_eq!(Value::default(), Value::NULL);
    }

    #[test]
    fn ref_tagging() {
        let v = Value::from_address(0x1234);
        assert!(v.is_ref());
        assert!(v.is_heap_ref());
        assert!(!v.is_fixnum());
        assert_eq!(v.address(), 0x1234);
        assert_eq!(v.as_fixnum(), None);
    }

    // ── Mark word ──────────────────────────────────────────────────

    #[test]
    fn prototype_is_unlocked_unhashed_age_zero() {
        let m = MarkWord::prototype();
        assert_eq!(m.state(), MarkState::Unlocked { hash: 0, age: 0 });
        assert!(!m.must_be_preserved());
        assert!(!m.is_gc_state());
    }

    #[test]
    fn mark_states_decode() {
        assert_eq!(
            MarkWord::unlocked(0xdead_beef, 3).state(),
            MarkState::Unlocked { hash: 0xdead_beef, age: 3 }
        );
        assert_eq!(
            MarkWord::biased(7, 15).state(),
            MarkState::Biased { thread: 7, age: 15 }
        );
        assert_eq!(
            MarkWord::locked(9, 1).state(),
            MarkState::Locked { owner: 9, age: 1 }
        );
        assert_eq!(MarkWord::marked().state(), MarkState::Marked);
        assert_eq!(MarkWord::forwarded(0x40).state(), MarkState::Forwarded(0x40));
        assert_eq!(MarkWord::dead_span(0x80).state(), MarkState::DeadSpan(0x80));
    }

    #[test]
    fn marked_and_forwarded_are_distinct() {
        let marked = MarkWord::marked();
        let fwd = MarkWord::forwarded(0x100);
        assert!(marked.is_marked() && !marked.is_forwarded());
        assert!(fwd.is_forwarded() && !fwd.is_marked());
        assert!(marked.is_gc_state() && fwd.is_gc_state());
        assert!(MarkWord::dead_span(8).is_gc_state());
        assert_eq!(fwd.forwardee(), 0x100);
    }

    #[test]
    #[should_panic(expected = "forwardee")]
    fn forwardee_of_normal_mark_panics() {
        MarkWord::prototype().forwardee();
    }

    #[test]
    #[should_panic(expected = "age")]
    fn age_of_forwarded_mark_panics() {
        MarkWord::forwarded(0x10).age();
    }

    #[test]
    fn incr_age_keeps_payload_and_saturates() {
        let m = MarkWord::unlocked(77, 0).incr_age().incr_age();
        assert_eq!(m.state(), MarkState::Unlocked { hash: 77, age: 2 });
        let old = MarkWord::biased(3, MarkWord::MAX_AGE);
        assert_eq!(old.incr_age(), old);
    }

    #[test]
    fn preservation_rules() {
        assert!(MarkWord::unlocked(5, 0).must_be_preserved());
        assert!(MarkWord::biased(1, 0).must_be_preserved());
        assert!(MarkWord::locked(1, 0).must_be_preserved());
        assert!(!MarkWord::unlocked(0, 4).must_be_preserved());
        assert!(!MarkWord::marked().must_be_preserved());
    }

    // ── Layout ─────────────────────────────────────────────────────

    #[test]
    fn object_kind_tags_round_trip() {
        let kinds = [
            ObjectKind::Instance,
            ObjectKind::RefArray,
            ObjectKind::WordArray,
            ObjectKind::Klass,
            ObjectKind::Reference(ReferenceType::Soft),
            ObjectKind::Reference(ReferenceType::Weak),
            ObjectKind::Reference(ReferenceType::Final),
        ];
        for kind in kinds {
            assert_eq!(ObjectKind::from_value(kind.to_value()), Some(kind));
        }
        assert_eq!(ObjectKind::from_tag(99), None);
        assert_eq!(ObjectKind::from_value(Value::NULL), None);
    }

    #[test]
    fn sizes_by_kind() {
        assert_eq!(ObjectKind::Instance.size(5, 0), 5);
        assert_eq!(ObjectKind::RefArray.size(0, 4), ARRAY_HEADER_WORDS + 4);
        assert_eq!(ObjectKind::WordArray.size(0, 0), ARRAY_HEADER_WORDS);
        assert_eq!(ObjectKind::Klass.size(0, 0), KLASS_WORDS);
        assert_eq!(
            ObjectKind::Reference(ReferenceType::Weak).size(REFERENCE_WORDS, 0),
            REFERENCE_WORDS
        );
    }
}
