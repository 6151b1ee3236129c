//! "This object now lives at address X", stored in the object's mark word.
//!
//! Shared by the scavenger (concurrent copiers race through
//! [`forward_to_atomic`]) and the full collector (phase 2 installs forwarding
//! single-threaded per generation through [`install_forward`]).

use object::{Address, MarkWord};

use crate::HeapMemory;

#[inline(always)]
pub fn mark_is_forwarding(mark: MarkWord) -> bool {
    mark.is_forwarded()
}

#[inline(always)]
pub fn decode_forward_address(mark: MarkWord) -> Address {
    mark.forwardee()
}

/// Unconditionally forwards `obj` to `new`.
#[inline]
pub fn install_forward(mem: &HeapMemory, obj: Address, new: Address) {
    mem.set_mark(obj, MarkWord::forwarded(new));
}

/// Forwards `obj` to `new` if its mark still equals `expected`.
///
/// On failure another thread won the race and the winner's destination is
/// returned; the caller must discard its own copy.
#[inline]
pub fn forward_to_atomic(
    mem: &HeapMemory,
    obj: Address,
    expected: MarkWord,
    new: Address,
) -> Result<(), Address> {
    match mem.cas_mark(obj, expected, MarkWord::forwarded(new)) {
        Ok(_) => Ok(()),
        Err(winner) => Err(decode_forward_address(winner)),
    }
}

/// The forwarding destination of `obj`, if it has one.
#[inline]
pub fn forwardee(mem: &HeapMemory, obj: Address) -> Option<Address> {
    let mark = mem.mark(obj);
    mark_is_forwarding(mark).then(|| decode_forward_address(mark))
}

#[cfg(test)]
mod tests {
    use std::sync::{Barrier, atomic::AtomicUsize, atomic::Ordering};

    use super::*;

    #[test]
    fn install_and_decode() {
        let mem = HeapMemory::new(16);
        mem.set_mark(4, MarkWord::prototype());
        assert_eq!(forwardee(&mem, 4), None);
        install_forward(&mem, 4, 10);
        assert!(mark_is_forwarding(mem.mark(4)));
        assert_eq!(forwardee(&mem, 4), Some(10));
    }

    #[test]
    fn racing_forwarders_agree_on_one_destination() {
        const THREADS: usize = 8;
        let mem = HeapMemory::new(64);
        let original = MarkWord::unlocked(0, 2);
        mem.set_mark(2, original);

        let winners = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);
        let seen: Vec<Address> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let (mem, barrier, winners) = (&mem, &barrier, &winners);
                    s.spawn(move || {
                        let mine = 8 + i * 4;
                        barrier.wait();
                        match forward_to_atomic(mem, 2, original, mine) {
                            Ok(()) => {
                                winners.fetch_add(1, Ordering::Relaxed);
                                mine
                            }
                            Err(winner) => winner,
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(winners.load(Ordering::Relaxed), 1);
        let target = forwardee(&mem, 2).unwrap();
        assert!(seen.iter().all(|&addr| addr == target));
    }
}
