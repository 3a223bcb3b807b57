//! Pending-event scheduler
//!
//! A single process-wide bitmask of work that has been signalled (usually from
//! an interrupt handler) but not yet handled. Producers [`post`] an event bit,
//! the main loop drains [`pending`] bits one at a time, [`consume`]s each bit
//! and runs the matching handler, and only goes to sleep once the set is
//! empty.
//!
//! Each bit is an independently named event; the crate assigns no meanings.
//! Give every logical event its own bit:
//!
//! ```
//! use efm32pg_hal::scheduler::{EventMask, Scheduler};
//!
//! const HUMIDITY_READ_DONE: EventMask = EventMask::bit(0);
//! const TEMP_READ_DONE: EventMask = EventMask::bit(1);
//!
//! static SCHEDULER: Scheduler = Scheduler::new();
//!
//! SCHEDULER.post(HUMIDITY_READ_DONE);
//! while !SCHEDULER.pending().is_empty() {
//!     if SCHEDULER.pending().intersects(HUMIDITY_READ_DONE) {
//!         SCHEDULER.consume(HUMIDITY_READ_DONE);
//!         // handle the completed read
//!     }
//! }
//! ```
//!
//! All updates run under a [`critical_section`], so `post` and `consume` are
//! safe to call from interrupt handlers and thread context alike.
//!
//! [`post`]: Scheduler::post
//! [`pending`]: Scheduler::pending
//! [`consume`]: Scheduler::consume

use core::cell::Cell;

use critical_section::Mutex;

/// A set of scheduler event bits.
///
/// Combined only with OR (posting) and AND-NOT (consuming), so posting is
/// idempotent and no event can clobber another.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventMask(u32);

impl EventMask {
    /// The empty set. An I2C transfer started with this mask posts nothing.
    pub const NONE: EventMask = EventMask(0);

    /// A mask with the single given bit (0..=31) set.
    pub const fn bit(index: u8) -> EventMask {
        assert!(index < 32);
        EventMask(1 << index)
    }

    /// Builds a mask from a raw bit pattern.
    pub const fn from_bits(bits: u32) -> EventMask {
        EventMask(bits)
    }

    /// The raw bit pattern.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if any bit of `other` is also set in `self`.
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl core::fmt::Debug for EventMask {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(fmt, "EventMask({:#010x})", self.0)
    }
}

/// The pending-event set.
///
/// Designed to live in a `static` shared between interrupt handlers and the
/// main loop; all methods take `&self`.
pub struct Scheduler {
    pending: Mutex<Cell<u32>>,
}

impl Scheduler {
    /// Creates a scheduler with nothing pending.
    pub const fn new() -> Scheduler {
        Scheduler {
            pending: Mutex::new(Cell::new(0)),
        }
    }

    /// Empties the pending set.
    pub fn clear_all(&self) {
        critical_section::with(|cs| self.pending.borrow(cs).set(0));
    }

    /// Marks the given events as pending.
    ///
    /// Posting an already-pending event leaves the set unchanged.
    pub fn post(&self, events: EventMask) {
        critical_section::with(|cs| {
            let pending = self.pending.borrow(cs);
            pending.set(pending.get() | events.bits());
        });
    }

    /// Removes the given events from the pending set.
    ///
    /// Consuming an event that is not pending is a no-op.
    pub fn consume(&self, events: EventMask) {
        critical_section::with(|cs| {
            let pending = self.pending.borrow(cs);
            pending.set(pending.get() & !events.bits());
        });
    }

    /// A snapshot of the currently pending events.
    pub fn pending(&self) -> EventMask {
        critical_section::with(|cs| EventMask(self.pending.borrow(cs).get()))
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}
