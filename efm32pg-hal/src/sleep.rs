//! Energy-mode arbitration
//!
//! The Pearl Gecko's energy modes trade wake-up latency for power: EM0 runs
//! the core, EM1 stops the core but keeps high-frequency peripheral clocks,
//! EM2/EM3 progressively shut clock trees down, and EM4 is effectively off.
//! A peripheral that has an operation in flight needs the chip to stay
//! shallow enough for its clocks to keep running, and several peripherals may
//! be active at once.
//!
//! [`SleepController`] composes those requirements by reference counting.
//! Before starting an operation a driver calls [`block`] with the first mode
//! that would break it; on completion it calls [`unblock`]. The main loop
//! calls [`enter_sleep`] when it has nothing left to do, and the controller
//! picks the deepest mode no active driver has objected to.
//!
//! Block/unblock pairs from independent drivers compose without coordination:
//! counting is commutative, and the arbiter simply honours the shallowest
//! outstanding requirement.
//!
//! [`block`]: SleepController::block
//! [`unblock`]: SleepController::unblock
//! [`enter_sleep`]: SleepController::enter_sleep

use core::cell::Cell;

use critical_section::Mutex;

/// An energy mode, ordered from fully active to effectively off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnergyMode {
    /// Run mode: core and all enabled clocks active.
    Em0 = 0,
    /// Sleep: core clock gated, high-frequency peripherals still running.
    Em1 = 1,
    /// Deep sleep: high-frequency clock trees stopped.
    Em2 = 2,
    /// Stop: only the ultra-low-frequency oscillator remains.
    Em3 = 3,
    /// Shutoff. Not entered by [`SleepController::enter_sleep`]; waking from
    /// EM4 is a reset.
    Em4 = 4,
}

impl EnergyMode {
    const ALL: [EnergyMode; 5] = [
        EnergyMode::Em0,
        EnergyMode::Em1,
        EnergyMode::Em2,
        EnergyMode::Em3,
        EnergyMode::Em4,
    ];
}

/// Hardware sleep entry.
///
/// The seam between the arbiter and the energy management unit. `enter` must
/// transition the chip into `mode` and return once an interrupt has brought
/// it back to run mode.
pub trait PowerControl {
    /// Enters `mode`, returning when the core is woken by an interrupt.
    fn enter(&mut self, mode: EnergyMode);
}

/// Cortex-M sleep entry via WFI.
///
/// EM1 is a plain WFI; EM2 and EM3 additionally set SLEEPDEEP so the core
/// requests a deep-sleep state, which the Pearl Gecko's energy management
/// unit maps onto the configured low-energy mode.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub struct CortexMSleep {
    scb: cortex_m::peripheral::SCB,
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
impl CortexMSleep {
    /// Takes ownership of the System Control Block to manage SLEEPDEEP.
    pub fn new(scb: cortex_m::peripheral::SCB) -> CortexMSleep {
        CortexMSleep { scb }
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
impl PowerControl for CortexMSleep {
    fn enter(&mut self, mode: EnergyMode) {
        match mode {
            EnergyMode::Em0 => {}
            EnergyMode::Em1 => {
                self.scb.clear_sleepdeep();
                cortex_m::asm::wfi();
            }
            _ => {
                self.scb.set_sleepdeep();
                cortex_m::asm::wfi();
                self.scb.clear_sleepdeep();
            }
        }
    }
}

/// Reference-counted "how deep may we sleep" arbiter.
///
/// Designed to live in a `static` shared between drivers and the main loop;
/// all methods take `&self`.
pub struct SleepController {
    blocked: Mutex<[Cell<u8>; 5]>,
}

impl SleepController {
    /// Creates a controller with every mode unblocked.
    pub const fn new() -> SleepController {
        SleepController {
            blocked: Mutex::new([
                Cell::new(0),
                Cell::new(0),
                Cell::new(0),
                Cell::new(0),
                Cell::new(0),
            ]),
        }
    }

    /// Clears every block counter.
    pub fn reset(&self) {
        critical_section::with(|cs| {
            for slot in self.blocked.borrow(cs) {
                slot.set(0);
            }
        });
    }

    /// Asserts that the chip must not enter `mode` (or anything deeper).
    ///
    /// Call before starting an operation that needs the clocks of the modes
    /// above `mode`; pair with exactly one [`unblock`](Self::unblock) once
    /// the operation completes.
    pub fn block(&self, mode: EnergyMode) {
        critical_section::with(|cs| {
            let slot = &self.blocked.borrow(cs)[mode as usize];
            slot.set(slot.get().saturating_add(1));
        });
    }

    /// Releases one previous [`block`](Self::block) of `mode`.
    ///
    /// An unblock without a matching block is a contract violation; it panics
    /// in debug builds and saturates at zero in release builds.
    pub fn unblock(&self, mode: EnergyMode) {
        let count = critical_section::with(|cs| {
            let slot = &self.blocked.borrow(cs)[mode as usize];
            let count = slot.get();
            slot.set(count.saturating_sub(1));
            count
        });
        debug_assert!(count > 0, "unblock of {:?} without matching block", mode);
    }

    /// The shallowest mode that is currently blocked, or [`EnergyMode::Em4`]
    /// when nothing is blocked.
    ///
    /// The returned mode and everything deeper are off limits; sleeping stops
    /// one mode short of it.
    pub fn current_block(&self) -> EnergyMode {
        critical_section::with(|cs| {
            let blocked = self.blocked.borrow(cs);
            for (mode, slot) in EnergyMode::ALL.iter().zip(blocked) {
                if slot.get() != 0 {
                    return *mode;
                }
            }
            EnergyMode::Em4
        })
    }

    /// Sleeps as deeply as the outstanding blocks allow.
    ///
    /// Resolves the current block level and suspends via `power`, returning
    /// once an interrupt has woken the core. With EM0 or EM1 blocked the
    /// call returns immediately; with nothing blocked the chip goes down to
    /// EM3 (never EM4: waking from shutoff is a reset, so it is not a sleep
    /// state the main loop can use).
    pub fn enter_sleep<P: PowerControl>(&self, power: &mut P) {
        match self.current_block() {
            EnergyMode::Em0 | EnergyMode::Em1 => {}
            EnergyMode::Em2 => power.enter(EnergyMode::Em1),
            EnergyMode::Em3 => power.enter(EnergyMode::Em2),
            EnergyMode::Em4 => power.enter(EnergyMode::Em3),
        }
    }
}

impl Default for SleepController {
    fn default() -> SleepController {
        SleepController::new()
    }
}
