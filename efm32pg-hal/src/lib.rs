//! Interrupt-driven peripheral drivers for the EFM32 Pearl Gecko microcontrollers
//!
//! The Pearl Gecko is built around low-energy operation: peripherals run their
//! bus traffic from interrupts while the core sleeps, and the application only
//! wakes to handle work that has already completed. This crate provides the
//! three services that make that style work:
//!
//! * [`i2c`] - an interrupt-driven I2C controller state machine
//! * [`scheduler`] - a pending-event bitmask drained from the main loop
//! * [`sleep`] - reference-counted energy-mode arbitration
//!
//! A transfer is started from thread context and returns immediately; the bus
//! interrupts drive it to completion, completion is posted to the
//! [`Scheduler`], and the [`sleep`] module decides how deeply the core may
//! power down while the transfer is in flight.
//!
//! NOTE This HAL is still under active development. This API will remain
//! volatile until 1.0.0
//!
//! # Crate features
//!
//! * **critical-section-impl** -
//!   critical section backend for single-core Cortex-M parts like the Pearl
//!   Gecko
//! * **defmt** -
//!   Implement `defmt::Format` for several types.

#![warn(missing_docs)]
#![no_std]

pub mod i2c;
pub mod scheduler;
pub mod sleep;

// Provide access to common datastructures to avoid repeating ourselves
pub use i2c::I2C;
pub use scheduler::{EventMask, Scheduler};
pub use sleep::{EnergyMode, SleepController};

// Re-export crates used in efm32pg-hal's public API
pub extern crate fugit;
