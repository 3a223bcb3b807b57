//! Inter-Integrated Circuit (I2C) bus
//!
//! An interrupt-driven I2C controller for the Pearl Gecko's I2C peripherals.
//! Unlike a blocking driver, [`I2C::start`] only arms the hardware and
//! returns; the peripheral's interrupt causes (acknowledge, not-acknowledge,
//! receive-data-valid, stop-complete) then drive the transfer state machine
//! forward one event at a time. On completion the driver posts a
//! caller-chosen event to the [`Scheduler`](crate::scheduler::Scheduler) and
//! releases the energy mode it held via the
//! [`SleepController`](crate::sleep::SleepController), so the core may sleep
//! while bytes are on the wire and only wakes up to finished work.
//!
//! The register-level operations live behind the [`Instance`] trait; a board
//! support crate implements it on top of the device's PAC and wires the I2C
//! interrupt to [`I2C::on_interrupt`].
//!
//! ## Usage
//! ```ignore
//! use efm32pg_hal::i2c::{Config, Operation, Transfer, I2C};
//! use efm32pg_hal::scheduler::{EventMask, Scheduler};
//! use efm32pg_hal::sleep::SleepController;
//!
//! const RH_READ_DONE: EventMask = EventMask::bit(0);
//!
//! static SCHEDULER: Scheduler = Scheduler::new();
//! static SLEEP: SleepController = SleepController::new();
//!
//! let mut i2c = I2C::new(board_i2c0, Config::default(), &SCHEDULER, &SLEEP);
//!
//! // Kick off a 2-byte humidity read from an Si7021 (command code 0xF5) and
//! // keep running; the bus interrupt finishes the job.
//! static mut RH_BUF: [u8; 2] = [0; 2];
//! let transfer = Transfer::new(
//!     0x40,
//!     &[0xF5],
//!     Operation::Read(unsafe { &mut RH_BUF }),
//!     RH_READ_DONE,
//! )?;
//! i2c.start(transfer)?;
//!
//! // ... later, from the main loop, once RH_READ_DONE is pending:
//! let Some(Operation::Read(data)) = i2c.finish() else { unreachable!() };
//! ```
//!
//! The driver itself never busy-waits and never times out: a target that
//! stops responding parks the state machine and keeps the energy mode
//! blocked until the application intervenes (see [`I2C::bus_reset`]).

mod controller;

pub use controller::I2C;

use fugit::HertzU32;

use crate::sleep::EnergyMode;

/// Configuration for an I2C bus.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Bus clock frequency.
    pub frequency: HertzU32,
    /// Energy mode blocked while a transfer is in flight.
    ///
    /// The peripheral can shift bytes in EM1 but not deeper, so the default
    /// holds the chip out of EM2 from `start` until the stop condition has
    /// been transmitted.
    pub sleep_block: EnergyMode,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            frequency: HertzU32::kHz(100),
            sleep_block: EnergyMode::Em2,
        }
    }
}

/// I2C error
#[derive(Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A transfer is already in flight, or the bus hardware is not idle.
    ///
    /// Only one transfer may be outstanding per bus; a `start` while busy is
    /// rejected, never queued.
    Busy,
    /// User passed in a read buffer that was 0 length
    InvalidReadBufferLength,
    /// User passed in a write buffer that was 0 length
    InvalidWriteBufferLength,
    /// Command codes are 1 or 2 bytes; anything else is unsupported.
    InvalidCommandLength(usize),
    /// Target i2c address is out of range
    AddressOutOfRange(u8),
    /// Target i2c address is reserved
    AddressReserved(u8),
    /// The hardware raised an event the state machine has no transition for.
    ///
    /// Either the target violated the protocol or the interrupt wiring is
    /// wrong; the state machine never silently ignores an unexpected event.
    Spurious {
        /// State the machine was in when the event arrived.
        state: State,
        /// The unexpected event.
        event: Event,
    },
}

impl core::fmt::Debug for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Busy => write!(fmt, "Busy"),
            Error::InvalidReadBufferLength => write!(fmt, "InvalidReadBufferLength"),
            Error::InvalidWriteBufferLength => write!(fmt, "InvalidWriteBufferLength"),
            Error::InvalidCommandLength(len) => write!(fmt, "InvalidCommandLength({})", len),
            Error::AddressOutOfRange(addr) => write!(fmt, "AddressOutOfRange({:x})", addr),
            Error::AddressReserved(addr) => write!(fmt, "AddressReserved({:x})", addr),
            Error::Spurious { state, event } => {
                write!(fmt, "Spurious({:?} in {:?})", event, state)
            }
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::Busy => defmt::write!(fmt, "Busy"),
            Error::InvalidReadBufferLength => defmt::write!(fmt, "InvalidReadBufferLength"),
            Error::InvalidWriteBufferLength => defmt::write!(fmt, "InvalidWriteBufferLength"),
            Error::InvalidCommandLength(len) => defmt::write!(fmt, "InvalidCommandLength({})", len),
            Error::AddressOutOfRange(addr) => defmt::write!(fmt, "AddressOutOfRange({:x})", addr),
            Error::AddressReserved(addr) => defmt::write!(fmt, "AddressReserved({:x})", addr),
            Error::Spurious { state, event } => {
                defmt::write!(fmt, "Spurious({} in {})", event, state)
            }
        }
    }
}

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        match self {
            Error::Spurious {
                state: State::RequestDevice,
                event: Event::Nack,
            } => embedded_hal::i2c::ErrorKind::NoAcknowledge(
                embedded_hal::i2c::NoAcknowledgeSource::Address,
            ),
            Error::Spurious {
                state: State::WriteData,
                event: Event::Nack,
            } => embedded_hal::i2c::ErrorKind::NoAcknowledge(
                embedded_hal::i2c::NoAcknowledgeSource::Data,
            ),
            Error::Spurious { .. } => embedded_hal::i2c::ErrorKind::Bus,
            _ => embedded_hal::i2c::ErrorKind::Other,
        }
    }
}

/// Transfer state machine states.
///
/// A write transfer moves `Idle -> RequestDevice -> WriteData -> Closing ->
/// Idle`; a read continues from `WriteData` through `RequestData` and
/// `ReadData` before closing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No transfer active.
    Idle,
    /// START and address-with-write sent; waiting for the address ack.
    RequestDevice,
    /// Shifting out command-code bytes, then (for writes) payload bytes.
    WriteData,
    /// Repeated START and address-with-read sent; waiting for the ack.
    ///
    /// A nack here is retried: the target may still be preparing the data.
    RequestData,
    /// Receiving payload bytes, acking all but the last.
    ReadData,
    /// STOP requested; waiting for the stop-complete interrupt.
    Closing,
}

/// An interrupt cause fed to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// The target acknowledged the last byte.
    Ack,
    /// The target did not acknowledge the last byte.
    Nack,
    /// A received byte is waiting in the receive register.
    RxData,
    /// The stop condition has been transmitted.
    Stop,
}

/// The set of interrupt causes pending on the hardware.
///
/// Returned by [`Instance::pending`]; causes not enabled for the bus must
/// not be reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Events {
    /// An acknowledge was received.
    pub ack: bool,
    /// A not-acknowledge was received.
    pub nack: bool,
    /// Receive data is valid.
    pub rx_data: bool,
    /// A stop condition was transmitted.
    pub stop: bool,
}

impl Events {
    /// No cause pending.
    pub const NONE: Events = Events {
        ack: false,
        nack: false,
        rx_data: false,
        stop: false,
    };
}

/// One I2C peripheral instance.
///
/// The register-level seam between the transfer state machine and the
/// hardware. Implementations map each operation onto the peripheral's
/// command/data registers; the pins and clock tree must already be routed
/// before the driver touches the bus.
pub trait Instance {
    /// Applies the bus configuration and enables the acknowledge,
    /// not-acknowledge, receive-data-valid and stop-complete interrupt
    /// causes (and only those).
    fn configure(&mut self, config: &Config);

    /// Returns `true` if the hardware's own bus-state machine is idle.
    fn bus_idle(&self) -> bool;

    /// Reads and clears the enabled pending interrupt causes.
    fn pending(&mut self) -> Events;

    /// Issues a (repeated) START condition.
    fn send_start(&mut self);

    /// Issues a STOP condition.
    fn send_stop(&mut self);

    /// Acknowledges the most recently received byte.
    fn send_ack(&mut self);

    /// Not-acknowledges the most recently received byte.
    fn send_nack(&mut self);

    /// Aborts whatever the peripheral state machine is doing.
    fn abort(&mut self);

    /// Places a byte in the transmit register.
    fn write_byte(&mut self, byte: u8);

    /// Takes the byte from the receive register.
    fn read_byte(&mut self) -> u8;

    /// Toggles the SCL line once, for bus recovery.
    fn toggle_scl(&mut self);
}

/// Payload direction and buffer of a transfer.
///
/// The buffer is borrowed by the driver for the duration of the transfer and
/// handed back by [`I2C::finish`]; the caller must not touch it until the
/// completion event is pending.
#[derive(Debug)]
pub enum Operation<'buf> {
    /// Write these bytes to the target, after the command code.
    Write(&'buf [u8]),
    /// Read from the target into this buffer, filling it completely.
    Read(&'buf mut [u8]),
}

/// A transfer descriptor, consumed by [`I2C::start`].
#[derive(Debug)]
pub struct Transfer<'buf> {
    address: u8,
    command: [u8; 2],
    command_len: u8,
    operation: Operation<'buf>,
    event: crate::scheduler::EventMask,
}

impl<'buf> Transfer<'buf> {
    /// Builds a transfer descriptor.
    ///
    /// `address` is the target's 7-bit address. `command` is the
    /// device-specific command code (1 or 2 bytes) written first in either
    /// direction. `event` is posted to the scheduler when the transfer
    /// completes; pass [`EventMask::NONE`](crate::scheduler::EventMask::NONE)
    /// for none.
    pub fn new(
        address: u8,
        command: &[u8],
        operation: Operation<'buf>,
        event: crate::scheduler::EventMask,
    ) -> Result<Transfer<'buf>, Error> {
        if address >= 0x80 {
            return Err(Error::AddressOutOfRange(address));
        }
        if i2c_reserved_addr(address) {
            return Err(Error::AddressReserved(address));
        }
        if command.is_empty() || command.len() > 2 {
            return Err(Error::InvalidCommandLength(command.len()));
        }
        match &operation {
            Operation::Write(bytes) if bytes.is_empty() => {
                return Err(Error::InvalidWriteBufferLength)
            }
            Operation::Read(buffer) if buffer.is_empty() => {
                return Err(Error::InvalidReadBufferLength)
            }
            _ => {}
        }

        let mut cmd = [0; 2];
        cmd[..command.len()].copy_from_slice(command);
        Ok(Transfer {
            address,
            command: cmd,
            command_len: command.len() as u8,
            operation,
            event,
        })
    }
}

fn i2c_reserved_addr(addr: u8) -> bool {
    (addr & 0x78) == 0 || (addr & 0x78) == 0x78
}
