use crate::scheduler::{EventMask, Scheduler};
use crate::sleep::SleepController;

use super::{Config, Error, Event, Instance, Operation, State, Transfer};

/// SCL toggles for a bus reset: more than the 9 clocks needed to flush a
/// partial byte out of a stuck target, with margin.
const BUS_RESET_SCL_TOGGLES: usize = 18;

const fn address_write(address: u8) -> u8 {
    address << 1
}

const fn address_read(address: u8) -> u8 {
    (address << 1) | 1
}

/// I2C peripheral operating in controller mode.
///
/// One instance owns one physical bus; at most one transfer may be in flight
/// on it at a time. [`start`](Self::start) arms the hardware and returns, the
/// bus interrupt drives [`on_interrupt`](Self::on_interrupt), and completion
/// shows up as the transfer's event in the shared [`Scheduler`].
pub struct I2C<'a, T: Instance> {
    bus: T,
    config: Config,
    scheduler: &'a Scheduler,
    sleep: &'a SleepController,
    state: State,
    address: u8,
    command: [u8; 2],
    command_len: u8,
    command_sent: u8,
    operation: Option<Operation<'a>>,
    cursor: usize,
    event: EventMask,
}

impl<'a, T: Instance> I2C<'a, T> {
    /// Configures the peripheral and opens the bus.
    ///
    /// The pins and clock tree must already be routed. Opening performs a
    /// [`bus_reset`](Self::bus_reset) so a target left mid-transaction by a
    /// previous run releases the bus before the first transfer.
    pub fn new(
        mut bus: T,
        config: Config,
        scheduler: &'a Scheduler,
        sleep: &'a SleepController,
    ) -> I2C<'a, T> {
        bus.configure(&config);
        let mut i2c = I2C {
            bus,
            config,
            scheduler,
            sleep,
            state: State::Idle,
            address: 0,
            command: [0; 2],
            command_len: 0,
            command_sent: 0,
            operation: None,
            cursor: 0,
            event: EventMask::NONE,
        };
        i2c.bus_reset();
        i2c
    }

    /// Starts a transfer and returns without waiting for it.
    ///
    /// Blocks the configured energy mode, latches the descriptor and puts
    /// START plus the address byte on the wire; the interrupt events do the
    /// rest. Returns [`Error::Busy`] if a transfer is already in flight or
    /// the bus hardware is not idle - a busy bus rejects, it does not queue.
    ///
    /// There is no timeout: a target that never acknowledges its address
    /// parks the state machine and keeps the energy mode blocked until the
    /// application recovers the bus.
    pub fn start(&mut self, transfer: Transfer<'a>) -> Result<(), Error> {
        critical_section::with(|_| {
            if self.state != State::Idle || !self.bus.bus_idle() {
                return Err(Error::Busy);
            }

            self.sleep.block(self.config.sleep_block);
            self.address = transfer.address;
            self.command = transfer.command;
            self.command_len = transfer.command_len;
            self.command_sent = 0;
            self.cursor = 0;
            self.event = transfer.event;
            self.operation = Some(transfer.operation);

            self.state = State::RequestDevice;
            self.bus.send_start();
            self.bus.write_byte(address_write(self.address));
            Ok(())
        })
    }

    /// Services the bus interrupt.
    ///
    /// Reads and clears the pending causes and feeds them to
    /// [`handle_event`](Self::handle_event) in hardware flag order. Call this
    /// from the peripheral's interrupt handler.
    pub fn on_interrupt(&mut self) -> Result<(), Error> {
        let pending = self.bus.pending();
        if pending.ack {
            self.handle_event(Event::Ack)?;
        }
        if pending.nack {
            self.handle_event(Event::Nack)?;
        }
        if pending.rx_data {
            self.handle_event(Event::RxData)?;
        }
        if pending.stop {
            self.handle_event(Event::Stop)?;
        }
        Ok(())
    }

    /// Advances the state machine by one bus event.
    ///
    /// Any (state, event) pair without a transition returns
    /// [`Error::Spurious`] and leaves the state unchanged: an unexpected
    /// event means a protocol violation by the target or broken interrupt
    /// wiring, and the caller chooses the failure policy.
    ///
    /// A not-acknowledged read request is not an error - the target may
    /// still be preparing the data - and is retried by reissuing the
    /// repeated START, with no bound on the number of retries.
    pub fn handle_event(&mut self, event: Event) -> Result<(), Error> {
        match (self.state, event) {
            (State::RequestDevice, Event::Ack) => {
                // address accepted; the command code goes out first
                self.state = State::WriteData;
                self.send_next_command_byte();
                Ok(())
            }
            (State::WriteData, Event::Ack) => {
                if self.command_sent < self.command_len {
                    self.send_next_command_byte();
                } else if let Some(Operation::Write(bytes)) = self.operation.as_ref() {
                    if self.cursor < bytes.len() {
                        self.bus.write_byte(bytes[self.cursor]);
                        self.cursor += 1;
                    } else {
                        // last payload byte acknowledged
                        self.bus.send_stop();
                        self.state = State::Closing;
                    }
                } else {
                    // command code done; turn the bus around
                    self.state = State::RequestData;
                    self.bus.send_start();
                    self.bus.write_byte(address_read(self.address));
                }
                Ok(())
            }
            (State::RequestData, Event::Ack) => {
                self.state = State::ReadData;
                Ok(())
            }
            (State::RequestData, Event::Nack) => {
                // target not ready yet; ask again
                self.bus.send_start();
                self.bus.write_byte(address_read(self.address));
                Ok(())
            }
            (State::ReadData, Event::RxData) => {
                let byte = self.bus.read_byte();
                if let Some(Operation::Read(buffer)) = self.operation.as_mut() {
                    buffer[self.cursor] = byte;
                    self.cursor += 1;
                    if self.cursor < buffer.len() {
                        self.bus.send_ack();
                    } else {
                        self.bus.send_nack();
                        self.bus.send_stop();
                        self.state = State::Closing;
                    }
                    Ok(())
                } else {
                    Err(Error::Spurious {
                        state: self.state,
                        event,
                    })
                }
            }
            (State::Closing, Event::Stop) => {
                self.state = State::Idle;
                self.cursor = 0;
                self.sleep.unblock(self.config.sleep_block);
                self.scheduler.post(self.event);
                Ok(())
            }
            (state, event) => Err(Error::Spurious { state, event }),
        }
    }

    /// Hands the buffers of a completed transfer back to the caller.
    ///
    /// Returns `None` while a transfer is in flight or when nothing is held.
    pub fn finish(&mut self) -> Option<Operation<'a>> {
        if self.state == State::Idle {
            self.operation.take()
        } else {
            None
        }
    }

    /// The current state machine state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns `true` if both the state machine and the bus hardware are
    /// idle, i.e. [`start`](Self::start) would be accepted.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle && self.bus.bus_idle()
    }

    /// Forces every target on the bus to release it.
    ///
    /// Toggles SCL with SDA left at its pulled-up default so a target stuck
    /// mid-byte clocks out the rest of its shift register, then aborts the
    /// local peripheral. Run automatically at open time; call it by hand
    /// when the application has detected a locked-up bus. The driver never
    /// invokes it on its own mid-transfer.
    pub fn bus_reset(&mut self) {
        for _ in 0..BUS_RESET_SCL_TOGGLES {
            self.bus.toggle_scl();
        }
        self.bus.abort();
    }

    fn send_next_command_byte(&mut self) {
        let byte = self.command[self.command_sent as usize];
        self.command_sent += 1;
        self.bus.write_byte(byte);
    }

    /// Releases the I2C peripheral.
    pub fn free(self) -> T {
        self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::super::Events;
    use super::*;
    use crate::sleep::EnergyMode;

    const DONE: EventMask = EventMask::bit(4);

    /// Records every command the driver issues, and plays back canned
    /// receive data.
    #[derive(Default)]
    struct FakeBus {
        idle: bool,
        starts: usize,
        stops: usize,
        acks: usize,
        nacks: usize,
        aborts: usize,
        scl_toggles: usize,
        configured_hz: u32,
        tx: [u8; 16],
        tx_len: usize,
        rx: [u8; 8],
        rx_pos: usize,
        pending: Events,
    }

    impl FakeBus {
        fn new() -> FakeBus {
            FakeBus {
                idle: true,
                ..FakeBus::default()
            }
        }

        fn with_rx(data: &[u8]) -> FakeBus {
            let mut bus = FakeBus::new();
            bus.rx[..data.len()].copy_from_slice(data);
            bus
        }

        fn tx(&self) -> &[u8] {
            &self.tx[..self.tx_len]
        }
    }

    impl Instance for FakeBus {
        fn configure(&mut self, config: &Config) {
            self.configured_hz = config.frequency.to_Hz();
        }

        fn bus_idle(&self) -> bool {
            self.idle
        }

        fn pending(&mut self) -> Events {
            core::mem::take(&mut self.pending)
        }

        fn send_start(&mut self) {
            self.starts += 1;
        }

        fn send_stop(&mut self) {
            self.stops += 1;
        }

        fn send_ack(&mut self) {
            self.acks += 1;
        }

        fn send_nack(&mut self) {
            self.nacks += 1;
        }

        fn abort(&mut self) {
            self.aborts += 1;
        }

        fn write_byte(&mut self, byte: u8) {
            self.tx[self.tx_len] = byte;
            self.tx_len += 1;
        }

        fn read_byte(&mut self) -> u8 {
            let byte = self.rx[self.rx_pos];
            self.rx_pos += 1;
            byte
        }

        fn toggle_scl(&mut self) {
            self.scl_toggles += 1;
        }
    }

    #[test]
    fn open_configures_and_resets_the_bus() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let i2c = I2C::new(FakeBus::new(), Config::default(), &scheduler, &sleep);

        let bus = i2c.free();
        assert_eq!(bus.configured_hz, 100_000);
        assert_eq!(bus.scl_toggles, 18);
        assert_eq!(bus.aborts, 1);
    }

    #[test]
    fn write_transfer_walks_the_write_states() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut i2c = I2C::new(FakeBus::new(), Config::default(), &scheduler, &sleep);

        let transfer = Transfer::new(0x40, &[0xE6], Operation::Write(&[0x3A]), DONE).unwrap();
        i2c.start(transfer).unwrap();
        assert_eq!(i2c.state(), State::RequestDevice);
        assert_eq!(sleep.current_block(), EnergyMode::Em2);

        i2c.handle_event(Event::Ack).unwrap(); // address -> command byte
        assert_eq!(i2c.state(), State::WriteData);
        i2c.handle_event(Event::Ack).unwrap(); // command -> payload byte
        assert_eq!(i2c.state(), State::WriteData);
        i2c.handle_event(Event::Ack).unwrap(); // payload -> STOP
        assert_eq!(i2c.state(), State::Closing);
        i2c.handle_event(Event::Stop).unwrap();
        assert_eq!(i2c.state(), State::Idle);

        assert_eq!(scheduler.pending(), DONE);
        assert_eq!(sleep.current_block(), EnergyMode::Em4);

        let bus = i2c.free();
        assert_eq!(bus.tx(), &[0x40 << 1, 0xE6, 0x3A]);
        assert_eq!(bus.starts, 1);
        assert_eq!(bus.stops, 1);
        assert_eq!(bus.nacks, 0);
    }

    #[test]
    fn read_transfer_walks_the_read_states() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut buffer = [0u8; 2];
        let mut i2c = I2C::new(
            FakeBus::with_rx(&[0x66, 0x4C]),
            Config::default(),
            &scheduler,
            &sleep,
        );

        let transfer = Transfer::new(0x40, &[0xF3], Operation::Read(&mut buffer), DONE).unwrap();
        i2c.start(transfer).unwrap();
        assert_eq!(i2c.state(), State::RequestDevice);

        i2c.handle_event(Event::Ack).unwrap(); // address -> command byte
        assert_eq!(i2c.state(), State::WriteData);
        i2c.handle_event(Event::Ack).unwrap(); // command -> repeated START
        assert_eq!(i2c.state(), State::RequestData);
        i2c.handle_event(Event::Ack).unwrap(); // read address accepted
        assert_eq!(i2c.state(), State::ReadData);
        i2c.handle_event(Event::RxData).unwrap(); // first byte, acked
        assert_eq!(i2c.state(), State::ReadData);
        i2c.handle_event(Event::RxData).unwrap(); // last byte, nacked + STOP
        assert_eq!(i2c.state(), State::Closing);
        i2c.handle_event(Event::Stop).unwrap();
        assert_eq!(i2c.state(), State::Idle);

        assert_eq!(scheduler.pending(), DONE);
        assert_eq!(sleep.current_block(), EnergyMode::Em4);

        match i2c.finish() {
            Some(Operation::Read(data)) => assert_eq!(data, &[0x66, 0x4C]),
            other => panic!("expected the read buffer back, got {:?}", other),
        }

        let bus = i2c.free();
        assert_eq!(bus.tx(), &[0x40 << 1, 0xF3, (0x40 << 1) | 1]);
        assert_eq!(bus.starts, 2);
        assert_eq!(bus.stops, 1);
        assert_eq!(bus.acks, 1);
        assert_eq!(bus.nacks, 1);
    }

    #[test]
    fn two_byte_command_codes_are_sent_before_the_turnaround() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut buffer = [0u8; 1];
        let mut i2c = I2C::new(
            FakeBus::with_rx(&[0xA5]),
            Config::default(),
            &scheduler,
            &sleep,
        );

        let transfer =
            Transfer::new(0x40, &[0xFC, 0xC9], Operation::Read(&mut buffer), DONE).unwrap();
        i2c.start(transfer).unwrap();

        i2c.handle_event(Event::Ack).unwrap(); // address -> first command byte
        i2c.handle_event(Event::Ack).unwrap(); // -> second command byte
        assert_eq!(i2c.state(), State::WriteData);
        i2c.handle_event(Event::Ack).unwrap(); // -> repeated START
        assert_eq!(i2c.state(), State::RequestData);
        i2c.handle_event(Event::Ack).unwrap();
        i2c.handle_event(Event::RxData).unwrap();
        i2c.handle_event(Event::Stop).unwrap();
        assert_eq!(i2c.state(), State::Idle);

        let bus = i2c.free();
        assert_eq!(bus.tx(), &[0x40 << 1, 0xFC, 0xC9, (0x40 << 1) | 1]);
    }

    #[test]
    fn nacked_read_request_is_retried() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut buffer = [0u8; 1];
        let mut i2c = I2C::new(
            FakeBus::with_rx(&[0x11]),
            Config::default(),
            &scheduler,
            &sleep,
        );

        let transfer = Transfer::new(0x40, &[0xF3], Operation::Read(&mut buffer), DONE).unwrap();
        i2c.start(transfer).unwrap();
        i2c.handle_event(Event::Ack).unwrap();
        i2c.handle_event(Event::Ack).unwrap();
        assert_eq!(i2c.state(), State::RequestData);

        // conversion still running: the target nacks its read address
        i2c.handle_event(Event::Nack).unwrap();
        assert_eq!(i2c.state(), State::RequestData);
        i2c.handle_event(Event::Nack).unwrap();
        assert_eq!(i2c.state(), State::RequestData);

        // data ready now
        i2c.handle_event(Event::Ack).unwrap();
        assert_eq!(i2c.state(), State::ReadData);
        i2c.handle_event(Event::RxData).unwrap();
        i2c.handle_event(Event::Stop).unwrap();
        assert_eq!(i2c.state(), State::Idle);

        let bus = i2c.free();
        // one initial START, the turnaround, and one repeat per nack
        assert_eq!(bus.starts, 4);
        let addr_read = (0x40 << 1) | 1;
        assert_eq!(
            bus.tx(),
            &[0x40 << 1, 0xF3, addr_read, addr_read, addr_read]
        );
    }

    #[test]
    fn start_while_busy_is_rejected() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut i2c = I2C::new(FakeBus::new(), Config::default(), &scheduler, &sleep);

        let first = Transfer::new(0x40, &[0xF3], Operation::Write(&[0x00]), DONE).unwrap();
        i2c.start(first).unwrap();

        let second = Transfer::new(0x40, &[0xF5], Operation::Write(&[0x01]), DONE).unwrap();
        assert_eq!(i2c.start(second), Err(Error::Busy));
        assert_eq!(i2c.state(), State::RequestDevice);

        // the rejected start must not have touched the block count
        assert_eq!(sleep.current_block(), EnergyMode::Em2);
    }

    #[test]
    fn start_on_busy_hardware_is_rejected() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut bus = FakeBus::new();
        bus.idle = false;
        let mut i2c = I2C::new(bus, Config::default(), &scheduler, &sleep);
        assert!(!i2c.is_idle());

        let transfer = Transfer::new(0x40, &[0xF3], Operation::Write(&[0x00]), DONE).unwrap();
        assert_eq!(i2c.start(transfer), Err(Error::Busy));
        assert_eq!(sleep.current_block(), EnergyMode::Em4);
    }

    #[test]
    fn engine_is_reusable_after_completion() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut i2c = I2C::new(FakeBus::new(), Config::default(), &scheduler, &sleep);

        for _ in 0..2 {
            let transfer = Transfer::new(0x40, &[0xE6], Operation::Write(&[0x3A]), DONE).unwrap();
            i2c.start(transfer).unwrap();
            i2c.handle_event(Event::Ack).unwrap();
            i2c.handle_event(Event::Ack).unwrap();
            i2c.handle_event(Event::Ack).unwrap();
            i2c.handle_event(Event::Stop).unwrap();
            assert!(i2c.finish().is_some());

            assert_eq!(scheduler.pending(), DONE);
            scheduler.consume(DONE);
            assert_eq!(sleep.current_block(), EnergyMode::Em4);
        }
    }

    #[test]
    fn unexpected_events_are_surfaced_not_swallowed() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut i2c = I2C::new(FakeBus::new(), Config::default(), &scheduler, &sleep);

        assert_eq!(
            i2c.handle_event(Event::Ack),
            Err(Error::Spurious {
                state: State::Idle,
                event: Event::Ack,
            })
        );

        let transfer = Transfer::new(0x40, &[0xE6], Operation::Write(&[0x3A]), DONE).unwrap();
        i2c.start(transfer).unwrap();

        // an address nack means the target is absent or broken
        assert_eq!(
            i2c.handle_event(Event::Nack),
            Err(Error::Spurious {
                state: State::RequestDevice,
                event: Event::Nack,
            })
        );
        assert_eq!(i2c.state(), State::RequestDevice);

        i2c.handle_event(Event::Ack).unwrap();
        assert_eq!(
            i2c.handle_event(Event::RxData),
            Err(Error::Spurious {
                state: State::WriteData,
                event: Event::RxData,
            })
        );
    }

    #[test]
    fn finish_returns_nothing_while_in_flight() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut buffer = [0u8; 1];
        let mut i2c = I2C::new(
            FakeBus::with_rx(&[0x11]),
            Config::default(),
            &scheduler,
            &sleep,
        );

        let transfer = Transfer::new(0x40, &[0xF3], Operation::Read(&mut buffer), DONE).unwrap();
        i2c.start(transfer).unwrap();
        assert!(i2c.finish().is_none());
    }

    #[test]
    fn on_interrupt_dispatches_pending_causes() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut i2c = I2C::new(FakeBus::new(), Config::default(), &scheduler, &sleep);

        let transfer = Transfer::new(0x40, &[0xE6], Operation::Write(&[0x3A]), DONE).unwrap();
        i2c.start(transfer).unwrap();

        i2c.bus.pending = Events {
            ack: true,
            ..Events::NONE
        };
        i2c.on_interrupt().unwrap();
        assert_eq!(i2c.state(), State::WriteData);

        // nothing pending is a no-op
        i2c.on_interrupt().unwrap();
        assert_eq!(i2c.state(), State::WriteData);
    }

    #[test]
    fn bus_reset_toggles_scl_and_aborts() {
        let scheduler = Scheduler::new();
        let sleep = SleepController::new();
        let mut i2c = I2C::new(FakeBus::new(), Config::default(), &scheduler, &sleep);

        i2c.bus_reset();

        let bus = i2c.free();
        // once at open time, once by hand
        assert_eq!(bus.scl_toggles, 36);
        assert_eq!(bus.aborts, 2);
    }
}
