//! Motorized gate controller.
//!
//! The controller drives up to three relay outputs (open, close, stop) with
//! timed pulses and tracks the gate position from up to two inputs: a
//! `closed` end switch and a `moving` signal. Both inputs go through a
//! majority-vote debounce and an optional delay line compensating the lag
//! of one sensor relative to the other.
//!
//! With a single `moving` input the direction after a stop cannot be told
//! from the sensors, hence the `OpenedWillOpen` and `OpenedWillClose`
//! states: the gate is partially open and the next move goes the given way.

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use core::cell::RefCell;

use embedded_hal::digital::{InputPin, OutputPin, PinState};
use heapless::Deque;

use qport::attrdef::{AttrDef, AttrStorage};
use qport::error::Result;
use qport::layout::{Field, Width};
use qport::peripheral::{ParamBlock, PeripheralConfig, PeripheralDriver};
use qport::port::{Choice, Port, PortData, PortDriver, PortType, SlotCategory};

/// Debounce duration of the inputs, in milliseconds.
pub const DEBOUNCE: Field = Field::new(0, Width::U16);
/// Delay of the `moving` input relative to the `closed` input, in
/// milliseconds. Negative values delay the `closed` input instead.
pub const DELAY: Field = Field::new(2, Width::I16);
/// Duration of an output pulse, in milliseconds.
pub const PULSE_ON: Field = Field::new(4, Width::U16);
/// Pause after an output pulse, in milliseconds.
pub const PULSE_OFF: Field = Field::new(6, Width::U16);
/// Travel time between the end positions, in milliseconds. Zero when
/// unknown.
pub const TRAVEL: Field = Field::new(8, Width::U32);
/// Controller tick, in milliseconds.
pub const TICK: Field = Field::new(12, Width::U8);

const DEFAULT_TICK_MS: u32 = 20;
const DEFAULT_DEBOUNCE_MS: u32 = 100;
const DEFAULT_PULSE_MS: u32 = 500;

// Length of the input histories.
const HISTORY_LEN: u32 = u64::BITS;
const MAX_PULSES: usize = 8;

const ATTRDEFS: &[AttrDef] = &[
    AttrDef::number("debounce", AttrStorage::Param(DEBOUNCE))
        .display_name("Debounce")
        .description("Time an input must hold a level to be trusted.")
        .unit("ms")
        .max(1000.)
        .integer(),
    AttrDef::number("input_delay", AttrStorage::Param(DELAY))
        .display_name("Input delay")
        .description("Delay of the moving input, negative to delay the closed input.")
        .unit("ms")
        .min(-1000.)
        .max(1000.)
        .integer(),
    AttrDef::number("pulse_on", AttrStorage::Param(PULSE_ON))
        .display_name("Pulse duration")
        .unit("ms")
        .max(10_000.)
        .integer(),
    AttrDef::number("pulse_off", AttrStorage::Param(PULSE_OFF))
        .display_name("Pulse pause")
        .unit("ms")
        .max(10_000.)
        .integer(),
    AttrDef::number("travel", AttrStorage::Param(TRAVEL))
        .display_name("Travel time")
        .description("Time to go from one end to the other, 0 if unknown.")
        .unit("ms")
        .max(600_000.)
        .integer(),
];

/// Position of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Closed.
    Closed,
    /// Fully open.
    Opened,
    /// Opening.
    Opening,
    /// Closing.
    Closing,
    /// Partially open, the next move opens.
    OpenedWillOpen,
    /// Partially open, the next move closes.
    OpenedWillClose,
}

impl GateState {
    const ALL: [Self; 6] = [
        Self::Closed,
        Self::Opened,
        Self::Opening,
        Self::Closing,
        Self::OpenedWillOpen,
        Self::OpenedWillClose,
    ];

    /// Returns the port value of the state.
    #[must_use]
    pub const fn value(self) -> f64 {
        match self {
            Self::Closed => 0.,
            Self::Opened => 1.,
            Self::Opening => 2.,
            Self::Closing => 3.,
            Self::OpenedWillOpen => 4.,
            Self::OpenedWillClose => 5.,
        }
    }

    /// Returns the state of a port value.
    #[must_use]
    pub fn from_value(value: f64) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.value() == value)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Opened => "Opened",
            Self::Opening => "Opening",
            Self::Closing => "Closing",
            Self::OpenedWillOpen => "Opened, will open",
            Self::OpenedWillClose => "Opened, will close",
        }
    }
}

/// A relay activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start opening.
    Open,
    /// Start closing.
    Close,
    /// Stop moving.
    Stop,
}

/// Returns the pulses bringing the gate from `current` to `requested`.
///
/// Only [`GateState::Opened`] and [`GateState::Closed`] can be requested.
#[must_use]
pub const fn commands(current: GateState, requested: GateState) -> &'static [Command] {
    use Command::{Close, Open, Stop};
    use GateState::{Closed, Closing, Opened, OpenedWillClose, OpenedWillOpen, Opening};

    match (requested, current) {
        (Opened, Closed | OpenedWillOpen) => &[Open],
        (Opened, Closing) => &[Stop, Open],
        (Opened, OpenedWillClose) => &[Close, Stop, Open],
        (Closed, Opening) => &[Stop, Close],
        (Closed, Opened | OpenedWillClose) => &[Close],
        (Closed, OpenedWillOpen) => &[Open, Stop, Close],
        _ => &[],
    }
}

/// Majority vote over the last `len` samples of a history, the most recent
/// sample in the least significant bit.
#[must_use]
pub fn majority(history: u64, len: u8) -> bool {
    let len = u32::from(len).clamp(1, HISTORY_LEN);
    let window = history & (u64::MAX >> (HISTORY_LEN - len));
    window.count_ones() * 10 / len > 5
}

/// Timings of the controller, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Tick length in milliseconds.
    pub tick_ms: u32,
    /// Number of samples of the debounce vote.
    pub debounce: u8,
    /// Delay of the `moving` input, negative to delay the `closed` input.
    pub delay: i8,
    /// Pulse duration.
    pub pulse_on: u32,
    /// Pause after a pulse.
    pub pulse_off: u32,
    /// Travel time, `0` when unknown.
    pub travel: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_params(&ParamBlock::new())
    }
}

impl Timing {
    /// Converts a parameter block, unset durations taking their default.
    #[must_use]
    pub fn from_params(params: &ParamBlock) -> Self {
        let ms = |field: Field, default: u32| match params.get(field) as u32 {
            0 => default,
            value => value,
        };

        let tick_ms = ms(TICK, DEFAULT_TICK_MS);
        let ticks = |value: u32| value.div_ceil(tick_ms);
        let max_delay = (HISTORY_LEN - 1) as i32;

        Self {
            tick_ms,
            debounce: ticks(ms(DEBOUNCE, DEFAULT_DEBOUNCE_MS)).clamp(1, HISTORY_LEN) as u8,
            delay: (params.get(DELAY) as i32 / tick_ms as i32).clamp(-max_delay, max_delay) as i8,
            pulse_on: ticks(ms(PULSE_ON, DEFAULT_PULSE_MS)).max(1),
            pulse_off: ticks(ms(PULSE_OFF, DEFAULT_PULSE_MS)),
            travel: ticks(params.get(TRAVEL) as u32),
        }
    }
}

/// A change of a relay output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// The relay of the command must be energized.
    On(Command),
    /// The relay of the command must be released.
    Off(Command),
}

// A debounced and delayed input.
#[derive(Debug, Clone, Copy, Default)]
struct Input {
    samples: u64,
    debounced: u64,
    level: bool,
}

impl Input {
    // Returns the new level on an edge.
    fn sample(&mut self, raw: bool, debounce: u8, delay: u8) -> Option<bool> {
        self.samples = (self.samples << 1) | u64::from(raw);
        self.debounced = (self.debounced << 1) | u64::from(majority(self.samples, debounce));

        let level = (self.debounced >> delay) & 1 != 0;
        if level == self.level {
            return None;
        }
        self.level = level;
        Some(level)
    }
}

#[derive(Debug, Clone, Copy)]
struct Pulse {
    command: Command,
    on: bool,
    remaining: u32,
}

/// The gate state machine, independent of the hardware.
///
/// It advances by one tick on every [`GateMachine::step`].
#[derive(Debug)]
pub struct GateMachine {
    timing: Timing,
    state: GateState,
    closed: Option<Input>,
    moving: Option<Input>,
    queue: Deque<Command, MAX_PULSES>,
    pulse: Option<Pulse>,
    travel_left: u32,
    // A stop pulse was issued during the current move.
    stopped: bool,
}

impl GateMachine {
    /// Creates a [`GateMachine`] for a closed gate, with the given inputs
    /// wired.
    #[must_use]
    pub fn new(timing: Timing, has_closed: bool, has_moving: bool) -> Self {
        Self {
            timing,
            state: GateState::Closed,
            closed: has_closed.then(Input::default),
            moving: has_moving.then(Input::default),
            queue: Deque::new(),
            pulse: None,
            travel_left: 0,
            stopped: false,
        }
    }

    /// Replaces the timings, keeping the state.
    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    /// Returns the timings.
    #[must_use]
    pub const fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Returns the state.
    #[must_use]
    pub const fn state(&self) -> GateState {
        self.state
    }

    /// Returns the queued commands.
    pub fn pending(&self) -> impl Iterator<Item = Command> + '_ {
        self.queue.iter().copied()
    }

    /// Queues the pulses bringing the gate to the requested state,
    /// replacing any pending ones.
    ///
    /// Returns `false` if the state cannot be requested.
    pub fn request(&mut self, requested: GateState) -> bool {
        if !matches!(requested, GateState::Opened | GateState::Closed) {
            return false;
        }

        self.queue.clear();
        for command in commands(self.state, requested) {
            // The longest command list fits in the queue.
            let _ = self.queue.push_back(*command);
        }

        log::debug!(
            "Gate {:?} -> {requested:?}: {} pulses",
            self.state,
            self.queue.len()
        );
        true
    }

    /// Drops the pending pulses and interrupts the active one.
    ///
    /// Returns the output to release, if any.
    pub fn cancel(&mut self) -> Option<Output> {
        self.queue.clear();
        let pulse = self.pulse.take()?;
        pulse.on.then_some(Output::Off(pulse.command))
    }

    /// Advances by one tick with the raw input levels, `None` for an input
    /// that is not wired or could not be read.
    ///
    /// Returns the output change to apply, if any.
    pub fn step(&mut self, closed: Option<bool>, moving: Option<bool>) -> Option<Output> {
        self.update_inputs(closed, moving);
        self.settle();
        self.advance_pulses()
    }

    fn update_inputs(&mut self, closed: Option<bool>, moving: Option<bool>) {
        let Timing {
            debounce, delay, ..
        } = self.timing;
        let (closed_delay, moving_delay) = if delay >= 0 {
            (0, delay.unsigned_abs())
        } else {
            (delay.unsigned_abs(), 0)
        };

        let closed_edge = match (self.closed.as_mut(), closed) {
            (Some(input), Some(raw)) => input.sample(raw, debounce, closed_delay),
            _ => None,
        };
        let moving_edge = match (self.moving.as_mut(), moving) {
            (Some(input), Some(raw)) => input.sample(raw, debounce, moving_delay),
            _ => None,
        };

        // The end switch is more trustworthy than the motion sensor.
        if let Some(closed) = closed_edge {
            self.enter(if closed {
                GateState::Closed
            } else {
                GateState::Opening
            });
            return;
        }

        if let Some(moving) = moving_edge {
            let state = match (moving, self.state) {
                (true, GateState::Closed | GateState::OpenedWillOpen) => GateState::Opening,
                (true, GateState::Opened | GateState::OpenedWillClose) => GateState::Closing,
                (false, GateState::Opening) => GateState::OpenedWillClose,
                (false, GateState::Closing) if self.closed.is_none() && !self.stopped => {
                    GateState::Closed
                }
                (false, GateState::Closing) => GateState::OpenedWillOpen,
                (_, state) => state,
            };
            self.enter(state);
        }
    }

    fn enter(&mut self, state: GateState) {
        if state == self.state {
            return;
        }

        if matches!(state, GateState::Opening | GateState::Closing) {
            self.stopped = false;
        }

        // Without a moving input only the travel time ends a move.
        self.travel_left = match state {
            GateState::Opening | GateState::Closing if self.moving.is_none() => self.timing.travel,
            _ => 0,
        };

        log::debug!("Gate {:?} -> {state:?}", self.state);
        self.state = state;
    }

    fn settle(&mut self) {
        if self.travel_left == 0 {
            return;
        }

        self.travel_left -= 1;
        if self.travel_left == 0 {
            match self.state {
                GateState::Opening => self.enter(GateState::Opened),
                GateState::Closing => self.enter(GateState::Closed),
                _ => {}
            }
        }
    }

    fn advance_pulses(&mut self) -> Option<Output> {
        if let Some(pulse) = self.pulse.as_mut() {
            pulse.remaining = pulse.remaining.saturating_sub(1);
            if pulse.remaining > 0 {
                return None;
            }

            if pulse.on {
                let command = pulse.command;
                pulse.on = false;
                pulse.remaining = self.timing.pulse_off;
                if pulse.remaining == 0 {
                    self.pulse = None;
                }
                return Some(Output::Off(command));
            }

            self.pulse = None;
        }

        let command = self.queue.pop_front()?;
        self.pulse = Some(Pulse {
            command,
            on: true,
            remaining: self.timing.pulse_on,
        });
        self.on_command(command);
        Some(Output::On(command))
    }

    fn on_command(&mut self, command: Command) {
        if command == Command::Stop
            && matches!(self.state, GateState::Opening | GateState::Closing)
        {
            self.stopped = true;
        }

        // A moving input reports the effect of the pulse itself.
        if self.moving.is_some() {
            return;
        }

        let travel_known = self.timing.travel > 0;
        let state = match (command, self.state) {
            (Command::Open, _) if travel_known => GateState::Opening,
            (Command::Open, _) => GateState::Opened,
            (Command::Close, _) if travel_known || self.closed.is_some() => GateState::Closing,
            (Command::Close, _) => GateState::Closed,
            (Command::Stop, GateState::Opening) => GateState::OpenedWillClose,
            (Command::Stop, GateState::Closing) => GateState::OpenedWillOpen,
            (Command::Stop, state) => state,
        };
        self.enter(state);
    }
}

/// The pins of a gate controller.
pub struct GatePins<I: InputPin, O: OutputPin> {
    /// The end switch, high when the gate is closed.
    pub closed: Option<I>,
    /// High while the gate moves.
    pub moving: Option<I>,
    /// The open relay.
    pub open: O,
    /// The close relay.
    pub close: O,
    /// The stop relay.
    pub stop: Option<O>,
}

struct Controller<I: InputPin, O: OutputPin> {
    pins: GatePins<I, O>,
    machine: GateMachine,
}

impl<I: InputPin, O: OutputPin> Controller<I, O> {
    fn step(&mut self) {
        let closed = sample(self.pins.closed.as_mut());
        let moving = sample(self.pins.moving.as_mut());

        if let Some(output) = self.machine.step(closed, moving) {
            self.apply(output);
        }
    }

    fn apply(&mut self, output: Output) {
        let (command, state) = match output {
            Output::On(command) => (command, PinState::High),
            Output::Off(command) => (command, PinState::Low),
        };

        let pin = match command {
            Command::Open => Some(&mut self.pins.open),
            Command::Close => Some(&mut self.pins.close),
            Command::Stop => self.pins.stop.as_mut(),
        };

        match pin.map(|pin| pin.set_state(state)) {
            Some(Ok(())) => {}
            Some(Err(e)) => log::debug!("Gate output {command:?}: {e:?}"),
            None => log::debug!("Gate has no {command:?} output"),
        }
    }

    fn release(&mut self) {
        let _ = self.machine.cancel();
        for pin in [Some(&mut self.pins.open), Some(&mut self.pins.close), self.pins.stop.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = pin.set_low() {
                log::debug!("Gate output: {e:?}");
            }
        }
    }
}

fn sample<I: InputPin>(pin: Option<&mut I>) -> Option<bool> {
    match pin?.is_high() {
        Ok(level) => Some(level),
        Err(e) => {
            log::debug!("Gate input: {e:?}");
            None
        }
    }
}

type Shared<I, O> = Rc<RefCell<Controller<I, O>>>;

/// The gate controller peripheral, exposing a single `gate` port.
///
/// The port reads the [`GateState`] and accepts [`GateState::Opened`] or
/// [`GateState::Closed`] as requests.
pub struct Gate<I: InputPin, O: OutputPin> {
    controller: Shared<I, O>,
    id: &'static str,
}

impl<I: InputPin, O: OutputPin> Gate<I, O> {
    /// Creates a [`Gate`] controller on the given pins.
    #[must_use]
    pub fn new(pins: GatePins<I, O>) -> Self {
        let machine = GateMachine::new(
            Timing::default(),
            pins.closed.is_some(),
            pins.moving.is_some(),
        );

        Self {
            controller: Rc::new(RefCell::new(Controller { pins, machine })),
            id: "gate",
        }
    }

    /// Sets the port identifier.
    #[must_use]
    pub fn id(mut self, id: &'static str) -> Self {
        self.id = id;
        self
    }
}

impl<I: InputPin + 'static, O: OutputPin + 'static> PeripheralDriver for Gate<I, O> {
    fn init(&mut self, config: &PeripheralConfig) -> Result<()> {
        let timing = Timing::from_params(&config.params);
        log::info!("Gate controller ticking every {} ms", timing.tick_ms);
        self.controller.borrow_mut().machine.set_timing(timing);
        Ok(())
    }

    fn make_ports(&mut self, _config: &PeripheralConfig) -> Result<Vec<Port>> {
        let tick_ms = self.controller.borrow().machine.timing().tick_ms;
        let choices = GateState::ALL
            .into_iter()
            .map(|state| Choice::new(state.value(), state.name()))
            .collect();

        Ok(vec![
            Port::new(self.id, PortType::Number, GatePort(self.controller.clone()))
                .category(SlotCategory::Extra)
                .display_name("Gate")
                .choices(choices)
                .writable()
                .heart_beat(tick_ms)
                .sampling(100, 20, 60_000),
        ])
    }

    fn cleanup(&mut self) {
        let _ = self.controller.borrow_mut().machine.cancel();
    }
}

struct GatePort<I: InputPin, O: OutputPin>(Shared<I, O>);

impl<I: InputPin, O: OutputPin> PortDriver for GatePort<I, O> {
    fn read_value(&mut self, _port: &PortData, _now_ms: u64) -> f64 {
        self.0.borrow().machine.state().value()
    }

    fn write_value(&mut self, _port: &PortData, value: f64, _now_ms: u64) -> bool {
        GateState::from_value(value)
            .is_some_and(|requested| self.0.borrow_mut().machine.request(requested))
    }

    fn configure(&mut self, _port: &PortData, enabled: bool) {
        if !enabled {
            self.0.borrow_mut().release();
        }
    }

    fn heart_beat(&mut self, _port: &PortData, _now_ms: u64) {
        self.0.borrow_mut().step();
    }

    fn attrdefs(&self) -> &'static [AttrDef] {
        ATTRDEFS
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction as PinTransaction};

    use qport::attrdef::AttrValue;
    use qport::peripheral::{ParamBlock, PeripheralConfig, PeripheralTypes};
    use qport::{Device, ErrorKind, Settings};

    use crate::GATE;

    use super::{
        Command, Gate, GateMachine, GatePins, GateState, Output, PULSE_OFF, PULSE_ON, TICK,
        TRAVEL, Timing, commands, majority,
    };

    const fn timing(debounce: u8, delay: i8) -> Timing {
        Timing {
            tick_ms: 20,
            debounce,
            delay,
            pulse_on: 1,
            pulse_off: 1,
            travel: 0,
        }
    }

    fn pending(machine: &GateMachine) -> Vec<Command> {
        machine.pending().collect()
    }

    #[test]
    fn test_majority() {
        // 6 of the last 10 samples.
        assert!(majority(0b11_1011_0100, 10));
        // 4 of the last 10 samples.
        assert!(!majority(0b00_0011_0101, 10));
        // Older samples are ignored.
        assert!(!majority(0b1111_0000_0000_0000, 10));
        // Exactly half is not a majority.
        assert!(!majority(0b1010, 4));
        assert!(majority(u64::MAX, 64));
        assert!(majority(1, 1));
    }

    #[test]
    fn test_command_table() {
        use Command::{Close, Open, Stop};
        use GateState::{Closed, Closing, Opened, OpenedWillClose, OpenedWillOpen, Opening};

        assert_eq!(commands(Closed, Opened), [Open]);
        assert_eq!(commands(Closing, Opened), [Stop, Open]);
        assert!(commands(Opening, Opened).is_empty());
        assert!(commands(Opened, Opened).is_empty());
        assert_eq!(commands(OpenedWillOpen, Opened), [Open]);
        assert_eq!(commands(OpenedWillClose, Opened), [Close, Stop, Open]);

        assert!(commands(Closed, Closed).is_empty());
        assert!(commands(Closing, Closed).is_empty());
        assert_eq!(commands(Opening, Closed), [Stop, Close]);
        assert_eq!(commands(Opened, Closed), [Close]);
        assert_eq!(commands(OpenedWillOpen, Closed), [Open, Stop, Close]);
        assert_eq!(commands(OpenedWillClose, Closed), [Close]);

        assert!(commands(Closed, Opening).is_empty());
    }

    #[test]
    fn test_moving_input_only() {
        let mut machine = GateMachine::new(timing(1, 0), false, true);

        assert_eq!(machine.step(None, Some(true)), None);
        assert_eq!(machine.state(), GateState::Opening);

        // No closed input: the direction after stopping is unknown.
        assert_eq!(machine.step(None, Some(false)), None);
        assert_eq!(machine.state(), GateState::OpenedWillClose);

        let _ = machine.step(None, Some(true));
        assert_eq!(machine.state(), GateState::Closing);

        // Stopped while closing: the gate is left partially open.
        assert!(machine.request(GateState::Opened));
        assert_eq!(pending(&machine), [Command::Stop, Command::Open]);
        assert_eq!(
            machine.step(None, Some(true)),
            Some(Output::On(Command::Stop))
        );
        assert_eq!(
            machine.step(None, Some(false)),
            Some(Output::Off(Command::Stop))
        );
        assert_eq!(machine.state(), GateState::OpenedWillOpen);

        // The next pulse follows the pause.
        assert_eq!(
            machine.step(None, Some(false)),
            Some(Output::On(Command::Open))
        );
        let _ = machine.step(None, Some(true));
        assert_eq!(machine.state(), GateState::Opening);
    }

    #[test]
    fn test_closing_ends_closed_without_stop() {
        let mut machine = GateMachine::new(timing(1, 0), false, true);
        machine.state = GateState::Opened;

        let _ = machine.step(None, Some(true));
        assert_eq!(machine.state(), GateState::Closing);
        let _ = machine.step(None, Some(false));
        assert_eq!(machine.state(), GateState::Closed);
    }

    #[test]
    fn test_reversal_from_partially_open() {
        let mut machine = GateMachine::new(timing(1, 0), false, true);
        machine.state = GateState::OpenedWillOpen;

        assert!(machine.request(GateState::Closed));
        assert_eq!(
            pending(&machine),
            [Command::Open, Command::Stop, Command::Close]
        );

        assert!(!machine.request(GateState::Opening));
    }

    #[test]
    fn test_closed_input_wins() {
        let mut machine = GateMachine::new(timing(1, 0), true, true);
        machine.state = GateState::Opened;

        let _ = machine.step(Some(true), Some(true));
        assert_eq!(machine.state(), GateState::Closed);

        // Without the end switch the same motion means closing.
        let mut machine = GateMachine::new(timing(1, 0), false, true);
        machine.state = GateState::Opened;
        let _ = machine.step(None, Some(true));
        assert_eq!(machine.state(), GateState::Closing);
    }

    #[test]
    fn test_closed_input_falling() {
        let mut machine = GateMachine::new(timing(1, 0), true, false);

        let _ = machine.step(Some(true), None);
        assert_eq!(machine.state(), GateState::Closed);
        let _ = machine.step(Some(false), None);
        assert_eq!(machine.state(), GateState::Opening);
    }

    #[test]
    fn test_debounce() {
        let mut machine = GateMachine::new(timing(3, 0), false, true);

        // A single sample out of three is a glitch.
        let _ = machine.step(None, Some(true));
        let _ = machine.step(None, Some(false));
        let _ = machine.step(None, Some(false));
        assert_eq!(machine.state(), GateState::Closed);

        let _ = machine.step(None, Some(true));
        assert_eq!(machine.state(), GateState::Closed);
        let _ = machine.step(None, Some(true));
        assert_eq!(machine.state(), GateState::Opening);
    }

    #[test]
    fn test_delay_line() {
        let mut machine = GateMachine::new(timing(1, 2), true, true);

        // The moving edge shows up two ticks late.
        let _ = machine.step(Some(false), Some(true));
        let _ = machine.step(Some(false), Some(true));
        assert_eq!(machine.state(), GateState::Closed);
        let _ = machine.step(Some(false), Some(true));
        assert_eq!(machine.state(), GateState::Opening);
    }

    #[test]
    fn test_pulses_and_travel() {
        let mut machine = GateMachine::new(
            Timing {
                pulse_on: 2,
                travel: 3,
                ..timing(1, 0)
            },
            false,
            false,
        );

        assert!(machine.request(GateState::Opened));
        assert_eq!(machine.step(None, None), Some(Output::On(Command::Open)));
        assert_eq!(machine.state(), GateState::Opening);
        assert_eq!(machine.step(None, None), None);
        assert_eq!(machine.step(None, None), Some(Output::Off(Command::Open)));
        assert_eq!(machine.state(), GateState::Opening);
        assert_eq!(machine.step(None, None), None);
        assert_eq!(machine.state(), GateState::Opened);

        // A stop while moving leaves the gate partially open.
        assert!(machine.request(GateState::Closed));
        assert_eq!(machine.step(None, None), Some(Output::On(Command::Close)));
        assert_eq!(machine.state(), GateState::Closing);
        assert_eq!(machine.cancel(), Some(Output::Off(Command::Close)));
        assert!(machine.request(GateState::Opened));
        assert_eq!(pending(&machine), [Command::Stop, Command::Open]);
        assert_eq!(machine.step(None, None), Some(Output::On(Command::Stop)));
        assert_eq!(machine.state(), GateState::OpenedWillOpen);
    }

    #[test]
    fn test_timing_from_params() {
        let params = ParamBlock::new()
            .with(TICK, 10.)
            .and_then(|p| p.with(PULSE_ON, 250.))
            .and_then(|p| p.with(TRAVEL, 15_000.))
            .unwrap();
        let timing = Timing::from_params(&params);

        assert_eq!(timing.tick_ms, 10);
        assert_eq!(timing.debounce, 10);
        assert_eq!(timing.delay, 0);
        assert_eq!(timing.pulse_on, 25);
        assert_eq!(timing.pulse_off, 50);
        assert_eq!(timing.travel, 1500);
    }

    #[test]
    fn test_gate_peripheral() {
        let mut open = PinMock::new(&[
            PinTransaction::set(State::High),
            PinTransaction::set(State::Low),
            // Released on removal.
            PinTransaction::set(State::Low),
        ]);
        let mut close = PinMock::new(&[PinTransaction::set(State::Low)]);

        let mut pins = Some(GatePins::<PinMock, PinMock> {
            closed: None,
            moving: None,
            open: open.clone(),
            close: close.clone(),
            stop: None,
        });
        let types = PeripheralTypes::new().with(GATE, "gate", move |_| {
            let pins = pins.take().ok_or_else(|| {
                qport::Error::new(ErrorKind::UnknownPeripheralType, "pins in use")
            })?;
            Ok(Box::new(Gate::new(pins)))
        });

        let mut device = Device::new(Settings::new()).peripheral_types(types);
        let params = ParamBlock::new()
            .with(TICK, 20.)
            .and_then(|p| p.with(PULSE_ON, 40.))
            .and_then(|p| p.with(PULSE_OFF, 20.))
            .and_then(|p| p.with(TRAVEL, 60.))
            .unwrap();
        let index = device
            .add_peripheral(PeripheralConfig::new(GATE, params))
            .unwrap();

        assert_eq!(
            device.get_port_attr("gate", "travel").unwrap(),
            AttrValue::Number(60.)
        );

        let err = device
            .write_port_value("gate", GateState::Opening.value(), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WriteFailed);

        device
            .write_port_value("gate", GateState::Opened.value(), 0)
            .unwrap();
        for now in (20..=100).step_by(20) {
            device.tick(now);
        }
        assert_eq!(device.port("gate").unwrap().value(), GateState::Opened.value());

        device.remove_peripheral(index).unwrap();

        open.done();
        close.done();
    }
}
