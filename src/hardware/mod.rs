// src/hardware/mod.rs
// Declare the submodules within the `hardware` module
pub mod io;
pub mod temperature;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("unknown pin '{0}'")]
    UnknownPin(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Direction of a single motor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Backward,
}

impl StepDirection {
    pub fn signed(self) -> i32 {
        match self {
            StepDirection::Forward => 1,
            StepDirection::Backward => -1,
        }
    }
}

/// Handle for an output pin. Names from the config are interned into these
/// by the `PinMap` so events stay Copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId(pub u16);

#[derive(Debug, Default)]
pub struct PinMap {
    names: Vec<String>,
}

impl PinMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> PinId {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return PinId(idx as u16);
        }
        self.names.push(name.to_string());
        PinId((self.names.len() - 1) as u16)
    }

    pub fn name(&self, pin: PinId) -> &str {
        &self.names[pin.0 as usize]
    }
}

/// A single scheduled hardware action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputEvent {
    pub time: Instant,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    Step { axis: usize, direction: StepDirection },
    SetPin { pin: PinId, level: bool },
    /// M17/M18/M84 stepper current control.
    MotorPower { on: bool },
}

impl OutputEvent {
    pub fn step(time: Instant, axis: usize, direction: StepDirection) -> Self {
        Self { time, kind: EventKind::Step { axis, direction } }
    }

    pub fn set_pin(time: Instant, pin: PinId, level: bool) -> Self {
        Self { time, kind: EventKind::SetPin { pin, level } }
    }

    pub fn motor_power(time: Instant, on: bool) -> Self {
        Self { time, kind: EventKind::MotorPower { on } }
    }
}

/// The sink for scheduled events. Register pokes (GPIO, DMA) live behind
/// this boundary; the motion core never touches hardware directly.
pub trait HardwareBackend {
    fn emit(&mut self, event: &OutputEvent);
}

/// Backend that only logs. Useful for dry runs of a G-code file.
#[derive(Debug, Default)]
pub struct NullBackend;

impl HardwareBackend for NullBackend {
    fn emit(&mut self, event: &OutputEvent) {
        tracing::trace!("emit {:?}", event.kind);
    }
}

/// Simulated machine backend: tracks per-axis step counts, raises endstop
/// flags when a homing axis has travelled far enough, and records every
/// event so tests can assert on the emitted stream.
#[derive(Debug, Clone)]
pub struct SimBackend {
    inner: Arc<Mutex<SimMachine>>,
}

#[derive(Debug)]
struct SimMachine {
    events: Vec<OutputEvent>,
    step_counts: [i64; 4],
    motors_enabled: bool,
    endstops: Vec<SimEndstop>,
}

#[derive(Debug)]
struct SimEndstop {
    axis: usize,
    /// Sign of travel that approaches the switch.
    direction: i32,
    /// Steps of travel from the current position until the switch closes.
    steps_to_trigger: i64,
    travelled: i64,
    flag: Arc<AtomicBool>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimMachine {
                events: Vec::new(),
                step_counts: [0; 4],
                motors_enabled: false,
                endstops: Vec::new(),
            })),
        }
    }

    /// Install a simulated endstop on `axis` that closes after
    /// `steps_to_trigger` steps of travel in `direction`.
    pub fn add_endstop(&self, axis: usize, direction: i32, steps_to_trigger: i64) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.inner.lock().unwrap().endstops.push(SimEndstop {
            axis,
            direction,
            steps_to_trigger,
            travelled: 0,
            flag: flag.clone(),
        });
        flag
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn step_counts(&self) -> [i64; 4] {
        self.inner.lock().unwrap().step_counts
    }

    pub fn motors_enabled(&self) -> bool {
        self.inner.lock().unwrap().motors_enabled
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBackend for SimBackend {
    fn emit(&mut self, event: &OutputEvent) {
        let mut machine = self.inner.lock().unwrap();
        match event.kind {
            EventKind::Step { axis, direction } => {
                machine.step_counts[axis] += direction.signed() as i64;
                for stop in &mut machine.endstops {
                    if stop.axis == axis {
                        stop.travelled += (direction.signed() * stop.direction) as i64;
                        if stop.travelled >= stop.steps_to_trigger {
                            stop.flag.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
            EventKind::MotorPower { on } => machine.motors_enabled = on,
            EventKind::SetPin { .. } => {}
        }
        machine.events.push(*event);
    }
}
