// src/hardware/io.rs
//
// The fixed set of IO drivers polled from every idle cycle: fan, hotend,
// heated bed and endstops. Each driver owns its pin and pushes its output
// through the scheduler's PWM set; the motion core only ever sees the
// published endstop flags and the temperature readings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::scheduler::SchedulerState;

use super::temperature::{PidController, SimulatedThermistor};
use super::PinId;

/// How often a heater recomputes its PID output.
const HEATER_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum IoDriver {
    Fan(FanDriver),
    Hotend(HeaterDriver),
    Bed(HeaterDriver),
    Endstop(EndstopDriver),
}

impl IoDriver {
    /// Service the driver. Returns true if it wants another cycle soon.
    pub fn poll(&mut self, sched: &mut SchedulerState, now: Instant) -> bool {
        match self {
            IoDriver::Fan(f) => f.poll(sched, now),
            IoDriver::Hotend(h) | IoDriver::Bed(h) => h.poll(sched, now),
            IoDriver::Endstop(e) => e.poll(),
        }
    }
}

/// Fan on a PWM pin. The duty is pushed to the scheduler lazily so M106
/// handling stays allocation- and hardware-free.
#[derive(Debug)]
pub struct FanDriver {
    pin: PinId,
    period: Duration,
    duty: f64,
    dirty: bool,
}

impl FanDriver {
    pub fn new(pin: PinId, period: Duration) -> Self {
        Self { pin, period, duty: 0.0, dirty: false }
    }

    pub fn set_duty(&mut self, duty: f64) {
        self.duty = duty.clamp(0.0, 1.0);
        self.dirty = true;
    }

    fn poll(&mut self, sched: &mut SchedulerState, now: Instant) -> bool {
        if self.dirty {
            self.dirty = false;
            sched.sched_pwm(self.pin, self.duty, self.period, now);
        }
        false
    }
}

/// Heater with a PID loop and (simulated) thermistor feedback.
#[derive(Debug)]
pub struct HeaterDriver {
    pin: PinId,
    period: Duration,
    pid: PidController,
    sensor: SimulatedThermistor,
    current: f64,
    duty: f64,
    last_update: Option<Instant>,
}

impl HeaterDriver {
    pub fn new(pin: PinId, period: Duration, pid: PidController) -> Self {
        Self {
            pin,
            period,
            pid,
            sensor: SimulatedThermistor::new(),
            current: 0.0,
            duty: 0.0,
            last_update: None,
        }
    }

    pub fn set_target(&mut self, target: f64) {
        self.pid.set_target(target);
    }

    pub fn target(&self) -> f64 {
        self.pid.target()
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    fn poll(&mut self, sched: &mut SchedulerState, now: Instant) -> bool {
        if let Some(last) = self.last_update {
            if now < last + HEATER_UPDATE_INTERVAL {
                return false;
            }
        }
        self.last_update = Some(now);
        self.current = self.sensor.read(now, self.duty);
        self.duty = self.pid.compute(now, self.current);
        sched.sched_pwm(self.pin, self.duty, self.period, now);
        false
    }
}

/// Bridges a raw endstop input to the flag the homing steppers read.
#[derive(Debug)]
pub struct EndstopDriver {
    input: Arc<AtomicBool>,
    published: Arc<AtomicBool>,
}

impl EndstopDriver {
    pub fn new(input: Arc<AtomicBool>) -> Self {
        Self { input, published: Arc::new(AtomicBool::new(false)) }
    }

    /// The flag handed to the coordinate map's homing steppers.
    pub fn state(&self) -> Arc<AtomicBool> {
        self.published.clone()
    }

    fn poll(&mut self) -> bool {
        self.published.store(self.input.load(Ordering::Relaxed), Ordering::Relaxed);
        false
    }
}

/// Poll every driver; true if any wants more CPU.
pub fn poll_all(drivers: &mut [IoDriver], sched: &mut SchedulerState, now: Instant) -> bool {
    let mut wants_more = false;
    for d in drivers.iter_mut() {
        wants_more |= d.poll(sched, now);
    }
    wants_more
}

pub fn set_fan_duty(drivers: &mut [IoDriver], duty: f64) {
    for d in drivers.iter_mut() {
        if let IoDriver::Fan(f) = d {
            f.set_duty(duty);
        }
    }
}

pub fn set_hotend_target(drivers: &mut [IoDriver], target: f64) {
    for d in drivers.iter_mut() {
        if let IoDriver::Hotend(h) = d {
            h.set_target(target);
        }
    }
}

pub fn set_bed_target(drivers: &mut [IoDriver], target: f64) {
    for d in drivers.iter_mut() {
        if let IoDriver::Bed(h) = d {
            h.set_target(target);
        }
    }
}

/// (current, target) of the first hotend.
pub fn hotend_temps(drivers: &[IoDriver]) -> (f64, f64) {
    for d in drivers {
        if let IoDriver::Hotend(h) = d {
            return (h.current(), h.target());
        }
    }
    (0.0, 0.0)
}

/// (current, target) of the heated bed.
pub fn bed_temps(drivers: &[IoDriver]) -> (f64, f64) {
    for d in drivers {
        if let IoDriver::Bed(h) = d {
            return (h.current(), h.target());
        }
    }
    (0.0, 0.0)
}
