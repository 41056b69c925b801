// src/scheduler/mod.rs
//
// Real-time dispatcher. Holds scheduled output events in a bounded
// deadline-ordered queue plus a set of self-rescheduling PWM channels,
// sleeps until each deadline, and emits through the hardware backend. All
// other work in the process happens inside the on_idle_cpu fan-out, which
// runs whenever the loop has slack; producers watch `has_room()` for
// back-pressure.

pub mod clock;

pub use clock::{Clock, SimClock, SystemClock};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::config::SchedulerConfig;
use crate::hardware::{HardwareBackend, OutputEvent, PinId};

/// Deadlines closer than this are committed to: no more idle callbacks,
/// just the final wait.
const SHORT_THRESHOLD: Duration = Duration::from_micros(500);

/// How much CPU an idle callback may assume it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleInterval {
    /// Squeezed in just before a deadline; keep it quick.
    Short,
    /// Queue is empty; host IO and other slow work is welcome.
    Wide,
}

/// Fan-out hook the event loop calls whenever it has spare time. Returns
/// true if the handler still wants CPU.
pub trait IdleHandler {
    fn on_idle_cpu(&mut self, interval: IdleInterval, sched: &mut SchedulerState, now: Instant)
        -> bool;
}

#[derive(Debug)]
struct QueuedEvent {
    event: OutputEvent,
    seq: u64,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for QueuedEvent {}
impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline wins,
        // with the insertion sequence breaking ties.
        (other.event.time, other.seq).cmp(&(self.event.time, self.seq))
    }
}

/// Periodic output channel realized as a pair of self-rescheduling edges.
#[derive(Debug)]
struct PwmChannel {
    pin: PinId,
    duty: f64,
    period: Duration,
    next_edge: Instant,
    level: bool,
}

/// The part of the scheduler idle handlers are allowed to touch: the event
/// queue, the PWM set and the tunables.
#[derive(Debug)]
pub struct SchedulerState {
    queue: BinaryHeap<QueuedEvent>,
    seq: u64,
    buffer_size: usize,
    default_buffer_size: usize,
    max_sleep: Duration,
    default_max_sleep: Duration,
    pwm: Vec<PwmChannel>,
    exit_requested: bool,
}

impl SchedulerState {
    #[cfg(test)]
    pub(crate) fn for_tests(config: &SchedulerConfig) -> Self {
        Self::new(config)
    }

    fn new(config: &SchedulerConfig) -> Self {
        let max_sleep = Duration::from_millis(config.max_sleep_ms);
        Self {
            queue: BinaryHeap::new(),
            seq: 0,
            buffer_size: config.buffer_size,
            default_buffer_size: config.buffer_size,
            max_sleep,
            default_max_sleep: max_sleep,
            pwm: Vec::new(),
            exit_requested: false,
        }
    }

    /// Producers must check this before calling `queue`; it is the system's
    /// flow-control point.
    pub fn has_room(&self) -> bool {
        self.queue.len() < self.buffer_size
    }

    pub fn queue(&mut self, event: OutputEvent) {
        if !self.has_room() {
            // contract violation by the producer
            debug_assert!(false, "scheduler queue overflow");
            tracing::error!("scheduler queue overflow; accepting event late");
        }
        self.seq += 1;
        self.queue.push(QueuedEvent { event, seq: self.seq });
    }

    /// Install or update a PWM channel on `pin`. The period is fixed when
    /// the channel is first installed; later calls only retune the duty.
    pub fn sched_pwm(&mut self, pin: PinId, duty: f64, max_period: Duration, now: Instant) {
        let duty = duty.clamp(0.0, 1.0);
        if let Some(ch) = self.pwm.iter_mut().find(|c| c.pin == pin) {
            ch.duty = duty;
            ch.period = ch.period.min(max_period);
            return;
        }
        self.pwm.push(PwmChannel { pin, duty, period: max_period, next_edge: now, level: false });
    }

    pub fn active_pwm_count(&self) -> usize {
        self.pwm.len()
    }

    /// Events waiting in the bounded queue (PWM edges not included).
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn set_buffer_size(&mut self, n: usize) {
        self.buffer_size = n.max(1);
    }

    pub fn restore_default_buffer_size(&mut self) {
        self.buffer_size = self.default_buffer_size;
    }

    pub fn set_max_sleep(&mut self, d: Duration) {
        self.max_sleep = d;
    }

    pub fn restore_default_max_sleep(&mut self) {
        self.max_sleep = self.default_max_sleep;
    }

    /// Cause `event_loop` to return once the current event is dealt with.
    pub fn exit_event_loop(&mut self) {
        self.exit_requested = true;
    }

    fn next_queue_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|q| q.event.time)
    }

    fn next_pwm_edge(&self) -> Option<(usize, Instant)> {
        self.pwm
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.next_edge))
            .min_by_key(|&(_, t)| t)
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.next_queue_deadline(), self.next_pwm_edge()) {
            (Some(q), Some((_, p))) => Some(q.min(p)),
            (Some(q), None) => Some(q),
            (None, Some((_, p))) => Some(p),
            (None, None) => None,
        }
    }
}

/// The event loop itself: state plus the hardware backend and the clock.
#[derive(Debug)]
pub struct Scheduler<B, C> {
    state: SchedulerState,
    backend: B,
    clock: C,
}

impl<B: HardwareBackend, C: Clock> Scheduler<B, C> {
    pub fn new(backend: B, clock: C, config: &SchedulerConfig) -> Self {
        Self { state: SchedulerState::new(config), backend, clock }
    }

    pub fn state_mut(&mut self) -> &mut SchedulerState {
        &mut self.state
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Run until `exit_event_loop` is requested. Single-threaded and
    /// cooperative: everything besides emitting events happens through
    /// `handler.on_idle_cpu`.
    pub fn event_loop(&mut self, handler: &mut dyn IdleHandler) {
        loop {
            if self.state.exit_requested {
                self.state.exit_requested = false;
                return;
            }
            // Wide idle whenever the event queue is drained; active PWM
            // channels alone do not demote the host to Short service.
            let interval = if self.state.queue.is_empty() {
                IdleInterval::Wide
            } else {
                IdleInterval::Short
            };
            match self.state.next_deadline() {
                None => {
                    let now = self.clock.now();
                    let more = handler.on_idle_cpu(interval, &mut self.state, now);
                    if !more && !self.state.exit_requested && self.state.next_deadline().is_none() {
                        let pause = self.clock.now() + self.state.max_sleep;
                        self.clock.sleep_until(pause);
                    }
                }
                Some(deadline) => {
                    let now = self.clock.now();
                    if deadline > now + SHORT_THRESHOLD {
                        let more = handler.on_idle_cpu(interval, &mut self.state, now);
                        if !more && !self.state.exit_requested {
                            // an idle poll is still owed every max_sleep
                            let target = deadline.min(self.clock.now() + self.state.max_sleep);
                            self.clock.sleep_until(target);
                        }
                        // re-evaluate: the handler may have queued something
                        // earlier than `deadline`
                    } else {
                        self.clock.spin_until(deadline);
                        self.emit_due(deadline);
                    }
                }
            }
        }
    }

    /// Emit whichever source owns `deadline`: the queue head wins over a
    /// PWM edge at the same instant.
    fn emit_due(&mut self, deadline: Instant) {
        if let Some(t) = self.state.next_queue_deadline() {
            if t <= deadline {
                let queued = self.state.queue.pop().unwrap();
                self.backend.emit(&queued.event);
                return;
            }
        }
        if let Some((idx, t)) = self.state.next_pwm_edge() {
            if t <= deadline {
                self.service_pwm_edge(idx, t);
            }
        }
    }

    fn service_pwm_edge(&mut self, idx: usize, edge: Instant) {
        let ch = &mut self.state.pwm[idx];
        let on_time = ch.period.mul_f64(ch.duty);
        if !ch.level {
            if ch.duty > 0.0 {
                ch.level = true;
                ch.next_edge = edge + on_time;
                let event = OutputEvent::set_pin(edge, ch.pin, true);
                self.backend.emit(&event);
            } else {
                ch.next_edge = edge + ch.period;
            }
        } else if ch.duty < 1.0 {
            ch.level = false;
            ch.next_edge = edge + (ch.period - on_time);
            let event = OutputEvent::set_pin(edge, ch.pin, false);
            self.backend.emit(&event);
        } else {
            ch.next_edge = edge + ch.period;
        }
    }
}
