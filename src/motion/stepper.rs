// src/motion/stepper.rs
//
// Per-axis step-time generators. Each stepper lives for one move segment and
// answers one question: at what time (seconds from segment start) does this
// axis take its next step, and in which direction. Segments are planned at
// constant Cartesian velocity; the acceleration profile warps the times
// afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::hardware::StepDirection;

use super::delta::{LinearDeltaArcStepper, LinearDeltaStepper};

/// Step-time generator for one mechanical axis within one segment.
///
/// `peek_time()` is NaN once the axis has no further step in this segment.
#[derive(Debug)]
pub enum AxisStepper {
    /// Axis does not participate in this segment.
    Idle,
    Linear(LinearAxisStepper),
    Arc(ArcAxisStepper),
    DeltaLinear(LinearDeltaStepper),
    DeltaArc(LinearDeltaArcStepper),
    Home(HomeAxisStepper),
}

impl AxisStepper {
    pub fn peek_time(&self) -> f64 {
        match self {
            AxisStepper::Idle => f64::NAN,
            AxisStepper::Linear(s) => s.time,
            AxisStepper::Arc(s) => s.time,
            AxisStepper::DeltaLinear(s) => s.time(),
            AxisStepper::DeltaArc(s) => s.time(),
            AxisStepper::Home(s) => s.time,
        }
    }

    pub fn peek_direction(&self) -> StepDirection {
        match self {
            AxisStepper::Idle => StepDirection::Forward,
            AxisStepper::Linear(s) => s.direction,
            AxisStepper::Arc(s) => s.direction,
            AxisStepper::DeltaLinear(s) => s.direction(),
            AxisStepper::DeltaArc(s) => s.direction(),
            AxisStepper::Home(s) => s.direction,
        }
    }

    /// Commit the pending step and compute the next one.
    pub fn advance(&mut self) {
        match self {
            AxisStepper::Idle => {}
            AxisStepper::Linear(s) => s.next_step(),
            AxisStepper::Arc(s) => s.next_step(),
            AxisStepper::DeltaLinear(s) => s.next_step(),
            AxisStepper::DeltaArc(s) => s.next_step(),
            AxisStepper::Home(s) => s.next_step(),
        }
    }
}

/// Pick between the backward and forward step candidates. Either candidate
/// is invalid if it is NaN or not strictly after the current time; when both
/// are valid the earlier one wins. Axis velocity can reverse mid-segment on
/// curved paths and on delta rails, which is why both sides are always
/// tested.
pub(super) fn choose_step(
    neg_time: f64,
    pos_time: f64,
    current: f64,
) -> Option<(f64, StepDirection)> {
    let neg_valid = neg_time > current;
    let pos_valid = pos_time > current;
    match (neg_valid, pos_valid) {
        (false, false) => None,
        (false, true) => Some((pos_time, StepDirection::Forward)),
        (true, false) => Some((neg_time, StepDirection::Backward)),
        (true, true) => {
            if neg_time < pos_time {
                Some((neg_time, StepDirection::Backward))
            } else {
                Some((pos_time, StepDirection::Forward))
            }
        }
    }
}

/// Solutions of m*sin(theta) + n*cos(theta) + p = 0, normalized to [0, 2pi).
/// None when the equation has no real solution.
pub(super) fn solve_phase(m: f64, n: f64, p: f64) -> Option<(f64, f64)> {
    let disc = m * m + n * n - p * p;
    if disc < 0.0 {
        return None;
    }
    let root = disc.sqrt();
    let denom = m * m + n * n;
    if denom == 0.0 {
        return None;
    }
    let theta1 = ((-m * p + n * root) / denom).atan2((-n * p - m * root) / denom);
    let theta2 = ((-m * p - n * root) / denom).atan2((-n * p + m * root) / denom);
    let tau = 2.0 * std::f64::consts::PI;
    Some((theta1.rem_euclid(tau), theta2.rem_euclid(tau)))
}

/// Closed-form stepper for an axis whose coordinate is linear in time:
/// Cartesian axes, CoreXY belt axes, and the extruder.
#[derive(Debug)]
pub struct LinearAxisStepper {
    velocity: f64,
    mm_per_step: f64,
    /// Step offset from the segment's start position.
    steps: i32,
    pub(super) time: f64,
    pub(super) direction: StepDirection,
}

impl LinearAxisStepper {
    pub fn new(velocity: f64, mm_per_step: f64) -> Self {
        let mut s = Self {
            velocity,
            mm_per_step,
            steps: 0,
            time: 0.0,
            direction: StepDirection::Forward,
        };
        s.next_step();
        s
    }

    fn next_step(&mut self) {
        if self.velocity > 0.0 {
            self.steps += 1;
            self.direction = StepDirection::Forward;
            self.time = self.steps as f64 * self.mm_per_step / self.velocity;
        } else if self.velocity < 0.0 {
            self.steps -= 1;
            self.direction = StepDirection::Backward;
            self.time = self.steps as f64 * self.mm_per_step / self.velocity;
        } else {
            self.time = f64::NAN;
        }
    }
}

/// Stepper for an axis whose coordinate follows the arc parameterization
/// c(t) = center + u*cos(w t) + v*sin(w t), with center/u/v already
/// projected onto this axis. Used by Cartesian and CoreXY arcs; the delta
/// version lives in `delta.rs`.
#[derive(Debug)]
pub struct ArcAxisStepper {
    center: f64,
    u: f64,
    v: f64,
    omega: f64,
    mm_per_step: f64,
    /// Axis coordinate at segment start, in mm.
    start: f64,
    steps: i32,
    pub(super) time: f64,
    pub(super) direction: StepDirection,
}

impl ArcAxisStepper {
    pub fn new(center: f64, u: f64, v: f64, omega: f64, start_steps: i32, mm_per_step: f64) -> Self {
        let mut s = Self {
            center,
            u,
            v,
            omega,
            mm_per_step,
            start: start_steps as f64 * mm_per_step,
            steps: 0,
            time: 0.0,
            direction: StepDirection::Forward,
        };
        s.next_step();
        s
    }

    /// Earliest time strictly after the current one at which the axis
    /// coordinate equals the target, or NaN.
    fn test_step(&self, target_mm: f64) -> f64 {
        let (theta1, theta2) = match solve_phase(self.v, self.u, self.center - target_mm) {
            Some(pair) => pair,
            None => return f64::NAN,
        };
        let tau = 2.0 * std::f64::consts::PI;
        // Each phase solution also recurs one period later; testing the
        // shifted copies keeps roots that alias across the 2pi wrap.
        let mut best = f64::NAN;
        for theta in [theta1, theta2, theta1 + tau, theta2 + tau] {
            let t = theta / self.omega;
            if t > self.time && !(t >= best) {
                best = t;
            }
        }
        best
    }

    fn next_step(&mut self) {
        let neg = self.test_step(self.start + (self.steps - 1) as f64 * self.mm_per_step);
        let pos = self.test_step(self.start + (self.steps + 1) as f64 * self.mm_per_step);
        match choose_step(neg, pos, self.time) {
            Some((t, dir)) => {
                self.time = t;
                self.direction = dir;
                self.steps += dir.signed();
            }
            None => self.time = f64::NAN,
        }
    }
}

/// Constant-cadence stepper that drives an axis into its endstop. The
/// endstop flag is polled before every step; once it is raised the axis
/// reports NaN and the homing segment is over for this axis.
#[derive(Debug)]
pub struct HomeAxisStepper {
    interval: f64,
    steps: i32,
    endstop: Arc<AtomicBool>,
    pub(super) time: f64,
    pub(super) direction: StepDirection,
}

impl HomeAxisStepper {
    pub fn new(home_velocity: f64, mm_per_step: f64, direction: StepDirection, endstop: Arc<AtomicBool>) -> Self {
        let mut s = Self {
            interval: mm_per_step / home_velocity,
            steps: 0,
            endstop,
            time: 0.0,
            direction,
        };
        s.next_step();
        s
    }

    fn next_step(&mut self) {
        if self.endstop.load(Ordering::Relaxed) {
            self.time = f64::NAN;
        } else {
            self.steps += 1;
            self.time = self.steps as f64 * self.interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(stepper: &mut AxisStepper, n: usize) -> Vec<f64> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(stepper.peek_time());
            stepper.advance();
        }
        out
    }

    #[test]
    fn linear_steps_are_evenly_spaced() {
        // 10 mm/s at 1 mm/step: a step every 0.1 s starting at 0.1 s
        let mut s = AxisStepper::Linear(LinearAxisStepper::new(10.0, 1.0));
        let ts = times(&mut s, 5);
        for (i, t) in ts.iter().enumerate() {
            assert!((t - 0.1 * (i + 1) as f64).abs() < 1e-12);
        }
        assert_eq!(s.peek_direction(), StepDirection::Forward);
    }

    #[test]
    fn negative_velocity_steps_backward() {
        let mut s = AxisStepper::Linear(LinearAxisStepper::new(-5.0, 1.0));
        assert_eq!(s.peek_direction(), StepDirection::Backward);
        assert!((s.peek_time() - 0.2).abs() < 1e-12);
        s.advance();
        assert!((s.peek_time() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn zero_velocity_never_steps() {
        let s = AxisStepper::Linear(LinearAxisStepper::new(0.0, 1.0));
        assert!(s.peek_time().is_nan());
    }

    #[test]
    fn choose_step_prefers_earlier_candidate() {
        assert_eq!(choose_step(0.3, 0.2, 0.1), Some((0.2, StepDirection::Forward)));
        assert_eq!(choose_step(0.2, 0.3, 0.1), Some((0.2, StepDirection::Backward)));
        assert_eq!(choose_step(f64::NAN, 0.2, 0.1), Some((0.2, StepDirection::Forward)));
        assert_eq!(choose_step(0.05, f64::NAN, 0.1), None);
        assert_eq!(choose_step(f64::NAN, f64::NAN, 0.1), None);
    }

    #[test]
    fn solve_phase_finds_both_roots() {
        // sin(theta) = 1/2 has roots pi/6 and 5pi/6
        let (a, b) = solve_phase(1.0, 0.0, -0.5).unwrap();
        let mut roots = [a, b];
        roots.sort_by(f64::total_cmp);
        assert!((roots[0] - std::f64::consts::FRAC_PI_6).abs() < 1e-9);
        assert!((roots[1] - 5.0 * std::f64::consts::FRAC_PI_6).abs() < 1e-9);
    }

    #[test]
    fn solve_phase_rejects_unreachable() {
        assert!(solve_phase(1.0, 1.0, 5.0).is_none());
    }

    #[test]
    fn arc_stepper_reverses_direction_over_half_turn() {
        // Quarter circle in x starting at x = +10 moving through x = 0:
        // c(t) = 10*cos(t). The axis walks backward the whole first half
        // turn; verify the first few steps and monotone times.
        let mut s = AxisStepper::Arc(ArcAxisStepper::new(0.0, 10.0, 0.0, 1.0, 10, 1.0));
        let mut last = 0.0;
        for expected in [9.0_f64, 8.0, 7.0] {
            let t = s.peek_time();
            assert!(t > last);
            assert_eq!(s.peek_direction(), StepDirection::Backward);
            // cos(t) = expected/10
            assert!((t - (expected / 10.0).acos()).abs() < 1e-9);
            last = t;
            s.advance();
        }
    }

    #[test]
    fn arc_stepper_crosses_period_wrap() {
        // Start at the minimum of c(t) = -10*cos(t) (x=-10 at t=0); first
        // crossing of x=-9 happens just after t=0 and again before 2pi; the
        // stepper must keep producing increasing times past the wrap.
        let mut s = AxisStepper::Arc(ArcAxisStepper::new(0.0, -10.0, 0.0, 1.0, -10, 1.0));
        let mut last = 0.0;
        for _ in 0..50 {
            let t = s.peek_time();
            if t.is_nan() {
                break;
            }
            assert!(t > last, "time went backwards: {} after {}", t, last);
            last = t;
            s.advance();
        }
        assert!(last > 2.0 * std::f64::consts::PI, "never crossed the wrap: {}", last);
    }

    #[test]
    fn home_stepper_stops_on_endstop() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut s = AxisStepper::Home(HomeAxisStepper::new(
            10.0,
            1.0,
            StepDirection::Backward,
            flag.clone(),
        ));
        assert!((s.peek_time() - 0.1).abs() < 1e-12);
        s.advance();
        assert!((s.peek_time() - 0.2).abs() < 1e-12);
        flag.store(true, Ordering::Relaxed);
        s.advance();
        assert!(s.peek_time().is_nan());
    }

    #[test]
    fn idle_axis_reports_nan() {
        assert!(AxisStepper::Idle.peek_time().is_nan());
    }
}
