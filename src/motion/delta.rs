// src/motion/delta.rs
//
// Step-time solvers for linear-delta (rail) machines. Three carriages ride
// vertical towers spaced 120 degrees apart on a circle of radius r; rods of
// length L tie them to the effector. A carriage at height D on the tower at
// angle w (clockwise from +y) satisfies
//
//   (D - z)^2 + (x - r*sin w)^2 + (y - r*cos w)^2 = L^2
//
// For a straight Cartesian segment x,y,z are linear in t, so solving for the
// time at which D reaches the next step level is a quadratic in t. For an
// arc segment the substitution leaves m*sin(wt) + n*cos(wt) + p = 0, solved
// through atan2. A carriage can pass its turning point and come back within
// a single segment, so both roots matter and both step directions are tested
// every time.

use crate::hardware::StepDirection;

use super::stepper::{choose_step, solve_phase};
use super::vector::Vector3;

/// Tower angles, clockwise from the +y axis.
pub const TOWER_ANGLES: [f64; 3] = [
    0.0,
    2.0 * std::f64::consts::FRAC_PI_3,
    4.0 * std::f64::consts::FRAC_PI_3,
];

/// Carriage stepper for a straight constant-velocity segment.
///
/// With K(s) = M0 + s - z0, X = x0 - r*sin w, Y = y0 - r*cos w and
/// v2 = |v|^2, the rod constraint expands to the quadratic
/// v2*t^2 + 2*(vx*X + vy*Y - vz*K)*t + (X^2 + Y^2 + K^2 - L^2) = 0, so
///
///   t = term1(s) +/- sqrt(term1(s)^2 - (X^2 + Y^2 + K(s)^2 - L^2)/v2),
///   term1(s) = (vz*K(s) - vx*X - vy*Y)/v2.
///
/// Everything that does not depend on s is precomputed.
#[derive(Debug)]
pub struct LinearDeltaStepper {
    mm_per_step: f64,
    /// Step offset from the carriage position at segment start.
    s_total: i32,
    vz_over_v2: f64,
    inv_v2: f64,
    /// term1(s) minus its s-dependent part.
    almost_term1: f64,
    /// -(X^2 + Y^2 + K(0)^2 - L^2)/v2.
    almost_root_param: f64,
    /// 2*(M0 - z0); K(s)^2 - K(0)^2 = s*(this + s).
    almost_root_param_s: f64,
    time: f64,
    direction: StepDirection,
}

impl LinearDeltaStepper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tower_angle: f64,
        radius: f64,
        rod_length: f64,
        mm_per_step: f64,
        carriage_steps: i32,
        start: Vector3,
        velocity: Vector3,
    ) -> Self {
        let v2 = velocity.dot(velocity);
        if v2 == 0.0 {
            return Self {
                mm_per_step,
                s_total: 0,
                vz_over_v2: 0.0,
                inv_v2: 0.0,
                almost_term1: 0.0,
                almost_root_param: 0.0,
                almost_root_param_s: 0.0,
                time: f64::NAN,
                direction: StepDirection::Forward,
            };
        }
        let inv_v2 = 1.0 / v2;
        let m0 = carriage_steps as f64 * mm_per_step;
        let big_x = start.x - radius * tower_angle.sin();
        let big_y = start.y - radius * tower_angle.cos();
        let k0 = m0 - start.z;
        let mut s = Self {
            mm_per_step,
            s_total: 0,
            vz_over_v2: velocity.z * inv_v2,
            inv_v2,
            almost_term1: inv_v2 * (velocity.z * k0 - velocity.x * big_x - velocity.y * big_y),
            almost_root_param: -inv_v2
                * (big_x * big_x + big_y * big_y + k0 * k0 - rod_length * rod_length),
            almost_root_param_s: 2.0 * k0,
            time: 0.0,
            direction: StepDirection::Forward,
        };
        s.next_step();
        s
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn direction(&self) -> StepDirection {
        self.direction
    }

    /// Earliest time strictly after the last step at which the carriage sits
    /// at step offset `s` mm, or NaN.
    fn test_step(&self, s: f64) -> f64 {
        let term1 = self.almost_term1 + self.vz_over_v2 * s;
        let root_param =
            term1 * term1 + self.almost_root_param - self.inv_v2 * s * (self.almost_root_param_s + s);
        if root_param < 0.0 {
            return f64::NAN;
        }
        let root = root_param.sqrt();
        let t1 = term1 - root;
        let t2 = term1 + root;
        if t1 > self.time {
            t1
        } else if t2 > self.time {
            t2
        } else {
            f64::NAN
        }
    }

    pub(super) fn next_step(&mut self) {
        if self.inv_v2 == 0.0 {
            return;
        }
        let neg = self.test_step((self.s_total - 1) as f64 * self.mm_per_step);
        let pos = self.test_step((self.s_total + 1) as f64 * self.mm_per_step);
        match choose_step(neg, pos, self.time) {
            Some((t, dir)) => {
                self.time = t;
                self.direction = dir;
                self.s_total += dir.signed();
            }
            None => self.time = f64::NAN,
        }
    }
}

/// Carriage stepper for an arc segment. The effector follows
/// P(t) = center + radius*(cos(omega t)*u + sin(omega t)*v) with u, v an
/// orthonormal basis of the arc plane. Substituting into the rod constraint
/// and collecting terms leaves {m, n, p} . {sin(omega t), cos(omega t), 1}
/// = 0 with, for D = M0 + s:
///
///   p = r^2 + q^2 + xc^2 + yc^2 + (D - zc)^2
///       - 2r*(yc*cos w + xc*sin w) - L^2
///   n = 2q*(-D*uz + ux*xc + uy*yc + uz*zc - r*(uy*cos w + ux*sin w))
///   m = 2q*(-D*vz + vx*xc + vy*yc + vz*zc - r*(vy*cos w + vx*sin w))
#[derive(Debug)]
pub struct LinearDeltaArcStepper {
    tower_angle: f64,
    radius: f64,
    rod_length: f64,
    mm_per_step: f64,
    m0: f64,
    s_total: i32,
    center: Vector3,
    u: Vector3,
    v: Vector3,
    arc_radius: f64,
    omega: f64,
    time: f64,
    direction: StepDirection,
}

impl LinearDeltaArcStepper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tower_angle: f64,
        radius: f64,
        rod_length: f64,
        mm_per_step: f64,
        carriage_steps: i32,
        center: Vector3,
        u: Vector3,
        v: Vector3,
        arc_radius: f64,
        omega: f64,
    ) -> Self {
        let mut s = Self {
            tower_angle,
            radius,
            rod_length,
            mm_per_step,
            m0: carriage_steps as f64 * mm_per_step,
            s_total: 0,
            center,
            u,
            v,
            arc_radius,
            omega,
            time: 0.0,
            direction: StepDirection::Forward,
        };
        s.next_step();
        s
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn direction(&self) -> StepDirection {
        self.direction
    }

    fn test_step(&self, s: f64) -> f64 {
        let w = self.tower_angle;
        let d = self.m0 + s;
        let c = self.center;
        let q = self.arc_radius;
        let r = self.radius;
        let p = r * r + q * q + c.x * c.x + c.y * c.y + (d - c.z) * (d - c.z)
            - 2.0 * r * (c.y * w.cos() + c.x * w.sin())
            - self.rod_length * self.rod_length;
        let n = 2.0
            * q
            * (-d * self.u.z + self.u.x * c.x + self.u.y * c.y + self.u.z * c.z
                - r * (self.u.y * w.cos() + self.u.x * w.sin()));
        let m = 2.0
            * q
            * (-d * self.v.z + self.v.x * c.x + self.v.y * c.y + self.v.z * c.z
                - r * (self.v.y * w.cos() + self.v.x * w.sin()));
        let (theta1, theta2) = match solve_phase(m, n, p) {
            Some(pair) => pair,
            None => return f64::NAN,
        };
        let tau = 2.0 * std::f64::consts::PI;
        // Phases recur every full turn; testing the shifted copies keeps
        // roots that alias across the wrap.
        let mut best = f64::NAN;
        for theta in [theta1, theta2, theta1 + tau, theta2 + tau] {
            let t = theta / self.omega;
            if t > self.time && !(t >= best) {
                best = t;
            }
        }
        best
    }

    pub(super) fn next_step(&mut self) {
        let neg = self.test_step((self.s_total - 1) as f64 * self.mm_per_step);
        let pos = self.test_step((self.s_total + 1) as f64 * self.mm_per_step);
        match choose_step(neg, pos, self.time) {
            Some((t, dir)) => {
                self.time = t;
                self.direction = dir;
                self.s_total += dir.signed();
            }
            None => self.time = f64::NAN,
        }
    }
}
