// src/motion/kinematics.rs
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::{Config, ConfigError, LevelingConfig};
use crate::hardware::StepDirection;

use super::delta::{LinearDeltaArcStepper, LinearDeltaStepper, TOWER_ANGLES};
use super::stepper::{ArcAxisStepper, AxisStepper, HomeAxisStepper, LinearAxisStepper};
use super::vector::{Vector3, Vector4};
use super::{MechanicalPos, MotionError, AXIS_COUNT};

/// One stage of a homing choreography. The controller runs the phases in
/// order, re-entering the event loop between them, so a geometry can chain
/// endstop seeks with ordinary settling moves.
#[derive(Debug, Clone, PartialEq)]
pub enum HomePhase {
    /// Drive every homing axis into its endstop.
    RunEndstops,
    /// Ordinary bounded move; the extruder holds its position.
    MoveTo { x: f64, y: f64, z: f64, velocity: Option<f64> },
}

/// Arc geometry shared by every axis of an arc segment: the effector
/// follows center + radius*(cos(omega t)*u + sin(omega t)*v), u and v
/// orthonormal.
#[derive(Debug, Clone)]
pub struct ArcPath {
    pub center: Vector3,
    pub u: Vector3,
    pub v: Vector3,
    pub radius: f64,
    pub omega: f64,
}

/// Per-motor data the maps need at runtime.
#[derive(Debug, Clone)]
struct AxisSetup {
    mm_per_step: f64,
    home_velocity: f64,
    home_dir: StepDirection,
    endstop: Option<Arc<AtomicBool>>,
}

/// Geometry of the machine: translates between Cartesian space and motor
/// step counts, owns the envelope and the homing choreography. Enum
/// dispatch keeps the per-step inner loops free of virtual calls.
#[derive(Debug)]
pub enum CoordMap {
    Cartesian(CartesianMap),
    CoreXy(CoreXyMap),
    LinearDelta(LinearDeltaMap),
}

#[derive(Debug)]
pub struct CartesianMap {
    axes: [AxisSetup; AXIS_COUNT],
    envelope_min: Vector3,
    envelope_max: Vector3,
    leveling: Option<LevelingConfig>,
}

#[derive(Debug)]
pub struct CoreXyMap {
    axes: [AxisSetup; AXIS_COUNT],
    envelope_min: Vector3,
    envelope_max: Vector3,
    leveling: Option<LevelingConfig>,
}

#[derive(Debug)]
pub struct LinearDeltaMap {
    axes: [AxisSetup; AXIS_COUNT],
    rod_length: f64,
    radius: f64,
    home_height: f64,
    build_radius: f64,
    leveling: Option<LevelingConfig>,
}

impl CoordMap {
    /// Build the configured geometry. `endstops` are the per-motor endstop
    /// state flags published by the IO layer; the map hands them to its
    /// homing steppers.
    pub fn from_config(
        config: &Config,
        endstops: [Option<Arc<AtomicBool>>; AXIS_COUNT],
    ) -> Result<Self, ConfigError> {
        let geometry = config.printer.geometry.as_str();
        let default_home_dir = match geometry {
            "linear_delta" => StepDirection::Forward,
            _ => StepDirection::Backward,
        };
        let steppers = config.axis_steppers()?;
        let mut endstops = endstops.map(Some);
        let axes = std::array::from_fn(|i| {
            let s = &steppers[i];
            AxisSetup {
                mm_per_step: 1.0 / s.steps_per_mm,
                home_velocity: s.home_velocity,
                home_dir: match s.home_dir {
                    Some(d) if d >= 0 => StepDirection::Forward,
                    Some(_) => StepDirection::Backward,
                    None => default_home_dir,
                },
                endstop: endstops[i].take().flatten(),
            }
        });
        let envelope_min = Vector3::new(
            config.printer.envelope_min[0],
            config.printer.envelope_min[1],
            config.printer.envelope_min[2],
        );
        let envelope_max = Vector3::new(
            config.printer.envelope_max[0],
            config.printer.envelope_max[1],
            config.printer.envelope_max[2],
        );
        let leveling = config.leveling;
        Ok(match geometry {
            "cartesian" => {
                CoordMap::Cartesian(CartesianMap { axes, envelope_min, envelope_max, leveling })
            }
            "corexy" => CoordMap::CoreXy(CoreXyMap { axes, envelope_min, envelope_max, leveling }),
            "linear_delta" => CoordMap::LinearDelta(LinearDeltaMap {
                axes,
                rod_length: config.delta.rod_length,
                radius: config.delta.radius,
                home_height: config.delta.home_height,
                build_radius: config.delta.build_radius,
                leveling,
            }),
            other => return Err(ConfigError::Invalid(format!("unknown geometry '{}'", other))),
        })
    }

    fn axes(&self) -> &[AxisSetup; AXIS_COUNT] {
        match self {
            CoordMap::Cartesian(m) => &m.axes,
            CoordMap::CoreXy(m) => &m.axes,
            CoordMap::LinearDelta(m) => &m.axes,
        }
    }

    pub fn mm_per_step(&self, axis: usize) -> f64 {
        self.axes()[axis].mm_per_step
    }

    /// Coarsest step resolution across the position axes. Used as the
    /// tolerance for "close enough to the requested destination".
    pub fn max_mm_per_step(&self) -> f64 {
        self.axes()[..3].iter().map(|a| a.mm_per_step).fold(0.0, f64::max)
    }

    pub fn xyze_from_mechanical(&self, steps: &MechanicalPos) -> Vector4 {
        let mm = |i: usize| steps[i] as f64 * self.axes()[i].mm_per_step;
        match self {
            CoordMap::Cartesian(_) => Vector4::new(mm(0), mm(1), mm(2), mm(3)),
            CoordMap::CoreXy(_) => {
                let (a, b) = (mm(0), mm(1));
                Vector4::new((a + b) / 2.0, (a - b) / 2.0, mm(2), mm(3))
            }
            CoordMap::LinearDelta(m) => {
                let p = m.effector_from_carriages([mm(0), mm(1), mm(2)]);
                Vector4::new(p.x, p.y, p.z, mm(3))
            }
        }
    }

    pub fn mechanical_from_xyze(&self, pos: Vector4) -> MechanicalPos {
        let axes = self.axes();
        let round = |mm: f64, i: usize| (mm / axes[i].mm_per_step).round() as i32;
        match self {
            CoordMap::Cartesian(_) => {
                [round(pos.x, 0), round(pos.y, 1), round(pos.z, 2), round(pos.e, 3)]
            }
            CoordMap::CoreXy(_) => [
                round(pos.x + pos.y, 0),
                round(pos.x - pos.y, 1),
                round(pos.z, 2),
                round(pos.e, 3),
            ],
            CoordMap::LinearDelta(m) => {
                let d = m.carriages_from_effector(pos.xyz());
                [round(d[0], 0), round(d[1], 1), round(d[2], 2), round(pos.e, 3)]
            }
        }
    }

    /// Mechanical position after a completed home, preserving the extruder
    /// count.
    pub fn home_position(&self, current: &MechanicalPos) -> MechanicalPos {
        let mut home = match self {
            // the box geometries home to the envelope's min corner
            CoordMap::Cartesian(m) => {
                let min = m.envelope_min;
                self.mechanical_from_xyze(Vector4::new(min.x, min.y, min.z, 0.0))
            }
            CoordMap::CoreXy(m) => {
                let min = m.envelope_min;
                self.mechanical_from_xyze(Vector4::new(min.x, min.y, min.z, 0.0))
            }
            CoordMap::LinearDelta(m) => {
                let d_home = m.home_height + (m.rod_length * m.rod_length - m.radius * m.radius).sqrt();
                let axes = self.axes();
                [
                    (d_home / axes[0].mm_per_step).round() as i32,
                    (d_home / axes[1].mm_per_step).round() as i32,
                    (d_home / axes[2].mm_per_step).round() as i32,
                    0,
                ]
            }
        };
        home[3] = current[3];
        home
    }

    pub fn apply_leveling(&self, pos: Vector4) -> Vector4 {
        let leveling = match self {
            CoordMap::Cartesian(m) => &m.leveling,
            CoordMap::CoreXy(m) => &m.leveling,
            CoordMap::LinearDelta(m) => &m.leveling,
        };
        match leveling {
            Some(plane) => {
                Vector4::new(pos.x, pos.y, pos.z + plane.x_slope * pos.x + plane.y_slope * pos.y, pos.e)
            }
            None => pos,
        }
    }

    /// Clamp the destination to the machine envelope. An adjustment larger
    /// than one step on any axis means the host asked for an unreachable
    /// point, which is an error rather than a silent correction.
    pub fn bound(&self, pos: Vector4) -> Result<Vector4, MotionError> {
        let clamped = match self {
            CoordMap::Cartesian(m) => clamp_box(pos, m.envelope_min, m.envelope_max),
            CoordMap::CoreXy(m) => clamp_box(pos, m.envelope_min, m.envelope_max),
            CoordMap::LinearDelta(m) => {
                let mut p = pos;
                p.z = p.z.clamp(0.0, m.home_height);
                let rad = (p.x * p.x + p.y * p.y).sqrt();
                if rad > m.build_radius {
                    let scale = m.build_radius / rad;
                    p.x *= scale;
                    p.y *= scale;
                }
                p
            }
        };
        let tol = self.max_mm_per_step();
        let moved = clamped - pos;
        if moved.x.abs() > tol || moved.y.abs() > tol || moved.z.abs() > tol {
            return Err(MotionError::OutOfBounds { x: pos.x, y: pos.y, z: pos.z });
        }
        Ok(clamped)
    }

    pub fn home_routine(&self) -> Vec<HomePhase> {
        match self {
            CoordMap::Cartesian(_) | CoordMap::CoreXy(_) => vec![HomePhase::RunEndstops],
            CoordMap::LinearDelta(m) => vec![
                HomePhase::RunEndstops,
                // settle below the towers before accepting print moves
                HomePhase::MoveTo {
                    x: 0.0,
                    y: 0.0,
                    z: (m.home_height - 10.0).max(0.0),
                    velocity: None,
                },
            ],
        }
    }

    /// One stepper per motor for a straight segment at Cartesian velocity
    /// (vel.x, vel.y, vel.z) and extrusion rate vel.e.
    pub fn linear_steppers(&self, mech: &MechanicalPos, vel: Vector4) -> [AxisStepper; AXIS_COUNT] {
        let axes = self.axes();
        match self {
            CoordMap::Cartesian(_) => [
                AxisStepper::Linear(LinearAxisStepper::new(vel.x, axes[0].mm_per_step)),
                AxisStepper::Linear(LinearAxisStepper::new(vel.y, axes[1].mm_per_step)),
                AxisStepper::Linear(LinearAxisStepper::new(vel.z, axes[2].mm_per_step)),
                AxisStepper::Linear(LinearAxisStepper::new(vel.e, axes[3].mm_per_step)),
            ],
            CoordMap::CoreXy(_) => [
                AxisStepper::Linear(LinearAxisStepper::new(vel.x + vel.y, axes[0].mm_per_step)),
                AxisStepper::Linear(LinearAxisStepper::new(vel.x - vel.y, axes[1].mm_per_step)),
                AxisStepper::Linear(LinearAxisStepper::new(vel.z, axes[2].mm_per_step)),
                AxisStepper::Linear(LinearAxisStepper::new(vel.e, axes[3].mm_per_step)),
            ],
            CoordMap::LinearDelta(m) => {
                let start = self.xyze_from_mechanical(mech).xyz();
                let v = Vector3::new(vel.x, vel.y, vel.z);
                let tower = |i: usize| {
                    AxisStepper::DeltaLinear(LinearDeltaStepper::new(
                        TOWER_ANGLES[i],
                        m.radius,
                        m.rod_length,
                        axes[i].mm_per_step,
                        mech[i],
                        start,
                        v,
                    ))
                };
                [
                    tower(0),
                    tower(1),
                    tower(2),
                    AxisStepper::Linear(LinearAxisStepper::new(vel.e, axes[3].mm_per_step)),
                ]
            }
        }
    }

    /// One stepper per motor for an arc segment.
    pub fn arc_steppers(
        &self,
        mech: &MechanicalPos,
        arc: &ArcPath,
        vel_e: f64,
    ) -> [AxisStepper; AXIS_COUNT] {
        let axes = self.axes();
        let e_stepper = AxisStepper::Linear(LinearAxisStepper::new(vel_e, axes[3].mm_per_step));
        match self {
            CoordMap::Cartesian(_) => {
                let axis = |i: usize, c: f64, u: f64, v: f64| {
                    AxisStepper::Arc(ArcAxisStepper::new(
                        c,
                        arc.radius * u,
                        arc.radius * v,
                        arc.omega,
                        mech[i],
                        axes[i].mm_per_step,
                    ))
                };
                [
                    axis(0, arc.center.x, arc.u.x, arc.v.x),
                    axis(1, arc.center.y, arc.u.y, arc.v.y),
                    axis(2, arc.center.z, arc.u.z, arc.v.z),
                    e_stepper,
                ]
            }
            CoordMap::CoreXy(_) => {
                let axis = |i: usize, c: f64, u: f64, v: f64| {
                    AxisStepper::Arc(ArcAxisStepper::new(
                        c,
                        arc.radius * u,
                        arc.radius * v,
                        arc.omega,
                        mech[i],
                        axes[i].mm_per_step,
                    ))
                };
                [
                    axis(0, arc.center.x + arc.center.y, arc.u.x + arc.u.y, arc.v.x + arc.v.y),
                    axis(1, arc.center.x - arc.center.y, arc.u.x - arc.u.y, arc.v.x - arc.v.y),
                    axis(2, arc.center.z, arc.u.z, arc.v.z),
                    e_stepper,
                ]
            }
            CoordMap::LinearDelta(m) => {
                let tower = |i: usize| {
                    AxisStepper::DeltaArc(LinearDeltaArcStepper::new(
                        TOWER_ANGLES[i],
                        m.radius,
                        m.rod_length,
                        axes[i].mm_per_step,
                        mech[i],
                        arc.center,
                        arc.u,
                        arc.v,
                        arc.radius,
                        arc.omega,
                    ))
                };
                [tower(0), tower(1), tower(2), e_stepper]
            }
        }
    }

    /// Homing steppers: each position axis seeks its endstop, the extruder
    /// sits idle. Axes with no configured endstop stay idle too.
    /// `max_velocity` caps the per-axis homing speed from the config.
    pub fn home_steppers(&self, max_velocity: f64) -> [AxisStepper; AXIS_COUNT] {
        let axes = self.axes();
        std::array::from_fn(|i| {
            if i == 3 {
                return AxisStepper::Idle;
            }
            match &axes[i].endstop {
                Some(flag) => AxisStepper::Home(HomeAxisStepper::new(
                    axes[i].home_velocity.min(max_velocity),
                    axes[i].mm_per_step,
                    axes[i].home_dir,
                    flag.clone(),
                )),
                None => AxisStepper::Idle,
            }
        })
    }
}

fn clamp_box(pos: Vector4, min: Vector3, max: Vector3) -> Vector4 {
    Vector4::new(
        pos.x.clamp(min.x, max.x),
        pos.y.clamp(min.y, max.y),
        pos.z.clamp(min.z, max.z),
        pos.e,
    )
}

impl LinearDeltaMap {
    fn tower(&self, i: usize) -> (f64, f64) {
        (self.radius * TOWER_ANGLES[i].sin(), self.radius * TOWER_ANGLES[i].cos())
    }

    /// Forward kinematics: the effector is the lower intersection of three
    /// spheres of radius L centered on the carriages. Subtracting pairs of
    /// sphere equations gives x and y as linear functions of z; substituting
    /// back into the first sphere leaves a quadratic in z.
    fn effector_from_carriages(&self, d: [f64; 3]) -> Vector3 {
        let (x0, y0) = self.tower(0);
        let (x1, y1) = self.tower(1);
        let (x2, y2) = self.tower(2);
        let a11 = 2.0 * (x0 - x1);
        let a12 = 2.0 * (y0 - y1);
        let b1 = 2.0 * (d[0] - d[1]);
        let c1 = d[0] * d[0] - d[1] * d[1];
        let a21 = 2.0 * (x0 - x2);
        let a22 = 2.0 * (y0 - y2);
        let b2 = 2.0 * (d[0] - d[2]);
        let c2 = d[0] * d[0] - d[2] * d[2];
        let det = a11 * a22 - a12 * a21;
        // x = xp + xq*z, y = yp + yq*z
        let xp = (c1 * a22 - c2 * a12) / det;
        let xq = (-b1 * a22 + b2 * a12) / det;
        let yp = (a11 * c2 - a21 * c1) / det;
        let yq = (-a11 * b2 + a21 * b1) / det;
        let alpha = xq * xq + yq * yq + 1.0;
        let beta = 2.0 * (xq * (xp - x0) + yq * (yp - y0) - d[0]);
        let gamma = (xp - x0) * (xp - x0) + (yp - y0) * (yp - y0) + d[0] * d[0]
            - self.rod_length * self.rod_length;
        let disc = (beta * beta - 4.0 * alpha * gamma).max(0.0);
        let z = (-beta - disc.sqrt()) / (2.0 * alpha);
        Vector3::new(xp + xq * z, yp + yq * z, z)
    }

    /// Inverse kinematics. Unreachable points saturate the square root at
    /// zero; this function is only asked for reachable positions outside of
    /// the home reset path.
    fn carriages_from_effector(&self, p: Vector3) -> [f64; 3] {
        std::array::from_fn(|i| {
            let (tx, ty) = self.tower(i);
            let dx = p.x - tx;
            let dy = p.y - ty;
            p.z + (self.rod_length * self.rod_length - dx * dx - dy * dy).max(0.0).sqrt()
        })
    }
}
