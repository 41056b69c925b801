// src/motion/mod.rs
pub mod acceleration;
pub mod delta;
pub mod kinematics;
pub mod planner;
pub mod stepper;
pub mod vector;

pub use kinematics::{CoordMap, HomePhase};
pub use planner::MotionPlanner;
pub use vector::{Vector3, Vector4};

use thiserror::Error;

/// Every supported geometry drives four motors: three position axes plus the
/// extruder.
pub const AXIS_COUNT: usize = 4;

/// Signed step counts, one per motor. The single source of truth for the
/// machine's position; Cartesian coordinates are always reconstructed from
/// this through the coordinate map.
pub type MechanicalPos = [i32; AXIS_COUNT];

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("destination ({x:.3}, {y:.3}, {z:.3}) is outside the machine envelope")]
    OutOfBounds { x: f64, y: f64, z: f64 },
    #[error("planner is busy; caller must check ready_for_next_move()")]
    Busy,
    #[error("arc has no usable radius")]
    DegenerateArc,
}
