// src/motion/planner.rs
use std::time::{Duration, Instant};

use crate::hardware::OutputEvent;

use super::acceleration::AccelProfile;
use super::kinematics::{ArcPath, CoordMap};
use super::stepper::AxisStepper;
use super::vector::{Vector3, Vector4};
use super::{MechanicalPos, MotionError, AXIS_COUNT};

/// Shortest representable segment; keeps duration math away from divide
/// traps when a move only touches the extruder.
const MIN_DURATION: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionState {
    Idle,
    Moving,
    Homing,
}

/// Turns move requests into a time-ordered stream of per-axis step events.
///
/// The planner owns the mechanical position: it is the only place step
/// counts are mutated, and the Cartesian position is always reconstructed
/// from them through the coordinate map.
#[derive(Debug)]
pub struct MotionPlanner {
    coord_map: CoordMap,
    accel: AccelProfile,
    mech_pos: MechanicalPos,
    steppers: [AxisStepper; AXIS_COUNT],
    base_time: Instant,
    duration: f64,
    state: MotionState,
    pending: Option<OutputEvent>,
    /// Transformed time of the last event in this segment, for the
    /// monotonicity check.
    last_transformed: f64,
}

impl MotionPlanner {
    pub fn new(coord_map: CoordMap, accel: AccelProfile) -> Self {
        Self {
            coord_map,
            accel,
            mech_pos: [0; AXIS_COUNT],
            steppers: [AxisStepper::Idle, AxisStepper::Idle, AxisStepper::Idle, AxisStepper::Idle],
            base_time: Instant::now(),
            duration: f64::NAN,
            state: MotionState::Idle,
            pending: None,
            last_transformed: 0.0,
        }
    }

    pub fn coord_map(&self) -> &CoordMap {
        &self.coord_map
    }

    pub fn mechanical_position(&self) -> &MechanicalPos {
        &self.mech_pos
    }

    pub fn cartesian_position(&self) -> Vector4 {
        self.coord_map.xyze_from_mechanical(&self.mech_pos)
    }

    /// True when a call to move_to/arc_to/home_endstops is allowed. There is
    /// no segment buffering: one segment at a time.
    pub fn ready_for_next_move(&self) -> bool {
        self.state == MotionState::Idle && self.pending.is_none()
    }

    pub fn is_homing(&self) -> bool {
        self.state == MotionState::Homing
    }

    /// Plan a straight move to `dest` (absolute mm). Extrusion rate is
    /// clamped to [vel_e_min, vel_e_max]; if the clamp bites, the whole
    /// segment is slowed so the Cartesian path and the extrusion stay in
    /// sync.
    pub fn move_to(
        &mut self,
        start_time: Instant,
        dest: Vector4,
        vel_xyz: f64,
        vel_e_min: f64,
        vel_e_max: f64,
    ) -> Result<(), MotionError> {
        if !self.ready_for_next_move() {
            debug_assert!(false, "move_to while planner busy");
            return Err(MotionError::Busy);
        }
        let dest = self.coord_map.bound(self.coord_map.apply_leveling(dest))?;
        let cur = self.cartesian_position();
        let dist = (dest - cur).xyz_norm();
        let mut duration = (dist / vel_xyz).max(MIN_DURATION);
        let mut vel_xyz = vel_xyz;
        let delta_e = dest.e - cur.e;
        let mut vel_e = delta_e / duration;
        let clamped = vel_e.clamp(vel_e_min, vel_e_max);
        if clamped != vel_e {
            vel_e = clamped;
            duration = delta_e / vel_e;
            vel_xyz = dist / duration;
        }
        let vel = Vector4::new(
            (dest.x - cur.x) / duration,
            (dest.y - cur.y) / duration,
            (dest.z - cur.z) / duration,
            vel_e,
        );
        tracing::debug!(
            "move_to ({:.3}, {:.3}, {:.3}, {:.3}) -> ({:.3}, {:.3}, {:.3}, {:.3}) over {:.4}s",
            cur.x, cur.y, cur.z, cur.e, dest.x, dest.y, dest.z, dest.e, duration
        );
        self.steppers = self.coord_map.linear_steppers(&self.mech_pos, vel);
        self.accel.begin(duration, vel_xyz);
        self.base_time = start_time;
        self.duration = duration;
        self.last_transformed = 0.0;
        self.state = MotionState::Moving;
        Ok(())
    }

    /// Plan an arc from the current position to `dest` around `center`.
    pub fn arc_to(
        &mut self,
        start_time: Instant,
        dest: Vector4,
        center: Vector3,
        vel_xyz: f64,
        vel_e_min: f64,
        vel_e_max: f64,
        clockwise: bool,
    ) -> Result<(), MotionError> {
        if !self.ready_for_next_move() {
            debug_assert!(false, "arc_to while planner busy");
            return Err(MotionError::Busy);
        }
        let dest = self.coord_map.bound(self.coord_map.apply_leveling(dest))?;
        let cur = self.cartesian_position();
        let u0 = cur.xyz() - center;
        let radius = u0.norm();
        if radius < self.coord_map.max_mm_per_step() {
            return Err(MotionError::DegenerateArc);
        }
        let u_hat = u0.scale(1.0 / radius);
        let w0 = dest.xyz() - center;
        // v spans the arc plane: the part of the destination direction
        // orthogonal to u. A degenerate w0 (full circle) falls back to the
        // horizontal perpendicular of u.
        let mut v_dir = w0 - u_hat.scale(w0.dot(u_hat));
        if v_dir.norm() < 1e-9 {
            v_dir = Vector3::new(-u_hat.y, u_hat.x, 0.0);
        }
        let mut v_hat = v_dir.scale(1.0 / v_dir.norm());
        let mut sweep = w0.dot(v_hat).atan2(w0.dot(u_hat));
        if sweep <= 0.0 {
            sweep += 2.0 * std::f64::consts::PI;
        }
        // Orient the plane so the sweep direction matches G2/G3. The normal
        // of interest is the z component of u x v.
        let normal_z = u_hat.x * v_hat.y - u_hat.y * v_hat.x;
        let wrong_way = if clockwise { normal_z > 0.0 } else { normal_z < 0.0 };
        if wrong_way {
            v_hat = v_hat.scale(-1.0);
            sweep = 2.0 * std::f64::consts::PI - sweep;
        }
        let arc_len = sweep * radius;
        let mut duration = (arc_len / vel_xyz).max(MIN_DURATION);
        let mut vel_xyz = vel_xyz;
        let delta_e = dest.e - cur.e;
        let mut vel_e = delta_e / duration;
        let clamped = vel_e.clamp(vel_e_min, vel_e_max);
        if clamped != vel_e {
            vel_e = clamped;
            duration = delta_e / vel_e;
            vel_xyz = arc_len / duration;
        }
        let arc = ArcPath { center, u: u_hat, v: v_hat, radius, omega: sweep / duration };
        tracing::debug!(
            "arc_to ({:.3}, {:.3}, {:.3}) sweep {:.3} rad radius {:.3} over {:.4}s",
            dest.x, dest.y, dest.z, sweep, radius, duration
        );
        self.steppers = self.coord_map.arc_steppers(&self.mech_pos, &arc, vel_e);
        self.accel.begin(duration, vel_xyz);
        self.base_time = start_time;
        self.duration = duration;
        self.last_transformed = 0.0;
        self.state = MotionState::Moving;
        Ok(())
    }

    /// Drive every homing axis toward its endstop. The segment has no fixed
    /// duration; it ends when the endstop flags silence all steppers, at
    /// which point the mechanical position snaps to the geometry's home.
    pub fn home_endstops(&mut self, start_time: Instant, vel_xyz: f64) -> Result<(), MotionError> {
        if !self.ready_for_next_move() {
            debug_assert!(false, "home_endstops while planner busy");
            return Err(MotionError::Busy);
        }
        self.steppers = self.coord_map.home_steppers(vel_xyz);
        self.accel.begin(f64::NAN, vel_xyz);
        self.base_time = start_time;
        self.duration = f64::NAN;
        self.last_transformed = 0.0;
        self.state = MotionState::Homing;
        Ok(())
    }

    /// Next hardware event of the current segment without consuming it.
    pub fn peek_next_event(&mut self) -> Option<OutputEvent> {
        if self.pending.is_none() {
            self.pending = self.compute_next_event();
        }
        self.pending
    }

    pub fn consume_next_event(&mut self) -> Option<OutputEvent> {
        self.peek_next_event();
        self.pending.take()
    }

    fn compute_next_event(&mut self) -> Option<OutputEvent> {
        if self.state == MotionState::Idle {
            return None;
        }
        // axis with the earliest pending step; ties go to the lower index
        let mut best: Option<(usize, f64)> = None;
        for (i, stepper) in self.steppers.iter().enumerate() {
            let t = stepper.peek_time();
            if t.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, bt)| t < bt) {
                best = Some((i, t));
            }
        }
        let (axis, t) = match best {
            Some(pair) => pair,
            None => return self.finish_segment(),
        };
        // NaN duration (homing) never trips the first comparison.
        if t > self.duration || t <= 0.0 {
            return self.finish_segment();
        }
        let transformed = self.accel.transform(t);
        debug_assert!(
            transformed >= self.last_transformed,
            "event time went backwards within a segment"
        );
        self.last_transformed = transformed;
        let direction = self.steppers[axis].peek_direction();
        self.mech_pos[axis] += direction.signed();
        self.steppers[axis].advance();
        Some(OutputEvent::step(
            self.base_time + Duration::from_secs_f64(transformed),
            axis,
            direction,
        ))
    }

    fn finish_segment(&mut self) -> Option<OutputEvent> {
        if self.state == MotionState::Homing {
            self.mech_pos = self.coord_map.home_position(&self.mech_pos);
            tracing::debug!("homing complete, mechanical position reset to {:?}", self.mech_pos);
        }
        self.state = MotionState::Idle;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hardware::{EventKind, StepDirection};
    use std::sync::atomic::Ordering;

    fn unit_cartesian_planner() -> MotionPlanner {
        let config: Config = toml::from_str(
            r#"
            [steppers.x]
            steps_per_mm = 1.0
            [steppers.y]
            steps_per_mm = 1.0
            [steppers.z]
            steps_per_mm = 1.0
            [steppers.e]
            steps_per_mm = 1.0
        "#,
        )
        .unwrap();
        let map = CoordMap::from_config(&config, [None, None, None, None]).unwrap();
        MotionPlanner::new(map, AccelProfile::None)
    }

    fn drain(planner: &mut MotionPlanner) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(e) = planner.consume_next_event() {
            events.push(e);
        }
        events
    }

    #[test]
    fn straight_x_move_emits_even_steps() {
        let mut planner = unit_cartesian_planner();
        let t0 = Instant::now();
        planner
            .move_to(t0, Vector4::new(10.0, 0.0, 0.0, 0.0), 10.0, -30.0, 30.0)
            .unwrap();
        let events = drain(&mut planner);
        assert_eq!(events.len(), 10);
        for (i, e) in events.iter().enumerate() {
            match e.kind {
                EventKind::Step { axis, direction } => {
                    assert_eq!(axis, 0);
                    assert_eq!(direction, StepDirection::Forward);
                }
                _ => panic!("unexpected event kind"),
            }
            let expected = t0 + Duration::from_secs_f64(0.1 * (i + 1) as f64);
            let delta = if e.time > expected { e.time - expected } else { expected - e.time };
            assert!(delta < Duration::from_micros(1));
        }
        assert_eq!(*planner.mechanical_position(), [10, 0, 0, 0]);
        assert!(planner.ready_for_next_move());
    }

    #[test]
    fn xy_and_extruder_interleave_by_deadline() {
        let mut planner = unit_cartesian_planner();
        let t0 = Instant::now();
        planner
            .move_to(t0, Vector4::new(10.0, 0.0, 0.0, 5.0), 10.0, -30.0, 30.0)
            .unwrap();
        let events = drain(&mut planner);
        assert_eq!(events.len(), 15);
        let mut last = t0;
        for e in &events {
            assert!(e.time >= last, "deadlines must be non-decreasing");
            last = e.time;
        }
        assert_eq!(*planner.mechanical_position(), [10, 0, 0, 5]);
    }

    #[test]
    fn relative_out_and_back_returns_home() {
        let mut planner = unit_cartesian_planner();
        let t0 = Instant::now();
        planner.move_to(t0, Vector4::new(10.0, 0.0, 0.0, 0.0), 10.0, -30.0, 30.0).unwrap();
        let out = drain(&mut planner);
        planner.move_to(t0, Vector4::new(0.0, 0.0, 0.0, 0.0), 20.0, -30.0, 30.0).unwrap();
        let back = drain(&mut planner);
        assert_eq!(out.len(), 10);
        assert_eq!(back.len(), 10);
        for e in &back {
            match e.kind {
                EventKind::Step { direction, .. } => assert_eq!(direction, StepDirection::Backward),
                _ => panic!(),
            }
        }
        assert_eq!(*planner.mechanical_position(), [0, 0, 0, 0]);
    }

    #[test]
    fn step_deltas_account_for_every_emitted_event() {
        let mut planner = unit_cartesian_planner();
        let t0 = Instant::now();
        let targets = [
            Vector4::new(7.0, 3.0, 0.0, 2.0),
            Vector4::new(1.0, 14.0, 5.0, 6.0),
            Vector4::new(12.0, 2.0, 1.0, 4.0),
        ];
        let mut tally = [0i32; 4];
        for dest in targets {
            planner.move_to(t0, dest, 25.0, -30.0, 30.0).unwrap();
            for e in drain(&mut planner) {
                if let EventKind::Step { axis, direction } = e.kind {
                    tally[axis] += direction.signed();
                }
            }
        }
        assert_eq!(tally, *planner.mechanical_position());
        assert_eq!(*planner.mechanical_position(), [12, 2, 1, 4]);
    }

    #[test]
    fn extruder_clamp_rescales_duration() {
        let mut planner = unit_cartesian_planner();
        let t0 = Instant::now();
        // 10 mm of travel with 50 mm of extrusion at 10 mm/s would need
        // 50 mm/s of extrusion; the 30 mm/s cap stretches the segment.
        planner.move_to(t0, Vector4::new(10.0, 0.0, 0.0, 50.0), 10.0, -30.0, 30.0).unwrap();
        let events = drain(&mut planner);
        // duration becomes 50/30 s; the last extruder step lands there
        let expected_end = t0 + Duration::from_secs_f64(50.0 / 30.0);
        let last = events.last().unwrap().time;
        let delta =
            if last > expected_end { last - expected_end } else { expected_end - last };
        assert!(delta < Duration::from_millis(1));
        assert_eq!(*planner.mechanical_position(), [10, 0, 0, 50]);
    }

    #[test]
    fn pure_extrusion_move_works() {
        let mut planner = unit_cartesian_planner();
        planner
            .move_to(Instant::now(), Vector4::new(0.0, 0.0, 0.0, 5.0), 10.0, -30.0, 30.0)
            .unwrap();
        let events = drain(&mut planner);
        assert_eq!(events.len(), 5);
        assert_eq!(*planner.mechanical_position(), [0, 0, 0, 5]);
    }

    #[test]
    fn out_of_bounds_is_rejected_and_planner_stays_idle() {
        let mut planner = unit_cartesian_planner();
        let err = planner
            .move_to(Instant::now(), Vector4::new(1000.0, 0.0, 0.0, 0.0), 10.0, -30.0, 30.0)
            .unwrap_err();
        assert!(matches!(err, MotionError::OutOfBounds { .. }));
        assert!(planner.ready_for_next_move());
        assert_eq!(*planner.mechanical_position(), [0, 0, 0, 0]);
    }

    #[test]
    fn move_while_busy_is_rejected() {
        let mut planner = unit_cartesian_planner();
        let t0 = Instant::now();
        planner.move_to(t0, Vector4::new(5.0, 0.0, 0.0, 0.0), 10.0, -30.0, 30.0).unwrap();
        assert!(planner.peek_next_event().is_some());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            planner.move_to(t0, Vector4::new(6.0, 0.0, 0.0, 0.0), 10.0, -30.0, 30.0)
        }));
        // debug builds assert; release builds return Busy
        if let Ok(inner) = result {
            assert!(matches!(inner.unwrap_err(), MotionError::Busy));
        }
    }

    #[test]
    fn homing_resets_mechanical_position() {
        let config: Config = toml::from_str(
            r#"
            [steppers.x]
            steps_per_mm = 1.0
            endstop_pin = "P0"
            [steppers.y]
            steps_per_mm = 1.0
            endstop_pin = "P1"
            [steppers.z]
            steps_per_mm = 1.0
            endstop_pin = "P2"
            [steppers.e]
            steps_per_mm = 1.0
        "#,
        )
        .unwrap();
        let flags: [std::sync::Arc<std::sync::atomic::AtomicBool>; 3] =
            std::array::from_fn(|_| Default::default());
        let map = CoordMap::from_config(
            &config,
            [Some(flags[0].clone()), Some(flags[1].clone()), Some(flags[2].clone()), None],
        )
        .unwrap();
        let mut planner = MotionPlanner::new(map, AccelProfile::None);
        // start somewhere, then home
        planner.move_to(Instant::now(), Vector4::new(4.0, 2.0, 0.0, 3.0), 10.0, -30.0, 30.0).unwrap();
        drain(&mut planner);
        planner.home_endstops(Instant::now(), 10.0).unwrap();
        assert!(planner.is_homing());
        let mut pulled = 0;
        while planner.peek_next_event().is_some() {
            planner.consume_next_event();
            pulled += 1;
            if pulled == 5 {
                for f in &flags {
                    f.store(true, Ordering::Relaxed);
                }
            }
            assert!(pulled < 1000, "homing never terminated");
        }
        assert!(planner.ready_for_next_move());
        // home resets the position axes and preserves the extruder count
        assert_eq!(*planner.mechanical_position(), [0, 0, 0, 3]);
    }
}
