// End-to-end runs of the whole pipeline: G-code in through the host
// channel, step events out through the hardware backend, with the
// simulated clock driving the event loop.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use motiond::com::HostChannel;
use motiond::config::Config;
use motiond::hardware::{EventKind, SimBackend};
use motiond::motion::AXIS_COUNT;
use motiond::printer::Printer;
use motiond::scheduler::SimClock;

#[derive(Clone, Default)]
struct NullOut(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for NullOut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl NullOut {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn unit_cartesian_config() -> Config {
    toml::from_str(
        r#"
        [printer]
        use_acceleration = false
        home_before_first_move = false
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
    .unwrap()
}

fn run(
    config: &Config,
    endstops: [Option<Arc<AtomicBool>>; AXIS_COUNT],
    backend: SimBackend,
    script: &[&str],
) -> (Printer<SimBackend, SimClock>, NullOut, i32) {
    let out = NullOut::default();
    let (tx, host) = HostChannel::pipe(Box::new(out.clone()));
    let mut printer =
        Printer::new(config, backend, SimClock::new(), host, endstops).unwrap();
    for line in script {
        tx.send(line.to_string()).unwrap();
    }
    drop(tx);
    let code = printer.run();
    (printer, out, code)
}

fn step_events(backend: &SimBackend) -> Vec<(std::time::Instant, usize, i32)> {
    backend
        .events()
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Step { axis, direction } => Some((e.time, axis, direction.signed())),
            _ => None,
        })
        .collect()
}

#[test]
fn straight_move_steps_are_evenly_spaced() {
    let backend = SimBackend::new();
    let (mut printer, out, code) =
        run(&unit_cartesian_config(), Default::default(), backend.clone(), &["G1 X10 F600"]);
    assert_eq!(code, 0);
    assert_eq!(printer.controller_mut().mechanical_position(), [10, 0, 0, 0]);
    let steps = step_events(&backend);
    assert_eq!(steps.len(), 10);
    for w in steps.windows(2) {
        let gap = w[1].0 - w[0].0;
        assert!(
            gap > Duration::from_millis(99) && gap < Duration::from_millis(101),
            "uneven spacing: {:?}",
            gap
        );
        assert_eq!(w[1].1, 0);
        assert_eq!(w[1].2, 1);
    }
    assert!(out.lines().iter().any(|l| l == "ok"));
}

#[test]
fn deadlines_never_decrease_across_a_print() {
    let backend = SimBackend::new();
    let script = [
        "G1 X10 Y5 E2 F900",
        "G1 X3 Y12 Z2 E4",
        "G91",
        "G1 X-2 Y-2 E1",
        "G90",
        "G1 X0 Y0 Z0 E6",
    ];
    let (mut printer, _, code) =
        run(&unit_cartesian_config(), Default::default(), backend.clone(), &script);
    assert_eq!(code, 0);
    let steps = step_events(&backend);
    assert!(steps.len() > 30);
    for w in steps.windows(2) {
        assert!(w[1].0 >= w[0].0, "deadline went backwards");
    }
    // no drift: emitted step deltas equal the final mechanical position
    let mut tally = [0i32; 4];
    for (_, axis, delta) in &steps {
        tally[*axis] += delta;
    }
    assert_eq!(tally, printer.controller_mut().mechanical_position());
    assert_eq!(printer.controller_mut().mechanical_position(), [0, 0, 0, 6]);
}

#[test]
fn homing_with_endstops_establishes_origin() {
    let mut config = unit_cartesian_config();
    for axis in ["x", "y", "z"] {
        config.steppers.get_mut(axis).unwrap().endstop_pin = Some(format!("ES_{}", axis));
    }
    let backend = SimBackend::new();
    // switches close after 7 steps of travel toward min
    let endstops = [
        Some(backend.add_endstop(0, -1, 7)),
        Some(backend.add_endstop(1, -1, 7)),
        Some(backend.add_endstop(2, -1, 7)),
        None,
    ];
    let (mut printer, _, code) =
        run(&config, endstops, backend.clone(), &["G1 X4 Y2 F600", "G28", "G1 X3"]);
    assert_eq!(code, 0);
    let c = printer.controller_mut();
    assert!(c.is_homed());
    assert_eq!(c.mechanical_position(), [3, 0, 0, 0]);
}

#[test]
fn arc_returns_to_start_after_full_quadrant_chain() {
    // quarter arc from (10,0) to (0,10) about the origin, counter-clockwise
    let backend = SimBackend::new();
    let script = ["G1 X10 F600", "G3 X0 Y10 I-10 J0"];
    let (mut printer, out, code) =
        run(&unit_cartesian_config(), Default::default(), backend.clone(), &script);
    assert_eq!(code, 0, "replies: {:?}", out.lines());
    let pos = printer.controller_mut().mechanical_position();
    assert!((pos[0]).abs() <= 1, "x ended at {}", pos[0]);
    assert!((pos[1] - 10).abs() <= 1, "y ended at {}", pos[1]);
    let steps = step_events(&backend);
    for w in steps.windows(2) {
        assert!(w[1].0 >= w[0].0);
    }
}

#[test]
fn m109_blocks_movement_until_hot() {
    let backend = SimBackend::new();
    let script = ["M109 S200", "G1 X5 F600", "M105"];
    let (mut printer, out, code) =
        run(&unit_cartesian_config(), Default::default(), backend.clone(), &script);
    assert_eq!(code, 0);
    // the move completed, which means the gate opened
    assert_eq!(printer.controller_mut().mechanical_position(), [5, 0, 0, 0]);
    // M105 ran after the wait and reports a temperature at or past target
    let report = out
        .lines()
        .into_iter()
        .find(|l| l.starts_with("ok T:"))
        .expect("no temperature report");
    let t: f64 = report
        .split_whitespace()
        .nth(1)
        .unwrap()
        .trim_start_matches("T:")
        .parse()
        .unwrap();
    assert!(t >= 199.0, "hotend only reached {}", t);
}

#[test]
fn file_print_via_m32_reaches_eof_and_exits() {
    let dir = std::env::temp_dir();
    let path = dir.join("motiond_pipeline_print.gcode");
    std::fs::write(&path, "G1 X2 F600\nG1 X4\n").unwrap();
    let backend = SimBackend::new();
    let script_line = format!("M32 {}", path.display());
    let script = [script_line.as_str()];
    let (mut printer, _, code) =
        run(&unit_cartesian_config(), Default::default(), backend.clone(), &script);
    assert_eq!(code, 0);
    assert_eq!(printer.controller_mut().mechanical_position(), [4, 0, 0, 0]);
    let _ = std::fs::remove_file(path);
}

#[test]
fn delta_vertical_move_keeps_carriages_in_lockstep() {
    let config: Config = toml::from_str(
        r#"
        [printer]
        geometry = "linear_delta"
        use_acceleration = false
        home_before_first_move = false
        [delta]
        rod_length = 250.0
        radius = 100.0
        home_height = 180.0
        build_radius = 90.0
        [steppers.a]
        steps_per_mm = 10.0
        endstop_pin = "ES_A"
        [steppers.b]
        steps_per_mm = 10.0
        endstop_pin = "ES_B"
        [steppers.c]
        steps_per_mm = 10.0
        endstop_pin = "ES_C"
        [steppers.e]
        steps_per_mm = 10.0
    "#,
    )
    .unwrap();
    let backend = SimBackend::new();
    let endstops = [
        Some(backend.add_endstop(0, 1, 11)),
        Some(backend.add_endstop(1, 1, 11)),
        Some(backend.add_endstop(2, 1, 11)),
        None,
    ];
    let (mut printer, out, code) =
        run(&config, endstops, backend.clone(), &["G28", "G1 Z100 F600"]);
    assert_eq!(code, 0, "replies: {:?}", out.lines());
    let pos = printer.controller_mut().mechanical_position();
    // all three carriages moved identically and sit below home
    assert_eq!(pos[0], pos[1]);
    assert_eq!(pos[1], pos[2]);
    let d_home = 180.0 + (250.0_f64 * 250.0 - 100.0 * 100.0).sqrt();
    let home_steps = (d_home * 10.0).round() as i32;
    assert!(pos[0] < home_steps);
    // carriage height tracks z exactly on the center column
    let d_z100 = 100.0 + (250.0_f64 * 250.0 - 100.0 * 100.0).sqrt();
    let expected = (d_z100 * 10.0).round() as i32;
    assert!((pos[0] - expected).abs() <= 1, "carriage at {} expected {}", pos[0], expected);
    // during the descent no carriage ever stepped upward
    let steps = step_events(&backend);
    let descent: Vec<_> = steps.iter().skip_while(|s| s.2 == 1).collect();
    assert!(descent.len() > 100, "no descent happened");
    assert!(descent.iter().all(|s| s.2 == -1 || s.1 == 3), "carriage reversed mid-descent");
}
