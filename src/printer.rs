// src/printer.rs
//
// The command-level state machine: G-code dispatch, coordinate semantics
// (units, relative mode, host zero), the homing choreography, heater waits
// and shutdown sequencing. The Controller implements the scheduler's idle
// hook, which is where all of this actually runs; the Printer bundles it
// with the scheduler that owns the thread.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::com::{GcodeFileStack, HostChannel, Response};
use crate::config::{Config, ConfigError};
use crate::gcode::{parser, Command};
use crate::hardware::io::{self, EndstopDriver, FanDriver, HeaterDriver, IoDriver};
use crate::hardware::temperature::PidController;
use crate::hardware::{HardwareBackend, OutputEvent, PinMap};
use crate::motion::acceleration::AccelProfile;
use crate::motion::kinematics::{CoordMap, HomePhase};
use crate::motion::{MotionError, MotionPlanner, Vector3, Vector4, AXIS_COUNT};
use crate::scheduler::{Clock, IdleHandler, IdleInterval, Scheduler, SchedulerState};

const MM_PER_IN: f64 = 25.4;

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("motion error: {0}")]
    Motion(#[from] MotionError),
    #[error("hardware error: {0}")]
    Hardware(#[from] crate::hardware::HardwareError),
}

/// How the host wants coordinates interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionMode {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LengthUnit {
    Mm,
    Inches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandSource {
    Host,
    File,
}

/// A command either completes with exactly one reply, or is not ready yet
/// and will be retried on a later idle cycle (no reply until then).
enum Outcome {
    Done(Response),
    Deferred,
}

pub type LogLevelHook = Box<dyn FnMut(LevelFilter) + Send>;

/// Everything the idle hook drives. Owns the planner (and through it the
/// mechanical position), the IO drivers and the host channel.
pub struct Controller {
    planner: MotionPlanner,
    io_drivers: Vec<IoDriver>,
    host: HostChannel,
    file_stack: GcodeFileStack,
    pending: Option<(Command, CommandSource)>,

    position_mode: PositionMode,
    extruder_mode: PositionMode,
    unit_mode: LengthUnit,
    /// Last commanded destination in machine mm; relative moves build on
    /// this rather than on the step-quantized position, so rounding never
    /// accumulates.
    dest_mm: Vector4,
    host_zero: Vector4,
    feed_rate: f64,

    max_velocity: f64,
    max_extrude_rate: f64,
    max_retract_rate: f64,
    home_before_first_move: bool,

    is_homed: bool,
    homing_active: bool,
    home_phases: VecDeque<HomePhase>,
    move_buffering: bool,
    last_planned: Option<Instant>,
    waiting_for_hotend: bool,
    shutdown_after_move: bool,
    eof_noticed: bool,
    exit_code: i32,
    log_hook: Option<LogLevelHook>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("dest_mm", &self.dest_mm)
            .field("is_homed", &self.is_homed)
            .field("homing_active", &self.homing_active)
            .finish()
    }
}

/// The assembled machine: controller plus the scheduler that owns the
/// thread.
pub struct Printer<B, C> {
    scheduler: Scheduler<B, C>,
    controller: Controller,
}

impl<B: HardwareBackend, C: Clock> Printer<B, C> {
    /// Wire up the whole machine from config. `endstop_inputs` are the raw
    /// per-motor switch states from the hardware layer (None for axes
    /// without a switch).
    pub fn new(
        config: &Config,
        backend: B,
        clock: C,
        host: HostChannel,
        endstop_inputs: [Option<Arc<AtomicBool>>; AXIS_COUNT],
    ) -> Result<Self, PrinterError> {
        config.validate()?;
        let mut pins = PinMap::new();
        let mut io_drivers = Vec::new();
        let mut published: [Option<Arc<AtomicBool>>; AXIS_COUNT] = Default::default();
        for (axis, input) in endstop_inputs.into_iter().enumerate() {
            if let Some(input) = input {
                let driver = EndstopDriver::new(input);
                published[axis] = Some(driver.state());
                io_drivers.push(IoDriver::Endstop(driver));
            }
        }
        if !config.fan.pin.is_empty() {
            let pin = pins.intern(&config.fan.pin);
            io_drivers.push(IoDriver::Fan(FanDriver::new(
                pin,
                Duration::from_secs_f64(config.fan.pwm_period),
            )));
        }
        // heaters fall back to named logical pins so the two PWM channels
        // stay distinct even without a pin assignment in the config
        let hotend_name =
            if config.hotend.heater_pin.is_empty() { "hotend" } else { &config.hotend.heater_pin };
        let hotend_pin = pins.intern(hotend_name);
        io_drivers.push(IoDriver::Hotend(HeaterDriver::new(
            hotend_pin,
            Duration::from_secs_f64(config.hotend.pwm_period),
            PidController::new(config.hotend.pid_kp, config.hotend.pid_ki, config.hotend.pid_kd),
        )));
        let bed_name = if config.bed.heater_pin.is_empty() { "bed" } else { &config.bed.heater_pin };
        let bed_pin = pins.intern(bed_name);
        io_drivers.push(IoDriver::Bed(HeaterDriver::new(
            bed_pin,
            Duration::from_secs_f64(config.bed.pwm_period),
            PidController::new(config.bed.pid_kp, config.bed.pid_ki, config.bed.pid_kd),
        )));

        let coord_map = CoordMap::from_config(config, published)?;
        let accel = if config.printer.use_acceleration {
            AccelProfile::trapezoidal(config.printer.max_accel)
        } else {
            AccelProfile::None
        };
        let planner = MotionPlanner::new(coord_map, accel);
        let scheduler = Scheduler::new(backend, clock, &config.scheduler);

        let controller = Controller {
            planner,
            io_drivers,
            host,
            file_stack: GcodeFileStack::new(),
            pending: None,
            position_mode: PositionMode::Absolute,
            extruder_mode: PositionMode::Absolute,
            unit_mode: LengthUnit::Mm,
            dest_mm: Vector4::ZERO,
            host_zero: Vector4::ZERO,
            feed_rate: config.printer.default_move_rate,
            max_velocity: config.printer.max_velocity,
            max_extrude_rate: config.printer.max_extrude_rate,
            max_retract_rate: config.printer.max_retract_rate,
            home_before_first_move: config.printer.home_before_first_move,
            is_homed: false,
            homing_active: false,
            home_phases: VecDeque::new(),
            move_buffering: true,
            last_planned: None,
            waiting_for_hotend: false,
            shutdown_after_move: false,
            eof_noticed: false,
            exit_code: 0,
            log_hook: None,
        };
        Ok(Self { scheduler, controller })
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<B, C> {
        &mut self.scheduler
    }

    /// Run to completion (M0, M99 at top level, or host EOF). Returns the
    /// process exit code.
    pub fn run(&mut self) -> i32 {
        let now = self.scheduler.clock_mut().now();
        self.scheduler.backend_mut().emit(&OutputEvent::motor_power(now, true));
        self.scheduler.event_loop(&mut self.controller);
        let now = self.scheduler.clock_mut().now();
        self.scheduler.backend_mut().emit(&OutputEvent::motor_power(now, false));
        self.controller.exit_code
    }
}

impl IdleHandler for Controller {
    fn on_idle_cpu(
        &mut self,
        interval: IdleInterval,
        sched: &mut SchedulerState,
        now: Instant,
    ) -> bool {
        let mut wants_cpu = false;
        if sched.has_room() {
            // While homing, buffering is off: the next step is only planned
            // once the previous one has actually fired, so the endstop poll
            // between them is honored.
            if self.move_buffering || self.last_planned.map_or(true, |t| t <= now) {
                if let Some(event) = self.planner.consume_next_event() {
                    self.last_planned = Some(event.time);
                    sched.queue(event);
                    wants_cpu = sched.has_room() && self.planner.peek_next_event().is_some();
                }
            }
        }
        if self.planner.ready_for_next_move() {
            self.advance_home_routine(sched, now);
            if self.shutdown_after_move
                && !self.homing_active
                && self.pending.is_none()
                && sched.pending_events() == 0
            {
                tracing::info!("queued moves finished; leaving event loop");
                sched.exit_event_loop();
                return false;
            }
        }
        if interval == IdleInterval::Wide {
            self.tend_commands(sched, now);
        }
        wants_cpu |= io::poll_all(&mut self.io_drivers, sched, now);
        wants_cpu
    }
}

impl Controller {
    pub fn set_log_hook(&mut self, hook: LogLevelHook) {
        self.log_hook = Some(hook);
    }

    /// Start printing a G-code file, as if the host had sent M32.
    pub fn print_file(&mut self, path: &str) -> std::io::Result<()> {
        self.file_stack.push(path)
    }

    pub fn mechanical_position(&self) -> [i32; AXIS_COUNT] {
        *self.planner.mechanical_position()
    }

    pub fn cartesian_position(&self) -> Vector4 {
        self.planner.cartesian_position()
    }

    pub fn is_homed(&self) -> bool {
        self.is_homed
    }

    fn next_start_time(&self, now: Instant) -> Instant {
        match self.last_planned {
            Some(t) if t > now => t,
            _ => now,
        }
    }

    // ---- host / file servicing ----

    fn tend_commands(&mut self, sched: &mut SchedulerState, now: Instant) {
        // a deferred command blocks everything behind it on its channel
        if let Some((cmd, source)) = self.pending.take() {
            match self.execute(&cmd, sched, now) {
                Outcome::Done(resp) => self.send_reply(&resp, source),
                Outcome::Deferred => {
                    self.pending = Some((cmd, source));
                    return;
                }
            }
        }
        // host first, so emergency commands outrun a file print
        if let Some(line) = self.host.try_recv() {
            self.handle_line(&line, CommandSource::Host, sched, now);
        }
        if self.pending.is_none() {
            if let Some(line) = self.file_stack.next_line() {
                self.handle_line(&line, CommandSource::File, sched, now);
            }
        }
        if self.host.is_eof()
            && self.file_stack.is_empty()
            && self.pending.is_none()
            && !self.eof_noticed
        {
            self.eof_noticed = true;
            tracing::info!("host channel closed; finishing queued moves");
            self.shutdown_after_move = true;
        }
    }

    fn handle_line(&mut self, line: &str, source: CommandSource, sched: &mut SchedulerState, now: Instant) {
        match parser::parse_line(line) {
            Ok(None) => {}
            Ok(Some(cmd)) => match self.execute(&cmd, sched, now) {
                Outcome::Done(resp) => self.send_reply(&resp, source),
                Outcome::Deferred => self.pending = Some((cmd, source)),
            },
            Err(e) => self.send_reply(&Response::Error(e.to_string()), source),
        }
    }

    fn send_reply(&mut self, resp: &Response, source: CommandSource) {
        match source {
            CommandSource::Host => self.host.reply(resp),
            CommandSource::File => tracing::debug!("file command reply: {}", resp),
        }
    }

    // ---- homing ----

    fn begin_home_routine(&mut self) {
        self.homing_active = true;
        self.home_phases = self.planner.coord_map().home_routine().into();
        tracing::info!("homing: {} phase(s)", self.home_phases.len());
    }

    fn advance_home_routine(&mut self, sched: &mut SchedulerState, now: Instant) {
        if !self.homing_active || !self.planner.ready_for_next_move() {
            return;
        }
        match self.home_phases.pop_front() {
            Some(HomePhase::RunEndstops) => {
                self.move_buffering = false;
                sched.set_max_sleep(Duration::from_millis(1));
                sched.set_buffer_size(sched.active_pwm_count() + 1);
                let start = self.next_start_time(now);
                if let Err(e) = self.planner.home_endstops(start, self.max_velocity) {
                    tracing::error!("failed to start endstop run: {}", e);
                }
            }
            Some(HomePhase::MoveTo { x, y, z, velocity }) => {
                let cur = self.planner.cartesian_position();
                let start = self.next_start_time(now);
                if let Err(e) = self.planner.move_to(
                    start,
                    Vector4::new(x, y, z, cur.e),
                    velocity.unwrap_or(self.feed_rate),
                    -self.max_retract_rate,
                    self.max_extrude_rate,
                ) {
                    tracing::error!("homing settle move rejected: {}", e);
                }
            }
            None => {
                self.homing_active = false;
                self.is_homed = true;
                self.move_buffering = true;
                sched.restore_default_max_sleep();
                sched.restore_default_buffer_size();
                self.dest_mm = self.planner.cartesian_position();
                tracing::info!(
                    "homing complete, mechanical position {:?}",
                    self.planner.mechanical_position()
                );
            }
        }
    }

    // ---- coordinate semantics ----

    fn unit_mm(&self, v: f64) -> f64 {
        match self.unit_mode {
            LengthUnit::Mm => v,
            LengthUnit::Inches => v * MM_PER_IN,
        }
    }

    /// Resolve the destination of a movement command against unit mode,
    /// host zero and relative mode, per axis. Relative values build on the
    /// last commanded destination and ignore the host-zero offset.
    fn resolve_dest(&self, cmd: &Command) -> Vector4 {
        let resolve = |letter: char, cur: f64, mode: PositionMode, offset: f64| match cmd
            .get(letter)
        {
            None => cur,
            Some(v) => {
                let mm = self.unit_mm(v);
                match mode {
                    PositionMode::Relative => cur + mm,
                    PositionMode::Absolute => mm + offset,
                }
            }
        };
        Vector4::new(
            resolve('X', self.dest_mm.x, self.position_mode, self.host_zero.x),
            resolve('Y', self.dest_mm.y, self.position_mode, self.host_zero.y),
            resolve('Z', self.dest_mm.z, self.position_mode, self.host_zero.z),
            resolve('E', self.dest_mm.e, self.extruder_mode, self.host_zero.e),
        )
    }

    fn hotend_ready(&mut self) -> bool {
        if self.waiting_for_hotend {
            let (current, target) = io::hotend_temps(&self.io_drivers);
            self.waiting_for_hotend = current < target;
        }
        !self.waiting_for_hotend
    }

    /// Common gate for everything that moves steppers. Also kicks off the
    /// automatic first home when configured.
    fn movement_ready(&mut self, auto_home: bool) -> bool {
        if !self.planner.ready_for_next_move() || self.homing_active {
            return false;
        }
        if !self.hotend_ready() {
            return false;
        }
        if auto_home && !self.is_homed && self.home_before_first_move {
            self.begin_home_routine();
            return false;
        }
        true
    }

    // ---- command dispatch ----

    fn execute(&mut self, cmd: &Command, sched: &mut SchedulerState, now: Instant) -> Outcome {
        match cmd.opcode.as_str() {
            "G0" | "G1" => self.execute_linear_move(cmd, now),
            "G2" | "G3" => self.execute_arc_move(cmd, now),
            "G20" => {
                self.unit_mode = LengthUnit::Inches;
                Outcome::Done(Response::Ok)
            }
            "G21" => {
                self.unit_mode = LengthUnit::Mm;
                Outcome::Done(Response::Ok)
            }
            "G28" => {
                if !self.movement_ready(false) {
                    return Outcome::Deferred;
                }
                // reply first: homing takes a while and the host is waiting
                self.begin_home_routine();
                Outcome::Done(Response::Ok)
            }
            "G90" => {
                self.position_mode = PositionMode::Absolute;
                self.extruder_mode = PositionMode::Absolute;
                Outcome::Done(Response::Ok)
            }
            "G91" => {
                self.position_mode = PositionMode::Relative;
                self.extruder_mode = PositionMode::Relative;
                Outcome::Done(Response::Ok)
            }
            "G92" => self.execute_set_host_zero(cmd),
            "M0" => {
                tracing::info!("M0: finishing queued moves, then exiting");
                self.shutdown_after_move = true;
                Outcome::Done(Response::Ok)
            }
            "M17" => self.queue_motor_power(sched, now, true),
            "M18" | "M84" => self.queue_motor_power(sched, now, false),
            "M21" | "M22" | "M110" => Outcome::Done(Response::Ok),
            opcode if opcode.starts_with('T') => Outcome::Done(Response::Ok),
            "M32" => match cmd.text.as_deref() {
                Some(path) => match self.file_stack.push(path) {
                    Ok(()) => Outcome::Done(Response::Ok),
                    Err(e) => Outcome::Done(Response::Error(format!("cannot open '{}': {}", path, e))),
                },
                None => Outcome::Done(Response::Error("M32 needs a filename".to_string())),
            },
            "M82" => {
                self.extruder_mode = PositionMode::Absolute;
                Outcome::Done(Response::Ok)
            }
            "M83" => {
                self.extruder_mode = PositionMode::Relative;
                Outcome::Done(Response::Ok)
            }
            "M99" => {
                if self.file_stack.pop() {
                    Outcome::Done(Response::Ok)
                } else {
                    tracing::warn!("M99 outside a subprogram; shutting down");
                    self.shutdown_after_move = true;
                    Outcome::Done(Response::Ok)
                }
            }
            "M104" => {
                if let Some(t) = cmd.get('S') {
                    io::set_hotend_target(&mut self.io_drivers, t);
                }
                Outcome::Done(Response::Ok)
            }
            "M105" => {
                let (hotend, _) = io::hotend_temps(&self.io_drivers);
                let (bed, _) = io::bed_temps(&self.io_drivers);
                Outcome::Done(Response::OkWith(vec![
                    ("T".to_string(), format!("{:.1}", hotend)),
                    ("B".to_string(), format!("{:.1}", bed)),
                ]))
            }
            "M106" => {
                let mut s = cmd.get('S').unwrap_or(1.0);
                if s > 1.0 {
                    // host is using the 0-255 convention
                    s /= 256.0;
                }
                io::set_fan_duty(&mut self.io_drivers, s);
                Outcome::Done(Response::Ok)
            }
            "M107" => {
                io::set_fan_duty(&mut self.io_drivers, 0.0);
                Outcome::Done(Response::Ok)
            }
            "M109" => {
                if let Some(t) = cmd.get('S') {
                    io::set_hotend_target(&mut self.io_drivers, t);
                }
                self.waiting_for_hotend = true;
                Outcome::Done(Response::Ok)
            }
            "M111" => {
                let bits = cmd.get('S').unwrap_or(0.0) as u32;
                let level = if bits & 1 != 0 {
                    LevelFilter::TRACE
                } else if bits & 2 != 0 {
                    LevelFilter::DEBUG
                } else if bits & 4 != 0 {
                    LevelFilter::INFO
                } else {
                    LevelFilter::WARN
                };
                if let Some(hook) = &mut self.log_hook {
                    hook(level);
                }
                Outcome::Done(Response::Ok)
            }
            "M112" => {
                self.host.reply(&Response::Ok);
                tracing::error!("M112 emergency stop");
                std::process::exit(1);
            }
            "M115" => Outcome::Done(Response::OkWith(vec![
                ("FIRMWARE_NAME".to_string(), "motiond".to_string()),
                ("FIRMWARE_VERSION".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ])),
            "M116" => {
                self.waiting_for_hotend = true;
                Outcome::Done(Response::Ok)
            }
            "M117" => {
                if let Some(msg) = &cmd.text {
                    tracing::info!("display message: {}", msg);
                }
                Outcome::Done(Response::Ok)
            }
            "M140" => {
                if let Some(t) = cmd.get('S') {
                    io::set_bed_target(&mut self.io_drivers, t);
                }
                Outcome::Done(Response::Ok)
            }
            other => Outcome::Done(Response::Error(format!("unknown opcode '{}'", other))),
        }
    }

    fn execute_linear_move(&mut self, cmd: &Command, now: Instant) -> Outcome {
        if !self.movement_ready(true) {
            return Outcome::Deferred;
        }
        if let Some(f) = cmd.get('F') {
            // F is mm/min regardless of unit mode
            self.feed_rate = (f / 60.0).clamp(0.1, self.max_velocity);
        }
        let dest = self.resolve_dest(cmd);
        let start = self.next_start_time(now);
        match self.planner.move_to(
            start,
            dest,
            self.feed_rate,
            -self.max_retract_rate,
            self.max_extrude_rate,
        ) {
            Ok(()) => {
                // track the requested point, not the step-quantized one
                self.dest_mm = dest;
                Outcome::Done(Response::Ok)
            }
            Err(e) => Outcome::Done(Response::Error(e.to_string())),
        }
    }

    fn execute_arc_move(&mut self, cmd: &Command, now: Instant) -> Outcome {
        if !self.movement_ready(true) {
            return Outcome::Deferred;
        }
        if let Some(f) = cmd.get('F') {
            self.feed_rate = (f / 60.0).clamp(0.1, self.max_velocity);
        }
        let dest = self.resolve_dest(cmd);
        let center = self.dest_mm.xyz()
            + Vector3::new(
                self.unit_mm(cmd.get('I').unwrap_or(0.0)),
                self.unit_mm(cmd.get('J').unwrap_or(0.0)),
                self.unit_mm(cmd.get('K').unwrap_or(0.0)),
            );
        let start = self.next_start_time(now);
        match self.planner.arc_to(
            start,
            dest,
            center,
            self.feed_rate,
            -self.max_retract_rate,
            self.max_extrude_rate,
            cmd.opcode == "G2",
        ) {
            Ok(()) => {
                self.dest_mm = dest;
                Outcome::Done(Response::Ok)
            }
            Err(e) => Outcome::Done(Response::Error(e.to_string())),
        }
    }

    /// G92: redefine the host's origin so the current position reads as the
    /// given coordinates (all zero when none are given).
    fn execute_set_host_zero(&mut self, cmd: &Command) -> Outcome {
        if !cmd.has_any_xyze() {
            self.host_zero = self.dest_mm;
            return Outcome::Done(Response::Ok);
        }
        let current_zeroed = self.dest_mm - self.host_zero;
        let pick = |letter: char, fallback: f64| {
            cmd.get(letter).map(|v| self.unit_mm(v)).unwrap_or(fallback)
        };
        let claimed = Vector4::new(
            pick('X', current_zeroed.x),
            pick('Y', current_zeroed.y),
            pick('Z', current_zeroed.z),
            pick('E', current_zeroed.e),
        );
        self.host_zero = self.dest_mm - claimed;
        Outcome::Done(Response::Ok)
    }

    fn queue_motor_power(&mut self, sched: &mut SchedulerState, now: Instant, on: bool) -> Outcome {
        if !sched.has_room() {
            return Outcome::Deferred;
        }
        sched.queue(OutputEvent::motor_power(now, on));
        Outcome::Done(Response::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimBackend;
    use crate::scheduler::SimClock;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedOut(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedOut {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedOut {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn test_config() -> Config {
        let mut config: Config = toml::from_str(
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
        .unwrap();
        config.printer.printer_name = Some("test".to_string());
        config
    }

    struct Rig {
        printer: Printer<SimBackend, SimClock>,
        tx: tokio::sync::mpsc::UnboundedSender<String>,
        out: SharedOut,
        backend: SimBackend,
    }

    fn rig() -> Rig {
        let backend = SimBackend::new();
        let clock = SimClock::new();
        let out = SharedOut::default();
        let (tx, host) = HostChannel::pipe(Box::new(out.clone()));
        let printer =
            Printer::new(&test_config(), backend.clone(), clock, host, [None, None, None, None])
                .unwrap();
        Rig { printer, tx, out, backend }
    }

    fn run_script(r: &mut Rig, script: &[&str]) -> i32 {
        for line in script {
            r.tx.send(line.to_string()).unwrap();
        }
        // drop the sender so the controller sees EOF after the script
        let (dead_tx, _) = tokio::sync::mpsc::unbounded_channel();
        drop(std::mem::replace(&mut r.tx, dead_tx));
        r.printer.run()
    }

    #[test]
    fn scenario_straight_move() {
        let mut r = rig();
        let code = run_script(&mut r, &["G1 X10 F600"]);
        assert_eq!(code, 0);
        assert_eq!(r.printer.controller_mut().mechanical_position(), [10, 0, 0, 0]);
        assert_eq!(r.backend.step_counts()[0], 10);
        assert!(r.out.lines().iter().all(|l| l == "ok"));
    }

    #[test]
    fn scenario_relative_round_trip() {
        let mut r = rig();
        run_script(&mut r, &["G91", "G1 X5 F600", "G1 X5", "G90", "G1 X0"]);
        assert_eq!(r.printer.controller_mut().mechanical_position(), [0, 0, 0, 0]);
        // 10 forward then 10 backward steps, no shortcuts
        let steps: Vec<i32> = r
            .backend
            .events()
            .iter()
            .filter_map(|e| match e.kind {
                crate::hardware::EventKind::Step { axis: 0, direction } => Some(direction.signed()),
                _ => None,
            })
            .collect();
        assert_eq!(steps.len(), 20);
        assert!(steps[..10].iter().all(|&s| s == 1));
        assert!(steps[10..].iter().all(|&s| s == -1));
    }

    #[test]
    fn scenario_host_zero_offset() {
        let mut r = rig();
        run_script(&mut r, &["G1 X10 F600", "G92 X0", "G1 X5"]);
        let c = r.printer.controller_mut();
        assert_eq!(c.mechanical_position(), [15, 0, 0, 0]);
        assert!((c.dest_mm.x - 15.0).abs() < 1e-12);
        assert!((c.host_zero.x - 10.0).abs() < 1e-12);
    }

    #[test]
    fn g92_is_idempotent() {
        let mut r = rig();
        run_script(&mut r, &["G1 X10 F600", "G92 X3", "G92 X3", "G1 X5"]);
        // X5 in host coords = 5 + (10 - 3) = 12 machine mm
        assert_eq!(r.printer.controller_mut().mechanical_position(), [12, 0, 0, 0]);
    }

    #[test]
    fn inch_mode_scales_coordinates() {
        let mut r = rig();
        run_script(&mut r, &["G20", "G1 X1 F600", "G21", "G1 X30"]);
        // 1 in = 25.4 mm rounds to 25 steps, then 30 mm exactly
        assert_eq!(r.printer.controller_mut().mechanical_position(), [30, 0, 0, 0]);
        assert_eq!(r.backend.step_counts()[0], 30);
    }

    #[test]
    fn extrusion_interleaves_with_travel() {
        let mut r = rig();
        run_script(&mut r, &["G1 X10 E5 F600"]);
        assert_eq!(r.printer.controller_mut().mechanical_position(), [10, 0, 0, 5]);
        let events = r.backend.events();
        let mut last = None;
        for e in &events {
            if let crate::hardware::EventKind::Step { .. } = e.kind {
                if let Some(prev) = last {
                    assert!(e.time >= prev);
                }
                last = Some(e.time);
            }
        }
    }

    #[test]
    fn home_resets_position_without_endstops() {
        let mut r = rig();
        run_script(&mut r, &["G1 X4 Y2 F600", "G28", "G1 X3"]);
        // after G28 the machine is at origin; X3 is 3 steps out
        assert_eq!(r.printer.controller_mut().mechanical_position(), [3, 0, 0, 0]);
        assert!(r.printer.controller_mut().is_homed());
    }

    #[test]
    fn m105_reports_temperatures() {
        let mut r = rig();
        run_script(&mut r, &["M105"]);
        let lines = r.out.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok T:"), "got '{}'", lines[0]);
        assert!(lines[0].contains(" B:"));
    }

    #[test]
    fn unknown_opcode_gets_error_reply() {
        let mut r = rig();
        run_script(&mut r, &["M999", "G1 X1 F600"]);
        let lines = r.out.lines();
        assert!(lines[0].starts_with("!!"), "got '{}'", lines[0]);
        assert_eq!(lines[1], "ok");
        // the bad command did not derail the move
        assert_eq!(r.printer.controller_mut().mechanical_position(), [1, 0, 0, 0]);
    }

    #[test]
    fn out_of_bounds_move_is_reported_not_planned() {
        let mut r = rig();
        run_script(&mut r, &["G1 X9999 F600", "G1 X5"]);
        let lines = r.out.lines();
        assert!(lines[0].starts_with("!!"));
        assert_eq!(r.printer.controller_mut().mechanical_position(), [5, 0, 0, 0]);
    }

    #[test]
    fn m0_exits_cleanly_after_moves() {
        let mut r = rig();
        let code = run_script(&mut r, &["G1 X3 F600", "M0"]);
        assert_eq!(code, 0);
        assert_eq!(r.backend.step_counts()[0], 3);
        // motors are powered down on the way out
        assert!(!r.backend.motors_enabled());
    }

    #[test]
    fn m106_fan_duty_conventions() {
        let mut config = test_config();
        config.fan.pin = "GPIO18".to_string();
        let backend = SimBackend::new();
        let out = SharedOut::default();
        let (tx, host) = HostChannel::pipe(Box::new(out.clone()));
        let mut printer = Printer::new(
            &config,
            backend.clone(),
            SimClock::new(),
            host,
            [None, None, None, None],
        )
        .unwrap();
        tx.send("M106 S128".to_string()).unwrap();
        drop(tx);
        printer.run();
        // duty 128/256 = 0.5 shows up as PWM edges on the fan pin
        let edges: Vec<_> = backend
            .events()
            .iter()
            .filter(|e| matches!(e.kind, crate::hardware::EventKind::SetPin { .. }))
            .cloned()
            .collect();
        assert!(!edges.is_empty());
    }
}
