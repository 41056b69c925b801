// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main configuration struct for the printer, steppers, heaters and the
/// event scheduler. Everything here is build-time in spirit: it is read once
/// at startup and never changed while the machine runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub leveling: Option<LevelingConfig>,
    #[serde(default)]
    pub steppers: HashMap<String, StepperConfig>,
    #[serde(default)]
    pub hotend: HeaterConfig,
    #[serde(default)]
    pub bed: HeaterConfig,
    #[serde(default)]
    pub fan: FanConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            printer: PrinterConfig::default(),
            delta: DeltaConfig::default(),
            leveling: None,
            steppers: HashMap::new(),
            hotend: HeaterConfig::default(),
            bed: HeaterConfig::default(),
            fan: FanConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Printer-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub printer_name: Option<String>,
    /// "cartesian", "corexy" or "linear_delta"
    #[serde(default = "default_geometry")]
    pub geometry: String,
    /// mm/s
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    /// mm/s^2, used by the trapezoidal acceleration profile
    #[serde(default = "default_max_accel")]
    pub max_accel: f64,
    /// mm/s, forward extrusion limit
    #[serde(default = "default_max_extrude_rate")]
    pub max_extrude_rate: f64,
    /// mm/s, retraction limit
    #[serde(default = "default_max_extrude_rate")]
    pub max_retract_rate: f64,
    /// mm/s, feed rate before the host sends any F word
    #[serde(default = "default_move_rate")]
    pub default_move_rate: f64,
    #[serde(default = "default_envelope_min")]
    pub envelope_min: [f64; 3],
    #[serde(default = "default_envelope_max")]
    pub envelope_max: [f64; 3],
    /// Whether a movement command before any G28 triggers an automatic home.
    #[serde(default = "default_true")]
    pub home_before_first_move: bool,
    /// Use the trapezoidal acceleration profile instead of constant velocity.
    #[serde(default = "default_true")]
    pub use_acceleration: bool,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            printer_name: None,
            geometry: default_geometry(),
            max_velocity: default_max_velocity(),
            max_accel: default_max_accel(),
            max_extrude_rate: default_max_extrude_rate(),
            max_retract_rate: default_max_extrude_rate(),
            default_move_rate: default_move_rate(),
            envelope_min: default_envelope_min(),
            envelope_max: default_envelope_max(),
            home_before_first_move: default_true(),
            use_acceleration: default_true(),
        }
    }
}

/// Geometry parameters for linear-delta machines. Ignored for the others.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeltaConfig {
    /// Rod length L, mm
    #[serde(default = "default_rod_length")]
    pub rod_length: f64,
    /// Tower circle radius r, mm
    #[serde(default = "default_delta_radius")]
    pub radius: f64,
    /// Effector height when all carriages rest at their endstops, mm
    #[serde(default = "default_home_height")]
    pub home_height: f64,
    /// Printable radius, mm
    #[serde(default = "default_build_radius")]
    pub build_radius: f64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            rod_length: default_rod_length(),
            radius: default_delta_radius(),
            home_height: default_home_height(),
            build_radius: default_build_radius(),
        }
    }
}

/// Bed tilt compensation plane: z' = z + x_slope*x + y_slope*y.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
pub struct LevelingConfig {
    #[serde(default)]
    pub x_slope: f64,
    #[serde(default)]
    pub y_slope: f64,
}

/// Per-motor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepperConfig {
    #[serde(default = "default_steps_per_mm")]
    pub steps_per_mm: f64,
    #[serde(default)]
    pub step_pin: String,
    #[serde(default)]
    pub dir_pin: String,
    #[serde(default)]
    pub enable_pin: String,
    #[serde(default)]
    pub endstop_pin: Option<String>,
    /// +1 homes toward max (delta towers), -1 toward min. None picks the
    /// geometry default.
    #[serde(default)]
    pub home_dir: Option<i8>,
    /// mm/s while seeking the endstop
    #[serde(default = "default_home_velocity")]
    pub home_velocity: f64,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            steps_per_mm: default_steps_per_mm(),
            step_pin: String::new(),
            dir_pin: String::new(),
            enable_pin: String::new(),
            endstop_pin: None,
            home_dir: None,
            home_velocity: default_home_velocity(),
        }
    }
}

/// Heater configuration (hotend or bed).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaterConfig {
    #[serde(default)]
    pub heater_pin: String,
    #[serde(default = "default_pid_kp")]
    pub pid_kp: f64,
    #[serde(default = "default_pid_ki")]
    pub pid_ki: f64,
    #[serde(default = "default_pid_kd")]
    pub pid_kd: f64,
    /// Longest tolerable PWM period, seconds
    #[serde(default = "default_pwm_period")]
    pub pwm_period: f64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            heater_pin: String::new(),
            pid_kp: default_pid_kp(),
            pid_ki: default_pid_ki(),
            pid_kd: default_pid_kd(),
            pwm_period: default_pwm_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FanConfig {
    #[serde(default)]
    pub pin: String,
    #[serde(default = "default_pwm_period")]
    pub pwm_period: f64,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self { pin: String::new(), pwm_period: default_pwm_period() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Longest the event loop may sleep between idle polls, milliseconds
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { buffer_size: default_buffer_size(), max_sleep_ms: default_max_sleep_ms() }
    }
}

fn default_geometry() -> String {
    "cartesian".to_string()
}
fn default_max_velocity() -> f64 {
    200.0
}
fn default_max_accel() -> f64 {
    1500.0
}
fn default_max_extrude_rate() -> f64 {
    30.0
}
fn default_move_rate() -> f64 {
    50.0
}
fn default_envelope_min() -> [f64; 3] {
    [0.0, 0.0, 0.0]
}
fn default_envelope_max() -> [f64; 3] {
    [200.0, 200.0, 180.0]
}
fn default_rod_length() -> f64 {
    250.0
}
fn default_delta_radius() -> f64 {
    100.0
}
fn default_home_height() -> f64 {
    180.0
}
fn default_build_radius() -> f64 {
    90.0
}
fn default_steps_per_mm() -> f64 {
    80.0
}
fn default_home_velocity() -> f64 {
    10.0
}
fn default_pid_kp() -> f64 {
    20.0
}
fn default_pid_ki() -> f64 {
    1.0
}
fn default_pid_kd() -> f64 {
    100.0
}
fn default_pwm_period() -> f64 {
    0.1
}
fn default_buffer_size() -> usize {
    64
}
fn default_max_sleep_ms() -> u64 {
    40
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Mechanical axis names for the configured geometry, in motor order.
    pub fn axis_names(&self) -> Result<[&'static str; 4], ConfigError> {
        match self.printer.geometry.as_str() {
            "cartesian" => Ok(["x", "y", "z", "e"]),
            "corexy" => Ok(["a", "b", "z", "e"]),
            "linear_delta" => Ok(["a", "b", "c", "e"]),
            other => Err(ConfigError::Invalid(format!("unknown geometry '{}'", other))),
        }
    }

    /// Stepper configs in motor order, falling back to defaults for axes the
    /// file does not mention.
    pub fn axis_steppers(&self) -> Result<[StepperConfig; 4], ConfigError> {
        let names = self.axis_names()?;
        Ok(names.map(|n| self.steppers.get(n).cloned().unwrap_or_default()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.axis_names()?;
        if self.printer.max_velocity <= 0.0 || self.printer.max_accel <= 0.0 {
            return Err(ConfigError::Invalid(
                "max_velocity and max_accel must be positive".to_string(),
            ));
        }
        if self.printer.geometry == "linear_delta" && self.delta.rod_length <= self.delta.radius {
            return Err(ConfigError::Invalid(
                "delta rod_length must exceed the tower radius".to_string(),
            ));
        }
        for (name, s) in &self.steppers {
            if s.steps_per_mm <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "stepper '{}' has non-positive steps_per_mm",
                    name
                )));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
