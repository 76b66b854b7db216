//! Startup configuration, loaded from a TOML file.
//!
//! Machine geometry and device topology are plain configuration rather
//! than build-time constants, so one binary drives any machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    Cartesian,
    Delta,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub steppers: HashMap<String, StepperConfig>,
    #[serde(default)]
    pub hotend: Option<HeaterConfig>,
    #[serde(default)]
    pub heater_bed: Option<HeaterConfig>,
    #[serde(default)]
    pub fan: Option<FanConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            printer: PrinterConfig::default(),
            geometry: GeometryConfig::default(),
            scheduler: SchedulerConfig::default(),
            steppers: HashMap::new(),
            hotend: None,
            heater_bed: None,
            fan: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_kinematics")]
    pub kinematics: MachineKind,
    /// Upper bound for commanded XYZ feed rate, mm/s.
    #[serde(default = "default_max_move_rate")]
    pub max_move_rate: f64,
    /// Homing pass speed, mm/s.
    #[serde(default = "default_home_rate")]
    pub home_rate: f64,
    /// Extruder filament advance limit, mm/s.
    #[serde(default = "default_max_extrude_rate")]
    pub max_extrude_rate: f64,
    /// Retract limit, mm/s.
    #[serde(default = "default_max_retract_rate")]
    pub max_retract_rate: f64,
    /// Constant-acceleration magnitude, mm/s².
    #[serde(default = "default_max_accel")]
    pub max_accel: f64,
    #[serde(default = "default_home_first")]
    pub home_before_first_move: bool,
    #[serde(default)]
    pub printer_name: Option<String>,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            kinematics: default_kinematics(),
            max_move_rate: default_max_move_rate(),
            home_rate: default_home_rate(),
            max_extrude_rate: default_max_extrude_rate(),
            max_retract_rate: default_max_retract_rate(),
            max_accel: default_max_accel(),
            home_before_first_move: default_home_first(),
            printer_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeometryConfig {
    /// Distance from platform center to each tower, mm (delta only).
    #[serde(default = "default_delta_radius")]
    pub delta_radius: f64,
    /// Length of the rods joining each carriage to the effector, mm.
    #[serde(default = "default_rod_length")]
    pub rod_length: f64,
    /// Carriage travel from the bed to the endstops, mm.
    #[serde(default = "default_column_height")]
    pub column_height: f64,
    /// Usable print radius, mm.
    #[serde(default = "default_build_radius")]
    pub build_radius: f64,
    /// Steps to raise a carriage (or move a cartesian axis) one meter.
    #[serde(default = "default_steps_per_m")]
    pub steps_per_m: f64,
    /// Steps to advance one meter of filament.
    #[serde(default = "default_steps_per_m_e")]
    pub steps_per_m_e: f64,
    #[serde(default)]
    pub bed_level: Option<BedLevelConfig>,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            delta_radius: default_delta_radius(),
            rod_length: default_rod_length(),
            column_height: default_column_height(),
            build_radius: default_build_radius(),
            steps_per_m: default_steps_per_m(),
            steps_per_m_e: default_steps_per_m_e(),
            bed_level: None,
        }
    }
}

/// Bed-leveling rotation stored as integer numerators over one shared
/// denominator, so repeated application cannot drift.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BedLevelConfig {
    pub numerators: [[i64; 3]; 3],
    pub denominator: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Bounded event queue length; producers block at capacity.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// SCHED_FIFO priority requested for the dispatch thread.
    #[serde(default = "default_rt_priority")]
    pub rt_priority: i32,
    /// Step line high time, microseconds.
    #[serde(default = "default_pulse_width_us")]
    pub pulse_width_us: u64,
    /// Longest single consumer sleep outside homing, milliseconds.
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rt_priority: default_rt_priority(),
            pulse_width_us: default_pulse_width_us(),
            max_sleep_ms: default_max_sleep_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepperConfig {
    pub step_pin: u32,
    pub dir_pin: u32,
    pub enable_pin: u32,
    #[serde(default)]
    pub endstop_pin: Option<u32>,
    #[serde(default)]
    pub endstop_inverted: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaterConfig {
    pub heater_pin: u32,
    #[serde(default = "default_heater_pwm_period_ms")]
    pub pwm_period_ms: u64,
    #[serde(default)]
    pub pid: PidGains,
    /// Low-pass time constant ahead of the PID, seconds.
    #[serde(default = "default_filter_time_s")]
    pub filter_time_s: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        // Conservative hotend gains for a ~40 W cartridge.
        Self {
            kp: 0.018,
            ki: 0.00025,
            kd: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FanConfig {
    pub pin: u32,
    #[serde(default = "default_fan_pwm_period_ms")]
    pub pwm_period_ms: u64,
}

fn default_kinematics() -> MachineKind {
    MachineKind::Delta
}
fn default_max_move_rate() -> f64 {
    120.0
}
fn default_home_rate() -> f64 {
    10.0
}
fn default_max_extrude_rate() -> f64 {
    150.0
}
fn default_max_retract_rate() -> f64 {
    150.0
}
fn default_max_accel() -> f64 {
    900.0
}
fn default_home_first() -> bool {
    true
}
fn default_delta_radius() -> f64 {
    111.0
}
fn default_rod_length() -> f64 {
    221.0
}
fn default_column_height() -> f64 {
    467.2
}
fn default_build_radius() -> f64 {
    85.0
}
fn default_steps_per_m() -> f64 {
    50_120.0
}
fn default_steps_per_m_e() -> f64 {
    480_000.0
}
fn default_capacity() -> usize {
    512
}
fn default_rt_priority() -> i32 {
    30
}
fn default_pulse_width_us() -> u64 {
    2
}
fn default_max_sleep_ms() -> u64 {
    40
}
fn default_heater_pwm_period_ms() -> u64 {
    100
}
fn default_fan_pwm_period_ms() -> u64 {
    25
}
fn default_filter_time_s() -> f64 {
    3.0
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.capacity < 2 {
            return Err(ConfigError::Invalid(
                "scheduler.capacity must be at least 2".into(),
            ));
        }
        if self.geometry.steps_per_m <= 0.0 || self.geometry.steps_per_m_e <= 0.0 {
            return Err(ConfigError::Invalid(
                "geometry steps_per_m values must be positive".into(),
            ));
        }
        if self.printer.kinematics == MachineKind::Delta
            && self.geometry.rod_length <= self.geometry.delta_radius
        {
            return Err(ConfigError::Invalid(
                "delta rod_length must exceed delta_radius".into(),
            ));
        }
        if let Some(level) = &self.geometry.bed_level {
            if level.denominator == 0 {
                return Err(ConfigError::Invalid(
                    "bed_level.denominator must be nonzero".into(),
                ));
            }
        }
        for (axis, stepper) in &self.steppers {
            if stepper.step_pin == stepper.dir_pin {
                return Err(ConfigError::Invalid(format!(
                    "stepper {axis}: step_pin and dir_pin collide"
                )));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
