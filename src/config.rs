use clap::{ArgAction, Parser, ValueHint};
use dirs_next::home_dir;
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}, time::Duration};
use thiserror::Error;

use crate::bridge::BridgeSettings;
use crate::levels::MeterTarget;
use crate::peak_hold::HoldSettings;
use crate::pipeline::PipelineSettings;
use crate::protocol::{RenderConfig, ThresholdMarker};
use crate::transport::TransportSettings;
use crate::worker::WorkerSettings;

/// Error type for config loading/validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Top-level app configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub log_level: Option<String>,     // e.g., "info" | "debug"
    pub pipeline: Option<PipelineConfig>,
    pub transport: Option<TransportConfig>,
    /// meters to put on screen, in order
    pub meters: Option<Vec<MeterConfig>>,
    pub preview: Option<PreviewConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PipelineConfig {
    pub coordinator_hz: Option<u32>,
    pub paint_hz: Option<u32>,
    pub hold_ms: Option<u64>,
    pub hold_decay: Option<f32>,
    pub queue_capacity: Option<usize>,
    pub register_timeout_ms: Option<u64>,
    pub shared_buffer: Option<bool>,
    pub max_tracks: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TransportConfig {
    pub levels_event: Option<String>,
    pub disconnect_event: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterConfig {
    /// track id; omit (or "master") for the master bus
    #[serde(default)]
    pub track: MeterTarget,
    #[serde(default = "default_meter_width")]
    pub width: u32,
    #[serde(default = "default_meter_height")]
    pub height: u32,
    #[serde(default = "default_dpr")]
    pub dpr: f32,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub thresholds: Vec<ThresholdMarker>,
}

fn default_meter_width() -> u32 { 24 }
fn default_meter_height() -> u32 { 160 }
fn default_dpr() -> f32 { 1.0 }
fn default_volume() -> f32 { 1.0 }

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            track: MeterTarget::Master,
            width: default_meter_width(),
            height: default_meter_height(),
            dpr: default_dpr(),
            volume: default_volume(),
            muted: false,
            thresholds: Vec::new(),
        }
    }
}

impl MeterConfig {
    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            volume: self.volume,
            muted: self.muted,
            is_dragging: false,
            threshold_markers: self.thresholds.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewConfig {
    pub width: u32,
    pub height: u32,
}

/// CLI overrides. All fields are Options so we can layer them over YAML.
#[derive(Debug, Parser, Clone, Default)]
#[command(name = "meterbank", about = "Off-thread audio level meters", disable_help_flag = false)]
pub struct Cli {
    /// Path to a YAML config file (overrides search)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// NDJSON event stream to read, `-` for stdin
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub input: Option<PathBuf>,
    /// write one PPM per meter here on exit
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub snapshot_dir: Option<PathBuf>,
    /// keep painting this long after the stream ends
    #[arg(long)]
    pub linger_ms: Option<u64>,
    #[arg(long)]
    pub paint_hz: Option<u32>,
    #[arg(long)]
    pub coordinator_hz: Option<u32>,
    #[arg(long, action = ArgAction::Set)]
    pub shared_buffer: Option<bool>,
    #[arg(long)]
    pub levels_event: Option<String>,
    /// extra meter bound to this track id (repeatable)
    #[arg(long = "meter")]
    pub meters: Vec<String>,
    /// dump fully merged config (after overrides) and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub dump_config: bool,
}

/// Public entry point: read YAML, merge, apply `cli`, validate.
pub fn load(cli: &Cli) -> Result<Config, ConfigError> {
    // 1) defaults (from `Default` impl)
    let mut cfg = Config::default();

    // 2) YAML file (explicit path or search)
    if let Some(p) = cli.config.as_ref() {
        if p.exists() {
            let y = read_yaml(p)?;
            merge(&mut cfg, y);
        } else {
            return Err(ConfigError::Validation(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
    } else if let Some(p) = find_config_file() {
        let y = read_yaml(&p)?;
        merge(&mut cfg, y);
    }

    // 3) CLI overrides (highest precedence)
    apply_cli_overrides(&mut cfg, cli);

    // 4) Validate
    validate(&cfg)?;

    Ok(cfg)
}

/// Pretty YAML of the effective config (nice for debugging).
pub fn dump(cfg: &Config) -> Result<String, ConfigError> {
    Ok(serde_yaml::to_string(cfg)?)
}

/// Try common locations in order (first hit wins).
fn find_config_file() -> Option<PathBuf> {
    // XDG-style: ~/.config/meterbank/config.yaml
    if let Some(home) = home_dir() {
        let p = home.join(".config/meterbank/config.yaml");
        if p.exists() { return Some(p) }
        let p = home.join(".config/meterbank.yaml");
        if p.exists() { return Some(p) }
    }
    // project local
    for candidate in &["meterbank.yaml", "config/meterbank.yaml"] {
        let p = PathBuf::from(candidate);
        if p.exists() { return Some(p) }
    }
    None
}

fn read_yaml(path: &Path) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path)?;
    parse_yaml(&s)
}

pub fn parse_yaml(s: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(s)?;
    Ok(cfg)
}

/// Shallow merge `src` into `dst`, Option-by-Option.
fn merge(dst: &mut Config, src: Config) {
    if src.log_level.is_some()  { dst.log_level = src.log_level; }
    if src.meters.is_some()     { dst.meters = src.meters; }
    if src.preview.is_some()    { dst.preview = src.preview; }
    match (&mut dst.pipeline, src.pipeline) {
        (None, Some(c)) => dst.pipeline = Some(c),
        (Some(d), Some(s)) => merge_pipeline(d, s),
        _ => {}
    }
    match (&mut dst.transport, src.transport) {
        (None, Some(c)) => dst.transport = Some(c),
        (Some(d), Some(s)) => {
            if s.levels_event.is_some()     { d.levels_event = s.levels_event; }
            if s.disconnect_event.is_some() { d.disconnect_event = s.disconnect_event; }
        }
        _ => {}
    }
}

fn merge_pipeline(dst: &mut PipelineConfig, src: PipelineConfig) {
    if src.coordinator_hz.is_some()      { dst.coordinator_hz = src.coordinator_hz; }
    if src.paint_hz.is_some()            { dst.paint_hz = src.paint_hz; }
    if src.hold_ms.is_some()             { dst.hold_ms = src.hold_ms; }
    if src.hold_decay.is_some()          { dst.hold_decay = src.hold_decay; }
    if src.queue_capacity.is_some()      { dst.queue_capacity = src.queue_capacity; }
    if src.register_timeout_ms.is_some() { dst.register_timeout_ms = src.register_timeout_ms; }
    if src.shared_buffer.is_some()       { dst.shared_buffer = src.shared_buffer; }
    if src.max_tracks.is_some()          { dst.max_tracks = src.max_tracks; }
}

fn apply_cli_overrides(cfg: &mut Config, cli: &Cli) {
    if cli.log_level.is_some() { cfg.log_level = cli.log_level.clone(); }

    let any_pipeline = cli.paint_hz.is_some() || cli.coordinator_hz.is_some() || cli.shared_buffer.is_some();
    if any_pipeline && cfg.pipeline.is_none() {
        cfg.pipeline = Some(PipelineConfig::default());
    }
    if let Some(p) = cfg.pipeline.as_mut() {
        if cli.paint_hz.is_some()       { p.paint_hz = cli.paint_hz; }
        if cli.coordinator_hz.is_some() { p.coordinator_hz = cli.coordinator_hz; }
        if cli.shared_buffer.is_some()  { p.shared_buffer = cli.shared_buffer; }
    }

    if let Some(ev) = cli.levels_event.as_ref() {
        cfg.transport.get_or_insert_with(TransportConfig::default).levels_event = Some(ev.clone());
    }

    if !cli.meters.is_empty() {
        let meters = cfg.meters.get_or_insert_with(Vec::new);
        for track in &cli.meters {
            meters.push(MeterConfig { track: MeterTarget::from(Some(track.as_str())), ..Default::default() });
        }
    }
}

/// Put any invariants here (required fields, ranges, etc.)
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if let Some(p) = cfg.pipeline.as_ref() {
        for (name, hz) in [("coordinator_hz", p.coordinator_hz), ("paint_hz", p.paint_hz)] {
            if let Some(hz) = hz {
                if hz == 0 || hz > 1000 {
                    return Err(ConfigError::Validation(format!("pipeline {name} must be 1..=1000")));
                }
            }
        }
        if let Some(d) = p.hold_decay {
            if !(d > 0.0 && d < 1.0) {
                return Err(ConfigError::Validation("pipeline hold_decay must be in (0, 1)".into()));
            }
        }
        if p.queue_capacity == Some(0) {
            return Err(ConfigError::Validation("pipeline queue_capacity must be > 0".into()));
        }
        if p.register_timeout_ms == Some(0) {
            return Err(ConfigError::Validation("pipeline register_timeout_ms must be > 0".into()));
        }
    }
    for m in cfg.meters.iter().flatten() {
        if m.width == 0 || m.height == 0 {
            return Err(ConfigError::Validation(format!("meter {} width/height must be > 0", m.track)));
        }
        if !(m.dpr.is_finite() && m.dpr > 0.0) {
            return Err(ConfigError::Validation(format!("meter {} dpr must be > 0", m.track)));
        }
        if !(0.0..=1.0).contains(&m.volume) {
            return Err(ConfigError::Validation(format!("meter {} volume must be 0..=1", m.track)));
        }
    }
    if let Some(p) = cfg.preview.as_ref() {
        if p.width == 0 || p.height == 0 {
            return Err(ConfigError::Validation("preview width/height must be > 0".into()));
        }
    }
    Ok(())
}

impl Config {
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut s = PipelineSettings::default();
        let Some(p) = self.pipeline.as_ref() else { return s };
        if let Some(hz) = p.coordinator_hz { s.coordinator_hz = hz; }
        let b: &mut BridgeSettings = &mut s.bridge;
        if let Some(n) = p.queue_capacity { b.queue_capacity = n; }
        if let Some(ms) = p.register_timeout_ms { b.register_timeout = Duration::from_millis(ms); }
        if let Some(on) = p.shared_buffer { b.shared_buffer = on; }
        if let Some(n) = p.max_tracks { b.max_tracks = n; }
        let w: &mut WorkerSettings = &mut b.worker;
        if let Some(hz) = p.paint_hz { w.paint_hz = hz; }
        let h: &mut HoldSettings = &mut w.hold;
        if let Some(ms) = p.hold_ms { h.window = Duration::from_millis(ms); }
        if let Some(d) = p.hold_decay { h.decay = d; }
        s
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let mut s = TransportSettings::default();
        if let Some(t) = self.transport.as_ref() {
            if let Some(e) = t.levels_event.as_ref() { s.levels_event = e.clone(); }
            if let Some(e) = t.disconnect_event.as_ref() { s.disconnect_event = e.clone(); }
        }
        s
    }

    /// Configured meters, or a single master meter when none are given.
    pub fn meters(&self) -> Vec<MeterConfig> {
        match self.meters.as_ref() {
            Some(m) if !m.is_empty() => m.clone(),
            _ => vec![MeterConfig::default()],
        }
    }
}
