//! Experiment file – one TOML document describing a whole session.
//!
//! ```toml
//! results_path = "results"
//!
//! [participant]
//! id = 7
//! weight_kg = 72.5
//! height_m = 1.78
//!
//! [loop]
//! frequency_hz = 100.0
//!
//! [network]
//! actuator_addr = "192.168.1.20:5005"
//!
//! [force]
//! max_velocity = 0.8
//!
//! [protocol]
//! center_hold = 2.0
//!
//! [calibration]
//! duration = 2.0
//! lean_spread = 0.02
//!
//! [[blocks]]
//! force_amplification = 5.0
//! total_trials = 40
//! desired_trial_time = { min = 0.3, max = 0.8 }
//! state_wait_time_range = { min = 1.0, max = 2.0 }
//! ```
//!
//! Every section except `[[blocks]]` may be omitted and falls back to its
//! defaults.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use reachlab_runtime::{CalibrationSettings, LoopConfig, ProtocolConfig, session_force};
use reachlab_types::{BlockConfig, Direction, ForceParameters, LabError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ParticipantSection {
    /// Names the output directory (`participant_007`).
    pub id: u32,
    /// Body weight in kilograms; scales the velocity-proportional force.
    pub weight_kg: f64,
    /// Recorded in the configuration snapshot only.
    pub height_m: f64,
}

impl Default for ParticipantSection {
    fn default() -> Self {
        Self {
            id: 0,
            weight_kg: 70.0,
            height_m: 1.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct LoopSection {
    pub frequency_hz: f64,
    pub frame_retry_limit: u32,
    pub velocity_window: usize,
    pub cursor_gain: f64,
    pub cursor_smoothing: usize,
    /// Wait for the capture system's "capture started" before the first
    /// trial. Needs `network.capture_signal_bind`.
    pub require_recording: bool,
}

impl Default for LoopSection {
    fn default() -> Self {
        let defaults = LoopConfig::default();
        Self {
            frequency_hz: defaults.frequency_hz,
            frame_retry_limit: defaults.frame_retry_limit,
            velocity_window: defaults.velocity_window,
            cursor_gain: defaults.cursor_gain,
            cursor_smoothing: defaults.cursor_smoothing,
            require_recording: defaults.require_recording,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    /// Motor controller receiving the 8-byte force datagrams.
    pub actuator_addr: String,
    /// Local address of the 24-byte position relay.
    pub position_bind: Option<String>,
    /// Local address receiving capture started/stopped notifications.
    pub capture_signal_bind: Option<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            actuator_addr: "127.0.0.1:5005".to_string(),
            position_bind: Some("0.0.0.0:5006".to_string()),
            capture_signal_bind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ForceSection {
    /// Velocity normalisation of the force law, in m/s.
    pub max_velocity: f64,
    /// Safety cap on the commanded magnitude, in newtons.
    pub max_force: f64,
    /// `1` or `-1`; sign of the channel restoring force.
    pub channel_sign: i8,
}

impl Default for ForceSection {
    fn default() -> Self {
        Self {
            max_velocity: 1.0,
            max_force: LoopConfig::default().max_force,
            channel_sign: 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ExperimentConfig
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Directory receiving one `participant_NNN` folder per session.
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,
    #[serde(default)]
    pub participant: ParticipantSection,
    #[serde(default, rename = "loop")]
    pub pacing: LoopSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub force: ForceSection,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Used by `reachlab calibrate` only.
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// Blocks run in order.
    pub blocks: Vec<BlockConfig>,
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results")
}

impl ExperimentConfig {
    /// Check every section. Block checks carry a `block {i}: ` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), LabError> {
        let p = &self.participant;
        if !(p.weight_kg.is_finite() && p.weight_kg >= 0.0) {
            return Err(LabError::Config(format!(
                "participant.weight_kg must be >= 0, got {}",
                p.weight_kg
            )));
        }
        if !(p.height_m.is_finite() && p.height_m > 0.0) {
            return Err(LabError::Config(format!(
                "participant.height_m must be > 0, got {}",
                p.height_m
            )));
        }

        let l = &self.pacing;
        if !(l.frequency_hz.is_finite() && l.frequency_hz > 0.0) {
            return Err(LabError::Config(format!(
                "loop.frequency_hz must be > 0, got {}",
                l.frequency_hz
            )));
        }
        if l.velocity_window < 2 {
            return Err(LabError::Config(
                "loop.velocity_window must be >= 2".to_string(),
            ));
        }
        if l.cursor_smoothing == 0 {
            return Err(LabError::Config(
                "loop.cursor_smoothing must be >= 1".to_string(),
            ));
        }
        if !(l.cursor_gain.is_finite() && l.cursor_gain != 0.0) {
            return Err(LabError::Config(format!(
                "loop.cursor_gain must be finite and non-zero, got {}",
                l.cursor_gain
            )));
        }

        self.actuator_addr()?;
        self.position_bind()?;
        let capture = self.capture_signal_bind()?;
        if l.require_recording && capture.is_none() {
            return Err(LabError::Config(
                "loop.require_recording needs network.capture_signal_bind".to_string(),
            ));
        }

        let f = &self.force;
        if !(f.max_velocity.is_finite() && f.max_velocity > 0.0) {
            return Err(LabError::Config(format!(
                "force.max_velocity must be > 0, got {}",
                f.max_velocity
            )));
        }
        if !(f.max_force.is_finite() && f.max_force > 0.0) {
            return Err(LabError::Config(format!(
                "force.max_force must be > 0, got {}",
                f.max_force
            )));
        }
        self.channel_direction()?;

        self.protocol.validate()?;
        self.calibration.validate()?;
        if self.blocks.is_empty() {
            return Err(LabError::Config("at least one [[blocks]] entry is required".to_string()));
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block
                .validate()
                .map_err(|e| LabError::Config(format!("block {i}: {}", config_reason(e))))?;
        }
        Ok(())
    }

    pub fn actuator_addr(&self) -> Result<SocketAddr, LabError> {
        parse_addr("network.actuator_addr", &self.network.actuator_addr)
    }

    pub fn position_bind(&self) -> Result<Option<SocketAddr>, LabError> {
        self.network
            .position_bind
            .as_deref()
            .map(|s| parse_addr("network.position_bind", s))
            .transpose()
    }

    pub fn capture_signal_bind(&self) -> Result<Option<SocketAddr>, LabError> {
        self.network
            .capture_signal_bind
            .as_deref()
            .map(|s| parse_addr("network.capture_signal_bind", s))
            .transpose()
    }

    pub fn channel_direction(&self) -> Result<Direction, LabError> {
        match self.force.channel_sign {
            1 => Ok(Direction::Positive),
            -1 => Ok(Direction::Negative),
            other => Err(LabError::Config(format!(
                "force.channel_sign must be 1 or -1, got {other}"
            ))),
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            frequency_hz: self.pacing.frequency_hz,
            frame_retry_limit: self.pacing.frame_retry_limit,
            velocity_window: self.pacing.velocity_window,
            cursor_gain: self.pacing.cursor_gain,
            cursor_smoothing: self.pacing.cursor_smoothing,
            require_recording: self.pacing.require_recording,
            max_force: self.force.max_force,
        }
    }

    /// Session-constant force-law inputs; amplification and mode start at
    /// rest and are driven by the protocol.
    pub fn force_parameters(&self) -> Result<ForceParameters, LabError> {
        Ok(session_force(
            self.participant.weight_kg,
            self.force.max_velocity,
            self.channel_direction()?,
        ))
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, LabError> {
    value
        .parse()
        .map_err(|e| LabError::Config(format!("{field} {value:?}: {e}")))
}

fn config_reason(e: LabError) -> String {
    match e {
        LabError::Config(reason) => reason,
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Parse, apply `REACHLAB_*` overrides and validate.
pub fn load(path: &Path) -> Result<ExperimentConfig, LabError> {
    let mut cfg = load_from(path)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Parse a file as written, without overrides or validation.
pub(crate) fn load_from(path: &Path) -> Result<ExperimentConfig, LabError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| LabError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map_err(|e| LabError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply `REACHLAB_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `REACHLAB_ACTUATOR_ADDR` | `network.actuator_addr` |
/// | `REACHLAB_FREQUENCY_HZ` | `loop.frequency_hz` |
/// | `REACHLAB_RESULTS_PATH` | `results_path` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut ExperimentConfig) {
    if let Ok(v) = std::env::var("REACHLAB_ACTUATOR_ADDR")
        && v.parse::<SocketAddr>().is_ok()
    {
        cfg.network.actuator_addr = v;
    }
    if let Ok(v) = std::env::var("REACHLAB_FREQUENCY_HZ")
        && let Ok(hz) = v.parse::<f64>()
        && hz.is_finite()
        && hz > 0.0
    {
        cfg.pacing.frequency_hz = hz;
    }
    if let Ok(v) = std::env::var("REACHLAB_RESULTS_PATH")
        && !v.trim().is_empty()
    {
        cfg.results_path = PathBuf::from(v);
    }
}

/// Write `cfg` as TOML, creating parent directories.
pub fn save_to(cfg: &ExperimentConfig, path: &Path) -> Result<(), LabError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LabError::Config(format!("failed to create {}: {e}", parent.display())))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| LabError::Config(format!("failed to serialise config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| LabError::Config(format!("failed to write {}: {e}", path.display())))
}

/// JSON schema of the experiment file.
pub fn schema_json() -> Result<String, LabError> {
    let schema = schemars::schema_for!(ExperimentConfig);
    serde_json::to_string_pretty(&schema)
        .map_err(|e| LabError::Config(format!("failed to render schema: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachlab_types::{PerturbationMode, TimeWindow};
    use std::collections::BTreeSet;

    fn block(trials: u32) -> BlockConfig {
        BlockConfig {
            force_amplification: 5.0,
            channel_amplification: 2.0,
            total_trials: trials,
            desired_trial_time: TimeWindow::new(0.3, 0.8),
            state_wait_time_range: TimeWindow::new(1.0, 2.0),
            catch_trial_indices: BTreeSet::from([3]),
            channel_trial_indices: BTreeSet::from([5]),
            pause_frequency: Some(10),
            direction: Direction::Negative,
            force_mode: PerturbationMode::VelocityProportional,
        }
    }

    fn sample() -> ExperimentConfig {
        ExperimentConfig {
            results_path: PathBuf::from("results"),
            participant: ParticipantSection {
                id: 7,
                weight_kg: 72.5,
                height_m: 1.78,
            },
            pacing: LoopSection::default(),
            network: NetworkSection::default(),
            force: ForceSection::default(),
            protocol: ProtocolConfig::default(),
            calibration: CalibrationSettings::default(),
            blocks: vec![block(20), block(40)],
        }
    }

    const MINIMAL: &str = r#"
[[blocks]]
force_amplification = 5.0
total_trials = 12
desired_trial_time = { min = 0.3, max = 0.8 }
state_wait_time_range = { min = 1.0, max = 2.0 }
"#;

    #[test]
    fn minimal_file_fills_defaults() {
        let cfg: ExperimentConfig = toml::from_str(MINIMAL).expect("parse");
        assert_eq!(cfg.results_path, PathBuf::from("results"));
        assert_eq!(cfg.pacing, LoopSection::default());
        assert_eq!(cfg.protocol, ProtocolConfig::default());
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].force_mode, PerturbationMode::VelocityProportional);
        assert!(cfg.blocks[0].catch_trial_indices.is_empty());
        cfg.validate().expect("minimal file is valid");
    }

    #[test]
    fn loop_section_uses_its_toml_name() {
        let text = format!("[loop]\nfrequency_hz = 250.0\ncursor_smoothing = 3\n{MINIMAL}");
        let cfg: ExperimentConfig = toml::from_str(&text).expect("parse");
        assert_eq!(cfg.pacing.frequency_hz, 250.0);
        assert_eq!(cfg.loop_config().cursor_smoothing, 3);
    }

    #[test]
    fn calibration_section_is_optional_and_validated() {
        let cfg: ExperimentConfig = toml::from_str(MINIMAL).expect("parse");
        assert_eq!(cfg.calibration, CalibrationSettings::default());

        let text = format!("[calibration]\nduration = 1.5\nrepetitions = 3\n{MINIMAL}");
        let cfg: ExperimentConfig = toml::from_str(&text).expect("parse");
        assert_eq!(cfg.calibration.duration, 1.5);
        assert_eq!(cfg.calibration.repetitions, 3);
        assert_eq!(cfg.calibration.lean_spread, 0.02);

        let mut cfg = sample();
        cfg.calibration.stance_spread = -0.05;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("calibration.stance_spread"), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = format!("[force]\nmax_newtons = 3.0\n{MINIMAL}");
        assert!(toml::from_str::<ExperimentConfig>(&text).is_err());
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("nested").join("experiment.toml");
        let cfg = sample();
        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn load_from_missing_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
    }

    #[test]
    fn validate_names_the_failing_block() {
        let mut cfg = sample();
        cfg.blocks[1].catch_trial_indices.insert(40);
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("block 1"), "{err}");

        cfg.blocks.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_sections() {
        let mut cfg = sample();
        cfg.participant.height_m = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.pacing.frequency_hz = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.force.channel_sign = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.network.actuator_addr = "motor".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.pacing.require_recording = true;
        assert!(cfg.validate().is_err(), "recording gate without a listener");
        cfg.network.capture_signal_bind = Some("0.0.0.0:5007".to_string());
        cfg.validate().expect("listener configured");
    }

    #[test]
    fn conversions_carry_session_values() {
        let mut cfg = sample();
        cfg.force.channel_sign = -1;
        cfg.force.max_force = 30.0;
        let params = cfg.force_parameters().expect("params");
        assert_eq!(params.participant_weight, 72.5);
        assert_eq!(params.channel_sign, Direction::Negative);
        assert_eq!(params.amplification, 0.0);
        assert_eq!(cfg.loop_config().max_force, 30.0);
        assert_eq!(
            cfg.actuator_addr().expect("addr"),
            "127.0.0.1:5005".parse::<SocketAddr>().expect("literal")
        );
        assert_eq!(cfg.capture_signal_bind().expect("none"), None);
    }

    #[test]
    fn schema_mentions_every_section() {
        let schema = schema_json().expect("schema");
        for key in ["participant", "loop", "network", "force", "protocol", "blocks"] {
            assert!(schema.contains(key), "schema is missing {key}");
        }
    }

    #[test]
    fn apply_env_overrides_changes_actuator_addr() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("REACHLAB_ACTUATOR_ADDR", "10.0.0.2:6000") };
        let mut cfg = sample();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.network.actuator_addr, "10.0.0.2:6000");
        unsafe { std::env::remove_var("REACHLAB_ACTUATOR_ADDR") };
    }

    #[test]
    fn apply_env_overrides_changes_results_path() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("REACHLAB_RESULTS_PATH", "/data/reach") };
        let mut cfg = sample();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.results_path, PathBuf::from("/data/reach"));
        unsafe { std::env::remove_var("REACHLAB_RESULTS_PATH") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_frequency() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("REACHLAB_FREQUENCY_HZ", "-5") };
        let mut cfg = sample();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pacing.frequency_hz, LoopSection::default().frequency_hz);

        unsafe { std::env::set_var("REACHLAB_FREQUENCY_HZ", "200") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pacing.frequency_hz, 200.0);
        unsafe { std::env::remove_var("REACHLAB_FREQUENCY_HZ") };
    }
}
