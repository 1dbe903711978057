//! Session log store.
//!
//! # Directory layout
//!
//! ```text
//! <results_path>/
//!   participant_007/
//!     experiment_config.json
//!     session.sqlite
//!   participant_007_calibration/
//!     calibration_config.json
//!     session.sqlite
//! ```
//!
//! The participant directory must not exist yet; a session never overwrites
//! earlier data. The standing calibration gets its own directory so it can
//! run before or after the session.
//!
//! # Storage layout
//!
//! `iterations` is created from the first appended [`LogRecord`]: one column
//! per key, typed after the first value, in insertion order. Every later
//! record must carry exactly the same keys in the same order, otherwise
//! [`SessionLog::append`] fails with [`SessionLogError::SchemaChanged`].
//!
//! `trials` has a fixed layout:
//!
//! | column          | type    | description                            |
//! |-----------------|---------|----------------------------------------|
//! | id              | INTEGER | row id                                 |
//! | recorded_at     | TEXT    | RFC-3339 wall-clock time (UTC)         |
//! | block_index     | INTEGER | 0-based block                          |
//! | trial_index     | INTEGER | 0-based trial within the block         |
//! | target          | TEXT    | `left` / `right`                       |
//! | outcome         | TEXT    | `hit`, `near_miss`, `miss`, …          |
//! | success         | INTEGER | 1 for hit or near miss                 |
//! | movement_time   | REAL    | seconds                                |
//! | timing          | TEXT    | `too_fast` / `on_time` / `too_slow`    |
//! | catch_trial     | INTEGER | 0/1                                    |
//! | channel_trial   | INTEGER | 0/1                                    |
//! | amplification   | REAL    | armed amplification                    |
//! | score           | INTEGER | session score after this trial         |
//! | remaining       | INTEGER | trials left in the block               |
//!
//! `calibration` holds one averaged position per row:
//!
//! | column      | type | description                                     |
//! |-------------|------|-------------------------------------------------|
//! | id          | INTEGER | row id                                       |
//! | recorded_at | TEXT | RFC-3339 wall-clock time (UTC)                  |
//! | step        | TEXT | `stance` / `stability_limits`                   |
//! | label       | TEXT | marker name, lean direction or summary name     |
//! | x, y, z     | REAL | metres; NULL when undefined                     |
//!
//! # Example
//!
//! ```rust
//! use reachlab_memory::session_log::{LogRecord, SessionLog};
//!
//! let mut log = SessionLog::open_in_memory().unwrap();
//! let mut rec = LogRecord::new();
//! rec.real("time", 0.01).integer("phase_id", 3).text("phase", "hold_center");
//! log.append(&rec).unwrap();
//! assert_eq!(log.iteration_count().unwrap(), 1);
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use reachlab_types::{LabError, TrialReport, Vec2, Vec3};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "experiment_config.json";
pub const CALIBRATION_CONFIG_FILE_NAME: &str = "calibration_config.json";
pub const DATABASE_FILE_NAME: &str = "session.sqlite";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SessionLogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session directory {0} already exists")]
    SessionExists(PathBuf),
    #[error("log columns changed: expected {expected:?}, found {found:?}")]
    SchemaChanged {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("this log has no session directory")]
    NoDirectory,
    #[error("log record is empty")]
    EmptyRecord,
}

impl From<SessionLogError> for LabError {
    fn from(err: SessionLogError) -> Self {
        match err {
            SessionLogError::SchemaChanged { expected, found } => {
                LabError::LogSchema { expected, found }
            }
            other => LabError::Storage(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LogRecord
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Real(f64),
    Integer(i64),
    Text(String),
}

impl LogValue {
    fn sql_type(&self) -> &'static str {
        match self {
            LogValue::Real(_) => "REAL",
            LogValue::Integer(_) => "INTEGER",
            LogValue::Text(_) => "TEXT",
        }
    }

    fn to_sql(&self) -> Value {
        match self {
            // SQLite stores NaN as NULL.
            LogValue::Real(v) if v.is_nan() => Value::Null,
            LogValue::Real(v) => Value::Real(*v),
            LogValue::Integer(v) => Value::Integer(*v),
            LogValue::Text(v) => Value::Text(v.clone()),
        }
    }
}

/// One flat key → scalar row. Vectors expand to indexed columns
/// (`position_0`, `position_1`, `position_2`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRecord {
    fields: Vec<(String, LogValue)>,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`, keeping its first position.
    pub fn insert(&mut self, key: impl Into<String>, value: LogValue) -> &mut Self {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    pub fn real(&mut self, key: impl Into<String>, value: f64) -> &mut Self {
        self.insert(key, LogValue::Real(value))
    }

    pub fn integer(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.insert(key, LogValue::Integer(value))
    }

    pub fn flag(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.insert(key, LogValue::Integer(i64::from(value)))
    }

    pub fn text(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.insert(key, LogValue::Text(value.into()))
    }

    pub fn vec2(&mut self, key: &str, value: Vec2) -> &mut Self {
        self.real(format!("{key}_0"), value.x)
            .real(format!("{key}_1"), value.y)
    }

    pub fn vec3(&mut self, key: &str, value: Vec3) -> &mut Self {
        for (i, v) in value.to_array().into_iter().enumerate() {
            self.real(format!("{key}_{i}"), v);
        }
        self
    }

    /// Optional vectors log as NaN (stored as NULL) so the column set does
    /// not depend on availability.
    pub fn opt_vec3(&mut self, key: &str, value: Option<Vec3>) -> &mut Self {
        self.vec3(key, value.unwrap_or(Vec3::new(f64::NAN, f64::NAN, f64::NAN)))
    }

    pub fn columns(&self) -> Vec<String> {
        self.fields.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn get(&self, key: &str) -> Option<&LogValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionLog
// ─────────────────────────────────────────────────────────────────────────────

pub struct SessionLog {
    conn: Connection,
    dir: Option<PathBuf>,
    columns: Option<Vec<String>>,
    insert_sql: String,
}

impl SessionLog {
    /// Open (or create) a database file at `path`.
    pub fn open(path: &Path) -> Result<Self, SessionLogError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let log = Self {
            conn,
            dir: path.parent().map(Path::to_path_buf),
            columns: None,
            insert_sql: String::new(),
        };
        log.init_schema()?;
        Ok(log)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, SessionLogError> {
        let log = Self {
            conn: Connection::open_in_memory()?,
            dir: None,
            columns: None,
            insert_sql: String::new(),
        };
        log.init_schema()?;
        Ok(log)
    }

    /// Create `<results_path>/participant_%03d/` and open its database.
    ///
    /// # Errors
    ///
    /// [`SessionLogError::SessionExists`] when the participant directory is
    /// already there.
    pub fn create_in(results_path: &Path, participant_id: u32) -> Result<Self, SessionLogError> {
        Self::create_dir_and_open(results_path, participant_dir_name(participant_id))
    }

    /// Create `<results_path>/participant_%03d_calibration/` and open its
    /// database.
    ///
    /// # Errors
    ///
    /// [`SessionLogError::SessionExists`] when the participant was already
    /// calibrated.
    pub fn create_calibration_in(
        results_path: &Path,
        participant_id: u32,
    ) -> Result<Self, SessionLogError> {
        let name = format!("{}_calibration", participant_dir_name(participant_id));
        Self::create_dir_and_open(results_path, name)
    }

    fn create_dir_and_open(results_path: &Path, name: String) -> Result<Self, SessionLogError> {
        fs::create_dir_all(results_path)?;
        let dir = results_path.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SessionLogError::SessionExists(dir));
            }
            Err(e) => return Err(e.into()),
        }
        info!(dir = %dir.display(), "session directory created");
        Self::open(&dir.join(DATABASE_FILE_NAME))
    }

    fn init_schema(&self) -> Result<(), SessionLogError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trials (
                id            INTEGER PRIMARY KEY,
                recorded_at   TEXT    NOT NULL,
                block_index   INTEGER NOT NULL,
                trial_index   INTEGER NOT NULL,
                target        TEXT    NOT NULL,
                outcome       TEXT    NOT NULL,
                success       INTEGER NOT NULL,
                movement_time REAL    NOT NULL,
                timing        TEXT    NOT NULL,
                catch_trial   INTEGER NOT NULL,
                channel_trial INTEGER NOT NULL,
                amplification REAL    NOT NULL,
                score         INTEGER NOT NULL,
                remaining     INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS calibration (
                id          INTEGER PRIMARY KEY,
                recorded_at TEXT    NOT NULL,
                step        TEXT    NOT NULL,
                label       TEXT    NOT NULL,
                x           REAL,
                y           REAL,
                z           REAL
            );",
        )?;
        Ok(())
    }

    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Write `config` as pretty JSON with sorted keys next to the database.
    pub fn save_config<T: Serialize>(&self, config: &T) -> Result<PathBuf, SessionLogError> {
        self.save_config_as(config, CONFIG_FILE_NAME)
    }

    pub fn save_config_as<T: Serialize>(
        &self,
        config: &T,
        file_name: &str,
    ) -> Result<PathBuf, SessionLogError> {
        let dir = self.dir.as_ref().ok_or(SessionLogError::NoDirectory)?;
        let path = dir.join(file_name);
        // Value maps are ordered, so re-serialising sorts the keys.
        let value = serde_json::to_value(config)?;
        fs::write(&path, serde_json::to_string_pretty(&value)?)?;
        debug!(path = %path.display(), "experiment configuration saved");
        Ok(path)
    }

    /// Column set fixed by the first record, if any.
    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Append one iteration row.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), SessionLogError> {
        if record.is_empty() {
            return Err(SessionLogError::EmptyRecord);
        }
        if let Some(expected) = &self.columns {
            let same = expected.len() == record.fields.len()
                && expected.iter().zip(&record.fields).all(|(e, (k, _))| e == k);
            if !same {
                return Err(SessionLogError::SchemaChanged {
                    expected: expected.clone(),
                    found: record.columns(),
                });
            }
        } else {
            self.create_iterations_table(record)?;
        }

        let mut stmt = self.conn.prepare_cached(&self.insert_sql)?;
        stmt.execute(params_from_iter(record.fields.iter().map(|(_, v)| v.to_sql())))?;
        Ok(())
    }

    fn create_iterations_table(&mut self, first: &LogRecord) -> Result<(), SessionLogError> {
        let defs: Vec<String> = first
            .fields
            .iter()
            .map(|(k, v)| format!("{} {}", quote_ident(k), v.sql_type()))
            .collect();
        self.conn.execute_batch(&format!(
            "CREATE TABLE iterations (log_row INTEGER PRIMARY KEY, {});",
            defs.join(", ")
        ))?;

        let names: Vec<String> = first.fields.iter().map(|(k, _)| quote_ident(k)).collect();
        let slots: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        self.insert_sql = format!(
            "INSERT INTO iterations ({}) VALUES ({})",
            names.join(", "),
            slots.join(", ")
        );
        self.columns = Some(first.columns());
        debug!(columns = first.len(), "iteration log schema fixed");
        Ok(())
    }

    /// Record one scored trial.
    pub fn append_trial(&self, report: &TrialReport) -> Result<(), SessionLogError> {
        self.conn.execute(
            "INSERT INTO trials
                 (recorded_at, block_index, trial_index, target, outcome, success,
                  movement_time, timing, catch_trial, channel_trial, amplification,
                  score, remaining)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                Utc::now().to_rfc3339(),
                report.block_index as i64,
                report.trial_index,
                report.target.as_str(),
                report.outcome.as_str(),
                report.outcome.is_success(),
                report.movement_time,
                report.timing.as_str(),
                report.catch_trial,
                report.channel_trial,
                report.amplification,
                report.score,
                report.remaining_trials,
            ],
        )?;
        Ok(())
    }

    /// Record one averaged calibration position. NaN components are stored
    /// as NULL.
    pub fn append_calibration(
        &self,
        step: &str,
        label: &str,
        value: Vec3,
    ) -> Result<(), SessionLogError> {
        let [x, y, z] = value.to_array().map(|v| (!v.is_nan()).then_some(v));
        self.conn.execute(
            "INSERT INTO calibration (recorded_at, step, label, x, y, z)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![Utc::now().to_rfc3339(), step, label, x, y, z],
        )?;
        Ok(())
    }

    /// `(label, value)` of every row logged for `step`, in insertion order.
    /// NULL components read back as NaN.
    pub fn calibration_entries(&self, step: &str) -> Result<Vec<(String, Vec3)>, SessionLogError> {
        let mut stmt = self
            .conn
            .prepare("SELECT label, x, y, z FROM calibration WHERE step = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map([step], |row| {
            let component = |i: usize| -> rusqlite::Result<f64> {
                Ok(row.get::<_, Option<f64>>(i)?.unwrap_or(f64::NAN))
            };
            Ok((row.get(0)?, Vec3::new(component(1)?, component(2)?, component(3)?)))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn iteration_count(&self) -> Result<u64, SessionLogError> {
        if self.columns.is_none() {
            return Ok(0);
        }
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM iterations", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// `(outcome, success)` of every logged trial, in insertion order.
    pub fn trial_outcomes(&self) -> Result<Vec<(String, bool)>, SessionLogError> {
        let mut stmt = self
            .conn
            .prepare("SELECT outcome, success FROM trials ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// `participant_%03d`.
pub fn participant_dir_name(participant_id: u32) -> String {
    format!("participant_{participant_id:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachlab_types::{Side, TimingFeedback, TrialOutcome};

    fn record(t: f64) -> LogRecord {
        let mut rec = LogRecord::new();
        rec.real("time", t)
            .text("phase", "reach_right")
            .vec3("position", Vec3::new(0.1, 0.2, 0.3))
            .flag("recording", true);
        rec
    }

    fn report(outcome: TrialOutcome) -> TrialReport {
        TrialReport {
            block_index: 0,
            trial_index: 2,
            target: Side::Right,
            outcome,
            movement_time: 0.6,
            timing: TimingFeedback::OnTime,
            catch_trial: false,
            channel_trial: true,
            amplification: 1.5,
            score: 3,
            remaining_trials: 7,
        }
    }

    #[test]
    fn vectors_expand_to_indexed_columns() {
        let rec = record(0.0);
        assert_eq!(
            rec.columns(),
            vec!["time", "phase", "position_0", "position_1", "position_2", "recording"]
        );
        assert_eq!(rec.get("position_1"), Some(&LogValue::Real(0.2)));
    }

    #[test]
    fn insert_overwrites_in_place() {
        let mut rec = LogRecord::new();
        rec.real("a", 1.0).real("b", 2.0).real("a", 3.0);
        assert_eq!(rec.columns(), vec!["a", "b"]);
        assert_eq!(rec.get("a"), Some(&LogValue::Real(3.0)));
    }

    #[test]
    fn first_record_fixes_columns() {
        let mut log = SessionLog::open_in_memory().unwrap();
        assert_eq!(log.iteration_count().unwrap(), 0);
        log.append(&record(0.0)).unwrap();
        log.append(&record(0.01)).unwrap();
        assert_eq!(log.iteration_count().unwrap(), 2);
        assert_eq!(log.columns().unwrap().len(), 6);
    }

    #[test]
    fn changed_column_set_is_rejected() {
        let mut log = SessionLog::open_in_memory().unwrap();
        log.append(&record(0.0)).unwrap();

        let mut extra = record(0.01);
        extra.real("force", 1.0);
        let err = log.append(&extra).unwrap_err();
        assert!(matches!(err, SessionLogError::SchemaChanged { .. }));
        assert!(matches!(LabError::from(err), LabError::LogSchema { .. }));

        let mut reordered = LogRecord::new();
        reordered
            .text("phase", "x")
            .real("time", 0.0)
            .vec3("position", Vec3::ZERO)
            .flag("recording", false);
        assert!(log.append(&reordered).is_err());
        assert_eq!(log.iteration_count().unwrap(), 1);
    }

    #[test]
    fn empty_record_rejected() {
        let mut log = SessionLog::open_in_memory().unwrap();
        assert!(matches!(
            log.append(&LogRecord::new()),
            Err(SessionLogError::EmptyRecord)
        ));
    }

    #[test]
    fn nan_is_stored_as_null() {
        let mut log = SessionLog::open_in_memory().unwrap();
        let mut rec = LogRecord::new();
        rec.opt_vec3("com", None);
        log.append(&rec).unwrap();
        let v: Option<f64> = log
            .conn
            .query_row("SELECT com_0 FROM iterations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, None);
    }

    #[test]
    fn trials_are_recorded() {
        let log = SessionLog::open_in_memory().unwrap();
        log.append_trial(&report(TrialOutcome::NearMiss)).unwrap();
        log.append_trial(&report(TrialOutcome::Miss)).unwrap();
        assert_eq!(
            log.trial_outcomes().unwrap(),
            vec![("near_miss".to_string(), true), ("miss".to_string(), false)]
        );
    }

    #[test]
    fn create_in_refuses_existing_participant() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SessionLog::create_in(tmp.path(), 7).unwrap();
        let dir = log.directory().unwrap().to_path_buf();
        assert!(dir.ends_with("participant_007"));
        assert!(dir.join(DATABASE_FILE_NAME).exists());
        drop(log);

        let err = SessionLog::create_in(tmp.path(), 7).err().unwrap();
        assert!(matches!(err, SessionLogError::SessionExists(_)));
    }

    #[test]
    fn config_snapshot_has_sorted_keys() {
        #[derive(Serialize)]
        struct Cfg {
            zeta: u32,
            alpha: &'static str,
        }

        let tmp = tempfile::tempdir().unwrap();
        let log = SessionLog::create_in(tmp.path(), 1).unwrap();
        let path = log.save_config(&Cfg { zeta: 1, alpha: "a" }).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zeta").unwrap());
    }

    #[test]
    fn in_memory_log_cannot_save_config() {
        let log = SessionLog::open_in_memory().unwrap();
        assert!(matches!(
            log.save_config(&1u32),
            Err(SessionLogError::NoDirectory)
        ));
    }

    #[test]
    fn calibration_rows_round_trip_per_step() {
        let log = SessionLog::open_in_memory().unwrap();
        log.append_calibration("stance", "tracked_point", Vec3::new(0.1, 0.2, 1.0))
            .unwrap();
        log.append_calibration("stability_limits", "left", Vec3::new(-0.1, 0.0, 1.0))
            .unwrap();
        log.append_calibration("stability_limits", "geometric_mean", Vec3::new(f64::NAN, 0.0, 1.0))
            .unwrap();

        let stance = log.calibration_entries("stance").unwrap();
        assert_eq!(stance, vec![("tracked_point".to_string(), Vec3::new(0.1, 0.2, 1.0))]);

        let limits = log.calibration_entries("stability_limits").unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].0, "left");
        assert!(limits[1].1.x.is_nan());
        assert_eq!(limits[1].1.z, 1.0);
    }

    #[test]
    fn calibration_directory_is_separate_from_session() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionLog::create_in(tmp.path(), 3).unwrap();
        let calibration = SessionLog::create_calibration_in(tmp.path(), 3).unwrap();
        assert!(calibration.directory().unwrap().ends_with("participant_003_calibration"));
        assert_ne!(session.directory(), calibration.directory());

        let path = calibration
            .save_config_as(&1u32, CALIBRATION_CONFIG_FILE_NAME)
            .unwrap();
        assert!(path.ends_with("participant_003_calibration/calibration_config.json"));

        let err = SessionLog::create_calibration_in(tmp.path(), 3).err().unwrap();
        assert!(matches!(err, SessionLogError::SessionExists(_)));
    }
}
