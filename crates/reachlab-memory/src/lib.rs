//! `reachlab-memory` – session persistence.
//!
//! Everything a session leaves on disk goes through here, under one
//! directory per participant.
//!
//! # Modules
//!
//! - [`session_log`] – [`SessionLog`][session_log::SessionLog]: SQLite-backed
//!   per-iteration log with a column set fixed by the first record, a table of
//!   trial outcomes, the averaged standing-calibration positions, and the
//!   JSON snapshot of the experiment configuration.

pub mod session_log;

pub use session_log::{LogRecord, LogValue, SessionLog, SessionLogError};
