//! `reachlab` – operator entry point for a reaching session.
//!
//! ```text
//! reachlab run --config experiment.toml [--no-log]
//! reachlab calibrate --config experiment.toml [--stance-only]
//! reachlab check experiment.toml
//! reachlab schema
//! ```
//!
//! `run` loads and validates the experiment file, wires the UDP position
//! relay and force actuator into a [`ControlLoop`] and drives it on the main
//! thread. Socket listeners and the console reporter live on a tokio runtime
//! beside it. `<Enter>` on stdin is the operator's confirm button; **Ctrl-C**
//! zeroes the force and stops the loop at the next iteration.
//!
//! `calibrate` records the participant's quiet stance and stability limits
//! from the same position relay, prompting on the terminal before every
//! recording, and writes them to `participant_NNN_calibration/`.

mod config;

use std::collections::BTreeMap;
use std::io::{BufRead, Lines, StdinLock, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use colored::Colorize;
use reachlab_hal::udp::{UdpForceActuator, UdpPositionSource};
use reachlab_memory::SessionLog;
use reachlab_memory::session_log::CALIBRATION_CONFIG_FILE_NAME;
use reachlab_middleware::{CaptureSignalListener, EventBus, Topic, TopicReceiver};
use reachlab_runtime::{
    CalibrationOperator, Calibrator, ConfirmLatch, ControlLoop, SessionSummary, StabilityLimits,
    StanceCalibration, TrialStateMachine, init_tracing,
};
use reachlab_types::{Event, EventPayload, LabError, TrialReport, Vec3};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::config::ExperimentConfig;

const ACTUATOR_ID: &str = "pelvis_motor";

#[derive(Parser)]
#[command(name = "reachlab", version, about = "Standing reaching task with pelvis perturbations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a session.
    Run {
        /// Experiment file (TOML).
        #[arg(short, long)]
        config: PathBuf,
        /// Do not create the participant directory or write any log.
        #[arg(long)]
        no_log: bool,
    },
    /// Record quiet stance and stability limits before a session.
    Calibrate {
        /// Experiment file (TOML).
        #[arg(short, long)]
        config: PathBuf,
        /// Record the quiet stance only.
        #[arg(long)]
        stance_only: bool,
    },
    /// Validate an experiment file without running it.
    Check { file: PathBuf },
    /// Print the JSON schema of the experiment file.
    Schema,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = init_tracing("reachlab");

    let result = match cli.command {
        Command::Run { config, no_log } => run(&config, no_log),
        Command::Calibrate { config, stance_only } => calibrate(&config, stance_only),
        Command::Check { file } => check(&file),
        Command::Schema => config::schema_json().map(|schema| println!("{schema}")),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

fn check(path: &Path) -> Result<(), LabError> {
    let cfg = config::load(path)?;
    let trials: u32 = cfg.blocks.iter().map(|b| b.total_trials).sum();
    println!("{} {}", "✓".green().bold(), path.display().to_string().bold());
    println!(
        "  participant {:03}, {} block(s), {} trial(s) at {} Hz",
        cfg.participant.id,
        cfg.blocks.len(),
        trials,
        cfg.pacing.frequency_hz
    );
    for (i, block) in cfg.blocks.iter().enumerate() {
        println!(
            "    block {i}: {} trials, amplification {}, {} catch, {} channel",
            block.total_trials,
            block.force_amplification,
            block.catch_trial_indices.len(),
            block.channel_trial_indices.len()
        );
    }
    Ok(())
}

fn run(path: &Path, no_log: bool) -> Result<(), LabError> {
    let cfg = config::load(path)?;
    print_banner(&cfg);

    let runtime =
        Runtime::new().map_err(|e| LabError::Channel(format!("failed to start runtime: {e}")))?;
    let bus = EventBus::default();
    let shutdown = Arc::new(AtomicBool::new(false));
    install_ctrlc(Arc::clone(&shutdown), bus.clone());

    let machine = TrialStateMachine::from_config(cfg.protocol.clone(), cfg.blocks.clone())?;
    let state = machine.initial_state(cfg.force_parameters()?);
    let source = bind_position_source(&cfg)?;
    let actuator = UdpForceActuator::connect(ACTUATOR_ID, cfg.actuator_addr()?)?;

    let latch = ConfirmLatch::new();
    spawn_confirm_reader(latch.clone());

    let mut control = ControlLoop::new(&cfg.loop_config(), source, actuator, machine, state, bus.clone())?
        .with_operator(Box::new(latch))
        .with_shutdown(Arc::clone(&shutdown));

    if no_log {
        println!("  {}", "Logging disabled (--no-log).".yellow());
    } else {
        let log = SessionLog::create_in(&cfg.results_path, cfg.participant.id)?;
        log.save_config(&cfg)?;
        if let Some(dir) = log.directory() {
            println!("  Writing to {}", dir.display().to_string().bold());
        }
        control = control.with_log(log);
    }

    // The recording gate subscribed inside ControlLoop::new, so the listener
    // can start publishing now.
    if let Some(addr) = cfg.capture_signal_bind()? {
        start_capture_listener(&runtime, addr, bus.clone())?;
    }
    runtime.spawn(report_progress(bus.subscribe_to(Topic::Protocol)));

    println!("  Press {} to confirm, {} to stop.\n", "<Enter>".bold().cyan(), "Ctrl-C".bold().cyan());
    let result = control.run();
    drop(control);
    runtime.shutdown_background();

    let summary = result?;
    print_summary(&summary, shutdown.load(Ordering::SeqCst));
    Ok(())
}

fn calibrate(path: &Path, stance_only: bool) -> Result<(), LabError> {
    let cfg = config::load(path)?;
    print_banner(&cfg);

    let source = bind_position_source(&cfg)?;
    let log = SessionLog::create_calibration_in(&cfg.results_path, cfg.participant.id)?;
    log.save_config_as(&cfg, CALIBRATION_CONFIG_FILE_NAME)?;
    if let Some(dir) = log.directory() {
        println!("  Writing to {}", dir.display().to_string().bold());
    }

    let mut calibrator = Calibrator::new(source, cfg.calibration.clone(), &cfg.loop_config())?;
    let mut operator = ConsoleOperator::new();

    println!("\n  {}", "Quiet stance".bold().cyan());
    let stance = calibrator.stance(&mut operator)?;
    stance.write_to(&log)?;
    print_stance(&stance);

    if stance_only {
        return Ok(());
    }
    println!("\n  {}", "Stability limits".bold().cyan());
    let limits = calibrator.stability_limits(&mut operator)?;
    limits.write_to(&log)?;
    print_limits(&limits);
    Ok(())
}

fn bind_position_source(cfg: &ExperimentConfig) -> Result<UdpPositionSource, LabError> {
    let addr = cfg.position_bind()?.ok_or_else(|| {
        LabError::Config("network.position_bind is required to track the participant".to_string())
    })?;
    UdpPositionSource::bind(addr)
}

// ─────────────────────────────────────────────────────────────────────────────
// Side tasks
// ─────────────────────────────────────────────────────────────────────────────

fn install_ctrlc(shutdown: Arc<AtomicBool>, bus: EventBus) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – zeroing force and stopping …".yellow().bold());
        let stop = Event::new(
            "reachlab-cli",
            EventPayload::Fault {
                component: "operator".to_string(),
                message: "stop requested with Ctrl-C".to_string(),
            },
        );
        if let Err(e) = bus.publish_to(Topic::Alerts, stop) {
            debug!(error = %e, "operator stop alert dropped");
        }
        shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the session from the exit screen");
    }
}

/// Every line on stdin is one confirm press.
fn spawn_confirm_reader(latch: ConfirmLatch) {
    let spawned = std::thread::Builder::new()
        .name("confirm-input".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
                latch.press();
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "no stdin reader; confirm input unavailable");
    }
}

fn start_capture_listener(runtime: &Runtime, addr: SocketAddr, bus: EventBus) -> Result<(), LabError> {
    let listener = runtime.block_on(CaptureSignalListener::bind(addr, bus))?;
    runtime.spawn(async move {
        if let Err(e) = listener.run().await {
            error!(error = %e, "capture listener stopped");
        }
    });
    Ok(())
}

async fn report_progress(mut rx: TopicReceiver) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(event) => match event.payload {
                EventPayload::TrialCompleted(report) => print_trial(&report),
                EventPayload::BlockStarted { block_index, total_trials } => {
                    println!(
                        "\n  {} {block_index} ({total_trials} trials)",
                        "Block".bold().cyan()
                    );
                }
                EventPayload::SessionFinished { score, total_trials } => {
                    info!(score, total_trials, "session finished");
                    println!("\n  {} Press <Enter> to exit.", "Session complete.".green().bold());
                }
                _ => {}
            },
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "console reporter lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Calibration prompts on the terminal. `<Enter>` records, `q` aborts.
struct ConsoleOperator {
    lines: Lines<StdinLock<'static>>,
}

impl ConsoleOperator {
    fn new() -> Self {
        Self {
            lines: std::io::stdin().lines(),
        }
    }

    fn ask(&mut self, prompt: &str) -> Option<String> {
        print!("  {prompt} ");
        std::io::stdout().flush().ok();
        self.lines.next().and_then(Result::ok)
    }
}

impl CalibrationOperator for ConsoleOperator {
    fn ready(&mut self, label: &str) -> bool {
        println!("\n  {} {}", "Posture".bold(), label.to_uppercase().bold().cyan());
        match self.ask("Press <Enter> when ready to record, q to quit:") {
            Some(line) => !line.trim().eq_ignore_ascii_case("q"),
            None => false,
        }
    }

    fn accept_placement(&mut self, means: &BTreeMap<String, Vec3>) -> bool {
        for (name, p) in means {
            print_position(name, *p);
        }
        let answer = self.ask("Positioning OK? (y)es, (n)o:");
        matches!(answer.as_deref().map(str::trim), Some("y" | "Y" | "yes"))
    }

    fn rejected(&mut self, label: &str, channel: &str, spread: f64) {
        println!(
            "  {} {channel} moved {:.1} cm during {label}. Try again.",
            "Too much movement:".yellow().bold(),
            spread * 100.0
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_position(name: &str, p: Vec3) {
    println!("    {name:<20} x {:+.3}  y {:+.3}  z {:+.3}", p.x, p.y, p.z);
}

fn print_stance(stance: &StanceCalibration) {
    println!(
        "  {} after {} recording(s)",
        "Stance recorded".green().bold(),
        stance.attempts
    );
    for (name, p) in &stance.means {
        print_position(name, *p);
    }
}

fn print_limits(limits: &StabilityLimits) {
    println!(
        "  {} after {} recording(s)",
        "Stability limits recorded".green().bold(),
        limits.attempts
    );
    for (direction, p) in &limits.directions {
        print_position(direction.as_str(), *p);
    }
    print_position("arithmetic mean", limits.arithmetic_mean);
    print_position("geometric mean", limits.geometric_mean);
}

fn print_trial(report: &TrialReport) {
    let outcome = if report.outcome.is_success() {
        report.outcome.as_str().green()
    } else {
        report.outcome.as_str().red()
    };
    let mut tags = Vec::new();
    if report.catch_trial {
        tags.push("catch");
    }
    if report.channel_trial {
        tags.push("channel");
    }
    println!(
        "    trial {:>3} {:<5} {:<11} {:>5.2}s {:<8} score {:>3}  left {:>3} {}",
        report.trial_index,
        report.target.as_str(),
        outcome,
        report.movement_time,
        report.timing.as_str(),
        report.score,
        report.remaining_trials,
        tags.join(",").dimmed()
    );
}

fn print_banner(cfg: &ExperimentConfig) {
    println!();
    println!("  {} {}", "ReachLab".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!(
        "  Participant {:03} · {} kg · {} block(s)",
        cfg.participant.id,
        cfg.participant.weight_kg,
        cfg.blocks.len()
    );
    println!();
}

fn print_summary(summary: &SessionSummary, interrupted: bool) {
    println!();
    let status = if summary.finished {
        "completed".green().bold()
    } else if interrupted {
        "interrupted".yellow().bold()
    } else {
        "stopped".yellow().bold()
    };
    println!("  Session {status}");
    println!(
        "  Score {}/{} ({} of {} trials run)",
        summary.score, summary.trials_completed, summary.trials_completed, summary.total_trials
    );
    let t = &summary.timing;
    println!(
        "  Loop: {} iterations, {} overruns, worst {:.2} ms, mean period {:.2} ms",
        t.iterations,
        t.overruns,
        t.worst_iteration.as_secs_f64() * 1e3,
        t.mean_period.as_secs_f64() * 1e3
    );
    if summary.force_interventions > 0 {
        println!(
            "  {} force command(s) clamped by the safety gate",
            summary.force_interventions.to_string().yellow()
        );
    }
}
