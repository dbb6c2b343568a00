//! Scheduled gatepass submission for the flyash portal.
//!
//! Settings and the form profile live in `.gatepass/` under the project root.
//! `run` fires one cycle now; `daemon` arms the daily schedule and keeps
//! running until interrupted. Passcodes are typed on stdin.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use gatepass::control::Controller;
use gatepass::core::events::{CycleEvent, EventEnvelope};
use gatepass::core::types::{FinalOutcome, TriggerKind};
use gatepass::credentials::Credentials;
use gatepass::exit_codes;
use gatepass::io::config::load_settings;
use gatepass::io::form_profile::load_form_profile;
use gatepass::io::init::{GatepassPaths, InitOptions, init_project};
use gatepass::io::passcode::StdinPasscode;
use gatepass::io::port::default_port_factory;
use gatepass::logging;
use gatepass::retry::{CycleRequest, RetryEngine};
use gatepass::scheduler::{Clock, SystemClock};
use gatepass::sink::{EventSink, FanoutSink, TracingSink};

#[derive(Parser)]
#[command(
    name = "gatepass",
    version,
    about = "Scheduled gatepass submission for the flyash portal"
)]
struct Cli {
    /// Project root containing `.gatepass/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.gatepass/` with default settings and form profile.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check settings and form profile.
    Validate,
    /// Print when the configured time of day next occurs.
    NextFire,
    /// Run one cycle now.
    Run(LoginArgs),
    /// Arm the daily schedule and run until Ctrl-C.
    Daemon(LoginArgs),
}

#[derive(Args)]
struct LoginArgs {
    /// Portal username.
    #[arg(short, long, env = "GATEPASS_USERNAME")]
    username: String,
    /// Portal password. Prompted for when unset.
    #[arg(long, env = "GATEPASS_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl LoginArgs {
    fn into_credentials(self) -> Result<Credentials> {
        let password = match self.password {
            Some(password) => password,
            None => prompt_password()?,
        };
        let credentials = Credentials::new(self.username, password);
        credentials.validate()?;
        Ok(credentials)
    }
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Validate => cmd_validate(&cli.root),
        Command::NextFire => cmd_next_fire(&cli.root),
        Command::Run(login) => {
            let credentials = login.into_credentials()?;
            runtime()?.block_on(cmd_run(&cli.root, credentials))
        }
        Command::Daemon(login) => {
            let credentials = login.into_credentials()?;
            runtime()?.block_on(cmd_daemon(&cli.root, credentials))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.gatepass_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let paths = GatepassPaths::new(root);
    load_settings(&paths.settings_path)?;
    load_form_profile(&paths.form_profile_path)?;
    println!("ok");
    Ok(exit_codes::OK)
}

fn cmd_next_fire(root: &Path) -> Result<i32> {
    let paths = GatepassPaths::new(root);
    let settings = load_settings(&paths.settings_path)?;
    let clock = SystemClock;
    let next = clock.next_after(clock.now(), settings.schedule.time_of_day);
    println!("{}", next.with_timezone(&Local).to_rfc3339());
    Ok(exit_codes::OK)
}

async fn cmd_run(root: &Path, credentials: Credentials) -> Result<i32> {
    let paths = GatepassPaths::new(root);
    let mut settings = load_settings(&paths.settings_path)?;
    settings.screenshot_dir = paths.screenshot_dir(&settings);
    let profile = load_form_profile(&paths.form_profile_path)?;

    let engine = Arc::new(RetryEngine::new(
        default_port_factory(),
        Arc::new(StdinPasscode::new()),
        console_sink(),
    ));
    let request = CycleRequest {
        trigger: TriggerKind::Manual,
        credentials,
        profile,
        settings,
    };
    let cycle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(request).await })
    };
    let outcome = tokio::select! {
        joined = cycle => joined.context("cycle task")??,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            return Ok(exit_codes::FATAL);
        }
    };

    let summary = serde_json::to_string_pretty(&outcome).context("serialize outcome")?;
    println!("{summary}");
    Ok(match outcome {
        FinalOutcome::Success { .. } => exit_codes::OK,
        FinalOutcome::Exhausted { .. } => exit_codes::EXHAUSTED,
        FinalOutcome::Fatal { .. } | FinalOutcome::Cancelled { .. } => exit_codes::FATAL,
    })
}

async fn cmd_daemon(root: &Path, credentials: Credentials) -> Result<i32> {
    let paths = GatepassPaths::new(root);
    let settings = load_settings(&paths.settings_path)?;
    let controller = Arc::new(Controller::new(
        root,
        default_port_factory(),
        console_sink(),
        Arc::new(SystemClock),
    ));
    let next = controller.arm_schedule(settings.schedule, credentials)?;
    eprintln!(
        "armed; next run at {} (Ctrl-C to stop)",
        next.with_timezone(&Local).to_rfc3339()
    );

    let passcodes = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(err) = controller.submit_passcode(&line) {
                    eprintln!("{err:#}");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    passcodes.abort();
    controller.disarm_schedule();
    eprintln!("disarmed");
    Ok(exit_codes::OK)
}

/// Human-readable progress on stderr, plus the tracing mirror.
struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, envelope: &EventEnvelope) {
        if let Some(line) = describe(&envelope.event) {
            eprintln!("{line}");
        }
    }
}

fn console_sink() -> Arc<dyn EventSink> {
    Arc::new(FanoutSink::new(vec![
        Arc::new(ConsoleSink),
        Arc::new(TracingSink),
    ]))
}

fn describe(event: &CycleEvent) -> Option<String> {
    Some(match event {
        CycleEvent::CycleStarted {
            trigger_kind,
            max_attempts,
        } => format!("{trigger_kind} cycle started ({max_attempts} attempts max)"),
        CycleEvent::AttemptStarted { index, max } => format!("attempt {index}/{max}"),
        CycleEvent::StateChanged { from, to, .. } => format!("  {from} -> {to}"),
        CycleEvent::AttemptFailed {
            index,
            reason,
            message,
            ..
        } => format!("attempt {index} failed ({reason}): {message}"),
        CycleEvent::CycleSucceeded {
            attempt_index,
            marker,
        } => format!("submitted on attempt {attempt_index} ({marker})"),
        CycleEvent::CycleExhausted { attempts, .. } => {
            format!("gave up after {attempts} attempts")
        }
        CycleEvent::CycleFatal { error } => format!("cycle aborted: {error}"),
        CycleEvent::TriggerSkipped {
            trigger_kind,
            reason,
        } => format!("{trigger_kind} trigger skipped: {reason}"),
        CycleEvent::ScheduleChanged { .. } => return None,
    })
}

fn prompt_password() -> Result<String> {
    eprint!("password: ");
    std::io::stderr().flush().context("flush prompt")?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given");
    }
    Ok(password)
}
