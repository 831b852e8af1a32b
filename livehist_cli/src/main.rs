//! # livehist_cli
//!
//! Part of the livehist crate family.
//!
//! An interactive terminal front end for the livehist engine. It registers two example event
//! types (a physics event and a scaler event, see `record.rs`), attaches to framed files or
//! TCP sources and accepts histogram commands on stdin while data is flowing.
//!
//! ## Use
//!
//! ```bash
//! livehist_cli -p config.yml new               # write a template config
//! livehist_cli -p demo.frames generate -n 5000 # write synthetic data
//! livehist_cli -p config.yml                   # start a session
//! ```
//!
//! Type `help` in a session for the list of commands.
mod record;
mod repl;

use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use liblivehist::config::Config;
use liblivehist::engine::Engine;
use liblivehist::framed::write_frame;
use liblivehist::status::AttachStatus;

use record::{
    pack_physics, pack_scalers, synthetic_physics, unpack_physics, unpack_scalers, Physics,
    Scalers, PHYSICS_EVENT, SCALER_EVENT,
};
use repl::{parse_command, Session};

fn make_template_config(path: &Path) -> Result<(), liblivehist::error::ConfigError> {
    Config::default().write_config_file(path)
}

/// Write `n_events` physics events with a scaler event every hundred
fn generate_demo_file(path: &Path, n_events: u64) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut scalers = Scalers::default();
    for n in 0..n_events {
        let event = synthetic_physics(n);
        write_frame(&mut writer, PHYSICS_EVENT, &pack_physics(&event)?)?;
        for (count, hits) in scalers.counts.iter_mut().zip([1, event.hits.len() as u32, 2, 3]) {
            *count += hits;
        }
        if n % 100 == 99 {
            write_frame(&mut writer, SCALER_EVENT, &pack_scalers(&scalers)?)?;
        }
    }
    writer.flush()
}

/// Route the library's spdlog output to the configured log file
fn init_file_log(path: &Path) -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from(path))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

/// Drive the spinner from the acquisition thread's status messages
fn report_status(rx: Receiver<AttachStatus>, spinner: ProgressBar) {
    for status in rx {
        match status {
            AttachStatus::Attached { state, source } => {
                log::info!("Attached ({state:?}) to {source}");
                spinner.set_message(format!("{source}: 0 buffers"));
            }
            AttachStatus::BufferCount { buffers } => {
                spinner.set_message(format!("{buffers} buffers"));
            }
            AttachStatus::Truncated { expected, received } => {
                log::warn!("Truncated buffer: expected {expected} bytes, received {received}");
            }
            AttachStatus::BadEvent { buffers } => {
                spinner.set_message(format!("{buffers} buffers (bad events seen)"));
            }
            AttachStatus::ListEntrySkipped { path, reason } => {
                log::warn!("Skipped {}: {reason}", path.to_string_lossy());
            }
            AttachStatus::RunComplete { buffers, bytes } => {
                log::info!("Run complete: {buffers} buffers, {bytes} bytes");
            }
            AttachStatus::Aborted { reason } => log::error!("Acquisition aborted: {reason}"),
            AttachStatus::Detached => spinner.set_message("detached"),
        }
    }
    spinner.finish_and_clear();
}

fn main() {
    // Create a cli
    let matches = Command::new("livehist_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("generate")
                .about("Write a framed file of synthetic events to the path")
                .arg(
                    Arg::new("events")
                        .short('n')
                        .long("events")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("1000")
                        .help("Number of physics events"),
                ),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }

    // Parse the cli
    let path = match matches.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => return,
    };

    match matches.subcommand() {
        Some(("new", _)) => {
            log::info!("Making a template config at {}...", path.to_string_lossy());
            match make_template_config(&path) {
                Ok(()) => log::info!("Done."),
                Err(e) => log::error!("{e}"),
            }
            return;
        }
        Some(("generate", args)) => {
            let n_events = args.get_one::<u64>("events").copied().unwrap_or(1000);
            log::info!(
                "Writing {n_events} synthetic events to {}...",
                path.to_string_lossy()
            );
            match generate_demo_file(&path, n_events) {
                Ok(()) => log::info!("Done."),
                Err(e) => log::error!("Could not write demo file: {e}"),
            }
            return;
        }
        _ => (),
    }

    // Load our config
    log::info!("Loading config from {}...", path.to_string_lossy());
    let config = match Config::read_config_file(&path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Retry interval: {} ms", config.retry_interval_ms);
    log::info!("Status interval: {} buffers", config.status_interval);
    log::info!("Max buffer size: {} bytes", config.max_buffer_bytes);
    log::info!("Log file: {}", config.log_path.to_string_lossy());

    if let Err(e) = init_file_log(&config.log_path) {
        log::error!("Could not open log file: {e}");
        return;
    }
    spdlog::info!("Starting livehist session");

    let (tx, rx) = std::sync::mpsc::channel();
    let engine = Engine::builder(config)
        .event::<Physics, _>(PHYSICS_EVENT, "physics", unpack_physics)
        .event::<Scalers, _>(SCALER_EVENT, "scalers", unpack_scalers)
        .status_sender(tx)
        .build();

    let spinner = pb_manager.add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("detached");
    let status_handle = std::thread::spawn(move || report_status(rx, spinner));

    let mut session = Session::new(&engine);
    log::info!("Type help for a list of commands.");
    for line in std::io::stdin().lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log::error!("Could not read input: {e}");
                break;
            }
        };
        let command = match parse_command(&line) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(e) => {
                log::error!("{e}");
                continue;
            }
        };
        match session.execute(command) {
            Ok(true) => (),
            Ok(false) => break,
            Err(e) => log::error!("{e}"),
        }
    }

    // Dropping the engine stops acquisition and closes the status channel
    drop(session);
    drop(engine);
    if status_handle.join().is_err() {
        log::error!("Failed to join status task!");
    }

    log::info!("Done.");
}
