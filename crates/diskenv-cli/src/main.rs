mod commands;
mod render;

use clap::Parser;
use commands::{EXIT_FAILURE, EXIT_MANIFEST_ERROR, EXIT_SUCCESS, EXIT_USAGE};
use diskenv_core::Task;
use diskenv_runtime::Drive;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "diskenv",
    version,
    about = "Create, attach, detach, and compact disk-image-backed environments"
)]
struct Cli {
    /// Path to the environment manifest.
    #[arg(long, default_value = "diskenv.toml")]
    manifest: PathBuf,

    /// Virtual disk file (overrides `[disk] file` in the manifest).
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Print progress events as JSON lines.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false)]
    trace: bool,

    /// Append progress events to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Drive letter the disk is mounted on, e.g. `E` or `E:`.
    drive: Drive,

    /// One of: create, attach, detach, compact, shortcuts.
    task: Task,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_SUCCESS };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DISKENV_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let options = commands::run::RunOptions {
        manifest: &cli.manifest,
        disk: cli.disk.as_deref(),
        json: cli.json,
        log_file: cli.log_file.as_deref(),
    };

    match commands::run::run(cli.drive, cli.task, &options) {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:") {
                EXIT_MANIFEST_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
