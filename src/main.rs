use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use script_shelf::config::{self, Config};
use script_shelf::executor::{RunRequest, RunResult, ScriptRunner, ScriptType};
use script_shelf::logging;
use script_shelf::process_manager::ProcessManager;
use script_shelf::scripts::Script;

#[derive(Parser)]
#[command(name = "script-shelf")]
#[command(about = "Run saved shell scripts with streamed output.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.script-shelf/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file, streaming its output to stdout
    Run {
        file: PathBuf,

        /// bash, batch or powershell (default: from the file extension)
        #[arg(long = "type", short = 't')]
        script_type: Option<String>,

        /// Script id used for tracking (default: the file stem)
        #[arg(long)]
        id: Option<String>,

        /// Working directory (default: home directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Run a saved script record, given as JSON text or a path to a JSON file
    RunRecord { json: String },

    /// Delete leftover materialized script files
    Sweep,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Must outlive everything that logs
    let _guard = logging::init();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let (runner, swept) = start_runner(&config);

    match cli.command {
        Commands::Run {
            file,
            script_type,
            id,
            cwd,
        } => {
            let request = request_for_file(&file, script_type.as_deref(), id, cwd)?;
            run_to_exit(runner, request)
        }
        Commands::RunRecord { json } => {
            let text = if json.trim_start().starts_with('{') {
                json
            } else {
                std::fs::read_to_string(&json)
                    .with_context(|| format!("failed to read script record {json}"))?
            };
            let script = Script::from_json(&text).context("invalid script record")?;
            logging::log("APP", &format!("Running saved script '{}'", script.name));
            run_to_exit(runner, script.to_run_request()?)
        }
        // Nothing has run yet, so the startup sweep is the whole job
        Commands::Sweep => {
            println!(
                "Removed {} leftover script file(s) from {}",
                swept,
                runner.temp_dir().display()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Reap orphans from a crashed session, build the runner and sweep its temp dir.
///
/// Returns the runner with the number of files the sweep removed.
fn start_runner(config: &Config) -> (ScriptRunner, usize) {
    let mut runner = ScriptRunner::new(config);

    if config.track_processes {
        let manager = Arc::new(ProcessManager::new());
        let reaped = manager.cleanup_orphans(config.get_process_limits().kill_grace());
        if reaped > 0 {
            logging::log(
                "APP",
                &format!(
                    "Reaped {} orphaned script process(es), this instance is PID {}",
                    reaped,
                    manager.owner_pid()
                ),
            );
        }
        runner = runner.with_process_manager(manager);
    }

    logging::log(
        "APP",
        &format!("Materializing scripts in {}", runner.temp_dir().display()),
    );
    let swept = runner.sweep();
    (runner, swept)
}

fn request_for_file(
    file: &Path,
    script_type: Option<&str>,
    id: Option<String>,
    cwd: Option<PathBuf>,
) -> Result<RunRequest> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let script_type = match script_type {
        Some(name) => name.parse()?,
        None => file
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
            .unwrap_or_else(ScriptType::platform_default),
    };

    let id = id.unwrap_or_else(|| {
        file.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string())
    });

    let mut request = RunRequest::new(id, content, script_type);
    request.working_directory = cwd;
    Ok(request)
}

/// Run `request`, copy its output to stdout, and mirror its exit status
fn run_to_exit(runner: ScriptRunner, request: RunRequest) -> Result<ExitCode> {
    let output = runner.subscribe();
    let printer = thread::spawn(move || {
        let mut stdout = std::io::stdout().lock();
        while let Ok(chunk) = output.recv_blocking() {
            if stdout.write_all(chunk.text.as_bytes()).is_err() {
                break;
            }
            let _ = stdout.flush();
        }
    });

    let result = runner.start(request)?.wait_blocking();
    runner.shutdown();

    // Dropping the last runner handle closes the output channel
    drop(runner);
    let _ = printer.join();

    Ok(exit_code_for(&result))
}

fn exit_code_for(result: &RunResult) -> ExitCode {
    match result.exit_code {
        Some(code) => ExitCode::from((code & 0xff) as u8),
        None => ExitCode::FAILURE,
    }
}
