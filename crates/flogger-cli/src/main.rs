//! flogger CLI: run a synthetic experiment through a data logger, or serve as
//! a process-pool worker.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flogger::{handlers, worker, DataLogger, HandlerRegistry, LoggerConfig, PoolKind, DEFAULT_PARALLELISM};

#[derive(Parser)]
#[command(
    name = "flogger",
    about = "📈 flogger: asynchronous data logging for long-running experiments",
    version,
    author
)]
struct Cli {
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic training loop through a data logger
    Demo(DemoArgs),
    /// Serve the built-in handlers over stdin/stdout for a process pool
    Worker,
}

#[derive(Args)]
struct DemoArgs {
    /// Pool running the handlers
    #[arg(long, default_value = "thread", value_parser = ["sync", "silent", "thread", "process"])]
    pool: String,
    /// Number of threads or worker processes
    #[arg(long, short, default_value_t = DEFAULT_PARALLELISM)]
    workers: usize,
    /// Directory receiving one timestamped subdirectory per run
    #[arg(long, default_value = "./flogger-runs")]
    dir: PathBuf,
    /// Number of training steps to simulate
    #[arg(long, default_value_t = 100)]
    steps: u64,
    /// Logger name
    #[arg(long, default_value = "demo")]
    name: String,
    /// Read the logger configuration from a YAML file instead
    #[arg(long, conflicts_with_all = ["pool", "workers", "name"])]
    config: Option<PathBuf>,
    /// Executable used as process-pool worker (default: this binary)
    #[arg(long)]
    worker_program: Option<PathBuf>,
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    // A worker serves its parent and exits before any argument parsing.
    if worker::is_worker() {
        let _guard = init_tracing(None)?;
        worker::run_if_worker(&HandlerRegistry::builtin());
    }

    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Demo(args) => cmd_demo(args)?,
        Commands::Worker => cmd_worker()?,
    }

    Ok(())
}

/// Logs go to stderr; stdout belongs to handler output and the worker protocol.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("invalid log file: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(Some(guard))
}

// ─── Command implementations ──────────────────────────────────────────────────

fn cmd_worker() -> Result<()> {
    let served = worker::serve(&HandlerRegistry::builtin(), io::stdin().lock(), io::stdout())?;
    info!(served, "worker input closed");
    Ok(())
}

fn demo_config(args: &DemoArgs, run_dir: &Path) -> Result<LoggerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = LoggerConfig::from_yaml_file(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            config.path = run_dir.to_path_buf();
            config
        }
        None => LoggerConfig::new(args.name.clone(), run_dir)
            .with_pool(PoolKind::parse(&args.pool, args.workers)?),
    };
    if let Some(program) = &args.worker_program {
        config = config.with_worker_program(program);
    }
    Ok(config)
}

fn cmd_demo(args: DemoArgs) -> Result<()> {
    let run_dir = args
        .dir
        .join(chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
    let config = demo_config(&args, &run_dir)?;
    let pool = config.pool;
    let logger = DataLogger::from_config(config)?;

    logger.declare(
        "loss",
        vec![handlers::log_debug_last()],
        vec![handlers::save_to_json()],
        vec![],
    )?;
    logger.declare(
        "metrics/accuracy",
        vec![],
        vec![handlers::save_to_text()],
        vec![handlers::save_to_json_last()],
    )?;
    logger.declare("lr", vec![], vec![handlers::echo_last()], vec![])?;

    let started = Instant::now();
    let bar = ProgressBar::new(args.steps);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")?.progress_chars("=> "),
    );

    let mut lr = 0.1;
    for step in 0..args.steps {
        let progress = step as f64 / args.steps.max(1) as f64;
        let loss = (-3.0 * progress).exp();
        logger.push("loss", loss, None)?;
        logger.push("metrics/accuracy", 1.0 - 0.9 * loss, Some(step))?;
        if step % 10 == 0 {
            logger.push("lr", lr, Some(step))?;
            lr *= 0.5;
        }
        bar.set_message(format!("loss {loss:.4}"));
        bar.inc(1);
    }
    bar.finish_and_clear();

    // Units of one entry are not ordered across workers: drain pushes first.
    logger.wait(true);
    logger.dump();
    logger.wait(true);
    logger.reset("metrics/accuracy")?;
    logger.wait(true);

    print_summary(&logger, pool, &run_dir, started.elapsed().as_secs_f64(), args.json)
}

fn print_summary(
    logger: &DataLogger,
    pool: PoolKind,
    run_dir: &Path,
    elapsed: f64,
    as_json: bool,
) -> Result<()> {
    let mut rows = Vec::new();
    for entry in logger.entries() {
        let data = logger.snapshot(&entry)?;
        let last = data.iter().next_back();
        let pushes = logger.entry_length(&entry)?;
        rows.push((
            entry,
            pushes,
            data.len(),
            last.map(|(k, v)| (k.to_string(), v.to_string())),
        ));
    }

    if as_json {
        let entries: Vec<_> = rows
            .iter()
            .map(|(entry, pushes, stored, last)| {
                json!({
                    "entry": entry,
                    "pushes": pushes,
                    "stored": stored,
                    "last": last.as_ref().map(|(k, v)| json!({ "key": k, "value": v })),
                })
            })
            .collect();
        let summary = json!({
            "logger": logger.name(),
            "pool": pool.to_string(),
            "path": run_dir.display().to_string(),
            "elapsed_secs": elapsed,
            "entries": entries,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Entry", "Pushes", "Stored", "Last key", "Last value"]);
    for (entry, pushes, stored, last) in &rows {
        let (key, value) = last
            .as_ref()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .unwrap_or(("-", "-"));
        table.add_row([entry.as_str(), &pushes.to_string(), &stored.to_string(), key, value]);
    }

    println!("📈 flogger demo");
    println!("   Logger:  {}", logger.name());
    println!("   Pool:    {pool}");
    println!("   Output:  {}", run_dir.display());
    println!("   Elapsed: {elapsed:.2}s");
    println!("{table}");
    Ok(())
}
