//! calltrace - inspect recorded call logs
//!
//! Reads the JSONL call log written by the file backend and prints calls, reconstructed
//! call trees and per-op statistics.

use calltrace_core::config::{CalltraceConfig, ConfigLoader};
use calltrace_core::{Call, CallStatus, CallTree, Op};
use calltrace_export::{init_client, read_call_log};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "calltrace")]
#[command(version)]
#[command(about = "Inspect calltrace call logs", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "CALLTRACE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print recorded calls
    Show {
        /// Call log (defaults to the configured backend path)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Only calls of this op
        #[arg(long)]
        op: Option<String>,

        /// Number of calls to show
        #[arg(short, long, default_value = "50")]
        num: usize,
    },

    /// Print reconstructed call trees
    Tree {
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Only this trace
        #[arg(short, long)]
        trace: Option<String>,
    },

    /// Per-op counts and latencies, and per-trace sizes
    Stats {
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Exit with an error if the configuration is invalid
        #[arg(long)]
        validate: bool,

        /// Also open the configured backend
        #[arg(long)]
        connect: bool,

        /// Write the effective configuration to this path
        #[arg(long)]
        write: Option<PathBuf>,
    },

    /// Record a traced recursive workload into a call log
    Demo {
        /// Output call log (defaults to the configured backend path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Fibonacci index to compute; one call per recursive step
        #[arg(long, default_value = "6")]
        depth: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, config_error) = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.log.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(e) = &config_error {
        warn!("Failed to load configuration: {}, using defaults", e);
    }

    let log_path = |input: Option<PathBuf>| input.unwrap_or_else(|| PathBuf::from(&config.backend.path));

    match cli.command {
        Commands::Show { input, op, num } => {
            let calls = read_call_log(&log_path(input))?;
            show_command(&calls, op.as_deref(), num)
        }
        Commands::Tree { input, trace } => {
            let calls = read_call_log(&log_path(input))?;
            print!("{}", render_tree(&CallTree::new(calls), trace.as_deref()));
            Ok(())
        }
        Commands::Stats { input } => {
            let calls = read_call_log(&log_path(input))?;
            print!("{}", render_stats(&CallTree::new(calls)));
            Ok(())
        }
        Commands::Config {
            validate,
            connect,
            write,
        } => config_command(&config, config_error, validate, connect, write).await,
        Commands::Demo { output, depth } => demo_command(config.clone(), output, depth).await,
    }
}

fn load_config(cli_path: Option<PathBuf>) -> (CalltraceConfig, Option<anyhow::Error>) {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => (config, None),
        Err(e) => (CalltraceConfig::default(), Some(e.into())),
    }
}

fn show_command(calls: &[Call], op: Option<&str>, num: usize) -> anyhow::Result<()> {
    let mut calls: Vec<&Call> = calls
        .iter()
        .filter(|c| op.map_or(true, |op| c.op_name == op))
        .collect();
    calls.sort_by_key(|c| c.started_at);

    for call in calls.into_iter().take(num) {
        println!("{}", serde_json::to_string_pretty(call)?);
    }
    Ok(())
}

fn call_line(call: &Call) -> String {
    let status = match call.status {
        CallStatus::Running => "running",
        CallStatus::Success => "ok",
        CallStatus::Error => "error",
    };
    let latency = call
        .latency_secs()
        .map(|s| format!("{:.3}s", s))
        .unwrap_or_else(|| "-".to_string());
    let name = call.display_name.as_deref().unwrap_or(&call.op_name);
    format!(
        "{} [{}] {} {}",
        name,
        status,
        latency,
        call.started_at.format("%H:%M:%S%.3f")
    )
}

fn render_call(tree: &CallTree, call: &Call, indent: usize, out: &mut String) {
    let _ = writeln!(out, "{:indent$}{}", "", call_line(call), indent = indent * 2);
    for child in tree.children(&call.id) {
        render_call(tree, child, indent + 1, out);
    }
}

fn render_tree(tree: &CallTree, trace: Option<&str>) -> String {
    let mut out = String::new();
    for root in tree
        .roots()
        .filter(|c| trace.map_or(true, |t| c.trace_id == t))
    {
        let _ = writeln!(out, "trace {}", root.trace_id);
        render_call(tree, root, 1, &mut out);
    }

    let detached: Vec<&Call> = tree
        .detached()
        .into_iter()
        .filter(|c| trace.map_or(true, |t| c.trace_id == t))
        .collect();
    if !detached.is_empty() {
        let _ = writeln!(out, "{} calls with cyclic parents:", detached.len());
        for call in detached {
            let _ = writeln!(out, "  {}", call_line(call));
        }
    }
    out
}

#[derive(Default)]
struct OpStats {
    calls: usize,
    errors: usize,
    timed: usize,
    latency_total: f64,
}

fn render_stats(tree: &CallTree) -> String {
    let mut ops: BTreeMap<&str, OpStats> = BTreeMap::new();
    for call in tree.deepest_first() {
        let stats = ops.entry(call.op_name.as_str()).or_default();
        stats.calls += 1;
        if call.status == CallStatus::Error {
            stats.errors += 1;
        }
        if let Some(latency) = call.latency_secs() {
            stats.timed += 1;
            stats.latency_total += latency;
        }
    }

    // (calls in subtree, subtree height)
    let sizes = tree.fold_up(
        |_| (1usize, 0usize),
        |acc, child| {
            acc.0 += child.0;
            acc.1 = acc.1.max(child.1 + 1);
        },
    );

    let mut out = String::new();
    let _ = writeln!(out, "{} calls\n", tree.len());
    let _ = writeln!(
        out,
        "  {:<32} {:>8} {:>8} {:>12}",
        "op", "calls", "errors", "mean"
    );
    for (name, stats) in &ops {
        let mean = if stats.timed > 0 {
            format!("{:.3}s", stats.latency_total / stats.timed as f64)
        } else {
            "-".to_string()
        };
        let _ = writeln!(
            out,
            "  {:<32} {:>8} {:>8} {:>12}",
            name, stats.calls, stats.errors, mean
        );
    }

    let _ = writeln!(out, "\ntraces:");
    for root in tree.roots() {
        let (size, height) = sizes.get(&root.id).copied().unwrap_or((1, 0));
        let _ = writeln!(
            out,
            "  {} {:<24} {:>6} calls, depth {}",
            root.trace_id, root.op_name, size, height
        );
    }
    out
}

async fn config_command(
    config: &CalltraceConfig,
    config_error: Option<anyhow::Error>,
    validate: bool,
    connect: bool,
    write: Option<PathBuf>,
) -> anyhow::Result<()> {
    if validate {
        if let Some(e) = config_error {
            return Err(e);
        }
        ConfigLoader::validate(config)?;
        println!("Configuration is valid");
    }

    if connect {
        let client = init_client(config)?;
        println!("Connected to {} backend", client.backend().name());
        client.shutdown().await;
    }

    if let Some(path) = write {
        ConfigLoader::save(config, &path)?;
        return Ok(());
    }

    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn fibonacci(op: Arc<Op>, n: u32) -> Pin<Box<dyn Future<Output = Result<u64, Infallible>> + Send>> {
    Box::pin(async move {
        let body_op = op.clone();
        op.run(json!({ "n": n }), async move {
            if n < 2 {
                return Ok(n as u64);
            }
            let a = fibonacci(body_op.clone(), n - 1).await?;
            let b = fibonacci(body_op, n - 2).await?;
            Ok(a + b)
        })
        .await
    })
}

async fn demo_command(
    mut config: CalltraceConfig,
    output: Option<PathBuf>,
    depth: u32,
) -> anyhow::Result<()> {
    if let Some(path) = output {
        config.backend.kind = "jsonl".to_string();
        config.backend.path = path.display().to_string();
    }

    let client = init_client(&config)?;
    let op = Arc::new(
        Op::builder("fibonacci")
            .parameter_names(["n"])
            .display_name(|inputs| format!("fibonacci({})", inputs["n"]))
            .build(client.clone()),
    );

    let value = fibonacci(op, depth).await?;
    client.shutdown().await;

    let stats = client.stats();
    info!("Demo finished: {} events sent", stats.sent);
    println!(
        "fibonacci({}) = {} ({} events written to {})",
        depth, value, stats.sent, config.backend.path
    );
    Ok(())
}
