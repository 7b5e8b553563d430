//! Iterative code-execution agent for data visualization.
//!
//! `vizloop run` drives the Plan → Act → Observe loop against a command-backed
//! reasoner and a local sandbox; `vizloop exec` runs a single snippet through
//! the same sandbox.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use vizloop::core::protocol::render_observation;
use vizloop::core::types::{LoopStop, Turn};
use vizloop::exit_codes;
use vizloop::io::config::{DEFAULT_CONFIG_PATH, VizloopConfig, load_config, write_config};
use vizloop::io::reasoner::CommandReasoner;
use vizloop::io::sandbox::{Sandbox, SandboxOptions};
use vizloop::io::signals::cancel_on_signal;
use vizloop::logging;
use vizloop::looping::{CancelToken, LoopConfig, run_agent};
use vizloop::tool::CodeTool;

#[derive(Parser)]
#[command(
    name = "vizloop",
    version,
    about = "Iterative code-execution agent for data visualization"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the agent loop for a query.
    Run {
        /// What to visualize.
        query: String,
        /// Override `iteration_limit`.
        #[arg(long)]
        iteration_limit: Option<u32>,
        /// Override `execution_timeout_secs`.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Execute one snippet from FILE (or stdin) and print the observation.
    Exec {
        file: Option<PathBuf>,
        /// Override `execution_timeout_secs`.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            logging::init(cli.log_file.as_deref())?;
            cmd_init(&cli.config, force)
        }
        Command::Run {
            query,
            iteration_limit,
            timeout_secs,
        } => {
            let mut cfg = load_config(&cli.config)?;
            if let Some(limit) = iteration_limit {
                cfg.iteration_limit = limit;
            }
            if let Some(secs) = timeout_secs {
                cfg.execution_timeout_secs = secs;
            }
            cfg.validate()?;
            logging::init(cli.log_file.as_deref().or(cfg.log_file.as_deref()))?;
            let cancel = CancelToken::new();
            cancel_on_signal(&cancel)?;
            cmd_run(&cfg, &query, &cancel)
        }
        Command::Exec { file, timeout_secs } => {
            let mut cfg = load_config(&cli.config)?;
            if let Some(secs) = timeout_secs {
                cfg.execution_timeout_secs = secs;
            }
            cfg.validate()?;
            logging::init(cli.log_file.as_deref().or(cfg.log_file.as_deref()))?;
            let cancel = CancelToken::new();
            cancel_on_signal(&cancel)?;
            cmd_exec(&cfg, file.as_deref(), &cancel)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    write_config(path, &VizloopConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(cfg: &VizloopConfig, query: &str, cancel: &CancelToken) -> Result<i32> {
    let tool = build_tool(cfg, cancel)?;
    let reasoner = CommandReasoner::new(&cfg.reasoner).with_cancel(cancel.clone());
    info!(iteration_limit = cfg.iteration_limit, "starting run");

    let outcome = run_agent(
        query,
        &reasoner,
        &tool,
        &LoopConfig::from(cfg),
        cancel,
        print_turn,
    )?;

    println!("Final Output:");
    if let Some(turn) = outcome.final_turn() {
        println!("{}", turn.text.trim_end());
    }
    println!();
    println!("{}", outcome.stop.describe());
    println!(
        "Total Iterations: {}/{}",
        outcome.state.iteration(),
        outcome.state.iteration_limit()
    );

    Ok(match outcome.stop {
        LoopStop::Complete => exit_codes::OK,
        LoopStop::BudgetExhausted => exit_codes::BUDGET_EXHAUSTED,
        LoopStop::Cancelled => exit_codes::CANCELLED,
    })
}

fn cmd_exec(cfg: &VizloopConfig, file: Option<&Path>, cancel: &CancelToken) -> Result<i32> {
    let code = match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("read snippet from stdin")?;
            buf
        }
    };

    let tool = build_tool(cfg, cancel)?;
    let result = tool.execute(&code);
    println!("{}", render_observation(&result));
    Ok(if cancel.is_cancelled() {
        exit_codes::CANCELLED
    } else if result.succeeded {
        exit_codes::OK
    } else {
        exit_codes::EXEC_FAILED
    })
}

fn build_tool(cfg: &VizloopConfig, cancel: &CancelToken) -> Result<CodeTool<Sandbox>> {
    let sandbox = Sandbox::new(SandboxOptions::from_config(
        &cfg.engine,
        &cfg.output_dir,
        cfg.workspace_parent.as_deref(),
    ))
    .context("prepare sandbox")?
    .with_cancel(cancel.clone());
    Ok(CodeTool::new(sandbox).with_timeout(cfg.execution_timeout()))
}

fn print_turn(turn: &Turn) {
    println!("[{}]", turn.role.as_str());
    println!("{}", turn.text.trim_end());
    println!();
}
