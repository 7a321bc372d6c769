//! Cadence CLI
//!
//! Lists and runs the built-in scheduler scenarios.

use anyhow::{bail, Context, Result};
use cadence::event_loop::{ClockKind, SchedulerConfig};
use cadence::scenarios::{self, ScenarioOutcome};
use cadence::VERSION;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Deterministic cooperative scheduler for embedded scripting runtimes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in scenarios
    List,

    /// Run one scenario, or all of them
    Run {
        /// Scenario name (all scenarios when omitted)
        name: Option<String>,

        /// Clock to drive timers with
        #[arg(long, value_enum)]
        clock: Option<ClockArg>,

        /// JSON scheduler configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print outcomes as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ClockArg {
    Virtual,
    System,
}

impl From<ClockArg> for ClockKind {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Virtual => ClockKind::Virtual,
            ClockArg::System => ClockKind::System,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    setup_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::List) {
        Commands::List => list_scenarios(),
        Commands::Run {
            name,
            clock,
            config,
            json,
        } => {
            let mut config = match config {
                Some(path) => SchedulerConfig::load(&path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => SchedulerConfig::default(),
            };
            if let Some(clock) = clock {
                config.clock = clock.into();
            }
            run_scenarios(name.as_deref(), &config, json)?;
        }
    }
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn list_scenarios() {
    println!("Cadence {} scenarios:", VERSION);
    for scenario in scenarios::all() {
        println!("  {:<24} {}", scenario.name, scenario.description);
    }
}

fn run_scenarios(name: Option<&str>, config: &SchedulerConfig, json: bool) -> Result<()> {
    let selected: Vec<_> = match name {
        Some(name) => match scenarios::find(name) {
            Some(scenario) => vec![scenario],
            None => bail!("unknown scenario '{}' (try `cadence list`)", name),
        },
        None => scenarios::all().iter().collect(),
    };

    let mut outcomes = Vec::with_capacity(selected.len());
    for scenario in selected {
        let outcome = scenarios::run_scenario(scenario, config)
            .with_context(|| format!("scenario {} aborted", scenario.name))?;
        outcomes.push(outcome);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            print_outcome(outcome);
        }
    }

    let failed = outcomes.iter().filter(|o| !o.passed).count();
    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, outcomes.len());
    }
    Ok(())
}

fn print_outcome(outcome: &ScenarioOutcome) {
    let mark = if outcome.passed { "PASS" } else { "FAIL" };
    println!("[{}] {}", mark, outcome.name);
    for line in &outcome.log {
        println!("    {}", line);
    }
    for fault in &outcome.faults {
        println!("    ! {}", fault);
    }
    if !outcome.passed {
        println!("    expected:");
        for line in &outcome.expected {
            println!("    {}", line);
        }
    }
    println!(
        "    {} ticks, {} microtasks, {} timers, finished at {}ms",
        outcome.report.ticks,
        outcome.report.microtasks_processed,
        outcome.report.timers_fired,
        outcome.report.final_time
    );
}
