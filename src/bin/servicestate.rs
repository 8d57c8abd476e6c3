use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use servicestate::{QuorumCheck, QuorumPolicy, Scenario, ScenarioReport, Transition};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "servicestate")]
#[command(about = "Evaluate entity health rollups")]
struct Cli {
    /// Log evaluator decisions (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a JSON scenario and print entity health after every step
    Run {
        scenario: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate a quorum policy, e.g. `quorum atLeast(2) 1 3`
    Quorum {
        policy: String,
        satisfied: usize,
        total: usize,
    },
    /// Decode a transition string such as "running @ 1700000000000"
    ParseTransition { text: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run { scenario, json } => run_scenario(&scenario, json).await,
        Command::Quorum {
            policy,
            satisfied,
            total,
        } => quorum(&policy, satisfied, total),
        Command::ParseTransition { text } => parse_transition(&text),
    }
}

/// Warnings go to stderr by default so they never mix with `--json` output.
/// The fmt subscriber also installs the `log` bridge for the entity layer.
fn init_tracing(verbose: bool) {
    let default = if verbose { "servicestate=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_scenario(path: &Path, json: bool) -> Result<()> {
    let scenario = Scenario::from_path(path)
        .with_context(|| format!("Failed to load scenario '{}'", path.display()))?;
    let report = scenario
        .run()
        .await
        .with_context(|| format!("Scenario '{}' failed", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ScenarioReport) {
    if let Some(name) = &report.name {
        println!("Scenario: {}", name);
    }
    println!("[0] initial");
    for snapshot in &report.initial {
        println!("    {}", snapshot);
    }
    for step in &report.steps {
        println!("[{}] {}", step.step, step.description);
        for snapshot in &step.entities {
            println!("    {}", snapshot);
        }
    }
}

fn quorum(policy: &str, satisfied: usize, total: usize) -> Result<()> {
    if satisfied > total {
        return Err(anyhow!(
            "satisfied ({}) cannot exceed total ({})",
            satisfied,
            total
        ));
    }
    let policy: QuorumPolicy = policy.parse()?;
    let verdict = if policy.is_quorate(satisfied, total) {
        "quorate"
    } else {
        "not quorate"
    };
    println!("{}: {} of {} -> {}", policy, satisfied, total, verdict);
    Ok(())
}

fn parse_transition(text: &str) -> Result<()> {
    let transition: Transition = text.parse()?;
    println!("state:     {}", transition.state());
    println!("timestamp: {}", transition.timestamp_utc());
    if let Some(at) = transition.timestamp() {
        println!("utc:       {}", at.to_rfc3339());
    }
    println!("canonical: {}", transition);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_is_global() {
        let cli = Cli::try_parse_from(["servicestate", "quorum", "all", "1", "1", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Quorum { .. }));

        let cli = Cli::try_parse_from(["servicestate", "run", "scenario.json", "--json"]).unwrap();
        assert!(!cli.verbose);
    }
}
