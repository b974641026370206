mod cli;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tfstack::config::Config;
use tfstack::exec::SystemExecutor;
use tfstack::graph::ExecutionGraph;
use tfstack::run::{Inputs, Outcome, Runner};
use tfstack::source::Getter;

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("TFSTACK_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = runner(&cli).and_then(|runner| match cli.command {
        cli::Command::Graph(graph_cli) => graph(&runner, graph_cli),
        cli::Command::Inputs(inputs_cli) => inputs(&runner, inputs_cli),
        cli::Command::Provision(raw) => provision(&runner, raw),
    });

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

fn runner(cli: &cli::Cli) -> anyhow::Result<Runner> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(max_depth) = cli.max_depth {
        anyhow::ensure!(max_depth > 0, "--max-depth must be at least 1");
        config.max_depth = max_depth;
    }

    let executor = Arc::new(SystemExecutor);
    let getter = Arc::new(Getter::new(executor.clone(), config.fetch_timeout()));
    Ok(Runner::new(config, executor, getter))
}

fn paths_or_workdir(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    if paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        paths
    }
}

#[derive(Serialize)]
struct GraphEntry {
    path: PathBuf,
    name: String,
    wave: usize,
    dependencies: Vec<PathBuf>,
}

pub fn graph(runner: &Runner, cli: cli::GraphCommand) -> anyhow::Result<()> {
    let units = runner.load(&paths_or_workdir(cli.paths))?;
    let graph = ExecutionGraph::build(&units)?;

    let entries: Vec<GraphEntry> = graph
        .waves()
        .iter()
        .enumerate()
        .flat_map(|(wave, ids)| ids.iter().map(move |id| (wave, *id)))
        .map(|(wave, id)| {
            let unit = &units[id];
            GraphEntry {
                path: unit.path.clone(),
                name: unit.name(),
                wave,
                dependencies: unit
                    .dependencies
                    .values()
                    .map(|dependency| units[*dependency].path.clone())
                    .collect(),
            }
        })
        .collect();

    match cli.output.format {
        cli::OutputFormat::Text => {
            for entry in &entries {
                println!("{} {}", entry.wave, entry.path.display());
            }
        }
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), &entries)?,
        cli::OutputFormat::Json => serde_json::to_writer_pretty(std::io::stdout(), &entries)?,
    };

    Ok(())
}

pub fn inputs(runner: &Runner, cli: cli::InputsCommand) -> anyhow::Result<()> {
    let inputs = runner.inputs(&paths_or_workdir(cli.paths))?;

    match cli.output.format {
        cli::OutputFormat::Text => {
            for (path, entry) in &inputs {
                println!("# {}", path.display());
                match entry {
                    Inputs::Resolved { variables } => println!("{variables}"),
                    Inputs::Unresolved { reasons } => {
                        for reason in reasons {
                            println!("# could not resolve {reason}");
                        }
                        println!();
                    }
                }
            }
        }
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), &inputs)?,
        cli::OutputFormat::Json => serde_json::to_writer_pretty(std::io::stdout(), &inputs)?,
    };

    Ok(())
}

pub fn provision(runner: &Runner, raw: Vec<String>) -> anyhow::Result<()> {
    let cli::ProvisionArgs {
        command,
        paths,
        args,
    } = cli::ProvisionArgs::parse(raw)?;

    let report = runner.run(&paths_or_workdir(paths), &command, &args)?;

    for unit in report.skipped() {
        if let Outcome::Skipped { reason } = &unit.outcome {
            eprintln!("skipped {}: {reason}", unit.path.display());
        }
    }
    eprintln!(
        "{command}: {} completed, {} skipped",
        report.units.len() - report.skipped().count(),
        report.skipped().count()
    );

    Ok(())
}
