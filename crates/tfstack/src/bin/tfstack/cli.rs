//! tfstack cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; tfstack ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    /// Configuration file (default: tfstack.yaml if present)
    #[clap(long = "config", global(true))]
    pub config: Option<PathBuf>,

    /// Bound on nested dependencies, overrides the configuration file
    #[clap(long = "max-depth", global(true))]
    pub max_depth: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the execution order
    Graph(GraphCommand),

    /// Print the generated variables of every unit
    ///
    /// Dependency outputs are looked up, the provisioner command itself does not run.
    Inputs(InputsCommand),

    /// Run a provisioner command (init, plan, apply, destroy, ...) for every unit
    ///
    /// Usage: tfstack <command> [paths...] [-- provisioner args...]
    #[command(external_subcommand)]
    Provision(Vec<String>),
}

#[derive(Parser, Debug)]
pub struct GraphCommand {
    #[clap(flatten)]
    pub output: OutputArgs,

    /// Descriptor files, directories or globs (default: work directory)
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct InputsCommand {
    #[clap(flatten)]
    pub output: OutputArgs,

    /// Descriptor files, directories or globs (default: work directory)
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => f.write_str("text"),
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}

/// Arguments of a provisioner command
#[derive(Debug, PartialEq)]
pub struct ProvisionArgs {
    pub command: String,
    pub paths: Vec<PathBuf>,
    pub args: Vec<String>,
}

impl ProvisionArgs {
    /// Split `<command> [paths...] [-- args...]`
    ///
    /// Flags before `--` are passed to the provisioner as well.
    pub fn parse(raw: Vec<String>) -> anyhow::Result<Self> {
        let mut raw = raw.into_iter();
        let command = raw
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing provisioner command"))?;

        let mut paths = vec![];
        let mut args = vec![];
        let mut passthrough = false;
        for arg in raw {
            if passthrough || (arg.starts_with('-') && arg != "--") {
                args.push(arg);
            } else if arg == "--" {
                passthrough = true;
            } else {
                paths.push(PathBuf::from(arg));
            }
        }

        Ok(Self {
            command,
            paths,
            args,
        })
    }
}
