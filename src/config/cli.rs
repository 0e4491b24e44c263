use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the platelet-worker binary.
#[derive(Debug, Parser)]
#[command(
    name = "platelet-worker",
    version,
    about = "Background render worker for platelet templates"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PLATELET_WORKER_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve render requests as JSON lines on stdin, answering on stdout.
    Serve(ServeArgs),
    /// Render a single template directory and print the result.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub capability: CapabilityOverrides,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the number of requests that may wait in the worker queue.
    #[arg(long = "queue-capacity", value_name = "COUNT")]
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub capability: CapabilityOverrides,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Directory holding the template files.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub templates: PathBuf,

    /// Entry template, relative to the templates directory.
    #[arg(long, value_name = "PATH")]
    pub root: String,

    /// Context passed to the renderer as inline JSON.
    #[arg(long, value_name = "JSON", conflicts_with = "context_file")]
    pub context: Option<String>,

    /// Read the renderer context from a JSON file.
    #[arg(long = "context-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub context_file: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CapabilityOverrides {
    /// Override the renderer executable.
    #[arg(long = "capability-program", value_name = "PATH")]
    pub program: Option<PathBuf>,

    /// Extra argument passed to the renderer before the template path (repeatable).
    #[arg(long = "capability-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Override the directory where request files are staged.
    #[arg(long = "staging-dir", value_name = "PATH")]
    pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}
