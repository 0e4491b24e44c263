//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{CapabilityOverrides, CliArgs, Command, LoggingOverrides, RenderArgs, ServeArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "platelet-worker";
const ENV_PREFIX: &str = "PLATELET_WORKER";
const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub(crate) const DEFAULT_CAPABILITY_PROGRAM: &str = "platelet";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub capability: CapabilitySettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Where the rendering capability comes from and how it is invoked.
#[derive(Debug, Clone)]
pub struct CapabilitySettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `None` stages request files in a private temporary directory.
    pub staging_dir: Option<PathBuf>,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_CAPABILITY_PROGRAM),
            args: Vec::new(),
            staging_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue_capacity: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(" ")
            .with_list_parse_key("capability.args"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(args),
        Some(Command::Render(args)) => raw.apply_render_overrides(args),
        None => raw.apply_serve_overrides(&ServeArgs::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    capability: RawCapabilitySettings,
    worker: RawWorkerSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, args: &ServeArgs) {
        self.apply_capability_overrides(&args.capability);
        self.apply_logging_overrides(&args.logging);
        if let Some(capacity) = args.queue_capacity {
            self.worker.queue_capacity = Some(capacity);
        }
    }

    fn apply_render_overrides(&mut self, args: &RenderArgs) {
        self.apply_capability_overrides(&args.capability);
        self.apply_logging_overrides(&args.logging);
    }

    fn apply_capability_overrides(&mut self, overrides: &CapabilityOverrides) {
        if let Some(program) = overrides.program.as_ref() {
            self.capability.program = Some(program.clone());
        }
        if !overrides.args.is_empty() {
            self.capability.args = Some(overrides.args.clone());
        }
        if let Some(dir) = overrides.staging_dir.as_ref() {
            self.capability.staging_dir = Some(dir.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            capability,
            worker,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            capability: build_capability_settings(capability)?,
            worker: build_worker_settings(worker)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_capability_settings(
    capability: RawCapabilitySettings,
) -> Result<CapabilitySettings, LoadError> {
    let program = capability
        .program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPABILITY_PROGRAM));
    if program.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "capability.program",
            "path must not be empty",
        ));
    }

    let staging_dir = capability
        .staging_dir
        .filter(|dir| !dir.as_os_str().is_empty());

    Ok(CapabilitySettings {
        program,
        args: capability.args.unwrap_or_default(),
        staging_dir,
    })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let capacity = worker.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
    let queue_capacity = NonZeroUsize::new(capacity)
        .ok_or_else(|| LoadError::invalid("worker.queue_capacity", "must be greater than zero"))?;

    Ok(WorkerSettings { queue_capacity })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCapabilitySettings {
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    staging_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    queue_capacity: Option<usize>,
}
