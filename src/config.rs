//! Optional TOML file supplying defaults for the command line

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use multilog_logs::{
    AggregatorConfig, DEFAULT_CAPACITY, DEFAULT_CHANNEL_CAPACITY, DEFAULT_TAIL_LINES,
    SearchOptions, SessionMode,
};

use crate::Args;

const DEFAULT_LOG_LEVEL: &str = "warn";

/// Contents of the `--config` file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub kubeconfig: Option<PathBuf>,
    pub contexts: Vec<String>,
    pub namespaces: Vec<String>,
    pub selectors: Vec<String>,
    pub containers: Vec<String>,
    pub tail: Option<i64>,
    pub buffer_size: Option<usize>,
    pub discovery_interval_secs: Option<u64>,
    pub retry_backoff_secs: Option<u64>,
    pub channel_capacity: Option<usize>,
    pub log_level: Option<String>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("invalid config file '{}'", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tail.is_some_and(|tail| tail < 0) {
            bail!("tail must not be negative");
        }
        if self.buffer_size == Some(0) {
            bail!("buffer_size must be at least 1");
        }
        if self.channel_capacity == Some(0) {
            bail!("channel_capacity must be at least 1");
        }
        if self.discovery_interval_secs == Some(0) || self.retry_backoff_secs == Some(0) {
            bail!("intervals must be at least one second");
        }
        Ok(())
    }
}

/// Effective settings after layering flags over the config file
#[derive(Debug, Clone)]
pub struct Settings {
    pub kubeconfig: Option<PathBuf>,
    /// Contexts to follow; empty means the kubeconfig's current context
    pub contexts: Vec<String>,
    pub aggregator: AggregatorConfig,
    pub buffer_size: usize,
    pub search: Option<String>,
    pub search_options: SearchOptions,
    pub log_level: String,
    pub list: bool,
}

impl Settings {
    /// Flags win over the file; lists given on the command line replace the
    /// file's lists entirely.
    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self> {
        let tail = args.tail.or(file.tail).unwrap_or(DEFAULT_TAIL_LINES);
        if tail < 0 {
            bail!("--tail must not be negative");
        }

        let buffer_size = args.buffer_size.or(file.buffer_size).unwrap_or(DEFAULT_CAPACITY);
        if buffer_size == 0 {
            bail!("--buffer-size must be at least 1");
        }

        let mode = if args.live {
            SessionMode::LiveTail
        } else {
            SessionMode::Tail(tail)
        };

        let defaults = AggregatorConfig::default();
        let aggregator = AggregatorConfig {
            namespaces: prefer(&args.namespace, file.namespaces),
            selectors: prefer(&args.selector, file.selectors),
            containers: prefer(&args.container, file.containers),
            mode,
            previous: args.previous,
            discovery_interval: file
                .discovery_interval_secs
                .map_or(defaults.discovery_interval, Duration::from_secs),
            retry_backoff: file
                .retry_backoff_secs
                .map_or(defaults.retry_backoff, Duration::from_secs),
            channel_capacity: file.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
        };

        Ok(Self {
            kubeconfig: args.kubeconfig.clone().or(file.kubeconfig),
            contexts: prefer(&args.context, file.contexts),
            aggregator,
            buffer_size,
            search: args.search.clone().filter(|term| !term.is_empty()),
            search_options: SearchOptions {
                case_sensitive: args.case_sensitive,
                whole_word: args.whole_word,
                regex_enabled: args.regex,
            },
            log_level: args
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            list: args.list,
        })
    }
}

fn prefer(flags: &[String], file: Vec<String>) -> Vec<String> {
    if flags.is_empty() {
        file
    } else {
        flags.to_vec()
    }
}
