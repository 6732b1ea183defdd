//! Run configuration: the optional `run:` section of a scenario file,
//! overridden by command-line flags and environment variables.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use stampede_core::credentials::Credentials;
use stampede_core::registry::TagFilter;
use stampede_core::transport::parse_host;
use stampede_core::{ScenarioFile, ScenarioRegistry};

use crate::cli::{OutputFormat, RunArgs};

/// The `run:` section of a scenario file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub users: Option<usize>,
    #[serde(default)]
    pub spawn_rate: Option<f64>,
    #[serde(default)]
    pub run_time: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub stop_timeout: Option<String>,
    #[serde(default)]
    pub request_timeout: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub csv: Option<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

/// Pass/fail limits applied after the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub max_error_rate: Option<f64>,
    #[serde(default)]
    pub max_p95_ms: Option<f64>,
    #[serde(default)]
    pub max_p99_ms: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RunFile {
    #[serde(default)]
    run: RunSection,
}

/// A scenario file with its run section.
#[derive(Debug, Clone)]
pub struct LoadedScenario {
    pub file: ScenarioFile,
    pub run: RunSection,
}

impl LoadedScenario {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid scenario file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let file = ScenarioFile::from_yaml(content)?;
        let run: RunFile = serde_yaml::from_str(content)?;
        Ok(Self { file, run: run.run })
    }

    pub fn registry(&self) -> anyhow::Result<ScenarioRegistry> {
        let definitions = self.file.compile()?;
        Ok(ScenarioRegistry::from_definitions(definitions)?)
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub host: Url,
    pub users: usize,
    pub spawn_rate: f64,
    pub run_time: Option<Duration>,
    pub tag_filter: TagFilter,
    pub stop_timeout: Duration,
    pub request_timeout: Duration,
    pub seed: Option<u64>,
    pub csv_prefix: Option<String>,
    pub headless: bool,
    pub reset_stats: bool,
    pub output: OutputFormat,
    pub thresholds: Thresholds,
    pub credentials: Credentials,
    pub metrics_addr: Option<SocketAddr>,
}

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl RunConfig {
    /// Layer flags (and their env fallbacks) over the file's run section.
    pub fn resolve(section: &RunSection, args: &RunArgs) -> anyhow::Result<Self> {
        let host = args
            .host
            .as_deref()
            .or(section.host.as_deref())
            .context("No target host: pass --host, set STAMPEDE_HOST, or add run.host to the scenario file")?;

        let run_time = args
            .run_time
            .as_deref()
            .or(section.run_time.as_deref())
            .map(parse_run_time)
            .transpose()?;
        let stop_timeout = args
            .stop_timeout
            .as_deref()
            .or(section.stop_timeout.as_deref())
            .map(parse_run_time)
            .transpose()?
            .unwrap_or(DEFAULT_STOP_TIMEOUT);
        let request_timeout = args
            .request_timeout
            .as_deref()
            .or(section.request_timeout.as_deref())
            .map(parse_run_time)
            .transpose()?
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let pick_tags = |flag: &[String], file: &[String]| {
            if flag.is_empty() {
                file.to_vec()
            } else {
                flag.to_vec()
            }
        };

        let credentials = Credentials::new(
            args.auth_token.clone(),
            args.agency_id
                .clone()
                .unwrap_or_else(|| Credentials::anonymous().tenant_id),
        )
        .with_tenant_header(args.tenant_header.clone());

        let config = Self {
            host: parse_host(host)?,
            users: args.users.or(section.users).unwrap_or(1),
            spawn_rate: args.spawn_rate.or(section.spawn_rate).unwrap_or(1.0),
            run_time,
            tag_filter: TagFilter::new(
                pick_tags(&args.tags, &section.tags),
                pick_tags(&args.exclude_tags, &section.exclude_tags),
            ),
            stop_timeout,
            request_timeout,
            seed: args.seed.or(section.seed),
            csv_prefix: args.csv.clone().or_else(|| section.csv.clone()),
            headless: args.headless,
            reset_stats: args.reset_stats,
            output: args.output,
            thresholds: Thresholds {
                max_error_rate: args.max_error_rate.or(section.thresholds.max_error_rate),
                max_p95_ms: args.max_p95_ms.or(section.thresholds.max_p95_ms),
                max_p99_ms: args.max_p99_ms.or(section.thresholds.max_p99_ms),
            },
            credentials,
            metrics_addr: args.metrics_addr,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.users == 0 {
            bail!("users must be > 0");
        }
        if !self.spawn_rate.is_finite() || self.spawn_rate <= 0.0 {
            bail!("spawn_rate must be > 0");
        }
        if self.run_time == Some(Duration::ZERO) {
            bail!("run_time must be > 0");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be > 0");
        }
        if let Some(rate) = self.thresholds.max_error_rate {
            if !(0.0..=1.0).contains(&rate) {
                bail!("max_error_rate must be between 0.0 and 1.0");
            }
        }
        for (name, value) in [
            ("max_p95_ms", self.thresholds.max_p95_ms),
            ("max_p99_ms", self.thresholds.max_p99_ms),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    bail!("{} must be > 0", name);
                }
            }
        }
        Ok(())
    }
}

/// Parse a run time such as `90`, `60s`, `5m`, `1h` or `1h30m`. A bare
/// number is seconds.
pub fn parse_run_time(input: &str) -> anyhow::Result<Duration> {
    let text = input.trim();
    if text.is_empty() {
        bail!("empty run time");
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => bail!("invalid run time '{}': unknown unit '{}'", input, c),
        };
        if digits.is_empty() {
            bail!("invalid run time '{}': unit '{}' without a number", input, c);
        }
        let value: u64 = digits
            .parse()
            .with_context(|| format!("invalid run time '{}'", input))?;
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .with_context(|| format!("invalid run time '{}': too large", input))?;
        digits.clear();
    }
    if !digits.is_empty() {
        bail!("invalid run time '{}': trailing number without a unit", input);
    }
    Ok(Duration::from_secs(total))
}
