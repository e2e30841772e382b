//! Edition and health probe.
//!
//! A probe connects with the target's own privilege, reads the server
//! banner and instance metadata, and classifies what it found. Failures
//! are reported inside the [`HealthResult`], never as an `Err`, and results
//! are never cached.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ConnectionConfig;
use crate::driver::{Binds, QueryOutput};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::executor::{ExecuteOptions, QueryExecutor};

pub const BANNER_SQL: &str = "SELECT banner FROM v$version";
pub const INSTANCE_SQL: &str =
    "SELECT instance_name, status, host_name, version FROM v$instance";

static VERSION_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,2})(ai|c|g|i)\b").expect("static regex")
});
static EDITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Enterprise|Standard|Express|Personal|Free)\b").expect("static regex")
});
static RELEASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(?:\.\d+)+").expect("static regex"));

/// Major version → marketing token, highest first.
const VERSION_THRESHOLDS: &[(u32, &str)] = &[
    (23, "23ai"),
    (21, "21c"),
    (19, "19c"),
    (18, "18c"),
    (12, "12c"),
    (11, "11g"),
    (10, "10g"),
    (9, "9i"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Edition {
    Enterprise,
    Standard,
    Express,
    Personal,
    Free,
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the monitoring layer may rely on for this server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    /// AWR/ASH views are licensed and usable.
    Diagnostics,
    Standard,
    Limited,
    Unknown,
}

impl From<Option<Edition>> for CapabilityTier {
    fn from(edition: Option<Edition>) -> Self {
        match edition {
            Some(Edition::Enterprise) => CapabilityTier::Diagnostics,
            Some(Edition::Standard) => CapabilityTier::Standard,
            Some(Edition::Express | Edition::Free | Edition::Personal) => CapabilityTier::Limited,
            None => CapabilityTier::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&DbError> for HealthError {
    fn from(e: &DbError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResult {
    pub is_healthy: bool,
    pub elapsed_ms: u64,
    pub version: Option<String>,
    pub edition: Option<Edition>,
    pub capability: CapabilityTier,
    pub banner: Option<String>,
    pub instance_name: Option<String>,
    pub status: Option<String>,
    pub host_name: Option<String>,
    pub error: Option<HealthError>,
}

impl HealthResult {
    pub fn failed(elapsed: Duration, error: &DbError) -> Self {
        Self {
            is_healthy: false,
            elapsed_ms: elapsed.as_millis() as u64,
            version: None,
            edition: None,
            capability: CapabilityTier::Unknown,
            banner: None,
            instance_name: None,
            status: None,
            host_name: None,
            error: Some(error.into()),
        }
    }
}

/// Version token for a server: banner token first, then the major-version
/// table applied to `numeric` (or the banner's release number), then the raw
/// numeric string.
pub fn detect_version(banner: &str, numeric: Option<&str>) -> Option<String> {
    if let Some(caps) = VERSION_TOKEN.captures(banner) {
        return Some(format!("{}{}", &caps[1], caps[2].to_ascii_lowercase()));
    }

    let raw = numeric
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| RELEASE.find(banner).map(|m| m.as_str().to_string()))?;

    let major = raw
        .split('.')
        .next()
        .and_then(|m| m.trim().parse::<u32>().ok());
    let token = major.and_then(|major| {
        VERSION_THRESHOLDS
            .iter()
            .find(|(threshold, _)| major >= *threshold)
            .map(|(_, token)| token.to_string())
    });
    Some(token.unwrap_or(raw))
}

pub fn detect_edition(banner: &str) -> Option<Edition> {
    let caps = EDITION.captures(banner)?;
    match caps[1].to_ascii_lowercase().as_str() {
        "enterprise" => Some(Edition::Enterprise),
        "standard" => Some(Edition::Standard),
        "express" => Some(Edition::Express),
        "personal" => Some(Edition::Personal),
        "free" => Some(Edition::Free),
        _ => None,
    }
}

pub struct HealthProbe {
    executor: Arc<QueryExecutor>,
    timeout: Option<Duration>,
}

impl HealthProbe {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self {
            executor,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn check(&self, config: &ConnectionConfig) -> HealthResult {
        let started = Instant::now();
        match self.inspect(config).await {
            Ok(mut result) => {
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(
                    host = %config.host,
                    port = config.port,
                    version = result.version.as_deref().unwrap_or("unknown"),
                    elapsed_ms = result.elapsed_ms,
                    "health probe succeeded"
                );
                result
            }
            Err(e) => {
                let result = HealthResult::failed(started.elapsed(), &e);
                tracing::warn!(
                    host = %config.host,
                    port = config.port,
                    error = %e,
                    elapsed_ms = result.elapsed_ms,
                    "health probe failed"
                );
                result
            }
        }
    }

    async fn inspect(&self, config: &ConnectionConfig) -> DbResult<HealthResult> {
        let mut options = ExecuteOptions::default().with_max_rows(16);
        options.timeout = self.timeout;

        let versions = self
            .executor
            .execute(config, BANNER_SQL, &Binds::None, &options)
            .await?;
        let instance = self
            .executor
            .execute(config, INSTANCE_SQL, &Binds::None, &options)
            .await?;

        let banner = pick_banner(&versions);
        let text = |column: &str| instance.cell(0, column).and_then(|v| v.as_text());
        let numeric = text("version");

        let version = banner
            .as_deref()
            .and_then(|b| detect_version(b, numeric.as_deref()))
            .or_else(|| numeric.as_deref().and_then(|n| detect_version("", Some(n))));
        let edition = banner.as_deref().and_then(detect_edition);

        Ok(HealthResult {
            is_healthy: true,
            elapsed_ms: 0,
            version,
            edition,
            capability: CapabilityTier::from(edition),
            instance_name: text("instance_name"),
            status: text("status"),
            host_name: text("host_name"),
            banner,
            error: None,
        })
    }
}

/// The `Oracle ...` line of `v$version`, or its first row.
fn pick_banner(output: &QueryOutput) -> Option<String> {
    let lines: Vec<String> = output
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(|v| v.as_text()))
        .collect();
    lines
        .iter()
        .find(|line| line.starts_with("Oracle"))
        .or_else(|| lines.first())
        .cloned()
}
