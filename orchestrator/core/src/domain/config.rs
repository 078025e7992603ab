// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Scheduler Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) covering:
// - Priority order and per-kind ceilings, deadlines and preconditions
// - Per-class retry caps, backoff and exhaustion actions
// - Schema-defining resources and Ship verification extensions
// - Executor, workspace and deployment commands
// - Network and observability settings

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::job::JobKind;
use crate::domain::precondition::Precondition;
use crate::domain::queue::PriorityOrder;
use crate::domain::retry::RetryConfig;
use crate::domain::schema::SchemaMatcher;
use crate::domain::timeout::{TimeoutPolicy, VerificationPolicy};

pub const API_VERSION: &str = "baton.dev/v1";
pub const MANIFEST_KIND: &str = "SchedulerConfig";

/// Top-level scheduler configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfigManifest {
    /// API version (must be "baton.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "SchedulerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: SchedulerConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfigSpec {
    /// Job kinds, highest priority first. Must list every kind exactly once.
    #[serde(default = "default_priority_order")]
    pub priority_order: Vec<JobKind>,

    /// Per-kind overrides; anything left out keeps the built-in default for that kind.
    #[serde(default)]
    pub jobs: BTreeMap<JobKind, KindSettings>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Glob patterns (`*` wildcard) naming schema-defining resources.
    #[serde(default = "default_schema_resources")]
    pub schema_resources: Vec<String>,

    #[serde(default)]
    pub verification: VerificationPolicy,

    /// Admit a corrective Fix job after a rollback.
    #[serde(default = "default_true")]
    pub rollback_corrective_job: bool,

    /// Finished jobs kept in memory for status queries; older ones are only
    /// reachable through their persisted handoff.
    #[serde(default = "default_finished_job_retention")]
    pub finished_job_retention: usize,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub executors: ExecutorsConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentConfig>,

    /// Directory for finalized handoff documents; in-memory only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_dir: Option<PathBuf>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Concurrency ceiling: a positive number or `unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ceiling {
    Limit(u32),
    Keyword(CeilingKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeilingKeyword {
    Unlimited,
}

impl Ceiling {
    pub const UNLIMITED: Ceiling = Ceiling::Keyword(CeilingKeyword::Unlimited);

    pub fn limit(&self) -> Option<u32> {
        match self {
            Ceiling::Limit(n) => Some(*n),
            Ceiling::Keyword(CeilingKeyword::Unlimited) => None,
        }
    }

    fn parse(value: &str) -> Option<Ceiling> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("unlimited") {
            return Some(Ceiling::UNLIMITED);
        }
        value.parse().ok().map(Ceiling::Limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<Ceiling>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub soft_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub hard_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Vec<Precondition>>,
}

/// Fully resolved policy for one job kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindPolicy {
    /// `None` means unlimited.
    pub max_concurrent: Option<u32>,
    pub timeout: TimeoutPolicy,
    pub preconditions: Vec<Precondition>,
}

impl KindPolicy {
    pub fn default_for(kind: JobKind) -> Self {
        let max_concurrent = match kind {
            JobKind::Ship => Some(1),
            JobKind::Vibe => Some(2),
            JobKind::Fix | JobKind::Style => None,
        };
        Self {
            max_concurrent,
            timeout: TimeoutPolicy::default_for(kind),
            preconditions: Precondition::defaults_for(kind),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Working tree the jobs operate on. Preconditions are skipped when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Command whose failure means the build is broken (e.g. "cargo check").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    /// Check `git status` for uncommitted changes.
    #[serde(default = "default_true")]
    pub git: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            build_command: None,
            git: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    /// Shell used to run executor commands (`<shell> -c <command>`).
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Command per job kind.
    #[serde(default)]
    pub commands: BTreeMap<JobKind, String>,

    /// Extra environment for every executor process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            commands: BTreeMap::new(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Exit 0 = healthy, 75 = in progress, anything else = failed.
    pub status_command: String,
    pub rollback_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_finished_job_retention() -> usize {
    1000
}

fn default_priority_order() -> Vec<JobKind> {
    JobKind::ALL.to_vec()
}

fn default_schema_resources() -> Vec<String> {
    vec![
        "schema.def".to_string(),
        "*.schema".to_string(),
        "migrations/*".to_string(),
    ]
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for SchedulerConfigSpec {
    fn default() -> Self {
        Self {
            priority_order: default_priority_order(),
            jobs: BTreeMap::new(),
            retry: RetryConfig::default(),
            schema_resources: default_schema_resources(),
            verification: VerificationPolicy::default(),
            rollback_corrective_job: true,
            finished_job_retention: default_finished_job_retention(),
            workspace: WorkspaceConfig::default(),
            executors: ExecutorsConfig::default(),
            deployment: None,
            handoff_dir: None,
            network: NetworkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl SchedulerConfigSpec {
    /// Built-in defaults for `kind` with any configured overrides applied.
    pub fn kind_policy(&self, kind: JobKind) -> KindPolicy {
        let mut policy = KindPolicy::default_for(kind);
        if let Some(settings) = self.jobs.get(&kind) {
            if let Some(ceiling) = settings.max_concurrent {
                policy.max_concurrent = ceiling.limit();
            }
            if let Some(soft) = settings.soft_timeout {
                policy.timeout.soft = soft;
            }
            if let Some(hard) = settings.hard_timeout {
                policy.timeout.hard = hard;
            }
            if let Some(preconditions) = &settings.preconditions {
                policy.preconditions = preconditions.clone();
            }
        }
        policy
    }

    pub fn scheduler_settings(&self) -> anyhow::Result<SchedulerSettings> {
        let schema = SchemaMatcher::new(self.schema_resources.iter().cloned())
            .map_err(|e| anyhow::anyhow!("Invalid schema_resources pattern: {}", e))?;
        Ok(SchedulerSettings {
            priority: PriorityOrder::new(self.priority_order.clone()),
            policies: JobKind::ALL.iter().map(|k| (*k, self.kind_policy(*k))).collect(),
            retry: self.retry.clone(),
            schema,
            verification: self.verification,
            rollback_corrective_job: self.rollback_corrective_job,
            finished_job_retention: self.finished_job_retention,
        })
    }
}

/// Resolved, validated scheduling policy handed to the coordinator.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub priority: PriorityOrder,
    pub policies: HashMap<JobKind, KindPolicy>,
    pub retry: RetryConfig,
    pub schema: SchemaMatcher,
    pub verification: VerificationPolicy,
    pub rollback_corrective_job: bool,
    pub finished_job_retention: usize,
}

impl SchedulerSettings {
    pub fn policy(&self, kind: JobKind) -> KindPolicy {
        self.policies
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| KindPolicy::default_for(kind))
    }

    pub fn policy_mut(&mut self, kind: JobKind) -> &mut KindPolicy {
        self.policies
            .entry(kind)
            .or_insert_with(|| KindPolicy::default_for(kind))
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            priority: PriorityOrder::default(),
            policies: JobKind::ALL.iter().map(|k| (*k, KindPolicy::default_for(*k))).collect(),
            retry: RetryConfig::default(),
            schema: SchemaMatcher::new(default_schema_resources()).unwrap_or_else(|_| SchemaMatcher::empty()),
            verification: VerificationPolicy::default(),
            rollback_corrective_job: true,
            finished_job_retention: default_finished_job_retention(),
        }
    }
}

impl Default for SchedulerConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: MANIFEST_KIND.to_string(),
            metadata: ManifestMetadata {
                name: "baton".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: SchedulerConfigSpec::default(),
        }
    }
}

impl SchedulerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. BATON_CONFIG_PATH environment variable
    /// 2. ./baton-config.yaml (working directory)
    /// 3. ~/.baton/config.yaml (user home)
    /// 4. /etc/baton/config.yaml (system, Unix) or C:\ProgramData\Baton\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BATON_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./baton-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".baton").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/baton/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Baton\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (var, kind) in [
            ("BATON_MAX_CONCURRENT_SHIP", JobKind::Ship),
            ("BATON_MAX_CONCURRENT_VIBE", JobKind::Vibe),
        ] {
            let Some(val) = lookup(var) else { continue };
            match Ceiling::parse(&val) {
                Some(ceiling) => {
                    tracing::info!("Environment override: {}={}", var, val);
                    self.spec.jobs.entry(kind).or_default().max_concurrent = Some(ceiling);
                }
                None => {
                    tracing::warn!(
                        "Invalid value for {}: '{}'. Expected a number or 'unlimited'. Ignoring.",
                        var,
                        val
                    );
                }
            }
        }

        if let Some(dir) = lookup("BATON_HANDOFF_DIR") {
            tracing::info!("Environment override: BATON_HANDOFF_DIR={}", dir);
            self.spec.handoff_dir = Some(PathBuf::from(dir));
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != MANIFEST_KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, MANIFEST_KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let order = &self.spec.priority_order;
        let missing: Vec<&str> = JobKind::ALL
            .iter()
            .filter(|k| !order.contains(k))
            .map(|k| k.as_str())
            .collect();
        if !missing.is_empty() || order.len() != JobKind::ALL.len() {
            anyhow::bail!(
                "spec.priority_order must list every job kind exactly once (missing: [{}])",
                missing.join(", ")
            );
        }

        for kind in JobKind::ALL {
            let policy = self.spec.kind_policy(kind);
            if policy.max_concurrent == Some(0) {
                anyhow::bail!("spec.jobs.{}.max_concurrent must be at least 1", kind);
            }
            policy
                .timeout
                .validate()
                .map_err(|e| anyhow::anyhow!("spec.jobs.{}: {}", kind, e))?;
        }

        if self.spec.finished_job_retention == 0 {
            anyhow::bail!("spec.finished_job_retention must be at least 1");
        }

        if self.spec.verification.max_extensions > 0 && self.spec.verification.extension.is_zero() {
            anyhow::bail!("spec.verification.extension must be greater than zero");
        }

        for (kind, command) in &self.spec.executors.commands {
            if command.trim().is_empty() {
                anyhow::bail!("spec.executors.commands.{} cannot be empty", kind);
            }
        }

        self.spec.scheduler_settings()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = SchedulerConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, MANIFEST_KIND);
        assert!(manifest.validate().is_ok());

        let settings = manifest.spec.scheduler_settings().unwrap();
        assert_eq!(settings.policy(JobKind::Ship).max_concurrent, Some(1));
        assert_eq!(settings.policy(JobKind::Vibe).max_concurrent, Some(2));
        assert_eq!(settings.policy(JobKind::Fix).max_concurrent, None);
        assert!(settings.schema.is_schema("schema.def"));
    }

    #[test]
    fn test_partial_kind_override_keeps_other_defaults() {
        let yaml = r#"
apiVersion: baton.dev/v1
kind: SchedulerConfig
metadata:
  name: test
spec:
  jobs:
    vibe:
      max_concurrent: 3
      soft_timeout: 5m
    style:
      max_concurrent: unlimited
"#;
        let manifest = SchedulerConfigManifest::from_yaml_str(yaml).unwrap();
        assert!(manifest.validate().is_ok());

        let vibe = manifest.spec.kind_policy(JobKind::Vibe);
        assert_eq!(vibe.max_concurrent, Some(3));
        assert_eq!(vibe.timeout.soft, Duration::from_secs(300));
        assert_eq!(vibe.timeout.hard, Duration::from_secs(20 * 60));
        assert_eq!(manifest.spec.kind_policy(JobKind::Style).max_concurrent, None);
    }

    #[test]
    fn test_validation() {
        let mut manifest = SchedulerConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.spec.priority_order = vec![JobKind::Fix, JobKind::Fix, JobKind::Vibe, JobKind::Style];
        assert!(manifest.validate().is_err());
        manifest.spec.priority_order = default_priority_order();

        manifest.spec.jobs.insert(
            JobKind::Fix,
            KindSettings {
                soft_timeout: Some(Duration::from_secs(600)),
                hard_timeout: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        assert!(manifest.validate().is_err());
        manifest.spec.jobs.clear();

        manifest.spec.jobs.insert(
            JobKind::Ship,
            KindSettings {
                max_concurrent: Some(Ceiling::Limit(0)),
                ..Default::default()
            },
        );
        assert!(manifest.validate().is_err());
        manifest.spec.jobs.clear();

        manifest.spec.finished_job_retention = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.finished_job_retention = 1;

        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = SchedulerConfigManifest::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("BATON_MAX_CONCURRENT_SHIP", "unlimited"),
            ("BATON_MAX_CONCURRENT_VIBE", "4"),
            ("BATON_HANDOFF_DIR", "/tmp/handoffs"),
        ]);
        manifest.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(manifest.spec.kind_policy(JobKind::Ship).max_concurrent, None);
        assert_eq!(manifest.spec.kind_policy(JobKind::Vibe).max_concurrent, Some(4));
        assert_eq!(manifest.spec.handoff_dir, Some(PathBuf::from("/tmp/handoffs")));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut manifest = SchedulerConfigManifest::default();
        manifest.spec.executors.commands.insert(JobKind::Fix, "./agents/fix.sh".to_string());
        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let parsed = SchedulerConfigManifest::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.spec.executors.commands.get(&JobKind::Fix).unwrap(), "./agents/fix.sh");
        assert_eq!(parsed.spec.retry, manifest.spec.retry);
    }
}
