//! Controller Configuration
//!
//! Loaded from a mounted YAML file. Every section has defaults so a partial
//! file (or no file at all) yields a usable configuration.

use serde::{Deserialize, Serialize};

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Namespace where workloads are created
    pub namespace: String,

    /// Labelling rules for created resources
    pub labels: LabelConfig,

    /// Shared framework settings
    pub frameworks: FrameworkConfig,

    /// Custom resource allow-list
    pub custom_resources: CustomResourceConfig,

    /// Image build (Kaniko) settings
    pub build: BuildConfig,

    /// Polling monitor settings
    pub monitor: MonitorConfig,

    /// Watch stream settings
    pub watcher: WatcherConfig,

    /// Runnable store settings
    pub store: StoreConfig,

    /// Event bus settings
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelConfig {
    /// Prefix for engine-owned label keys (e.g. `runs.5dlabs.ai/run`)
    pub prefix: String,

    /// Value of `app.kubernetes.io/managed-by`
    pub managed_by: String,
}

/// What to keep in `runnable.results`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectResults {
    /// Record results, clear them on delete
    #[default]
    Default,
    /// Record results and keep them after delete
    Keep,
    /// Never record results
    Disable,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameworkConfig {
    pub collect_logs: bool,
    pub collect_metrics: bool,
    pub collect_results: CollectResults,
    pub image_pull_policy: String,
    /// Image of the init container that prepares source contexts
    pub init_image: String,
    /// Pull secret attached to every pod
    pub registry_secret: Option<String>,
    /// Force non-root execution
    pub disable_root: bool,
    /// Extended resource name used for GPU requests
    pub gpu_resource_key: String,
    /// Lines tailed per container when collecting logs
    pub log_tail_lines: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomResourceConfig {
    /// Allowed `group/version` values for submitted custom resources
    pub api_groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    /// Kaniko executor image
    pub image: String,
    pub init_image: String,
    pub image_prefix: String,
    pub image_registry: String,
    /// Docker config secret mounted at `/kaniko/.docker`
    pub credentials_secret: String,
    /// Extra executor arguments
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub backoff_initial_millis: u64,
    pub backoff_max_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// redb database file
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsConfig {
    /// Concurrent handlers per bus
    pub workers: usize,
    /// Queue depth before publishers wait
    pub capacity: usize,
}

impl ControllerConfig {
    /// Validate that configuration is usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("namespace must not be empty"));
        }
        if self.labels.prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("labels.prefix must not be empty"));
        }
        if self.monitor.interval_seconds == 0 {
            return Err(anyhow::anyhow!("monitor.intervalSeconds must be positive"));
        }
        if self.events.workers == 0 || self.events.capacity == 0 {
            return Err(anyhow::anyhow!(
                "events.workers and events.capacity must be positive"
            ));
        }
        if self.build.image.trim().is_empty() {
            return Err(anyhow::anyhow!("build.image must not be empty"));
        }
        if let Some(bad) = self
            .custom_resources
            .api_groups
            .iter()
            .find(|g| !is_group_version(g))
        {
            return Err(anyhow::anyhow!(
                "customResources.apiGroups entry '{bad}' must be group/version"
            ));
        }
        Ok(())
    }

    /// Load configuration from mounted config file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }
}

fn is_group_version(value: &str) -> bool {
    matches!(value.split_once('/'), Some((group, version)) if !group.is_empty() && !version.is_empty() && !version.contains('/'))
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "runs".to_string(),
            labels: LabelConfig::default(),
            frameworks: FrameworkConfig::default(),
            custom_resources: CustomResourceConfig::default(),
            build: BuildConfig::default(),
            monitor: MonitorConfig::default(),
            watcher: WatcherConfig::default(),
            store: StoreConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            prefix: "runs.5dlabs.ai".to_string(),
            managed_by: "run-controller".to_string(),
        }
    }
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            collect_logs: true,
            collect_metrics: true,
            collect_results: CollectResults::Default,
            image_pull_policy: "IfNotPresent".to_string(),
            init_image: "ghcr.io/5dlabs/run-init:latest".to_string(),
            registry_secret: None,
            disable_root: false,
            gpu_resource_key: "nvidia.com/gpu".to_string(),
            log_tail_lines: 200,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            image: "gcr.io/kaniko-project/executor:latest".to_string(),
            init_image: "ghcr.io/5dlabs/run-init:latest".to_string(),
            image_prefix: "runs".to_string(),
            image_registry: "registry.local".to_string(),
            credentials_secret: "registry-credentials".to_string(),
            args: Vec::new(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff_initial_millis: 500,
            backoff_max_seconds: 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "/data/runnables.redb".to_string(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            capacity: 1024,
        }
    }
}
