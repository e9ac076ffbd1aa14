//! Syncer configuration file
//!
//! YAML, camelCase keys. Every field has a default so an empty file (or no
//! file at all) yields a runnable configuration with no tenants.
//!
//! ```yaml
//! patrolPeriodSecs: 60
//! concurrency: 4
//! retryDelaySecs: 5
//! resources: [service, serviceaccount]
//! superKubeconfig: /etc/syncer/super.kubeconfig
//! tenants:
//!   - name: test
//!     namespace: tenant-1
//!     uid: 7374a172-c35d-45b1-9c8e-bf5c5b614937
//!     kubeconfig: /etc/syncer/tenants/test.kubeconfig
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use syncer_common::conversion::{is_dns1123_label, TenantRef};
use syncer_patrol::patroller::{DEFAULT_LIST_TIMEOUT, DEFAULT_PATROL_PERIOD, DEFAULT_SYNC_TIMEOUT};
use syncer_patrol::PatrolOptions;
use syncer_resources::controller::{
    DEFAULT_CONCURRENCY, DEFAULT_CONFLICT_RETRY_DELAY, DEFAULT_RETRY_DELAY,
};
use syncer_resources::{ControllerOptions, ResourceKind};

/// Errors loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The file is not valid YAML for [`SyncerConfig`]
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A field holds an unusable value
    #[error("invalid config field {field}: {message}")]
    Invalid {
        /// Field path (e.g. "tenants[0].uid")
        field: String,
        /// What is wrong with it
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// One tenant control plane to sync from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    /// Name of the tenant object
    pub name: String,
    /// Namespace of the tenant object on the super cluster
    pub namespace: String,
    /// UID of the tenant object
    pub uid: String,
    /// Kubeconfig of the tenant API server
    pub kubeconfig: PathBuf,
}

impl TenantConfig {
    /// Identity used to derive the cluster key
    pub fn tenant_ref(&self) -> TenantRef {
        TenantRef::new(&self.name, &self.namespace, &self.uid)
    }

    /// Cluster key of this tenant
    pub fn cluster_key(&self) -> String {
        self.tenant_ref().cluster_key()
    }
}

/// Top-level syncer configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncerConfig {
    /// Seconds between patrol passes
    pub patrol_period_secs: u64,
    /// Seconds allowed for listing one tenant cluster during a patrol
    pub list_timeout_secs: u64,
    /// Seconds to wait for the super-side cache before a patroller gives up
    pub cache_sync_timeout_secs: u64,
    /// Concurrent reconciles per tenant controller
    pub concurrency: u16,
    /// Seconds before a transiently failed reconcile is retried
    pub retry_delay_secs: u64,
    /// Seconds before a reconcile blocked by an ownership conflict is retried
    pub conflict_retry_delay_secs: u64,
    /// Resource kinds to sync
    pub resources: Vec<ResourceKind>,
    /// Kubeconfig of the super control plane; inferred when unset
    pub super_kubeconfig: Option<PathBuf>,
    /// Tenant control planes
    pub tenants: Vec<TenantConfig>,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            patrol_period_secs: DEFAULT_PATROL_PERIOD.as_secs(),
            list_timeout_secs: DEFAULT_LIST_TIMEOUT.as_secs(),
            cache_sync_timeout_secs: DEFAULT_SYNC_TIMEOUT.as_secs(),
            concurrency: DEFAULT_CONCURRENCY,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            conflict_retry_delay_secs: DEFAULT_CONFLICT_RETRY_DELAY.as_secs(),
            resources: ResourceKind::ALL.to_vec(),
            super_kubeconfig: None,
            tenants: Vec::new(),
        }
    }
}

impl SyncerConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&raw)?;
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field for usable values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.patrol_period_secs == 0 {
            return Err(ConfigError::invalid("patrolPeriodSecs", "must be positive"));
        }
        if self.list_timeout_secs == 0 {
            return Err(ConfigError::invalid("listTimeoutSecs", "must be positive"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be positive"));
        }
        if self.retry_delay_secs == 0 {
            return Err(ConfigError::invalid("retryDelaySecs", "must be positive"));
        }
        if self.conflict_retry_delay_secs < self.retry_delay_secs {
            return Err(ConfigError::invalid(
                "conflictRetryDelaySecs",
                "must not be shorter than retryDelaySecs",
            ));
        }
        if self.resources.is_empty() {
            return Err(ConfigError::invalid("resources", "must name at least one kind"));
        }
        let unique: BTreeSet<_> = self.resources.iter().collect();
        if unique.len() != self.resources.len() {
            return Err(ConfigError::invalid("resources", "must not repeat a kind"));
        }

        let mut keys = BTreeSet::new();
        for (i, tenant) in self.tenants.iter().enumerate() {
            if tenant.uid.is_empty() {
                return Err(ConfigError::invalid(
                    format!("tenants[{i}].uid"),
                    "must not be empty",
                ));
            }
            // Both end up in super-side namespace names
            for (field, value) in [("name", &tenant.name), ("namespace", &tenant.namespace)] {
                if !is_dns1123_label(value) {
                    return Err(ConfigError::invalid(
                        format!("tenants[{i}].{field}"),
                        format!("{value:?} is not a DNS-1123 label"),
                    ));
                }
            }
            if !keys.insert(tenant.cluster_key()) {
                return Err(ConfigError::invalid(
                    format!("tenants[{i}]"),
                    "duplicates the cluster key of an earlier tenant",
                ));
            }
        }
        Ok(())
    }

    /// Patroller timing derived from this config
    pub fn patrol_options(&self) -> PatrolOptions {
        PatrolOptions {
            period: Duration::from_secs(self.patrol_period_secs),
            sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            ..PatrolOptions::default()
        }
    }

    /// Tenant listing timeout derived from this config
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    /// Tenant controller settings derived from this config
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            concurrency: self.concurrency,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            conflict_retry_delay: Duration::from_secs(self.conflict_retry_delay_secs),
        }
    }
}
