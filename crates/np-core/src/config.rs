use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// How the chain reconciler converges a chain whose rules differ from the
/// desired list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// Append the desired rules after whatever is already there.
    #[default]
    Append,
    /// Flush the chain, then append the desired rules.
    Replace,
}

impl FromStr for ReconcileMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            other => Err(Error::InvalidReconcileMode(other.to_string())),
        }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileMode::Append => f.write_str("append"),
            ReconcileMode::Replace => f.write_str("replace"),
        }
    }
}

/// Agent configuration, resolved before any filter state is touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Only pods scheduled on this node populate the local-pods set.
    pub node_name: Option<String>,
    /// Watch extensions/v1beta1 network policies and skip the egress pipeline.
    pub legacy: bool,
    pub allow_multicast: bool,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    /// `size` of list:set ipsets.
    pub max_list_size: u32,
    pub reconcile_mode: ReconcileMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: None,
            legacy: false,
            allow_multicast: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 6781)),
            log_level: "info".to_string(),
            max_list_size: 1024,
            reconcile_mode: ReconcileMode::Append,
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fall back to `hostname` (normally `$HOSTNAME`, which Kubernetes sets
    /// for host-network pods) when no node name was configured.
    pub fn with_hostname_fallback(mut self, hostname: Option<String>) -> Self {
        if self.node_name.as_deref().is_none_or(str::is_empty) {
            self.node_name = hostname.filter(|h| !h.is_empty());
        }
        self
    }

    /// Checks what must hold before any filter state is touched.
    pub fn validate(&self) -> Result<()> {
        self.node_name().map(|_| ())
    }

    pub fn node_name(&self) -> Result<&str> {
        self.node_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(Error::MissingNodeName)
    }
}
