//! Error taxonomy. Library errors the caller must branch on are
//! `thiserror`-derived enums; everything else propagates as `anyhow::Result`
//! with context, matching the layering `enforcement.rs` uses over
//! `kube::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("transient cluster error: {0}")]
    Transient(String),
    #[error("fatal cluster error: {0}")]
    Fatal(String),
    #[error("cluster call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_) | ClusterError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("policy '{0}' check timed out")]
    Timeout(String),
    #[error("policy '{0}' check panicked or failed: {1}")]
    CheckFailed(String, String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration field '{field}': {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BudgetError {
    #[error("budget denied: hard limit exceeded ({spent:.2}/{limit:.2})")]
    Denied { spent: f64, limit: f64 },
}
