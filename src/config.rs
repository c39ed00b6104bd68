//! Configuration for the control plane

use std::path::PathBuf;

use crate::router::RouterConfig;

/// Configuration for the control plane's storage and dispatch
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Root directory for control-plane state
    pub root: PathBuf,
    /// Audit log file name under `root`
    pub audit_log_name: String,
    /// Router tuning (admission gate size, bounded wait)
    pub router: RouterConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("fleettower-data"),
            audit_log_name: "audit.log.jsonl".into(),
            router: RouterConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Full path of the audit log file
    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(&self.audit_log_name)
    }
}
