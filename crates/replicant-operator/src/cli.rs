//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use replicant_common::retry::RetryConfig;
use replicant_controller::ControllerConfig;

/// Attempts made to install the CRD before giving up
pub const CRD_INSTALL_ATTEMPTS: u32 = 10;

/// Replicant - keeps the pod count of each ReplicaGroup at its desired replicas
#[derive(Parser, Debug)]
#[command(name = "replicant", version, about, long_about = None)]
pub struct Cli {
    /// Print the ReplicaGroup CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Path to a kubeconfig file (in-cluster config when unset)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "REPLICANT_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Deadline for each API call made during a reconcile
    #[arg(long, default_value_t = 10)]
    pub call_timeout_secs: u64,

    /// Re-run every reconcile after this many seconds even without changes
    #[arg(long)]
    pub resync_secs: Option<u64>,

    /// Maximum reconciles running at once (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    pub concurrency: u16,

    /// First requeue delay after a failed reconcile
    #[arg(long, default_value_t = 500)]
    pub retry_initial_ms: u64,

    /// Longest requeue delay after repeated failures
    #[arg(long, default_value_t = 300)]
    pub retry_max_secs: u64,

    /// Assume the CRD is already installed
    #[arg(long)]
    pub skip_crd_install: bool,

    /// Emit JSON log lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Backoff for failed reconciles
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_secs(self.retry_max_secs),
            ..Default::default()
        }
    }

    /// Backoff for CRD installation at startup
    pub fn crd_install_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: CRD_INSTALL_ATTEMPTS,
            ..self.retry_config()
        }
    }

    /// Controller tunables derived from the flags
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            resync_interval: self.resync_secs.map(Duration::from_secs),
            retry: self.retry_config(),
        }
    }
}
