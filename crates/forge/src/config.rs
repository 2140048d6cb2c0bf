//! Configuration for a kubeforge run
//!
//! The easiest way to configure an operation is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`] or
//! [`Config::from_opts`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::ssh::SshSettings;

const DEFAULT_SSH_USER: &str = "kubeforge";
const DEFAULT_TEARDOWN_PAUSE_SECS: u64 = 10;
const DEFAULT_NETWORK_DELETE_ATTEMPTS: u32 = 5;
const DEFAULT_MANAGED_POLL_ATTEMPTS: u32 = 90;
const DEFAULT_MANAGED_POLL_INTERVAL_SECS: u64 = 10;

/// Where state documents are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// JSON files under the data directory
    Local,
    /// In-process only; nothing survives the run
    Memory,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "local" => Ok(StorageKind::Local),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("unknown storage backend {:?}", other)),
        }
    }
}

/// How bootstrap scripts and cloud calls are carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Talk to the cloud backend and open real SSH connections
    Real,
    /// Use in-memory backends and canned script output
    Fake,
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "real" => Ok(ExecutionMode::Real),
            "fake" => Ok(ExecutionMode::Fake),
            other => Err(anyhow::anyhow!("unknown execution mode {:?}", other)),
        }
    }
}

/// Pacing of the teardown sequence.
#[derive(Clone, Debug)]
pub struct TeardownSettings {
    /// Pause between deleting the VMs and deleting their firewalls, giving the
    /// backend time to release attachments
    pub pause_after_vms: Duration,
    pub network_delete_attempts: u32,
    pub network_delete_backoff: Duration,
    pub network_delete_backoff_cap: Duration,
}

impl Default for TeardownSettings {
    fn default() -> Self {
        TeardownSettings {
            pause_after_vms: Duration::from_secs(DEFAULT_TEARDOWN_PAUSE_SECS),
            network_delete_attempts: DEFAULT_NETWORK_DELETE_ATTEMPTS,
            network_delete_backoff: Duration::from_secs(5),
            network_delete_backoff_cap: Duration::from_secs(80),
        }
    }
}

impl TeardownSettings {
    /// No pauses at all. Used with the in-memory backends.
    pub fn immediate() -> Self {
        TeardownSettings {
            pause_after_vms: Duration::ZERO,
            network_delete_attempts: DEFAULT_NETWORK_DELETE_ATTEMPTS,
            network_delete_backoff: Duration::ZERO,
            network_delete_backoff_cap: Duration::ZERO,
        }
    }
}

/// How long a managed cluster may take to become ready.
#[derive(Clone, Debug)]
pub struct ManagedPollSettings {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ManagedPollSettings {
    fn default() -> Self {
        ManagedPollSettings {
            attempts: DEFAULT_MANAGED_POLL_ATTEMPTS,
            interval: Duration::from_secs(DEFAULT_MANAGED_POLL_INTERVAL_SECS),
        }
    }
}

/// The configuration needed to run an orchestrator operation.
///
/// This can be configured manually in your code or, if you are exposing a CLI,
/// with [`Config::new_from_flags`] (this requires the "cli" feature).
#[derive(Clone, Debug)]
pub struct Config {
    /// The directory where state documents are stored
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    pub execution: ExecutionMode,
    /// The login user created on every VM
    pub ssh_user: String,
    pub ssh: SshSettings,
    pub teardown: TeardownSettings,
    pub managed_poll: ManagedPollSettings,
    /// API token for Civo
    pub civo_token: Option<String>,
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config() -> anyhow::Result<Self> {
        Ok(Config {
            data_dir: default_data_dir()?,
            storage: StorageKind::Local,
            execution: ExecutionMode::Real,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh: SshSettings::default(),
            teardown: TeardownSettings::default(),
            managed_poll: ManagedPollSettings::default(),
            civo_token: None,
        })
    }

    /// A configuration for dry runs and tests: in-memory storage, fake
    /// execution and no pauses.
    pub fn fake(data_dir: PathBuf) -> Self {
        Config {
            data_dir,
            storage: StorageKind::Memory,
            execution: ExecutionMode::Fake,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh: SshSettings {
                warmup: Duration::ZERO,
                connect_delay: Duration::ZERO,
                session_backoff: Duration::ZERO,
                script_retry_delay: Duration::ZERO,
                ..SshSettings::default()
            },
            teardown: TeardownSettings::immediate(),
            managed_poll: ManagedPollSettings {
                attempts: DEFAULT_MANAGED_POLL_ATTEMPTS,
                interval: Duration::ZERO,
            },
            civo_token: None,
        }
    }

    /// Where [`crate::store::LocalStore`] keeps its documents.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Parses the command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(feature = "cli")]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Self::from_opts(opts)
    }

    /// Builds a configuration from already parsed options, e.g. when they are
    /// flattened into a larger command line.
    #[cfg(feature = "cli")]
    pub fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let data_dir = match opts.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        let ssh = SshSettings {
            warmup: Duration::from_secs(opts.ssh_warmup_secs),
            connect_attempts: opts.ssh_connect_attempts,
            connect_delay: Duration::from_secs(opts.ssh_connect_delay_secs),
            session_retries: opts.ssh_session_retries,
            ..SshSettings::default()
        };

        let teardown = TeardownSettings {
            pause_after_vms: Duration::from_secs(opts.teardown_pause_secs),
            network_delete_attempts: opts.network_delete_attempts,
            ..TeardownSettings::default()
        };

        let managed_poll = ManagedPollSettings {
            attempts: opts.managed_poll_attempts,
            interval: Duration::from_secs(opts.managed_poll_interval_secs),
        };

        Ok(Config {
            data_dir,
            storage: opts.storage,
            execution: opts.execution,
            ssh_user: opts.ssh_user,
            ssh,
            teardown,
            managed_poll,
            civo_token: opts.civo_token,
        })
    }
}

/// CLI options shared by every kubeforge subcommand
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
#[structopt(
    name = "kubeforge",
    about = "Provision and bootstrap Kubernetes clusters on Civo, Azure, AWS or kind"
)]
pub struct Opts {
    #[structopt(
        long = "data-dir",
        env = "KUBEFORGE_DATA_DIR",
        global = true,
        help = "The directory state documents are kept in. Defaults to $HOME/.kubeforge"
    )]
    data_dir: Option<PathBuf>,

    #[structopt(
        long = "storage",
        default_value = "local",
        env = "KUBEFORGE_STORAGE",
        global = true,
        possible_values = &["local", "memory"],
        help = "Where state documents are stored"
    )]
    storage: StorageKind,

    #[structopt(
        long = "execution",
        default_value = "real",
        env = "KUBEFORGE_EXECUTION",
        global = true,
        possible_values = &["real", "fake"],
        help = "Run against the real backend or against in-memory fakes"
    )]
    execution: ExecutionMode,

    #[structopt(
        long = "ssh-user",
        default_value = DEFAULT_SSH_USER,
        env = "KUBEFORGE_SSH_USER",
        global = true,
        help = "The login user created on every VM"
    )]
    ssh_user: String,

    #[structopt(
        long = "ssh-warmup-secs",
        default_value = "20",
        env = "KUBEFORGE_SSH_WARMUP_SECS",
        global = true,
        help = "Seconds to wait before the first connection to a new machine"
    )]
    ssh_warmup_secs: u64,

    #[structopt(
        long = "ssh-connect-attempts",
        default_value = "5",
        env = "KUBEFORGE_SSH_CONNECT_ATTEMPTS",
        global = true,
        help = "How many times to try connecting before giving up"
    )]
    ssh_connect_attempts: u32,

    #[structopt(
        long = "ssh-connect-delay-secs",
        default_value = "10",
        env = "KUBEFORGE_SSH_CONNECT_DELAY_SECS",
        global = true,
        help = "Delay between connection attempts"
    )]
    ssh_connect_delay_secs: u64,

    #[structopt(
        long = "ssh-session-retries",
        default_value = "5",
        env = "KUBEFORGE_SSH_SESSION_RETRIES",
        global = true,
        help = "How many times a lost session is reopened for one script"
    )]
    ssh_session_retries: u32,

    #[structopt(
        long = "teardown-pause-secs",
        default_value = "10",
        env = "KUBEFORGE_TEARDOWN_PAUSE_SECS",
        global = true,
        help = "Pause between deleting VMs and deleting firewalls"
    )]
    teardown_pause_secs: u64,

    #[structopt(
        long = "network-delete-attempts",
        default_value = "5",
        env = "KUBEFORGE_NETWORK_DELETE_ATTEMPTS",
        global = true,
        help = "How many times network deletion is attempted"
    )]
    network_delete_attempts: u32,

    #[structopt(
        long = "managed-poll-attempts",
        default_value = "90",
        env = "KUBEFORGE_MANAGED_POLL_ATTEMPTS",
        global = true,
        help = "How many times a managed cluster is polled for readiness"
    )]
    managed_poll_attempts: u32,

    #[structopt(
        long = "managed-poll-interval-secs",
        default_value = "10",
        env = "KUBEFORGE_MANAGED_POLL_INTERVAL_SECS",
        global = true,
        help = "Seconds between readiness polls of a managed cluster"
    )]
    managed_poll_interval_secs: u64,

    #[structopt(
        long = "civo-token",
        env = "CIVO_TOKEN",
        hide_env_values = true,
        global = true,
        help = "API token for Civo"
    )]
    civo_token: Option<String>,
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Unable to get home directory"))?
        .join(".kubeforge"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_storage_and_execution_names() {
        assert_eq!("memory".parse::<StorageKind>().unwrap(), StorageKind::Memory);
        assert_eq!("fake".parse::<ExecutionMode>().unwrap(), ExecutionMode::Fake);
        assert!("s3".parse::<StorageKind>().is_err());
    }

    #[test]
    fn fake_config_never_sleeps() {
        let config = Config::fake(PathBuf::from("/tmp/kubeforge"));
        assert_eq!(config.ssh.warmup, Duration::ZERO);
        assert_eq!(config.teardown.pause_after_vms, Duration::ZERO);
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/kubeforge/state"));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn flags_override_defaults() {
        let opts = Opts::from_iter_safe(&[
            "kubeforge",
            "--data-dir",
            "/srv/kubeforge",
            "--storage",
            "memory",
            "--ssh-connect-attempts",
            "2",
            "--ssh-connect-delay-secs",
            "3",
        ])
        .expect("flags parse");
        let config = Config::from_opts(opts).expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/srv/kubeforge"));
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.ssh.connect_attempts, 2);
        assert_eq!(config.ssh.connect_delay, Duration::from_secs(3));
        assert_eq!(config.ssh.warmup, Duration::from_secs(20));
    }
}
