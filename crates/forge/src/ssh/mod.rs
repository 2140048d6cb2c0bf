//! Remote script execution on freshly booted machines.
//!
//! An [`RemoteExecutor`] runs a [`ScriptCollection`] on one host. Two strategies
//! exist and are chosen when the executor is constructed: [`SshExecutor`], which
//! opens a verified SSH connection, and [`FakeExecutor`], which never touches
//! the network and answers with canned output.

mod fake;
mod openssh;

pub use fake::{ExecutedScript, FakeExecutor};
pub use openssh::{
    RemoteSession, SshExecutor, SshSettings, SystemTransport, Transport, TransportError,
};

use async_trait::async_trait;

use crate::error::Result;

/// One named shell script. Retryable scripts are re-run up to `max_retries`
/// times when they exit unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub can_retry: bool,
    pub max_retries: u32,
    pub shell_script: String,
}

impl Script {
    /// A script that runs exactly once.
    pub fn new(name: impl Into<String>, shell_script: impl Into<String>) -> Self {
        Script {
            name: name.into(),
            can_retry: false,
            max_retries: 0,
            shell_script: shell_script.into(),
        }
    }

    /// Allows the script to be run up to `max_retries` times.
    pub fn retry(mut self, max_retries: u32) -> Self {
        self.can_retry = max_retries > 0;
        self.max_retries = max_retries;
        self
    }

    pub(crate) fn attempts(&self) -> u32 {
        if self.can_retry {
            self.max_retries.max(1)
        } else {
            1
        }
    }
}

/// Scripts executed in order over one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptCollection {
    scripts: Vec<Script>,
}

impl ScriptCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, script: Script) -> &mut Self {
        self.scripts.push(script);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Script> {
        self.scripts.iter()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl From<Script> for ScriptCollection {
    fn from(script: Script) -> Self {
        ScriptCollection {
            scripts: vec![script],
        }
    }
}

impl FromIterator<Script> for ScriptCollection {
    fn from_iter<I: IntoIterator<Item = Script>>(iter: I) -> Self {
        ScriptCollection {
            scripts: iter.into_iter().collect(),
        }
    }
}

/// Where and as whom scripts run.
#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    /// PEM encoded private key
    pub private_key: String,
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Runs scripts on a remote machine.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Executes `scripts` on `target` in order and stops at the first failure.
    ///
    /// When `capture_output` is set the standard output of every script is
    /// returned, concatenated in order; otherwise an empty string is returned.
    /// Unless `fast_mode` is set, a warm-up pause precedes the first connection
    /// attempt so a machine that just booted can start its SSH daemon.
    async fn execute(
        &self,
        target: &SshTarget,
        scripts: &ScriptCollection,
        capture_output: bool,
        fast_mode: bool,
    ) -> Result<String>;
}

#[async_trait]
impl<E: RemoteExecutor + ?Sized> RemoteExecutor for std::sync::Arc<E> {
    async fn execute(
        &self,
        target: &SshTarget,
        scripts: &ScriptCollection,
        capture_output: bool,
        fast_mode: bool,
    ) -> Result<String> {
        (**self)
            .execute(target, scripts, capture_output, fast_mode)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_counts_are_bounded_below_by_one() {
        assert_eq!(Script::new("once", "true").attempts(), 1);
        assert_eq!(Script::new("thrice", "true").retry(3).attempts(), 3);
        assert_eq!(Script::new("never", "true").retry(0).attempts(), 1);
    }

    #[test]
    fn collection_keeps_order() {
        let mut scripts = ScriptCollection::new();
        scripts
            .append(Script::new("first", "echo 1"))
            .append(Script::new("second", "echo 2"));
        let names: Vec<_> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
