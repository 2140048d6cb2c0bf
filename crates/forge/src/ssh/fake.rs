use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{RemoteExecutor, ScriptCollection, SshTarget};
use crate::error::{Error, Result};

const FAKE_OUTPUT: &str = "random fake";

/// A script run recorded by [`FakeExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedScript {
    pub host: String,
    pub script: String,
    pub body: String,
}

#[derive(Default)]
struct FakeState {
    outputs: HashMap<String, String>,
    failures: HashSet<(String, String)>,
    executed: Vec<ExecutedScript>,
}

/// An execution strategy that never opens a connection.
///
/// Each captured script answers with the output registered for its name, or
/// `"random fake"`. Failures can be injected per host and script name. Clones
/// share their recordings.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers scripts named `script` with `output`.
    pub fn with_output(self, script: impl Into<String>, output: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.outputs.insert(script.into(), output.into());
        }
        self
    }

    /// Makes the script named `script` fail on `host`.
    pub fn fail_on(&self, host: impl Into<String>, script: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert((host.into(), script.into()));
        }
    }

    /// Clears every injected failure.
    pub fn heal(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.clear();
        }
    }

    /// Every script run so far, in order.
    pub fn executed(&self) -> Vec<ExecutedScript> {
        self.state
            .lock()
            .map(|state| state.executed.clone())
            .unwrap_or_default()
    }

    /// Names of the scripts run on `host`, in order.
    pub fn executed_on(&self, host: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|run| run.host == host)
            .map(|run| run.script)
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute(
        &self,
        target: &SshTarget,
        scripts: &ScriptCollection,
        capture_output: bool,
        _fast_mode: bool,
    ) -> Result<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::RemoteScriptFailed {
                host: target.host.clone(),
                script: String::new(),
                stderr: "fake executor poisoned".to_string(),
            })?;

        let mut output = String::new();
        for script in scripts.iter() {
            debug!(host = %target.host, script = %script.name, "fake execution");
            if state
                .failures
                .contains(&(target.host.clone(), script.name.clone()))
            {
                return Err(Error::RemoteScriptFailed {
                    host: target.host.clone(),
                    script: script.name.clone(),
                    stderr: "injected failure".to_string(),
                });
            }
            state.executed.push(ExecutedScript {
                host: target.host.clone(),
                script: script.name.clone(),
                body: script.shell_script.clone(),
            });
            if capture_output {
                let canned = state
                    .outputs
                    .get(&script.name)
                    .map(String::as_str)
                    .unwrap_or(FAKE_OUTPUT);
                output.push_str(canned);
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ssh::Script;

    fn target(host: &str) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            user: "root".to_string(),
            private_key: String::new(),
        }
    }

    #[tokio::test]
    async fn returns_canned_output_and_records_runs() {
        let fake = FakeExecutor::new().with_output("token", "abc\n");
        let out = fake
            .execute(&target("10.0.0.1"), &Script::new("token", "cat").into(), true, false)
            .await
            .expect("fake run");
        assert_eq!(out, "abc\n");

        let out = fake
            .execute(&target("10.0.0.2"), &Script::new("other", "cat").into(), true, false)
            .await
            .expect("fake run");
        assert_eq!(out, FAKE_OUTPUT);

        assert_eq!(fake.executed_on("10.0.0.1"), vec!["token".to_string()]);
        assert_eq!(fake.executed().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_apply_to_one_host_until_healed() {
        let fake = FakeExecutor::new();
        fake.fail_on("10.0.0.1", "install");
        let scripts: ScriptCollection = Script::new("install", "true").into();

        assert!(fake
            .execute(&target("10.0.0.1"), &scripts, false, true)
            .await
            .is_err());
        assert!(fake
            .execute(&target("10.0.0.2"), &scripts, false, true)
            .await
            .is_ok());

        fake.heal();
        assert!(fake
            .execute(&target("10.0.0.1"), &scripts, false, true)
            .await
            .is_ok());
    }
}
