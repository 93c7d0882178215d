//! In-memory fakes for the engine's collaborators (testing only)
//!
//! Provides `RecordingDeployer`, `ScriptedCommandRunner` and
//! `RecordingNotifier`, which satisfy the collaborator contracts without
//! touching real environments or processes and record every call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::deploy::{DeployRequest, EnvironmentDeployer, EnvironmentEndpoint};
use crate::error::ProvisionError;
use crate::model::Contact;
use crate::notify::Notifier;
use crate::runner::{CommandOutput, CommandRunner};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// RecordingDeployer
// ---------------------------------------------------------------------------

/// Deployer that records requests and answers with
/// `https://<environment>.example.test/<revision>`.
#[derive(Debug, Default)]
pub struct RecordingDeployer {
    calls: Mutex<Vec<DeployRequest>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every deploy to `environment` with a `ProvisionError`.
    pub fn failing_on(mut self, environment: &str) -> Self {
        self.failing.insert(environment.to_string());
        self
    }

    /// Sleep this long inside each deploy.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<DeployRequest> {
        lock(&self.calls).clone()
    }

    /// Environments deployed to, in call order.
    pub fn environments(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|r| r.environment.clone())
            .collect()
    }

    /// Highest number of deploys observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentDeployer for RecordingDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<EnvironmentEndpoint, ProvisionError> {
        lock(&self.calls).push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&request.environment) {
            return Err(ProvisionError::new(format!(
                "quota exceeded in {}",
                request.environment
            )));
        }
        Ok(EnvironmentEndpoint::new(format!(
            "https://{}.example.test/{}",
            request.environment, request.revision
        )))
    }
}

// ---------------------------------------------------------------------------
// ScriptedCommandRunner
// ---------------------------------------------------------------------------

/// One recorded command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
enum Script {
    Exit { code: i32, stdout: String },
    Hang,
}

/// Command runner keyed by program name (`command[0]`).
///
/// Unscripted programs exit 0 with no output.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    scripts: HashMap<String, Script>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, program: &str, exit_code: i32, stdout: &str) -> Self {
        self.scripts.insert(
            program.to_string(),
            Script::Exit {
                code: exit_code,
                stdout: stdout.to_string(),
            },
        );
        self
    }

    /// Make `program` block forever.
    pub fn hang(mut self, program: &str) -> Self {
        self.scripts.insert(program.to_string(), Script::Hang);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Invocations whose program is `program`.
    pub fn invocations_of(&self, program: &str) -> Vec<Invocation> {
        lock(&self.invocations)
            .iter()
            .filter(|i| i.command.first().map(String::as_str) == Some(program))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> anyhow::Result<CommandOutput> {
        lock(&self.invocations).push(Invocation {
            command: command.to_vec(),
            env: env.clone(),
        });
        let program = command.first().map(String::as_str).unwrap_or_default();
        match self.scripts.get(program) {
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Exit { code, stdout }) => Ok(CommandOutput {
                exit_code: *code,
                stdout: stdout.clone(),
                stderr: if *code == 0 {
                    String::new()
                } else {
                    format!("{program} failed")
                },
                duration_ms: 0,
            }),
            None => Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

/// Notifier that records messages; selected contacts can be made to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(Contact, String)>>,
    failing: HashSet<Contact>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, contact: &str) -> Self {
        self.failing.insert(Contact::new(contact));
        self
    }

    pub fn messages(&self) -> Vec<(Contact, String)> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, contact: &Contact, message: &str) -> anyhow::Result<()> {
        if self.failing.contains(contact) {
            anyhow::bail!("mailbox {contact} unavailable");
        }
        lock(&self.messages).push((contact.clone(), message.to_string()));
        Ok(())
    }
}
