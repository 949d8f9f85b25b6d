//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use conduit_bus::{InMemoryBus, MessageBus, STAGE_STARTED_SUBJECT};
use conduit_core::{AckMode, AgentProfile, ConductorConfig, StageEvent};
use conduit_orchestrator::{Conductor, Dispatcher, InMemoryKnowledgeStore, KnowledgeStore};
use conduit_worker::{WorkerOutcome, WorkerOutput, WorkerRunner};

pub type TestResult = Result<(), Box<dyn Error>>;

pub const AGENTS: [&str; 3] = ["cynthia", "roy", "billy"];

/// What a scripted worker does when it runs. `{agent}` in stdout is
/// replaced with the agent id.
#[derive(Debug, Clone)]
pub struct Script {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub delay: Duration,
}

impl Script {
    pub fn completes() -> Self {
        Self {
            exit_code: Some(0),
            stdout: concat!(
                "Reading the brief...\n",
                "LESSON: Check the existing schema before adding tables\n",
                "```json\n",
                "{\"status\":\"complete\",\"agent\":\"{agent}\",\"task\":\"work\",",
                "\"summary\":\"Findings ready\",\"complexity\":\"medium\"}\n",
                "```\n",
            )
            .to_string(),
            stderr: String::new(),
            delay: Duration::from_millis(100),
        }
    }

    pub fn exits_with(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(code),
            stdout: "partial output\n".to_string(),
            stderr: stderr.to_string(),
            delay: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub fn taking(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Worker runner that follows a [`Script`] and tracks concurrency.
#[derive(Debug)]
pub struct ScriptedRunner {
    script: Script,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// `(agent_id, context)` for every run started so far.
    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl WorkerRunner for ScriptedRunner {
    async fn run(&self, agent_id: &str, context: &str) -> WorkerOutcome {
        self.calls
            .lock()
            .await
            .push((agent_id.to_string(), context.to_string()));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.script.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        WorkerOutcome::Exited(WorkerOutput {
            exit_code: self.script.exit_code,
            stdout: self.script.stdout.replace("{agent}", agent_id),
            stderr: self.script.stderr.clone(),
            duration: self.script.delay,
        })
    }
}

pub fn config(max_concurrent: usize, ack_mode: AckMode, drain: Duration) -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.dispatch.max_concurrent_workers = max_concurrent;
    config.dispatch.ack_mode = ack_mode;
    config.shutdown.drain_timeout = drain;
    for agent in AGENTS {
        config
            .workers
            .agents
            .insert(agent.to_string(), AgentProfile::default());
    }
    config
}

pub struct Harness {
    pub bus: InMemoryBus,
    pub store: Arc<InMemoryKnowledgeStore>,
    pub runner: Arc<ScriptedRunner>,
    pub conductor: Conductor,
}

impl Harness {
    pub async fn start(config: ConductorConfig, script: Script) -> Result<Self, Box<dyn Error>> {
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let runner = Arc::new(ScriptedRunner::new(script));
        let conductor = Conductor::with_components(
            config,
            Arc::new(bus.clone()),
            Arc::clone(&store) as Arc<dyn KnowledgeStore>,
            Arc::clone(&runner) as Arc<dyn WorkerRunner>,
        );
        conductor.provision_streams().await?;
        Ok(Self {
            bus,
            store,
            runner,
            conductor,
        })
    }

    /// Publish a `stage.started` event; returns its stream sequence.
    pub async fn publish(&self, event: &StageEvent) -> Result<u64, Box<dyn Error>> {
        self.publish_raw(event.to_bytes()?).await
    }

    pub async fn publish_raw(&self, payload: Vec<u8>) -> Result<u64, Box<dyn Error>> {
        let receipt = self
            .bus
            .publish(STAGE_STARTED_SUBJECT, Bytes::from(payload))
            .await?;
        Ok(receipt.sequence)
    }

    /// Run the dispatcher in the background.
    pub fn spawn_dispatcher(&self) -> Dispatcher {
        let dispatcher = self.conductor.dispatcher();
        let background = dispatcher.clone();
        self.conductor.tracker().spawn(async move {
            let _ = background.run().await;
        });
        dispatcher
    }
}

/// Poll `check` every 10ms for up to 60s of (possibly paused) time.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..6000 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
