//! Agent execution and external-notification boundaries. The core never
//! launches a process or opens a socket itself; it calls out through these
//! two abstract collaborator traits, the same shape as the teacher's
//! `AppContext` holding `Arc<dyn Runner>`-style collaborators rather than
//! inlining I/O into orchestration logic.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{AgentConfig, Session};

#[derive(Debug, Clone)]
pub struct SpawnTask {
    pub session_id: Uuid,
    pub agent_config: AgentConfig,
    pub context: String,
    pub council_mcp_url: Option<String>,
    pub agent_token: String,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    AgentStarted { agent_id: String, session_id: Uuid },
    AgentCompleted { agent_id: String, session_id: Uuid, cost: Option<f64> },
    AgentErrored { agent_id: String, session_id: Uuid, error: String },
}

/// Launches the lead (or added) agent for a session. Fire-and-forget: the
/// orchestrator never awaits agent completion, only the acknowledgement
/// that launch was accepted. Lifecycle callbacks are optional — the
/// source's webhook-backed spawner never emits them, only its SDK-backed
/// one does, so the orchestrator must tolerate a spawner that reports
/// nothing further after `spawn` returns.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, task: SpawnTask) -> anyhow::Result<()>;

    /// Reports a lifecycle event for a previously spawned agent. Spawners
    /// without real lifecycle semantics (the log spawner, for instance)
    /// simply never call into whatever drives this; the orchestrator must
    /// not assume it will ever be invoked.
    async fn report_lifecycle(&self, _event: LifecycleEvent) {}
}

/// Fire-and-forget external notification, used by the `notify_external`
/// escalation action. Failures are logged by the caller and never
/// propagate into a session's state transition.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, webhook_url: &str, session: &Session) -> anyhow::Result<()>;
}

/// Logs spawn requests instead of launching anything, mirroring the
/// source's log-only webhook spawner. Useful as a default and in tests.
pub struct LogSpawner;

#[async_trait]
impl Spawner for LogSpawner {
    async fn spawn(&self, task: SpawnTask) -> anyhow::Result<()> {
        tracing::info!(
            session_id = %task.session_id,
            agent_id = %task.agent_config.id,
            "spawn requested (log spawner, no-op)"
        );
        Ok(())
    }
}

/// Discards notifications. Used where no external webhook is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, webhook_url: &str, session: &Session) -> anyhow::Result<()> {
        tracing::debug!(webhook_url, session_id = %session.id, "notify requested (null notifier, no-op)");
        Ok(())
    }
}
