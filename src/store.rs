//! Persistence boundary. The core never picks a storage engine — callers
//! supply an implementation of `Store`; the crate ships an `InMemoryStore`
//! fixture for its own tests, mirroring how the teacher's own test suite
//! builds throwaway in-memory fixtures rather than hitting a real backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{Decision, Message, Phase, Session, Vote, WebhookEvent};

/// Partial update applied to a stored Session. `None` fields are left
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct SessionPatch {
    pub phase: Option<Phase>,
    pub deliberation_round: Option<u32>,
    pub consult_agent_ids: Option<Vec<String>>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub terminal_at: Option<Option<chrono::DateTime<chrono::Utc>>>,
}

/// Partial update applied to a stored Decision.
#[derive(Debug, Default, Clone)]
pub struct DecisionPatch {
    pub human_reviewed_by: Option<Option<String>>,
    pub human_notes: Option<Option<String>>,
    pub outcome: Option<crate::model::Outcome>,
    pub finalized_at: Option<Option<chrono::DateTime<chrono::Utc>>>,
}

/// External persistence collaborator. Every method may fail; failures
/// propagate to the orchestrator's caller as `CouncilError::StoreError`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_session(&self, session: Session) -> anyhow::Result<()>;
    async fn update_session(&self, id: Uuid, patch: SessionPatch) -> anyhow::Result<()>;
    async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<Session>>;
    async fn list_sessions(&self, council_id: Option<&str>, phase: Option<Phase>) -> anyhow::Result<Vec<Session>>;

    async fn save_message(&self, message: Message) -> anyhow::Result<()>;
    async fn get_messages(&self, session_id: Uuid) -> anyhow::Result<Vec<Message>>;

    async fn save_vote(&self, vote: Vote) -> anyhow::Result<()>;
    async fn get_votes(&self, session_id: Uuid) -> anyhow::Result<Vec<Vote>>;

    async fn save_decision(&self, decision: Decision) -> anyhow::Result<()>;
    async fn update_decision(&self, id: Uuid, patch: DecisionPatch) -> anyhow::Result<()>;
    async fn get_decision(&self, session_id: Uuid) -> anyhow::Result<Option<Decision>>;
    async fn list_pending_decisions(&self) -> anyhow::Result<Vec<Decision>>;

    async fn save_event(&self, event: WebhookEvent) -> anyhow::Result<()>;
    async fn list_events(&self, council_id: Option<&str>, limit: usize) -> anyhow::Result<Vec<WebhookEvent>>;
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, Session>,
    messages: HashMap<Uuid, Vec<Message>>,
    votes: HashMap<Uuid, Vec<Vote>>,
    decisions: HashMap<Uuid, Decision>,
    events: Vec<WebhookEvent>,
}

/// In-memory `Store` fixture used by this crate's own integration tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_session(&self, session: Session) -> anyhow::Result<()> {
        self.tables.write().unwrap().sessions.insert(session.id, session);
        Ok(())
    }

    async fn update_session(&self, id: Uuid, patch: SessionPatch) -> anyhow::Result<()> {
        let mut tables = self.tables.write().unwrap();
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("no such session {id}"))?;
        if let Some(phase) = patch.phase {
            session.phase = phase;
        }
        if let Some(round) = patch.deliberation_round {
            session.deliberation_round = round;
        }
        if let Some(consult) = patch.consult_agent_ids {
            session.consult_agent_ids = consult;
        }
        if let Some(updated_at) = patch.updated_at {
            session.updated_at = updated_at;
        }
        if let Some(terminal_at) = patch.terminal_at {
            session.terminal_at = terminal_at;
        }
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<Session>> {
        Ok(self.tables.read().unwrap().sessions.get(&id).cloned())
    }

    async fn list_sessions(&self, council_id: Option<&str>, phase: Option<Phase>) -> anyhow::Result<Vec<Session>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .sessions
            .values()
            .filter(|s| council_id.map(|c| c == s.council_id).unwrap_or(true))
            .filter(|s| phase.map(|p| p == s.phase).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn save_message(&self, message: Message) -> anyhow::Result<()> {
        self.tables
            .write()
            .unwrap()
            .messages
            .entry(message.session_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn get_messages(&self, session_id: Uuid) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .messages
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_vote(&self, vote: Vote) -> anyhow::Result<()> {
        self.tables.write().unwrap().votes.entry(vote.session_id).or_default().push(vote);
        Ok(())
    }

    async fn get_votes(&self, session_id: Uuid) -> anyhow::Result<Vec<Vote>> {
        Ok(self.tables.read().unwrap().votes.get(&session_id).cloned().unwrap_or_default())
    }

    async fn save_decision(&self, decision: Decision) -> anyhow::Result<()> {
        self.tables.write().unwrap().decisions.insert(decision.session_id, decision);
        Ok(())
    }

    async fn update_decision(&self, id: Uuid, patch: DecisionPatch) -> anyhow::Result<()> {
        let mut tables = self.tables.write().unwrap();
        let decision = tables
            .decisions
            .values_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow::anyhow!("no such decision {id}"))?;
        if let Some(reviewer) = patch.human_reviewed_by {
            decision.human_reviewed_by = reviewer;
        }
        if let Some(notes) = patch.human_notes {
            decision.human_notes = notes;
        }
        if let Some(outcome) = patch.outcome {
            decision.outcome = outcome;
        }
        if let Some(finalized_at) = patch.finalized_at {
            decision.finalized_at = finalized_at;
        }
        Ok(())
    }

    async fn get_decision(&self, session_id: Uuid) -> anyhow::Result<Option<Decision>> {
        Ok(self.tables.read().unwrap().decisions.get(&session_id).cloned())
    }

    async fn list_pending_decisions(&self) -> anyhow::Result<Vec<Decision>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .decisions
            .values()
            .filter(|d| d.finalized_at.is_none())
            .cloned()
            .collect())
    }

    async fn save_event(&self, event: WebhookEvent) -> anyhow::Result<()> {
        self.tables.write().unwrap().events.push(event);
        Ok(())
    }

    async fn list_events(&self, _council_id: Option<&str>, limit: usize) -> anyhow::Result<Vec<WebhookEvent>> {
        // WebhookEvent carries no council_id of its own (the council is
        // determined downstream by the router); council_id is accepted for
        // interface parity with the Store contract and reserved for
        // implementations that key events by council.
        let tables = self.tables.read().unwrap();
        Ok(tables.events.iter().rev().take(limit).cloned().collect())
    }
}
