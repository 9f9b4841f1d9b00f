//! Agent registry: roster, token minting/resolution, session-attachment
//! tracking, and status snapshots. Grounded on the teacher's
//! `agents::lifecycle::AgentRegistry` — an in-memory map guarded by
//! `tokio::sync::RwLock`, wrapped as `SharedAgentRegistry = Arc<RwLock<_>>`,
//! with defensive `Option`-returning getters that never panic on an unknown
//! id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CouncilError;
use crate::model::AgentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Persistent,
    PerSession,
}

#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub id: String,
    pub name: String,
    pub role: String,
    pub connected: bool,
    pub connection_mode: ConnectionMode,
    pub active_sessions: HashSet<Uuid>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AgentRecord {
    config: AgentConfig,
    persistent_token: Option<String>,
    connected: bool,
    last_seen: Option<DateTime<Utc>>,
    active_sessions: HashSet<Uuid>,
}

impl AgentRecord {
    fn new(config: AgentConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}

struct Registry {
    agents: HashMap<String, AgentRecord>,
    token_to_agent: HashMap<String, String>,
}

/// Cheap-clone shared handle, mirroring the teacher's `SharedAgentRegistry`
/// type alias one level down (here the `Arc<RwLock<_>>` lives inside rather
/// than being the type itself, so the registry can carry helper methods).
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentConfig>) -> Self {
        let mut map = HashMap::new();
        for agent in agents {
            map.insert(agent.id.clone(), AgentRecord::new(agent));
        }
        Self {
            inner: Arc::new(RwLock::new(Registry {
                agents: map,
                token_to_agent: HashMap::new(),
            })),
        }
    }

    /// Swaps the roster on config reload. Existing tokens and session
    /// attachments for agents that still exist are preserved.
    pub async fn reload(&self, agents: Vec<AgentConfig>) {
        let mut reg = self.inner.write().await;
        let mut next = HashMap::new();
        for agent in agents {
            if let Some(mut existing) = reg.agents.remove(&agent.id) {
                existing.config = agent;
                next.insert(existing.config.id.clone(), existing);
            } else {
                next.insert(agent.id.clone(), AgentRecord::new(agent));
            }
        }
        reg.agents = next;
    }

    pub async fn agent(&self, id: &str) -> Option<AgentConfig> {
        let reg = self.inner.read().await;
        reg.agents.get(id).map(|r| r.config.clone())
    }

    /// `council_{agentId}_{nonce}` for per-session agents; the idempotent
    /// `council_persistent_{agentId}_{nonce}` form for persistent ones.
    pub async fn generate_token(&self, agent_id: &str) -> Result<String, CouncilError> {
        let mut reg = self.inner.write().await;
        let persistent = {
            let record = reg
                .agents
                .get(agent_id)
                .ok_or_else(|| CouncilError::UnknownAgent(agent_id.to_string()))?;
            record.config.persistent
        };
        if persistent {
            if let Some(existing) = reg.agents.get(agent_id).and_then(|r| r.persistent_token.clone()) {
                return Ok(existing);
            }
            let token = format!("council_persistent_{agent_id}_{}", nonce());
            reg.token_to_agent.insert(token.clone(), agent_id.to_string());
            if let Some(record) = reg.agents.get_mut(agent_id) {
                record.persistent_token = Some(token.clone());
            }
            Ok(token)
        } else {
            let token = format!("council_{agent_id}_{}", nonce());
            reg.token_to_agent.insert(token.clone(), agent_id.to_string());
            Ok(token)
        }
    }

    /// Installs a persistent token loaded from storage at startup, so later
    /// `generate_token` calls for this agent return it without minting a new
    /// one.
    pub async fn set_persistent_token(&self, agent_id: &str, token: String) -> Result<(), CouncilError> {
        let mut reg = self.inner.write().await;
        if !reg.agents.contains_key(agent_id) {
            return Err(CouncilError::UnknownAgent(agent_id.to_string()));
        }
        reg.token_to_agent.insert(token.clone(), agent_id.to_string());
        if let Some(record) = reg.agents.get_mut(agent_id) {
            record.persistent_token = Some(token);
        }
        Ok(())
    }

    /// Unknown tokens fail silently, never throw.
    pub async fn resolve_token(&self, token: &str) -> Option<String> {
        let reg = self.inner.read().await;
        reg.token_to_agent.get(token).cloned()
    }

    pub async fn assign_session(&self, agent_id: &str, session_id: Uuid) -> Result<(), CouncilError> {
        let mut reg = self.inner.write().await;
        let record = reg
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CouncilError::UnknownAgent(agent_id.to_string()))?;
        record.active_sessions.insert(session_id);
        Ok(())
    }

    pub async fn unassign_session(&self, agent_id: &str, session_id: Uuid) -> Result<(), CouncilError> {
        let mut reg = self.inner.write().await;
        let record = reg
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CouncilError::UnknownAgent(agent_id.to_string()))?;
        record.active_sessions.remove(&session_id);
        Ok(())
    }

    pub async fn active_sessions(&self, agent_id: &str) -> HashSet<Uuid> {
        let reg = self.inner.read().await;
        reg.agents
            .get(agent_id)
            .map(|r| r.active_sessions.clone())
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        let reg = self.inner.read().await;
        reg.agents.get(agent_id).map(|r| r.connected).unwrap_or(false)
    }

    pub async fn set_connected(&self, agent_id: &str, connected: bool) {
        let mut reg = self.inner.write().await;
        if let Some(record) = reg.agents.get_mut(agent_id) {
            record.connected = connected;
            if connected {
                record.last_seen = Some(Utc::now());
            }
        }
    }

    pub async fn statuses(&self) -> Vec<AgentStatus> {
        let reg = self.inner.read().await;
        reg.agents
            .values()
            .map(|r| AgentStatus {
                id: r.config.id.clone(),
                name: r.config.name.clone(),
                role: r.config.role.clone(),
                connected: r.connected,
                connection_mode: if r.config.persistent {
                    ConnectionMode::Persistent
                } else {
                    ConnectionMode::PerSession
                },
                active_sessions: r.active_sessions.clone(),
                last_seen: r.last_seen,
            })
            .collect()
    }
}

fn nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, persistent: bool) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            name: id.to_string(),
            role: "role".to_string(),
            expertise: vec![],
            can_propose: true,
            can_veto: false,
            voting_weight: 1,
            system_prompt: String::new(),
            model: None,
            persistent,
        }
    }

    #[tokio::test]
    async fn per_session_tokens_are_fresh_each_time() {
        let registry = AgentRegistry::new(vec![agent("cto", false)]);
        let t1 = registry.generate_token("cto").await.unwrap();
        let t2 = registry.generate_token("cto").await.unwrap();
        assert_ne!(t1, t2);
        assert!(t1.starts_with("council_cto_"));
    }

    #[tokio::test]
    async fn persistent_tokens_are_idempotent() {
        let registry = AgentRegistry::new(vec![agent("cto", true)]);
        let t1 = registry.generate_token("cto").await.unwrap();
        let t2 = registry.generate_token("cto").await.unwrap();
        assert_eq!(t1, t2);
        assert!(t1.starts_with("council_persistent_cto_"));
    }

    #[tokio::test]
    async fn unknown_agent_fails_generation() {
        let registry = AgentRegistry::new(vec![]);
        let err = registry.generate_token("ghost").await.unwrap_err();
        assert!(matches!(err, CouncilError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn resolve_unknown_token_returns_none() {
        let registry = AgentRegistry::new(vec![agent("cto", false)]);
        assert!(registry.resolve_token("nonsense").await.is_none());
    }

    #[tokio::test]
    async fn assign_session_is_idempotent() {
        let registry = AgentRegistry::new(vec![agent("cto", false)]);
        let session_id = Uuid::new_v4();
        registry.assign_session("cto", session_id).await.unwrap();
        registry.assign_session("cto", session_id).await.unwrap();
        let sessions = registry.active_sessions("cto").await;
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn set_persistent_token_is_resolvable_after_restart_simulation() {
        let registry = AgentRegistry::new(vec![agent("cto", true)]);
        registry
            .set_persistent_token("cto", "council_persistent_cto_abc".to_string())
            .await
            .unwrap();
        let resolved = registry.resolve_token("council_persistent_cto_abc").await;
        assert_eq!(resolved.as_deref(), Some("cto"));
        let generated = registry.generate_token("cto").await.unwrap();
        assert_eq!(generated, "council_persistent_cto_abc");
    }
}
