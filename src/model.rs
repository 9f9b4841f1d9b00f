//! Core data model: Council, Session, Message, Vote, Decision, and the
//! phase state machine.
//!
//! Every domain struct derives `Serialize`/`Deserialize` and uses
//! `chrono::DateTime<Utc>` for timestamps, matching the teacher daemon's
//! `agents::lifecycle::AgentRecord` / `tasks::reducer::MaterializedTask`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Council configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default)]
    pub can_propose: bool,
    #[serde(default)]
    pub can_veto: bool,
    #[serde(default = "default_voting_weight")]
    pub voting_weight: u32,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub persistent: bool,
}

fn default_voting_weight() -> u32 {
    1
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            id: String::new(),
            name: String::new(),
            role: String::new(),
            expertise: Vec::new(),
            can_propose: false,
            can_veto: false,
            voting_weight: 1,
            system_prompt: String::new(),
            model: None,
            persistent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingScheme {
    WeightedMajority,
    Unanimous,
    Advisory,
}

impl Default for VotingScheme {
    fn default() -> Self {
        VotingScheme::WeightedMajority
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Deadlock,
    Timeout,
    VetoExercised,
    NoQuorum,
    RoundLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationTrigger {
    Deadlock,
    Timeout {
        timeout_seconds: i64,
        #[serde(default)]
        phases: Vec<Phase>,
    },
    VetoExercised,
    NoQuorum,
    RoundLimit,
}

impl EscalationTrigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            EscalationTrigger::Deadlock => TriggerKind::Deadlock,
            EscalationTrigger::Timeout { .. } => TriggerKind::Timeout,
            EscalationTrigger::VetoExercised => TriggerKind::VetoExercised,
            EscalationTrigger::NoQuorum => TriggerKind::NoQuorum,
            EscalationTrigger::RoundLimit => TriggerKind::RoundLimit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationAction {
    EscalateToHuman {
        #[serde(default)]
        message: Option<String>,
    },
    AddAgent {
        agent_id: String,
    },
    NotifyExternal {
        webhook_url: String,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationRule {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub trigger: EscalationTrigger,
    pub action: EscalationAction,
    #[serde(default)]
    pub stop_after: bool,
    #[serde(default = "default_max_fires")]
    pub max_fires_per_session: u32,
}

fn default_priority() -> i32 {
    100
}

fn default_max_fires() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    pub quorum: u32,
    pub voting_threshold: f64,
    #[serde(default)]
    pub max_deliberation_rounds: u32,
    #[serde(default)]
    pub require_human_approval: bool,
    #[serde(default)]
    pub voting_scheme: VotingScheme,
    #[serde(default)]
    pub escalation: Vec<EscalationRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphPolicy {
    Broadcast,
    Graph,
}

impl Default for GraphPolicy {
    fn default() -> Self {
        GraphPolicy::Broadcast
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommunicationGraph {
    #[serde(default)]
    pub default_policy: GraphPolicy,
    #[serde(default)]
    pub edges: HashMap<String, HashSet<String>>,
}

impl CommunicationGraph {
    pub fn can_communicate(&self, from: &str, to: &str) -> bool {
        match self.default_policy {
            GraphPolicy::Broadcast => true,
            GraphPolicy::Graph => self
                .edges
                .get(from)
                .map(|peers| peers.contains(to))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMatch {
    pub source: String,
    #[serde(default)]
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventAssignment {
    pub lead: String,
    #[serde(default)]
    pub consult: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRoutingRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "match")]
    pub match_: EventMatch,
    pub assign: EventAssignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnerKind {
    Log,
    Webhook,
    Sdk,
}

impl Default for SpawnerKind {
    fn default() -> Self {
        SpawnerKind::Log
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnerConfig {
    #[serde(default)]
    #[serde(rename = "type")]
    pub spawner_type: SpawnerKind,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Council {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Rules,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub communication_graph: CommunicationGraph,
    #[serde(default)]
    pub event_routing: Vec<EventRoutingRule>,
    #[serde(default)]
    pub spawner: SpawnerConfig,
}

impl Council {
    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }
}

// ─── Session / phase state machine ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Investigation,
    Proposal,
    Discussion,
    Voting,
    Review,
    Decided,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Decided | Phase::Aborted)
    }

    /// Whether `self -> next` is a legal transition per spec.md §3's state
    /// machine diagram.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Created, Proposal) => true,
            (Created, Investigation) => true,
            (Investigation, Proposal) => true,
            (Proposal, Discussion) => true,
            (Discussion, Voting) => true,
            (Voting, Discussion) => true,
            (Voting, Review) => true,
            (Voting, Decided) => true,
            (Review, Decided) => true,
            (_, Aborted) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub council_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source_event_id: Option<Uuid>,
    pub lead_agent_id: String,
    #[serde(default)]
    pub consult_agent_ids: Vec<String>,
    pub phase: Phase,
    #[serde(default)]
    pub deliberation_round: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Session {
    /// All agents with standing to vote/discuss on this session.
    pub fn participants(&self) -> HashSet<String> {
        let mut set: HashSet<String> = self.consult_agent_ids.iter().cloned().collect();
        set.insert(self.lead_agent_id.clone());
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Proposal,
    Discussion,
    Question,
    Answer,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub from_agent_id: String,
    #[serde(default)]
    pub to_agent_id: Option<String>,
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteValue {
    Approve,
    Reject,
    Abstain,
}

impl VoteValue {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteValue::Approve => "approve",
            VoteValue::Reject => "reject",
            VoteValue::Abstain => "abstain",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_id: String,
    pub value: VoteValue,
    #[serde(default)]
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Approved,
    Rejected,
    Escalated,
    Aborted,
    NoConsensus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub approve: f64,
    pub reject: f64,
    pub abstain: f64,
    pub total_weight: f64,
    pub quorum_met: bool,
    pub threshold_met: bool,
    pub veto_exercised: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub session_id: Uuid,
    pub outcome: Outcome,
    pub tally: TallySnapshot,
    #[serde(default)]
    pub human_reviewed_by: Option<String>,
    #[serde(default)]
    pub human_notes: Option<String>,
    pub veto_exercised: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
}

// ─── Webhook event envelope ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Labels carried by a GitHub issue or pull-request payload.
    /// Non-GitHub sources and payloads with no labels yield an empty set.
    pub fn labels(&self) -> HashSet<String> {
        if self.source != "github" {
            return HashSet::new();
        }
        let extract = |container: &serde_json::Value| -> HashSet<String> {
            container
                .get("labels")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default()
        };
        if let Some(issue) = self.payload.get("issue") {
            return extract(issue);
        }
        if let Some(pr) = self.payload.get("pull_request") {
            return extract(pr);
        }
        HashSet::new()
    }

    /// Best-effort human title for a newly created session.
    pub fn derived_title(&self) -> String {
        self.payload
            .get("issue")
            .and_then(|i| i.get("title"))
            .or_else(|| self.payload.get("pull_request").and_then(|p| p.get("title")))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{} event {}", self.source, self.event_type))
    }
}
