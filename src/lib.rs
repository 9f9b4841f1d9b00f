//! Core orchestration engine for a multi-agent deliberation council.
//!
//! Ingests external events, routes them to a configured group of agents,
//! drives sessions through a structured deliberation state machine, tallies
//! votes under configurable rules, and escalates stuck or risky
//! deliberations according to declarative policy. Transport, persistence,
//! UI, and agent execution are external collaborators, not part of this
//! crate — see [`store::Store`] and [`spawner`].

pub mod bus;
pub mod config;
pub mod error;
pub mod escalation;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod spawner;
pub mod store;
pub mod voting;

pub use error::{CouncilError, Result};
pub use model::{
    AgentConfig, Council, CommunicationGraph, Decision, EscalationAction, EscalationRule, EscalationTrigger,
    EventRoutingRule, Message, MessageType, Outcome, Phase, Rules, Session, TallySnapshot, Vote, VoteValue,
    VotingScheme, WebhookEvent,
};
pub use orchestrator::{CreateSessionArgs, SessionOrchestrator};
pub use store::{InMemoryStore, Store};
pub use spawner::{LogSpawner, NullNotifier, Notifier, Spawner};
