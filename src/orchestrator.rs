//! The central coordinator. Every other subsystem is a dependency of the
//! `SessionOrchestrator`. Grounded on the teacher's `agents::orchestrator::Orchestrator`
//! (holds a `SharedAgentRegistry`, takes a write lock across an entire
//! check-then-mutate sequence to avoid TOCTOU races) and on
//! `tasks::reducer::reduce` for the phase state machine itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::error::{CouncilError, Result};
use crate::escalation::{self, EscalationContext, EscalationEffect, FireCounts};
use crate::model::{
    Council, Decision, Message, MessageType, Outcome, Phase, Session, Vote, VoteValue, WebhookEvent,
};
use crate::registry::AgentRegistry;
use crate::router::EventRouter;
use crate::spawner::{Notifier, SpawnTask, Spawner};
use crate::store::{DecisionPatch, SessionPatch, Store};
use crate::voting::{self, TallyResult};

/// Per-session serialization, mirroring `SharedAgentRegistry`'s
/// `Arc<RwLock<HashMap<...>>>` shape one level down: a map from session id
/// to a mutex whose guard is held across the whole of one operation.
#[derive(Default, Clone)]
struct SessionLocks {
    locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    async fn lock_for(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&session_id) {
            return lock.clone();
        }
        let mut write = self.locks.write().await;
        write.entry(session_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

pub struct CreateSessionArgs {
    pub title: String,
    pub phase: Option<Phase>,
    pub lead_agent_id: Option<String>,
    pub consult_agent_ids: Option<Vec<String>>,
    pub source_event_id: Option<Uuid>,
}

pub struct SessionOrchestrator {
    council: Arc<RwLock<Council>>,
    store: Arc<dyn Store>,
    spawner: Arc<dyn Spawner>,
    notifier: Arc<dyn Notifier>,
    registry: AgentRegistry,
    router: Arc<RwLock<EventRouter>>,
    bus: MessageBus,
    locks: SessionLocks,
    last_tallies: Arc<RwLock<HashMap<Uuid, TallyResult>>>,
    fire_counts: Arc<RwLock<HashMap<Uuid, FireCounts>>>,
}

impl SessionOrchestrator {
    pub fn new(
        council: Council,
        store: Arc<dyn Store>,
        spawner: Arc<dyn Spawner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = AgentRegistry::new(council.agents.clone());
        let router = EventRouter::new(council.event_routing.clone());
        let bus = MessageBus::new();
        bus.update_graph(council.communication_graph.clone());
        Self {
            council: Arc::new(RwLock::new(council)),
            store,
            spawner,
            notifier,
            registry,
            router: Arc::new(RwLock::new(router)),
            bus,
            locks: SessionLocks::default(),
            last_tallies: Arc::new(RwLock::new(HashMap::new())),
            fire_counts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Propagates updated rules and graph to the router, bus, and registry
    /// without disturbing in-flight sessions. Config reload failures are
    /// the caller's responsibility: if this is never called, the previous
    /// configuration stays in force.
    pub async fn reload(&self, new_council: Council) {
        self.router.write().await.update_rules(new_council.event_routing.clone());
        self.bus.update_graph(new_council.communication_graph.clone());
        self.registry.reload(new_council.agents.clone()).await;
        *self.council.write().await = new_council;
    }

    async fn council_snapshot(&self) -> Council {
        self.council.read().await.clone()
    }

    pub async fn create_session(&self, args: CreateSessionArgs) -> Result<Session> {
        let now = Utc::now();
        let council = self.council_snapshot().await;
        let session = Session {
            id: Uuid::new_v4(),
            council_id: council.id.clone(),
            title: args.title,
            summary: String::new(),
            source_event_id: args.source_event_id,
            lead_agent_id: args.lead_agent_id.unwrap_or_default(),
            consult_agent_ids: args.consult_agent_ids.unwrap_or_default(),
            phase: args.phase.unwrap_or(Phase::Proposal),
            deliberation_round: 0,
            created_at: now,
            updated_at: now,
            terminal_at: None,
        };
        self.store
            .save_session(session.clone())
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;
        tracing::info!(session_id = %session.id, phase = ?session.phase, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.store.get_session(id).await.map_err(|e| CouncilError::StoreError(e.to_string()))
    }

    pub async fn list_sessions(&self, council_id: Option<&str>, phase: Option<Phase>) -> Result<Vec<Session>> {
        self.store
            .list_sessions(council_id, phase)
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))
    }

    /// Sweeps every non-terminal session for timeout-triggered escalations.
    /// State-changing operations already run the escalation engine on
    /// completion, which catches deadlock/veto/no-quorum/round-limit
    /// triggers immediately, but a `timeout` trigger needs rechecking even
    /// when nothing else happens on a session. The orchestrator has no
    /// scheduler loop of its own; a caller is expected to invoke this on a
    /// periodic tick (spec suggests ~1s cadence), the way the teacher's
    /// lease janitor is driven by an external interval rather than owning
    /// one.
    pub async fn run_timeout_sweep(&self) -> Result<()> {
        for session in self.list_sessions(None, None).await? {
            if session.phase.is_terminal() {
                continue;
            }
            let lock = self.locks.lock_for(session.id).await;
            let _guard = lock.lock().await;
            let session = match self.store.get_session(session.id).await.map_err(|e| CouncilError::StoreError(e.to_string()))? {
                Some(s) if !s.phase.is_terminal() => s,
                _ => continue,
            };
            self.run_escalation(&session).await?;
        }
        Ok(())
    }

    async fn require_session(&self, session_id: Uuid) -> Result<Session> {
        self.store
            .get_session(session_id)
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?
            .ok_or_else(|| CouncilError::StoreError(format!("no such session {session_id}")))
    }

    pub async fn transition_phase(&self, session_id: Uuid, new_phase: Phase) -> Result<Session> {
        let lock = self.locks.lock_for(session_id).await;
        let _guard = lock.lock().await;
        self.transition_phase_locked(session_id, new_phase).await
    }

    async fn transition_phase_locked(&self, session_id: Uuid, new_phase: Phase) -> Result<Session> {
        let session = self.require_session(session_id).await?;
        if !session.phase.can_transition_to(new_phase) {
            return Err(CouncilError::InvalidTransition {
                from: session.phase,
                to: new_phase,
            });
        }
        self.set_phase_locked(session, new_phase).await
    }

    /// Forces a session straight to `new_phase`, bypassing the ordinary
    /// phase-diagram legality check. Used only by escalation's
    /// `escalate_to_human` action: forcing review is an administrative
    /// override available from any non-terminal phase, not a step in the
    /// normal deliberation path `transitionPhase` enforces.
    async fn force_phase_locked(&self, session_id: Uuid, new_phase: Phase) -> Result<Session> {
        let session = self.require_session(session_id).await?;
        self.set_phase_locked(session, new_phase).await
    }

    async fn set_phase_locked(&self, mut session: Session, new_phase: Phase) -> Result<Session> {
        let from = session.phase;
        let now = Utc::now();
        if session.phase == Phase::Voting && new_phase == Phase::Discussion {
            session.deliberation_round += 1;
        }
        session.phase = new_phase;
        session.updated_at = now;
        let terminal_at = if new_phase.is_terminal() { Some(now) } else { None };
        if terminal_at.is_some() {
            session.terminal_at = terminal_at;
        }

        self.store
            .update_session(
                session.id,
                SessionPatch {
                    phase: Some(new_phase),
                    deliberation_round: Some(session.deliberation_round),
                    updated_at: Some(now),
                    terminal_at: terminal_at.map(Some),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;

        tracing::info!(session_id = %session.id, from = ?from, to = ?new_phase, "phase transitioned");
        self.run_escalation(&session).await?;
        Ok(session)
    }

    pub async fn handle_webhook_event(&self, event: WebhookEvent) -> Result<Option<Session>> {
        self.store
            .save_event(event.clone())
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;

        let route = self.router.read().await.route(&event);
        let Some(route) = route else {
            tracing::debug!(source = %event.source, event_type = %event.event_type, "no routing rule matched");
            return Ok(None);
        };

        let session = self
            .create_session(CreateSessionArgs {
                title: event.derived_title(),
                phase: Some(Phase::Investigation),
                lead_agent_id: Some(route.lead.clone()),
                consult_agent_ids: Some(route.consult.clone()),
                source_event_id: Some(event.id),
            })
            .await?;

        let council = self.council_snapshot().await;
        if let Some(lead_config) = council.agent(&route.lead) {
            let token = self.registry.generate_token(&route.lead).await?;
            self.registry.assign_session(&route.lead, session.id).await?;
            let task = SpawnTask {
                session_id: session.id,
                agent_config: lead_config.clone(),
                context: event.derived_title(),
                council_mcp_url: None,
                agent_token: token,
            };
            if let Err(err) = self.spawner.spawn(task).await {
                tracing::warn!(session_id = %session.id, error = %err, "spawn failed");
            }
        }

        Ok(Some(session))
    }

    pub async fn create_proposal(&self, session_id: Uuid, agent_id: &str, content: String) -> Result<Message> {
        let lock = self.locks.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let session = self.require_session(session_id).await?;
        if session.lead_agent_id != agent_id {
            return Err(CouncilError::NotAuthorized {
                agent: agent_id.to_string(),
                session: session_id,
            });
        }
        if !matches!(session.phase, Phase::Proposal | Phase::Investigation) {
            return Err(CouncilError::NotInPhase {
                expected: Phase::Proposal,
                actual: session.phase,
            });
        }

        let message = self
            .append_message(session_id, agent_id, None, MessageType::Proposal, content)
            .await?;
        self.transition_phase_locked(session_id, Phase::Discussion).await?;
        Ok(message)
    }

    pub async fn post_message(
        &self,
        session_id: Uuid,
        from_agent_id: &str,
        to_agent_id: Option<&str>,
        message_type: MessageType,
        content: String,
    ) -> Result<Message> {
        let lock = self.locks.lock_for(session_id).await;
        let _guard = lock.lock().await;
        self.append_message(session_id, from_agent_id, to_agent_id, message_type, content).await
    }

    async fn append_message(
        &self,
        session_id: Uuid,
        from_agent_id: &str,
        to_agent_id: Option<&str>,
        message_type: MessageType,
        content: String,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            session_id,
            from_agent_id: from_agent_id.to_string(),
            to_agent_id: to_agent_id.map(|s| s.to_string()),
            message_type,
            content,
            created_at: Utc::now(),
        };
        self.store
            .save_message(message.clone())
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;
        self.bus.publish(message.clone());
        Ok(message)
    }

    pub async fn cast_vote(&self, session_id: Uuid, agent_id: &str, value: VoteValue, reasoning: String) -> Result<Vote> {
        let lock = self.locks.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let session = self.require_session(session_id).await?;
        if session.phase != Phase::Voting {
            return Err(CouncilError::NotInPhase {
                expected: Phase::Voting,
                actual: session.phase,
            });
        }
        if !session.participants().contains(agent_id) {
            return Err(CouncilError::NotAuthorized {
                agent: agent_id.to_string(),
                session: session_id,
            });
        }

        let council = self.council_snapshot().await;
        let scheme = voting::scheme(council.rules.voting_scheme);
        if !scheme.valid_vote_values().contains(&value) {
            return Err(CouncilError::InvalidVoteValue {
                value: value.as_str().to_string(),
                scheme: format!("{:?}", council.rules.voting_scheme),
            });
        }

        let existing = self
            .store
            .get_votes(session_id)
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;
        if existing.iter().any(|v| v.agent_id == agent_id) {
            return Err(CouncilError::AlreadyVoted {
                session: session_id,
                agent: agent_id.to_string(),
            });
        }

        let vote = Vote {
            id: Uuid::new_v4(),
            session_id,
            agent_id: agent_id.to_string(),
            value,
            reasoning,
            created_at: Utc::now(),
        };
        self.store
            .save_vote(vote.clone())
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;
        tracing::info!(session_id = %session_id, agent_id = %agent_id, value = value.as_str(), "vote cast");

        let mut all_votes = existing;
        all_votes.push(vote.clone());
        let tally = scheme.tally(&all_votes, &council.agents, &council.rules);

        self.append_message(
            session_id,
            agent_id,
            None,
            MessageType::System,
            format!("tally update: {}", tally.summary),
        )
        .await?;

        self.last_tallies.write().await.insert(session_id, tally.clone());

        let expected_voters = session.participants().len();
        let all_voted = all_votes.len() >= expected_voters;

        // A met approval threshold, an advisory escalation, or a veto once
        // quorum is met are "already determined" per the requirements and
        // finalize without waiting for remaining voters; a bare rejection
        // (quorum met but threshold missed, no veto) only finalizes once
        // everyone expected has voted, otherwise the session loops back to
        // discussion for another round.
        let finalize_now = (tally.quorum_met && tally.veto_exercised)
            || matches!(tally.outcome, Some(Outcome::Approved) | Some(Outcome::Escalated))
            || (all_voted && tally.outcome != Some(Outcome::Rejected))
            || (all_voted && session.deliberation_round >= council.rules.max_deliberation_rounds);

        if finalize_now {
            let outcome = tally.outcome.unwrap_or(Outcome::NoConsensus);
            let decision_id = Uuid::new_v4();
            let decision = Decision {
                id: decision_id,
                session_id,
                outcome,
                tally: tally.snapshot(),
                human_reviewed_by: None,
                human_notes: None,
                veto_exercised: tally.veto_exercised,
                created_at: Utc::now(),
                finalized_at: None,
            };
            self.store
                .save_decision(decision)
                .await
                .map_err(|e| CouncilError::StoreError(e.to_string()))?;

            if council.rules.require_human_approval {
                self.transition_phase_locked(session_id, Phase::Review).await?;
            } else {
                let finalized = Utc::now();
                self.store
                    .update_decision(
                        decision_id,
                        DecisionPatch {
                            finalized_at: Some(Some(finalized)),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| CouncilError::StoreError(e.to_string()))?;
                self.transition_phase_locked(session_id, Phase::Decided).await?;
            }
        } else if all_voted && tally.outcome == Some(Outcome::Rejected) {
            // Everyone voted, threshold wasn't met, and another round is
            // allowed: go back to discussion rather than finalize a
            // rejection outright.
            self.transition_phase_locked(session_id, Phase::Discussion).await?;
        } else {
            // Still waiting on more ballots; no phase change, but a timeout
            // or other non-vote-count trigger may still fire.
            self.run_escalation(&session).await?;
        }

        Ok(vote)
    }

    pub async fn submit_review(
        &self,
        session_id: Uuid,
        decision_approved: bool,
        reviewer: String,
        notes: String,
    ) -> Result<Decision> {
        let lock = self.locks.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let session = self.require_session(session_id).await?;
        if session.phase != Phase::Review {
            return Err(CouncilError::NotInPhase {
                expected: Phase::Review,
                actual: session.phase,
            });
        }

        let decision = self
            .store
            .get_decision(session_id)
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?
            .ok_or_else(|| CouncilError::StoreError(format!("no decision for session {session_id}")))?;

        // The tally snapshot is preserved verbatim; only the outcome and
        // human-facing fields are overridden by the reviewer's call.
        let final_outcome = if decision_approved { Outcome::Approved } else { Outcome::Rejected };
        let finalized = Utc::now();
        self.store
            .update_decision(
                decision.id,
                DecisionPatch {
                    human_reviewed_by: Some(Some(reviewer.clone())),
                    human_notes: Some(Some(notes.clone())),
                    outcome: Some(final_outcome),
                    finalized_at: Some(Some(finalized)),
                },
            )
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;

        self.transition_phase_locked(session_id, Phase::Decided).await?;

        Ok(Decision {
            human_reviewed_by: Some(reviewer),
            human_notes: Some(notes),
            outcome: final_outcome,
            finalized_at: Some(finalized),
            ..decision
        })
    }

    pub async fn abort_session(&self, session_id: Uuid, reason: Option<String>) -> Result<Session> {
        let lock = self.locks.lock_for(session_id).await;
        let _guard = lock.lock().await;
        self.abort_session_locked(session_id, reason).await
    }

    /// Same as `abort_session` but assumes the per-session lock is already
    /// held by the caller (used when escalation fires an `abort` action from
    /// inside another locked operation).
    async fn abort_session_locked(&self, session_id: Uuid, reason: Option<String>) -> Result<Session> {
        let current = self.require_session(session_id).await?;
        if current.phase.is_terminal() {
            return Ok(current);
        }
        let session = self.transition_phase_locked(session_id, Phase::Aborted).await?;

        let existing = self
            .store
            .get_decision(session_id)
            .await
            .map_err(|e| CouncilError::StoreError(e.to_string()))?;
        let finalized = Utc::now();
        match existing {
            Some(decision) => {
                self.store
                    .update_decision(
                        decision.id,
                        DecisionPatch {
                            outcome: Some(Outcome::Aborted),
                            human_notes: Some(reason.clone()),
                            finalized_at: Some(Some(finalized)),
                        },
                    )
                    .await
                    .map_err(|e| CouncilError::StoreError(e.to_string()))?;
            }
            None => {
                let tally = self.last_tallies.read().await.get(&session_id).map(|t| t.snapshot()).unwrap_or_default();
                self.store
                    .save_decision(Decision {
                        id: Uuid::new_v4(),
                        session_id,
                        outcome: Outcome::Aborted,
                        tally,
                        human_reviewed_by: None,
                        human_notes: reason,
                        veto_exercised: false,
                        created_at: finalized,
                        finalized_at: Some(finalized),
                    })
                    .await
                    .map_err(|e| CouncilError::StoreError(e.to_string()))?;
            }
        }

        Ok(session)
    }

    /// Runs the escalation engine for `session` and applies whatever effects
    /// fire. Called after every vote cast and phase transition, per §4.5.
    async fn run_escalation(&self, session: &Session) -> Result<()> {
        let council = self.council_snapshot().await;
        if council.rules.escalation.is_empty() {
            return Ok(());
        }

        let last_tally = self.last_tallies.read().await.get(&session.id).cloned();
        let ctx = EscalationContext {
            session_id: session.id,
            phase: session.phase,
            deliberation_round: session.deliberation_round,
            max_deliberation_rounds: council.rules.max_deliberation_rounds,
            updated_at: session.updated_at,
            now: Utc::now(),
            last_tally: last_tally.as_ref(),
            expected_voters: session.participants().len(),
            votes_cast: self
                .store
                .get_votes(session.id)
                .await
                .map_err(|e| CouncilError::StoreError(e.to_string()))?
                .len(),
        };

        let mut counts_map = self.fire_counts.write().await;
        let counts = counts_map.entry(session.id).or_insert_with(FireCounts::new);
        let fired = escalation::evaluate(&council.rules.escalation, &ctx, counts);
        drop(counts_map);

        for effect in fired {
            self.apply_escalation_effect(session.id, effect.effect).await?;
        }
        Ok(())
    }

    async fn apply_escalation_effect(&self, session_id: Uuid, effect: EscalationEffect) -> Result<()> {
        match effect {
            EscalationEffect::ForceReview { message } => {
                let session = self.require_session(session_id).await?;
                if session.phase != Phase::Review && !session.phase.is_terminal() {
                    self.force_phase_locked(session_id, Phase::Review).await?;
                }
                let existing = self
                    .store
                    .get_decision(session_id)
                    .await
                    .map_err(|e| CouncilError::StoreError(e.to_string()))?;
                match existing {
                    Some(decision) => {
                        self.store
                            .update_decision(
                                decision.id,
                                DecisionPatch {
                                    human_notes: Some(message),
                                    ..Default::default()
                                },
                            )
                            .await
                            .map_err(|e| CouncilError::StoreError(e.to_string()))?;
                    }
                    None => {
                        let tally = self.last_tallies.read().await.get(&session_id).map(|t| t.snapshot()).unwrap_or_default();
                        self.store
                            .save_decision(Decision {
                                id: Uuid::new_v4(),
                                session_id,
                                outcome: Outcome::Escalated,
                                tally,
                                human_reviewed_by: None,
                                human_notes: message,
                                veto_exercised: false,
                                created_at: Utc::now(),
                                finalized_at: None,
                            })
                            .await
                            .map_err(|e| CouncilError::StoreError(e.to_string()))?;
                    }
                }
            }
            EscalationEffect::AddAgent { agent_id } => {
                let mut session = self.require_session(session_id).await?;
                if !session.consult_agent_ids.contains(&agent_id) && session.lead_agent_id != agent_id {
                    session.consult_agent_ids.push(agent_id.clone());
                    self.store
                        .update_session(
                            session_id,
                            SessionPatch {
                                consult_agent_ids: Some(session.consult_agent_ids.clone()),
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(|e| CouncilError::StoreError(e.to_string()))?;

                    let council = self.council_snapshot().await;
                    if let Some(agent_config) = council.agent(&agent_id) {
                        let token = self.registry.generate_token(&agent_id).await?;
                        self.registry.assign_session(&agent_id, session_id).await?;
                        let task = SpawnTask {
                            session_id,
                            agent_config: agent_config.clone(),
                            context: session.summary.clone(),
                            council_mcp_url: None,
                            agent_token: token,
                        };
                        if let Err(err) = self.spawner.spawn(task).await {
                            tracing::warn!(session_id = %session_id, error = %err, "escalation spawn failed");
                        }
                    }
                    self.append_message(
                        session_id,
                        "system",
                        None,
                        MessageType::System,
                        format!("agent {agent_id} added to session by escalation"),
                    )
                    .await?;
                }
            }
            EscalationEffect::NotifyExternal { webhook_url } => {
                let session = self.require_session(session_id).await?;
                if let Err(err) = self.notifier.notify(&webhook_url, &session).await {
                    tracing::warn!(session_id = %session_id, error = %err, "notify_external failed");
                }
            }
            EscalationEffect::Abort { reason } => {
                self.abort_session_locked(session_id, reason).await?;
            }
        }
        Ok(())
    }
}
