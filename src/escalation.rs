//! Escalation engine: declarative, priority-ordered rule evaluation run
//! after every state-changing event on a session. Grounded on the teacher's
//! `policy::risk::RiskDatabase` (declarative rule table, defensive default
//! for unmapped input) for the lookup shape, and `scheduler::queue::SchedulerQueue`
//! for deterministic priority-then-order iteration.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{EscalationAction, EscalationRule, EscalationTrigger, Phase};
use crate::voting::TallyResult;

/// Everything the engine needs to know about a session to evaluate triggers,
/// gathered by the orchestrator before each evaluation pass.
pub struct EscalationContext<'a> {
    pub session_id: Uuid,
    pub phase: Phase,
    pub deliberation_round: u32,
    pub max_deliberation_rounds: u32,
    pub updated_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub last_tally: Option<&'a TallyResult>,
    pub expected_voters: usize,
    pub votes_cast: usize,
}

fn trigger_fires(trigger: &EscalationTrigger, ctx: &EscalationContext<'_>) -> bool {
    match trigger {
        EscalationTrigger::Deadlock => {
            ctx.phase == Phase::Voting
                && ctx.last_tally.map(|t| t.quorum_met).unwrap_or(false)
                && ctx
                    .last_tally
                    .map(|t| t.outcome.is_none() || !t.threshold_met)
                    .unwrap_or(false)
                && ctx.deliberation_round >= ctx.max_deliberation_rounds
        }
        EscalationTrigger::Timeout { timeout_seconds, phases } => {
            let elapsed = (ctx.now - ctx.updated_at).num_seconds();
            let phase_matches = phases.is_empty() || phases.contains(&ctx.phase);
            elapsed >= *timeout_seconds && phase_matches
        }
        EscalationTrigger::VetoExercised => ctx.last_tally.map(|t| t.veto_exercised).unwrap_or(false),
        EscalationTrigger::NoQuorum => {
            ctx.phase == Phase::Voting
                && ctx.last_tally.map(|t| !t.quorum_met).unwrap_or(false)
                && ctx.votes_cast >= ctx.expected_voters
        }
        EscalationTrigger::RoundLimit => ctx.deliberation_round >= ctx.max_deliberation_rounds,
    }
}

/// Actions the orchestrator must carry out in response to a fired rule. The
/// engine itself never mutates session state or touches collaborators — it
/// only decides what should happen, mirroring the teacher's preference for
/// pure decision functions with the side effects applied by the caller.
#[derive(Debug, Clone)]
pub enum EscalationEffect {
    ForceReview { message: Option<String> },
    AddAgent { agent_id: String },
    NotifyExternal { webhook_url: String },
    Abort { reason: Option<String> },
}

pub struct Fired {
    pub rule_name: String,
    pub effect: EscalationEffect,
    pub stop_after: bool,
}

/// Per-session fire counters, keyed by rule name. The orchestrator owns one
/// of these per session and passes it in by `&mut` on each evaluation.
#[derive(Debug, Default, Clone)]
pub struct FireCounts(HashMap<String, u32>);

impl FireCounts {
    pub fn new() -> Self {
        Self::default()
    }

    fn count(&self, rule_name: &str) -> u32 {
        *self.0.get(rule_name).unwrap_or(&0)
    }

    fn record(&mut self, rule_name: &str) {
        *self.0.entry(rule_name.to_string()).or_insert(0) += 1;
    }
}

/// Evaluates `rules` (sorted by `(priority asc, declared order)`) against
/// `ctx`, returning every rule that fired in evaluation order. Stops early
/// at the first rule with `stop_after = true`.
pub fn evaluate(rules: &[EscalationRule], ctx: &EscalationContext<'_>, counts: &mut FireCounts) -> Vec<Fired> {
    let mut ordered: Vec<(usize, &EscalationRule)> = rules.iter().enumerate().collect();
    ordered.sort_by_key(|(idx, rule)| (rule.priority, *idx));

    let mut fired = Vec::new();
    for (_, rule) in ordered {
        if counts.count(&rule.name) >= rule.max_fires_per_session {
            continue;
        }
        if !trigger_fires(&rule.trigger, ctx) {
            continue;
        }

        tracing::info!(session_id = %ctx.session_id, rule = %rule.name, "escalation rule fired");
        counts.record(&rule.name);
        let effect = match &rule.action {
            EscalationAction::EscalateToHuman { message } => EscalationEffect::ForceReview {
                message: message.clone(),
            },
            EscalationAction::AddAgent { agent_id } => EscalationEffect::AddAgent {
                agent_id: agent_id.clone(),
            },
            EscalationAction::NotifyExternal { webhook_url } => EscalationEffect::NotifyExternal {
                webhook_url: webhook_url.clone(),
            },
            EscalationAction::Abort { reason } => EscalationEffect::Abort {
                reason: reason.clone(),
            },
        };
        let stop_after = rule.stop_after;
        fired.push(Fired {
            rule_name: rule.name.clone(),
            effect,
            stop_after,
        });
        if stop_after {
            break;
        }
    }
    fired
}
