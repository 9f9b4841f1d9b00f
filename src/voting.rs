//! Voting schemes: weighted majority, unanimous, advisory. Each is a pure
//! function over ballots, the agent roster, and rules — no direct teacher
//! analog exists for weighted tallying, so this follows the nearest kin in
//! spirit: `tasks::reducer::reduce`'s pure, exhaustively-matched
//! state-transition discipline and its colocated test style.

use std::collections::HashMap;

use crate::model::{AgentConfig, Outcome, Rules, TallySnapshot, Vote, VoteValue, VotingScheme};

#[derive(Debug, Clone)]
pub struct TallyResult {
    pub outcome: Option<Outcome>,
    pub quorum_met: bool,
    pub threshold_met: bool,
    pub veto_exercised: bool,
    pub approve: f64,
    pub reject: f64,
    pub abstain: f64,
    pub total_weight: f64,
    pub summary: String,
}

impl TallyResult {
    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            approve: self.approve,
            reject: self.reject,
            abstain: self.abstain,
            total_weight: self.total_weight,
            quorum_met: self.quorum_met,
            threshold_met: self.threshold_met,
            veto_exercised: self.veto_exercised,
        }
    }
}

struct Accumulated {
    approve: f64,
    reject: f64,
    abstain: f64,
    veto_exercised: bool,
    quorum_met: bool,
}

fn accumulate(ballots: &[Vote], agents: &[AgentConfig], rules: &Rules) -> Accumulated {
    let by_id: HashMap<&str, &AgentConfig> = agents.iter().map(|a| (a.id.as_str(), a)).collect();
    let mut approve = 0.0;
    let mut reject = 0.0;
    let mut abstain = 0.0;
    let mut veto_exercised = false;

    for ballot in ballots {
        let agent = by_id.get(ballot.agent_id.as_str());
        let weight = agent.map(|a| a.voting_weight as f64).unwrap_or(1.0);
        match ballot.value {
            VoteValue::Approve => approve += weight,
            VoteValue::Reject => {
                reject += weight;
                if agent.map(|a| a.can_veto).unwrap_or(false) {
                    veto_exercised = true;
                }
            }
            VoteValue::Abstain => abstain += weight,
        }
    }

    Accumulated {
        approve,
        reject,
        abstain,
        veto_exercised,
        quorum_met: ballots.len() as u32 >= rules.quorum,
    }
}

/// Shared contract for the three voting schemes. Every implementation is a
/// pure function of its inputs.
pub trait VotingSchemeImpl {
    fn valid_vote_values(&self) -> &'static [VoteValue];
    fn tally(&self, ballots: &[Vote], agents: &[AgentConfig], rules: &Rules) -> TallyResult;
}

pub struct WeightedMajority;

impl VotingSchemeImpl for WeightedMajority {
    fn valid_vote_values(&self) -> &'static [VoteValue] {
        &[VoteValue::Approve, VoteValue::Reject, VoteValue::Abstain]
    }

    fn tally(&self, ballots: &[Vote], agents: &[AgentConfig], rules: &Rules) -> TallyResult {
        let acc = accumulate(ballots, agents, rules);
        let voting_weight = acc.approve + acc.reject;
        let threshold_met = voting_weight > 0.0 && acc.approve / voting_weight >= rules.voting_threshold;

        let outcome = if !acc.quorum_met {
            None
        } else if acc.veto_exercised {
            Some(Outcome::Rejected)
        } else if threshold_met {
            Some(Outcome::Approved)
        } else {
            Some(Outcome::Rejected)
        };

        let summary = match outcome {
            None => format!("quorum not met ({} ballots, need {})", ballots.len(), rules.quorum),
            Some(Outcome::Approved) => format!(
                "approved: {:.1}/{:.1} ({:.0}%) meets threshold {:.0}%",
                acc.approve,
                voting_weight,
                percent(acc.approve, voting_weight),
                rules.voting_threshold * 100.0
            ),
            Some(Outcome::Rejected) if acc.veto_exercised => "rejected: veto exercised".to_string(),
            Some(Outcome::Rejected) => format!(
                "rejected: {:.1}/{:.1} ({:.0}%) below threshold {:.0}%",
                acc.approve,
                voting_weight,
                percent(acc.approve, voting_weight),
                rules.voting_threshold * 100.0
            ),
            Some(other) => format!("{other:?}"),
        };

        TallyResult {
            outcome,
            quorum_met: acc.quorum_met,
            threshold_met,
            veto_exercised: acc.veto_exercised,
            approve: acc.approve,
            reject: acc.reject,
            abstain: acc.abstain,
            total_weight: acc.approve + acc.reject + acc.abstain,
            summary,
        }
    }
}

pub struct Unanimous;

impl VotingSchemeImpl for Unanimous {
    fn valid_vote_values(&self) -> &'static [VoteValue] {
        &[VoteValue::Approve, VoteValue::Reject, VoteValue::Abstain]
    }

    fn tally(&self, ballots: &[Vote], agents: &[AgentConfig], rules: &Rules) -> TallyResult {
        let acc = accumulate(ballots, agents, rules);
        let non_abstaining: Vec<&Vote> = ballots.iter().filter(|v| v.value != VoteValue::Abstain).collect();
        let threshold_met =
            !non_abstaining.is_empty() && non_abstaining.iter().all(|v| v.value == VoteValue::Approve);

        let outcome = if !acc.quorum_met {
            None
        } else if threshold_met {
            Some(Outcome::Approved)
        } else {
            Some(Outcome::Rejected)
        };

        let summary = match outcome {
            None => format!("quorum not met ({} ballots, need {})", ballots.len(), rules.quorum),
            Some(Outcome::Approved) => "approved: unanimous".to_string(),
            Some(Outcome::Rejected) => "rejected: not unanimous".to_string(),
            Some(other) => format!("{other:?}"),
        };

        TallyResult {
            outcome,
            quorum_met: acc.quorum_met,
            threshold_met,
            veto_exercised: acc.veto_exercised,
            approve: acc.approve,
            reject: acc.reject,
            abstain: acc.abstain,
            total_weight: acc.approve + acc.reject + acc.abstain,
            summary,
        }
    }
}

pub struct Advisory;

impl VotingSchemeImpl for Advisory {
    fn valid_vote_values(&self) -> &'static [VoteValue] {
        &[VoteValue::Approve, VoteValue::Reject, VoteValue::Abstain]
    }

    fn tally(&self, ballots: &[Vote], agents: &[AgentConfig], rules: &Rules) -> TallyResult {
        let mut result = WeightedMajority.tally(ballots, agents, rules);
        result.outcome = Some(Outcome::Escalated);
        result.summary = format!("Advisory (non-binding): {}", result.summary);
        result
    }
}

pub fn scheme(kind: VotingScheme) -> Box<dyn VotingSchemeImpl + Send + Sync> {
    match kind {
        VotingScheme::WeightedMajority => Box::new(WeightedMajority),
        VotingScheme::Unanimous => Box::new(Unanimous),
        VotingScheme::Advisory => Box::new(Advisory),
    }
}

fn percent(n: f64, d: f64) -> f64 {
    if d == 0.0 {
        0.0
    } else {
        (n / d) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn agent(id: &str, weight: u32, can_veto: bool) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            name: id.to_string(),
            role: "role".to_string(),
            expertise: vec![],
            can_propose: true,
            can_veto,
            voting_weight: weight,
            system_prompt: String::new(),
            model: None,
            persistent: false,
        }
    }

    fn ballot(session: Uuid, agent_id: &str, value: VoteValue) -> Vote {
        Vote {
            id: Uuid::new_v4(),
            session_id: session,
            agent_id: agent_id.to_string(),
            value,
            reasoning: String::new(),
            created_at: Utc::now(),
        }
    }

    fn rules(quorum: u32, threshold: f64) -> Rules {
        Rules {
            quorum,
            voting_threshold: threshold,
            max_deliberation_rounds: 3,
            require_human_approval: false,
            voting_scheme: VotingScheme::WeightedMajority,
            escalation: vec![],
        }
    }

    #[test]
    fn weighted_majority_approves_above_threshold() {
        let session = Uuid::new_v4();
        let agents = vec![agent("cto", 1, false), agent("cpo", 1, false)];
        let ballots = vec![
            ballot(session, "cto", VoteValue::Approve),
            ballot(session, "cpo", VoteValue::Approve),
        ];
        let result = WeightedMajority.tally(&ballots, &agents, &rules(2, 0.66));
        assert_eq!(result.outcome, Some(Outcome::Approved));
    }

    #[test]
    fn weighted_majority_veto_forces_rejection() {
        let session = Uuid::new_v4();
        let agents = vec![agent("cto", 1, true), agent("cpo", 1, false)];
        let ballots = vec![
            ballot(session, "cto", VoteValue::Reject),
            ballot(session, "cpo", VoteValue::Approve),
        ];
        let result = WeightedMajority.tally(&ballots, &agents, &rules(2, 0.5));
        assert!(result.veto_exercised);
        assert_eq!(result.outcome, Some(Outcome::Rejected));
    }

    #[test]
    fn weighted_majority_quorum_unmet_is_none() {
        let session = Uuid::new_v4();
        let agents = vec![agent("cto", 1, false), agent("cpo", 1, false)];
        let ballots = vec![ballot(session, "cto", VoteValue::Approve)];
        let result = WeightedMajority.tally(&ballots, &agents, &rules(2, 0.5));
        assert_eq!(result.outcome, None);
        assert!(!result.quorum_met);
    }

    #[test]
    fn unanimous_allows_abstain() {
        let session = Uuid::new_v4();
        let agents = vec![agent("a", 1, false), agent("b", 1, false), agent("c", 1, false)];
        let ballots = vec![
            ballot(session, "a", VoteValue::Approve),
            ballot(session, "b", VoteValue::Approve),
            ballot(session, "c", VoteValue::Abstain),
        ];
        let result = Unanimous.tally(&ballots, &agents, &rules(3, 1.0));
        assert_eq!(result.outcome, Some(Outcome::Approved));
    }

    #[test]
    fn unanimous_one_reject_fails() {
        let session = Uuid::new_v4();
        let agents = vec![agent("a", 1, false), agent("b", 1, false), agent("c", 1, false)];
        let ballots = vec![
            ballot(session, "a", VoteValue::Approve),
            ballot(session, "b", VoteValue::Reject),
            ballot(session, "c", VoteValue::Abstain),
        ];
        let result = Unanimous.tally(&ballots, &agents, &rules(3, 1.0));
        assert_eq!(result.outcome, Some(Outcome::Rejected));
    }

    #[test]
    fn advisory_always_escalates() {
        let session = Uuid::new_v4();
        let agents = vec![agent("cto", 1, false)];
        let ballots = vec![ballot(session, "cto", VoteValue::Approve)];
        let result = Advisory.tally(&ballots, &agents, &rules(1, 0.5));
        assert_eq!(result.outcome, Some(Outcome::Escalated));
        assert!(result.summary.starts_with("Advisory (non-binding)"));
    }

    #[test]
    fn zero_ballots_never_divides_by_zero() {
        let agents: Vec<AgentConfig> = vec![];
        let result = WeightedMajority.tally(&[], &agents, &rules(1, 0.5));
        assert!(!result.threshold_met);
        assert_eq!(result.outcome, None);
    }
}
