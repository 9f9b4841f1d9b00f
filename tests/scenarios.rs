//! Integration tests exercising the concrete scenarios from the council
//! engine's requirements: happy approval, veto, webhook routing, duplicate
//! vote rejection, unanimous failure, and communication-graph policy.

use std::sync::Arc;

use chrono::Utc;
use council_engine::{
    AgentConfig, CommunicationGraph, Council, CouncilError, EscalationAction, EscalationRule, EscalationTrigger,
    EventRoutingRule, InMemoryStore, LogSpawner, MessageType, NullNotifier, Outcome, Phase, Rules, SessionOrchestrator,
    VoteValue, VotingScheme, WebhookEvent,
};
use council_engine::model::{EventAssignment, EventMatch};
use council_engine::orchestrator::CreateSessionArgs;
use serde_json::json;
use uuid::Uuid;

fn agent(id: &str, voting_weight: u32, can_veto: bool) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        name: id.to_string(),
        role: "executive".to_string(),
        expertise: vec![],
        can_propose: true,
        can_veto,
        voting_weight,
        system_prompt: String::new(),
        model: None,
        persistent: false,
    }
}

fn two_agent_council(require_human_approval: bool) -> Council {
    Council {
        id: "eng".to_string(),
        name: "Engineering Council".to_string(),
        description: None,
        rules: Rules {
            quorum: 2,
            voting_threshold: 0.66,
            max_deliberation_rounds: 3,
            require_human_approval,
            voting_scheme: VotingScheme::WeightedMajority,
            escalation: vec![],
        },
        agents: vec![agent("cto", 1, true), agent("cpo", 1, false)],
        communication_graph: CommunicationGraph::default(),
        event_routing: vec![],
        spawner: Default::default(),
    }
}

fn orchestrator(council: Council) -> SessionOrchestrator {
    SessionOrchestrator::new(
        council,
        Arc::new(InMemoryStore::new()),
        Arc::new(LogSpawner),
        Arc::new(NullNotifier),
    )
}

#[tokio::test]
async fn happy_approval_reaches_decided_with_reviewer_recorded() {
    let orch = orchestrator(two_agent_council(true));

    let session = orch
        .create_session(CreateSessionArgs {
            title: "Adopt new deploy pipeline".to_string(),
            phase: Some(Phase::Proposal),
            lead_agent_id: Some("cto".to_string()),
            consult_agent_ids: Some(vec!["cpo".to_string()]),
            source_event_id: None,
        })
        .await
        .unwrap();

    orch.create_proposal(session.id, "cto", "Let's migrate to the new pipeline".to_string())
        .await
        .unwrap();
    orch.transition_phase(session.id, Phase::Voting).await.unwrap();

    orch.cast_vote(session.id, "cto", VoteValue::Approve, "looks good".to_string())
        .await
        .unwrap();
    orch.cast_vote(session.id, "cpo", VoteValue::Approve, "agreed".to_string())
        .await
        .unwrap();

    let session = orch.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.phase, Phase::Review);

    let decision = orch
        .submit_review(session.id, true, "admin".to_string(), "ship it".to_string())
        .await
        .unwrap();
    assert_eq!(decision.outcome, Outcome::Approved);
    assert_eq!(decision.human_reviewed_by.as_deref(), Some("admin"));

    let session = orch.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.phase, Phase::Decided);
}

#[tokio::test]
async fn veto_forces_rejection() {
    let orch = orchestrator(two_agent_council(false));

    let session = orch
        .create_session(CreateSessionArgs {
            title: "Risky migration".to_string(),
            phase: Some(Phase::Voting),
            lead_agent_id: Some("cto".to_string()),
            consult_agent_ids: Some(vec!["cpo".to_string()]),
            source_event_id: None,
        })
        .await
        .unwrap();

    orch.cast_vote(session.id, "cto", VoteValue::Reject, "too risky".to_string())
        .await
        .unwrap();
    orch.cast_vote(session.id, "cpo", VoteValue::Approve, "worth it".to_string())
        .await
        .unwrap();

    let session = orch.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.phase, Phase::Decided);
}

#[tokio::test]
async fn webhook_routed_by_label_creates_investigation_session() {
    let mut council = two_agent_council(true);
    council.event_routing = vec![EventRoutingRule {
        name: Some("bug-triage".to_string()),
        match_: EventMatch {
            source: "github".to_string(),
            event_type: Some("issues.opened".to_string()),
            labels: vec!["bug".to_string()],
        },
        assign: EventAssignment {
            lead: "cto".to_string(),
            consult: vec!["cpo".to_string()],
        },
    }];
    let orch = orchestrator(council);

    let bug_event = WebhookEvent {
        id: Uuid::new_v4(),
        source: "github".to_string(),
        event_type: "issues.opened".to_string(),
        payload: json!({"issue": {"title": "Crash on startup", "labels": [{"name": "bug"}]}}),
        received_at: Utc::now(),
    };
    let session = orch.handle_webhook_event(bug_event).await.unwrap();
    let session = session.expect("bug-labeled event should route");
    assert_eq!(session.phase, Phase::Investigation);
    assert_eq!(session.lead_agent_id, "cto");
    assert_eq!(session.title, "Crash on startup");

    let feature_event = WebhookEvent {
        id: Uuid::new_v4(),
        source: "github".to_string(),
        event_type: "issues.opened".to_string(),
        payload: json!({"issue": {"title": "Add dark mode", "labels": [{"name": "feature"}]}}),
        received_at: Utc::now(),
    };
    assert!(orch.handle_webhook_event(feature_event).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_vote_is_rejected() {
    let orch = orchestrator(two_agent_council(false));
    let session = orch
        .create_session(CreateSessionArgs {
            title: "Something".to_string(),
            phase: Some(Phase::Voting),
            lead_agent_id: Some("cto".to_string()),
            consult_agent_ids: Some(vec!["cpo".to_string()]),
            source_event_id: None,
        })
        .await
        .unwrap();

    orch.cast_vote(session.id, "cto", VoteValue::Approve, "ok".to_string())
        .await
        .unwrap();
    let err = orch
        .cast_vote(session.id, "cto", VoteValue::Reject, "changed my mind".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, CouncilError::AlreadyVoted { .. }));
}

#[tokio::test]
async fn unanimous_scheme_allows_abstain_but_not_reject() {
    let mut council = two_agent_council(false);
    council.rules.voting_scheme = VotingScheme::Unanimous;
    council.rules.quorum = 3;
    council.agents.push(agent("cfo", 1, false));
    let orch = orchestrator(council);

    let session = orch
        .create_session(CreateSessionArgs {
            title: "Budget approval".to_string(),
            phase: Some(Phase::Voting),
            lead_agent_id: Some("cto".to_string()),
            consult_agent_ids: Some(vec!["cpo".to_string(), "cfo".to_string()]),
            source_event_id: None,
        })
        .await
        .unwrap();

    orch.cast_vote(session.id, "cto", VoteValue::Approve, String::new()).await.unwrap();
    orch.cast_vote(session.id, "cpo", VoteValue::Approve, String::new()).await.unwrap();
    orch.cast_vote(session.id, "cfo", VoteValue::Abstain, String::new()).await.unwrap();

    let session = orch.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.phase, Phase::Decided);
}

#[tokio::test]
async fn timeout_sweep_escalates_stale_session_without_a_new_event() {
    let mut council = two_agent_council(false);
    council.rules.escalation = vec![EscalationRule {
        name: "stale-discussion".to_string(),
        priority: 100,
        trigger: EscalationTrigger::Timeout {
            timeout_seconds: 0,
            phases: vec![Phase::Discussion],
        },
        action: EscalationAction::EscalateToHuman {
            message: Some("discussion stalled".to_string()),
        },
        stop_after: false,
        max_fires_per_session: 1,
    }];
    let orch = orchestrator(council);

    let session = orch
        .create_session(CreateSessionArgs {
            title: "Stuck discussion".to_string(),
            phase: Some(Phase::Discussion),
            lead_agent_id: Some("cto".to_string()),
            consult_agent_ids: Some(vec!["cpo".to_string()]),
            source_event_id: None,
        })
        .await
        .unwrap();

    orch.run_timeout_sweep().await.unwrap();

    let session = orch.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.phase, Phase::Review);
}

#[tokio::test]
async fn graph_policy_filters_message_delivery() {
    let mut council = two_agent_council(false);
    council.communication_graph.default_policy = council_engine::model::GraphPolicy::Graph;
    let mut edges = std::collections::HashMap::new();
    edges.insert("cto".to_string(), ["cpo".to_string()].into_iter().collect());
    council.communication_graph.edges = edges;
    let orch = orchestrator(council);

    assert!(orch.bus().can_communicate("cto", "cpo"));
    assert!(!orch.bus().can_communicate("cpo", "cto"));

    let session = orch
        .create_session(CreateSessionArgs {
            title: "Graph test".to_string(),
            phase: Some(Phase::Discussion),
            lead_agent_id: Some("cto".to_string()),
            consult_agent_ids: Some(vec!["cpo".to_string()]),
            source_event_id: None,
        })
        .await
        .unwrap();

    let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let r = received.clone();
    orch.bus().subscribe("cpo", move |_| {
        r.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    orch.post_message(session.id, "cto", None, MessageType::Discussion, "hello cpo".to_string())
        .await
        .unwrap();
    assert_eq!(received.load(std::sync::atomic::Ordering::SeqCst), 1);
}
