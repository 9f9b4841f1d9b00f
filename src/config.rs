//! Council configuration: YAML parsing, `${NAME}` environment expansion, and
//! schema validation. No file I/O — callers hand us the file contents.
//!
//! Layered-override shape (file value, falling back to schema defaults)
//! mirrors the teacher daemon's `DaemonConfig`/`TomlConfig`, minus the
//! CLI/env precedence chain this crate has no use for.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{ConfigIssue, CouncilError};
use crate::model::{
    AgentConfig, CommunicationGraph, Council, EscalationAction, EscalationRule,
    EscalationTrigger, EventRoutingRule, Rules, SpawnerConfig, SpawnerKind, VotingScheme,
};

/// Top-level shape of the accepted YAML document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    version: String,
    council: RawCouncil,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCouncil {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    spawner: SpawnerConfig,
    rules: RawRules,
    agents: Vec<AgentConfig>,
    #[serde(default)]
    communication_graph: CommunicationGraph,
    #[serde(default)]
    event_routing: Vec<EventRoutingRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRules {
    quorum: u32,
    voting_threshold: f64,
    #[serde(default)]
    voting_scheme: VotingScheme,
    #[serde(default)]
    max_deliberation_rounds: u32,
    #[serde(default)]
    require_human_approval: bool,
    #[serde(default)]
    escalation: Vec<RawEscalationEntry>,
}

/// Accepts both the current `{name, priority, trigger, action, stop_after,
/// max_fires_per_session}` shape (rejects unknown fields via `EscalationRule`
/// itself) and the legacy `{condition, action}` shape.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEscalationEntry {
    Current(EscalationRule),
    #[serde(deny_unknown_fields)]
    Legacy {
        condition: String,
        action: String,
    },
}

/// Expands `${NAME}` references in every string value of the document before
/// YAML parsing. Missing variables expand to the empty string, per spec.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = raw[i + 2..].find('}') {
                let name = &raw[i + 2..i + 2 + end];
                let value = std::env::var(name).unwrap_or_default();
                out.push_str(&value);
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = raw[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn legacy_trigger(condition: &str) -> Option<EscalationTrigger> {
    match condition {
        "deadlock" => Some(EscalationTrigger::Deadlock),
        "veto_exercised" => Some(EscalationTrigger::VetoExercised),
        "no_quorum" => Some(EscalationTrigger::NoQuorum),
        "round_limit" => Some(EscalationTrigger::RoundLimit),
        _ => None,
    }
}

fn legacy_action(action: &str) -> Option<EscalationAction> {
    match action {
        "escalate_to_human" => Some(EscalationAction::EscalateToHuman { message: None }),
        "abort" => Some(EscalationAction::Abort { reason: None }),
        _ => None,
    }
}

fn resolve_escalation(
    entries: Vec<RawEscalationEntry>,
    issues: &mut Vec<ConfigIssue>,
) -> Vec<EscalationRule> {
    let mut rules = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        match entry {
            RawEscalationEntry::Current(rule) => rules.push(rule),
            RawEscalationEntry::Legacy { condition, action } => {
                let trigger = legacy_trigger(&condition);
                let action = legacy_action(&action);
                match (trigger, action) {
                    (Some(trigger), Some(action)) => {
                        tracing::warn!(condition = %condition, "upgrading legacy escalation rule");
                        rules.push(EscalationRule {
                            name: format!("legacy_{condition}"),
                            priority: 100,
                            trigger,
                            action,
                            stop_after: false,
                            max_fires_per_session: 1,
                        });
                    }
                    _ => issues.push(ConfigIssue::new(
                        format!("council.rules.escalation[{idx}]"),
                        format!("unrecognized legacy escalation condition/action: {condition}"),
                    )),
                }
            }
        }
    }
    rules
}

/// Parses and validates a Council configuration from a YAML document.
///
/// Performs `${NAME}` expansion, legacy escalation upgrade, and full schema
/// validation (invariants from the data model). Returns every problem found,
/// not just the first.
pub fn parse_council(yaml: &str) -> Result<Council, CouncilError> {
    let expanded = expand_env(yaml);

    let raw: RawFile = serde_yaml::from_str(&expanded)
        .map_err(|e| CouncilError::ConfigLoad(vec![ConfigIssue::new("$", e.to_string())]))?;

    let mut issues = Vec::new();

    if raw.version != "1" {
        issues.push(ConfigIssue::new(
            "version",
            format!("unsupported version {:?}, expected \"1\"", raw.version),
        ));
    }

    let escalation = resolve_escalation(raw.council.rules.escalation, &mut issues);

    if raw.council.rules.quorum == 0 {
        issues.push(ConfigIssue::new(
            "council.rules.quorum",
            "must be >= 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&raw.council.rules.voting_threshold) {
        issues.push(ConfigIssue::new(
            "council.rules.voting_threshold",
            "must be within [0, 1]".to_string(),
        ));
    }
    if raw.council.agents.is_empty() {
        issues.push(ConfigIssue::new("council.agents", "must be non-empty".to_string()));
    }

    let agent_ids: HashMap<&str, &AgentConfig> =
        raw.council.agents.iter().map(|a| (a.id.as_str(), a)).collect();
    if agent_ids.len() != raw.council.agents.len() {
        issues.push(ConfigIssue::new("council.agents", "duplicate agent id".to_string()));
    }

    for (idx, rule) in raw.council.event_routing.iter().enumerate() {
        if !agent_ids.contains_key(rule.assign.lead.as_str()) {
            issues.push(ConfigIssue::new(
                format!("council.event_routing[{idx}].assign.lead"),
                format!("unknown agent id {:?}", rule.assign.lead),
            ));
        }
        if rule.assign.consult.contains(&rule.assign.lead) {
            issues.push(ConfigIssue::new(
                format!("council.event_routing[{idx}].assign"),
                "lead must not also appear in consult".to_string(),
            ));
        }
        for consult in &rule.assign.consult {
            if !agent_ids.contains_key(consult.as_str()) {
                issues.push(ConfigIssue::new(
                    format!("council.event_routing[{idx}].assign.consult"),
                    format!("unknown agent id {consult:?}"),
                ));
            }
        }
    }

    for (agent_id, peers) in &raw.council.communication_graph.edges {
        if !agent_ids.contains_key(agent_id.as_str()) {
            issues.push(ConfigIssue::new(
                format!("council.communication_graph.edges[{agent_id}]"),
                "unknown source agent id".to_string(),
            ));
        }
        for peer in peers {
            if !agent_ids.contains_key(peer.as_str()) {
                issues.push(ConfigIssue::new(
                    format!("council.communication_graph.edges[{agent_id}]"),
                    format!("unknown target agent id {peer:?}"),
                ));
            }
        }
    }

    for (idx, rule) in escalation.iter().enumerate() {
        if let EscalationAction::AddAgent { agent_id } = &rule.action {
            if !agent_ids.contains_key(agent_id.as_str()) {
                issues.push(ConfigIssue::new(
                    format!("council.rules.escalation[{idx}].action.agent_id"),
                    format!("unknown agent id {agent_id:?}"),
                ));
            }
        }
    }

    if !issues.is_empty() {
        return Err(CouncilError::ConfigLoad(issues));
    }

    Ok(Council {
        id: slugify(&raw.council.name),
        name: raw.council.name,
        description: raw.council.description,
        rules: Rules {
            quorum: raw.council.rules.quorum,
            voting_threshold: raw.council.rules.voting_threshold,
            max_deliberation_rounds: raw.council.rules.max_deliberation_rounds,
            require_human_approval: raw.council.rules.require_human_approval,
            voting_scheme: raw.council.rules.voting_scheme,
            escalation,
        },
        agents: raw.council.agents,
        communication_graph: raw.council.communication_graph,
        event_routing: raw.council.event_routing,
        spawner: raw.council.spawner,
    })
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
version: "1"
council:
  name: Engineering Council
  rules:
    quorum: 2
    voting_threshold: 0.66
    require_human_approval: true
  agents:
    - id: cto
      name: CTO
      role: executive
      can_propose: true
      can_veto: true
    - id: cpo
      name: CPO
      role: executive
"#;

    #[test]
    fn parses_minimal_council() {
        let council = parse_council(BASE).expect("should parse");
        assert_eq!(council.agents.len(), 2);
        assert_eq!(council.rules.quorum, 2);
        assert_eq!(council.rules.voting_scheme, VotingScheme::WeightedMajority);
    }

    #[test]
    fn rejects_bad_threshold() {
        let yaml = BASE.replace("0.66", "4.0");
        let err = parse_council(&yaml).unwrap_err();
        match err {
            CouncilError::ConfigLoad(issues) => {
                assert!(issues.iter().any(|i| i.path.contains("voting_threshold")));
            }
            other => panic!("expected ConfigLoad, got {other:?}"),
        }
    }

    #[test]
    fn expands_env_vars() {
        std::env::set_var("COUNCIL_TEST_WEBHOOK", "https://example.test/hook");
        let yaml = format!(
            "{}\n  spawner:\n    type: webhook\n    webhook_url: \"${{COUNCIL_TEST_WEBHOOK}}\"\n",
            BASE.trim_end()
        );
        let council = parse_council(&yaml).expect("should parse");
        assert_eq!(council.spawner.spawner_type, SpawnerKind::Webhook);
        assert_eq!(
            council.spawner.webhook_url.as_deref(),
            Some("https://example.test/hook")
        );
    }

    #[test]
    fn missing_env_var_expands_to_empty() {
        std::env::remove_var("COUNCIL_TEST_MISSING");
        let yaml = format!(
            "{}\n  spawner:\n    type: webhook\n    webhook_url: \"${{COUNCIL_TEST_MISSING}}\"\n",
            BASE.trim_end()
        );
        let council = parse_council(&yaml).expect("should parse");
        assert_eq!(council.spawner.webhook_url.as_deref(), Some(""));
    }

    #[test]
    fn upgrades_legacy_escalation() {
        let yaml = r#"
version: "1"
council:
  name: Engineering Council
  rules:
    quorum: 2
    voting_threshold: 0.66
    require_human_approval: true
    escalation:
      - condition: deadlock
        action: escalate_to_human
  agents:
    - id: cto
      name: CTO
      role: executive
      can_propose: true
      can_veto: true
    - id: cpo
      name: CPO
      role: executive
"#;
        let council = parse_council(yaml).expect("should parse");
        assert_eq!(council.rules.escalation.len(), 1);
        assert_eq!(council.rules.escalation[0].name, "legacy_deadlock");
    }

    #[test]
    fn rejects_unknown_lead_in_routing() {
        let yaml = format!(
            "{}\n  event_routing:\n    - match: {{ source: github }}\n      assign: {{ lead: ghost }}\n",
            BASE.trim_end()
        );
        let err = parse_council(&yaml).unwrap_err();
        match err {
            CouncilError::ConfigLoad(issues) => {
                assert!(issues.iter().any(|i| i.message.contains("ghost")));
            }
            other => panic!("expected ConfigLoad, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let yaml = format!("{}\n  nickname: Eng\n", BASE.trim_end());
        let err = parse_council(&yaml).unwrap_err();
        assert!(matches!(err, CouncilError::ConfigLoad(_)));
    }

    #[test]
    fn rejects_unknown_rules_key() {
        let yaml = BASE.replace("quorum: 2", "quorum: 2\n    quoroom: 2");
        let err = parse_council(&yaml).unwrap_err();
        assert!(matches!(err, CouncilError::ConfigLoad(_)));
    }
}
