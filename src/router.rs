//! Event routing: matches an incoming webhook event to a lead/consult
//! assignment. Pure, no I/O — grounded on the teacher's
//! `agents::routing::route_agent` (a pure function over in-memory data
//! returning a decision struct) and `session::router::classify_intent`
//! (heuristic matching with colocated tie-break tests).

use crate::model::{EventRoutingRule, WebhookEvent};

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub lead: String,
    pub consult: Vec<String>,
    pub rule_name: Option<String>,
}

/// Holds the current routing rule list; swapped atomically on `update_rules`.
#[derive(Debug, Default, Clone)]
pub struct EventRouter {
    rules: Vec<EventRoutingRule>,
}

impl EventRouter {
    pub fn new(rules: Vec<EventRoutingRule>) -> Self {
        Self { rules }
    }

    pub fn update_rules(&mut self, rules: Vec<EventRoutingRule>) {
        self.rules = rules;
    }

    /// First matching rule wins; rules are scanned in declared order.
    pub fn route(&self, event: &WebhookEvent) -> Option<RouteResult> {
        let event_labels = event.labels();
        self.rules.iter().find_map(|rule| {
            if rule.match_.source != event.source {
                return None;
            }
            if let Some(expected_type) = &rule.match_.event_type {
                if expected_type != &event.event_type {
                    return None;
                }
            }
            if !rule.match_.labels.is_empty() {
                if event_labels.is_empty() {
                    return None;
                }
                if !rule.match_.labels.iter().all(|l| event_labels.contains(l)) {
                    return None;
                }
            }
            tracing::debug!(source = %event.source, event_type = %event.event_type, lead = %rule.assign.lead, "event matched routing rule");
            Some(RouteResult {
                lead: rule.assign.lead.clone(),
                consult: rule.assign.consult.clone(),
                rule_name: rule.name.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventAssignment, EventMatch};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn rule(source: &str, event_type: Option<&str>, labels: &[&str], lead: &str, consult: &[&str]) -> EventRoutingRule {
        EventRoutingRule {
            name: None,
            match_: EventMatch {
                source: source.to_string(),
                event_type: event_type.map(|s| s.to_string()),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            },
            assign: EventAssignment {
                lead: lead.to_string(),
                consult: consult.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    fn event(source: &str, event_type: &str, payload: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            source: source.to_string(),
            event_type: event_type.to_string(),
            payload,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn matches_on_source_type_and_labels() {
        let router = EventRouter::new(vec![rule(
            "github",
            Some("issues.opened"),
            &["bug"],
            "cto",
            &["cpo"],
        )]);
        let ev = event(
            "github",
            "issues.opened",
            json!({"issue": {"labels": [{"name": "bug"}], "title": "crash on boot"}}),
        );
        let result = router.route(&ev).expect("should match");
        assert_eq!(result.lead, "cto");
        assert_eq!(result.consult, vec!["cpo".to_string()]);
    }

    #[test]
    fn no_match_on_different_label() {
        let router = EventRouter::new(vec![rule(
            "github",
            Some("issues.opened"),
            &["bug"],
            "cto",
            &["cpo"],
        )]);
        let ev = event(
            "github",
            "issues.opened",
            json!({"issue": {"labels": [{"name": "feature"}]}}),
        );
        assert!(router.route(&ev).is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let router = EventRouter::new(vec![
            rule("github", None, &[], "cto", &[]),
            rule("github", None, &[], "cpo", &[]),
        ]);
        let ev = event("github", "issues.opened", json!({}));
        assert_eq!(router.route(&ev).unwrap().lead, "cto");
    }

    #[test]
    fn matched_rule_name_is_reported() {
        let mut named = rule("github", None, &[], "cto", &[]);
        named.name = Some("github-catchall".to_string());
        let router = EventRouter::new(vec![named]);
        let ev = event("github", "issues.opened", json!({}));
        assert_eq!(router.route(&ev).unwrap().rule_name.as_deref(), Some("github-catchall"));
    }

    #[test]
    fn update_rules_is_observable_immediately() {
        let mut router = EventRouter::new(vec![]);
        let ev = event("github", "issues.opened", json!({}));
        assert!(router.route(&ev).is_none());
        router.update_rules(vec![rule("github", None, &[], "cto", &[])]);
        assert_eq!(router.route(&ev).unwrap().lead, "cto");
    }
}
