// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Decides whether captured events match a target's expected configuration.

use crate::model::{CapturedEvent, EventKind, Target};

/// Verdict over the events captured for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// The page reported identifiers other than the expected ones.
    Mismatch(String),
    /// Nothing conclusive yet.
    Inconclusive,
}

/// Validation seam. The default [`IdMatchValidator`] compares identifiers;
/// richer parameter checks plug in here.
pub trait Validator: Send + Sync {
    /// Whether `event` is the primary event this target is waiting for.
    fn is_expected_primary(&self, target: &Target, event: &CapturedEvent) -> bool;

    /// `containers` holds every container ID the page registered or loaded.
    fn verdict(&self, target: &Target, events: &[CapturedEvent], containers: &[String]) -> Verdict;
}

/// Matches the measurement ID of the primary event and, when configured, the
/// container ID. Containers that were observed but never include the
/// expected one are a mismatch; no container at all is left to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdMatchValidator;

impl Validator for IdMatchValidator {
    fn is_expected_primary(&self, target: &Target, event: &CapturedEvent) -> bool {
        event.is_primary()
            && event
                .tag_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(&target.expected_tag_id))
    }

    fn verdict(
        &self,
        target: &Target,
        events: &[CapturedEvent],
        containers: &[String],
    ) -> Verdict {
        let mut problems = Vec::new();
        if let Some(expected) = &target.expected_container_id {
            let matched = containers.iter().any(|c| c.eq_ignore_ascii_case(expected));
            if !containers.is_empty() && !matched {
                problems.push(format!(
                    "expected container {expected} but page loaded {}",
                    containers.join(", ")
                ));
            }
        }

        let primary_seen = events.iter().any(|e| self.is_expected_primary(target, e));
        if !primary_seen {
            let seen: Vec<&str> = events
                .iter()
                .filter(|e| e.is_primary())
                .filter_map(|e| e.tag_id.as_deref())
                .collect();
            if !seen.is_empty() {
                problems.push(format!(
                    "expected {} but page_view reported {}",
                    target.expected_tag_id,
                    seen.join(", ")
                ));
            }
        }

        if !problems.is_empty() {
            Verdict::Mismatch(problems.join("; "))
        } else if primary_seen {
            Verdict::Pass
        } else {
            Verdict::Inconclusive
        }
    }
}

/// Distinct tag IDs seen on measurement hits, in arrival order.
pub fn observed_tag_ids(events: &[CapturedEvent]) -> Vec<String> {
    distinct_ids(events, EventKind::Hit)
}

/// Distinct container IDs seen on loader requests, in arrival order.
pub fn observed_container_ids(events: &[CapturedEvent]) -> Vec<String> {
    distinct_ids(events, EventKind::ContainerLoad)
}

fn distinct_ids(events: &[CapturedEvent], kind: EventKind) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in events
        .iter()
        .filter(|e| e.kind == kind)
        .filter_map(|e| e.tag_id.as_deref())
    {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CaptureChannel;
    use std::collections::BTreeMap;

    fn target() -> Target {
        Target {
            id: "acme".into(),
            url: "https://acme.test/".into(),
            expected_tag_id: "G-ABC123".into(),
            expected_container_id: Some("GTM-XYZ9".into()),
            tolerate_blocked_first_party: false,
            active: true,
        }
    }

    fn hit(tid: &str, en: &str) -> CapturedEvent {
        CapturedEvent {
            channel: CaptureChannel::DebugProtocol,
            kind: EventKind::Hit,
            url: format!("https://www.google-analytics.com/g/collect?tid={tid}&en={en}"),
            tag_id: Some(tid.into()),
            event_name: Some(en.into()),
            params: BTreeMap::new(),
            custom: BTreeMap::new(),
            observed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_pass_on_matching_page_view() {
        let v = IdMatchValidator;
        assert_eq!(
            v.verdict(&target(), &[hit("g-abc123", "page_view")], &["GTM-XYZ9".into()]),
            Verdict::Pass
        );
    }

    #[test]
    fn test_mismatch_when_only_foreign_page_view() {
        let v = IdMatchValidator;
        let verdict = v.verdict(&target(), &[hit("G-OTHER", "page_view")], &[]);
        assert!(matches!(verdict, Verdict::Mismatch(msg) if msg.contains("G-OTHER")));
    }

    #[test]
    fn test_non_primary_events_are_inconclusive() {
        let v = IdMatchValidator;
        assert_eq!(
            v.verdict(&target(), &[hit("G-ABC123", "scroll")], &[]),
            Verdict::Inconclusive
        );
    }

    #[test]
    fn test_foreign_container_is_mismatch_despite_matching_page_view() {
        let v = IdMatchValidator;
        let verdict = v.verdict(
            &target(),
            &[hit("G-ABC123", "page_view")],
            &["GTM-OTHER".into()],
        );
        assert!(matches!(verdict, Verdict::Mismatch(msg) if msg.contains("GTM-OTHER")));
    }

    #[test]
    fn test_expected_container_among_several_passes() {
        let v = IdMatchValidator;
        let containers = vec!["GTM-OTHER".to_string(), "gtm-xyz9".to_string()];
        assert_eq!(
            v.verdict(&target(), &[hit("G-ABC123", "page_view")], &containers),
            Verdict::Pass
        );
    }

    #[test]
    fn test_missing_container_is_not_a_mismatch() {
        let v = IdMatchValidator;
        assert_eq!(
            v.verdict(&target(), &[hit("G-ABC123", "page_view")], &[]),
            Verdict::Pass
        );
    }

    #[test]
    fn test_observed_ids_distinct() {
        let events = vec![
            hit("G-A", "page_view"),
            hit("G-A", "scroll"),
            hit("G-B", "page_view"),
        ];
        assert_eq!(observed_tag_ids(&events), vec!["G-A", "G-B"]);
        assert!(observed_container_ids(&events).is_empty());
    }
}
