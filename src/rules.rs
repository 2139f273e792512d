//! Rule registry: the built-in catalog plus team overrides.
//!
//! Overrides come from a JSON catalog (default `config/rules.json`):
//!
//! ```json
//! { "rules": [ { "id": "problem-detector", "name": "...", "type": "pattern", ... } ] }
//! ```
//!
//! An override with the id of a built-in rule replaces it in place; new ids
//! are appended. Disabling a built-in is done either by overriding it with
//! `"enabled": false` or by listing its id under `[rules].disabled` in
//! `chime.toml`.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::SystemTime,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detectors::{
    COMMITMENT_PATTERNS, CONFUSION_PATTERNS, DECISION_PATTERNS, PROBLEM_PATTERNS,
    URGENCY_PATTERNS,
};
use crate::model::{InsightType, Priority, Rule, RuleAction, RuleType};

pub const DEFAULT_RULES_PATH: &str = "config/rules.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleCatalog {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// The system defaults every team starts with.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new("decision-detector", "Decision Detector", RuleType::Pattern)
            .with_priority(Priority::High)
            .with_cooldown(30)
            .with_patterns(DECISION_PATTERNS)
            .with_message_count(1)
            .with_action(RuleAction::insight(
                InsightType::Summary,
                "The team just made a decision. Summarize what was decided, who agreed, \
                 and any open follow-ups, in two or three sentences.",
            )),
        Rule::new("action-item-detector", "Action Item Detector", RuleType::Pattern)
            .with_priority(Priority::High)
            .with_cooldown(15)
            .with_patterns(COMMITMENT_PATTERNS)
            .with_message_count(1)
            .with_action(RuleAction::insight(
                InsightType::Action,
                "Someone committed to a task. Extract the action item: owner, task, \
                 and deadline if one was mentioned.",
            )),
        Rule::new("confusion-detector", "Confusion Detector", RuleType::Pattern)
            .with_priority(Priority::Medium)
            .with_cooldown(20)
            .with_patterns(CONFUSION_PATTERNS)
            .with_message_count(2)
            .with_time_window(10)
            .with_action(RuleAction::chat(
                "Several people seem confused. Briefly restate the point under discussion \
                 in plain words and ask which part is unclear.",
            )),
        Rule::new("problem-detector", "Problem Detector", RuleType::Pattern)
            .with_priority(Priority::High)
            .with_cooldown(30)
            .with_patterns(PROBLEM_PATTERNS)
            .with_message_count(2)
            .with_time_window(15)
            .with_action(RuleAction::both(
                InsightType::Suggestion,
                "The team is blocked. Suggest concrete next debugging steps based on \
                 the messages, and note what information is still missing.",
            )),
        Rule::new("urgency-detector", "Urgency Detector", RuleType::Pattern)
            .with_priority(Priority::Critical)
            .with_cooldown(10)
            .with_patterns(URGENCY_PATTERNS)
            .with_message_count(1)
            .with_action(RuleAction::both(
                InsightType::Action,
                "Something urgent came up. Acknowledge it, restate the issue in one line \
                 and list the immediate actions.",
            )),
        Rule::new("knowledge-gap-detector", "Knowledge Gap Detector", RuleType::Semantic)
            .with_priority(Priority::Medium)
            .with_cooldown(60)
            .with_semantic_query("questions nobody on the team can answer")
            .with_keywords(&[
                "does anyone know",
                "no idea how",
                "who knows",
                "where are the docs",
                "is there documentation",
            ])
            .with_message_count(2)
            .with_time_window(30)
            .with_action(RuleAction::insight(
                InsightType::Suggestion,
                "The team keeps asking about something nobody answered. Identify the \
                 topic and suggest where the answer could be documented.",
            )),
        Rule::new("question-burst", "Question Burst", RuleType::Hybrid)
            .with_priority(Priority::Medium)
            .with_cooldown(30)
            .with_patterns(&[r"\?\s*$"])
            .with_message_count(3)
            .with_time_window(10)
            .with_action(RuleAction::chat(
                "Many open questions piled up. List the unanswered questions so the \
                 team can work through them.",
            )),
        Rule::new("activity-summary", "Busy Conversation Summary", RuleType::Threshold)
            .with_priority(Priority::Low)
            .with_cooldown(120)
            .with_message_count(30)
            .with_time_window(15)
            .with_action(RuleAction::insight(
                InsightType::Summary,
                "The conversation is moving fast. Summarize the main threads of the \
                 last few minutes.",
            )),
        // Off by default: schedule rules only have the activity placeholder.
        Rule::new("daily-digest", "Daily Digest", RuleType::Schedule)
            .with_priority(Priority::Low)
            .with_cooldown(24 * 60)
            .with_schedule("0 9 * * 1-5")
            .with_message_count(1)
            .with_action(RuleAction::insight(
                InsightType::Summary,
                "Write a short digest of yesterday's discussion.",
            ))
            .disabled(),
    ]
}

/// Overrides replace defaults sharing an id (in place); unknown ids are appended.
/// An id repeated inside `overrides` keeps its last definition.
pub fn merge_rules(defaults: Vec<Rule>, overrides: Vec<Rule>) -> Vec<Rule> {
    let mut merged = defaults;
    for o in dedup_last_wins(overrides) {
        match merged.iter_mut().find(|r| r.id == o.id) {
            Some(slot) => *slot = o,
            None => merged.push(o),
        }
    }
    merged
}

fn dedup_last_wins(rules: Vec<Rule>) -> Vec<Rule> {
    let mut out: Vec<Rule> = Vec::with_capacity(rules.len());
    for r in rules {
        match out.iter().position(|k| k.id == r.id) {
            Some(i) => {
                warn!(target: "chime", rule_id = %r.id, "duplicate override id, keeping the last");
                out[i] = r;
            }
            None => out.push(r),
        }
    }
    out
}

/// Defaults minus `disabled` ids, merged with the override catalog.
pub fn build_rule_set(disabled: &[String], overrides: Vec<Rule>) -> Vec<Rule> {
    let defaults = default_rules()
        .into_iter()
        .map(|mut r| {
            if disabled.iter().any(|d| d == &r.id) {
                r.enabled = false;
            }
            r
        })
        .collect();
    merge_rules(defaults, overrides)
}

pub fn load_rules_file(path: &Path) -> Result<RuleCatalog> {
    let bytes = fs::read(path).with_context(|| format!("reading rules from {}", path.display()))?;
    let catalog: RuleCatalog = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing rules from {}", path.display()))?;
    for r in &catalog.rules {
        if let Err(e) = r.action.validate() {
            warn!(
                target: "chime",
                rule_id = %r.id,
                error = %e,
                "catalog rule has a malformed action"
            );
        }
        if r.rule_type == RuleType::Unknown {
            warn!(target: "chime", rule_id = %r.id, "catalog rule has an unknown type");
        }
    }
    Ok(catalog)
}

/// Overrides file that reloads when its mtime changes.
/// A missing or broken file keeps the last good catalog.
#[derive(Debug)]
pub struct HotReloadCatalog {
    path: PathBuf,
    inner: RwLock<State>,
}

#[derive(Debug)]
struct State {
    catalog: RuleCatalog,
    last_modified: Option<SystemTime>,
}

impl HotReloadCatalog {
    pub fn new(path: Option<&Path>) -> Self {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RULES_PATH));
        Self {
            path,
            inner: RwLock::new(State {
                catalog: RuleCatalog::default(),
                last_modified: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current catalog plus whether it changed since the previous call.
    pub fn current(&self) -> (RuleCatalog, bool) {
        let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return (self.read().catalog.clone(), false),
        };

        if self.read().last_modified == Some(mtime) {
            return (self.read().catalog.clone(), false);
        }

        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if guard.last_modified == Some(mtime) {
            return (guard.catalog.clone(), false);
        }
        match load_rules_file(&self.path) {
            Ok(catalog) => {
                info!(
                    target: "chime",
                    path = %self.path.display(),
                    rules = catalog.rules.len(),
                    "rule catalog loaded"
                );
                guard.catalog = catalog;
                guard.last_modified = Some(mtime);
                (guard.catalog.clone(), true)
            }
            Err(e) => {
                warn!(target: "chime", error = %format!("{e:#}"), "rule catalog reload failed");
                guard.last_modified = Some(mtime);
                (guard.catalog.clone(), false)
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_ids_are_unique_and_valid() {
        let rules = default_rules();
        let ids: HashSet<_> = rules.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), rules.len());
        for r in &rules {
            assert!(r.action.validate().is_ok(), "{} has a bad action", r.id);
            let compiled = crate::detectors::compile_patterns(&r.id, &r.conditions.patterns);
            assert_eq!(compiled.len(), r.conditions.patterns.len(), "{} regex", r.id);
        }
    }

    #[test]
    fn repeated_override_id_keeps_last_definition() {
        let defaults = vec![Rule::new("a", "A", RuleType::Pattern)];
        let overrides = vec![
            Rule::new("a", "A first", RuleType::Pattern),
            Rule::new("n", "N first", RuleType::Pattern),
            Rule::new("a", "A second", RuleType::Pattern),
            Rule::new("n", "N second", RuleType::Pattern),
        ];
        let merged = merge_rules(defaults, overrides);
        let names: Vec<_> = merged.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["A second", "N second"]);
    }

    #[test]
    fn override_replaces_in_place_and_appends_new() {
        let defaults = vec![
            Rule::new("a", "A", RuleType::Pattern),
            Rule::new("b", "B", RuleType::Pattern),
        ];
        let overrides = vec![
            Rule::new("b", "B custom", RuleType::Threshold).for_team("t1"),
            Rule::new("c", "C", RuleType::Pattern),
        ];
        let merged = merge_rules(defaults, overrides);
        let ids: Vec<_> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(merged[1].name, "B custom");
        assert_eq!(merged[1].team_id.as_deref(), Some("t1"));
    }

    #[test]
    fn disabled_list_turns_defaults_off() {
        let set = build_rule_set(&["urgency-detector".to_string()], vec![]);
        let urgency = set.iter().find(|r| r.id == "urgency-detector").unwrap();
        assert!(!urgency.enabled);
        let digest = set.iter().find(|r| r.id == "daily-digest").unwrap();
        assert!(!digest.enabled, "schedule placeholder ships disabled");
    }

    #[test]
    fn catalog_file_roundtrip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let catalog = RuleCatalog {
            rules: vec![Rule::new("x", "X", RuleType::Threshold).with_message_count(5)],
        };
        fs::write(&path, serde_json::to_vec_pretty(&catalog).unwrap()).unwrap();

        let loaded = load_rules_file(&path).unwrap();
        assert_eq!(loaded, catalog);

        let hot = HotReloadCatalog::new(Some(&path));
        let (first, changed) = hot.current();
        assert!(changed);
        assert_eq!(first.rules.len(), 1);
        let (_, changed_again) = hot.current();
        assert!(!changed_again);
    }

    #[test]
    fn missing_catalog_is_empty() {
        let hot = HotReloadCatalog::new(Some(Path::new("definitely/not/here.json")));
        let (c, changed) = hot.current();
        assert!(c.rules.is_empty());
        assert!(!changed);
    }
}
