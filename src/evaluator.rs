//! # Chime Evaluator
//! Holds the active rule set and the per-rule cooldown state, runs every
//! eligible rule through its strategy and returns the fired rules as
//! decisions, highest priority first.
//!
//! Cooldowns start the moment a rule lands in the returned list, whether or
//! not the caller ends up acting on it.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{debug, warn};

use crate::cooldown::CooldownTracker;
use crate::metrics::{COOLDOWN_SUPPRESSED_TOTAL, DECISIONS_TOTAL, EVALUATIONS_TOTAL};
use crate::model::{Decision, EvaluationContext, Rule};
use crate::strategy::{
    dispatch, ActivityFallback, CompiledRule, KeywordFallback, ScheduleMatcher, SemanticMatcher,
};

pub struct ChimeEvaluator {
    rules: Vec<CompiledRule>,
    cooldowns: CooldownTracker,
    semantic: Box<dyn SemanticMatcher>,
    schedule: Box<dyn ScheduleMatcher>,
}

impl std::fmt::Debug for ChimeEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChimeEvaluator")
            .field("rules", &self.rules.len())
            .field("cooldowns", &self.cooldowns.len())
            .field("semantic", &self.semantic.name())
            .field("schedule", &self.schedule.name())
            .finish()
    }
}

impl ChimeEvaluator {
    /// Keeps only the enabled rules. Later duplicates of an id are dropped.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self::with_matchers(rules, Box::new(KeywordFallback), Box::new(ActivityFallback))
    }

    /// Same as `new`, with explicit semantic/schedule implementations.
    pub fn with_matchers(
        rules: Vec<Rule>,
        semantic: Box<dyn SemanticMatcher>,
        schedule: Box<dyn ScheduleMatcher>,
    ) -> Self {
        let mut eval = Self {
            rules: Vec::with_capacity(rules.len()),
            cooldowns: CooldownTracker::new(),
            semantic,
            schedule,
        };
        for r in rules {
            if r.enabled && eval.contains(&r.id) {
                warn!(target: "chime", rule_id = %r.id, "duplicate rule id, keeping the first");
                continue;
            }
            eval.add_rule(r);
        }
        eval
    }

    /// Run one evaluation pass. Empty input yields an empty list.
    pub fn evaluate(&mut self, ctx: &EvaluationContext) -> Vec<Decision> {
        counter!(EVALUATIONS_TOTAL).increment(1);
        let now = ctx.current_time;
        let mut decisions = Vec::new();

        for compiled in &self.rules {
            let rule = &compiled.rule;

            if !rule.applies_to(&ctx.team_id) {
                continue;
            }

            if self.cooldowns.is_cooling_down(&rule.id, rule.cooldown_minutes, now) {
                counter!(COOLDOWN_SUPPRESSED_TOTAL).increment(1);
                debug!(target: "chime", rule_id = %rule.id, "suppressed by cooldown");
                continue;
            }

            if let Err(e) = rule.action.validate() {
                warn!(target: "chime", rule_id = %rule.id, error = %e, "skipping malformed rule");
                continue;
            }

            let outcome = dispatch(compiled, ctx, self.semantic.as_ref(), self.schedule.as_ref());
            if !outcome.triggered {
                continue;
            }

            debug!(
                target: "chime",
                rule_id = %rule.id,
                team_id = %ctx.team_id,
                confidence = outcome.confidence,
                matches = outcome.matching_message_ids.len(),
                "rule fired"
            );
            counter!(DECISIONS_TOTAL).increment(1);

            decisions.push(Decision {
                rule: rule.clone(),
                team_id: ctx.team_id.clone(),
                triggering_message_ids: outcome.matching_message_ids,
                confidence: outcome.confidence.clamp(0.0, 1.0),
                timestamp: now,
            });
            self.cooldowns.record(&rule.id, now);
        }

        // Stable: equal priorities keep rule order.
        decisions.sort_by(|a, b| b.rule.priority.rank().cmp(&a.rule.priority.rank()));
        decisions
    }

    /// Appends an enabled rule whose id is not present yet. Returns true if added.
    pub fn add_rule(&mut self, rule: Rule) -> bool {
        if !rule.enabled || self.contains(&rule.id) {
            return false;
        }
        self.rules.push(CompiledRule::new(rule));
        true
    }

    /// Removes the rule and its cooldown entry. Returns true if the rule existed.
    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id() != rule_id);
        self.cooldowns.clear(rule_id);
        self.rules.len() < before
    }

    /// Swap in a new rule set. Cooldowns of rules that survive are kept.
    pub fn replace_rules(&mut self, rules: Vec<Rule>) {
        self.rules.clear();
        for r in rules {
            self.add_rule(r);
        }
        let ids: Vec<String> = self.rules.iter().map(|r| r.id().to_string()).collect();
        self.cooldowns.retain_rules(|id| ids.iter().any(|k| k == id));
    }

    /// Test/admin reset. Returns true if an entry was removed.
    pub fn clear_cooldown(&mut self, rule_id: &str) -> bool {
        self.cooldowns.clear(rule_id)
    }

    /// Snapshot copy of the active rules.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|r| r.rule.clone()).collect()
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.iter().any(|r| r.id() == rule_id)
    }

    pub fn last_fired(&self, rule_id: &str) -> Option<DateTime<Utc>> {
        self.cooldowns.last_fired(rule_id)
    }

    /// Time left on the rule's cooldown at `now`, if any.
    pub fn cooldown_remaining(&self, rule_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        let rule = self.rules.iter().find(|r| r.id() == rule_id)?;
        self.cooldowns.remaining(rule_id, rule.rule.cooldown_minutes, now)
    }

    pub fn cooldown_snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        self.cooldowns.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, InsightType, Priority, RuleAction, RuleType};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
    }

    fn ctx_at(now: DateTime<Utc>, text: &str) -> EvaluationContext {
        let m = ChatMessage::new("m1", "u1", text, now);
        EvaluationContext::new("team-a", vec![m], now).with_new_message("m1")
    }

    fn deploy_rule(id: &str) -> Rule {
        Rule::new(id, id, RuleType::Pattern)
            .with_patterns(&["deploy"])
            .with_cooldown(10)
    }

    #[test]
    fn construct_keeps_only_enabled() {
        let ev = ChimeEvaluator::new(vec![deploy_rule("a"), deploy_rule("b").disabled()]);
        let ids: Vec<_> = ev.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let first = deploy_rule("a").with_priority(Priority::High);
        let second = deploy_rule("a").with_priority(Priority::Low);
        let ev = ChimeEvaluator::new(vec![first, second]);
        assert_eq!(ev.rules().len(), 1);
        assert_eq!(ev.rules()[0].priority, Priority::High);
    }

    #[test]
    fn firing_starts_cooldown() {
        let mut ev = ChimeEvaluator::new(vec![deploy_rule("a")]);
        assert_eq!(ev.evaluate(&ctx_at(t0(), "deploy")).len(), 1);
        assert_eq!(ev.last_fired("a"), Some(t0()));
        assert!(ev.evaluate(&ctx_at(t0() + Duration::minutes(5), "deploy")).is_empty());
        assert_eq!(
            ev.cooldown_remaining("a", t0() + Duration::minutes(5)),
            Some(Duration::minutes(5))
        );
        assert_eq!(ev.evaluate(&ctx_at(t0() + Duration::minutes(10), "deploy")).len(), 1);
    }

    #[test]
    fn clear_cooldown_allows_refire() {
        let mut ev = ChimeEvaluator::new(vec![deploy_rule("a")]);
        ev.evaluate(&ctx_at(t0(), "deploy"));
        assert!(ev.clear_cooldown("a"));
        assert_eq!(ev.evaluate(&ctx_at(t0(), "deploy")).len(), 1);
    }

    #[test]
    fn team_scoped_rules_only_fire_for_their_team() {
        let mut ev = ChimeEvaluator::new(vec![deploy_rule("a").for_team("team-b")]);
        assert!(ev.evaluate(&ctx_at(t0(), "deploy")).is_empty());
    }

    #[test]
    fn malformed_action_is_skipped_not_fatal() {
        let mut broken = deploy_rule("broken")
            .with_action(RuleAction::insight(InsightType::Summary, "t"));
        broken.action.insight_type = None;
        let mut ev = ChimeEvaluator::new(vec![broken, deploy_rule("ok")]);
        let out = ev.evaluate(&ctx_at(t0(), "deploy"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rule.id, "ok");
    }

    #[test]
    fn empty_template_is_skipped() {
        let blank = deploy_rule("blank").with_action(RuleAction::chat(""));
        let mut ev = ChimeEvaluator::new(vec![blank, deploy_rule("ok")]);
        let out = ev.evaluate(&ctx_at(t0(), "deploy"));
        let ids: Vec<_> = out.iter().map(|d| d.rule.id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
        assert!(ev.last_fired("blank").is_none());
    }

    #[test]
    fn bad_regex_does_not_block_other_patterns() {
        let rule = Rule::new("r", "R", RuleType::Pattern).with_patterns(&["([", "deploy"]);
        let mut ev = ChimeEvaluator::new(vec![rule]);
        assert_eq!(ev.evaluate(&ctx_at(t0(), "Deploy please")).len(), 1);
    }

    #[test]
    fn replace_rules_keeps_surviving_cooldowns() {
        let mut ev = ChimeEvaluator::new(vec![deploy_rule("a"), deploy_rule("b")]);
        ev.evaluate(&ctx_at(t0(), "deploy"));
        ev.replace_rules(vec![deploy_rule("a"), deploy_rule("c")]);
        assert!(ev.last_fired("a").is_some());
        assert!(ev.last_fired("b").is_none());
        assert!(ev.last_fired("c").is_none());
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        let mut ev = ChimeEvaluator::new(vec![]);
        assert!(ev.evaluate(&ctx_at(t0(), "deploy")).is_empty());

        let mut ev = ChimeEvaluator::new(vec![deploy_rule("a")]);
        let empty = EvaluationContext::new("team-a", vec![], t0());
        assert!(ev.evaluate(&empty).is_empty());
    }
}
