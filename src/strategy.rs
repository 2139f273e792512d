//! Evaluation strategies, one per [`RuleType`].
//!
//! The pattern, threshold and hybrid strategies are plain functions. Semantic
//! and schedule rules go through the [`SemanticMatcher`] / [`ScheduleMatcher`]
//! traits; the implementations shipped here are placeholders:
//!
//! - [`KeywordFallback`] runs the pattern algorithm when the rule has keywords
//!   and otherwise never triggers. A vector-search backed matcher should
//!   replace it outright and report its similarity score as confidence.
//! - [`ActivityFallback`] ignores the cron expression and only checks message
//!   volume. Real schedule rules need a timer-driven invocation path.

use chrono::Duration;
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::detectors::{compile_patterns, saturating_confidence, scan};
use crate::model::{ChatMessage, EvaluationContext, Rule, RuleType};

const DEFAULT_PATTERN_MESSAGE_COUNT: u32 = 1;
const DEFAULT_THRESHOLD_MESSAGE_COUNT: u32 = 10;
const DEFAULT_SCHEDULE_MESSAGE_COUNT: u32 = 1;
const SCHEDULE_CONFIDENCE: f32 = 0.5;

/// A rule plus its lazily compiled patterns.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    patterns: OnceCell<Vec<Regex>>,
}

impl CompiledRule {
    pub fn new(rule: Rule) -> Self {
        Self {
            rule,
            patterns: OnceCell::new(),
        }
    }

    /// Compiled on first use; invalid patterns are logged once and left out.
    pub fn patterns(&self) -> &[Regex] {
        self.patterns
            .get_or_init(|| compile_patterns(&self.rule.id, &self.rule.conditions.patterns))
    }

    pub fn id(&self) -> &str {
        &self.rule.id
    }
}

/// What a strategy reports for one rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyOutcome {
    pub triggered: bool,
    pub confidence: f32,
    pub matching_message_ids: Vec<String>,
}

impl StrategyOutcome {
    pub fn miss() -> Self {
        Self::default()
    }
}

/// Seam for vector-similarity matching.
pub trait SemanticMatcher: Send + Sync {
    fn evaluate(&self, rule: &CompiledRule, ctx: &EvaluationContext) -> StrategyOutcome;
    fn name(&self) -> &'static str;
}

/// Seam for time-based rules.
pub trait ScheduleMatcher: Send + Sync {
    fn evaluate(&self, rule: &CompiledRule, ctx: &EvaluationContext) -> StrategyOutcome;
    fn name(&self) -> &'static str;
}

/// Placeholder semantic matcher: keyword/pattern scan, or nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordFallback;

impl SemanticMatcher for KeywordFallback {
    fn evaluate(&self, rule: &CompiledRule, ctx: &EvaluationContext) -> StrategyOutcome {
        if rule.rule.conditions.keywords.is_empty() {
            return StrategyOutcome::miss();
        }
        evaluate_pattern(rule, ctx)
    }

    fn name(&self) -> &'static str {
        "keyword-fallback"
    }
}

/// Placeholder schedule matcher: fires when there has been any activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityFallback;

impl ScheduleMatcher for ActivityFallback {
    fn evaluate(&self, rule: &CompiledRule, ctx: &EvaluationContext) -> StrategyOutcome {
        let needed = rule
            .rule
            .conditions
            .message_count
            .unwrap_or(DEFAULT_SCHEDULE_MESSAGE_COUNT) as usize;
        if ctx.recent_messages.len() >= needed {
            StrategyOutcome {
                triggered: true,
                confidence: SCHEDULE_CONFIDENCE,
                matching_message_ids: Vec::new(),
            }
        } else {
            StrategyOutcome::miss()
        }
    }

    fn name(&self) -> &'static str {
        "activity-fallback"
    }
}

/// Messages within the rule's time window of `ctx.current_time`, or all of them.
fn messages_in_window<'a>(rule: &Rule, ctx: &'a EvaluationContext) -> Vec<&'a ChatMessage> {
    match rule.conditions.time_window_minutes {
        Some(minutes) => {
            let window = Duration::minutes(i64::from(minutes));
            ctx.recent_messages
                .iter()
                .filter(|m| ctx.current_time.signed_duration_since(m.created_at) <= window)
                .collect()
        }
        None => ctx.recent_messages.iter().collect(),
    }
}

/// Regex + keyword scan. Fires only when there are enough matching messages
/// AND the just-arrived message is one of them (or no new message was named),
/// so old evidence sitting in the window cannot re-fire a rule.
pub fn evaluate_pattern(rule: &CompiledRule, ctx: &EvaluationContext) -> StrategyOutcome {
    let needed = rule
        .rule
        .conditions
        .message_count
        .unwrap_or(DEFAULT_PATTERN_MESSAGE_COUNT)
        .max(1);
    let candidates = messages_in_window(&rule.rule, ctx);
    let res = scan(&candidates, rule.patterns(), &rule.rule.conditions.keywords);

    let enough = res.matching_message_ids.len() >= needed as usize;
    let includes_new = match ctx.new_message_id.as_deref() {
        Some(id) => res.contains(id),
        None => true,
    };

    StrategyOutcome {
        triggered: enough && includes_new,
        confidence: saturating_confidence(res.match_count, needed as f32 * 2.0),
        matching_message_ids: res.matching_message_ids,
    }
}

/// Message volume inside the time window.
pub fn evaluate_threshold(rule: &CompiledRule, ctx: &EvaluationContext) -> StrategyOutcome {
    let needed = rule
        .rule
        .conditions
        .message_count
        .unwrap_or(DEFAULT_THRESHOLD_MESSAGE_COUNT)
        .max(1);
    let in_window = messages_in_window(&rule.rule, ctx);
    let count = in_window.len();

    StrategyOutcome {
        triggered: count >= needed as usize,
        confidence: saturating_confidence(count, needed as f32 * 1.5),
        matching_message_ids: in_window.iter().map(|m| m.id.clone()).collect(),
    }
}

/// Pattern AND threshold. Short-circuits on the first sub-check that misses.
pub fn evaluate_hybrid(rule: &CompiledRule, ctx: &EvaluationContext) -> StrategyOutcome {
    let pattern = evaluate_pattern(rule, ctx);
    if !pattern.triggered {
        return pattern;
    }
    let threshold = evaluate_threshold(rule, ctx);
    if !threshold.triggered {
        return threshold;
    }

    let mut ids = pattern.matching_message_ids;
    for id in threshold.matching_message_ids {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    StrategyOutcome {
        triggered: true,
        confidence: (pattern.confidence + threshold.confidence) / 2.0,
        matching_message_ids: ids,
    }
}

/// Route a rule to its strategy.
pub fn dispatch(
    rule: &CompiledRule,
    ctx: &EvaluationContext,
    semantic: &dyn SemanticMatcher,
    schedule: &dyn ScheduleMatcher,
) -> StrategyOutcome {
    match rule.rule.rule_type {
        RuleType::Pattern => evaluate_pattern(rule, ctx),
        RuleType::Threshold => evaluate_threshold(rule, ctx),
        RuleType::Semantic => semantic.evaluate(rule, ctx),
        RuleType::Schedule => schedule.evaluate(rule, ctx),
        RuleType::Hybrid => evaluate_hybrid(rule, ctx),
        RuleType::Unknown => {
            tracing::warn!(
                target: "chime",
                rule_id = %rule.rule.id,
                "unknown rule type, treating as non-match"
            );
            StrategyOutcome::miss()
        }
    }
}
