//! # Dispatch Policy
//! Decides, per incoming message, between doing nothing, replying directly
//! (reactive mode) and running the chime evaluator (autonomous mode).
//!
//! Order of the gates:
//! 1. messages authored by the agent are dropped before anything else; they
//!    never enter the evaluation window, so the agent cannot trigger itself;
//! 2. a message that mentions the agent goes to the reactive path and skips
//!    chime evaluation entirely;
//! 3. otherwise the team's evaluator runs and only the top decision is
//!    returned for execution. The rest are discarded, their cooldowns
//!    already started.
//!
//! Each team gets its own evaluator + window behind one mutex, so the
//! cooldown check and the cooldown update happen in a single critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info};

use crate::action::{build_action, ChimeAction, GenerationRequest, Generator};
use crate::clock::Clock;
use crate::config::chime::{AgentSection, ChimeConfig};
use crate::detectors::{self, Detection, SilenceDetection};
use crate::evaluator::ChimeEvaluator;
use crate::metrics::DISPATCH_TOTAL;
use crate::model::{ChatMessage, Decision, EvaluationContext, Rule};
use crate::strategy::{ActivityFallback, KeywordFallback, ScheduleMatcher, SemanticMatcher};
use crate::telemetry::anon_hash;
use crate::window::{ConversationWindow, DEFAULT_WINDOW_SIZE};

/// Who the agent is and how people address it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub display_name: String,
    pub mention_aliases: Vec<String>,
}

impl AgentIdentity {
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            mention_aliases: Vec::new(),
        }
    }

    pub fn with_aliases<S: AsRef<str>>(mut self, aliases: &[S]) -> Self {
        self.mention_aliases = aliases.iter().map(|a| a.as_ref().to_string()).collect();
        self
    }

    pub fn from_config(agent: &AgentSection) -> Self {
        Self::new(agent.id.clone(), agent.display_name.clone()).with_aliases(&agent.mention_aliases)
    }

    pub fn is_self(&self, author_id: &str) -> bool {
        author_id == self.agent_id
    }

    /// `@display_name` or any alias, as a standalone token, case-insensitive.
    pub fn is_mentioned(&self, content: &str) -> bool {
        let hay = content.to_lowercase();
        let handle = format!("@{}", self.display_name);
        std::iter::once(handle.as_str())
            .chain(self.mention_aliases.iter().map(String::as_str))
            .map(|a| a.trim().to_lowercase())
            .filter(|a| a.len() > 1)
            .any(|a| contains_token(&hay, &a))
    }
}

/// `needle` occurs in `hay` without word characters glued to either side.
fn contains_token(hay: &str, needle: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut from = 0;
    while let Some(pos) = hay[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = hay[..start].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = hay[end..].chars().next().map_or(true, |c| !is_word(c));
        if before_ok && after_ok {
            return true;
        }
        from = start + needle.chars().next().map_or(1, char::len_utf8);
    }
    false
}

/// Result of routing one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Authored by the agent; ignored.
    SelfAuthored { message_id: String },
    /// Addresses the agent; the caller generates a direct reply.
    Reactive { message_id: String },
    /// One rule won; `discarded` lists the other rules that fired.
    Chime {
        decision: Decision,
        discarded: Vec<String>,
    },
    /// Nothing fired (or the message was a redelivery).
    Quiet,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::SelfAuthored { .. } => "self",
            DispatchOutcome::Reactive { .. } => "reactive",
            DispatchOutcome::Chime { .. } => "chime",
            DispatchOutcome::Quiet => "quiet",
        }
    }
}

/// Per-team cooldown view for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownStatus {
    pub rule_id: String,
    pub last_fired: DateTime<Utc>,
    pub remaining_secs: i64,
}

/// Every standalone detector run over a team's current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSignals {
    pub messages: usize,
    pub decision: Detection,
    pub commitment: Detection,
    pub confusion: Detection,
    pub problem: Detection,
    pub urgency: Detection,
    pub knowledge_gap: Detection,
    pub question_overload: Detection,
    pub silence: Option<SilenceDetection>,
}

#[derive(Debug)]
struct TeamConversation {
    evaluator: ChimeEvaluator,
    window: ConversationWindow,
}

type SharedConversation = Arc<Mutex<TeamConversation>>;

/// Builds the semantic and schedule matchers for each new team evaluator.
pub type MatcherFactory =
    Arc<dyn Fn() -> (Box<dyn SemanticMatcher>, Box<dyn ScheduleMatcher>) + Send + Sync>;

fn fallback_matchers() -> MatcherFactory {
    Arc::new(|| -> (Box<dyn SemanticMatcher>, Box<dyn ScheduleMatcher>) {
        (Box::new(KeywordFallback), Box::new(ActivityFallback))
    })
}

pub struct Dispatcher {
    identity: AgentIdentity,
    rules: RwLock<Vec<Rule>>,
    teams: RwLock<HashMap<String, SharedConversation>>,
    clock: Arc<dyn Clock>,
    window_size: usize,
    matchers: MatcherFactory,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("identity", &self.identity)
            .field("window_size", &self.window_size)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(identity: AgentIdentity, rules: Vec<Rule>, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            rules: RwLock::new(rules),
            teams: RwLock::new(HashMap::new()),
            clock,
            window_size: DEFAULT_WINDOW_SIZE,
            matchers: fallback_matchers(),
        }
    }

    pub fn from_config(cfg: &ChimeConfig, rules: Vec<Rule>, clock: Arc<dyn Clock>) -> Self {
        Self::new(AgentIdentity::from_config(&cfg.agent), rules, clock)
            .with_window_size(cfg.window.max_messages)
    }

    pub fn with_window_size(mut self, n: usize) -> Self {
        self.window_size = n.max(1);
        self
    }

    /// Semantic/schedule implementations for teams created after this call.
    /// Defaults to the keyword and activity fallbacks.
    pub fn with_matchers<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> (Box<dyn SemanticMatcher>, Box<dyn ScheduleMatcher>) + Send + Sync + 'static,
    {
        self.matchers = Arc::new(factory);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Route one incoming message. See the module docs for the gate order.
    pub fn handle_message(&self, team_id: &str, message: ChatMessage) -> DispatchOutcome {
        let outcome = self.route(team_id, message);
        counter!(DISPATCH_TOTAL, "outcome" => outcome.label()).increment(1);
        outcome
    }

    fn route(&self, team_id: &str, message: ChatMessage) -> DispatchOutcome {
        if self.identity.is_self(&message.author_id) {
            debug!(
                target: "chime",
                team_id,
                message_id = %message.id,
                "own message, not evaluated"
            );
            return DispatchOutcome::SelfAuthored {
                message_id: message.id,
            };
        }

        let now = self.clock.now();
        let message_id = message.id.clone();
        let fingerprint = anon_hash(&message.content);
        let mentioned = self.identity.is_mentioned(&message.content);

        let team = self.team(team_id);
        let mut conv = team.lock().unwrap_or_else(PoisonError::into_inner);
        if !conv.window.push(message) {
            debug!(
                target: "chime",
                team_id,
                message_id = %message_id,
                "redelivered message ignored"
            );
            return DispatchOutcome::Quiet;
        }

        if mentioned {
            debug!(
                target: "chime",
                team_id,
                message_id = %message_id,
                "agent mentioned, reactive path"
            );
            return DispatchOutcome::Reactive { message_id };
        }

        let ctx = EvaluationContext::new(team_id, conv.window.snapshot(), now)
            .with_new_message(message_id.clone());
        let mut decisions = conv.evaluator.evaluate(&ctx);
        drop(conv);

        if decisions.is_empty() {
            return DispatchOutcome::Quiet;
        }

        let top = decisions.remove(0);
        let discarded: Vec<String> = decisions.into_iter().map(|d| d.rule.id).collect();
        info!(
            target: "chime",
            team_id,
            rule_id = %top.rule.id,
            confidence = top.confidence,
            discarded = discarded.len(),
            msg = %fingerprint,
            "chime decision"
        );
        DispatchOutcome::Chime {
            decision: top,
            discarded,
        }
    }

    /// Generate and wrap the action for a decision returned by `handle_message`.
    pub async fn execute(
        &self,
        decision: &Decision,
        generator: &dyn Generator,
    ) -> Result<ChimeAction> {
        let messages = self.messages_for(&decision.team_id, &decision.triggering_message_ids);
        let request = GenerationRequest::from_decision(decision, messages);
        let text = generator.generate(&request).await.with_context(|| {
            format!(
                "generator `{}` failed for rule `{}`",
                generator.name(),
                decision.rule.id
            )
        })?;
        build_action(decision, text, &self.identity.agent_id)
    }

    /// Messages from the team window with the given ids, oldest first.
    pub fn messages_for(&self, team_id: &str, ids: &[String]) -> Vec<ChatMessage> {
        let Some(team) = self.existing_team(team_id) else {
            return Vec::new();
        };
        let conv = team.lock().unwrap_or_else(PoisonError::into_inner);
        conv.window
            .snapshot()
            .into_iter()
            .filter(|m| ids.contains(&m.id))
            .collect()
    }

    /// Active rules for the team (global + team-scoped, enabled only).
    pub fn rules_for(&self, team_id: &str) -> Vec<Rule> {
        if let Some(team) = self.existing_team(team_id) {
            let conv = team.lock().unwrap_or_else(PoisonError::into_inner);
            return conv.evaluator.rules();
        }
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules
            .iter()
            .filter(|r| r.enabled && r.applies_to(team_id))
            .cloned()
            .collect()
    }

    pub fn cooldowns_for(&self, team_id: &str) -> Vec<CooldownStatus> {
        let Some(team) = self.existing_team(team_id) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let conv = team.lock().unwrap_or_else(PoisonError::into_inner);
        conv.evaluator
            .cooldown_snapshot()
            .into_iter()
            .map(|(rule_id, last_fired)| {
                let remaining_secs = conv
                    .evaluator
                    .cooldown_remaining(&rule_id, now)
                    .map_or(0, |d| d.num_seconds());
                CooldownStatus {
                    rule_id,
                    last_fired,
                    remaining_secs,
                }
            })
            .collect()
    }

    /// Diagnostic snapshot; `None` for a team that has not spoken yet.
    pub fn signals(&self, team_id: &str, silence_minutes: i64) -> Option<ConversationSignals> {
        let team = self.existing_team(team_id)?;
        let (messages, last_at) = {
            let conv = team.lock().unwrap_or_else(PoisonError::into_inner);
            (conv.window.snapshot(), conv.window.last_message_at())
        };
        let now = self.clock.now();
        Some(ConversationSignals {
            messages: messages.len(),
            decision: detectors::detect_decision(&messages),
            commitment: detectors::detect_commitment(&messages),
            confusion: detectors::detect_confusion(&messages),
            problem: detectors::detect_problem(&messages),
            urgency: detectors::detect_urgency(&messages),
            knowledge_gap: detectors::detect_knowledge_gap(&messages),
            question_overload: detectors::detect_question_overload(&messages),
            silence: last_at.map(|t| detectors::detect_silence(t, now, silence_minutes)),
        })
    }

    /// Returns true if a cooldown entry was removed.
    pub fn clear_cooldown(&self, team_id: &str, rule_id: &str) -> bool {
        let Some(team) = self.existing_team(team_id) else {
            return false;
        };
        let mut conv = team.lock().unwrap_or_else(PoisonError::into_inner);
        conv.evaluator.clear_cooldown(rule_id)
    }

    /// Swap the rule set for every team. Cooldowns of surviving rules are kept.
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        info!(target: "chime", rules = rules.len(), "rule set replaced");
        // Publish first: teams created from here on start from the new set.
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules.clone();

        let teams: Vec<(String, SharedConversation)> = self
            .teams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        for (team_id, conv) in teams {
            let scoped = scoped_rules(&rules, &team_id);
            conv.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .evaluator
                .replace_rules(scoped);
        }
    }

    fn existing_team(&self, team_id: &str) -> Option<SharedConversation> {
        self.teams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(team_id)
            .cloned()
    }

    fn team(&self, team_id: &str) -> SharedConversation {
        if let Some(t) = self.existing_team(team_id) {
            return t;
        }
        let mut teams = self.teams.write().unwrap_or_else(PoisonError::into_inner);
        teams
            .entry(team_id.to_string())
            .or_insert_with(|| {
                let published = self.rules.read().unwrap_or_else(PoisonError::into_inner);
                let rules = scoped_rules(&published, team_id);
                drop(published);
                let (semantic, schedule) = (self.matchers)();
                debug!(
                    target: "chime",
                    team_id,
                    rules = rules.len(),
                    semantic = semantic.name(),
                    schedule = schedule.name(),
                    "new team evaluator"
                );
                Arc::new(Mutex::new(TeamConversation {
                    evaluator: ChimeEvaluator::with_matchers(rules, semantic, schedule),
                    window: ConversationWindow::with_capacity(self.window_size),
                }))
            })
            .clone()
    }
}

fn scoped_rules(rules: &[Rule], team_id: &str) -> Vec<Rule> {
    rules
        .iter()
        .filter(|r| r.applies_to(team_id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_matches_whole_tokens_only() {
        let me = AgentIdentity::new("bot", "Nova").with_aliases(&["@ai"]);
        assert!(me.is_mentioned("hey @AI, can you help?"));
        assert!(me.is_mentioned("@nova what do you think"));
        assert!(me.is_mentioned("thoughts @ai"));
        assert!(!me.is_mentioned("email me at someone@aimail.com"));
        assert!(!me.is_mentioned("@airline tickets are pricey"));
        assert!(!me.is_mentioned("nothing to see"));
    }

    #[test]
    fn self_detection_is_exact() {
        let me = AgentIdentity::new("bot", "Nova");
        assert!(me.is_self("bot"));
        assert!(!me.is_self("bot2"));
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let v = serde_json::to_value(DispatchOutcome::Reactive {
            message_id: "m1".into(),
        })
        .unwrap();
        assert_eq!(v["outcome"], "reactive");
        assert_eq!(v["message_id"], "m1");
        let q = serde_json::to_value(DispatchOutcome::Quiet).unwrap();
        assert_eq!(q["outcome"], "quiet");
    }
}
