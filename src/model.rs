//! Rules, chat messages, evaluation context and decisions.
//!
//! Wire format is camelCase JSON/TOML (the same shape the chat backend stores),
//! enum values are snake_case. `type` is the key for the rule type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Evaluation strategy selected by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Pattern,
    Threshold,
    Semantic,
    Schedule,
    Hybrid,
    /// Anything else coming from an external catalog. Never triggers.
    #[serde(other)]
    Unknown,
}

/// Rule priority. Total order: critical > high > medium > low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Higher rank wins when several rules fire on the same message.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ChatMessage,
    Insight,
    Both,
}

impl ActionType {
    pub fn includes_chat(self) -> bool {
        matches!(self, ActionType::ChatMessage | ActionType::Both)
    }

    pub fn includes_insight(self) -> bool {
        matches!(self, ActionType::Insight | ActionType::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Action,
    Suggestion,
    Analysis,
    Summary,
}

/// Optional matching parameters. Which ones matter depends on the rule type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    /// Regex strings, matched case-insensitively.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    /// Plain substrings, matched case-insensitively.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window_minutes: Option<u32>,
    /// Reserved for vector similarity; currently served by the keyword fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_query: Option<String>,
    /// Reserved cron-like expression; currently served by the activity fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// What happens when a rule fires. `template` is the prompt handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_type: Option<InsightType>,
    #[serde(default)]
    pub template: String,
}

impl RuleAction {
    pub fn chat(template: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::ChatMessage,
            insight_type: None,
            template: template.into(),
        }
    }

    pub fn insight(kind: InsightType, template: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Insight,
            insight_type: Some(kind),
            template: template.into(),
        }
    }

    pub fn both(kind: InsightType, template: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Both,
            insight_type: Some(kind),
            template: template.into(),
        }
    }

    /// Needs a non-blank template; an action that produces an insight must
    /// also say which kind.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.template.trim().is_empty() {
            anyhow::bail!("action has an empty template");
        }
        if self.action_type.includes_insight() && self.insight_type.is_none() {
            anyhow::bail!(
                "action type {:?} requires an insightType",
                self.action_type
            );
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

/// A named, typed behavioral trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub priority: Priority,
    #[serde(default)]
    pub cooldown_minutes: u32,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub action: RuleAction,
    /// Global when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

impl Rule {
    /// Enabled, medium priority, no cooldown, chat action templated with the rule name.
    pub fn new(id: impl Into<String>, name: impl Into<String>, rule_type: RuleType) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            action: RuleAction::chat(name.clone()),
            name,
            rule_type,
            enabled: true,
            priority: Priority::Medium,
            cooldown_minutes: 0,
            conditions: RuleConditions::default(),
            team_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cooldown(mut self, minutes: u32) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_patterns<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.conditions.patterns = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        self
    }

    pub fn with_keywords<S: AsRef<str>>(mut self, keywords: &[S]) -> Self {
        self.conditions.keywords = keywords.iter().map(|k| k.as_ref().to_string()).collect();
        self
    }

    pub fn with_message_count(mut self, count: u32) -> Self {
        self.conditions.message_count = Some(count);
        self
    }

    pub fn with_time_window(mut self, minutes: u32) -> Self {
        self.conditions.time_window_minutes = Some(minutes);
        self
    }

    pub fn with_schedule(mut self, expr: impl Into<String>) -> Self {
        self.conditions.schedule = Some(expr.into());
        self
    }

    pub fn with_semantic_query(mut self, query: impl Into<String>) -> Self {
        self.conditions.semantic_query = Some(query.into());
        self
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = action;
        self
    }

    pub fn for_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// True when the rule is global or scoped to `team_id`.
    pub fn applies_to(&self, team_id: &str) -> bool {
        self.team_id.as_deref().map_or(true, |t| t == team_id)
    }
}

/// One chat message as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            author_id: author_id.into(),
            created_at,
        }
    }
}

/// Previously emitted insight. Carried through the context, not used for matching yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentInsight {
    pub id: String,
    pub insight_type: InsightType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Input to one evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    pub team_id: String,
    /// Oldest first.
    pub recent_messages: Vec<ChatMessage>,
    /// The message that just arrived, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_message_id: Option<String>,
    #[serde(default)]
    pub recent_insights: Vec<RecentInsight>,
    pub current_time: DateTime<Utc>,
}

impl EvaluationContext {
    pub fn new(
        team_id: impl Into<String>,
        recent_messages: Vec<ChatMessage>,
        current_time: DateTime<Utc>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            recent_messages,
            new_message_id: None,
            recent_insights: Vec::new(),
            current_time,
        }
    }

    pub fn with_new_message(mut self, id: impl Into<String>) -> Self {
        self.new_message_id = Some(id.into());
        self
    }
}

/// A rule that fired during one evaluation pass. Not persisted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub rule: Rule,
    pub team_id: String,
    pub triggering_message_ids: Vec<String>,
    /// In `[0.0, 1.0]`.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}
