//! Turning a decision into something the agent posts.
//!
//! The generation collaborator (LLM client) sits behind [`Generator`]. The
//! engine hands it the rule's template plus the triggering messages and
//! wraps the returned text as a chat reply, an insight, or both, according
//! to the rule's action.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::model::{ActionType, ChatMessage, Decision, InsightType};

/// Prompt material for one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub team_id: String,
    pub rule_id: String,
    pub template: String,
    /// Triggering messages, oldest first.
    pub messages: Vec<ChatMessage>,
}

impl GenerationRequest {
    pub fn from_decision(decision: &Decision, messages: Vec<ChatMessage>) -> Self {
        Self {
            team_id: decision.team_id.clone(),
            rule_id: decision.rule.id.clone(),
            template: decision.rule.action.template.clone(),
            messages,
        }
    }

    /// Template followed by the triggering messages, one per line.
    pub fn render_prompt(&self) -> String {
        let mut out = self.template.trim().to_string();
        if !self.messages.is_empty() {
            out.push_str("\n\nMessages:\n");
            for m in &self.messages {
                out.push_str(&format!("- [{}] {}\n", m.author_id, m.content.trim()));
            }
        }
        out
    }
}

/// Text generation collaborator.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
    fn name(&self) -> &'static str;
}

/// Returns the rendered prompt as the "generated" text. Used by the operator
/// surface for dry runs when no model is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptPreview;

#[async_trait]
impl Generator for PromptPreview {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        Ok(request.render_prompt())
    }

    fn name(&self) -> &'static str {
        "prompt-preview"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub team_id: String,
    pub author_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightDraft {
    pub team_id: String,
    pub rule_id: String,
    pub insight_type: InsightType,
    pub content: String,
    pub triggering_message_ids: Vec<String>,
}

/// What the caller should post/persist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChimeAction {
    Chat { reply: ChatReply },
    Insight { insight: InsightDraft },
    Both { reply: ChatReply, insight: InsightDraft },
}

/// Wrap generated `text` according to the decision's action.
pub fn build_action(decision: &Decision, text: String, agent_id: &str) -> Result<ChimeAction> {
    let action = &decision.rule.action;
    let reply = || ChatReply {
        team_id: decision.team_id.clone(),
        author_id: agent_id.to_string(),
        content: text.clone(),
    };
    let insight = || -> Result<InsightDraft> {
        let insight_type = action.insight_type.ok_or_else(|| {
            anyhow!("rule `{}` produces an insight without insightType", decision.rule.id)
        })?;
        Ok(InsightDraft {
            team_id: decision.team_id.clone(),
            rule_id: decision.rule.id.clone(),
            insight_type,
            content: text.clone(),
            triggering_message_ids: decision.triggering_message_ids.clone(),
        })
    };

    Ok(match action.action_type {
        ActionType::ChatMessage => ChimeAction::Chat { reply: reply() },
        ActionType::Insight => ChimeAction::Insight { insight: insight()? },
        ActionType::Both => ChimeAction::Both {
            reply: reply(),
            insight: insight()?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Rule, RuleAction, RuleType};
    use chrono::{TimeZone, Utc};

    fn decision(action: RuleAction) -> Decision {
        Decision {
            rule: Rule::new("r", "R", RuleType::Pattern).with_action(action),
            team_id: "t".into(),
            triggering_message_ids: vec!["m1".into()],
            confidence: 0.5,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn chat_action_posts_as_agent() {
        let a = build_action(&decision(RuleAction::chat("x")), "hello".into(), "bot").unwrap();
        match a {
            ChimeAction::Chat { reply } => {
                assert_eq!(reply.author_id, "bot");
                assert_eq!(reply.content, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn both_carries_insight_kind_and_evidence() {
        let d = decision(RuleAction::both(InsightType::Suggestion, "x"));
        let a = build_action(&d, "try restarting".into(), "bot").unwrap();
        match a {
            ChimeAction::Both { reply, insight } => {
                assert_eq!(reply.content, insight.content);
                assert_eq!(insight.insight_type, InsightType::Suggestion);
                assert_eq!(insight.triggering_message_ids, vec!["m1"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn insight_without_kind_is_an_error() {
        let mut action = RuleAction::insight(InsightType::Summary, "x");
        action.insight_type = None;
        assert!(build_action(&decision(action), "s".into(), "bot").is_err());
    }

    #[test]
    fn prompt_lists_messages() {
        let req = GenerationRequest {
            team_id: "t".into(),
            rule_id: "r".into(),
            template: "Summarize. ".into(),
            messages: vec![ChatMessage::new(
                "m1",
                "alice",
                "let's go with A",
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            )],
        };
        assert_eq!(req.render_prompt(), "Summarize.\n\nMessages:\n- [alice] let's go with A\n");
    }
}
