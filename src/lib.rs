// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod action;
pub mod api;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod detectors;
pub mod dispatch;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod rules;
pub mod strategy;
pub mod telemetry;
pub mod window;

// ---- Re-exports for stable public API ----
pub use crate::action::{ChimeAction, GenerationRequest, Generator};
pub use crate::api::router;
pub use crate::dispatch::{AgentIdentity, DispatchOutcome, Dispatcher};
pub use crate::evaluator::ChimeEvaluator;
pub use crate::model::{
    ActionType, ChatMessage, Decision, EvaluationContext, InsightType, Priority, Rule,
    RuleAction, RuleConditions, RuleType,
};
