// src/metrics.rs
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const EVALUATIONS_TOTAL: &str = "chime_evaluations_total";
pub const DECISIONS_TOTAL: &str = "chime_decisions_total";
pub const COOLDOWN_SUPPRESSED_TOTAL: &str = "chime_cooldown_suppressed_total";
pub const DISPATCH_TOTAL: &str = "chime_dispatch_total";

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// Register help text for the engine's counters on the current recorder.
pub fn describe() {
    describe_counter!(EVALUATIONS_TOTAL, "Evaluation passes run");
    describe_counter!(DECISIONS_TOTAL, "Rules that fired");
    describe_counter!(
        COOLDOWN_SUPPRESSED_TOTAL,
        "Rule checks skipped because the rule was cooling down"
    );
    describe_counter!(DISPATCH_TOTAL, "Incoming messages by routing outcome");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ChimeEvaluator;
    use crate::model::{ChatMessage, EvaluationContext, Rule, RuleType};
    use chrono::Utc;

    #[test]
    fn evaluation_counters_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            let now = Utc::now();
            let rule = Rule::new("r", "R", RuleType::Pattern)
                .with_patterns(&["ship it"])
                .with_cooldown(30);
            let mut ev = ChimeEvaluator::new(vec![rule]);
            let msg = ChatMessage::new("m1", "u1", "ok, ship it", now);
            let ctx = EvaluationContext::new("t", vec![msg], now).with_new_message("m1");
            assert_eq!(ev.evaluate(&ctx).len(), 1);
            assert!(ev.evaluate(&ctx).is_empty());
        });

        let text = handle.render();
        assert!(text.contains("chime_evaluations_total 2"), "{text}");
        assert!(text.contains("chime_decisions_total 1"), "{text}");
        assert!(text.contains("chime_cooldown_suppressed_total 1"), "{text}");
    }
}
