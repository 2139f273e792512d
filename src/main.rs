//! Chime engine operator service.
//! Boots the Axum HTTP surface around the dispatcher: config, rule set,
//! tracing and the Prometheus exporter.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tracing::{info, warn};

use chime_engine::api::{self, AppState};
use chime_engine::clock::SystemClock;
use chime_engine::config::ChimeConfig;
use chime_engine::dispatch::Dispatcher;
use chime_engine::metrics::Metrics;
use chime_engine::model::Rule;
use chime_engine::rules::{build_rule_set, HotReloadCatalog};
use chime_engine::telemetry::init_tracing;

const RULE_RELOAD_PERIOD: Duration = Duration::from_secs(30);

/// Poll the overrides file and swap the rule set when it changes.
fn spawn_rule_reloader(
    dispatcher: Arc<Dispatcher>,
    catalog: Arc<HotReloadCatalog>,
    disabled: Vec<String>,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await; // first tick fires immediately
        loop {
            tick.tick().await;
            let (overrides, changed) = catalog.current();
            if changed {
                let rules: Vec<Rule> = build_rule_set(&disabled, overrides.rules);
                dispatcher.replace_rules(rules);
            }
        }
    });
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let cfg = ChimeConfig::load().context("loading chime config")?;

    // --- rule set: defaults, minus disabled, plus overrides ---
    let catalog = Arc::new(HotReloadCatalog::new(Some(&cfg.rules.overrides_path)));
    let (overrides, _) = catalog.current();
    let rules = build_rule_set(&cfg.rules.disabled, overrides.rules);
    info!(
        target: "chime",
        agent = %cfg.agent.id,
        rules = rules.len(),
        window = cfg.window.max_messages,
        "chime engine starting"
    );

    let dispatcher = Arc::new(Dispatcher::from_config(&cfg, rules, Arc::new(SystemClock)));
    spawn_rule_reloader(
        dispatcher.clone(),
        catalog.clone(),
        cfg.rules.disabled.clone(),
        RULE_RELOAD_PERIOD,
    );
    let state = AppState::new(dispatcher, catalog, cfg.rules.disabled.clone());
    let mut router = api::router(state);

    match Metrics::init() {
        Ok(m) => router = router.merge(m.router()),
        Err(e) => warn!(target: "chime", error = %format!("{e:#}"), "metrics disabled"),
    }

    Ok(router.into())
}
