//! Operator HTTP surface around the dispatcher: rule inspection, dry-run
//! dispatch, cooldown inspection/reset and rule reload. Not the chat transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::action::{ChimeAction, Generator, PromptPreview};
use crate::detectors::DEFAULT_SILENCE_MINUTES;
use crate::dispatch::{ConversationSignals, CooldownStatus, DispatchOutcome, Dispatcher};
use crate::model::{ChatMessage, Rule};
use crate::rules::{build_rule_set, HotReloadCatalog};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: Arc<HotReloadCatalog>,
    pub disabled: Arc<Vec<String>>,
    pub generator: Arc<dyn Generator>,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        catalog: Arc<HotReloadCatalog>,
        disabled: Vec<String>,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            disabled: Arc::new(disabled),
            generator: Arc::new(PromptPreview),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/rules", get(list_rules))
        .route("/cooldowns", get(list_cooldowns))
        .route("/signals", get(signals))
        .route("/dispatch", post(dispatch_message))
        .route("/admin/cooldowns/clear", post(clear_cooldown))
        .route("/admin/rules/reload", post(reload_rules))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct TeamQuery {
    team_id: String,
}

async fn list_rules(
    State(state): State<AppState>,
    Query(q): Query<TeamQuery>,
) -> Json<Vec<Rule>> {
    Json(state.dispatcher.rules_for(&q.team_id))
}

async fn list_cooldowns(
    State(state): State<AppState>,
    Query(q): Query<TeamQuery>,
) -> Json<Vec<CooldownStatus>> {
    Json(state.dispatcher.cooldowns_for(&q.team_id))
}

#[derive(Deserialize)]
struct SignalsQuery {
    team_id: String,
    #[serde(default)]
    silence_minutes: Option<i64>,
}

async fn signals(
    State(state): State<AppState>,
    Query(q): Query<SignalsQuery>,
) -> Result<Json<ConversationSignals>, StatusCode> {
    let minutes = q.silence_minutes.unwrap_or(DEFAULT_SILENCE_MINUTES);
    state
        .dispatcher
        .signals(&q.team_id, minutes)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct IncomingMessage {
    id: String,
    author_id: String,
    content: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>, // missing -> dispatcher clock
}

#[derive(Deserialize)]
struct DispatchReq {
    team_id: String,
    message: IncomingMessage,
    /// Also run the winning decision through the generator.
    #[serde(default)]
    execute: bool,
}

#[derive(Serialize)]
struct DispatchResp {
    #[serde(flatten)]
    outcome: DispatchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<ChimeAction>,
}

async fn dispatch_message(
    State(state): State<AppState>,
    Json(req): Json<DispatchReq>,
) -> Result<Json<DispatchResp>, (StatusCode, String)> {
    if req.team_id.trim().is_empty() || req.message.id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "team_id and message.id are required".into()));
    }

    let created_at = req
        .message
        .created_at
        .unwrap_or_else(|| state.dispatcher.now());
    let message = ChatMessage::new(
        req.message.id,
        req.message.author_id,
        req.message.content,
        created_at,
    );
    let outcome = state.dispatcher.handle_message(&req.team_id, message);

    let action = match (&outcome, req.execute) {
        (DispatchOutcome::Chime { decision, .. }, true) => {
            match state.dispatcher.execute(decision, state.generator.as_ref()).await {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(
                        target: "chime",
                        rule_id = %decision.rule.id,
                        error = %format!("{e:#}"),
                        "action execution failed"
                    );
                    return Err((StatusCode::BAD_GATEWAY, format!("{e:#}")));
                }
            }
        }
        _ => None,
    };

    Ok(Json(DispatchResp { outcome, action }))
}

#[derive(Deserialize)]
struct ClearReq {
    team_id: String,
    rule_id: String,
}

#[derive(Serialize)]
struct ClearResp {
    cleared: bool,
}

async fn clear_cooldown(
    State(state): State<AppState>,
    Json(req): Json<ClearReq>,
) -> Json<ClearResp> {
    let cleared = state.dispatcher.clear_cooldown(&req.team_id, &req.rule_id);
    info!(
        target: "chime",
        team_id = %req.team_id,
        rule_id = %req.rule_id,
        cleared,
        "cooldown reset requested"
    );
    Json(ClearResp { cleared })
}

#[derive(Serialize)]
struct ReloadResp {
    changed: bool,
    overrides: usize,
    rules: usize,
}

async fn reload_rules(State(state): State<AppState>) -> Json<ReloadResp> {
    let (catalog, changed) = state.catalog.current();
    let overrides = catalog.rules.len();
    let rules = build_rule_set(&state.disabled, catalog.rules);
    let total = rules.len();
    state.dispatcher.replace_rules(rules);
    Json(ReloadResp {
        changed,
        overrides,
        rules: total,
    })
}
