use std::sync::Arc;

use anyhow::Result;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod bootstrap;
mod cli;
mod dsn;
mod plugins;

use apimux_dispatch::ResolveRequest;
use apimux_format::EndpointSignature;
use bootstrap::App;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::CliArgs::parse();
    let app = Arc::new(bootstrap::bootstrap(args).await?);

    let router = axum::Router::new()
        .route("/healthz", get(|| async { StatusCode::NO_CONTENT }))
        .route("/status", get(status))
        .route("/candidates", get(candidates))
        .route("/keys/{key_id}/rpm", get(key_rpm))
        .with_state(app.clone());

    let bind = format!("{}:{}", app.global.host, app.global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn status(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let snapshot = app.state.snapshot.load();
    let settings = app.state.settings.load();
    Json(json!({
        "providers": snapshot.providers.iter().filter(|p| p.is_active).count(),
        "endpoints": snapshot.endpoints.iter().filter(|e| e.is_active).count(),
        "keys": snapshot.keys.iter().filter(|k| k.is_active).count(),
        "models": snapshot.models.iter().filter(|m| m.is_active).count(),
        "priority_mode": serde_json::to_value(settings.priority_mode).unwrap_or_default(),
        "scheduling_mode": serde_json::to_value(settings.scheduling_mode).unwrap_or_default(),
    }))
}

#[derive(Debug, Deserialize)]
struct CandidatesQuery {
    model: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    affinity_key: Option<String>,
}

/// Diagnostic view of the scheduler's decision for a model, in dispatch
/// order. Does not contact any upstream.
async fn candidates(
    State(app): State<Arc<App>>,
    Query(query): Query<CandidatesQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let client_format: EndpointSignature = query
        .format
        .as_deref()
        .unwrap_or("claude:chat")
        .parse()
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err}")))?;

    let resolved = app
        .candidates
        .resolve(&ResolveRequest {
            client_format,
            model_name: &query.model,
            affinity_key: query.affinity_key.as_deref().unwrap_or("diagnostic"),
            api_key_id: None,
            is_stream: false,
        })
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let rows: Vec<serde_json::Value> = resolved
        .candidates
        .iter()
        .map(|c| {
            json!({
                "provider": c.provider.name,
                "endpoint_id": c.endpoint.id,
                "key_id": c.key.id,
                "format": c.provider_api_format.to_string(),
                "model": c.mapping_matched_model,
                "needs_conversion": c.needs_conversion,
                "is_cached": c.is_cached,
                "is_skipped": c.is_skipped,
                "skip_reason": c.skip_reason,
            })
        })
        .collect();

    Ok(Json(json!({
        "resolved_model": resolved.resolved_model_name,
        "candidates": rows,
    })))
}

/// Adaptive rate-limit state for one upstream key.
async fn key_rpm(
    State(app): State<Arc<App>>,
    Path(key_id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = app.state.snapshot.load();
    let Some(key) = snapshot.key(key_id) else {
        return Err((StatusCode::NOT_FOUND, format!("unknown key {key_id}")));
    };
    let stats = app
        .tasks
        .executor()
        .adaptive()
        .stats(key_id, key.rpm_limit, OffsetDateTime::now_utc())
        .await;
    serde_json::to_value(&stats)
        .map(Json)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}
