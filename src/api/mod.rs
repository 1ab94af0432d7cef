//! Admin API for the scrubber control plane.
//!
//! Read-only views of the collector, baseline and escalation state, plus the
//! operator actions: resetting the baseline and forcing an escalation level.

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use futures::stream;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{
    Baseline, EscalationEngine, EscalationError, Level, Metrics, StatsCollector, Trigger,
};

/// Queue depth of a live stream subscriber; slow clients miss snapshots
const STREAM_BUFFER: usize = 4;

pub struct ApiState {
    pub collector: Arc<StatsCollector>,
    pub baseline: Arc<Baseline>,
    pub escalation: Arc<EscalationEngine>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/stats").route(web::get().to(current_stats)))
            .service(web::resource("/stats/stream").route(web::get().to(stream_stats)))
            .service(web::resource("/baseline").route(web::get().to(baseline_metrics)))
            .service(
                web::resource("/baseline/adaptive-rates").route(web::get().to(adaptive_rates)),
            )
            .service(web::resource("/baseline/reset").route(web::post().to(reset_baseline)))
            .service(web::resource("/escalation").route(web::get().to(escalation_status)))
            .service(
                web::resource("/escalation/history").route(web::get().to(escalation_history)),
            )
            .service(web::resource("/escalation/level").route(web::put().to(set_level))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct BaselineResponse {
    #[serde(flatten)]
    metrics: Metrics,
    sample_count: u64,
    operational: bool,
    last_push: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct EscalationResponse {
    level: Level,
    value: u64,
    triggers: Vec<Trigger>,
}

/// Manual level override request
#[derive(Debug, Serialize, Deserialize)]
pub struct SetLevelRequest {
    pub level: i64,
}

#[derive(Serialize)]
struct SetLevelResponse {
    level: Level,
    value: u64,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Latest collector snapshot
async fn current_stats(state: web::Data<ApiState>) -> impl Responder {
    match state.collector.current().await {
        Some(snapshot) => HttpResponse::Ok().json(snapshot.as_ref()),
        None => HttpResponse::NotFound().json(ErrorResponse {
            error: "no snapshot collected yet".to_string(),
        }),
    }
}

/// Live snapshots as server-sent events, one `data:` frame per poll
async fn stream_stats(state: web::Data<ApiState>) -> impl Responder {
    let snapshots = state.collector.subscribe(STREAM_BUFFER).await;

    let events = stream::unfold(snapshots, |mut snapshots| async move {
        let snapshot = snapshots.recv().await?;
        let frame = serde_json::to_string(snapshot.as_ref())
            .map(|json| web::Bytes::from(format!("data: {}\n\n", json)));
        Some((frame, snapshots))
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(events)
}

async fn baseline_metrics(state: web::Data<ApiState>) -> impl Responder {
    let baseline = &state.baseline;
    HttpResponse::Ok().json(BaselineResponse {
        metrics: baseline.metrics().await,
        sample_count: baseline.sample_count().await,
        operational: baseline.is_operational().await,
        last_push: baseline.last_push().await,
    })
}

async fn adaptive_rates(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.baseline.adaptive_rates().await)
}

/// Discard everything the baseline has learned
async fn reset_baseline(state: web::Data<ApiState>) -> impl Responder {
    warn!("Baseline reset requested through the admin API");
    state.baseline.reset().await;
    HttpResponse::NoContent().finish()
}

async fn escalation_status(state: web::Data<ApiState>) -> impl Responder {
    let level = state.escalation.level().await;
    HttpResponse::Ok().json(EscalationResponse {
        level,
        value: level.as_u64(),
        triggers: state.escalation.triggers().await,
    })
}

async fn escalation_history(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.escalation.history().await)
}

/// Force an escalation level, bypassing hysteresis
async fn set_level(
    state: web::Data<ApiState>,
    req: web::Json<SetLevelRequest>,
) -> impl Responder {
    match state.escalation.set_level(req.level).await {
        Ok(level) => HttpResponse::Ok().json(SetLevelResponse {
            level,
            value: level.as_u64(),
        }),
        Err(e @ EscalationError::InvalidLevel(_)) => {
            HttpResponse::BadRequest().json(ErrorResponse { error: e.to_string() })
        }
        Err(e @ EscalationError::ConfigMapError(_)) => {
            error!("Manual level override could not reach the data plane: {}", e);
            HttpResponse::BadGateway().json(ErrorResponse { error: e.to_string() })
        }
    }
}
