use crate::bus::MessageBus;
use crate::coordination::CoordinationStore;
use crate::hold_gate::{HoldGate, HoldStatus};
use crate::metrics;
use actix_web::{dev::Server, web, App, HttpResponse, HttpServer, Responder};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Handles shared with the read-only status surface.
#[derive(Clone)]
pub struct AppState {
    pub agent: String,
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn CoordinationStore>,
    pub gate: HoldGate,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    agent: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    halted: bool,
    notional_usd: String,
    bus: String,
    store: String,
}

#[derive(Serialize)]
pub struct HoldResponse {
    ticker: String,
    held: bool,
    until: Option<String>,
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> HttpResponse {
    error!("API {} failed: {}", context, e);
    HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
}

pub async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agent: data.agent.clone(),
    })
}

pub async fn get_status(data: web::Data<AppState>) -> HttpResponse {
    let halted = match data.store.get_halt().await {
        Ok(h) => h,
        Err(e) => return internal_error("status", e),
    };
    let notional = match data.store.get_notional().await {
        Ok(n) => n,
        Err(e) => return internal_error("status", e),
    };

    HttpResponse::Ok().json(StatusResponse {
        halted,
        notional_usd: notional.to_string(),
        bus: data.bus.name().to_string(),
        store: data.store.name().to_string(),
    })
}

pub async fn get_hold(data: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let ticker = path.into_inner();
    match data.gate.peek(&ticker).await {
        Ok(HoldStatus::Held { until }) => HttpResponse::Ok().json(HoldResponse {
            ticker,
            held: true,
            until: Some(until.to_rfc3339()),
        }),
        Ok(HoldStatus::Clear) => HttpResponse::Ok().json(HoldResponse {
            ticker,
            held: false,
            until: None,
        }),
        Err(e) => internal_error("hold lookup", e),
    }
}

pub async fn get_pending(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (topic, group) = path.into_inner();
    match data.bus.pending(&topic, &group).await {
        Ok(entries) => HttpResponse::Ok().json(serde_json::json!({
            "topic": topic,
            "group": group,
            "pending": entries,
        })),
        Err(e) => internal_error("pending", e),
    }
}

pub async fn get_metrics() -> HttpResponse {
    match metrics::render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => internal_error("metrics", e),
    }
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/status").route(web::get().to(get_status)))
        .service(web::resource("/holds/{ticker}").route(web::get().to(get_hold)))
        .service(web::resource("/pending/{topic}/{group}").route(web::get().to(get_pending)))
        .service(web::resource("/metrics").route(web::get().to(get_metrics)));
}

/// Bind the status server. Signals are left to the shutdown coordinator; stop it via
/// the returned server's handle.
pub fn serve(state: AppState, port: u16) -> std::io::Result<Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(config))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();
    Ok(server)
}
