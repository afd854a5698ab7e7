//! Axum route layer over the poller: trigger, token refresh, skills lookup, retraction, health.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use mjf_core::{Language, Skill, SkillCategory};
use mjf_storage::{Store, StoreCounts};
use mjf_sync::{CycleRunner, LastCycle, SyncService, TriggerError};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mjf-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub runner: Arc<CycleRunner>,
}

impl AppState {
    pub fn new(store: Store, runner: Arc<CycleRunner>) -> Self {
        Self { store, runner }
    }

    pub fn from_service(service: &SyncService) -> Self {
        Self::new(service.store().clone(), service.runner().clone())
    }
}

#[derive(Debug, Serialize)]
struct OfferSkillsView {
    offer_id: String,
    title: String,
    company: String,
    is_active: bool,
    must: Vec<Skill>,
    nice: Vec<Skill>,
    extra: Vec<Skill>,
    languages: Vec<Language>,
}

#[derive(Debug, Serialize)]
struct HealthView {
    status: &'static str,
    database: bool,
    cycle_running: bool,
    last_cycle: Option<LastCycle>,
    counts: Option<StoreCounts>,
    webhook_configured: bool,
    build_token_present: bool,
    build_token_fetched_at: Option<DateTime<Utc>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/cycles", post(trigger_cycle_handler))
        .route("/token/refresh", post(refresh_token_handler))
        .route("/offers/{offer_id}/skills", get(offer_skills_handler))
        .route("/notifications/retract", post(retract_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn trigger_cycle_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.trigger().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => trigger_error(err),
    }
}

async fn refresh_token_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.pipeline().refresh_token().await {
        Ok(token) => Json(json!({ "build_id": token.value, "fetched_at": token.fetched_at })).into_response(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "manual token refresh failed");
            error_response(StatusCode::BAD_GATEWAY, format!("{err:#}"))
        }
    }
}

async fn offer_skills_handler(
    State(state): State<Arc<AppState>>,
    Path(offer_id): Path<String>,
) -> Response {
    let offer = match state.store.get_offer(&offer_id).await {
        Ok(Some(offer)) => offer,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("offer {offer_id} not found")),
        Err(err) => return server_error(err.into()),
    };

    match state.store.skills_for_offer(&offer_id).await {
        Ok(detail) => {
            let grouped = |category| detail.skills_in(category).cloned().collect::<Vec<_>>();
            Json(OfferSkillsView {
                must: grouped(SkillCategory::Must),
                nice: grouped(SkillCategory::Nice),
                extra: grouped(SkillCategory::Extra),
                languages: detail.languages.clone(),
                offer_id: offer.offer_id,
                title: offer.title,
                company: offer.company,
                is_active: offer.is_active,
            })
            .into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn retract_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.retract().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => trigger_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let database = state.store.ping().await.is_ok();
    let counts = if database { state.store.counts().await.ok() } else { None };
    let token = if database { state.store.load_token().await.ok() } else { None };

    let view = HealthView {
        status: if database { "ok" } else { "unavailable" },
        database,
        cycle_running: state.runner.is_running(),
        last_cycle: state.runner.last_cycle(),
        counts,
        webhook_configured: state.runner.pipeline().has_notifier(),
        build_token_present: token.as_ref().is_some_and(|t| !t.is_empty()),
        build_token_fetched_at: token.and_then(|t| t.fetched_at),
    };
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(view)).into_response()
}

fn trigger_error(err: TriggerError) -> Response {
    let status = match err {
        TriggerError::AlreadyRunning => StatusCode::CONFLICT,
        TriggerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        TriggerError::Failed(_) | TriggerError::Panicked(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use mjf_adapters::{OfferSource, UpstreamError};
    use mjf_core::{BuildToken, OfferDetail, OfferSummary};
    use mjf_sync::{CyclePipeline, CycleSettings};
    use serde_json::Value as JsonValue;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn summary(id: &str) -> OfferSummary {
        OfferSummary {
            offer_id: id.to_string(),
            slug: format!("offer-{id}"),
            title: format!("Offer {id}"),
            company: "Acme".to_string(),
            company_logo_url: None,
            salary_from: None,
            salary_to: None,
            remote_percentage: None,
            location: None,
            raw: json!({ "id": id }),
        }
    }

    /// Two-offer upstream whose detail carries one must-have skill. `list_offers` can be held.
    #[derive(Default)]
    struct StubSource {
        hold: bool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl OfferSource for StubSource {
        async fn list_offers(&self) -> Result<Vec<OfferSummary>, UpstreamError> {
            if self.hold {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(vec![summary("1"), summary("2")])
        }

        async fn fetch_detail(&self, _offer_id: &str, _slug: &str) -> Result<OfferDetail, UpstreamError> {
            Ok(OfferDetail {
                skills: vec![Skill {
                    category: SkillCategory::Must,
                    name: "Rust".to_string(),
                    level: Some(4),
                    icon: None,
                    description: None,
                }],
                languages: vec![Language {
                    name: "English".to_string(),
                    level: Some("B2".to_string()),
                }],
            })
        }

        async fn refresh_token(&self) -> Result<BuildToken, UpstreamError> {
            Ok(BuildToken::new("fresh-build", Utc::now()))
        }
    }

    async fn state_with(source: Arc<StubSource>) -> AppState {
        let store = Store::in_memory().await.unwrap();
        let settings = CycleSettings {
            detail_concurrency: 2,
            notify_batch_size: 10,
            notify_delay: Duration::ZERO,
            offer_url_pattern: "https://jobs.test/{offer_id}".to_string(),
        };
        let pipeline = CyclePipeline::new(store.clone(), source, None, settings);
        AppState::new(store, Arc::new(CycleRunner::new(pipeline, CancellationToken::new())))
    }

    fn request(method: &str, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn cycle_then_skills_lookup() {
        let app = app(state_with(Arc::new(StubSource::default())).await);

        let resp = app.clone().oneshot(request("POST", "/cycles")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report = json_body(resp).await;
        assert_eq!(report["listed"], 2);
        assert_eq!(report["details_fetched"], 2);

        let resp = app.clone().oneshot(request("GET", "/offers/1/skills")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let view = json_body(resp).await;
        assert_eq!(view["must"][0]["name"], "Rust");
        assert_eq!(view["nice"].as_array().unwrap().len(), 0);
        assert_eq!(view["languages"][0]["level"], "B2");

        let resp = app.oneshot(request("GET", "/offers/999/skills")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_while_running_is_a_conflict() {
        let source = Arc::new(StubSource {
            hold: true,
            ..Default::default()
        });
        let state = state_with(source.clone()).await;
        let runner = state.runner.clone();
        let app = app(state);

        let background = tokio::spawn(async move { runner.trigger().await });
        source.entered.notified().await;

        let resp = app.clone().oneshot(request("POST", "/cycles")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = app.clone().oneshot(request("POST", "/notifications/retract")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app.clone().oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(json_body(resp).await["cycle_running"], true);

        source.release.notify_one();
        background.await.unwrap().unwrap();

        let resp = app.oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let health = json_body(resp).await;
        assert_eq!(health["cycle_running"], false);
        assert_eq!(health["last_cycle"]["ok"], true);
        assert_eq!(health["counts"]["active_offers"], 2);
        assert_eq!(health["webhook_configured"], false);
    }

    #[tokio::test]
    async fn token_refresh_and_retract_routes() {
        let app = app(state_with(Arc::new(StubSource::default())).await);

        let resp = app.clone().oneshot(request("POST", "/token/refresh")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["build_id"], "fresh-build");

        let resp = app.oneshot(request("POST", "/notifications/retract")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report = json_body(resp).await;
        assert_eq!(report["retired"], 0);
        assert_eq!(report["retracted"], 0);
    }

    #[tokio::test]
    async fn cancelled_runner_refuses_new_cycles() {
        let state = state_with(Arc::new(StubSource::default())).await;
        state.runner.cancel_token().cancel();
        let store = state.store.clone();
        let app = app(state);

        let resp = app.clone().oneshot(request("POST", "/cycles")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let resp = app.oneshot(request("POST", "/notifications/retract")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(store.counts().await.unwrap().active_offers, 0);
    }

    #[tokio::test]
    async fn health_reports_unavailable_store() {
        let state = state_with(Arc::new(StubSource::default())).await;
        state.store.pool().close().await;
        let resp = app(state).oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["database"], false);
    }
}
