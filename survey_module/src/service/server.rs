use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::task;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::mailer::{NotificationSender, PostmarkNotificationSender};
use crate::scheduler::start_scheduler_threads;

use super::config::ServiceConfig;
use super::responses::{
    delete_response, get_response, list_survey_responses, submit_response, update_response,
};
use super::state::AppState;
use super::surveys::{
    all_survey_stats, create_survey, delete_survey, get_survey, list_surveys, share_survey,
    survey_stats, update_survey, upload_survey,
};
use super::BoxError;

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);
    let sender = config.postmark.clone().map(|postmark| {
        Arc::new(PostmarkNotificationSender::new(postmark)) as Arc<dyn NotificationSender>
    });
    let state = {
        let config = config.clone();
        task::spawn_blocking(move || -> Result<AppState, BoxError> {
            let state = AppState::new(config, sender)?;
            state.reconcile()?;
            Ok(state)
        })
        .await
        .map_err(|err| -> BoxError { err.into() })??
    };

    let mut scheduler_control = start_scheduler_threads(
        state.scheduler.clone(),
        config.scheduler_poll_interval,
        config.scheduler_max_concurrency,
    );
    {
        let state = state.clone();
        scheduler_control.spawn_periodic(config.scheduler_reconcile_interval, move || {
            if let Err(err) = state.requeue_orphaned_publishes() {
                error!("periodic publish reconciliation failed: {}", err);
            }
        });
    }

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("survey service listening on {}", addr);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    scheduler_control.stop_and_join();
    serve_result?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.inbound_body_max_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/survey/ping", get(health))
        .route("/surveys", get(list_surveys).post(create_survey))
        .route("/surveys/upload", post(upload_survey))
        .route("/surveys/stats", get(all_survey_stats))
        .route(
            "/surveys/:survey_id",
            get(get_survey).put(update_survey).delete(delete_survey),
        )
        .route("/surveys/:survey_id/submit", post(submit_response))
        .route("/surveys/:survey_id/responses", get(list_survey_responses))
        .route("/surveys/:survey_id/stats", get(survey_stats))
        .route("/surveys/:survey_id/share", post(share_survey))
        .route(
            "/responses/:response_id",
            get(get_response)
                .put(update_response)
                .delete(delete_response),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
