// src/routes.rs

use axum::{
    Json, Router,
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{answers, attempts, exams, ws},
    state::AppState,
    utils::jwt::auth_middleware,
};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Assembles the reference server router.
///
/// * REST routes under `/api/v1` sit behind the bearer-token middleware.
/// * The checkpoint channel authenticates from its query string instead.
/// * Applies global middleware (Trace, CORS).
pub fn create_router(state: AppState) -> Router {
    let origins = [
        HeaderValue::from_static("http://localhost:3000"),
        HeaderValue::from_static("http://127.0.0.1:3000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::HEAD])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let exam_routes = Router::new()
        .route("/{id}", get(exams::get_exam))
        .route("/{id}/attempts", post(attempts::start_attempt));

    let attempt_routes = Router::new()
        .route("/{id}", get(attempts::get_attempt))
        .route(
            "/{id}/answers",
            get(answers::list_answers).post(answers::save_answer),
        )
        .route("/{id}/submit", post(attempts::submit_attempt))
        .route("/{id}/result", get(attempts::get_result));

    let protected = Router::new()
        .nest("/exams", exam_routes)
        .nest("/attempts", attempt_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/ws/attempts/{id}", get(ws::attempt_socket))
        .nest("/api/v1", protected)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
