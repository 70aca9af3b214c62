use crate::state::AppState;
use crate::{api, logging, middleware};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "observer API",
        description = "Metric collection endpoints for observer agents",
    ),
    tags(
        (name = "Health", description = "Storage health"),
        (name = "Metrics", description = "Metric updates and reads")
    )
)]
struct ApiDoc;

/// Builds the full HTTP application.
///
/// Layers, outermost first: CORS, response compression, request
/// decompression, request logging, trusted-subnet filter, payload integrity.
pub fn build_http_app(state: AppState) -> Router {
    let (metric_router, metric_spec) = api::metric_routes().split_for_parts();

    let mut spec = ApiDoc::openapi();
    spec.merge(metric_spec);
    let spec = Arc::new(spec);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    metric_router
        .route("/update/", post(api::update_json))
        .route("/updates/", post(api::update_batch))
        .route(
            "/openapi.json",
            get(move || {
                let spec = Arc::clone(&spec);
                async move { Json(spec.as_ref().clone()) }
            }),
        )
        .layer(from_fn_with_state(state.clone(), middleware::payload_integrity))
        .layer(from_fn_with_state(state.clone(), middleware::trusted_subnet))
        .with_state(state)
        .layer(from_fn(logging::request_logging))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(cors)
}
