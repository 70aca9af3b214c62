use crate::logging::TraceId;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use observer_common::types::{Metric, MetricKind, MetricPayload, MetricQuery};
use observer_storage::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Error response body.
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    /// Numeric error code
    pub err_code: i32,
    /// Human-readable message
    pub err_msg: String,
    /// Trace id of the request (empty when unknown)
    pub trace_id: String,
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "forbidden" => 1003,
        "not_found" => 1004,
        "bad_signature" => 1010,
        "bad_data" => 1011,
        "unavailable" => 1503,
        "storage_error" => 1501,
        "internal_error" => 1500,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiError {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
        }),
    )
        .into_response()
}

/// Maps a storage failure onto the HTTP status the client sees.
pub fn storage_error_response(err: &StorageError, trace_id: &str) -> Response {
    match err {
        StorageError::NotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, trace_id, "not_found", &err.to_string())
        }
        StorageError::InvalidMetric(_) | StorageError::CounterOverflow { .. } => {
            error_response(StatusCode::BAD_REQUEST, trace_id, "bad_request", &err.to_string())
        }
        StorageError::Integrity(detail) => {
            tracing::warn!(trace_id = %trace_id, detail = %detail, "Integrity violation");
            error_response(StatusCode::BAD_REQUEST, trace_id, "bad_data", "bad data")
        }
        StorageError::Cancelled => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            trace_id,
            "unavailable",
            "server is shutting down",
        ),
        StorageError::Connection(_) => {
            tracing::error!(trace_id = %trace_id, error = %err, "Storage unreachable");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                trace_id,
                "storage_error",
                "storage unavailable",
            )
        }
        _ => {
            tracing::error!(trace_id = %trace_id, error = %err, "Storage failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                trace_id,
                "internal_error",
                "internal error",
            )
        }
    }
}

/// Decodes a JSON body, answering 400 (not 422) on any mismatch.
fn decode_json<T: DeserializeOwned>(body: &Bytes, trace_id: &str) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            &format!("invalid JSON body: {e}"),
        )
    })
}

/// List every stored metric.
///
/// One `name: value` entry per line, sorted by name, entries separated by a
/// comma.
#[utoipa::path(
    get,
    path = "/",
    tag = "Metrics",
    responses(
        (status = 200, description = "Metric listing", body = String, content_type = "text/html"),
        (status = 500, description = "Storage failure", body = ApiError)
    )
)]
pub async fn list_metrics(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    match state.storage.describe(&state.request_token()).await {
        Ok(listing) => Html(listing).into_response(),
        Err(e) => storage_error_response(&e, &trace_id),
    }
}

/// Storage health check.
#[utoipa::path(
    get,
    path = "/ping",
    tag = "Health",
    responses(
        (status = 200, description = "Storage reachable", body = String, content_type = "text/plain"),
        (status = 500, description = "Storage unreachable", body = ApiError)
    )
)]
pub async fn ping(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> Response {
    match state.storage.ping(&state.request_token()).await {
        Ok(()) => "pong".into_response(),
        Err(e) => {
            tracing::error!(trace_id = %trace_id, backend = state.storage.backend(), error = %e, "Ping failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "storage_error",
                "storage unavailable",
            )
        }
    }
}

/// Read one metric as JSON.
#[utoipa::path(
    post,
    path = "/value",
    tag = "Metrics",
    request_body = MetricQuery,
    responses(
        (status = 200, description = "Current value", body = Metric),
        (status = 400, description = "Malformed query", body = ApiError),
        (status = 404, description = "No such metric", body = ApiError)
    )
)]
pub async fn value_json(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let query: MetricQuery = match decode_json(&body, &trace_id) {
        Ok(query) => query,
        Err(resp) => return resp,
    };
    match state
        .storage
        .read(&query.id, query.kind, &state.request_token())
        .await
    {
        Ok(metric) => Json(metric).into_response(),
        Err(e) => storage_error_response(&e, &trace_id),
    }
}

/// Read one metric as plain text.
#[utoipa::path(
    get,
    path = "/value/{type}/{name}",
    tag = "Metrics",
    params(
        ("type" = String, Path, description = "`gauge` or `counter`"),
        ("name" = String, Path, description = "Metric name")
    ),
    responses(
        (status = 200, description = "Current value", body = String, content_type = "text/plain"),
        (status = 404, description = "No such metric or type", body = ApiError)
    )
)]
pub async fn value_text(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let Ok(kind) = kind.parse::<MetricKind>() else {
        return error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("unknown metric type '{kind}'"),
        );
    };
    match state.storage.read(&name, kind, &state.request_token()).await {
        Ok(metric) => match metric.value_text() {
            Some(text) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response(),
            None => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "internal_error",
                "stored metric has no value",
            ),
        },
        Err(e) => storage_error_response(&e, &trace_id),
    }
}

/// Apply one metric sent as JSON.
#[utoipa::path(
    post,
    path = "/update",
    tag = "Metrics",
    request_body = Metric,
    responses(
        (status = 200, description = "Stored value (counters carry the new total)", body = Metric),
        (status = 400, description = "Malformed metric or bad signature", body = ApiError)
    )
)]
pub async fn update_json(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let metric: Metric = match decode_json(&body, &trace_id) {
        Ok(metric) => metric,
        Err(resp) => return resp,
    };
    match state.storage.upsert(&metric, &state.request_token()).await {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => storage_error_response(&e, &trace_id),
    }
}

/// Apply one metric given in the path.
#[utoipa::path(
    post,
    path = "/update/{type}/{name}/{value}",
    tag = "Metrics",
    params(
        ("type" = String, Path, description = "`gauge` or `counter`"),
        ("name" = String, Path, description = "Metric name"),
        ("value" = String, Path, description = "Float for gauges, integer delta for counters")
    ),
    responses(
        (status = 200, description = "Stored value", body = Metric),
        (status = 400, description = "Unknown type or unparsable value", body = ApiError)
    )
)]
pub async fn update_path(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Response {
    let payload = match kind.parse::<MetricKind>() {
        Ok(MetricKind::Gauge) => value.trim().parse::<f64>().ok().map(MetricPayload::Gauge),
        Ok(MetricKind::Counter) => value.trim().parse::<i64>().ok().map(MetricPayload::Counter),
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &trace_id, "bad_request", &e.to_string())
        }
    };
    let Some(payload) = payload else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "bad_request",
            &format!("invalid {kind} value '{value}'"),
        );
    };

    let metric = Metric::from_payload(name, payload);
    match state.storage.upsert(&metric, &state.request_token()).await {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => storage_error_response(&e, &trace_id),
    }
}

/// Apply a batch of metrics, all or nothing.
#[utoipa::path(
    post,
    path = "/updates",
    tag = "Metrics",
    request_body = Vec<Metric>,
    responses(
        (status = 200, description = "Stored values sorted by name", body = Vec<Metric>),
        (status = 400, description = "Malformed batch or bad signature; nothing applied", body = ApiError)
    )
)]
pub async fn update_batch(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let metrics: Vec<Metric> = match decode_json(&body, &trace_id) {
        Ok(metrics) => metrics,
        Err(resp) => return resp,
    };
    match state
        .storage
        .upsert_batch(&metrics, &state.request_token())
        .await
    {
        Ok(mut stored) => {
            stored.sort_by(|a, b| a.id.cmp(&b.id));
            Json(stored).into_response()
        }
        Err(e) => storage_error_response(&e, &trace_id),
    }
}

pub fn metric_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(list_metrics))
        .routes(routes!(ping))
        .routes(routes!(value_json))
        .routes(routes!(value_text))
        .routes(routes!(update_json))
        .routes(routes!(update_path))
        .routes(routes!(update_batch))
}
