//! REST surface over the capture history and replay.

use axum::{
    body::Body,
    extract::{
        Path,
        Query,
        State,
    },
    http::StatusCode,
    response::{
        IntoResponse,
        Response,
    },
    routing,
    Json,
    Router,
};
use ferret::Replayer;
use ferret_store::{
    RequestFilter,
    RequestStore,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Debug)]
pub struct Context {
    store: RequestStore,
    replayer: Replayer,
}

pub fn router(store: RequestStore, replayer: Replayer) -> Router {
    let context = Context { store, replayer };

    Router::new()
        .route("/", routing::get(|| async { "ok" }))
        .route(
            "/history",
            routing::get(get_requests).delete(delete_requests),
        )
        .route("/history/:id", routing::get(get_request))
        .route(
            "/history/:id/send",
            routing::get(send_request).post(send_request),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, "404 - Not found") })
        .with_state(context)
}

/// The envelope all handlers answer with when there is no payload to send,
/// and every handler answers with on failure.
#[derive(Debug, Serialize)]
struct ResultModel {
    place: &'static str,
    success: bool,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    place: &'static str,
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn from_store(place: &'static str, error: ferret_store::Error) -> Self {
        let status = match &error {
            ferret_store::Error::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            place,
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ResultModel {
                place: self.place,
                success: false,
                message: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    scheme: Option<String>,
    method: Option<String>,
    host: Option<String>,
    limit: Option<i64>,
    last: Option<String>,
}

impl HistoryQuery {
    fn into_filter(self) -> RequestFilter {
        // newest first unless explicitly turned off
        let newest_first = !matches!(self.last.as_deref(), Some("false") | Some("0") | Some("-"));

        RequestFilter {
            scheme: self.scheme,
            method: self.method,
            host: self.host,
            limit: self.limit,
            newest_first,
        }
    }
}

async fn get_requests(
    State(context): State<Context>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    const PLACE: &str = "GetRequests";

    let requests = context
        .store
        .get_requests(&query.into_filter())
        .await
        .map_err(|error| ApiError::from_store(PLACE, error))?;

    Ok(Json(requests))
}

async fn get_request(
    State(context): State<Context>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    const PLACE: &str = "GetRequest";

    let request = context
        .store
        .get_request(id)
        .await
        .map_err(|error| ApiError::from_store(PLACE, error))?;

    Ok(Json(request))
}

async fn delete_requests(State(context): State<Context>) -> Result<impl IntoResponse, ApiError> {
    const PLACE: &str = "DeleteRequests";

    context
        .store
        .delete_requests()
        .await
        .map_err(|error| ApiError::from_store(PLACE, error))?;

    Ok(Json(ResultModel {
        place: PLACE,
        success: true,
        message: "no error".to_owned(),
    }))
}

/// Replays a stored request and streams the origin's response back.
async fn send_request(
    State(context): State<Context>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    const PLACE: &str = "SendRequest";

    let request = context
        .store
        .get_request(id)
        .await
        .map_err(|error| ApiError::from_store(PLACE, error))?;

    let upstream = context.replayer.replay(&request).await.map_err(|error| {
        ApiError {
            place: PLACE,
            status: StatusCode::BAD_GATEWAY,
            message: error.to_string(),
        }
    })?;

    let (parts, body) = upstream.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}
