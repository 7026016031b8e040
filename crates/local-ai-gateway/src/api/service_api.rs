//! Flavor route handler: hands the request to the dispatcher and turns the
//! task's result stream into an HTTP response.
//!
//! The first result decides the shape: a terminal result becomes a single
//! response, a chunk starts a streaming body that runs until the terminal
//! result arrives.

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::metrics;
use crate::schedule::InboundRequest;
use crate::server::AppState;
use crate::types::{ResultKind, ServiceResult};

pub async fn handle_service(
    state: AppState,
    route: String,
    flavor: String,
    service: String,
    inbound: InboundRequest,
) -> Response {
    let (task_id, mut results) = match state
        .dispatcher
        .invoke_service(&flavor, &service, inbound)
        .await
    {
        Ok(started) => started,
        Err(e) => {
            warn!(%flavor, %service, error = %e, "request rejected");
            metrics::inc_request(&route, e.status_code().as_str());
            return error_response(&e);
        }
    };
    debug!(task_id, %flavor, %service, "awaiting first result");

    let first = match results.recv().await {
        Some(result) => result,
        None => {
            let e = GatewayError::QueueClosed;
            metrics::inc_request(&route, e.status_code().as_str());
            return error_response(&e);
        }
    };

    match first.kind {
        ResultKind::Done | ResultKind::Failed => {
            metrics::inc_request(&route, first.status.as_str());
            if let Some(e) = &first.error {
                info!(task_id, status = %first.status, error = %e, "task failed");
            }
            single_response(first)
        }
        ResultKind::Chunk => {
            metrics::inc_request(&route, StatusCode::OK.as_str());
            streaming_response(task_id, first, results)
        }
    }
}

fn with_headers(status: StatusCode, mut headers: HeaderMap, body: Body) -> Response {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn single_response(result: ServiceResult) -> Response {
    with_headers(result.status, result.http.headers, Body::from(result.http.body))
}

fn streaming_response(
    task_id: u64,
    first: ServiceResult,
    mut results: mpsc::Receiver<ServiceResult>,
) -> Response {
    let headers = first.http.headers.clone();
    let body = async_stream::stream! {
        yield Ok::<Bytes, std::io::Error>(first.http.body);
        while let Some(result) = results.recv().await {
            match result.kind {
                ResultKind::Chunk => yield Ok(result.http.body),
                ResultKind::Done => {
                    if !result.http.body.is_empty() {
                        yield Ok(result.http.body);
                    }
                    break;
                }
                ResultKind::Failed => {
                    // Status is already sent; the error text ends the stream.
                    if let Some(e) = result.error {
                        warn!(task_id, error = %e, "stream failed after first chunk");
                        yield Ok(Bytes::from(
                            serde_json::json!({ "error": e.to_string() }).to_string(),
                        ));
                    }
                    break;
                }
            }
        }
        debug!(task_id, "stream closed");
    };
    with_headers(StatusCode::OK, headers, Body::from_stream(body))
}

/// JSON `{"error": "..."}` with the error's status, or the upstream answer
/// verbatim.
pub fn error_response(error: &GatewayError) -> Response {
    match error {
        GatewayError::Upstream(resp) => with_headers(
            resp.status,
            resp.headers.clone(),
            Body::from(resp.body.clone()),
        ),
        other => (
            other.status_code(),
            Json(serde_json::json!({ "error": other.to_string() })),
        )
            .into_response(),
    }
}
