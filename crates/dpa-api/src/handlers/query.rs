//! Data query forwarding for `query` services

use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dpa_core::{QueryCall, QueryDataRequest, QueryDataResponse, RequestContext};
use tracing::instrument;

use super::BackendHandle;
use crate::error::ApiError;

/// Check that the request's datasource reference names this plugin and the
/// connection in the path
pub fn check_datasource(
    request: &QueryDataRequest,
    plugin_id: &str,
    connection_id: &str,
) -> Result<(), ApiError> {
    let reference = request
        .datasource_ref()
        .ok_or_else(|| ApiError::internal("missing datasource reference"))?;
    if reference.ds_type.as_deref() != Some(plugin_id) {
        return Err(ApiError::internal("invalid datasource type"));
    }
    if reference.uid.as_deref() != Some(connection_id) {
        return Err(ApiError::internal("invalid datasource UID"));
    }
    Ok(())
}

async fn query_inner(
    handle: &BackendHandle,
    ctx: &RequestContext,
    connection_id: &str,
    req: Request,
) -> Result<QueryDataResponse, ApiError> {
    let body = to_bytes(req.into_body(), handle.body_limit)
        .await
        .map_err(|e| ApiError::internal(format!("failed to read request body: {}", e)))?;
    let request: QueryDataRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::internal(format!("failed to decode query request: {}", e)))?;

    check_datasource(&request, &handle.plugin_id, connection_id)?;

    let plugin_context = handle
        .contexts
        .plugin_context(ctx, &handle.plugin_id, Some(connection_id))
        .await?;
    let call = QueryCall {
        plugin_context,
        queries: request.queries,
        from: request.from,
        to: request.to,
    };

    let plugin = handle.plugin()?;
    Ok(ctx.run(plugin.query_data(ctx, call)).await?)
}

/// `POST /apis/{group}/{version}/namespaces/{ns}/connections/{id}/query`
#[instrument(
    name = "query_data",
    skip(handle, req),
    fields(descriptor = %handle.name, error = tracing::field::Empty)
)]
pub async fn query(
    handle: Arc<BackendHandle>,
    namespace: String,
    connection_id: String,
    req: Request,
) -> Response {
    let ctx = handle.request_context(req.extensions());
    let _guard = ctx.cancel_on_drop();
    match query_inner(&handle, &ctx, &connection_id, req).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            e.record();
            e.into_response()
        }
    }
}
