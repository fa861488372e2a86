//! Admission webhook translation
//!
//! Inbound `AdmissionReview` envelopes are turned into plugin admission
//! calls. For mutations the backend returns the whole mutated object and the
//! envelope gets an RFC 6902 patch computed against the inbound object.

use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dpa_core::models::PATCH_TYPE_JSON_PATCH;
use dpa_core::{
    AdmissionCall, AdmissionOperation, AdmissionRequest, AdmissionResponse, AdmissionReview,
    RequestContext, Status, ADMISSION_REVIEW_KIND,
};
use serde_json::Value;
use tracing::instrument;

use super::{is_json_content, BackendHandle};
use crate::error::ApiError;

/// Decoded and checked inbound review
struct InboundReview {
    review: AdmissionReview,
    request: AdmissionRequest,
    operation: AdmissionOperation,
}

async fn decode_review(handle: &BackendHandle, req: Request) -> Result<InboundReview, ApiError> {
    if !is_json_content(req.headers()) {
        return Err(ApiError::internal(
            "unsupported content type, expected application/json",
        ));
    }
    let body = to_bytes(req.into_body(), handle.body_limit)
        .await
        .map_err(|e| ApiError::internal(format!("failed to read request body: {}", e)))?;
    let mut review: AdmissionReview = serde_json::from_slice(&body)
        .map_err(|e| ApiError::internal(format!("failed to decode admission review: {}", e)))?;
    if review.kind != ADMISSION_REVIEW_KIND {
        return Err(ApiError::internal(format!(
            "unexpected kind {:?}, expected {}",
            review.kind, ADMISSION_REVIEW_KIND
        )));
    }
    let request = review
        .request
        .take()
        .ok_or_else(|| ApiError::internal("admission review has no request"))?;
    let operation = request
        .parse_operation()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    tracing::Span::current().record("uid", request.uid.as_str());
    tracing::Span::current().record("operation", operation.as_str());

    Ok(InboundReview {
        review,
        request,
        operation,
    })
}

fn object_bytes(object: Option<&Value>) -> Result<Vec<u8>, ApiError> {
    match object {
        Some(v) => serde_json::to_vec(v)
            .map_err(|e| ApiError::internal(format!("failed to encode object: {}", e))),
        None => Ok(Vec::new()),
    }
}

async fn admission_call(
    handle: &BackendHandle,
    ctx: &RequestContext,
    inbound: &InboundReview,
) -> Result<AdmissionCall, ApiError> {
    let plugin_context = handle
        .contexts
        .plugin_context(ctx, &handle.plugin_id, None)
        .await?;
    Ok(AdmissionCall {
        plugin_context,
        operation: inbound.operation,
        kind: inbound.request.kind.clone(),
        object_bytes: object_bytes(inbound.request.object.as_ref())?,
        old_object_bytes: object_bytes(inbound.request.old_object.as_ref())?,
    })
}

/// RFC 6902 patch turning `original` into `mutated`.
///
/// An empty `mutated` means the backend left the object alone.
pub fn compute_patch(original: &[u8], mutated: &[u8]) -> Result<Vec<u8>, ApiError> {
    if mutated.is_empty() {
        return Ok(b"[]".to_vec());
    }
    let from: Value = if original.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(original)
            .map_err(|e| ApiError::internal(format!("failed to decode original object: {}", e)))?
    };
    let to: Value = serde_json::from_slice(mutated)
        .map_err(|e| ApiError::internal(format!("failed to decode mutated object: {}", e)))?;
    let patch = json_patch::diff(&from, &to);
    serde_json::to_vec(&patch).map_err(|e| ApiError::internal(format!("failed to encode patch: {}", e)))
}

/// Attach the generic denial status when the backend disallowed without
/// saying why
fn denial_result(allowed: bool, result: Option<Status>) -> Option<Status> {
    match (allowed, result) {
        (false, None) => Some(Status::default_denial()),
        (_, result) => result,
    }
}

async fn mutate_inner(
    handle: &BackendHandle,
    ctx: &RequestContext,
    req: Request,
) -> Result<AdmissionReview, ApiError> {
    let inbound = decode_review(handle, req).await?;
    let call = admission_call(handle, ctx, &inbound).await?;
    let original = call.object_bytes.clone();

    let plugin = handle.plugin()?;
    let result = ctx.run(plugin.mutate_admission(ctx, call)).await?;

    let patch = compute_patch(&original, &result.object_bytes)?;
    let response = AdmissionResponse {
        uid: inbound.request.uid.clone(),
        allowed: result.allowed,
        patch: Some(STANDARD.encode(patch)),
        patch_type: Some(PATCH_TYPE_JSON_PATCH.to_string()),
        warnings: result.warnings,
        result: denial_result(result.allowed, result.result),
    };
    Ok(inbound.review.reply(response))
}

async fn validate_inner(
    handle: &BackendHandle,
    ctx: &RequestContext,
    req: Request,
) -> Result<AdmissionReview, ApiError> {
    let inbound = decode_review(handle, req).await?;
    let call = admission_call(handle, ctx, &inbound).await?;

    let plugin = handle.plugin()?;
    let result = ctx.run(plugin.validate_admission(ctx, call)).await?;

    let response = AdmissionResponse {
        uid: inbound.request.uid.clone(),
        allowed: result.allowed,
        patch: None,
        patch_type: None,
        warnings: result.warnings,
        result: denial_result(result.allowed, result.result),
    };
    Ok(inbound.review.reply(response))
}

/// `POST /apis/{group}/{version}/admission/mutate`
#[instrument(
    name = "admission_mutate",
    skip_all,
    fields(descriptor = %handle.name, uid = tracing::field::Empty, operation = tracing::field::Empty, error = tracing::field::Empty)
)]
pub async fn mutate(handle: Arc<BackendHandle>, req: Request) -> Response {
    let ctx = handle.request_context(req.extensions());
    let _guard = ctx.cancel_on_drop();
    match mutate_inner(&handle, &ctx, req).await {
        Ok(review) => Json(review).into_response(),
        Err(e) => {
            e.record();
            e.into_response()
        }
    }
}

/// `POST /apis/{group}/{version}/admission/validate`
#[instrument(
    name = "admission_validate",
    skip_all,
    fields(descriptor = %handle.name, uid = tracing::field::Empty, operation = tracing::field::Empty, error = tracing::field::Empty)
)]
pub async fn validate(handle: Arc<BackendHandle>, req: Request) -> Response {
    let ctx = handle.request_context(req.extensions());
    let _guard = ctx.cancel_on_drop();
    match validate_inner(&handle, &ctx, req).await {
        Ok(review) => Json(review).into_response(),
        Err(e) => {
            e.record();
            e.into_response()
        }
    }
}
