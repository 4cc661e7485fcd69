//! Engine Action Routes
//!
//! Initiation, inspection and the claim/status/complete protocol used by
//! remote engine hosts.

use crate::caller::Caller;
use crate::error::AppError;
use crate::governance::{CompletionResult, EngineAction};
use crate::models::{
    validate_request, CancelRequest, ClaimRequest, ClaimResponse, CompleteRequest,
    EngineActionListQuery, EngineActionListResponse, GuidResponse, InitiateEngineActionRequest,
    InitiateProcessRequest, SuccessResponse, UpdateStatusRequest,
};
use crate::state::SharedState;
use crate::store::Pagination;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};

// =============================================================================
// INITIATION
// =============================================================================

pub async fn initiate_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<InitiateProcessRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<GuidResponse>>), AppError> {
    validate_request(&req)?;
    let name = req.process_qualified_name.clone();
    let guid = state
        .factory
        .initiate_process(caller.as_str(), req.into())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            format!("Process '{}' initiated", name),
            GuidResponse { guid },
        )),
    ))
}

pub async fn initiate_engine_action(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<InitiateEngineActionRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<GuidResponse>>), AppError> {
    validate_request(&req)?;
    let guid = state
        .factory
        .initiate_engine_action(caller.as_str(), req.into())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data("Engine action requested", GuidResponse { guid })),
    ))
}

// =============================================================================
// QUERIES
// =============================================================================

pub async fn list_engine_actions(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<EngineActionListQuery>,
) -> Result<Json<SuccessResponse<EngineActionListResponse>>, AppError> {
    validate_request(&query)?;
    let filter = query.filter()?;
    let engine_actions = state
        .actions
        .list_engine_actions(
            caller.as_str(),
            &filter,
            Pagination::page(query.start_from, query.page_size),
        )
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Found {} engine action(s)", engine_actions.len()),
        EngineActionListResponse { engine_actions },
    )))
}

pub async fn get_engine_action(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<EngineAction>>, AppError> {
    let action = state.actions.get_engine_action(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data("Engine action retrieved", action)))
}

// =============================================================================
// CLAIM PROTOCOL
// =============================================================================

/// A lost claim is a normal outcome: 200 with `claimed: false`
pub async fn claim_engine_action(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<SuccessResponse<ClaimResponse>>, AppError> {
    validate_request(&req)?;
    let claimed = state
        .actions
        .claim_engine_action(caller.as_str(), &guid, &req.engine_guid)
        .await?;
    let engine_action = state.actions.get_engine_action(caller.as_str(), &guid).await?;

    let message = if claimed {
        "Engine action claimed"
    } else {
        "Engine action is held by another engine"
    };
    Ok(Json(SuccessResponse::with_data(
        message,
        ClaimResponse {
            claimed,
            engine_action,
        },
    )))
}

pub async fn update_status(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<SuccessResponse<EngineAction>>, AppError> {
    validate_request(&req)?;
    let action = state
        .actions
        .update_engine_action_status(caller.as_str(), &guid, &req.engine_guid, req.status)
        .await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Engine action is now {}", action.status),
        action,
    )))
}

pub async fn complete_engine_action(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<SuccessResponse<CompletionResult>>, AppError> {
    validate_request(&req)?;
    let result = state
        .actions
        .record_completion(
            caller.as_str(),
            &guid,
            &req.engine_guid,
            req.status,
            req.guards,
            req.message,
        )
        .await?;
    Ok(Json(SuccessResponse::with_data(
        format!(
            "Engine action completed; {} successor(s) triggered",
            result.triggered_engine_action_guids.len()
        ),
        result,
    )))
}

pub async fn cancel_engine_action(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<SuccessResponse<EngineAction>>, AppError> {
    let action = state
        .actions
        .cancel_engine_action(caller.as_str(), &guid, req.message)
        .await?;
    Ok(Json(SuccessResponse::with_data("Engine action cancelled", action)))
}
