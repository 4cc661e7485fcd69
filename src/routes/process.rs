//! Process Routes
//!
//! Define, publish and inspect governance action processes.

use crate::caller::Caller;
use crate::error::AppError;
use crate::governance::{FirstStep, GovernanceActionProcess, GraphReport};
use crate::models::{
    validate_request, CreateProcessRequest, GuidResponse, ProcessListQuery, ProcessListResponse,
    SetFirstStepRequest, SuccessResponse, UpdateProcessRequest,
};
use crate::state::SharedState;
use crate::store::{Pagination, UpdateMode};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};

pub async fn create_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateProcessRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<GuidResponse>>), AppError> {
    validate_request(&req)?;
    let name = req.qualified_name.clone();
    let guid = state.graph.create_process(caller.as_str(), req.into()).await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            format!("Process '{}' created", name),
            GuidResponse { guid },
        )),
    ))
}

pub async fn list_processes(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ProcessListQuery>,
) -> Result<Json<SuccessResponse<ProcessListResponse>>, AppError> {
    validate_request(&query)?;
    let processes = state
        .graph
        .list_processes(
            caller.as_str(),
            query.status,
            Pagination::page(query.start_from, query.page_size),
        )
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Found {} process(es)", processes.len()),
        ProcessListResponse { processes },
    )))
}

pub async fn get_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<GovernanceActionProcess>>, AppError> {
    let process = state.graph.get_process(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data("Process retrieved", process)))
}

pub async fn update_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<UpdateProcessRequest>,
) -> Result<Json<SuccessResponse<GovernanceActionProcess>>, AppError> {
    validate_request(&req)?;
    let mode = if req.replace {
        UpdateMode::Replace
    } else {
        UpdateMode::Merge
    };
    let process = state
        .graph
        .update_process(caller.as_str(), &guid, req.into(), mode)
        .await?;
    Ok(Json(SuccessResponse::with_data("Process updated", process)))
}

pub async fn publish_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<GovernanceActionProcess>>, AppError> {
    let process = state.graph.publish_process(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Process '{}' is active", process.qualified_name),
        process,
    )))
}

pub async fn withdraw_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<GovernanceActionProcess>>, AppError> {
    let process = state.graph.withdraw_process(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Process '{}' withdrawn", process.qualified_name),
        process,
    )))
}

pub async fn delete_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<()>>, AppError> {
    state.graph.delete_process(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::<()>::message_only("Process deleted")))
}

// =============================================================================
// FIRST STEP
// =============================================================================

pub async fn get_first_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<FirstStep>>, AppError> {
    let first = state.graph.get_first_step(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data("First step retrieved", first)))
}

pub async fn set_first_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<SetFirstStepRequest>,
) -> Result<Json<SuccessResponse<GuidResponse>>, AppError> {
    validate_request(&req)?;
    let link_guid = state
        .graph
        .set_first_step(caller.as_str(), &guid, &req.step_guid, req.guard, req.mandatory_guard)
        .await?;
    Ok(Json(SuccessResponse::with_data(
        "First step set",
        GuidResponse { guid: link_guid },
    )))
}

pub async fn remove_first_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<()>>, AppError> {
    state.graph.remove_first_step(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::<()>::message_only("First step removed")))
}

pub async fn validate_process(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<GraphReport>>, AppError> {
    let report = state.graph.validate_process(caller.as_str(), &guid).await?;
    let message = if report.warnings.is_empty() {
        "Process graph is consistent".to_string()
    } else {
        format!("Process graph has {} warning(s)", report.warnings.len())
    };
    Ok(Json(SuccessResponse::with_data(message, report)))
}
