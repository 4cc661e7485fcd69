//! Step and Link Routes

use crate::caller::Caller;
use crate::error::AppError;
use crate::governance::{GovernanceActionStep, NextStepLink};
use crate::models::{
    validate_request, AddNextStepRequest, CreateStepRequest, GuidResponse, NextStepsResponse,
    StepDeletedResponse, SuccessResponse, UpdateLinkRequest, UpdateStepRequest,
};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};

pub async fn create_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateStepRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<GuidResponse>>), AppError> {
    validate_request(&req)?;
    let name = req.qualified_name.clone();
    let guid = state.graph.create_step(caller.as_str(), req.into()).await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            format!("Step '{}' created", name),
            GuidResponse { guid },
        )),
    ))
}

pub async fn get_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<GovernanceActionStep>>, AppError> {
    let step = state.graph.get_step(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data("Step retrieved", step)))
}

pub async fn update_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<UpdateStepRequest>,
) -> Result<Json<SuccessResponse<GovernanceActionStep>>, AppError> {
    validate_request(&req)?;
    let step = state
        .graph
        .update_step(caller.as_str(), &guid, req.into())
        .await?;
    Ok(Json(SuccessResponse::with_data("Step updated", step)))
}

/// Deleting a step keeps its links; the response lists what now dangles
pub async fn delete_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<StepDeletedResponse>>, AppError> {
    let warnings = state.graph.delete_step(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data(
        "Step deleted",
        StepDeletedResponse { warnings },
    )))
}

pub async fn get_next_steps(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<NextStepsResponse>>, AppError> {
    let links = state.graph.get_next_steps(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} next step link(s)", links.len()),
        NextStepsResponse { links },
    )))
}

pub async fn add_next_step(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<AddNextStepRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<GuidResponse>>), AppError> {
    validate_request(&req)?;
    let link_guid = state
        .graph
        .add_next_step_link(caller.as_str(), &guid, &req.next_step_guid, req.link_properties())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            "Next step linked",
            GuidResponse { guid: link_guid },
        )),
    ))
}

pub async fn update_link(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
    Json(req): Json<UpdateLinkRequest>,
) -> Result<Json<SuccessResponse<NextStepLink>>, AppError> {
    validate_request(&req)?;
    let link = state
        .graph
        .update_next_step_link(caller.as_str(), &guid, req.into())
        .await?;
    Ok(Json(SuccessResponse::with_data("Link updated", link)))
}

pub async fn remove_link(
    State(state): State<SharedState>,
    Extension(caller): Extension<Caller>,
    Path(guid): Path<String>,
) -> Result<Json<SuccessResponse<()>>, AppError> {
    state.graph.remove_next_step_link(caller.as_str(), &guid).await?;
    Ok(Json(SuccessResponse::<()>::message_only("Link removed")))
}
