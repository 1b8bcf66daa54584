use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::survey_store::{Response, ResponseChanges};

use super::error::{blocking, ApiError};
use super::state::AppState;
use super::surveys::{json_body, parse_id};

#[derive(Debug, Deserialize)]
pub(super) struct SubmitPayload {
    #[serde(default)]
    answers: Value,
    #[serde(default)]
    respondent_email: Option<String>,
}

pub(super) async fn submit_response(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<SubmitPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<Response>), ApiError> {
    let survey_id = parse_id(&raw_id, "survey")?;
    let SubmitPayload {
        answers,
        respondent_email,
    } = json_body(payload)?;
    let surveys = state.surveys.clone();
    let response = blocking(move || {
        Ok(surveys.create_response(survey_id, answers, respondent_email)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub(super) async fn list_survey_responses(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Vec<Response>>, ApiError> {
    let survey_id = parse_id(&raw_id, "survey")?;
    let surveys = state.surveys.clone();
    let responses = blocking(move || Ok(surveys.list_responses(survey_id)?)).await?;
    Ok(Json(responses))
}

pub(super) async fn get_response(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Response>, ApiError> {
    let id = parse_id(&raw_id, "response")?;
    let surveys = state.surveys.clone();
    let response = blocking(move || Ok(surveys.get_response(id)?)).await?;
    Ok(Json(response))
}

/// Only `answers` and `respondent_email` are writable; a JSON `null` email
/// clears it.
pub(super) async fn update_response(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Response>, ApiError> {
    let id = parse_id(&raw_id, "response")?;
    let body = json_body(payload)?;
    let object = body
        .as_object()
        .ok_or_else(|| ApiError::BadRequest("expected a JSON object".to_string()))?;
    let respondent_email = match object.get("respondent_email") {
        None => None,
        Some(Value::Null) => Some(None),
        Some(Value::String(value)) => Some(Some(value.clone())),
        Some(_) => {
            return Err(ApiError::BadRequest(
                "respondent_email must be a string or null".to_string(),
            ))
        }
    };
    let changes = ResponseChanges {
        answers: object.get("answers").cloned(),
        respondent_email,
    };
    let surveys = state.surveys.clone();
    let response = blocking(move || Ok(surveys.update_response(id, changes)?)).await?;
    Ok(Json(response))
}

pub(super) async fn delete_response(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&raw_id, "response")?;
    let surveys = state.surveys.clone();
    blocking(move || Ok(surveys.delete_response(id)?)).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("response {} deleted", id)
    })))
}
