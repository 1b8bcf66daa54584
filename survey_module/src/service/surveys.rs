use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::csv_import::parse_questions_csv;
use crate::mailer::survey_link;
use crate::publish::{decide_publish_state, PublishDecision};
use crate::survey_store::{NewSurvey, QuestionInput, Survey, SurveyChanges, SurveyStats};

use super::error::{blocking, ApiError};
use super::state::{AppState, SurveyScheduler};

const UNTITLED_SURVEY: &str = "Untitled Survey";

#[derive(Debug, Default, Deserialize)]
pub(super) struct SurveyPayload {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    published: Option<bool>,
    #[serde(default)]
    scheduled_time: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    questions: Option<Vec<QuestionInput>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SharePayload {
    emails: String,
    #[serde(default)]
    survey_link: Option<String>,
}

pub(super) fn parse_id(raw: &str, entity: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::NotFound(format!("{} {} not found", entity, raw)))
}

pub(super) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn has_schedule(scheduled_time: Option<&str>) -> bool {
    scheduled_time.is_some_and(|value| !value.trim().is_empty())
}

// An explicit flag wins; otherwise a supplied schedule means "not yet".
fn decide(
    published: Option<bool>,
    scheduled_time: Option<&str>,
    timezone: Option<&str>,
) -> Result<PublishDecision, ApiError> {
    let desired = published.unwrap_or_else(|| !has_schedule(scheduled_time));
    Ok(decide_publish_state(
        desired,
        scheduled_time,
        timezone,
        Utc::now(),
    )?)
}

// The survey row is already committed; a failed enqueue is repaired by the
// periodic orphan sweep, so it must not fail the request.
fn enqueue_publish(scheduler: &SurveyScheduler, survey_id: Uuid, fire_at: DateTime<Utc>) {
    if let Err(err) = scheduler.schedule_deferred_publish(survey_id, fire_at) {
        warn!(
            "survey {} saved but its publish task could not be enqueued: {}",
            survey_id, err
        );
    }
}

pub(super) async fn create_survey(
    State(state): State<AppState>,
    payload: Result<Json<SurveyPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<Survey>), ApiError> {
    let SurveyPayload {
        title,
        description,
        published,
        scheduled_time,
        timezone,
        questions,
    } = json_body(payload)?;
    let title = title.ok_or_else(|| ApiError::BadRequest("title is required".to_string()))?;
    let surveys = state.surveys.clone();
    let scheduler = state.scheduler.clone();

    let survey = blocking(move || {
        let decision = decide(published, scheduled_time.as_deref(), timezone.as_deref())?;
        let survey = surveys.create_survey(
            NewSurvey {
                title,
                description: description.unwrap_or_default(),
                publish: decision.into(),
            },
            questions.as_deref().unwrap_or(&[]),
        )?;
        if let Some(fire_at) = decision.enqueue {
            enqueue_publish(&scheduler, survey.id, fire_at);
        }
        Ok(survey)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(survey)))
}

pub(super) async fn list_surveys(
    State(state): State<AppState>,
) -> Result<Json<Vec<Survey>>, ApiError> {
    let surveys = state.surveys.clone();
    let listed = blocking(move || Ok(surveys.list_surveys()?)).await?;
    Ok(Json(listed))
}

pub(super) async fn get_survey(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Survey>, ApiError> {
    let id = parse_id(&raw_id, "survey")?;
    let surveys = state.surveys.clone();
    let survey = blocking(move || Ok(surveys.get_survey(id)?)).await?;
    Ok(Json(survey))
}

pub(super) async fn update_survey(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<SurveyPayload>, JsonRejection>,
) -> Result<Json<Survey>, ApiError> {
    let id = parse_id(&raw_id, "survey")?;
    let SurveyPayload {
        title,
        description,
        published,
        scheduled_time,
        timezone,
        questions,
    } = json_body(payload)?;
    let surveys = state.surveys.clone();
    let scheduler = state.scheduler.clone();

    let survey = blocking(move || {
        let decision = if published.is_some() || scheduled_time.is_some() {
            Some(decide(
                published,
                scheduled_time.as_deref(),
                timezone.as_deref(),
            )?)
        } else {
            None
        };
        let survey = surveys.update_survey(
            id,
            SurveyChanges {
                title,
                description,
                publish: decision.map(Into::into),
            },
            questions.as_deref(),
        )?;
        if let Some(fire_at) = decision.and_then(|decision| decision.enqueue) {
            enqueue_publish(&scheduler, id, fire_at);
        }
        Ok(survey)
    })
    .await?;

    Ok(Json(survey))
}

pub(super) async fn delete_survey(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&raw_id, "survey")?;
    let surveys = state.surveys.clone();
    blocking(move || Ok(surveys.delete_survey_cascade(id)?)).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("survey {} deleted", id)
    })))
}

/// Creates a published survey from a multipart CSV upload.
pub(super) async fn upload_survey(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Survey>), ApiError> {
    let mut file: Option<Vec<u8>> = None;
    let mut title: Option<String> = None;
    let mut description: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                file = Some(bytes.to_vec());
            }
            Some("title") => {
                title = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| ApiError::BadRequest(err.to_string()))?,
                );
            }
            Some("description") => {
                description = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| ApiError::BadRequest(err.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;
    let title = title
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNTITLED_SURVEY.to_string());
    let surveys = state.surveys.clone();

    let survey = blocking(move || {
        let questions = parse_questions_csv(&file)?;
        Ok(surveys.create_survey(
            NewSurvey {
                title,
                description: description.unwrap_or_default(),
                publish: PublishDecision::published().into(),
            },
            &questions,
        )?)
    })
    .await?;

    info!(
        "imported survey {} with {} question(s)",
        survey.id,
        survey.questions.len()
    );
    Ok((StatusCode::CREATED, Json(survey)))
}

pub(super) async fn survey_stats(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<SurveyStats>, ApiError> {
    let id = parse_id(&raw_id, "survey")?;
    let surveys = state.surveys.clone();
    let stats = blocking(move || Ok(surveys.survey_stats(id)?)).await?;
    Ok(Json(stats))
}

pub(super) async fn all_survey_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<SurveyStats>>, ApiError> {
    let surveys = state.surveys.clone();
    let stats = blocking(move || Ok(surveys.all_survey_stats()?)).await?;
    Ok(Json(stats))
}

/// Queues one invitation email to every listed address.
pub(super) async fn share_survey(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<SharePayload>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = parse_id(&raw_id, "survey")?;
    let payload = json_body(payload)?;
    let recipients = send_emails_module::split_recipients(&payload.emails);
    if recipients.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one email address is required".to_string(),
        ));
    }
    let dispatcher = state.emails.clone().ok_or_else(|| {
        ApiError::Unavailable("email delivery is not configured".to_string())
    })?;

    let surveys = state.surveys.clone();
    let survey = blocking(move || Ok(surveys.get_survey(id)?)).await?;
    let link = payload
        .survey_link
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| survey_link(&state.config.public_base_url, id));

    let count = recipients.len();
    let _detached = dispatcher.submit_invitation(&survey, recipients, &link);
    info!("queued invitation for survey {} to {} recipient(s)", id, count);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "survey_id": id,
            "recipients": count
        })),
    ))
}
