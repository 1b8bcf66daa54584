use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::publish::PublishDecision;
use crate::sqlite_util::{bool_to_int, format_datetime, parse_datetime, parse_optional_datetime};

mod schema;

use schema::SURVEY_SCHEMA;

#[derive(Debug)]
pub struct SurveyStore {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub published: bool,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub questions: Vec<Question>,
}

impl Survey {
    pub fn publish_state(&self) -> PublishState {
        PublishState {
            published: self.published,
            scheduled_time: self.scheduled_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub survey_id: Uuid,
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: String,
    pub options: Option<Vec<String>>,
    pub required: bool,
    pub order: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionInput {
    pub text: String,
    #[serde(rename = "type", default = "default_question_type")]
    pub question_type: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub order: i64,
}

pub(crate) fn default_question_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub survey_id: Uuid,
    pub answers: serde_json::Value,
    pub respondent_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The published flag and pending publish time, always written together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishState {
    pub published: bool,
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl PublishState {
    pub fn is_consistent(&self) -> bool {
        !(self.published && self.scheduled_time.is_some())
    }
}

impl From<PublishDecision> for PublishState {
    fn from(decision: PublishDecision) -> Self {
        Self {
            published: decision.published,
            scheduled_time: decision.scheduled_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSurvey {
    pub title: String,
    pub description: String,
    pub publish: PublishState,
}

#[derive(Debug, Clone, Default)]
pub struct SurveyChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub publish: Option<PublishState>,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseChanges {
    pub answers: Option<serde_json::Value>,
    /// `Some(None)` clears the stored address.
    pub respondent_email: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyStats {
    pub survey_id: Uuid,
    pub title: String,
    pub total_responses: i64,
    pub total_questions: i64,
    pub created_at: DateTime<Utc>,
    pub published: bool,
    pub scheduled_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    AlreadyPublished,
    NotScheduled,
    NotYetDue(DateTime<Utc>),
}

#[derive(Debug, thiserror::Error)]
pub enum SurveyStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("uuid parse error: {0}")]
    UuidParse(#[from] uuid::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("survey {0} is not published")]
    NotPublished(Uuid),
    #[error("a published survey cannot keep a scheduled time")]
    InconsistentPublishState,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl SurveyStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SurveyStoreError::NotFound { .. })
    }
}

struct SurveyRow {
    id: Uuid,
    title: String,
    description: String,
    published: bool,
    scheduled_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

const SURVEY_COLUMNS: &str = "id, title, description, published, scheduled_time, created_at";

impl SurveyStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SurveyStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn create_survey(
        &self,
        survey: NewSurvey,
        questions: &[QuestionInput],
    ) -> Result<Survey, SurveyStoreError> {
        ensure_consistent(&survey.publish)?;
        let title = normalize_title(&survey.title)?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO surveys (id, title, description, published, scheduled_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                title,
                survey.description,
                bool_to_int(survey.publish.published),
                survey.publish.scheduled_time.map(format_datetime),
                format_datetime(now),
            ],
        )?;
        insert_questions(&tx, id, questions, now)?;
        let created = load_survey(&tx, id)?;
        tx.commit()?;
        info!(
            "created survey {} (published={}, scheduled_time={:?})",
            id, created.published, created.scheduled_time
        );
        Ok(created)
    }

    pub fn get_survey(&self, id: Uuid) -> Result<Survey, SurveyStoreError> {
        let conn = self.open()?;
        load_survey(&conn, id)
    }

    pub fn list_surveys(&self) -> Result<Vec<Survey>, SurveyStoreError> {
        let conn = self.open()?;
        let rows = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SURVEY_COLUMNS} FROM surveys ORDER BY created_at, rowid"
            ))?;
            let rows = stmt.query_map([], read_survey_columns)?;
            let mut raw = Vec::new();
            for row in rows {
                raw.push(row?);
            }
            raw
        };
        let mut surveys = Vec::with_capacity(rows.len());
        for raw in rows {
            let row = survey_row_from_raw(raw)?;
            let questions = load_questions(&conn, row.id)?;
            surveys.push(row.into_survey(questions));
        }
        Ok(surveys)
    }

    /// Applies `changes` in one immediate transaction; `questions`, when given,
    /// replaces the whole question list.
    pub fn update_survey(
        &self,
        id: Uuid,
        changes: SurveyChanges,
        questions: Option<&[QuestionInput]>,
    ) -> Result<Survey, SurveyStoreError> {
        if let Some(publish) = changes.publish.as_ref() {
            ensure_consistent(publish)?;
        }
        let title = changes.title.as_deref().map(normalize_title).transpose()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_survey_row(&tx, id)?;
        let publish = changes.publish.unwrap_or(PublishState {
            published: current.published,
            scheduled_time: current.scheduled_time,
        });
        tx.execute(
            "UPDATE surveys
             SET title = ?1,
                 description = ?2,
                 published = ?3,
                 scheduled_time = ?4
             WHERE id = ?5",
            params![
                title.unwrap_or(current.title),
                changes.description.unwrap_or(current.description),
                bool_to_int(publish.published),
                publish.scheduled_time.map(format_datetime),
                id.to_string(),
            ],
        )?;
        if let Some(questions) = questions {
            tx.execute(
                "DELETE FROM questions WHERE survey_id = ?1",
                params![id.to_string()],
            )?;
            insert_questions(&tx, id, questions, Utc::now())?;
        }
        let updated = load_survey(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Upserts the survey row. Questions are left untouched.
    pub fn save_survey(&self, survey: &Survey) -> Result<(), SurveyStoreError> {
        ensure_consistent(&survey.publish_state())?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO surveys (id, title, description, published, scheduled_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 description = excluded.description,
                 published = excluded.published,
                 scheduled_time = excluded.scheduled_time",
            params![
                survey.id.to_string(),
                survey.title.as_str(),
                survey.description.as_str(),
                bool_to_int(survey.published),
                survey.scheduled_time.map(format_datetime),
                format_datetime(survey.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn delete_survey_cascade(&self, id: Uuid) -> Result<(), SurveyStoreError> {
        let conn = self.open()?;
        let deleted = conn.execute("DELETE FROM surveys WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(SurveyStoreError::NotFound {
                entity: "survey",
                id,
            });
        }
        info!("deleted survey {} with its questions and responses", id);
        Ok(())
    }

    /// Publishes a scheduled survey whose time has come.
    ///
    /// The check and the write share one immediate transaction, so a
    /// concurrent update either lands before (and is honored) or after.
    pub fn publish_if_due(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, SurveyStoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = load_survey_row(&tx, id)?;
        let outcome = if row.published {
            PublishOutcome::AlreadyPublished
        } else {
            match row.scheduled_time {
                None => PublishOutcome::NotScheduled,
                Some(scheduled_time) if scheduled_time > now => {
                    PublishOutcome::NotYetDue(scheduled_time)
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE surveys SET published = 1, scheduled_time = NULL WHERE id = ?1",
                        params![id.to_string()],
                    )?;
                    PublishOutcome::Published
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Unpublished surveys that still carry a pending publish time.
    pub fn scheduled_surveys(&self) -> Result<Vec<(Uuid, DateTime<Utc>)>, SurveyStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, scheduled_time FROM surveys
             WHERE published = 0 AND scheduled_time IS NOT NULL
             ORDER BY scheduled_time",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut scheduled = Vec::new();
        for row in rows {
            let (id_raw, scheduled_raw) = row?;
            scheduled.push((Uuid::parse_str(&id_raw)?, parse_datetime(&scheduled_raw)?));
        }
        Ok(scheduled)
    }

    pub fn create_response(
        &self,
        survey_id: Uuid,
        answers: serde_json::Value,
        respondent_email: Option<String>,
    ) -> Result<Response, SurveyStoreError> {
        if answers.is_null() {
            return Err(SurveyStoreError::InvalidInput(
                "answers are required".to_string(),
            ));
        }
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let survey = load_survey_row(&tx, survey_id)?;
        if !survey.published {
            return Err(SurveyStoreError::NotPublished(survey_id));
        }
        let response = Response {
            id: Uuid::new_v4(),
            survey_id,
            answers,
            respondent_email: normalize_email(respondent_email),
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO responses (id, survey_id, answers, respondent_email, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                response.id.to_string(),
                survey_id.to_string(),
                serde_json::to_string(&response.answers)?,
                response.respondent_email.as_deref(),
                format_datetime(response.created_at),
            ],
        )?;
        let stored = load_response(&tx, response.id)?;
        tx.commit()?;
        Ok(stored)
    }

    pub fn get_response(&self, id: Uuid) -> Result<Response, SurveyStoreError> {
        let conn = self.open()?;
        load_response(&conn, id)
    }

    pub fn list_responses(&self, survey_id: Uuid) -> Result<Vec<Response>, SurveyStoreError> {
        let conn = self.open()?;
        load_survey_row(&conn, survey_id)?;
        let mut stmt = conn.prepare(
            "SELECT id, survey_id, answers, respondent_email, created_at
             FROM responses
             WHERE survey_id = ?1
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![survey_id.to_string()], read_response_columns)?;
        let mut responses = Vec::new();
        for row in rows {
            responses.push(response_from_raw(row?)?);
        }
        Ok(responses)
    }

    pub fn update_response(
        &self,
        id: Uuid,
        changes: ResponseChanges,
    ) -> Result<Response, SurveyStoreError> {
        if matches!(changes.answers, Some(serde_json::Value::Null)) {
            return Err(SurveyStoreError::InvalidInput(
                "answers cannot be null".to_string(),
            ));
        }
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_response(&tx, id)?;
        let answers = changes.answers.unwrap_or(current.answers);
        let respondent_email = match changes.respondent_email {
            Some(value) => normalize_email(value),
            None => current.respondent_email,
        };
        tx.execute(
            "UPDATE responses SET answers = ?1, respondent_email = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&answers)?,
                respondent_email.as_deref(),
                id.to_string(),
            ],
        )?;
        let updated = load_response(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn delete_response(&self, id: Uuid) -> Result<(), SurveyStoreError> {
        let conn = self.open()?;
        let deleted = conn.execute("DELETE FROM responses WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(SurveyStoreError::NotFound {
                entity: "response",
                id,
            });
        }
        Ok(())
    }

    pub fn survey_stats(&self, id: Uuid) -> Result<SurveyStats, SurveyStoreError> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                &format!("{STATS_QUERY} WHERE s.id = ?1"),
                params![id.to_string()],
                read_stats_columns,
            )
            .optional()?
            .ok_or(SurveyStoreError::NotFound {
                entity: "survey",
                id,
            })?;
        stats_from_raw(raw)
    }

    pub fn all_survey_stats(&self) -> Result<Vec<SurveyStats>, SurveyStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!("{STATS_QUERY} ORDER BY s.created_at, s.rowid"))?;
        let rows = stmt.query_map([], read_stats_columns)?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(stats_from_raw(row?)?);
        }
        Ok(stats)
    }

    fn open(&self) -> Result<Connection, SurveyStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SURVEY_SCHEMA)?;
        Ok(conn)
    }
}

const STATS_QUERY: &str = "SELECT s.id, s.title, s.created_at, s.published, s.scheduled_time,
        (SELECT COUNT(*) FROM responses r WHERE r.survey_id = s.id),
        (SELECT COUNT(*) FROM questions q WHERE q.survey_id = s.id)
     FROM surveys s";

type RawSurvey = (String, String, String, i64, Option<String>, String);
type RawQuestion = (String, String, String, String, Option<String>, i64, i64, String);
type RawResponse = (String, String, String, Option<String>, String);
type RawStats = (String, String, String, i64, Option<String>, i64, i64);

impl SurveyRow {
    fn into_survey(self, questions: Vec<Question>) -> Survey {
        Survey {
            id: self.id,
            title: self.title,
            description: self.description,
            published: self.published,
            scheduled_time: self.scheduled_time,
            created_at: self.created_at,
            questions,
        }
    }
}

fn ensure_consistent(state: &PublishState) -> Result<(), SurveyStoreError> {
    if state.is_consistent() {
        Ok(())
    } else {
        Err(SurveyStoreError::InconsistentPublishState)
    }
}

fn normalize_title(raw: &str) -> Result<String, SurveyStoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SurveyStoreError::InvalidInput(
            "title is required".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn normalize_email(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(|trimmed| trimmed.to_string())
}

fn insert_questions(
    conn: &Connection,
    survey_id: Uuid,
    questions: &[QuestionInput],
    created_at: DateTime<Utc>,
) -> Result<(), SurveyStoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO questions (id, survey_id, text, question_type, options, required, position, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for question in questions {
        let text = question.text.trim();
        if text.is_empty() {
            return Err(SurveyStoreError::InvalidInput(
                "question text is required".to_string(),
            ));
        }
        let question_type = match question.question_type.trim() {
            "" => default_question_type(),
            value => value.to_string(),
        };
        let options = question
            .options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        stmt.execute(params![
            Uuid::new_v4().to_string(),
            survey_id.to_string(),
            text,
            question_type,
            options,
            bool_to_int(question.required),
            question.order,
            format_datetime(created_at),
        ])?;
    }
    Ok(())
}

fn read_survey_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSurvey> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn survey_row_from_raw(raw: RawSurvey) -> Result<SurveyRow, SurveyStoreError> {
    let (id_raw, title, description, published_raw, scheduled_raw, created_raw) = raw;
    Ok(SurveyRow {
        id: Uuid::parse_str(&id_raw)?,
        title,
        description,
        published: published_raw != 0,
        scheduled_time: parse_optional_datetime(scheduled_raw.as_deref())?,
        created_at: parse_datetime(&created_raw)?,
    })
}

fn load_survey_row(conn: &Connection, id: Uuid) -> Result<SurveyRow, SurveyStoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {SURVEY_COLUMNS} FROM surveys WHERE id = ?1"),
            params![id.to_string()],
            read_survey_columns,
        )
        .optional()?
        .ok_or(SurveyStoreError::NotFound {
            entity: "survey",
            id,
        })?;
    survey_row_from_raw(raw)
}

fn load_survey(conn: &Connection, id: Uuid) -> Result<Survey, SurveyStoreError> {
    let row = load_survey_row(conn, id)?;
    let questions = load_questions(conn, id)?;
    Ok(row.into_survey(questions))
}

fn load_questions(conn: &Connection, survey_id: Uuid) -> Result<Vec<Question>, SurveyStoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, survey_id, text, question_type, options, required, position, created_at
         FROM questions
         WHERE survey_id = ?1
         ORDER BY position, rowid",
    )?;
    let rows = stmt.query_map(params![survey_id.to_string()], |row| {
        Ok::<RawQuestion, rusqlite::Error>((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    })?;
    let mut questions = Vec::new();
    for row in rows {
        let (id_raw, survey_raw, text, question_type, options_raw, required, order, created_raw) =
            row?;
        let options = options_raw
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;
        questions.push(Question {
            id: Uuid::parse_str(&id_raw)?,
            survey_id: Uuid::parse_str(&survey_raw)?,
            text,
            question_type,
            options,
            required: required != 0,
            order,
            created_at: parse_datetime(&created_raw)?,
        });
    }
    Ok(questions)
}

fn read_response_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawResponse> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn response_from_raw(raw: RawResponse) -> Result<Response, SurveyStoreError> {
    let (id_raw, survey_raw, answers_raw, respondent_email, created_raw) = raw;
    Ok(Response {
        id: Uuid::parse_str(&id_raw)?,
        survey_id: Uuid::parse_str(&survey_raw)?,
        answers: serde_json::from_str(&answers_raw)?,
        respondent_email,
        created_at: parse_datetime(&created_raw)?,
    })
}

fn load_response(conn: &Connection, id: Uuid) -> Result<Response, SurveyStoreError> {
    let raw = conn
        .query_row(
            "SELECT id, survey_id, answers, respondent_email, created_at
             FROM responses
             WHERE id = ?1",
            params![id.to_string()],
            read_response_columns,
        )
        .optional()?
        .ok_or(SurveyStoreError::NotFound {
            entity: "response",
            id,
        })?;
    response_from_raw(raw)
}

fn read_stats_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawStats> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn stats_from_raw(raw: RawStats) -> Result<SurveyStats, SurveyStoreError> {
    let (id_raw, title, created_raw, published, scheduled_raw, total_responses, total_questions) =
        raw;
    Ok(SurveyStats {
        survey_id: Uuid::parse_str(&id_raw)?,
        title,
        total_responses,
        total_questions,
        created_at: parse_datetime(&created_raw)?,
        published: published != 0,
        scheduled_time: parse_optional_datetime(scheduled_raw.as_deref())?,
    })
}

#[cfg(test)]
mod tests;
