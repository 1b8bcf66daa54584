mod test_support;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};
use survey_module::mailer::NotificationSender;
use survey_module::scheduler::{start_scheduler_threads, TaskKind};
use survey_module::service::router;
use tempfile::TempDir;
use uuid::Uuid;

use test_support::{send, send_json, test_state, wait_until, RecordingSender};

fn survey_id(body: &Value) -> Uuid {
    body["id"]
        .as_str()
        .and_then(|value| Uuid::parse_str(value).ok())
        .expect("survey id")
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    for path in ["/health", "/survey/ping"] {
        let (status, body) = send_json(&app, Method::GET, path, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}

#[tokio::test]
async fn create_list_and_fetch_surveys() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    let (status, created) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({
            "title": "Team lunch",
            "description": "Pick a place",
            "questions": [
                {"text": "Any allergies?", "order": 2},
                {"text": "Cuisine", "type": "multiple_choice", "options": ["Thai", "Pizza"], "required": true, "order": 1}
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["title"], "Team lunch");
    assert_eq!(created["published"], true);
    assert_eq!(created["scheduled_time"], Value::Null);
    let questions = created["questions"].as_array().expect("questions");
    assert_eq!(questions.len(), 2);
    assert_eq!(questions[0]["text"], "Cuisine");
    assert_eq!(questions[0]["type"], "multiple_choice");
    assert_eq!(questions[1]["type"], "text");

    let id = survey_id(&created);
    let (status, fetched) =
        send_json(&app, Method::GET, &format!("/surveys/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    let (status, listed) = send_json(&app, Method::GET, "/surveys", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    let (status, body) =
        send_json(&app, Method::POST, "/surveys", Some(json!({"description": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, _) =
        send_json(&app, Method::POST, "/surveys", Some(json!({"title": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/surveys")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({"title": "Bad time", "scheduled_time": "next tuesday"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(&app, Method::GET, "/surveys/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) =
        send_json(&app, Method::GET, &format!("/surveys/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) =
        send_json(&app, Method::DELETE, &format!("/surveys/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scheduled_survey_waits_for_its_publish_task() {
    let temp = TempDir::new().expect("tempdir");
    let state = test_state(temp.path(), None);
    let app = router(state.clone());

    let (status, created) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({
            "title": "Quarterly pulse",
            "scheduled_time": "2099-03-01T09:00",
            "timezone": "America/New_York"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["published"], false);
    assert_eq!(created["scheduled_time"], "2099-03-01T14:00:00Z");

    let id = survey_id(&created);
    let pending = state.scheduler.pending_tasks().expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, TaskKind::PublishSurvey { survey_id: id });

    let (status, _) = send_json(
        &app,
        Method::POST,
        &format!("/surveys/{}/submit", id),
        Some(json!({"answers": {"q": "early"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, updated) = send_json(
        &app,
        Method::PUT,
        &format!("/surveys/{}", id),
        Some(json!({"published": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["published"], true);
    assert_eq!(updated["scheduled_time"], Value::Null);
}

#[tokio::test]
async fn past_schedule_publishes_immediately() {
    let temp = TempDir::new().expect("tempdir");
    let state = test_state(temp.path(), None);
    let app = router(state.clone());

    let (status, created) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({"title": "Late", "scheduled_time": "2001-01-01 08:00", "timezone": "UTC"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["published"], true);
    assert_eq!(created["scheduled_time"], Value::Null);
    assert!(state.scheduler.pending_tasks().expect("pending").is_empty());
}

#[tokio::test]
async fn rescheduling_moves_the_pending_task() {
    let temp = TempDir::new().expect("tempdir");
    let state = test_state(temp.path(), None);
    let app = router(state.clone());

    let (_, created) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({"title": "Moving", "scheduled_time": "2099-01-01T00:00:00Z"})),
    )
    .await;
    let id = survey_id(&created);

    let (status, updated) = send_json(
        &app,
        Method::PUT,
        &format!("/surveys/{}", id),
        Some(json!({"scheduled_time": "2099-06-01T12:00:00Z", "title": "Moved"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["title"], "Moved");
    assert_eq!(updated["published"], false);
    assert_eq!(updated["scheduled_time"], "2099-06-01T12:00:00Z");

    let pending = state.scheduler.pending_tasks().expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].fire_at.to_rfc3339(), "2099-06-01T12:00:00+00:00");
}

#[tokio::test]
async fn survey_is_kept_when_its_publish_task_cannot_be_stored() {
    let temp = TempDir::new().expect("tempdir");
    let state = test_state(temp.path(), None);
    let app = router(state.clone());
    let tasks_path = state.config.scheduler_state_path.clone();
    std::fs::remove_file(&tasks_path).expect("remove task db");
    std::fs::create_dir(&tasks_path).expect("block task db");

    let (status, created) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({"title": "Stranded", "scheduled_time": "2099-01-01T00:00:00Z"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["published"], false);
    let id = survey_id(&created);

    let (status, updated) = send_json(
        &app,
        Method::PUT,
        &format!("/surveys/{}", id),
        Some(json!({"scheduled_time": "2099-02-01T00:00:00Z"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["scheduled_time"], "2099-02-01T00:00:00Z");

    let (_, listed) = send_json(&app, Method::GET, "/surveys", None).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    std::fs::remove_dir(&tasks_path).expect("unblock task db");
    assert_eq!(state.requeue_orphaned_publishes().expect("requeue"), 1);
    let pending = state.scheduler.pending_tasks().expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, TaskKind::PublishSurvey { survey_id: id });
    assert_eq!(pending[0].fire_at.to_rfc3339(), "2099-02-01T00:00:00+00:00");
}

#[tokio::test]
async fn response_lifecycle() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    let (_, created) =
        send_json(&app, Method::POST, "/surveys", Some(json!({"title": "Feedback"}))).await;
    let id = survey_id(&created);

    let (status, response) = send_json(
        &app,
        Method::POST,
        &format!("/surveys/{}/submit", id),
        Some(json!({"answers": {"rating": 5}, "respondent_email": " ada@example.com "})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(response["respondent_email"], "ada@example.com");
    let response_id = response["id"].as_str().expect("response id").to_string();

    let (status, _) = send_json(
        &app,
        Method::POST,
        &format!("/surveys/{}/submit", id),
        Some(json!({"respondent_email": "x@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, listed) =
        send_json(&app, Method::GET, &format!("/surveys/{}/responses", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, updated) = send_json(
        &app,
        Method::PUT,
        &format!("/responses/{}", response_id),
        Some(json!({"answers": {"rating": 3}, "respondent_email": null})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["answers"], json!({"rating": 3}));
    assert_eq!(updated["respondent_email"], Value::Null);

    let (status, fetched) =
        send_json(&app, Method::GET, &format!("/responses/{}", response_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, updated);

    let (status, stats) =
        send_json(&app, Method::GET, &format!("/surveys/{}/stats", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_responses"], 1);

    let (status, _) =
        send_json(&app, Method::DELETE, &format!("/responses/{}", response_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) =
        send_json(&app, Method::GET, &format!("/responses/{}", response_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_a_survey_removes_its_responses() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    let (_, created) =
        send_json(&app, Method::POST, "/surveys", Some(json!({"title": "Short lived"}))).await;
    let id = survey_id(&created);
    let (_, response) = send_json(
        &app,
        Method::POST,
        &format!("/surveys/{}/submit", id),
        Some(json!({"answers": ["a"]})),
    )
    .await;
    let response_id = response["id"].as_str().expect("response id").to_string();

    let (status, body) =
        send_json(&app, Method::DELETE, &format!("/surveys/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let (status, _) =
        send_json(&app, Method::GET, &format!("/responses/{}", response_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) =
        send_json(&app, Method::GET, &format!("/surveys/{}/responses", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn aggregate_stats_cover_every_survey() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    for title in ["One", "Two"] {
        send_json(&app, Method::POST, "/surveys", Some(json!({"title": title}))).await;
    }
    let (status, stats) = send_json(&app, Method::GET, "/surveys/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    let stats = stats.as_array().expect("stats array");
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|entry| entry["total_responses"] == 0));
}

#[tokio::test]
async fn csv_upload_creates_a_published_survey() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    let boundary = "survey-boundary";
    let csv = "text,type,options,required,order\n\
               Favourite colour,multiple_choice,\"[\"\"Red\"\",\"\"Blue\"\"]\",true,1\n\
               Why?,text,,false,2\n";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nColours\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"questions.csv\"\r\n\
         Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
        b = boundary,
        csv = csv
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri("/surveys/upload")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .expect("request");

    let (status, created) = send(&app, request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["title"], "Colours");
    assert_eq!(created["published"], true);
    let questions = created["questions"].as_array().expect("questions");
    assert_eq!(questions.len(), 2);
    assert_eq!(questions[0]["options"], json!(["Red", "Blue"]));
    assert_eq!(questions[0]["required"], true);
}

#[tokio::test]
async fn csv_upload_without_file_is_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    let boundary = "survey-boundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nNo file\r\n--{b}--\r\n",
        b = boundary
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri("/surveys/upload")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .expect("request");
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sharing_requires_a_mail_transport() {
    let temp = TempDir::new().expect("tempdir");
    let app = router(test_state(temp.path(), None));

    let (_, created) =
        send_json(&app, Method::POST, "/surveys", Some(json!({"title": "Unshared"}))).await;
    let id = survey_id(&created);
    let (status, _) = send_json(
        &app,
        Method::POST,
        &format!("/surveys/{}/share", id),
        Some(json!({"emails": "a@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn sharing_queues_an_invitation() {
    let temp = TempDir::new().expect("tempdir");
    let sender = Arc::new(RecordingSender::default());
    let app = router(test_state(
        temp.path(),
        Some(sender.clone() as Arc<dyn NotificationSender>),
    ));

    let (_, created) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({"title": "Offsite <2026>"})),
    )
    .await;
    let id = survey_id(&created);

    let (status, _) = send_json(
        &app,
        Method::POST,
        &format!("/surveys/{}/share", id),
        Some(json!({"emails": " , "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(
        &app,
        Method::POST,
        &format!("/surveys/{}/share", id),
        Some(json!({"emails": "a@example.com, b@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["recipients"], 2);

    assert!(wait_until(Duration::from_secs(5), || !sender
        .messages()
        .is_empty()));
    let messages = sender.messages();
    assert_eq!(
        messages[0].recipients,
        vec!["a@example.com".to_string(), "b@example.com".to_string()]
    );
    assert!(messages[0].subject.contains("Offsite <2026>"));
    let link = format!("http://surveys.test/surveys/{}/take", id);
    assert!(messages[0].body_text.contains(&link));
    assert!(messages[0]
        .body_html
        .as_deref()
        .is_some_and(|html| html.contains("Offsite &lt;2026&gt;")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_thread_publishes_when_due() {
    let temp = TempDir::new().expect("tempdir");
    let state = test_state(temp.path(), None);
    let app = router(state.clone());

    let fire_at = Utc::now() + chrono::Duration::milliseconds(800);
    let (status, created) = send_json(
        &app,
        Method::POST,
        "/surveys",
        Some(json!({"title": "Soon", "scheduled_time": fire_at.to_rfc3339()})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["published"], false);
    let id = survey_id(&created);

    let mut control = start_scheduler_threads(
        state.scheduler.clone(),
        Duration::from_millis(50),
        state.config.scheduler_max_concurrency,
    );
    let observed = state.clone();
    let published = tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(10), || {
            let survey_live = observed
                .surveys
                .get_survey(id)
                .map(|survey| survey.published)
                .unwrap_or(false);
            let task_settled = observed
                .scheduler
                .pending_tasks()
                .map(|pending| pending.is_empty())
                .unwrap_or(false);
            survey_live && task_settled
        })
    })
    .await
    .expect("join");
    control.stop_and_join();
    assert!(published);

    let (_, fetched) = send_json(&app, Method::GET, &format!("/surveys/{}", id), None).await;
    assert_eq!(fetched["published"], true);
    assert_eq!(fetched["scheduled_time"], Value::Null);
    assert!(state.scheduler.pending_tasks().expect("pending").is_empty());
}
