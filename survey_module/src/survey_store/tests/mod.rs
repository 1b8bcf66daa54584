use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use crate::publish::decide_publish_state;

use super::{
    NewSurvey, PublishOutcome, PublishState, QuestionInput, ResponseChanges, SurveyChanges,
    SurveyStore, SurveyStoreError,
};

fn db_path(temp: &TempDir) -> std::path::PathBuf {
    temp.path().join("state").join("survey.db")
}

fn store(temp: &TempDir) -> SurveyStore {
    SurveyStore::new(db_path(temp)).expect("survey store")
}

fn question(text: &str, order: i64) -> QuestionInput {
    QuestionInput {
        text: text.to_string(),
        question_type: "text".to_string(),
        options: None,
        required: false,
        order,
    }
}

fn published() -> PublishState {
    PublishState {
        published: true,
        scheduled_time: None,
    }
}

fn scheduled(at: DateTime<Utc>) -> PublishState {
    PublishState {
        published: false,
        scheduled_time: Some(at),
    }
}

fn new_survey(title: &str, publish: PublishState) -> NewSurvey {
    NewSurvey {
        title: title.to_string(),
        description: "quarterly check-in".to_string(),
        publish,
    }
}

#[test]
fn create_and_get_survey_with_ordered_questions() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let mut choice = question("Favourite colour?", 1);
    choice.question_type = "choice".to_string();
    choice.options = Some(vec!["red".to_string(), "blue".to_string()]);
    choice.required = true;

    let created = store
        .create_survey(
            new_survey("  Team survey ", published()),
            &[
                question("Anything else?", 5),
                choice,
                question("Your name", 1),
            ],
        )
        .expect("create");

    assert_eq!(created.title, "Team survey");
    assert!(created.published);
    let texts = created
        .questions
        .iter()
        .map(|question| question.text.as_str())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["Favourite colour?", "Your name", "Anything else?"]);
    assert_eq!(
        created.questions[0].options,
        Some(vec!["red".to_string(), "blue".to_string()])
    );
    assert!(created.questions[0].required);

    let loaded = store.get_survey(created.id).expect("get");
    assert_eq!(loaded, created);
}

#[test]
fn create_rejects_blank_title_and_inconsistent_state() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);

    let err = store
        .create_survey(new_survey("   ", published()), &[])
        .expect_err("blank title");
    assert!(matches!(err, SurveyStoreError::InvalidInput(_)));

    let inconsistent = PublishState {
        published: true,
        scheduled_time: Some(Utc::now()),
    };
    let err = store
        .create_survey(new_survey("Broken", inconsistent), &[])
        .expect_err("inconsistent");
    assert!(matches!(err, SurveyStoreError::InconsistentPublishState));
    assert!(store.list_surveys().expect("list").is_empty());
}

#[test]
fn get_missing_survey_is_not_found() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let err = store.get_survey(Uuid::new_v4()).expect_err("missing");
    assert!(err.is_not_found());
}

#[test]
fn update_keeps_questions_unless_replaced() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let created = store
        .create_survey(
            new_survey("Onboarding", published()),
            &[question("How was day one?", 0)],
        )
        .expect("create");

    let renamed = store
        .update_survey(
            created.id,
            SurveyChanges {
                title: Some("Onboarding v2".to_string()),
                ..SurveyChanges::default()
            },
            None,
        )
        .expect("rename");
    assert_eq!(renamed.title, "Onboarding v2");
    assert_eq!(renamed.description, created.description);
    assert_eq!(renamed.questions, created.questions);

    let replaced = store
        .update_survey(
            created.id,
            SurveyChanges::default(),
            Some(&[question("First week?", 0), question("Mentor?", 1)]),
        )
        .expect("replace questions");
    assert_eq!(replaced.questions.len(), 2);
    assert_eq!(replaced.questions[0].text, "First week?");
}

#[test]
fn update_missing_survey_is_not_found() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let err = store
        .update_survey(Uuid::new_v4(), SurveyChanges::default(), None)
        .expect_err("missing");
    assert!(err.is_not_found());
}

#[test]
fn save_survey_upserts_publish_pair() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let at = Utc::now() + ChronoDuration::days(1);
    let mut survey = store
        .create_survey(new_survey("Draft", scheduled(at)), &[question("Q", 0)])
        .expect("create");

    survey.published = true;
    survey.scheduled_time = None;
    store.save_survey(&survey).expect("save");

    let loaded = store.get_survey(survey.id).expect("get");
    assert!(loaded.published);
    assert_eq!(loaded.scheduled_time, None);
    assert_eq!(loaded.questions.len(), 1);

    survey.scheduled_time = Some(at);
    let err = store.save_survey(&survey).expect_err("inconsistent");
    assert!(matches!(err, SurveyStoreError::InconsistentPublishState));
}

#[test]
fn table_constraint_rejects_published_with_schedule() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let survey = store
        .create_survey(new_survey("Guarded", published()), &[])
        .expect("create");

    let conn = rusqlite::Connection::open(db_path(&temp)).expect("open");
    let result = conn.execute(
        "UPDATE surveys SET scheduled_time = '2099-01-01T00:00:00.000000Z' WHERE id = ?1",
        [survey.id.to_string()],
    );
    assert!(result.is_err());
}

#[test]
fn delete_cascades_to_questions_and_responses() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let survey = store
        .create_survey(new_survey("Doomed", published()), &[question("Q", 0)])
        .expect("create");
    let response = store
        .create_response(survey.id, json!({"Q": "yes"}), None)
        .expect("response");

    store.delete_survey_cascade(survey.id).expect("delete");

    assert!(store.get_survey(survey.id).expect_err("gone").is_not_found());
    assert!(store
        .get_response(response.id)
        .expect_err("response gone")
        .is_not_found());
    let conn = rusqlite::Connection::open(db_path(&temp)).expect("open");
    let questions: i64 = conn
        .query_row("SELECT COUNT(*) FROM questions", [], |row| row.get(0))
        .expect("count");
    assert_eq!(questions, 0);

    let err = store
        .delete_survey_cascade(survey.id)
        .expect_err("second delete");
    assert!(err.is_not_found());
}

#[test]
fn publish_if_due_follows_guard() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let now = Utc::now();
    let due_at = now - ChronoDuration::minutes(1);
    let later_at = now + ChronoDuration::hours(1);

    let due = store
        .create_survey(new_survey("Due", scheduled(due_at)), &[])
        .expect("due");
    let later = store
        .create_survey(new_survey("Later", scheduled(later_at)), &[])
        .expect("later");
    let draft = store
        .create_survey(new_survey("Draft", PublishState::default()), &[])
        .expect("draft");
    let live = store
        .create_survey(new_survey("Live", published()), &[])
        .expect("live");

    assert_eq!(
        store.publish_if_due(due.id, now).expect("due"),
        PublishOutcome::Published
    );
    assert_eq!(
        store.publish_if_due(due.id, now).expect("due again"),
        PublishOutcome::AlreadyPublished
    );
    match store.publish_if_due(later.id, now).expect("later") {
        PublishOutcome::NotYetDue(at) => {
            assert_eq!(at.timestamp_micros(), later_at.timestamp_micros())
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        store.publish_if_due(draft.id, now).expect("draft"),
        PublishOutcome::NotScheduled
    );
    assert_eq!(
        store.publish_if_due(live.id, now).expect("live"),
        PublishOutcome::AlreadyPublished
    );
    assert!(store
        .publish_if_due(Uuid::new_v4(), now)
        .expect_err("missing")
        .is_not_found());

    let published = store.get_survey(due.id).expect("get");
    assert!(published.published);
    assert_eq!(published.scheduled_time, None);
    let still_draft = store.get_survey(later.id).expect("get");
    assert!(!still_draft.published);
}

#[test]
fn scheduled_surveys_lists_pending_publishes() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let at = Utc::now() + ChronoDuration::hours(2);
    let pending = store
        .create_survey(new_survey("Pending", scheduled(at)), &[])
        .expect("pending");
    store
        .create_survey(new_survey("Live", published()), &[])
        .expect("live");

    let scheduled = store.scheduled_surveys().expect("scheduled");
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].0, pending.id);
}

#[test]
fn responses_require_published_survey() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let draft = store
        .create_survey(new_survey("Draft", PublishState::default()), &[])
        .expect("draft");

    let err = store
        .create_response(draft.id, json!({"q": 1}), None)
        .expect_err("unpublished");
    assert!(matches!(err, SurveyStoreError::NotPublished(id) if id == draft.id));

    let err = store
        .create_response(Uuid::new_v4(), json!({"q": 1}), None)
        .expect_err("missing");
    assert!(err.is_not_found());

    let err = store
        .create_response(draft.id, serde_json::Value::Null, None)
        .expect_err("null answers");
    assert!(matches!(err, SurveyStoreError::InvalidInput(_)));
}

#[test]
fn response_crud_round_trip() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let survey = store
        .create_survey(new_survey("Live", published()), &[question("Q", 0)])
        .expect("create");

    let first = store
        .create_response(
            survey.id,
            json!({"Q": "fine"}),
            Some("  alice@example.com ".to_string()),
        )
        .expect("first");
    let second = store
        .create_response(survey.id, json!({"Q": "great"}), Some("   ".to_string()))
        .expect("second");
    assert_eq!(first.respondent_email.as_deref(), Some("alice@example.com"));
    assert_eq!(second.respondent_email, None);

    let listed = store.list_responses(survey.id).expect("list");
    assert_eq!(
        listed.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );

    let updated = store
        .update_response(
            first.id,
            ResponseChanges {
                answers: Some(json!({"Q": "changed my mind"})),
                respondent_email: Some(None),
            },
        )
        .expect("update");
    assert_eq!(updated.answers, json!({"Q": "changed my mind"}));
    assert_eq!(updated.respondent_email, None);
    assert_eq!(updated.created_at, first.created_at);

    store.delete_response(second.id).expect("delete");
    assert!(store
        .delete_response(second.id)
        .expect_err("deleted twice")
        .is_not_found());
    assert_eq!(store.list_responses(survey.id).expect("list").len(), 1);
    assert!(store
        .list_responses(Uuid::new_v4())
        .expect_err("missing survey")
        .is_not_found());
}

#[test]
fn stats_count_questions_and_responses() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let busy = store
        .create_survey(
            new_survey("Busy", published()),
            &[question("A", 0), question("B", 1)],
        )
        .expect("busy");
    let quiet = store
        .create_survey(new_survey("Quiet", PublishState::default()), &[])
        .expect("quiet");
    for idx in 0..3 {
        store
            .create_response(busy.id, json!({ "A": idx }), None)
            .expect("response");
    }

    let stats = store.survey_stats(busy.id).expect("stats");
    assert_eq!(stats.title, "Busy");
    assert_eq!(stats.total_responses, 3);
    assert_eq!(stats.total_questions, 2);
    assert!(stats.published);

    let all = store.all_survey_stats().expect("all");
    assert_eq!(all.len(), 2);
    let quiet_stats = all
        .iter()
        .find(|entry| entry.survey_id == quiet.id)
        .expect("quiet stats");
    assert_eq!(quiet_stats.total_responses, 0);
    assert_eq!(quiet_stats.total_questions, 0);
    assert!(store
        .survey_stats(Uuid::new_v4())
        .expect_err("missing")
        .is_not_found());
}

#[test]
fn randomized_lifecycle_never_keeps_schedule_on_published_survey() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let mut rng = StdRng::seed_from_u64(0x5eed_2025);
    let base = Utc::now();
    let mut ids: Vec<Uuid> = Vec::new();

    for step in 0..200 {
        let now = base + ChronoDuration::minutes(step);
        let offset_minutes: i64 = rng.gen_range(-120..=120);
        let schedule = if rng.gen_bool(0.7) {
            Some(
                (now + ChronoDuration::minutes(offset_minutes))
                    .naive_utc()
                    .format("%Y-%m-%dT%H:%M:%S")
                    .to_string(),
            )
        } else {
            None
        };
        let decision =
            decide_publish_state(rng.gen_bool(0.3), schedule.as_deref(), Some("UTC"), now)
                .expect("decision");

        match rng.gen_range(0..3) {
            0 => {
                let survey = store
                    .create_survey(new_survey("Random", decision.into()), &[])
                    .expect("create");
                ids.push(survey.id);
            }
            1 if !ids.is_empty() => {
                let id = ids[rng.gen_range(0..ids.len())];
                store
                    .update_survey(
                        id,
                        SurveyChanges {
                            publish: Some(decision.into()),
                            ..SurveyChanges::default()
                        },
                        None,
                    )
                    .expect("update");
            }
            _ if !ids.is_empty() => {
                let id = ids[rng.gen_range(0..ids.len())];
                store.publish_if_due(id, now).expect("fire");
            }
            _ => {}
        }

        for survey in store.list_surveys().expect("list") {
            assert!(
                !(survey.published && survey.scheduled_time.is_some()),
                "survey {} violated publish invariant at step {}",
                survey.id,
                step
            );
        }
    }
}
