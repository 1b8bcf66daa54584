pub(super) const SURVEY_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS surveys (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    published INTEGER NOT NULL,
    scheduled_time TEXT,
    created_at TEXT NOT NULL,
    CHECK (published = 0 OR scheduled_time IS NULL)
);

CREATE TABLE IF NOT EXISTS questions (
    id TEXT PRIMARY KEY,
    survey_id TEXT NOT NULL REFERENCES surveys(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    question_type TEXT NOT NULL,
    options TEXT,
    required INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS questions_survey_idx ON questions(survey_id, position);

CREATE TABLE IF NOT EXISTS responses (
    id TEXT PRIMARY KEY,
    survey_id TEXT NOT NULL REFERENCES surveys(id) ON DELETE CASCADE,
    answers TEXT NOT NULL,
    respondent_email TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS responses_survey_idx ON responses(survey_id);
"#;
