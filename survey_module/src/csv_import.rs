use std::collections::HashMap;

use crate::survey_store::{default_question_type, QuestionInput};

#[derive(Debug, thiserror::Error)]
pub enum CsvImportError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv is missing the required column '{0}'")]
    MissingColumn(&'static str),
    #[error("row {row}: question text is empty")]
    EmptyText { row: usize },
    #[error("row {row}: order '{value}' is not an integer")]
    InvalidOrder { row: usize, value: String },
    #[error("row {row}: options must be a JSON array of strings, got '{value}'")]
    InvalidOptions { row: usize, value: String },
    #[error("csv contains no questions")]
    Empty,
}

/// Parses an uploaded question sheet with the columns
/// `text,type,options,required,order`. Only `text` is mandatory.
///
/// Row numbers in errors count the header as row 1.
pub fn parse_questions_csv(data: &[u8]) -> Result<Vec<QuestionInput>, CsvImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(data);
    let headers = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let name = name.trim().trim_start_matches('\u{feff}');
            (name.to_ascii_lowercase(), idx)
        })
        .collect::<HashMap<_, _>>();
    if !headers.contains_key("text") {
        return Err(CsvImportError::MissingColumn("text"));
    }

    let mut questions = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let row = idx + 2;
        if record.iter().all(|value| value.trim().is_empty()) {
            continue;
        }

        let text = column_value(&headers, &record, "text");
        if text.is_empty() {
            return Err(CsvImportError::EmptyText { row });
        }
        let question_type = match column_value(&headers, &record, "type") {
            "" => default_question_type(),
            value => value.to_string(),
        };
        let required = column_value(&headers, &record, "required").eq_ignore_ascii_case("true");
        let order = match column_value(&headers, &record, "order") {
            "" => 0,
            value => value
                .parse::<i64>()
                .map_err(|_| CsvImportError::InvalidOrder {
                    row,
                    value: value.to_string(),
                })?,
        };
        let options = parse_options(column_value(&headers, &record, "options"), row)?;

        questions.push(QuestionInput {
            text: text.to_string(),
            question_type,
            options,
            required,
            order,
        });
    }

    if questions.is_empty() {
        return Err(CsvImportError::Empty);
    }
    Ok(questions)
}

fn column_value<'r>(
    headers: &HashMap<String, usize>,
    record: &'r csv::StringRecord,
    name: &str,
) -> &'r str {
    headers
        .get(name)
        .and_then(|column| record.get(*column))
        .unwrap_or("")
}

fn parse_options(raw: &str, row: usize) -> Result<Option<Vec<String>>, CsvImportError> {
    if raw.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<Vec<String>>(raw)
        .map(Some)
        .map_err(|_| CsvImportError::InvalidOptions {
            row,
            value: raw.to_string(),
        })
}
