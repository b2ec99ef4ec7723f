//! Validation of a pre-parsed response spreadsheet.
//!
//! Layout: `header` names the questions, `weights` holds each question's
//! maximum score, and every row is `[studentKey, score...]`.

use crate::ctt::Question;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

pub const DEFAULT_QUESTION_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixGrid {
    pub header: Vec<String>,
    #[serde(default)]
    pub weights: Vec<Value>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

/// What to do with a score below 0 or above the question weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClampPolicy {
    #[default]
    Reject,
    Clamp,
}

#[derive(Debug, Clone)]
pub struct RosterKey {
    pub id: String,
    pub nis: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatrixError {
    #[error("header must name at least one question")]
    EmptyHeader,
    #[error("weights has {got} entries but header has {expected}")]
    WeightCount { expected: usize, got: usize },
    #[error("weight in column {col} is not a number")]
    BadWeight { col: usize },
    #[error("row {row} has no student key")]
    MissingStudentKey { row: usize },
    #[error("row {row} has {got} score cells but header has {expected}")]
    RowTooLong { row: usize, expected: usize, got: usize },
    #[error("row {row} column {col} is not a number")]
    BadCell { row: usize, col: usize },
    #[error("row {row} column {col}: score {value} is outside 0..={max}")]
    OutOfRange {
        row: usize,
        col: usize,
        value: f64,
        max: f64,
    },
    #[error("student {key} appears in more than one row")]
    DuplicateStudent { row: usize, key: String },
}

impl MatrixError {
    pub fn details(&self) -> Value {
        match self {
            MatrixError::EmptyHeader => json!({}),
            MatrixError::WeightCount { expected, got } => {
                json!({ "expected": expected, "got": got })
            }
            MatrixError::BadWeight { col } => json!({ "col": col }),
            MatrixError::MissingStudentKey { row } => json!({ "row": row }),
            MatrixError::RowTooLong { row, expected, got } => {
                json!({ "row": row, "expected": expected, "got": got })
            }
            MatrixError::BadCell { row, col } => json!({ "row": row, "col": col }),
            MatrixError::OutOfRange {
                row,
                col,
                value,
                max,
            } => json!({ "row": row, "col": col, "value": value, "max": max }),
            MatrixError::DuplicateStudent { row, key } => json!({ "row": row, "key": key }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedResponse {
    pub student_id: String,
    pub question_idx: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ImportedMatrix {
    pub questions: Vec<Question>,
    pub responses: Vec<ImportedResponse>,
    pub unmatched_keys: Vec<String>,
    pub blank_cells: usize,
    pub clamped_cells: usize,
}

/// Parses a number from a spreadsheet cell. Blank and null cells are "no
/// response"; a decimal comma is accepted.
pub fn parse_cell(v: &Value) -> Result<Option<f64>, ()> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or(()),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() || t == "-" {
                return Ok(None);
            }
            let normalized = t.replace(',', ".");
            match normalized.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Some(v)),
                _ => Err(()),
            }
        }
        _ => Err(()),
    }
}

/// Checks a single score against its question's weight.
pub fn check_score(value: f64, weight: f64, policy: ClampPolicy) -> Result<(f64, bool), f64> {
    let max = weight.max(0.0);
    if (0.0..=max).contains(&value) {
        return Ok((value, false));
    }
    match policy {
        ClampPolicy::Reject => Err(max),
        ClampPolicy::Clamp => Ok((value.clamp(0.0, max), true)),
    }
}

struct RosterIndex<'a> {
    by_id: HashMap<&'a str, &'a str>,
    by_nis: HashMap<&'a str, &'a str>,
    by_name: HashMap<String, Option<&'a str>>,
}

impl<'a> RosterIndex<'a> {
    fn new(roster: &'a [RosterKey]) -> Self {
        let mut by_id = HashMap::new();
        let mut by_nis = HashMap::new();
        let mut by_name: HashMap<String, Option<&'a str>> = HashMap::new();
        for s in roster {
            by_id.insert(s.id.as_str(), s.id.as_str());
            if let Some(nis) = s.nis.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                by_nis.insert(nis, s.id.as_str());
            }
            by_name
                .entry(s.name.trim().to_lowercase())
                .and_modify(|e| *e = None)
                .or_insert(Some(s.id.as_str()));
        }
        Self {
            by_id,
            by_nis,
            by_name,
        }
    }

    /// Matches by id, then student number, then an unambiguous name.
    fn resolve(&self, key: &str) -> Option<&'a str> {
        if let Some(id) = self.by_id.get(key) {
            return Some(*id);
        }
        if let Some(id) = self.by_nis.get(key) {
            return Some(*id);
        }
        self.by_name.get(&key.to_lowercase()).copied().flatten()
    }
}

fn student_key(v: Option<&Value>) -> Option<String> {
    let key = match v? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!key.is_empty()).then_some(key)
}

pub fn parse_matrix_grid(
    grid: &MatrixGrid,
    roster: &[RosterKey],
    policy: ClampPolicy,
) -> Result<ImportedMatrix, MatrixError> {
    let width = grid.header.len();
    if width == 0 {
        return Err(MatrixError::EmptyHeader);
    }
    if !grid.weights.is_empty() && grid.weights.len() != width {
        return Err(MatrixError::WeightCount {
            expected: width,
            got: grid.weights.len(),
        });
    }

    let mut questions = Vec::with_capacity(width);
    for (col, label) in grid.header.iter().enumerate() {
        let weight = match grid.weights.get(col) {
            None => DEFAULT_QUESTION_WEIGHT,
            Some(v) => parse_cell(v)
                .map_err(|_| MatrixError::BadWeight { col })?
                .unwrap_or(DEFAULT_QUESTION_WEIGHT),
        };
        let label = label.trim();
        let idx = (col + 1) as u32;
        questions.push(Question {
            idx,
            label: if label.is_empty() {
                format!("Q{}", idx)
            } else {
                label.to_string()
            },
            weight,
        });
    }

    let index = RosterIndex::new(roster);
    let mut out = ImportedMatrix {
        questions,
        ..ImportedMatrix::default()
    };
    let mut seen: HashSet<&str> = HashSet::new();

    for (row, cells) in grid.rows.iter().enumerate() {
        if cells.iter().all(|c| matches!(parse_cell(c), Ok(None))) {
            continue;
        }
        let key = student_key(cells.first()).ok_or(MatrixError::MissingStudentKey { row })?;
        let scores = &cells[1..];
        if scores.len() > width {
            return Err(MatrixError::RowTooLong {
                row,
                expected: width,
                got: scores.len(),
            });
        }
        let Some(student_id) = index.resolve(&key) else {
            tracing::info!(row, key = %key, "matrix row does not match the roster");
            out.unmatched_keys.push(key);
            continue;
        };
        if !seen.insert(student_id) {
            return Err(MatrixError::DuplicateStudent { row, key });
        }

        for (col, cell) in scores.iter().enumerate() {
            let value = parse_cell(cell).map_err(|_| MatrixError::BadCell { row, col })?;
            let Some(value) = value else {
                out.blank_cells += 1;
                continue;
            };
            let question = &out.questions[col];
            let (score, clamped) = check_score(value, question.weight, policy)
                .map_err(|max| MatrixError::OutOfRange {
                    row,
                    col,
                    value,
                    max,
                })?;
            if clamped {
                out.clamped_cells += 1;
            }
            out.responses.push(ImportedResponse {
                student_id: student_id.to_string(),
                question_idx: question.idx,
                score,
            });
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<RosterKey> {
        vec![
            RosterKey {
                id: "s-1".into(),
                nis: Some("1001".into()),
                name: "Ani".into(),
            },
            RosterKey {
                id: "s-2".into(),
                nis: Some("1002".into()),
                name: "Budi".into(),
            },
        ]
    }

    fn grid(weights: Value, rows: Value) -> MatrixGrid {
        serde_json::from_value(json!({
            "header": ["Soal 1", "", "Soal 3"],
            "weights": weights,
            "rows": rows,
        }))
        .expect("grid json")
    }

    #[test]
    fn blank_is_no_response_and_zero_is_a_score() {
        let g = grid(
            json!([10, "5", null]),
            json!([["1001", 7, "", "0"], ["budi", "4,5", 5, null]]),
        );
        let m = parse_matrix_grid(&g, &roster(), ClampPolicy::Reject).expect("parse");
        assert_eq!(m.questions[1].label, "Q2");
        assert_eq!(m.questions[2].weight, DEFAULT_QUESTION_WEIGHT);
        assert_eq!(m.blank_cells, 2);
        assert_eq!(m.responses.len(), 4);
        assert!(m
            .responses
            .iter()
            .any(|r| r.student_id == "s-1" && r.question_idx == 3 && r.score == 0.0));
        assert!(m
            .responses
            .iter()
            .any(|r| r.student_id == "s-2" && r.question_idx == 1 && r.score == 4.5));
    }

    #[test]
    fn over_weight_is_rejected_or_clamped() {
        let g = grid(json!([10, 5, 1]), json!([["s-1", 12, -1, 1]]));
        let e = parse_matrix_grid(&g, &roster(), ClampPolicy::Reject).unwrap_err();
        assert_eq!(
            e,
            MatrixError::OutOfRange {
                row: 0,
                col: 0,
                value: 12.0,
                max: 10.0
            }
        );
        let m = parse_matrix_grid(&g, &roster(), ClampPolicy::Clamp).expect("clamp");
        assert_eq!(m.clamped_cells, 2);
        assert_eq!(m.responses[0].score, 10.0);
        assert_eq!(m.responses[1].score, 0.0);
    }

    #[test]
    fn unknown_students_are_reported_not_fatal() {
        let g = grid(json!([]), json!([["9999", 1, 1, 1], ["s-2", 1, 0, 1]]));
        let m = parse_matrix_grid(&g, &roster(), ClampPolicy::Reject).expect("parse");
        assert_eq!(m.unmatched_keys, vec!["9999".to_string()]);
        assert_eq!(m.responses.len(), 3);
    }

    #[test]
    fn malformed_cells_are_rejected() {
        let g = grid(json!([1, 1, 1]), json!([["s-1", "abc", 1, 1]]));
        assert_eq!(
            parse_matrix_grid(&g, &roster(), ClampPolicy::Clamp).unwrap_err(),
            MatrixError::BadCell { row: 0, col: 0 }
        );
        let g = grid(json!([1, "x", 1]), json!([]));
        assert_eq!(
            parse_matrix_grid(&g, &roster(), ClampPolicy::Reject).unwrap_err(),
            MatrixError::BadWeight { col: 1 }
        );
        let g = grid(json!([1, 1]), json!([]));
        assert!(matches!(
            parse_matrix_grid(&g, &roster(), ClampPolicy::Reject),
            Err(MatrixError::WeightCount { .. })
        ));
    }

    #[test]
    fn duplicate_rows_for_one_student_are_rejected() {
        let g = grid(json!([]), json!([["s-1", 1], ["Ani", 0]]));
        assert!(matches!(
            parse_matrix_grid(&g, &roster(), ClampPolicy::Reject),
            Err(MatrixError::DuplicateStudent { row: 1, .. })
        ));
    }
}
