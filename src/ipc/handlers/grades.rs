use crate::calc::{self, AssessmentKind, GradeThresholds, PivotTable};
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_f64, optional_str, required_str, term_param};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const GRADES_UPSERT_MAX_EDITS: usize = 5000;
const DEFAULT_TOP_N: usize = 5;
const MAX_SCORE: f64 = 100.0;

struct SubjectInfo {
    id: String,
    name: String,
    kkm: Option<f64>,
}

/// Subjects keyed by code, the key the aggregator groups on.
fn load_subjects(conn: &Connection) -> Result<HashMap<String, SubjectInfo>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, code, name, kkm FROM subjects")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(1)?,
                SubjectInfo {
                    id: r.get(0)?,
                    name: r.get(2)?,
                    kkm: r.get(3)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(rows)
}

fn require_subject(conn: &Connection, subject_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match found {
        Some(_) => Ok(()),
        None => Err(HandlerErr::new("not_found", "subject not found")
            .with_details(json!({ "subjectId": subject_id }))),
    }
}

fn require_class(conn: &Connection, class_id: &str) -> Result<(), HandlerErr> {
    match db::class_exists(conn, class_id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(HandlerErr::new("not_found", "class not found")
            .with_details(json!({ "classId": class_id }))),
        Err(e) => Err(HandlerErr::db("db_query_failed", e)),
    }
}

/// Reads the assessment of one edit: either a label (`TP2`, `UAS`) or a bare
/// `tp` kind with a separate ordinal.
fn parse_edit_kind(obj: &serde_json::Map<String, serde_json::Value>) -> Result<AssessmentKind, HandlerErr> {
    let Some(raw) = obj.get("kind").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("bad_params", "missing kind"));
    };
    if let Some(kind) = AssessmentKind::parse_label(raw) {
        if kind == AssessmentKind::Formative(0) {
            return Err(HandlerErr::new("bad_params", "formative ordinal must be >= 1"));
        }
        return Ok(kind);
    }
    if !raw.trim().eq_ignore_ascii_case("tp") {
        return Err(
            HandlerErr::new("bad_params", format!("unknown assessment kind: {}", raw))
                .with_details(json!({ "kind": raw })),
        );
    }
    match obj.get("ordinal").and_then(|v| v.as_i64()) {
        Some(n) if n >= 1 => u32::try_from(n)
            .map(AssessmentKind::Formative)
            .map_err(|_| HandlerErr::new("bad_params", "ordinal out of range")),
        Some(_) => Err(HandlerErr::new("bad_params", "formative ordinal must be >= 1")),
        None => Err(HandlerErr::new(
            "bad_params",
            "formative record needs an ordinal",
        )),
    }
}

fn parse_edit_score(obj: &serde_json::Map<String, serde_json::Value>) -> Result<f64, HandlerErr> {
    match obj.get("score").and_then(|v| v.as_f64()) {
        Some(s) if s.is_finite() && (0.0..=MAX_SCORE).contains(&s) => Ok(s),
        Some(s) => Err(
            HandlerErr::new("bad_params", format!("score must be between 0 and {}", MAX_SCORE))
                .with_details(json!({ "score": s })),
        ),
        None => Err(HandlerErr::new("bad_params", "missing score")),
    }
}

fn edit_error(index: usize, student_id: Option<&str>, e: HandlerErr) -> serde_json::Value {
    let mut v = json!({
        "index": index,
        "studentId": student_id,
        "code": e.code,
        "message": e.message,
    });
    if let Some(d) = e.details {
        v["details"] = d;
    }
    v
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match term_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > GRADES_UPSERT_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, GRADES_UPSERT_MAX_EDITS
                    )
                }]
            }),
        );
    }

    if let Err(e) = require_class(conn, &class_id).and_then(|_| require_subject(conn, &subject_id)) {
        return e.response(&req.id);
    }
    let members: HashSet<String> = match db::load_roster(conn, &class_id) {
        Ok(rows) => rows.into_iter().map(|s| s.id).collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = db::now_ts();
    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    let mut summative_seen: HashSet<String> = HashSet::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(edit_error(
                i,
                None,
                HandlerErr::new("bad_params", format!("edit at index {} must be an object", i)),
            ));
            continue;
        };
        let student_id = obj
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let Some(student_id) = student_id else {
            errors.push(edit_error(
                i,
                None,
                HandlerErr::new("bad_params", "missing studentId"),
            ));
            continue;
        };
        if !members.contains(student_id) {
            errors.push(edit_error(
                i,
                Some(student_id),
                HandlerErr::new("not_found", "student is not in this class"),
            ));
            continue;
        }

        let kind = match parse_edit_kind(obj) {
            Ok(v) => v,
            Err(e) => {
                errors.push(edit_error(i, Some(student_id), e));
                continue;
            }
        };
        let score = match parse_edit_score(obj) {
            Ok(v) => v,
            Err(e) => {
                errors.push(edit_error(i, Some(student_id), e));
                continue;
            }
        };
        if kind == AssessmentKind::Summative && !summative_seen.insert(student_id.to_string()) {
            errors.push(edit_error(
                i,
                Some(student_id),
                HandlerErr::new(
                    "bad_params",
                    "more than one UAS score for the same student in one request",
                ),
            ));
            continue;
        }

        match tx.execute(
            "INSERT INTO grades(id, student_id, subject_id, class_id, term, kind, ordinal, score, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_id, term, kind, ordinal) DO UPDATE SET
               score = excluded.score,
               class_id = excluded.class_id,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &subject_id,
                &class_id,
                term,
                kind.storage_kind(),
                kind.ordinal(),
                score,
                &now,
            ),
        ) {
            Ok(_) => updated += 1,
            Err(e) => errors.push(edit_error(
                i,
                Some(student_id),
                HandlerErr::db("db_update_failed", e),
            )),
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    let rejected = errors.len();
    if rejected > 0 {
        tracing::info!(updated, rejected, "grade edits partially rejected");
    }
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        result["rejected"] = json!(rejected);
        result["errors"] = json!(errors);
    }

    ok(&req.id, result)
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match term_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = optional_str(req, "subjectId");
    let student_id = optional_str(req, "studentId");

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.student_id, g.subject_id, sub.code, g.kind, g.ordinal, g.score, g.updated_at
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN subjects sub ON sub.id = g.subject_id
         WHERE g.class_id = ?1 AND g.term = ?2
           AND (?3 IS NULL OR g.subject_id = ?3)
           AND (?4 IS NULL OR g.student_id = ?4)
         ORDER BY s.sort_order, sub.code, g.kind, g.ordinal",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&class_id, term, &subject_id, &student_id), |r| {
            let kind: String = r.get(4)?;
            let ordinal: i64 = r.get(5)?;
            let label = AssessmentKind::from_storage(&kind, ordinal)
                .map(|k| k.to_string())
                .unwrap_or(kind);
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "subjectCode": r.get::<_, String>(3)?,
                "kind": label,
                "score": r.get::<_, f64>(6)?,
                "updatedAt": r.get::<_, Option<String>>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "term": term, "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        Ok(0) => err(&req.id, "not_found", "grade not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

struct PivotScope {
    table: PivotTable,
    names: HashMap<String, String>,
    subjects: HashMap<String, SubjectInfo>,
    term: i64,
}

fn load_pivot_scope(conn: &Connection, req: &Request) -> Result<PivotScope, serde_json::Value> {
    let class_id = required_str(req, "classId")?;
    let term = term_param(req)?;
    let subject_id = optional_str(req, "subjectId");

    require_class(conn, &class_id).map_err(|e| e.response(&req.id))?;
    if let Some(sid) = subject_id.as_deref() {
        require_subject(conn, sid).map_err(|e| e.response(&req.id))?;
    }

    let records = db::load_grade_records(conn, &class_id, subject_id.as_deref(), term)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let names = db::load_roster(conn, &class_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();
    let subjects = load_subjects(conn).map_err(|e| e.response(&req.id))?;

    Ok(PivotScope {
        table: calc::pivot(&records),
        names,
        subjects,
        term,
    })
}

fn handle_grades_pivot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match load_pivot_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let rows: Vec<serde_json::Value> = scope
        .table
        .rows
        .iter()
        .map(|row| {
            let subject = scope.subjects.get(&row.subject);
            let kkm = subject.and_then(|s| s.kkm);
            let below_kkm = match (row.final_grade, kkm) {
                (Some(fg), Some(k)) => Some(fg < k),
                _ => None,
            };
            json!({
                "studentId": row.student_id,
                "displayName": scope.names.get(&row.student_id),
                "subjectCode": row.subject,
                "subjectId": subject.map(|s| s.id.as_str()),
                "subjectName": subject.map(|s| s.name.as_str()),
                "scores": row.scores,
                "finalGrade": row.final_grade,
                "band": row.final_grade.map(calc::classify),
                "kkm": kkm,
                "belowKkm": below_kkm
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "term": scope.term,
            "columns": scope.table.columns,
            "rows": rows
        }),
    )
}

fn top_n_param(req: &Request) -> Result<usize, serde_json::Value> {
    match req.params.get("topN") {
        None => Ok(DEFAULT_TOP_N),
        Some(v) if v.is_null() => Ok(DEFAULT_TOP_N),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    "topN must be a non-negative integer",
                    Some(json!({ "topN": v })),
                )
            }),
    }
}

fn handle_grades_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let defaults = GradeThresholds::default();
    let thresholds = match (
        optional_f64(req, "goodThreshold"),
        optional_f64(req, "atRiskThreshold"),
    ) {
        (Ok(good), Ok(at_risk)) => GradeThresholds {
            good: good.unwrap_or(defaults.good),
            at_risk: at_risk.unwrap_or(defaults.at_risk),
        },
        (Err(e), _) | (_, Err(e)) => return e,
    };
    let top_n = match top_n_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match load_pivot_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let summary = calc::rollup(&scope.table.rows, thresholds, top_n);
    let subjects = calc::subject_averages(&scope.table.rows);
    let top: Vec<serde_json::Value> = summary
        .top
        .iter()
        .map(|r| {
            json!({
                "rank": r.rank,
                "studentId": r.student_id,
                "displayName": scope.names.get(&r.student_id),
                "subjectCode": r.subject,
                "finalGrade": r.final_grade
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "term": scope.term,
            "meanFinal": summary.mean_final,
            "rowCount": summary.row_count,
            "gradedCount": summary.graded_count,
            "goodCount": summary.good_count,
            "atRiskCount": summary.at_risk_count,
            "thresholds": summary.thresholds,
            "distribution": summary.distribution,
            "top": top,
            "subjects": subjects
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        "grades.pivot" => Some(handle_grades_pivot(state, req)),
        "grades.summary" => Some(handle_grades_summary(state, req)),
        _ => None,
    }
}
