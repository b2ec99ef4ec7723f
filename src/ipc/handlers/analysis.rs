use crate::ctt;
use crate::db::{self, AnalysisMeta};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, CachedReport, Request};
use crate::matrix::{self, ClampPolicy, MatrixGrid, DEFAULT_QUESTION_WEIGHT};
use rusqlite::{Connection, Transaction};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const RESPONSES_SET_MAX_EDITS: usize = 20000;

fn load_meta(conn: &Connection, req: &Request) -> Result<AnalysisMeta, serde_json::Value> {
    let analysis_id = required_str(req, "analysisId")?;
    match db::load_analysis_meta(conn, &analysis_id) {
        Ok(Some(meta)) => Ok(meta),
        Ok(None) => Err(err(
            &req.id,
            "not_found",
            "analysis not found",
            Some(json!({ "analysisId": analysis_id })),
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn clamp_policy(state: &AppState, req: &Request) -> Result<ClampPolicy, serde_json::Value> {
    match req.params.get("clamp") {
        None => Ok(state.clamp_policy),
        Some(v) if v.is_null() => Ok(state.clamp_policy),
        Some(v) => match v.as_bool() {
            Some(true) => Ok(ClampPolicy::Clamp),
            Some(false) => Ok(ClampPolicy::Reject),
            None => Err(err(&req.id, "bad_params", "clamp must be a boolean", None)),
        },
    }
}

fn invalidate(state: &mut AppState, analysis_id: &str) {
    if state.analysis_cache.remove(analysis_id).is_some() {
        tracing::debug!(analysis_id, "analysis cache invalidated");
    }
}

fn handle_analysis_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = optional_str(req, "subjectId");

    match db::class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(sid) = subject_id.as_deref() {
        let found = conn
            .query_row("SELECT COUNT(*) FROM subjects WHERE id = ?", [sid], |r| {
                r.get::<_, i64>(0)
            });
        match found {
            Ok(0) => return err(&req.id, "not_found", "subject not found", None),
            Ok(_) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let analysis_id = Uuid::new_v4().to_string();
    let created_at = db::now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO analyses(id, class_id, subject_id, title, created_at) VALUES(?, ?, ?, ?, ?)",
        (&analysis_id, &class_id, &subject_id, &title, &created_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "analyses" })),
        );
    }

    tracing::info!(analysis_id = %analysis_id, class_id = %class_id, "analysis created");
    ok(
        &req.id,
        json!({ "analysisId": analysis_id, "createdAt": created_at }),
    )
}

fn handle_analysis_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "analyses": [] }));
    };
    let class_id = optional_str(req, "classId");

    let mut stmt = match conn.prepare(
        "SELECT
           a.id,
           a.class_id,
           a.subject_id,
           s.code,
           a.title,
           a.created_at,
           (SELECT COUNT(*) FROM analysis_questions q WHERE q.analysis_id = a.id),
           (SELECT COUNT(*) FROM analysis_responses r WHERE r.analysis_id = a.id)
         FROM analyses a
         LEFT JOIN subjects s ON s.id = a.subject_id
         WHERE (?1 IS NULL OR a.class_id = ?1)
         ORDER BY a.created_at DESC, a.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, Option<String>>(2)?,
                "subjectCode": r.get::<_, Option<String>>(3)?,
                "title": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?,
                "questionCount": r.get::<_, i64>(6)?,
                "responseCount": r.get::<_, i64>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(analyses) => ok(&req.id, json!({ "analyses": analyses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_analysis_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let analysis_id = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let meta = match load_meta(conn, req) {
            Ok(v) => v,
            Err(e) => return e,
        };

        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        for (table, sql) in [
            (
                "analysis_responses",
                "DELETE FROM analysis_responses WHERE analysis_id = ?",
            ),
            (
                "analysis_questions",
                "DELETE FROM analysis_questions WHERE analysis_id = ?",
            ),
            ("analyses", "DELETE FROM analyses WHERE id = ?"),
        ] {
            if let Err(e) = tx.execute(sql, [&meta.id]) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_delete_failed",
                    e.to_string(),
                    Some(json!({ "table": table })),
                );
            }
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_tx_failed", e.to_string(), None);
        }
        meta.id
    };

    invalidate(state, &analysis_id);
    ok(&req.id, json!({ "ok": true }))
}

fn replace_questions(tx: &Transaction<'_>, analysis_id: &str, questions: &[ctt::Question]) -> Result<(), HandlerErr> {
    tx.execute(
        "DELETE FROM analysis_questions WHERE analysis_id = ?",
        [analysis_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    for q in questions {
        tx.execute(
            "INSERT INTO analysis_questions(analysis_id, idx, label, weight) VALUES(?, ?, ?, ?)",
            (analysis_id, q.idx, &q.label, q.weight),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    }
    Ok(())
}

/// Reads `questions[]` in order; positions become 1-based question indexes.
fn parse_questions(req: &Request) -> Result<Vec<ctt::Question>, HandlerErr> {
    let Some(arr) = req.params.get("questions").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing questions[]"));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, q) in arr.iter().enumerate() {
        let idx = (i + 1) as u32;
        let label = q
            .get("label")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Q{}", idx));
        let weight = match q.get("weight") {
            None => DEFAULT_QUESTION_WEIGHT,
            Some(v) if v.is_null() => DEFAULT_QUESTION_WEIGHT,
            Some(v) => match v.as_f64() {
                Some(w) if w.is_finite() => w,
                _ => {
                    return Err(HandlerErr::new("bad_params", "weight must be a number")
                        .with_details(json!({ "index": i, "weight": v })))
                }
            },
        };
        out.push(ctt::Question { idx, label, weight });
    }
    Ok(out)
}

/// Stored scores that no longer fit under their question's weight. Questions
/// with weight ≤ 0 are left alone; the engine excludes them anyway.
fn rescore_responses(
    tx: &Transaction<'_>,
    analysis_id: &str,
    questions: &[ctt::Question],
    policy: ClampPolicy,
) -> Result<usize, HandlerErr> {
    let weights: HashMap<u32, f64> = questions
        .iter()
        .filter(|q| q.weight > 0.0)
        .map(|q| (q.idx, q.weight))
        .collect();
    let stored: Vec<(String, u32, f64)> = tx
        .prepare(
            "SELECT student_id, question_idx, score FROM analysis_responses
             WHERE analysis_id = ?
             ORDER BY question_idx, student_id",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map([analysis_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            rows
        })
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut clamped = 0_usize;
    let mut out_of_range = Vec::new();
    for (student_id, idx, score) in stored {
        let Some(&weight) = weights.get(&idx) else {
            continue;
        };
        match matrix::check_score(score, weight, policy) {
            Ok((_, false)) => {}
            Ok((fixed, true)) => {
                tx.execute(
                    "UPDATE analysis_responses SET score = ?
                     WHERE analysis_id = ? AND student_id = ? AND question_idx = ?",
                    (fixed, analysis_id, &student_id, idx),
                )
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
                clamped += 1;
            }
            Err(max) => out_of_range.push(json!({
                "studentId": student_id,
                "questionIdx": idx,
                "score": score,
                "max": max
            })),
        }
    }

    if !out_of_range.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!(
                "{} stored score(s) exceed the new question weights",
                out_of_range.len()
            ),
        )
        .with_details(json!({ "cells": out_of_range })));
    }
    Ok(clamped)
}

fn handle_analysis_questions_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let policy = match clamp_policy(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (analysis_id, clamped) = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let meta = match load_meta(conn, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let questions = match parse_questions(req) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };

        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        if let Err(e) = replace_questions(&tx, &meta.id, &questions) {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
        // Responses to questions that no longer exist would only be skipped later.
        if let Err(e) = tx.execute(
            "DELETE FROM analysis_responses WHERE analysis_id = ? AND question_idx > ?",
            (&meta.id, questions.len() as i64),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
        let clamped = match rescore_responses(&tx, &meta.id, &questions, policy) {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback();
                return e.response(&req.id);
            }
        };
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_tx_failed", e.to_string(), None);
        }
        (meta.id, clamped)
    };

    invalidate(state, &analysis_id);
    let count = req
        .params
        .get("questions")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);
    ok(
        &req.id,
        json!({ "ok": true, "questionCount": count, "clampedCells": clamped }),
    )
}

fn cell_error(index: usize, e: HandlerErr) -> serde_json::Value {
    let mut v = json!({ "index": index, "code": e.code, "message": e.message });
    if let Some(d) = e.details {
        v["details"] = d;
    }
    v
}

fn handle_analysis_responses_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let policy = match clamp_policy(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (analysis_id, updated, cleared, clamped, errors) = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let meta = match load_meta(conn, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let Some(cells) = req.params.get("responses").and_then(|v| v.as_array()) else {
            return err(&req.id, "bad_params", "missing responses[]", None);
        };
        if cells.len() > RESPONSES_SET_MAX_EDITS {
            let rejected = cells.len();
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
                            rejected, RESPONSES_SET_MAX_EDITS
                        )
                    }]
                }),
            );
        }

        let members: HashSet<String> = match db::load_roster(conn, &meta.class_id) {
            Ok(rows) => rows.into_iter().map(|s| s.id).collect(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let weights: HashMap<u32, f64> = match db::load_questions(conn, &meta.id) {
            Ok(qs) => qs.into_iter().map(|q| (q.idx, q.weight)).collect(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        let mut updated = 0_usize;
        let mut cleared = 0_usize;
        let mut clamped = 0_usize;
        let mut errors: Vec<serde_json::Value> = Vec::new();

        for (i, cell) in cells.iter().enumerate() {
            let student_id = cell.get("studentId").and_then(|v| v.as_str());
            let Some(student_id) = student_id.filter(|s| members.contains(*s)) else {
                errors.push(cell_error(
                    i,
                    HandlerErr::new("not_found", "student is not in this class")
                        .with_details(json!({ "studentId": student_id })),
                ));
                continue;
            };
            let idx = cell
                .get("questionIdx")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok());
            let Some((idx, weight)) = idx.and_then(|q| weights.get(&q).map(|w| (q, *w))) else {
                errors.push(cell_error(
                    i,
                    HandlerErr::new("not_found", "question not found")
                        .with_details(json!({ "questionIdx": cell.get("questionIdx") })),
                ));
                continue;
            };

            let raw = match cell.get("score") {
                None => None,
                Some(v) => match matrix::parse_cell(v) {
                    Ok(s) => s,
                    Err(()) => {
                        errors.push(cell_error(
                            i,
                            HandlerErr::new("bad_params", "score is not a number")
                                .with_details(json!({ "score": v })),
                        ));
                        continue;
                    }
                },
            };

            let result = match raw {
                None => {
                    cleared += 1;
                    tx.execute(
                        "DELETE FROM analysis_responses
                         WHERE analysis_id = ? AND student_id = ? AND question_idx = ?",
                        (&meta.id, student_id, idx),
                    )
                }
                Some(value) => {
                    let (score, was_clamped) = match matrix::check_score(value, weight, policy) {
                        Ok(v) => v,
                        Err(max) => {
                            errors.push(cell_error(
                                i,
                                HandlerErr::new(
                                    "bad_params",
                                    format!("score {} is outside 0..={}", value, max),
                                )
                                .with_details(json!({ "score": value, "max": max })),
                            ));
                            continue;
                        }
                    };
                    if was_clamped {
                        clamped += 1;
                    }
                    tx.execute(
                        "INSERT INTO analysis_responses(analysis_id, student_id, question_idx, score)
                         VALUES(?, ?, ?, ?)
                         ON CONFLICT(analysis_id, student_id, question_idx) DO UPDATE SET
                           score = excluded.score",
                        (&meta.id, student_id, idx, score),
                    )
                }
            };
            match result {
                Ok(_) => updated += 1,
                Err(e) => errors.push(cell_error(i, HandlerErr::db("db_update_failed", e))),
            }
        }

        if let Err(e) = tx.commit() {
            return err(&req.id, "db_tx_failed", e.to_string(), None);
        }
        (meta.id, updated, cleared, clamped, errors)
    };

    invalidate(state, &analysis_id);
    let mut result = json!({
        "ok": true,
        "updated": updated,
        "cleared": cleared,
        "clamped": clamped
    });
    if !errors.is_empty() {
        result["rejected"] = json!(errors.len());
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

fn handle_analysis_import_matrix(state: &mut AppState, req: &Request) -> serde_json::Value {
    let policy = match clamp_policy(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (analysis_id, imported) = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let meta = match load_meta(conn, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let Some(grid_value) = req.params.get("grid") else {
            return err(&req.id, "bad_params", "missing grid", None);
        };
        let grid: MatrixGrid = match serde_json::from_value(grid_value.clone()) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "bad_params", format!("invalid grid: {}", e), None),
        };

        let roster: Vec<_> = match db::load_roster(conn, &meta.class_id) {
            Ok(rows) => rows
                .iter()
                .filter(|s| s.active)
                .map(|s| s.roster_key())
                .collect(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let imported = match matrix::parse_matrix_grid(&grid, &roster, policy) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), Some(e.details())),
        };

        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        if let Err(e) = tx.execute(
            "DELETE FROM analysis_responses WHERE analysis_id = ?",
            [&meta.id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
        if let Err(e) = replace_questions(&tx, &meta.id, &imported.questions) {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
        for r in &imported.responses {
            if let Err(e) = tx.execute(
                "INSERT INTO analysis_responses(analysis_id, student_id, question_idx, score)
                 VALUES(?, ?, ?, ?)",
                (&meta.id, &r.student_id, r.question_idx, r.score),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "studentId": r.student_id, "questionIdx": r.question_idx })),
                );
            }
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_tx_failed", e.to_string(), None);
        }
        (meta.id, imported)
    };

    invalidate(state, &analysis_id);
    tracing::info!(
        analysis_id = %analysis_id,
        questions = imported.questions.len(),
        responses = imported.responses.len(),
        unmatched = imported.unmatched_keys.len(),
        "response matrix imported"
    );
    ok(
        &req.id,
        json!({
            "ok": true,
            "questionCount": imported.questions.len(),
            "responseCount": imported.responses.len(),
            "blankCells": imported.blank_cells,
            "clampedCells": imported.clamped_cells,
            "unmatchedKeys": imported.unmatched_keys
        }),
    )
}

fn handle_analysis_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (meta, input) = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let meta = match load_meta(conn, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        match db::load_analysis_input(conn, &meta) {
            Ok(input) => (meta, input),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let fingerprint = input.fingerprint();
    let cached = state
        .analysis_cache
        .get(&meta.id)
        .filter(|c| c.fingerprint == fingerprint)
        .map(|c| c.report.clone());
    let (report, from_cache) = match cached {
        Some(report) => (report, true),
        None => {
            let report = ctt::analyze(&input);
            state.analysis_cache.insert(
                meta.id.clone(),
                CachedReport {
                    fingerprint: fingerprint.clone(),
                    report: report.clone(),
                },
            );
            (report, false)
        }
    };

    tracing::info!(
        analysis_id = %meta.id,
        cached = from_cache,
        items = report.items.len(),
        students = report.students.len(),
        "analysis run"
    );
    ok(
        &req.id,
        json!({
            "analysisId": meta.id,
            "title": meta.title,
            "subjectId": meta.subject_id,
            "createdAt": meta.created_at,
            "fingerprint": fingerprint,
            "cached": from_cache,
            "report": report
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analysis.create" => Some(handle_analysis_create(state, req)),
        "analysis.list" => Some(handle_analysis_list(state, req)),
        "analysis.delete" => Some(handle_analysis_delete(state, req)),
        "analysis.questions.set" => Some(handle_analysis_questions_set(state, req)),
        "analysis.responses.set" => Some(handle_analysis_responses_set(state, req)),
        "analysis.importMatrix" => Some(handle_analysis_import_matrix(state, req)),
        "analysis.run" => Some(handle_analysis_run(state, req)),
        _ => None,
    }
}
