use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_f64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, code, name, kkm FROM subjects ORDER BY code") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            let kkm: Option<f64> = row.get(3)?;
            Ok(json!({ "id": id, "code": code, "name": name, "kkm": kkm }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v.to_ascii_uppercase(),
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kkm = match optional_f64(req, "kkm") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(k) = kkm {
        if !(0.0..=100.0).contains(&k) {
            return err(
                &req.id,
                "bad_params",
                "kkm must be between 0 and 100",
                Some(json!({ "kkm": k })),
            );
        }
    }

    let taken: Option<String> = match conn
        .query_row("SELECT id FROM subjects WHERE code = ?", [&code], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(existing) = taken {
        return err(
            &req.id,
            "bad_params",
            "subject code already exists",
            Some(json!({ "code": code, "subjectId": existing })),
        );
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, code, name, kkm) VALUES(?, ?, ?, ?)",
        (&subject_id, &code, &name, kkm),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "code": code }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Analyses outlive their subject; they only lose the link.
    for (table, sql) in [
        (
            "analyses",
            "UPDATE analyses SET subject_id = NULL WHERE subject_id = ?",
        ),
        ("grades", "DELETE FROM grades WHERE subject_id = ?"),
        (
            "teaching_assignments",
            "DELETE FROM teaching_assignments WHERE subject_id = ?",
        ),
        ("subjects", "DELETE FROM subjects WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&subject_id]) {
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

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
