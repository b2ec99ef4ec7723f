use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match db::load_roster(conn, &class_id) {
        Ok(rows) => {
            let students: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "name": s.name,
                        "nis": s.nis,
                        "active": s.active,
                        "sortOrder": s.sort_order
                    })
                })
                .collect();
            ok(&req.id, json!({ "students": students }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nis = optional_str(req, "nis");
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    match db::class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, name, nis, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &name,
            &nis,
            if active { 1 } else { 0 },
            next_sort,
            db::now_ts(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "sortOrder": next_sort }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current: Option<(String, Option<String>, i64)> = match conn
        .query_row(
            "SELECT name, nis, active FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name, nis, active)) = current else {
        return err(&req.id, "not_found", "student not found", None);
    };

    if let Some(v) = req.params.get("name") {
        if v.as_str().map(|s| s.trim().is_empty()).unwrap_or(true) {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
    }
    let name = optional_str(req, "name").unwrap_or(name);
    // An explicit empty string clears the student number.
    let nis = match req.params.get("nis") {
        Some(v) if v.is_null() => None,
        Some(_) => optional_str(req, "nis"),
        None => nis,
    };
    let active = match req.params.get("active") {
        None => active != 0,
        Some(v) => match v.as_bool() {
            Some(b) => b,
            None => return err(&req.id, "bad_params", "active must be a boolean", None),
        },
    };

    if let Err(e) = conn.execute(
        "UPDATE students SET name = ?, nis = ?, active = ?, updated_at = ? WHERE id = ?",
        (&name, &nis, if active { 1 } else { 0 }, db::now_ts(), &student_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "name": name, "nis": nis, "active": active }),
    )
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let class_id: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_id) = class_id else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        (
            "analysis_responses",
            "DELETE FROM analysis_responses WHERE student_id = ?",
        ),
        ("grades", "DELETE FROM grades WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    // Keep sort_order dense so roster order stays stable.
    if let Err(e) = tx.execute(
        "UPDATE students
         SET sort_order = (
           SELECT COUNT(*) FROM students s2
           WHERE s2.class_id = students.class_id AND s2.sort_order < students.sort_order
         )
         WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
