use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Child rows of a class, in the order they must be deleted (no ON DELETE CASCADE).
const CLASS_DELETE_ORDER: &[(&str, &str)] = &[
    (
        "analysis_responses",
        "DELETE FROM analysis_responses
         WHERE analysis_id IN (SELECT id FROM analyses WHERE class_id = ?)",
    ),
    (
        "analysis_questions",
        "DELETE FROM analysis_questions
         WHERE analysis_id IN (SELECT id FROM analyses WHERE class_id = ?)",
    ),
    ("analyses", "DELETE FROM analyses WHERE class_id = ?"),
    ("grades", "DELETE FROM grades WHERE class_id = ?"),
    (
        "teaching_assignments",
        "DELETE FROM teaching_assignments WHERE class_id = ?",
    ),
    ("students", "DELETE FROM students WHERE class_id = ?"),
    ("classes", "DELETE FROM classes WHERE id = ?"),
];

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.grade_level,
           c.academic_year,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS student_count,
           (SELECT COUNT(*) FROM analyses a WHERE a.class_id = c.id) AS analysis_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_level: Option<String> = row.get(2)?;
            let academic_year: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let analysis_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLevel": grade_level,
                "academicYear": academic_year,
                "studentCount": student_count,
                "analysisCount": analysis_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_level = optional_str(req, "gradeLevel");
    let academic_year = optional_str(req, "academicYear");

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, grade_level, academic_year) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &grade_level, &academic_year),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    tracing::info!(class_id = %class_id, "class created");
    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current: Option<(String, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT name, grade_level, academic_year FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name, grade_level, academic_year)) = current else {
        return err(&req.id, "not_found", "class not found", None);
    };

    if let Some(v) = req.params.get("name") {
        if v.as_str().map(|s| s.trim().is_empty()).unwrap_or(true) {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
    }
    let name = optional_str(req, "name").unwrap_or(name);
    let grade_level = optional_str(req, "gradeLevel").or(grade_level);
    let academic_year = optional_str(req, "academicYear").or(academic_year);

    if let Err(e) = conn.execute(
        "UPDATE classes SET name = ?, grade_level = ?, academic_year = ? WHERE id = ?",
        (&name, &grade_level, &academic_year, &class_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "name": name,
            "gradeLevel": grade_level,
            "academicYear": academic_year
        }),
    )
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let removed_analyses: Vec<String> = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };

        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "class not found", None);
        }

        let analysis_ids = conn
            .prepare("SELECT id FROM analyses WHERE class_id = ?")
            .and_then(|mut stmt| {
                let ids = stmt
                    .query_map([&class_id], |r| r.get::<_, String>(0))
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>());
                ids
            });
        let analysis_ids = match analysis_ids {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        for (table, sql) in CLASS_DELETE_ORDER {
            if let Err(e) = tx.execute(sql, [&class_id]) {
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
        analysis_ids
    };

    for id in &removed_analyses {
        state.analysis_cache.remove(id);
    }
    tracing::info!(class_id = %class_id, "class deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
