use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           t.id,
           t.name,
           t.nip,
           (SELECT COUNT(*) FROM teaching_assignments ta WHERE ta.teacher_id = t.id)
         FROM teachers t
         ORDER BY t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let nip: Option<String> = row.get(2)?;
            let assignment_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "nip": nip,
                "assignmentCount": assignment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nip = optional_str(req, "nip");

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name, nip) VALUES(?, ?, ?)",
        (&teacher_id, &name, &nip),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM teaching_assignments WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teaching_assignments" })),
        );
    }
    let changed = match tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            );
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "teacher not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn require_row(conn: &Connection, table: &str, id: &str) -> Result<(), HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match found {
        Some(_) => Ok(()),
        None => Err(HandlerErr::new("not_found", format!("{} row not found", table))
            .with_details(json!({ "table": table, "id": id }))),
    }
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = optional_str(req, "classId");
    let teacher_id = optional_str(req, "teacherId");

    let mut stmt = match conn.prepare(
        "SELECT ta.id, ta.class_id, c.name, ta.subject_id, s.code, s.name, ta.teacher_id, t.name
         FROM teaching_assignments ta
         JOIN classes c ON c.id = ta.class_id
         JOIN subjects s ON s.id = ta.subject_id
         JOIN teachers t ON t.id = ta.teacher_id
         WHERE (?1 IS NULL OR ta.class_id = ?1) AND (?2 IS NULL OR ta.teacher_id = ?2)
         ORDER BY c.name, s.code, t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&class_id, &teacher_id), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "classId": row.get::<_, String>(1)?,
                "className": row.get::<_, String>(2)?,
                "subjectId": row.get::<_, String>(3)?,
                "subjectCode": row.get::<_, String>(4)?,
                "subjectName": row.get::<_, String>(5)?,
                "teacherId": row.get::<_, String>(6)?,
                "teacherName": row.get::<_, String>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut ids = Vec::with_capacity(3);
    for key in ["teacherId", "subjectId", "classId"] {
        match required_str(req, key) {
            Ok(v) => ids.push(v),
            Err(e) => return e,
        }
    }
    let (teacher_id, subject_id, class_id) = (&ids[0], &ids[1], &ids[2]);

    for (table, id) in [
        ("teachers", teacher_id),
        ("subjects", subject_id),
        ("classes", class_id),
    ] {
        if let Err(e) = require_row(conn, table, id) {
            return e.response(&req.id);
        }
    }

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM teaching_assignments
             WHERE teacher_id = ? AND subject_id = ? AND class_id = ?",
            (teacher_id, subject_id, class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(assignment_id) = existing {
        return ok(
            &req.id,
            json!({ "assignmentId": assignment_id, "created": false }),
        );
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teaching_assignments(id, teacher_id, subject_id, class_id) VALUES(?, ?, ?, ?)",
        (&assignment_id, teacher_id, subject_id, class_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teaching_assignments" })),
        );
    }
    tracing::info!(assignment_id = %assignment_id, "teaching assignment created");

    ok(
        &req.id,
        json!({ "assignmentId": assignment_id, "created": true }),
    )
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute(
        "DELETE FROM teaching_assignments WHERE id = ?",
        [&assignment_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "assignment not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
