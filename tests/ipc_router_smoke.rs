use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_raportd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn raportd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn result_str(v: &serde_json::Value, key: &str) -> String {
    v.get("result")
        .and_then(|r| r.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("raport-router-smoke");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert!(health["result"]["workspacePath"].is_null());

    let no_ws = request(
        &mut stdin,
        &mut reader,
        "1a",
        "students.list",
        json!({ "classId": "x" }),
    );
    assert_eq!(no_ws["error"]["code"], json!("no_workspace"));

    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Smoke Class" }),
    );
    let class_id = result_str(&created, "classId");
    assert!(!class_id.is_empty());

    let _ = request(&mut stdin, &mut reader, "4", "classes.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "classes.update",
        json!({ "classId": class_id, "academicYear": "2025/2026" }),
    );
    let student = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "classId": class_id, "name": "Smoke Student", "nis": "1" }),
    );
    let student_id = result_str(&student, "studentId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "studentId": student_id, "name": "Updated" }),
    );
    let subject = request(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.create",
        json!({ "code": "mtk", "name": "Matematika", "kkm": 75 }),
    );
    let subject_id = result_str(&subject, "subjectId");
    let _ = request(&mut stdin, &mut reader, "10", "subjects.list", json!({}));
    let teacher = request(
        &mut stdin,
        &mut reader,
        "11",
        "teachers.create",
        json!({ "name": "Bu Sari" }),
    );
    let teacher_id = result_str(&teacher, "teacherId");
    let _ = request(&mut stdin, &mut reader, "12", "teachers.list", json!({}));
    let assignment = request(
        &mut stdin,
        &mut reader,
        "13",
        "assignments.create",
        json!({ "teacherId": teacher_id, "subjectId": subject_id, "classId": class_id }),
    );
    let assignment_id = result_str(&assignment, "assignmentId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "assignments.list",
        json!({ "classId": class_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "grades.upsert",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "term": 1,
            "edits": [{ "studentId": student_id, "kind": "TP1", "score": 80 }]
        }),
    );
    let listed = request(
        &mut stdin,
        &mut reader,
        "16",
        "grades.list",
        json!({ "classId": class_id, "term": 1 }),
    );
    let grade_id = listed["result"]["grades"][0]["id"]
        .as_str()
        .unwrap_or("")
        .to_string();
    for (id, method) in [("17", "grades.pivot"), ("18", "grades.summary")] {
        let _ = request(
            &mut stdin,
            &mut reader,
            id,
            method,
            json!({ "classId": class_id, "term": 1 }),
        );
    }
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "grades.delete",
        json!({ "gradeId": grade_id }),
    );

    let analysis = request(
        &mut stdin,
        &mut reader,
        "20",
        "analysis.create",
        json!({ "classId": class_id, "title": "UH 1" }),
    );
    let analysis_id = result_str(&analysis, "analysisId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "analysis.list",
        json!({ "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "analysis.questions.set",
        json!({ "analysisId": analysis_id, "questions": [{ "weight": 2 }] }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "analysis.responses.set",
        json!({
            "analysisId": analysis_id,
            "responses": [{ "studentId": student_id, "questionIdx": 1, "score": 1 }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "analysis.importMatrix",
        json!({
            "analysisId": analysis_id,
            "grid": { "header": ["Q1"], "rows": [["1", 1]] }
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "analysis.run",
        json!({ "analysisId": analysis_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "analysis.delete",
        json!({ "analysisId": analysis_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "assignments.delete",
        json!({ "assignmentId": assignment_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "30",
        "teachers.delete",
        json!({ "teacherId": teacher_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "32",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "33",
        "classes.delete",
        json!({ "classId": class_id }),
    );

    let payload = json!({ "id": "34", "method": "nope.nothing", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let unknown = read_response(&mut reader);
    assert_eq!(unknown["error"]["code"], json!("not_implemented"));

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let bad = read_response(&mut reader);
    assert_eq!(bad["ok"], json!(false));
    assert_eq!(bad["error"]["code"], json!("bad_json"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
