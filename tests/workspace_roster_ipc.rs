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

fn spawn_sidecar_with_env(vars: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_raportd");
    let mut cmd = Command::new(exe);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    for (k, v) in vars {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("spawn raportd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
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

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn id_of(v: &serde_json::Value, key: &str) -> String {
    v[key].as_str().unwrap_or_else(|| panic!("missing {}", key)).to_string()
}

#[test]
fn startup_workspace_from_env_and_roster_crud() {
    let workspace = temp_dir("raport-roster");
    let ws = workspace.to_string_lossy().to_string();
    let (mut child, mut stdin, mut reader) =
        spawn_sidecar_with_env(&[("RAPORTD_WORKSPACE", &ws), ("RAPORTD_LOG", "debug")]);

    let health = request_ok(&mut stdin, &mut reader, "h", "health", json!({}));
    assert_eq!(health["workspacePath"], json!(ws));

    let class_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "c",
            "classes.create",
            json!({ "name": "VII A", "gradeLevel": "7", "academicYear": "2025/2026" }),
        ),
        "classId",
    );
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "cu",
        "classes.update",
        json!({ "classId": class_id, "name": "VII-A" }),
    );
    assert_eq!(updated["name"], json!("VII-A"));
    assert_eq!(updated["academicYear"], json!("2025/2026"));
    let empty_name = request(
        &mut stdin,
        &mut reader,
        "cu2",
        "classes.update",
        json!({ "classId": class_id, "name": "  " }),
    );
    assert_eq!(empty_name["error"]["code"], json!("bad_params"));

    let mut ids = Vec::new();
    for (i, name) in ["Ani", "Budi", "Citra"].iter().enumerate() {
        let r = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "classId": class_id, "name": name, "nis": format!("10{}", i) }),
        );
        assert_eq!(r["sortOrder"], json!(i));
        ids.push(id_of(&r, "studentId"));
    }
    let no_class = request(
        &mut stdin,
        &mut reader,
        "s-bad",
        "students.create",
        json!({ "classId": "nope", "name": "Ghost" }),
    );
    assert_eq!(no_class["error"]["code"], json!("not_found"));

    request_ok(
        &mut stdin,
        &mut reader,
        "su",
        "students.update",
        json!({ "studentId": ids[1], "active": false, "nis": null }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "sl",
        "students.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["students"][1]["active"], json!(false));
    assert!(listed["students"][1]["nis"].is_null());
    assert_eq!(listed["students"][1]["name"], json!("Budi"));

    let classes = request_ok(&mut stdin, &mut reader, "cl", "classes.list", json!({}));
    assert_eq!(classes["classes"][0]["studentCount"], json!(2));

    // Deleting keeps the remaining roster order dense.
    request_ok(
        &mut stdin,
        &mut reader,
        "sd",
        "students.delete",
        json!({ "studentId": ids[0] }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "sl2",
        "students.list",
        json!({ "classId": class_id }),
    );
    let order: Vec<i64> = listed["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["sortOrder"].as_i64().expect("sortOrder"))
        .collect();
    assert_eq!(order, vec![0, 1]);
    assert_eq!(listed["students"][0]["name"], json!("Budi"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn subjects_staff_and_cascading_deletes() {
    let workspace = temp_dir("raport-staff");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_with_env(&[]);

    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "c",
            "classes.create",
            json!({ "name": "VIII B" }),
        ),
        "classId",
    );
    let student_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "s",
            "students.create",
            json!({ "classId": class_id, "name": "Dewi" }),
        ),
        "studentId",
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "sub",
        "subjects.create",
        json!({ "code": "ipa", "name": "IPA", "kkm": 70 }),
    );
    assert_eq!(subject["code"], json!("IPA"));
    let subject_id = id_of(&subject, "subjectId");
    let dup = request(
        &mut stdin,
        &mut reader,
        "sub2",
        "subjects.create",
        json!({ "code": "IPA", "name": "Sains" }),
    );
    assert_eq!(dup["error"]["code"], json!("bad_params"));
    let bad_kkm = request(
        &mut stdin,
        &mut reader,
        "sub3",
        "subjects.create",
        json!({ "code": "IPS", "name": "IPS", "kkm": 120 }),
    );
    assert_eq!(bad_kkm["error"]["code"], json!("bad_params"));

    let teacher_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "t",
            "teachers.create",
            json!({ "name": "Pak Budi", "nip": "19800101" }),
        ),
        "teacherId",
    );
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "assignments.create",
        json!({ "teacherId": teacher_id, "subjectId": subject_id, "classId": class_id }),
    );
    assert_eq!(first["created"], json!(true));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "assignments.create",
        json!({ "teacherId": teacher_id, "subjectId": subject_id, "classId": class_id }),
    );
    assert_eq!(again["created"], json!(false));
    assert_eq!(again["assignmentId"], first["assignmentId"]);
    let unknown = request(
        &mut stdin,
        &mut reader,
        "a3",
        "assignments.create",
        json!({ "teacherId": "nobody", "subjectId": subject_id, "classId": class_id }),
    );
    assert_eq!(unknown["error"]["code"], json!("not_found"));
    assert_eq!(unknown["error"]["details"]["table"], json!("teachers"));

    let assignments = request_ok(
        &mut stdin,
        &mut reader,
        "al",
        "assignments.list",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(assignments["assignments"][0]["subjectCode"], json!("IPA"));
    assert_eq!(assignments["assignments"][0]["className"], json!("VIII B"));
    let teachers = request_ok(&mut stdin, &mut reader, "tl", "teachers.list", json!({}));
    assert_eq!(teachers["teachers"][0]["assignmentCount"], json!(1));

    request_ok(
        &mut stdin,
        &mut reader,
        "g",
        "grades.upsert",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "term": 1,
            "edits": [{ "studentId": student_id, "kind": "TP1", "score": 88 }]
        }),
    );
    let analysis_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "an",
            "analysis.create",
            json!({ "classId": class_id, "subjectId": subject_id, "title": "UH" }),
        ),
        "analysisId",
    );

    // The subject goes away with its grades; the analysis only loses the link.
    request_ok(
        &mut stdin,
        &mut reader,
        "subd",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );
    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "gl",
        "grades.list",
        json!({ "classId": class_id, "term": 1 }),
    );
    assert_eq!(grades["grades"], json!([]));
    let analyses = request_ok(&mut stdin, &mut reader, "anl", "analysis.list", json!({}));
    assert_eq!(analyses["analyses"][0]["id"], json!(analysis_id));
    assert!(analyses["analyses"][0]["subjectId"].is_null());
    let teachers = request_ok(&mut stdin, &mut reader, "tl2", "teachers.list", json!({}));
    assert_eq!(teachers["teachers"][0]["assignmentCount"], json!(0));

    request_ok(
        &mut stdin,
        &mut reader,
        "td",
        "teachers.delete",
        json!({ "teacherId": teacher_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "td2",
        "teachers.delete",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(gone["error"]["code"], json!("not_found"));

    request_ok(
        &mut stdin,
        &mut reader,
        "cd",
        "classes.delete",
        json!({ "classId": class_id }),
    );
    let classes = request_ok(&mut stdin, &mut reader, "cl", "classes.list", json!({}));
    assert_eq!(classes["classes"], json!([]));
    let analyses = request_ok(&mut stdin, &mut reader, "anl2", "analysis.list", json!({}));
    assert_eq!(analyses["analyses"], json!([]));
    let run = request(
        &mut stdin,
        &mut reader,
        "run",
        "analysis.run",
        json!({ "analysisId": analysis_id }),
    );
    assert_eq!(run["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn invalid_config_fails_startup() {
    let (mut child, stdin, _reader) = spawn_sidecar_with_env(&[("RAPORTD_LOG_JSON", "maybe")]);
    drop(stdin);
    let status = child.wait().expect("wait for raportd");
    assert!(!status.success());
}
