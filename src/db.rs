use crate::calc::{AssessmentKind, GradeRecord};
use crate::ctt::{AnalysisInput, Question, ResponseMatrix, Student};
use crate::matrix::RosterKey;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "raport.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade_level TEXT,
            academic_year TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            nis TEXT,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_students_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;
    ensure_subjects_kkm(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            nip TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(teacher_id, subject_id, class_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teaching_assignments_class ON teaching_assignments(class_id)",
        [],
    )?;

    // kind is 'tp' (ordinal >= 1) or 'uas' (ordinal 0), so the unique key
    // also caps a student at one UAS per subject and term.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            kind TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, subject_id, term, kind, ordinal)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class_term ON grades(class_id, term)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS analyses(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS analysis_questions(
            analysis_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            label TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1,
            PRIMARY KEY(analysis_id, idx),
            FOREIGN KEY(analysis_id) REFERENCES analyses(id)
        )",
        [],
    )?;
    // A missing row is "no response"; a stored 0 is a zero score.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS analysis_responses(
            analysis_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            question_idx INTEGER NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY(analysis_id, student_id, question_idx),
            FOREIGN KEY(analysis_id) REFERENCES analyses(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_analysis_responses_student ON analysis_responses(student_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_subjects_kkm(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subjects", "kkm")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE subjects ADD COLUMN kkm REAL", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub name: String,
    pub nis: Option<String>,
    pub active: bool,
    pub sort_order: i64,
}

impl RosterStudent {
    pub fn roster_key(&self) -> RosterKey {
        RosterKey {
            id: self.id.clone(),
            nis: self.nis.clone(),
            name: self.name.clone(),
        }
    }
}

pub fn class_exists(conn: &Connection, class_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

pub fn load_roster(conn: &Connection, class_id: &str) -> rusqlite::Result<Vec<RosterStudent>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, nis, active, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                name: r.get(1)?,
                nis: r.get(2)?,
                active: r.get::<_, i64>(3)? != 0,
                sort_order: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Grade records of a class for one term, keyed by subject code. Rows with a
/// kind the aggregator does not know are dropped.
pub fn load_grade_records(
    conn: &Connection,
    class_id: &str,
    subject_id: Option<&str>,
    term: i64,
) -> rusqlite::Result<Vec<GradeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT g.student_id, sub.code, g.kind, g.ordinal, g.score
         FROM grades g
         JOIN students s ON s.id = g.student_id AND s.class_id = g.class_id
         JOIN subjects sub ON sub.id = g.subject_id
         WHERE g.class_id = ?1 AND g.term = ?2 AND (?3 IS NULL OR g.subject_id = ?3)
         ORDER BY s.sort_order, sub.code, g.kind, g.ordinal",
    )?;
    let rows = stmt
        .query_map((class_id, term, subject_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, f64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (student_id, subject, kind, ordinal, score) in rows {
        let Some(kind) = AssessmentKind::from_storage(&kind, ordinal) else {
            tracing::warn!(student_id = %student_id, kind = %kind, "skipping grade with unknown kind");
            continue;
        };
        out.push(GradeRecord {
            student_id,
            subject,
            kind,
            score,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct AnalysisMeta {
    pub id: String,
    pub class_id: String,
    pub subject_id: Option<String>,
    pub title: String,
    pub created_at: String,
}

pub fn load_analysis_meta(
    conn: &Connection,
    analysis_id: &str,
) -> rusqlite::Result<Option<AnalysisMeta>> {
    conn.query_row(
        "SELECT id, class_id, subject_id, title, created_at FROM analyses WHERE id = ?",
        [analysis_id],
        |r| {
            Ok(AnalysisMeta {
                id: r.get(0)?,
                class_id: r.get(1)?,
                subject_id: r.get(2)?,
                title: r.get(3)?,
                created_at: r.get(4)?,
            })
        },
    )
    .optional()
}

pub fn load_questions(conn: &Connection, analysis_id: &str) -> rusqlite::Result<Vec<Question>> {
    let mut stmt = conn.prepare(
        "SELECT idx, label, weight FROM analysis_questions WHERE analysis_id = ? ORDER BY idx",
    )?;
    let rows = stmt
        .query_map([analysis_id], |r| {
            Ok(Question {
                idx: r.get(0)?,
                label: r.get(1)?,
                weight: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Snapshot for the item analysis engine: active students of the class in
/// roster order, questions in idx order, and every stored response.
pub fn load_analysis_input(
    conn: &Connection,
    meta: &AnalysisMeta,
) -> rusqlite::Result<AnalysisInput> {
    let students = load_roster(conn, &meta.class_id)?
        .into_iter()
        .filter(|s| s.active)
        .map(|s| Student {
            id: s.id,
            name: s.name,
        })
        .collect();
    let questions = load_questions(conn, &meta.id)?;

    let mut stmt = conn.prepare(
        "SELECT student_id, question_idx, score FROM analysis_responses WHERE analysis_id = ?",
    )?;
    let mut matrix = ResponseMatrix::new();
    let rows = stmt.query_map([&meta.id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, u32>(1)?,
            r.get::<_, f64>(2)?,
        ))
    })?;
    for row in rows {
        let (student_id, idx, score) = row?;
        matrix.insert((student_id, idx), score);
    }

    Ok(AnalysisInput {
        students,
        questions,
        matrix,
    })
}
