use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Formative (TP) share of the final grade.
pub const FORMATIVE_WEIGHT: f64 = 0.7;
/// Summative (UAS) share of the final grade.
pub const SUMMATIVE_WEIGHT: f64 = 0.3;

pub const DEFAULT_GOOD_THRESHOLD: f64 = 75.0;
pub const DEFAULT_AT_RISK_THRESHOLD: f64 = 60.0;

/// Column key of the grade pivot.
///
/// Variant order matters: the derived `Ord` sorts every formative task
/// before the summative exam, and formative tasks by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssessmentKind {
    Formative(u32),
    Summative,
}

impl AssessmentKind {
    /// Parses the column labels used by data entry: `TP1`, `tp 2`, `UAS`.
    pub fn parse_label(raw: &str) -> Option<Self> {
        let t = raw.trim().to_ascii_uppercase();
        if t == "UAS" {
            return Some(AssessmentKind::Summative);
        }
        let rest = t.strip_prefix("TP")?.trim();
        rest.parse::<u32>().ok().map(AssessmentKind::Formative)
    }

    pub fn storage_kind(self) -> &'static str {
        match self {
            AssessmentKind::Formative(_) => "tp",
            AssessmentKind::Summative => "uas",
        }
    }

    pub fn ordinal(self) -> i64 {
        match self {
            AssessmentKind::Formative(n) => n as i64,
            AssessmentKind::Summative => 0,
        }
    }

    pub fn from_storage(kind: &str, ordinal: i64) -> Option<Self> {
        match kind {
            "tp" => u32::try_from(ordinal).ok().map(AssessmentKind::Formative),
            "uas" => Some(AssessmentKind::Summative),
            _ => None,
        }
    }
}

impl fmt::Display for AssessmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssessmentKind::Formative(n) => write!(f, "TP{}", n),
            AssessmentKind::Summative => write!(f, "UAS"),
        }
    }
}

impl Serialize for AssessmentKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub student_id: String,
    pub subject: String,
    pub kind: AssessmentKind,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotRow {
    pub student_id: String,
    pub subject: String,
    pub scores: BTreeMap<AssessmentKind, f64>,
    pub final_grade: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotTable {
    pub columns: Vec<AssessmentKind>,
    pub rows: Vec<PivotRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Band {
    A,
    B,
    C,
    D,
    E,
}

impl Band {
    pub const ALL: [Band; 5] = [Band::A, Band::B, Band::C, Band::D, Band::E];

    pub fn range_label(self) -> &'static str {
        match self {
            Band::A => "90-100",
            Band::B => "80-89",
            Band::C => "70-79",
            Band::D => "60-69",
            Band::E => "0-59",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeThresholds {
    pub good: f64,
    pub at_risk: f64,
}

impl Default for GradeThresholds {
    fn default() -> Self {
        Self {
            good: DEFAULT_GOOD_THRESHOLD,
            at_risk: DEFAULT_AT_RISK_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandCount {
    pub band: Band,
    pub label: &'static str,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub rank: usize,
    pub student_id: String,
    pub subject: String,
    pub final_grade: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupSummary {
    pub mean_final: Option<f64>,
    pub row_count: usize,
    pub graded_count: usize,
    pub good_count: usize,
    pub at_risk_count: usize,
    pub thresholds: GradeThresholds,
    pub distribution: Vec<BandCount>,
    pub top: Vec<RankedStudent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject: String,
    pub mean_final: Option<f64>,
    pub graded_count: usize,
    pub row_count: usize,
}

/// Groups records into one row per (student, subject), in order of first
/// appearance. A later record for the same cell replaces the earlier one.
pub fn pivot(records: &[GradeRecord]) -> PivotTable {
    let mut columns: BTreeSet<AssessmentKind> = BTreeSet::new();
    let mut row_index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut rows: Vec<PivotRow> = Vec::new();

    for r in records {
        columns.insert(r.kind);
        let key = (r.student_id.as_str(), r.subject.as_str());
        let idx = match row_index.get(&key) {
            Some(i) => *i,
            None => {
                rows.push(PivotRow {
                    student_id: r.student_id.clone(),
                    subject: r.subject.clone(),
                    scores: BTreeMap::new(),
                    final_grade: None,
                });
                row_index.insert(key, rows.len() - 1);
                rows.len() - 1
            }
        };
        rows[idx].scores.insert(r.kind, r.score);
    }

    for row in rows.iter_mut() {
        row.final_grade = final_grade(row);
    }

    PivotTable {
        columns: columns.into_iter().collect(),
        rows,
    }
}

/// `0.7 * mean(TP) + 0.3 * UAS`; undefined without at least one TP and the UAS.
pub fn final_grade(row: &PivotRow) -> Option<f64> {
    let mut tp_sum = 0.0_f64;
    let mut tp_count = 0_usize;
    let mut uas: Option<f64> = None;
    for (kind, score) in &row.scores {
        match kind {
            AssessmentKind::Formative(_) => {
                tp_sum += *score;
                tp_count += 1;
            }
            AssessmentKind::Summative => uas = Some(*score),
        }
    }
    if tp_count == 0 {
        return None;
    }
    let uas = uas?;
    let tp_mean = tp_sum / (tp_count as f64);
    Some(FORMATIVE_WEIGHT * tp_mean + SUMMATIVE_WEIGHT * uas)
}

pub fn classify(score: f64) -> Band {
    if score >= 90.0 {
        Band::A
    } else if score >= 80.0 {
        Band::B
    } else if score >= 70.0 {
        Band::C
    } else if score >= 60.0 {
        Band::D
    } else {
        Band::E
    }
}

pub fn rollup(rows: &[PivotRow], thresholds: GradeThresholds, top_n: usize) -> RollupSummary {
    let mut band_counts: BTreeMap<Band, usize> = BTreeMap::new();
    let mut graded: Vec<&PivotRow> = Vec::new();
    let mut sum = 0.0_f64;
    let mut good_count = 0_usize;
    let mut at_risk_count = 0_usize;

    for row in rows {
        let Some(fg) = row.final_grade else {
            continue;
        };
        sum += fg;
        if fg >= thresholds.good {
            good_count += 1;
        }
        if fg < thresholds.at_risk {
            at_risk_count += 1;
        }
        *band_counts.entry(classify(fg)).or_insert(0) += 1;
        graded.push(row);
    }

    let mean_final = if graded.is_empty() {
        None
    } else {
        Some(sum / (graded.len() as f64))
    };

    // `sort_by` is stable, so equal grades keep their input order.
    let mut ranked = graded.clone();
    ranked.sort_by(|a, b| {
        let a = a.final_grade.unwrap_or(f64::NEG_INFINITY);
        let b = b.final_grade.unwrap_or(f64::NEG_INFINITY);
        b.partial_cmp(&a).unwrap_or(Ordering::Equal)
    });
    let top = ranked
        .into_iter()
        .take(top_n)
        .enumerate()
        .map(|(i, r)| RankedStudent {
            rank: i + 1,
            student_id: r.student_id.clone(),
            subject: r.subject.clone(),
            final_grade: r.final_grade.unwrap_or(0.0),
        })
        .collect();

    let distribution = Band::ALL
        .iter()
        .map(|b| BandCount {
            band: *b,
            label: b.range_label(),
            count: band_counts.get(b).copied().unwrap_or(0),
        })
        .collect();

    RollupSummary {
        mean_final,
        row_count: rows.len(),
        graded_count: graded.len(),
        good_count,
        at_risk_count,
        thresholds,
        distribution,
        top,
    }
}

pub fn subject_averages(rows: &[PivotRow]) -> Vec<SubjectAverage> {
    let mut order: Vec<String> = Vec::new();
    let mut acc: HashMap<String, (f64, usize, usize)> = HashMap::new();
    for row in rows {
        let entry = acc.entry(row.subject.clone()).or_insert_with(|| {
            order.push(row.subject.clone());
            (0.0, 0, 0)
        });
        entry.2 += 1;
        if let Some(fg) = row.final_grade {
            entry.0 += fg;
            entry.1 += 1;
        }
    }
    order
        .into_iter()
        .map(|subject| {
            let (sum, graded, total) = acc.get(&subject).copied().unwrap_or((0.0, 0, 0));
            SubjectAverage {
                mean_final: if graded > 0 {
                    Some(sum / (graded as f64))
                } else {
                    None
                },
                graded_count: graded,
                row_count: total,
                subject,
            }
        })
        .collect()
}
