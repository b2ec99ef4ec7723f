//! Classical test theory item analysis over a sparse response matrix.
//!
//! Every function here is a pure computation over an [`AnalysisInput`]
//! snapshot. Arithmetic degeneracies (empty samples, zero variance, zero
//! weights) come back as `None`; nothing in this module returns an error.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Variances at or below this are treated as zero.
const VARIANCE_EPSILON: f64 = 1e-12;

pub const EASY_MIN_P: f64 = 0.70;
pub const HARD_MAX_P: f64 = 0.30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub idx: u32,
    pub label: String,
    /// Maximum achievable score on this question.
    pub weight: f64,
}

/// (student id, question idx) -> raw score. An absent key is "no response",
/// which is not the same thing as a response scored 0.
pub type ResponseMatrix = BTreeMap<(String, u32), f64>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisInput {
    pub students: Vec<Student>,
    pub questions: Vec<Question>,
    pub matrix: ResponseMatrix,
}

impl AnalysisInput {
    /// SHA-256 over a canonical encoding of the snapshot. Two inputs with the
    /// same fingerprint produce the same report.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for s in &self.students {
            hasher.update(b"s\0");
            hasher.update(s.id.as_bytes());
            hasher.update(b"\0");
            hasher.update(s.name.as_bytes());
            hasher.update(b"\0");
        }
        for q in &self.questions {
            hasher.update(b"q\0");
            hasher.update(q.idx.to_le_bytes());
            hasher.update(q.label.as_bytes());
            hasher.update(b"\0");
            hasher.update(q.weight.to_bits().to_le_bytes());
        }
        for ((sid, qidx), score) in &self.matrix {
            hasher.update(b"r\0");
            hasher.update(sid.as_bytes());
            hasher.update(b"\0");
            hasher.update(qidx.to_le_bytes());
            hasher.update(score.to_bits().to_le_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    #[serde(rename = "-")]
    Undefined,
}

impl Difficulty {
    pub fn from_p_value(p: Option<f64>) -> Self {
        match p {
            None => Difficulty::Undefined,
            Some(p) if p >= EASY_MIN_P => Difficulty::Easy,
            Some(p) if p <= HARD_MAX_P => Difficulty::Hard,
            Some(_) => Difficulty::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatistic {
    pub question_idx: u32,
    pub label: String,
    pub weight: f64,
    pub n: usize,
    pub p_value: Option<f64>,
    pub mean: Option<f64>,
    pub item_total_corr: Option<f64>,
    pub point_biserial: Option<f64>,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reliability {
    /// Number of questions with a positive weight and at least one respondent.
    pub k: usize,
    pub respondent_count: usize,
    pub alpha: Option<f64>,
    pub sem: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalScore {
    pub earned: f64,
    pub possible: f64,
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub student_id: String,
    pub name: String,
    pub answered: usize,
    pub total: Option<f64>,
    pub final_score: FinalScore,
}

/// Cells dropped while reading the matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedCells {
    pub unknown_student: usize,
    pub unknown_question: usize,
    pub non_finite: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub items: Vec<ItemStatistic>,
    pub reliability: Reliability,
    pub students: Vec<StudentResult>,
    pub skipped: SkippedCells,
}

/// Dense view of the matrix restricted to the roster and the question list.
struct Grid<'a> {
    input: &'a AnalysisInput,
    /// raw[q][s]
    raw: Vec<Vec<Option<f64>>>,
    student_pos: HashMap<&'a str, usize>,
    question_pos: HashMap<u32, usize>,
    skipped: SkippedCells,
}

impl<'a> Grid<'a> {
    fn build(input: &'a AnalysisInput) -> Self {
        let mut student_pos = HashMap::with_capacity(input.students.len());
        for (i, s) in input.students.iter().enumerate() {
            student_pos.entry(s.id.as_str()).or_insert(i);
        }
        let mut question_pos = HashMap::with_capacity(input.questions.len());
        for (i, q) in input.questions.iter().enumerate() {
            question_pos.entry(q.idx).or_insert(i);
        }

        let mut raw = vec![vec![None; input.students.len()]; input.questions.len()];
        let mut skipped = SkippedCells::default();
        for ((sid, qidx), score) in &input.matrix {
            let Some(&s) = student_pos.get(sid.as_str()) else {
                skipped.unknown_student += 1;
                continue;
            };
            let Some(&q) = question_pos.get(qidx) else {
                skipped.unknown_question += 1;
                continue;
            };
            if !score.is_finite() {
                skipped.non_finite += 1;
                continue;
            }
            raw[q][s] = Some(*score);
        }

        if skipped != SkippedCells::default() {
            tracing::info!(
                unknown_student = skipped.unknown_student,
                unknown_question = skipped.unknown_question,
                non_finite = skipped.non_finite,
                "ignored response cells outside the roster or question list"
            );
        }

        Self {
            input,
            raw,
            student_pos,
            question_pos,
            skipped,
        }
    }

    fn weight(&self, q: usize) -> f64 {
        self.input.questions[q].weight
    }

    /// score / weight, only for questions that can be normalized.
    fn fraction(&self, q: usize, s: usize) -> Option<f64> {
        let w = self.weight(q);
        if w <= 0.0 {
            return None;
        }
        self.raw[q][s].map(|v| v / w)
    }

    fn respondents(&self, q: usize) -> Vec<(usize, f64)> {
        (0..self.input.students.len())
            .filter_map(|s| self.fraction(q, s).map(|f| (s, f)))
            .collect()
    }

    fn weighted_total(&self, s: usize) -> Option<f64> {
        let mut num = 0.0_f64;
        let mut denom = 0.0_f64;
        for q in 0..self.input.questions.len() {
            if let Some(f) = self.fraction(q, s) {
                let w = self.weight(q);
                num += f * w;
                denom += w;
            }
        }
        if denom > 0.0 {
            Some(num / denom)
        } else {
            None
        }
    }

    /// Sum of fractional scores over answered questions; this is the total
    /// that reliability is computed against.
    fn sum_total(&self, s: usize) -> Option<f64> {
        let mut any = false;
        let mut sum = 0.0_f64;
        for q in 0..self.input.questions.len() {
            if let Some(f) = self.fraction(q, s) {
                any = true;
                sum += f;
            }
        }
        any.then_some(sum)
    }

    fn item(&self, q: usize) -> ItemStatistic {
        let question = &self.input.questions[q];
        let respondents = self.respondents(q);
        let n = respondents.len();

        if question.weight <= 0.0 || n == 0 {
            tracing::debug!(
                question = question.idx,
                weight = question.weight,
                respondents = n,
                "item statistics undefined"
            );
            return ItemStatistic {
                question_idx: question.idx,
                label: question.label.clone(),
                weight: question.weight,
                n,
                p_value: None,
                mean: None,
                item_total_corr: None,
                point_biserial: None,
                difficulty: Difficulty::Undefined,
            };
        }

        let fractions: Vec<f64> = respondents.iter().map(|(_, f)| *f).collect();
        let p_value = fractions.iter().sum::<f64>() / (n as f64);

        let mut xs_weighted = Vec::with_capacity(n);
        let mut ys_weighted = Vec::with_capacity(n);
        let mut xs_sum = Vec::with_capacity(n);
        let mut ys_sum = Vec::with_capacity(n);
        for (s, f) in &respondents {
            if let Some(t) = self.weighted_total(*s) {
                xs_weighted.push(*f);
                ys_weighted.push(t);
            }
            if let Some(t) = self.sum_total(*s) {
                xs_sum.push(*f);
                ys_sum.push(t);
            }
        }
        let point_biserial = pearson(&xs_weighted, &ys_weighted);
        let item_total_corr = pearson(&xs_sum, &ys_sum);
        if point_biserial.is_none() {
            tracing::debug!(
                question = question.idx,
                respondents = n,
                "item correlation undefined"
            );
        }

        ItemStatistic {
            question_idx: question.idx,
            label: question.label.clone(),
            weight: question.weight,
            n,
            p_value: Some(p_value),
            mean: Some(p_value),
            item_total_corr,
            point_biserial,
            difficulty: Difficulty::from_p_value(Some(p_value)),
        }
    }

    /// Questions that count towards reliability.
    fn reliability_items(&self) -> Vec<usize> {
        (0..self.input.questions.len())
            .filter(|q| self.weight(*q) > 0.0 && !self.respondents(*q).is_empty())
            .collect()
    }

    fn total_scores(&self) -> Vec<f64> {
        (0..self.input.students.len())
            .filter_map(|s| self.sum_total(s))
            .collect()
    }

    fn cronbach_alpha(&self) -> Option<f64> {
        let items = self.reliability_items();
        let k = items.len();
        if k < 2 {
            tracing::debug!(k, "cronbach alpha needs at least two items");
            return None;
        }
        let item_variance_sum: f64 = items
            .iter()
            .map(|q| {
                let fractions: Vec<f64> = self.respondents(*q).iter().map(|(_, f)| *f).collect();
                population_variance(&fractions).unwrap_or(0.0)
            })
            .sum();
        let total_variance = population_variance(&self.total_scores())?;
        if total_variance <= VARIANCE_EPSILON {
            tracing::debug!("cronbach alpha undefined for zero total variance");
            return None;
        }
        let k = k as f64;
        Some((k / (k - 1.0)) * (1.0 - item_variance_sum / total_variance))
    }

    fn final_score(&self, s: usize) -> FinalScore {
        let mut earned = 0.0_f64;
        let mut possible = 0.0_f64;
        for q in 0..self.input.questions.len() {
            let w = self.weight(q);
            if w <= 0.0 {
                continue;
            }
            possible += w;
            if let Some(v) = self.raw[q][s] {
                earned += v;
            }
        }
        FinalScore {
            earned,
            possible,
            percent: if possible > 0.0 {
                Some(100.0 * earned / possible)
            } else {
                None
            },
        }
    }

    fn answered(&self, s: usize) -> usize {
        (0..self.input.questions.len())
            .filter(|q| self.raw[*q][s].is_some())
            .count()
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / (values.len() as f64))
}

fn population_variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some(ss / (values.len() as f64))
}

/// Pearson product-moment correlation. `None` below two pairs or when either
/// series is constant.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mx = mean(xs)?;
    let my = mean(ys)?;
    let mut sxx = 0.0_f64;
    let mut syy = 0.0_f64;
    let mut sxy = 0.0_f64;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mx;
        let dy = y - my;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let n = xs.len() as f64;
    if sxx / n <= VARIANCE_EPSILON || syy / n <= VARIANCE_EPSILON {
        return None;
    }
    Some((sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0))
}

pub fn item_statistics(input: &AnalysisInput) -> Vec<ItemStatistic> {
    let grid = Grid::build(input);
    (0..input.questions.len()).map(|q| grid.item(q)).collect()
}

/// Weighted mean fractional score over the questions the student answered.
pub fn student_total(input: &AnalysisInput, student_id: &str) -> Option<f64> {
    let grid = Grid::build(input);
    let s = *grid.student_pos.get(student_id)?;
    grid.weighted_total(s)
}

pub fn point_biserial(input: &AnalysisInput, question_idx: u32) -> Option<f64> {
    let grid = Grid::build(input);
    let q = *grid.question_pos.get(&question_idx)?;
    grid.item(q).point_biserial
}

pub fn cronbach_alpha(input: &AnalysisInput) -> Option<f64> {
    Grid::build(input).cronbach_alpha()
}

/// Per-student sum of fractional scores, for students with any response.
pub fn total_scores(input: &AnalysisInput) -> Vec<f64> {
    Grid::build(input).total_scores()
}

pub fn sem(total_scores: &[f64], alpha: Option<f64>) -> Option<f64> {
    let alpha = alpha?;
    let sd = population_variance(total_scores)?.sqrt();
    Some(sd * (1.0 - alpha).max(0.0).sqrt())
}

/// Earned over possible across every question, answered or not. Unlike the
/// item statistics, a missing response here counts against the student.
pub fn final_score_percent(input: &AnalysisInput, student_id: &str) -> Option<FinalScore> {
    let grid = Grid::build(input);
    let s = *grid.student_pos.get(student_id)?;
    Some(grid.final_score(s))
}

pub fn analyze(input: &AnalysisInput) -> AnalysisReport {
    let grid = Grid::build(input);
    let items: Vec<ItemStatistic> = (0..input.questions.len()).map(|q| grid.item(q)).collect();
    let totals = grid.total_scores();
    let alpha = grid.cronbach_alpha();
    let reliability = Reliability {
        k: grid.reliability_items().len(),
        respondent_count: totals.len(),
        alpha,
        sem: sem(&totals, alpha),
    };
    let students = input
        .students
        .iter()
        .enumerate()
        .map(|(s, st)| StudentResult {
            student_id: st.id.clone(),
            name: st.name.clone(),
            answered: grid.answered(s),
            total: grid.weighted_total(s),
            final_score: grid.final_score(s),
        })
        .collect();

    tracing::debug!(
        questions = input.questions.len(),
        students = input.students.len(),
        k = reliability.k,
        "item analysis computed"
    );

    AnalysisReport {
        items,
        reliability,
        students,
        skipped: grid.skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(weights: &[f64], rows: &[(&str, &[Option<f64>])]) -> AnalysisInput {
        let questions = weights
            .iter()
            .enumerate()
            .map(|(i, w)| Question {
                idx: (i + 1) as u32,
                label: format!("Q{}", i + 1),
                weight: *w,
            })
            .collect();
        let mut students = Vec::new();
        let mut matrix = ResponseMatrix::new();
        for (sid, cells) in rows {
            students.push(Student {
                id: sid.to_string(),
                name: sid.to_string(),
            });
            for (i, cell) in cells.iter().enumerate() {
                if let Some(v) = cell {
                    matrix.insert((sid.to_string(), (i + 1) as u32), *v);
                }
            }
        }
        AnalysisInput {
            students,
            questions,
            matrix,
        }
    }

    fn abc() -> AnalysisInput {
        input(
            &[10.0, 5.0],
            &[
                ("A", &[Some(10.0), Some(5.0)]),
                ("B", &[Some(5.0), Some(5.0)]),
                ("C", &[Some(0.0), Some(0.0)]),
            ],
        )
    }

    #[test]
    fn difficulty_boundaries() {
        assert_eq!(Difficulty::from_p_value(Some(0.75)), Difficulty::Easy);
        assert_eq!(Difficulty::from_p_value(Some(0.70)), Difficulty::Easy);
        assert_eq!(Difficulty::from_p_value(Some(0.5)), Difficulty::Medium);
        assert_eq!(Difficulty::from_p_value(Some(0.30)), Difficulty::Hard);
        assert_eq!(Difficulty::from_p_value(Some(0.2)), Difficulty::Hard);
        assert_eq!(Difficulty::from_p_value(None), Difficulty::Undefined);
    }

    #[test]
    fn three_student_scenario() {
        let items = item_statistics(&abc());
        assert!((items[0].p_value.unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(items[0].difficulty, Difficulty::Medium);
        assert!((items[1].p_value.unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(items[1].difficulty, Difficulty::Medium);
        assert_eq!(items[0].n, 3);
    }

    #[test]
    fn no_response_is_not_zero() {
        let data = input(
            &[4.0],
            &[("A", &[Some(4.0)]), ("B", &[None]), ("C", &[Some(0.0)])],
        );
        let items = item_statistics(&data);
        assert_eq!(items[0].n, 2);
        assert!((items[0].p_value.unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn student_total_is_weighted_mean_of_answered() {
        let data = input(&[10.0, 5.0], &[("A", &[Some(5.0), None])]);
        assert!((student_total(&data, "A").unwrap() - 0.5).abs() < 1e-12);
        let data = input(&[10.0, 5.0], &[("A", &[None, None])]);
        assert_eq!(student_total(&data, "A"), None);
        assert_eq!(student_total(&data, "ghost"), None);
    }

    #[test]
    fn final_percent_penalizes_non_response() {
        let data = input(&[10.0, 5.0], &[("A", &[Some(10.0), None])]);
        let fs = final_score_percent(&data, "A").unwrap();
        assert_eq!(fs.earned, 10.0);
        assert_eq!(fs.possible, 15.0);
        assert!((fs.percent.unwrap() - 66.666_666_666).abs() < 1e-6);
        // The per-item view only sees what was answered.
        assert!((student_total(&data, "A").unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn point_biserial_guards_small_and_flat_samples() {
        let one = input(&[1.0], &[("A", &[Some(1.0)])]);
        assert_eq!(point_biserial(&one, 1), None);

        let flat = input(
            &[1.0, 1.0],
            &[("A", &[Some(1.0), Some(0.0)]), ("B", &[Some(1.0), Some(1.0)])],
        );
        assert_eq!(point_biserial(&flat, 1), None);
        assert!(point_biserial(&flat, 2).is_some());
    }

    #[test]
    fn perfectly_consistent_items_have_alpha_one() {
        let data = input(
            &[1.0, 1.0],
            &[
                ("A", &[Some(1.0), Some(1.0)]),
                ("B", &[Some(0.0), Some(0.0)]),
                ("C", &[Some(1.0), Some(1.0)]),
            ],
        );
        let alpha = cronbach_alpha(&data).unwrap();
        assert!((alpha - 1.0).abs() < 1e-12);
        let totals = total_scores(&data);
        assert!(sem(&totals, Some(alpha)).unwrap() < 1e-6);
    }

    #[test]
    fn alpha_undefined_with_single_item_or_flat_totals() {
        let single = input(&[1.0], &[("A", &[Some(1.0)]), ("B", &[Some(0.0)])]);
        assert_eq!(cronbach_alpha(&single), None);
        let flat = input(
            &[1.0, 1.0],
            &[("A", &[Some(1.0), Some(0.0)]), ("B", &[Some(0.0), Some(1.0)])],
        );
        assert_eq!(cronbach_alpha(&flat), None);
        assert_eq!(sem(&total_scores(&flat), None), None);
    }

    #[test]
    fn sem_clamps_negative_reliability_gap() {
        assert_eq!(sem(&[1.0, 3.0], Some(1.5)), Some(0.0));
        let s = sem(&[1.0, 3.0], Some(0.75)).unwrap();
        assert!((s - 0.5).abs() < 1e-12);
        assert_eq!(sem(&[], Some(0.5)), None);
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = abc();
        let mut b = abc();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.matrix.insert(("C".to_string(), 1), 1.0);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
