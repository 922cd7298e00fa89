use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PromotionError, PromotionResult};
use crate::models::{
    EligibilityReport, EligibilitySnapshot, FeeStatementRow, HistoryFilter, PromotionCriteria,
    PromotionPreview, PromotionType, StudentEligibility, StudentRecord,
};
use crate::store::{self, PromotionStore};

/// A roster row paired with the student's outstanding fee balance.
#[derive(Debug, Clone)]
pub struct StudentFacts {
    pub student: StudentRecord,
    pub fee_balance: f64,
}

/// Outstanding balance is the running balance on the last statement row.
pub fn statement_balance(rows: &[FeeStatementRow]) -> f64 {
    rows.last().map(|row| row.balance).unwrap_or(0.0)
}

/// Applies the three thresholds in order; the first failing one becomes the
/// reason.
pub fn classify(facts: &StudentFacts, criteria: &PromotionCriteria) -> StudentEligibility {
    let student = &facts.student;
    let reason = if student.average_grade < criteria.min_grade {
        Some(format!(
            "Average grade {:.1} is below the minimum grade of {:.1}",
            student.average_grade, criteria.min_grade
        ))
    } else if facts.fee_balance > criteria.max_fee_balance {
        Some(format!(
            "Fee balance {:.2} exceeds the maximum fee balance of {:.2}",
            facts.fee_balance, criteria.max_fee_balance
        ))
    } else if student.disciplinary_cases > criteria.max_disciplinary_cases {
        Some(format!(
            "{} disciplinary cases exceed the maximum of {}",
            student.disciplinary_cases, criteria.max_disciplinary_cases
        ))
    } else {
        None
    };

    StudentEligibility {
        student_id: student.id.clone(),
        student_name: student.name.clone(),
        current_class: student.current_class.clone(),
        average_grade: student.average_grade,
        fee_balance: facts.fee_balance,
        disciplinary_cases: student.disciplinary_cases,
        is_eligible: reason.is_none(),
        reason,
    }
}

pub fn evaluate(facts: &[StudentFacts], criteria: &PromotionCriteria) -> EligibilityReport {
    let mut report = EligibilityReport::default();
    for student in facts {
        let outcome = classify(student, criteria);
        if outcome.is_eligible {
            report.eligible.push(outcome);
        } else {
            report.ineligible.push(outcome);
        }
    }
    report
}

/// Loads the roster and issues one fee statement lookup per student, at most
/// `concurrency` at a time. Results are ordered by student name then id.
pub async fn gather_facts(
    store: &dyn PromotionStore,
    school_id: Uuid,
    academic_year_id: Uuid,
    term: Option<&str>,
    concurrency: usize,
) -> PromotionResult<Vec<StudentFacts>> {
    let roster = store.roster(school_id, academic_year_id, term).await?;
    debug!(school_id = %school_id, students = roster.len(), "loading fee balances");

    let mut facts: Vec<StudentFacts> = stream::iter(roster)
        .map(|student| async move {
            let rows = store
                .fee_statement(school_id, &student.id, academic_year_id)
                .await?;
            Ok::<_, PromotionError>(StudentFacts {
                fee_balance: statement_balance(&rows),
                student,
            })
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    facts.sort_by(|a, b| {
        a.student
            .name
            .cmp(&b.student.name)
            .then_with(|| a.student.id.cmp(&b.student.id))
    });
    Ok(facts)
}

/// Read-only evaluation of a school's roster for one academic year.
pub async fn evaluate_roster(
    store: &dyn PromotionStore,
    school_id: Uuid,
    academic_year_id: Uuid,
    term: Option<&str>,
    criteria: &PromotionCriteria,
    concurrency: usize,
) -> PromotionResult<EligibilityReport> {
    let facts = gather_facts(store, school_id, academic_year_id, term, concurrency).await?;
    Ok(evaluate(&facts, criteria))
}

fn fact_line(facts: &StudentFacts) -> String {
    let student = &facts.student;
    format!(
        "{}|{}|{:.4}|{:.2}|{}",
        student.id,
        student.current_class,
        student.average_grade,
        facts.fee_balance,
        student.disciplinary_cases
    )
}

fn digest<'a>(lines: impl IntoIterator<Item = &'a String>) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// SHA-256 over the decision inputs of every student, independent of order.
pub fn fingerprint(facts: &[StudentFacts]) -> String {
    let mut lines: Vec<String> = facts.iter().map(fact_line).collect();
    lines.sort();
    digest(&lines)
}

pub fn student_digests(facts: &[StudentFacts]) -> BTreeMap<String, String> {
    facts
        .iter()
        .map(|facts| (facts.student.id.clone(), digest([&fact_line(facts)])))
        .collect()
}

/// Evaluates the roster and records a snapshot that execution can later be
/// checked against.
pub async fn preview(
    store: &dyn PromotionStore,
    school_id: Uuid,
    academic_year_id: Uuid,
    term: Option<&str>,
    criteria: &PromotionCriteria,
    concurrency: usize,
) -> PromotionResult<PromotionPreview> {
    let facts = gather_facts(store, school_id, academic_year_id, term, concurrency).await?;
    let report = evaluate(&facts, criteria);

    let snapshot = EligibilitySnapshot {
        id: Uuid::new_v4(),
        school_id,
        academic_year_id,
        term: term.map(str::to_string),
        fingerprint: fingerprint(&facts),
        students: student_digests(&facts),
        created_at: Utc::now(),
    };
    store.insert_snapshot(&snapshot).await?;

    info!(
        school_id = %school_id,
        snapshot_id = %snapshot.id,
        eligible = report.eligible.len(),
        ineligible = report.ineligible.len(),
        "eligibility preview computed"
    );

    Ok(PromotionPreview {
        snapshot_id: snapshot.id,
        academic_year_id,
        criteria_id: criteria.id,
        eligible_students: report.eligible,
        ineligible_students: report.ineligible,
    })
}

/// Fails with `StaleSnapshot` when any student's facts changed since the
/// snapshot was taken.
///
/// Students promoted out of the snapshot's year after the preview are not
/// compared, since the promotion itself moves their class. Retrying a batch
/// against the same snapshot therefore still verifies.
pub async fn verify_snapshot(
    store: &dyn PromotionStore,
    school_id: Uuid,
    snapshot_id: Uuid,
    concurrency: usize,
) -> PromotionResult<EligibilitySnapshot> {
    let snapshot = store.snapshot(school_id, snapshot_id).await?;
    let facts = gather_facts(
        store,
        school_id,
        snapshot.academic_year_id,
        snapshot.term.as_deref(),
        concurrency,
    )
    .await?;

    if fingerprint(&facts) == snapshot.fingerprint {
        return Ok(snapshot);
    }

    let year = store::year_by_id(store, school_id, snapshot.academic_year_id).await?;
    let filter = HistoryFilter {
        academic_year: Some(year.name),
        student_id: None,
    };
    let promoted: HashSet<String> = store
        .promotion_logs(school_id, &filter)
        .await?
        .into_iter()
        .filter(|entry| entry.promotion_type != PromotionType::Excluded)
        .map(|entry| entry.student_id)
        .collect();

    let current = student_digests(&facts);
    let changed = snapshot
        .students
        .iter()
        .filter(|(id, _)| !promoted.contains(*id))
        .any(|(id, digest)| current.get(id) != Some(digest));
    let added = current
        .keys()
        .any(|id| !snapshot.students.contains_key(id));

    if snapshot.students.is_empty() || changed || added {
        debug!(snapshot_id = %snapshot_id, promoted = promoted.len(), "snapshot no longer matches");
        return Err(PromotionError::StaleSnapshot(format!(
            "student records changed after preview {snapshot_id}; run the preview again"
        )));
    }
    Ok(snapshot)
}
