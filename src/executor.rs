use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::eligibility;
use crate::error::{PromotionError, PromotionResult};
use crate::models::{
    AcademicYear, BulkPromotionRequest, BulkPromotionResult, HistoryFilter, ProgressionMap,
    PromotionFailure, PromotionInput, PromotionLogEntry, PromotionOutcome, PromotionType, School,
    StudentEligibility, StudentRecord, ALUMNI,
};
use crate::store::{self, PromotionStore};

/// Splits a preview into the students to promote and the ones left behind.
///
/// Promoted: eligible minus `exclusions`, plus ineligible students named in
/// `overrides`. Every promoted student needs a progression rule for their
/// class; a missing one fails the whole assembly before anything is written.
pub fn assemble(
    eligible: &[StudentEligibility],
    ineligible: &[StudentEligibility],
    overrides: &BTreeMap<String, String>,
    exclusions: &BTreeMap<String, String>,
    map: &ProgressionMap,
) -> PromotionResult<(Vec<PromotionInput>, Vec<PromotionInput>)> {
    let mut students = Vec::new();
    let mut left_behind = Vec::new();
    let mut unmapped = Vec::new();

    let mut promote = |student: &StudentEligibility, reason: Option<&String>| {
        match map.target_for(&student.current_class) {
            Some(to_class) => students.push(PromotionInput {
                student_id: student.student_id.clone(),
                from_class: student.current_class.clone(),
                to_class: to_class.to_string(),
                manual_override: reason.is_some(),
                override_reason: reason.cloned(),
                outstanding_balance: student.fee_balance,
            }),
            None => unmapped.push(student.current_class.clone()),
        }
    };

    for student in eligible {
        if !exclusions.contains_key(&student.student_id) {
            promote(student, None);
        }
    }
    for student in ineligible {
        if let Some(note) = overrides.get(&student.student_id) {
            promote(student, Some(note));
        }
    }

    if !unmapped.is_empty() {
        unmapped.sort();
        unmapped.dedup();
        return Err(PromotionError::validation(format!(
            "no progression rule for {}",
            unmapped.join(", ")
        )));
    }

    let stay = |student: &StudentEligibility, reason: Option<String>| PromotionInput {
        student_id: student.student_id.clone(),
        from_class: student.current_class.clone(),
        to_class: student.current_class.clone(),
        manual_override: false,
        override_reason: reason,
        outstanding_balance: student.fee_balance,
    };
    for student in eligible {
        if let Some(note) = exclusions.get(&student.student_id) {
            left_behind.push(stay(student, Some(note.clone())));
        }
    }
    for student in ineligible {
        if !overrides.contains_key(&student.student_id) {
            left_behind.push(stay(student, student.reason.clone()));
        }
    }

    Ok((students, left_behind))
}

struct Context {
    school_id: Uuid,
    promoted_by: String,
    from_year: String,
    to_year: Option<String>,
    roster: HashMap<String, StudentRecord>,
    class_grades: HashMap<String, String>,
}

impl Context {
    fn grade_of(&self, class_name: &str) -> String {
        if class_name == ALUMNI {
            return ALUMNI.to_string();
        }
        self.class_grades.get(class_name).cloned().unwrap_or_default()
    }

    fn entry(
        &self,
        input: &PromotionInput,
        student: &StudentRecord,
        promotion_type: PromotionType,
    ) -> PromotionLogEntry {
        let from_class = student.current_class.clone();
        let to_class = match promotion_type {
            PromotionType::Excluded => from_class.clone(),
            _ => input.to_class.trim().to_string(),
        };

        PromotionLogEntry {
            id: Uuid::new_v4(),
            school_id: self.school_id,
            student_id: student.id.clone(),
            student_name: student.name.clone(),
            from_grade: self.grade_of(&from_class),
            to_grade: self.grade_of(&to_class),
            from_class,
            to_class,
            from_year: self.from_year.clone(),
            to_year: self.to_year.clone(),
            promoted_by: self.promoted_by.clone(),
            promotion_type,
            reason: input.override_reason.clone(),
            average_grade: student.average_grade,
            outstanding_balance: input.outstanding_balance,
            disciplinary_cases: student.disciplinary_cases,
            created_at: Utc::now(),
        }
    }
}

fn outcome(entry: &PromotionLogEntry) -> PromotionOutcome {
    PromotionOutcome {
        student_id: entry.student_id.clone(),
        student_name: entry.student_name.clone(),
        from_class: entry.from_class.clone(),
        to_class: entry.to_class.clone(),
    }
}

/// A `fromClass` sent by the caller must agree with the roster.
fn class_mismatch(input: &PromotionInput, student: &StudentRecord) -> Option<String> {
    let claimed = input.from_class.trim();
    (!claimed.is_empty() && claimed != student.current_class).then(|| {
        format!(
            "fromClass {claimed} does not match current class {}",
            student.current_class
        )
    })
}

fn failure(student_id: &str, error: impl ToString) -> PromotionFailure {
    PromotionFailure {
        student_id: student_id.to_string(),
        error: error.to_string(),
    }
}

async fn resolve_year(
    store: &dyn PromotionStore,
    school_id: Uuid,
    academic_year_id: Option<Uuid>,
) -> PromotionResult<AcademicYear> {
    match academic_year_id {
        Some(id) => store::year_by_id(store, school_id, id).await,
        None => store::current_year(store, school_id).await,
    }
}

/// Applies a batch of promotions student by student.
///
/// Each student's log row and class change land together; a failure for one
/// student is reported in `errors` and the rest of the batch carries on.
/// Students already recorded for the same academic year are reported in
/// `skipped`. When the request cites a snapshot, the roster is read for the
/// snapshot's term so logged averages match the preview.
pub async fn execute(
    store: &dyn PromotionStore,
    school: &School,
    request: &BulkPromotionRequest,
    concurrency: usize,
) -> PromotionResult<BulkPromotionResult> {
    let promoted_by = request
        .promoted_by
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| PromotionError::Unauthenticated("promotedBy is required".to_string()))?
        .to_string();

    let year = resolve_year(store, school.id, request.academic_year_id).await?;
    let mut term = request.term.clone().filter(|term| !term.trim().is_empty());
    if let Some(snapshot_id) = request.snapshot_id {
        let snapshot =
            eligibility::verify_snapshot(store, school.id, snapshot_id, concurrency).await?;
        if snapshot.academic_year_id != year.id {
            return Err(PromotionError::validation(
                "snapshot belongs to a different academic year",
            ));
        }
        if term.is_some() && term != snapshot.term {
            return Err(PromotionError::validation(
                "snapshot was taken for a different term",
            ));
        }
        term = snapshot.term;
    }

    let years = store.academic_years(school.id).await?;
    let to_year = store::following_year(&years, &year).map(|next| next.name.clone());

    let grades: HashMap<String, String> = store
        .grades(school.id)
        .await?
        .into_iter()
        .map(|grade| (grade.id, grade.name))
        .collect();
    let class_grades = store
        .classes(school.id)
        .await?
        .into_iter()
        .filter_map(|class| grades.get(&class.grade_id).map(|grade| (class.name, grade.clone())))
        .collect();
    let roster = store
        .roster(school.id, year.id, term.as_deref())
        .await?
        .into_iter()
        .map(|student| (student.id.clone(), student))
        .collect();

    let context = Context {
        school_id: school.id,
        promoted_by,
        from_year: year.name.clone(),
        to_year,
        roster,
        class_grades,
    };

    let filter = HistoryFilter {
        academic_year: Some(year.name.clone()),
        student_id: None,
    };
    let mut recorded: HashMap<String, PromotionLogEntry> = HashMap::new();
    for entry in store.promotion_logs(school.id, &filter).await? {
        // A promotion row outranks an exclusion row for the same student.
        let keep = match recorded.get(&entry.student_id) {
            Some(existing) => {
                existing.promotion_type == PromotionType::Excluded
                    && entry.promotion_type != PromotionType::Excluded
            }
            None => true,
        };
        if keep {
            recorded.insert(entry.student_id.clone(), entry);
        }
    }

    let mut result = BulkPromotionResult::default();

    for input in &request.students {
        if input.to_class.trim().is_empty() {
            result
                .errors
                .push(failure(&input.student_id, "toClass is required"));
            continue;
        }
        if let Some(entry) = recorded
            .get(&input.student_id)
            .filter(|entry| entry.promotion_type != PromotionType::Excluded)
        {
            result.skipped.push(outcome(entry));
            continue;
        }
        let Some(student) = context.roster.get(&input.student_id) else {
            result
                .errors
                .push(failure(&input.student_id, "student is not on the current roster"));
            continue;
        };
        if let Some(mismatch) = class_mismatch(input, student) {
            result.errors.push(failure(&input.student_id, mismatch));
            continue;
        }

        let promotion_type = if input.manual_override {
            PromotionType::ManualOverride
        } else {
            PromotionType::Standard
        };
        let entry = context.entry(input, student, promotion_type);

        match store.record_promotion(&entry).await {
            Ok(true) => result.promoted.push(outcome(&entry)),
            Ok(false) => result.skipped.push(outcome(&entry)),
            Err(e) => {
                warn!(student_id = %input.student_id, error = %e, "promotion failed");
                result.errors.push(failure(&input.student_id, e));
            }
        }
    }

    let selected: HashSet<&str> = request
        .students
        .iter()
        .map(|input| input.student_id.as_str())
        .collect();

    for input in &request.ineligible_students {
        if selected.contains(input.student_id.as_str()) {
            continue;
        }
        if let Some(entry) = recorded.get(&input.student_id) {
            result.skipped.push(outcome(entry));
            continue;
        }
        let Some(student) = context.roster.get(&input.student_id) else {
            result
                .errors
                .push(failure(&input.student_id, "student is not on the current roster"));
            continue;
        };
        if let Some(mismatch) = class_mismatch(input, student) {
            result.errors.push(failure(&input.student_id, mismatch));
            continue;
        }

        let entry = context.entry(input, student, PromotionType::Excluded);
        match store.append_log(&entry).await {
            Ok(()) => result.excluded.push(outcome(&entry)),
            Err(e) => {
                warn!(student_id = %input.student_id, error = %e, "exclusion log failed");
                result.errors.push(failure(&input.student_id, e));
            }
        }
    }

    info!(
        school = %school.code,
        year = %year.name,
        promoted = result.promoted.len(),
        excluded = result.excluded.len(),
        skipped = result.skipped.len(),
        errors = result.errors.len(),
        "bulk promotion finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{
        EligibilitySnapshot, FeeStatementRow, Grade, HistoryFilter, ProgressionRule,
        PromotionCriteria, SchoolClass,
    };
    use crate::wizard::PromotionSession;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    /// Delegates to a `MemoryStore` but refuses to record one student.
    struct FlakyStore {
        inner: MemoryStore,
        refuse: String,
    }

    #[async_trait]
    impl PromotionStore for FlakyStore {
        async fn school_by_code(&self, code: &str) -> PromotionResult<School> {
            self.inner.school_by_code(code).await
        }
        async fn academic_years(&self, school_id: Uuid) -> PromotionResult<Vec<AcademicYear>> {
            self.inner.academic_years(school_id).await
        }
        async fn grades(&self, school_id: Uuid) -> PromotionResult<Vec<Grade>> {
            self.inner.grades(school_id).await
        }
        async fn classes(&self, school_id: Uuid) -> PromotionResult<Vec<SchoolClass>> {
            self.inner.classes(school_id).await
        }
        async fn roster(
            &self,
            school_id: Uuid,
            academic_year_id: Uuid,
            term: Option<&str>,
        ) -> PromotionResult<Vec<StudentRecord>> {
            self.inner.roster(school_id, academic_year_id, term).await
        }
        async fn fee_statement(
            &self,
            school_id: Uuid,
            student_id: &str,
            academic_year_id: Uuid,
        ) -> PromotionResult<Vec<FeeStatementRow>> {
            self.inner
                .fee_statement(school_id, student_id, academic_year_id)
                .await
        }
        async fn list_criteria(&self, school_id: Uuid) -> PromotionResult<Vec<PromotionCriteria>> {
            self.inner.list_criteria(school_id).await
        }
        async fn get_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionCriteria> {
            self.inner.get_criteria(school_id, id).await
        }
        async fn insert_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()> {
            self.inner.insert_criteria(criteria).await
        }
        async fn update_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()> {
            self.inner.update_criteria(criteria).await
        }
        async fn delete_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()> {
            self.inner.delete_criteria(school_id, id).await
        }
        async fn activate_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()> {
            self.inner.activate_criteria(school_id, id).await
        }
        async fn progression(&self, school_id: Uuid) -> PromotionResult<ProgressionMap> {
            self.inner.progression(school_id).await
        }
        async fn replace_progression(
            &self,
            school_id: Uuid,
            rules: &[ProgressionRule],
            expected_version: Option<i64>,
        ) -> PromotionResult<ProgressionMap> {
            self.inner
                .replace_progression(school_id, rules, expected_version)
                .await
        }
        async fn insert_snapshot(&self, snapshot: &EligibilitySnapshot) -> PromotionResult<()> {
            self.inner.insert_snapshot(snapshot).await
        }
        async fn snapshot(&self, school_id: Uuid, id: Uuid) -> PromotionResult<EligibilitySnapshot> {
            self.inner.snapshot(school_id, id).await
        }
        async fn record_promotion(&self, entry: &PromotionLogEntry) -> PromotionResult<bool> {
            if entry.student_id == self.refuse {
                return Err(PromotionError::Storage("disk quota exceeded".to_string()));
            }
            self.inner.record_promotion(entry).await
        }
        async fn append_log(&self, entry: &PromotionLogEntry) -> PromotionResult<()> {
            self.inner.append_log(entry).await
        }
        async fn promotion_logs(
            &self,
            school_id: Uuid,
            filter: &HistoryFilter,
        ) -> PromotionResult<Vec<PromotionLogEntry>> {
            self.inner.promotion_logs(school_id, filter).await
        }
        async fn save_session(&self, session: &PromotionSession) -> PromotionResult<()> {
            self.inner.save_session(session).await
        }
        async fn session(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionSession> {
            self.inner.session(school_id, id).await
        }
    }

    struct Fixture {
        store: MemoryStore,
        school: School,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let school = store.add_school("demo", "Demo Academy");
        let start = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 11, 28).unwrap();
        let year = store.add_academic_year(school.id, "2025", start, end, true, &["Term 1"]);
        store.add_academic_year(
            school.id,
            "2026",
            NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            NaiveDate::from_ymd_opt(2026, 11, 27).unwrap(),
            false,
            &["Term 1"],
        );
        store.add_grade(school.id, "g1", "Grade 1");
        store.add_grade(school.id, "g2", "Grade 2");
        store.add_class(school.id, "c1a", "Grade 1A", "g1");
        store.add_class(school.id, "c2a", "Grade 2A", "g2");
        store.add_student(school.id, "s1", "Amani Otieno", "Grade 1A");
        store.add_student(school.id, "s2", "Brian Kamau", "Grade 1A");
        store.add_assessment("s1", year.id, "Term 1", 72.0);
        store.add_assessment("s2", year.id, "Term 1", 40.0);
        Fixture { store, school }
    }

    fn input(student_id: &str, to_class: &str) -> PromotionInput {
        PromotionInput {
            student_id: student_id.to_string(),
            from_class: "Grade 1A".to_string(),
            to_class: to_class.to_string(),
            manual_override: false,
            override_reason: None,
            outstanding_balance: 0.0,
        }
    }

    fn request(students: Vec<PromotionInput>) -> BulkPromotionRequest {
        BulkPromotionRequest {
            students,
            promoted_by: Some("admin1".to_string()),
            ..BulkPromotionRequest::default()
        }
    }

    fn standard_criteria(school_id: Uuid) -> PromotionCriteria {
        PromotionCriteria {
            id: Uuid::new_v4(),
            school_id,
            name: "Standard".to_string(),
            description: None,
            min_grade: 50.0,
            max_fee_balance: 16000.0,
            max_disciplinary_cases: 0,
            is_active: true,
            is_default: true,
            priority: 0,
            created_at: Utc::now(),
        }
    }

    fn eligibility(student_id: &str, class: &str, eligible: bool) -> StudentEligibility {
        StudentEligibility {
            student_id: student_id.to_string(),
            student_name: student_id.to_uppercase(),
            current_class: class.to_string(),
            average_grade: if eligible { 70.0 } else { 30.0 },
            fee_balance: 100.0,
            disciplinary_cases: 0,
            is_eligible: eligible,
            reason: (!eligible).then(|| "Average grade too low".to_string()),
        }
    }

    fn map(rules: &[(&str, &str)]) -> ProgressionMap {
        ProgressionMap {
            school_id: Uuid::nil(),
            version: 1,
            rules: rules
                .iter()
                .enumerate()
                .map(|(index, (from, to))| ProgressionRule {
                    from_class: from.to_string(),
                    to_class: to.to_string(),
                    order: index as i32 + 1,
                })
                .collect(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn promotes_student_and_logs_it() {
        let Fixture { store, school } = fixture();

        let result = execute(&store, &school, &request(vec![input("s1", "Grade 2A")]), 2)
            .await
            .unwrap();

        assert_eq!(result.promoted.len(), 1);
        assert_eq!(result.promoted[0].student_id, "s1");
        assert!(result.excluded.is_empty());
        assert!(result.errors.is_empty());

        let logs = store
            .promotion_logs(school.id, &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].to_class, "Grade 2A");
        assert_eq!(logs[0].from_grade, "Grade 1");
        assert_eq!(logs[0].to_grade, "Grade 2");
        assert_eq!(logs[0].from_year, "2025");
        assert_eq!(logs[0].to_year.as_deref(), Some("2026"));
        assert_eq!(logs[0].promoted_by, "admin1");
        assert_eq!(store.student_class("s1").as_deref(), Some("Grade 2A"));
    }

    #[tokio::test]
    async fn missing_promoter_is_unauthenticated() {
        let Fixture { store, school } = fixture();
        let mut req = request(vec![input("s1", "Grade 2A")]);
        req.promoted_by = Some("   ".to_string());

        let result = execute(&store, &school, &req, 2).await;
        assert!(matches!(result, Err(PromotionError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn bad_items_are_reported_without_stopping_the_batch() {
        let Fixture { store, school } = fixture();
        let req = request(vec![
            input("s1", ""),
            input("ghost", "Grade 2A"),
            input("s2", "Grade 2A"),
        ]);

        let result = execute(&store, &school, &req, 2).await.unwrap();

        assert_eq!(result.promoted.len(), 1);
        assert_eq!(result.promoted[0].student_id, "s2");
        let failed: Vec<&str> = result.errors.iter().map(|e| e.student_id.as_str()).collect();
        assert_eq!(failed, vec!["s1", "ghost"]);
    }

    #[tokio::test]
    async fn unselected_ineligible_students_are_logged_as_excluded() {
        let Fixture { store, school } = fixture();
        let mut req = request(vec![input("s1", "Grade 2A")]);
        req.ineligible_students = vec![input("s2", "Grade 1A"), input("s1", "Grade 1A")];

        let result = execute(&store, &school, &req, 2).await.unwrap();

        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.excluded[0].student_id, "s2");
        assert_eq!(result.excluded[0].to_class, "Grade 1A");
        assert_eq!(store.student_class("s2").as_deref(), Some("Grade 1A"));
    }

    #[tokio::test]
    async fn rerunning_a_batch_skips_students_already_promoted() {
        let Fixture { store, school } = fixture();
        let req = request(vec![input("s1", "Grade 2A")]);

        execute(&store, &school, &req, 2).await.unwrap();
        let second = execute(&store, &school, &req, 2).await.unwrap();

        assert!(second.promoted.is_empty());
        assert_eq!(second.skipped.len(), 1);
        let logs = store
            .promotion_logs(school.id, &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn log_set_does_not_depend_on_request_order() {
        let forward = fixture();
        let backward = fixture();
        let students = vec![input("s1", "Grade 2A"), input("s2", "Grade 2A")];
        let mut reversed = students.clone();
        reversed.reverse();

        execute(&forward.store, &forward.school, &request(students), 2)
            .await
            .unwrap();
        execute(&backward.store, &backward.school, &request(reversed), 2)
            .await
            .unwrap();

        let summarize = |logs: Vec<PromotionLogEntry>| {
            let mut rows: Vec<(String, String, String)> = logs
                .into_iter()
                .map(|entry| (entry.student_id, entry.from_class, entry.to_class))
                .collect();
            rows.sort();
            rows
        };
        let filter = HistoryFilter::default();
        assert_eq!(
            summarize(forward.store.promotion_logs(forward.school.id, &filter).await.unwrap()),
            summarize(backward.store.promotion_logs(backward.school.id, &filter).await.unwrap())
        );
    }

    #[tokio::test]
    async fn stale_snapshot_blocks_execution() {
        let Fixture { store, school } = fixture();
        let year = store::current_year(&store, school.id).await.unwrap();
        let criteria = standard_criteria(school.id);
        let preview = eligibility::preview(&store, school.id, year.id, None, &criteria, 2)
            .await
            .unwrap();
        store.add_assessment("s2", year.id, "Term 1", 100.0);

        let mut req = request(vec![input("s1", "Grade 2A")]);
        req.snapshot_id = Some(preview.snapshot_id);
        let result = execute(&store, &school, &req, 2).await;

        assert!(matches!(result, Err(PromotionError::StaleSnapshot(_))));
        assert_eq!(store.student_class("s1").as_deref(), Some("Grade 1A"));
    }

    #[tokio::test]
    async fn retrying_a_verified_batch_reports_students_as_skipped() {
        let Fixture { store, school } = fixture();
        let year = store::current_year(&store, school.id).await.unwrap();
        let criteria = standard_criteria(school.id);
        let preview = eligibility::preview(&store, school.id, year.id, None, &criteria, 2)
            .await
            .unwrap();

        let mut req = request(vec![input("s1", "Grade 2A"), input("s2", ALUMNI)]);
        req.snapshot_id = Some(preview.snapshot_id);

        let first = execute(&store, &school, &req, 2).await.unwrap();
        assert_eq!(first.promoted.len(), 2);

        let retry = execute(&store, &school, &req, 2).await.unwrap();
        assert!(retry.promoted.is_empty());
        assert!(retry.errors.is_empty());
        let mut skipped: Vec<(&str, &str)> = retry
            .skipped
            .iter()
            .map(|s| (s.student_id.as_str(), s.from_class.as_str()))
            .collect();
        skipped.sort();
        assert_eq!(skipped, vec![("s1", "Grade 1A"), ("s2", "Grade 1A")]);

        let logs = store
            .promotion_logs(school.id, &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn retry_still_goes_stale_when_another_student_changes() {
        let Fixture { store, school } = fixture();
        let year = store::current_year(&store, school.id).await.unwrap();
        let criteria = standard_criteria(school.id);
        let preview = eligibility::preview(&store, school.id, year.id, None, &criteria, 2)
            .await
            .unwrap();

        let mut req = request(vec![input("s1", "Grade 2A")]);
        req.snapshot_id = Some(preview.snapshot_id);
        execute(&store, &school, &req, 2).await.unwrap();

        store.add_assessment("s2", year.id, "Term 1", 95.0);
        let retry = execute(&store, &school, &req, 2).await;
        assert!(matches!(retry, Err(PromotionError::StaleSnapshot(_))));
    }

    #[tokio::test]
    async fn store_failure_for_one_student_leaves_the_rest_promoted() {
        let Fixture { store, school } = fixture();
        let flaky = FlakyStore {
            inner: store,
            refuse: "s1".to_string(),
        };
        let req = request(vec![input("s1", "Grade 2A"), input("s2", "Grade 2A")]);

        let result = execute(&flaky, &school, &req, 2).await.unwrap();

        let promoted: Vec<&str> = result.promoted.iter().map(|p| p.student_id.as_str()).collect();
        assert_eq!(promoted, vec!["s2"]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].student_id, "s1");
        assert!(result.errors[0].error.contains("disk quota exceeded"));
        assert_eq!(flaky.inner.student_class("s1").as_deref(), Some("Grade 1A"));
        assert_eq!(flaky.inner.student_class("s2").as_deref(), Some("Grade 2A"));
    }

    #[tokio::test]
    async fn from_class_comes_from_the_roster() {
        let Fixture { store, school } = fixture();
        let mut wrong = input("s1", "Grade 2A");
        wrong.from_class = "Grade 3C".to_string();
        let mut blank = input("s2", "Grade 2A");
        blank.from_class = String::new();

        let result = execute(&store, &school, &request(vec![wrong, blank]), 2)
            .await
            .unwrap();

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].student_id, "s1");
        assert!(result.errors[0].error.contains("Grade 3C"));
        assert_eq!(store.student_class("s1").as_deref(), Some("Grade 1A"));

        let logs = store
            .promotion_logs(school.id, &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].student_id, "s2");
        assert_eq!(logs[0].from_class, "Grade 1A");
    }

    #[tokio::test]
    async fn snapshot_term_drives_the_logged_average() {
        let Fixture { store, school } = fixture();
        let year = store::current_year(&store, school.id).await.unwrap();
        store.add_assessment("s1", year.id, "Term 2", 90.0);
        let criteria = standard_criteria(school.id);
        let preview =
            eligibility::preview(&store, school.id, year.id, Some("Term 1"), &criteria, 2)
                .await
                .unwrap();

        let mut req = request(vec![input("s1", "Grade 2A")]);
        req.snapshot_id = Some(preview.snapshot_id);
        execute(&store, &school, &req, 2).await.unwrap();

        let logs = store
            .promotion_logs(school.id, &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(logs[0].average_grade, 72.0);

        let mut mismatched = request(vec![input("s2", "Grade 2A")]);
        mismatched.snapshot_id = Some(preview.snapshot_id);
        mismatched.term = Some("Term 2".to_string());
        assert!(matches!(
            execute(&store, &school, &mismatched, 2).await,
            Err(PromotionError::Validation(_))
        ));
    }

    #[test]
    fn assemble_applies_overrides_and_exclusions() {
        let eligible = vec![
            eligibility("a", "Grade 1A", true),
            eligibility("b", "Grade 1A", true),
        ];
        let ineligible = vec![
            eligibility("c", "Grade 1A", false),
            eligibility("d", "Grade 1A", false),
        ];
        let overrides = BTreeMap::from([("c".to_string(), "Sat the make-up exam".to_string())]);
        let exclusions = BTreeMap::from([("b".to_string(), "Repeating by request".to_string())]);

        let (students, left_behind) = assemble(
            &eligible,
            &ineligible,
            &overrides,
            &exclusions,
            &map(&[("Grade 1A", "Grade 2A")]),
        )
        .unwrap();

        let promoted: Vec<(&str, bool)> = students
            .iter()
            .map(|s| (s.student_id.as_str(), s.manual_override))
            .collect();
        assert_eq!(promoted, vec![("a", false), ("c", true)]);
        assert!(students.iter().all(|s| s.to_class == "Grade 2A"));

        let stayed: Vec<&str> = left_behind.iter().map(|s| s.student_id.as_str()).collect();
        assert_eq!(stayed, vec!["b", "d"]);
        assert_eq!(
            left_behind[0].override_reason.as_deref(),
            Some("Repeating by request")
        );
    }

    #[test]
    fn assemble_refuses_students_without_a_rule() {
        let eligible = vec![eligibility("a", "Grade 4A", true)];
        let result = assemble(
            &eligible,
            &[],
            &BTreeMap::new(),
            &BTreeMap::new(),
            &map(&[("Grade 1A", "Grade 2A")]),
        );
        match result {
            Err(PromotionError::Validation(message)) => assert!(message.contains("Grade 4A")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
