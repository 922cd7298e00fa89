use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{PromotionError, PromotionResult};
use crate::models::{
    AcademicYear, EligibilitySnapshot, FeeStatementRow, Grade, HistoryFilter, ProgressionMap,
    ProgressionRule, PromotionCriteria, PromotionLogEntry, School, SchoolClass, StudentRecord,
};
use crate::wizard::PromotionSession;

/// Persistence seam for the promotion workflow.
///
/// `PgStore` is the production implementation; `MemoryStore` backs ephemeral
/// servers and tests. Every method is scoped by an explicit school id.
#[async_trait]
pub trait PromotionStore: Send + Sync {
    async fn school_by_code(&self, code: &str) -> PromotionResult<School>;
    async fn academic_years(&self, school_id: Uuid) -> PromotionResult<Vec<AcademicYear>>;
    async fn grades(&self, school_id: Uuid) -> PromotionResult<Vec<Grade>>;
    async fn classes(&self, school_id: Uuid) -> PromotionResult<Vec<SchoolClass>>;

    /// Current roster (alumni excluded) with averages for the year, or the
    /// given term of it.
    async fn roster(
        &self,
        school_id: Uuid,
        academic_year_id: Uuid,
        term: Option<&str>,
    ) -> PromotionResult<Vec<StudentRecord>>;

    async fn fee_statement(
        &self,
        school_id: Uuid,
        student_id: &str,
        academic_year_id: Uuid,
    ) -> PromotionResult<Vec<FeeStatementRow>>;

    async fn list_criteria(&self, school_id: Uuid) -> PromotionResult<Vec<PromotionCriteria>>;
    async fn get_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionCriteria>;
    async fn insert_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()>;
    async fn update_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()>;
    async fn delete_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()>;
    /// Marks `id` active and every other record of the school inactive.
    async fn activate_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()>;

    async fn progression(&self, school_id: Uuid) -> PromotionResult<ProgressionMap>;
    /// Replaces the whole rule set. Fails with `Conflict` when
    /// `expected_version` is given and the stored version differs.
    async fn replace_progression(
        &self,
        school_id: Uuid,
        rules: &[ProgressionRule],
        expected_version: Option<i64>,
    ) -> PromotionResult<ProgressionMap>;

    async fn insert_snapshot(&self, snapshot: &EligibilitySnapshot) -> PromotionResult<()>;
    async fn snapshot(&self, school_id: Uuid, id: Uuid) -> PromotionResult<EligibilitySnapshot>;

    /// Appends a promotion log row and moves the student to `entry.to_class`
    /// as one unit. Returns `false` without changing anything when the
    /// student already has a promotion recorded for `entry.from_year`.
    async fn record_promotion(&self, entry: &PromotionLogEntry) -> PromotionResult<bool>;
    /// Appends a log row without touching the student's class.
    async fn append_log(&self, entry: &PromotionLogEntry) -> PromotionResult<()>;
    /// Newest first.
    async fn promotion_logs(
        &self,
        school_id: Uuid,
        filter: &HistoryFilter,
    ) -> PromotionResult<Vec<PromotionLogEntry>>;

    async fn save_session(&self, session: &PromotionSession) -> PromotionResult<()>;
    async fn session(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionSession>;
}

/// The year flagged current, falling back to the most recent by start date.
pub async fn current_year(
    store: &dyn PromotionStore,
    school_id: Uuid,
) -> PromotionResult<AcademicYear> {
    let years = store.academic_years(school_id).await?;
    years
        .iter()
        .find(|year| year.is_current)
        .or_else(|| years.iter().max_by_key(|year| year.start_date))
        .cloned()
        .ok_or_else(|| PromotionError::not_found("academic year"))
}

pub async fn year_by_id(
    store: &dyn PromotionStore,
    school_id: Uuid,
    academic_year_id: Uuid,
) -> PromotionResult<AcademicYear> {
    store
        .academic_years(school_id)
        .await?
        .into_iter()
        .find(|year| year.id == academic_year_id)
        .ok_or_else(|| PromotionError::not_found(format!("academic year {academic_year_id}")))
}

/// Resolves `year` as an academic year id or name; empty means the current year.
pub async fn resolve_year(
    store: &dyn PromotionStore,
    school_id: Uuid,
    year: Option<&str>,
) -> PromotionResult<AcademicYear> {
    let Some(year) = year.map(str::trim).filter(|year| !year.is_empty()) else {
        return current_year(store, school_id).await;
    };
    if let Ok(id) = Uuid::parse_str(year) {
        return year_by_id(store, school_id, id).await;
    }
    store
        .academic_years(school_id)
        .await?
        .into_iter()
        .find(|candidate| candidate.name == year)
        .ok_or_else(|| PromotionError::not_found(format!("academic year {year}")))
}

/// The academic year that starts after `year`, if one has been set up.
pub fn following_year<'a>(years: &'a [AcademicYear], year: &AcademicYear) -> Option<&'a AcademicYear> {
    years
        .iter()
        .filter(|candidate| candidate.start_date > year.start_date)
        .min_by_key(|candidate| candidate.start_date)
}
