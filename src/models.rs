use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal destination for students leaving the final grade.
pub const ALUMNI: &str = "ALUMNI";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct School {
    pub id: Uuid,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_current: bool,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolClass {
    pub id: String,
    pub name: String,
    pub grade_id: String,
}

/// A roster row with the academic facts promotion decisions are made on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    pub name: String,
    pub current_class: String,
    pub average_grade: f64,
    pub disciplinary_cases: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeStatementRow {
    pub date: NaiveDate,
    pub description: String,
    pub debit: f64,
    pub credit: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionCriteria {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub min_grade: f64,
    pub max_fee_balance: f64,
    pub max_disciplinary_cases: i32,
    pub is_active: bool,
    pub is_default: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionRule {
    pub from_class: String,
    pub to_class: String,
    pub order: i32,
}

/// The saved rule set for one school. `version` is 0 until the first save.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionMap {
    pub school_id: Uuid,
    pub version: i64,
    pub rules: Vec<ProgressionRule>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressionMap {
    pub fn empty(school_id: Uuid) -> Self {
        Self {
            school_id,
            version: 0,
            rules: Vec::new(),
            updated_at: None,
        }
    }

    pub fn target_for(&self, from_class: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.from_class == from_class)
            .map(|rule| rule.to_class.as_str())
            .filter(|to_class| !to_class.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentEligibility {
    pub student_id: String,
    pub student_name: String,
    pub current_class: String,
    pub average_grade: f64,
    pub fee_balance: f64,
    pub disciplinary_cases: i32,
    pub is_eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityReport {
    pub eligible: Vec<StudentEligibility>,
    pub ineligible: Vec<StudentEligibility>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilitySnapshot {
    pub id: Uuid,
    pub school_id: Uuid,
    pub academic_year_id: Uuid,
    pub term: Option<String>,
    pub fingerprint: String,
    /// Digest of each student's decision inputs, keyed by student id.
    #[serde(default)]
    pub students: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionPreview {
    pub snapshot_id: Uuid,
    pub academic_year_id: Uuid,
    pub criteria_id: Uuid,
    pub eligible_students: Vec<StudentEligibility>,
    pub ineligible_students: Vec<StudentEligibility>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionInput {
    pub student_id: String,
    #[serde(default)]
    pub from_class: String,
    #[serde(default)]
    pub to_class: String,
    #[serde(default)]
    pub manual_override: bool,
    #[serde(default)]
    pub override_reason: Option<String>,
    #[serde(default)]
    pub outstanding_balance: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPromotionRequest {
    pub students: Vec<PromotionInput>,
    #[serde(default)]
    pub ineligible_students: Vec<PromotionInput>,
    #[serde(default)]
    pub promoted_by: Option<String>,
    #[serde(default)]
    pub academic_year_id: Option<Uuid>,
    #[serde(default)]
    pub snapshot_id: Option<Uuid>,
    /// Term the averages were taken over; a cited snapshot's term wins.
    #[serde(default)]
    pub term: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionType {
    Standard,
    ManualOverride,
    Excluded,
}

impl PromotionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionType::Standard => "standard",
            PromotionType::ManualOverride => "manual_override",
            PromotionType::Excluded => "excluded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(PromotionType::Standard),
            "manual_override" => Some(PromotionType::ManualOverride),
            "excluded" => Some(PromotionType::Excluded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionLogEntry {
    pub id: Uuid,
    pub school_id: Uuid,
    pub student_id: String,
    pub student_name: String,
    pub from_class: String,
    pub to_class: String,
    pub from_grade: String,
    pub to_grade: String,
    pub from_year: String,
    pub to_year: Option<String>,
    pub promoted_by: String,
    pub promotion_type: PromotionType,
    pub reason: Option<String>,
    pub average_grade: f64,
    pub outstanding_balance: f64,
    pub disciplinary_cases: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionOutcome {
    pub student_id: String,
    pub student_name: String,
    pub from_class: String,
    pub to_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionFailure {
    pub student_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPromotionResult {
    pub promoted: Vec<PromotionOutcome>,
    pub excluded: Vec<PromotionOutcome>,
    pub skipped: Vec<PromotionOutcome>,
    pub errors: Vec<PromotionFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(default)]
    pub academic_year: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
}

impl HistoryFilter {
    pub fn matches(&self, entry: &PromotionLogEntry) -> bool {
        let year_ok = self
            .academic_year
            .as_deref()
            .map_or(true, |year| entry.from_year == year);
        let student_ok = self
            .student_id
            .as_deref()
            .map_or(true, |student_id| entry.student_id == student_id);
        year_ok && student_ok
    }
}
