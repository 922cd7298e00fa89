use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{PromotionError, PromotionResult};
use crate::models::PromotionCriteria;
use crate::store::PromotionStore;

/// Criteria fields as submitted by a form. Thresholds arrive as JSON numbers
/// or numeric strings; anything else is rejected during validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriteriaDraft {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub min_grade: Option<Value>,
    #[serde(default)]
    pub max_fee_balance: Option<Value>,
    #[serde(default)]
    pub max_disciplinary_cases: Option<Value>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub is_default: Option<bool>,
    #[serde(default)]
    pub priority: Option<Value>,
}

pub async fn list(
    store: &dyn PromotionStore,
    school_id: Uuid,
) -> PromotionResult<Vec<PromotionCriteria>> {
    let mut records = store.list_criteria(school_id).await?;
    records.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    Ok(records)
}

pub async fn create(
    store: &dyn PromotionStore,
    school_id: Uuid,
    draft: &CriteriaDraft,
) -> PromotionResult<PromotionCriteria> {
    let name = required_name(draft.name.as_deref())?;
    let min_grade = require("minGrade", number("minGrade", draft.min_grade.as_ref())?)?;
    let max_fee_balance = require(
        "maxFeeBalance",
        number("maxFeeBalance", draft.max_fee_balance.as_ref())?,
    )?;
    let max_cases = require(
        "maxDisciplinaryCases",
        number("maxDisciplinaryCases", draft.max_disciplinary_cases.as_ref())?,
    )?;

    let mut record = PromotionCriteria {
        id: Uuid::new_v4(),
        school_id,
        name,
        description: clean_description(draft.description.as_deref()),
        min_grade: 0.0,
        max_fee_balance: 0.0,
        max_disciplinary_cases: 0,
        is_active: false,
        is_default: draft.is_default.unwrap_or(false),
        priority: 0,
        created_at: Utc::now(),
    };
    apply_thresholds(&mut record, min_grade, max_fee_balance, max_cases)?;
    if let Some(priority) = number("priority", draft.priority.as_ref())? {
        record.priority = whole_number("priority", priority)?;
    }

    store.insert_criteria(&record).await?;
    if draft.is_active.unwrap_or(false) {
        store.activate_criteria(school_id, record.id).await?;
        record.is_active = true;
    }

    info!(school_id = %school_id, criteria_id = %record.id, name = %record.name, "promotion criteria created");
    Ok(record)
}

pub async fn update(
    store: &dyn PromotionStore,
    school_id: Uuid,
    id: Uuid,
    draft: &CriteriaDraft,
) -> PromotionResult<PromotionCriteria> {
    let mut record = store.get_criteria(school_id, id).await?;

    if let Some(name) = draft.name.as_deref() {
        record.name = required_name(Some(name))?;
    }
    if draft.description.is_some() {
        record.description = clean_description(draft.description.as_deref());
    }

    let min_grade = number("minGrade", draft.min_grade.as_ref())?.unwrap_or(record.min_grade);
    let max_fee_balance = number("maxFeeBalance", draft.max_fee_balance.as_ref())?
        .unwrap_or(record.max_fee_balance);
    let max_cases = number("maxDisciplinaryCases", draft.max_disciplinary_cases.as_ref())?
        .unwrap_or(f64::from(record.max_disciplinary_cases));
    apply_thresholds(&mut record, min_grade, max_fee_balance, max_cases)?;

    if let Some(priority) = number("priority", draft.priority.as_ref())? {
        record.priority = whole_number("priority", priority)?;
    }
    if let Some(is_default) = draft.is_default {
        record.is_default = is_default;
    }
    let activate = match draft.is_active {
        Some(true) => true,
        Some(false) => {
            record.is_active = false;
            false
        }
        None => false,
    };

    store.update_criteria(&record).await?;
    if activate {
        store.activate_criteria(school_id, id).await?;
        record.is_active = true;
    }

    info!(school_id = %school_id, criteria_id = %id, "promotion criteria updated");
    Ok(record)
}

/// Log rows copy thresholds, so deleting never orphans history.
pub async fn delete(store: &dyn PromotionStore, school_id: Uuid, id: Uuid) -> PromotionResult<()> {
    store.delete_criteria(school_id, id).await?;
    info!(school_id = %school_id, criteria_id = %id, "promotion criteria deleted");
    Ok(())
}

pub async fn activate(
    store: &dyn PromotionStore,
    school_id: Uuid,
    id: Uuid,
) -> PromotionResult<PromotionCriteria> {
    store.activate_criteria(school_id, id).await?;
    store.get_criteria(school_id, id).await
}

/// The criteria a promotion run uses when none is named: the active record,
/// then the default one, then the highest priority.
pub async fn active(store: &dyn PromotionStore, school_id: Uuid) -> PromotionResult<PromotionCriteria> {
    let records = list(store, school_id).await?;
    records
        .iter()
        .find(|record| record.is_active)
        .or_else(|| records.iter().find(|record| record.is_default))
        .or_else(|| records.first())
        .cloned()
        .ok_or_else(|| PromotionError::not_found("promotion criteria"))
}

fn required_name(name: Option<&str>) -> PromotionResult<String> {
    match name.map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(PromotionError::validation("name is required")),
    }
}

fn clean_description(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn require(field: &str, value: Option<f64>) -> PromotionResult<f64> {
    value.ok_or_else(|| PromotionError::validation(format!("{field} is required")))
}

fn number(field: &str, value: Option<&Value>) -> PromotionResult<Option<f64>> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) if text.trim().is_empty() => return Ok(None),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(PromotionError::validation(format!("{field} must be a number"))),
    }
}

fn whole_number(field: &str, value: f64) -> PromotionResult<i32> {
    if value.fract() != 0.0 || value < f64::from(i32::MIN) || value > f64::from(i32::MAX) {
        return Err(PromotionError::validation(format!(
            "{field} must be a whole number"
        )));
    }
    Ok(value as i32)
}

fn apply_thresholds(
    record: &mut PromotionCriteria,
    min_grade: f64,
    max_fee_balance: f64,
    max_cases: f64,
) -> PromotionResult<()> {
    if !(0.0..=100.0).contains(&min_grade) {
        return Err(PromotionError::validation(
            "minGrade must be between 0 and 100",
        ));
    }
    if max_fee_balance < 0.0 {
        return Err(PromotionError::validation(
            "maxFeeBalance must not be negative",
        ));
    }
    if max_cases < 0.0 {
        return Err(PromotionError::validation(
            "maxDisciplinaryCases must not be negative",
        ));
    }
    record.min_grade = min_grade;
    record.max_fee_balance = max_fee_balance;
    record.max_disciplinary_cases = whole_number("maxDisciplinaryCases", max_cases)?;
    Ok(())
}
