use uuid::Uuid;

use crate::error::PromotionResult;
use crate::models::{HistoryFilter, PromotionLogEntry};
use crate::store::PromotionStore;

fn blank_to_none(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Promotion log rows for a school, newest first. Blank filter values are ignored.
pub async fn list(
    store: &dyn PromotionStore,
    school_id: Uuid,
    filter: &HistoryFilter,
) -> PromotionResult<Vec<PromotionLogEntry>> {
    let filter = HistoryFilter {
        academic_year: blank_to_none(&filter.academic_year),
        student_id: blank_to_none(&filter.student_id),
    };
    let mut logs = store.promotion_logs(school_id, &filter).await?;
    logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::PromotionType;

    fn entry(school_id: Uuid, student_id: &str, from_year: &str, minutes_ago: i64) -> PromotionLogEntry {
        PromotionLogEntry {
            id: Uuid::new_v4(),
            school_id,
            student_id: student_id.to_string(),
            student_name: format!("Student {student_id}"),
            from_class: "Grade 1A".to_string(),
            to_class: "Grade 2A".to_string(),
            from_grade: "Grade 1".to_string(),
            to_grade: "Grade 2".to_string(),
            from_year: from_year.to_string(),
            to_year: None,
            promoted_by: "registrar".to_string(),
            promotion_type: PromotionType::Standard,
            reason: None,
            average_grade: 70.0,
            outstanding_balance: 0.0,
            disciplinary_cases: 0,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn lists_newest_first_and_filters() {
        let store = MemoryStore::new();
        let school = store.add_school("demo", "Demo Academy");
        let other = store.add_school("other", "Other School");
        store.append_log(&entry(school.id, "stu-1", "2024", 30)).await.unwrap();
        store.append_log(&entry(school.id, "stu-2", "2025", 10)).await.unwrap();
        store.append_log(&entry(school.id, "stu-1", "2025", 5)).await.unwrap();
        store.append_log(&entry(other.id, "stu-1", "2025", 1)).await.unwrap();

        let all = list(&store, school.id, &HistoryFilter::default()).await.unwrap();
        let order: Vec<(&str, &str)> = all
            .iter()
            .map(|log| (log.student_id.as_str(), log.from_year.as_str()))
            .collect();
        assert_eq!(order, vec![("stu-1", "2025"), ("stu-2", "2025"), ("stu-1", "2024")]);

        let filter = HistoryFilter {
            academic_year: Some("2025".to_string()),
            student_id: Some(" ".to_string()),
        };
        assert_eq!(list(&store, school.id, &filter).await.unwrap().len(), 2);

        let filter = HistoryFilter {
            academic_year: None,
            student_id: Some("stu-1".to_string()),
        };
        assert_eq!(list(&store, school.id, &filter).await.unwrap().len(), 2);
    }
}
