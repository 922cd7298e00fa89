use std::collections::HashMap;
use std::fmt::Write;

use crate::models::{HistoryFilter, PromotionLogEntry, PromotionType, School};

#[derive(Debug, Clone, PartialEq)]
pub struct TypeSummary {
    pub promotion_type: PromotionType,
    pub count: usize,
    pub avg_grade: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionSummary {
    pub from_class: String,
    pub to_class: String,
    pub count: usize,
}

pub fn summarize_by_type(logs: &[PromotionLogEntry]) -> Vec<TypeSummary> {
    let mut map: HashMap<PromotionType, (usize, f64)> = HashMap::new();

    for log in logs {
        let entry = map.entry(log.promotion_type).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += log.average_grade;
    }

    let mut summaries: Vec<TypeSummary> = map
        .into_iter()
        .map(|(promotion_type, (count, total_grade))| TypeSummary {
            promotion_type,
            count,
            avg_grade: if count == 0 {
                0.0
            } else {
                total_grade / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.promotion_type.as_str().cmp(b.promotion_type.as_str()))
    });
    summaries
}

/// Class moves only; excluded rows stay in their class and are left out.
pub fn summarize_transitions(logs: &[PromotionLogEntry]) -> Vec<TransitionSummary> {
    let mut map: HashMap<(&str, &str), usize> = HashMap::new();
    for log in logs
        .iter()
        .filter(|log| log.promotion_type != PromotionType::Excluded)
    {
        *map.entry((log.from_class.as_str(), log.to_class.as_str()))
            .or_insert(0) += 1;
    }

    let mut transitions: Vec<TransitionSummary> = map
        .into_iter()
        .map(|((from_class, to_class), count)| TransitionSummary {
            from_class: from_class.to_string(),
            to_class: to_class.to_string(),
            count,
        })
        .collect();
    transitions.sort_by(|a, b| {
        a.from_class
            .cmp(&b.from_class)
            .then_with(|| a.to_class.cmp(&b.to_class))
    });
    transitions
}

fn type_label(promotion_type: PromotionType) -> &'static str {
    match promotion_type {
        PromotionType::Standard => "Standard",
        PromotionType::ManualOverride => "Manual override",
        PromotionType::Excluded => "Excluded",
    }
}

pub fn build_report(school: &School, filter: &HistoryFilter, logs: &[PromotionLogEntry]) -> String {
    let summaries = summarize_by_type(logs);
    let transitions = summarize_transitions(logs);

    let mut output = String::new();
    let year_label = filter.academic_year.as_deref().unwrap_or("all years");

    let _ = writeln!(output, "# Promotion History Report");
    let _ = writeln!(output, "Generated for {} ({})", school.name, year_label);
    if let Some(student_id) = filter.student_id.as_deref() {
        let _ = writeln!(output, "Student: {student_id}");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Outcomes");

    if summaries.is_empty() {
        let _ = writeln!(output, "No promotions recorded.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} students (avg grade {:.1})",
                type_label(summary.promotion_type),
                summary.count,
                summary.avg_grade
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Class Transitions");

    if transitions.is_empty() {
        let _ = writeln!(output, "No class changes recorded.");
    } else {
        for transition in &transitions {
            let _ = writeln!(
                output,
                "- {} -> {}: {}",
                transition.from_class, transition.to_class, transition.count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Entries");

    if logs.is_empty() {
        let _ = writeln!(output, "No promotions recorded.");
    } else {
        for log in logs.iter().take(10) {
            let _ = write!(
                output,
                "- {} ({}) {} -> {} by {} on {}",
                log.student_name,
                log.student_id,
                log.from_class,
                log.to_class,
                log.promoted_by,
                log.created_at.format("%Y-%m-%d")
            );
            match log.reason.as_deref() {
                Some(reason) => {
                    let _ = writeln!(output, ": {reason}");
                }
                None => {
                    let _ = writeln!(output);
                }
            }
        }
    }

    output
}

/// Writes one CSV row per log entry with camelCase headers.
pub fn write_csv<W: std::io::Write>(writer: W, logs: &[PromotionLogEntry]) -> anyhow::Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for log in logs {
        csv.serialize(log)?;
    }
    csv.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn log(student: &str, from: &str, to: &str, promotion_type: PromotionType, grade: f64) -> PromotionLogEntry {
        PromotionLogEntry {
            id: Uuid::new_v4(),
            school_id: Uuid::nil(),
            student_id: student.to_string(),
            student_name: format!("Student {student}"),
            from_class: from.to_string(),
            to_class: to.to_string(),
            from_grade: "Grade 1".to_string(),
            to_grade: "Grade 2".to_string(),
            from_year: "2025".to_string(),
            to_year: Some("2026".to_string()),
            promoted_by: "registrar".to_string(),
            promotion_type,
            reason: (promotion_type != PromotionType::Standard).then(|| "Reviewed by board".to_string()),
            average_grade: grade,
            outstanding_balance: 0.0,
            disciplinary_cases: 0,
            created_at: Utc::now(),
        }
    }

    fn school() -> School {
        School {
            id: Uuid::nil(),
            code: "demo".to_string(),
            name: "Demo Academy".to_string(),
        }
    }

    fn sample() -> Vec<PromotionLogEntry> {
        vec![
            log("stu-1", "Grade 1A", "Grade 2A", PromotionType::Standard, 70.0),
            log("stu-2", "Grade 1A", "Grade 2A", PromotionType::Standard, 80.0),
            log("stu-3", "Grade 1B", "Grade 2B", PromotionType::ManualOverride, 45.0),
            log("stu-4", "Grade 1B", "Grade 1B", PromotionType::Excluded, 30.0),
        ]
    }

    #[test]
    fn summaries_count_types_and_moves() {
        let logs = sample();
        let summaries = summarize_by_type(&logs);
        assert_eq!(summaries[0].promotion_type, PromotionType::Standard);
        assert_eq!(summaries[0].count, 2);
        assert!((summaries[0].avg_grade - 75.0).abs() < f64::EPSILON);

        let transitions = summarize_transitions(&logs);
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].from_class, "Grade 1A");
        assert_eq!(transitions[0].count, 2);
    }

    #[test]
    fn report_has_sections() {
        let report = build_report(&school(), &HistoryFilter::default(), &sample());
        assert!(report.starts_with("# Promotion History Report"));
        assert!(report.contains("Generated for Demo Academy (all years)"));
        assert!(report.contains("- Standard: 2 students (avg grade 75.0)"));
        assert!(report.contains("- Grade 1B -> Grade 2B: 1"));
        assert!(report.contains(": Reviewed by board"));
    }

    #[test]
    fn empty_report_says_so() {
        let report = build_report(&school(), &HistoryFilter::default(), &[]);
        assert!(report.contains("No promotions recorded."));
        assert!(report.contains("No class changes recorded."));
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let mut buffer = Vec::new();
        write_csv(&mut buffer, &sample()).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.contains("studentId"));
        assert!(header.contains("promotionType"));
        assert_eq!(lines.count(), 4);
        assert!(text.contains("manual_override"));
    }
}
