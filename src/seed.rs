use anyhow::Context;
use chrono::NaiveDate;

pub struct DemoYear {
    pub name: &'static str,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_current: bool,
    pub terms: Vec<&'static str>,
}

pub struct DemoFee {
    pub date: NaiveDate,
    pub description: &'static str,
    pub debit: f64,
    pub credit: f64,
}

pub struct DemoStudent {
    pub id: &'static str,
    pub name: &'static str,
    pub class_name: &'static str,
    pub year: &'static str,
    pub scores: Vec<(&'static str, f64)>,
    pub disciplinary_cases: u32,
    pub fees: Vec<DemoFee>,
}

pub struct DemoCriteria {
    pub name: &'static str,
    pub description: &'static str,
    pub min_grade: f64,
    pub max_fee_balance: f64,
    pub max_disciplinary_cases: i32,
}

pub struct DemoSchool {
    pub code: &'static str,
    pub name: &'static str,
    pub years: Vec<DemoYear>,
    pub grades: Vec<(&'static str, &'static str)>,
    /// (id, name, grade id)
    pub classes: Vec<(&'static str, &'static str, &'static str)>,
    pub students: Vec<DemoStudent>,
    pub criteria: DemoCriteria,
}

fn date(year: i32, month: u32, day: u32) -> anyhow::Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day).context("invalid date")
}

fn tuition(invoiced: f64, paid: f64) -> anyhow::Result<Vec<DemoFee>> {
    let mut fees = vec![DemoFee {
        date: date(2025, 1, 6)?,
        description: "Tuition 2025",
        debit: invoiced,
        credit: 0.0,
    }];
    if paid > 0.0 {
        fees.push(DemoFee {
            date: date(2025, 2, 14)?,
            description: "M-Pesa payment",
            debit: 0.0,
            credit: paid,
        });
    }
    Ok(fees)
}

/// One school covering every eligibility outcome: two students pass, one
/// fails each threshold, and grade 3 has no B stream so one progression
/// target has to be synthesized.
pub fn demo_school() -> anyhow::Result<DemoSchool> {
    Ok(DemoSchool {
        code: "demo",
        name: "Demo Academy",
        years: vec![
            DemoYear {
                name: "2025",
                start_date: date(2025, 1, 6)?,
                end_date: date(2025, 11, 28)?,
                is_current: true,
                terms: vec!["Term 1", "Term 2", "Term 3"],
            },
            DemoYear {
                name: "2026",
                start_date: date(2026, 1, 5)?,
                end_date: date(2026, 11, 27)?,
                is_current: false,
                terms: vec!["Term 1", "Term 2", "Term 3"],
            },
        ],
        grades: vec![
            ("grade-1", "Grade 1"),
            ("grade-2", "Grade 2"),
            ("grade-3", "Grade 3"),
        ],
        classes: vec![
            ("class-1a", "Grade 1A", "grade-1"),
            ("class-1b", "Grade 1B", "grade-1"),
            ("class-2a", "Grade 2A", "grade-2"),
            ("class-2b", "Grade 2B", "grade-2"),
            ("class-3a", "Grade 3A", "grade-3"),
        ],
        students: vec![
            DemoStudent {
                id: "stu-001",
                name: "Amani Otieno",
                class_name: "Grade 1A",
                year: "2025",
                scores: vec![("Term 1", 72.0), ("Term 2", 80.0)],
                disciplinary_cases: 0,
                fees: tuition(20000.0, 15000.0)?,
            },
            DemoStudent {
                id: "stu-002",
                name: "Brian Kamau",
                class_name: "Grade 1B",
                year: "2025",
                scores: vec![("Term 1", 40.0), ("Term 2", 38.0)],
                disciplinary_cases: 0,
                fees: tuition(20000.0, 20000.0)?,
            },
            DemoStudent {
                id: "stu-003",
                name: "Cynthia Wanjiru",
                class_name: "Grade 2A",
                year: "2025",
                scores: vec![("Term 1", 65.0), ("Term 2", 70.0)],
                disciplinary_cases: 0,
                fees: tuition(20000.0, 0.0)?,
            },
            DemoStudent {
                id: "stu-004",
                name: "David Mwangi",
                class_name: "Grade 2B",
                year: "2025",
                scores: vec![("Term 1", 55.0), ("Term 2", 61.0)],
                disciplinary_cases: 1,
                fees: tuition(20000.0, 18500.0)?,
            },
            DemoStudent {
                id: "stu-005",
                name: "Esther Njeri",
                class_name: "Grade 3A",
                year: "2025",
                scores: vec![("Term 1", 88.0), ("Term 2", 91.0)],
                disciplinary_cases: 0,
                fees: tuition(20000.0, 20000.0)?,
            },
        ],
        criteria: DemoCriteria {
            name: "Standard promotion",
            description: "Pass mark 50, fee balance up to 16,000, no disciplinary cases",
            min_grade: 50.0,
            max_fee_balance: 16000.0,
            max_disciplinary_cases: 0,
        },
    })
}
