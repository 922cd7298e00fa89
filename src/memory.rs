use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::error::{PromotionError, PromotionResult};
use crate::models::{
    AcademicYear, EligibilitySnapshot, FeeStatementRow, Grade, HistoryFilter, ProgressionMap,
    ProgressionRule, PromotionCriteria, PromotionLogEntry, PromotionType, School, SchoolClass,
    StudentRecord, ALUMNI,
};
use crate::seed;
use crate::store::PromotionStore;
use crate::wizard::PromotionSession;

#[derive(Debug, Clone)]
struct Student {
    school_id: Uuid,
    id: String,
    name: String,
    current_class: String,
}

#[derive(Debug, Clone)]
struct Assessment {
    student_id: String,
    academic_year_id: Uuid,
    term: String,
    score: f64,
}

#[derive(Debug, Clone)]
struct FeeEntry {
    student_id: String,
    academic_year_id: Uuid,
    row: FeeStatementRow,
}

#[derive(Default)]
struct MemoryState {
    schools: Vec<School>,
    years: Vec<AcademicYear>,
    grades: HashMap<Uuid, Vec<Grade>>,
    classes: HashMap<Uuid, Vec<SchoolClass>>,
    students: Vec<Student>,
    assessments: Vec<Assessment>,
    disciplinary_cases: Vec<(String, Uuid)>,
    fees: Vec<FeeEntry>,
    criteria: Vec<PromotionCriteria>,
    progression: HashMap<Uuid, ProgressionMap>,
    snapshots: Vec<EligibilitySnapshot>,
    logs: Vec<PromotionLogEntry>,
    sessions: HashMap<Uuid, PromotionSession>,
}

/// Process-local store for demos and tests. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding the demo school used by `seed`.
    pub fn seeded() -> anyhow::Result<Self> {
        let store = Self::new();
        let demo = seed::demo_school()?;

        let school = store.add_school(demo.code, demo.name);
        let mut year_ids = HashMap::new();
        for year in &demo.years {
            let created = store.add_academic_year(
                school.id,
                year.name,
                year.start_date,
                year.end_date,
                year.is_current,
                &year.terms,
            );
            year_ids.insert(year.name, created.id);
        }
        for (id, name) in &demo.grades {
            store.add_grade(school.id, id, name);
        }
        for (id, name, grade_id) in &demo.classes {
            store.add_class(school.id, id, name, grade_id);
        }
        for student in &demo.students {
            store.add_student(school.id, student.id, student.name, student.class_name);
            let year_id = year_ids
                .get(student.year)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown seed year {}", student.year))?;
            for (term, score) in &student.scores {
                store.add_assessment(student.id, year_id, term, *score);
            }
            for _ in 0..student.disciplinary_cases {
                store.add_disciplinary_case(student.id, year_id);
            }
            for fee in &student.fees {
                store.add_fee_entry(
                    student.id,
                    year_id,
                    fee.date,
                    fee.description,
                    fee.debit,
                    fee.credit,
                );
            }
        }

        let criteria = &demo.criteria;
        let mut state = store.lock_state()?;
        state.criteria.push(PromotionCriteria {
            id: Uuid::new_v4(),
            school_id: school.id,
            name: criteria.name.to_string(),
            description: Some(criteria.description.to_string()),
            min_grade: criteria.min_grade,
            max_fee_balance: criteria.max_fee_balance,
            max_disciplinary_cases: criteria.max_disciplinary_cases,
            is_active: true,
            is_default: true,
            priority: 1,
            created_at: Utc::now(),
        });
        drop(state);

        Ok(store)
    }

    fn lock_state(&self) -> PromotionResult<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| PromotionError::Storage("memory store lock poisoned".to_string()))
    }

    // Builders only ever push whole rows, so a poisoned guard is still usable.
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_school(&self, code: &str, name: &str) -> School {
        let school = School {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: name.to_string(),
        };
        self.state().schools.push(school.clone());
        school
    }

    pub fn add_academic_year(
        &self,
        school_id: Uuid,
        name: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        is_current: bool,
        terms: &[&str],
    ) -> AcademicYear {
        let year = AcademicYear {
            id: Uuid::new_v4(),
            school_id,
            name: name.to_string(),
            start_date,
            end_date,
            is_current,
            terms: terms.iter().map(|term| term.to_string()).collect(),
        };
        self.state().years.push(year.clone());
        year
    }

    pub fn add_grade(&self, school_id: Uuid, id: &str, name: &str) {
        self.state().grades.entry(school_id).or_default().push(Grade {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_class(&self, school_id: Uuid, id: &str, name: &str, grade_id: &str) {
        self.state()
            .classes
            .entry(school_id)
            .or_default()
            .push(SchoolClass {
                id: id.to_string(),
                name: name.to_string(),
                grade_id: grade_id.to_string(),
            });
    }

    pub fn add_student(&self, school_id: Uuid, id: &str, name: &str, class_name: &str) {
        self.state().students.push(Student {
            school_id,
            id: id.to_string(),
            name: name.to_string(),
            current_class: class_name.to_string(),
        });
    }

    pub fn add_assessment(&self, student_id: &str, academic_year_id: Uuid, term: &str, score: f64) {
        self.state().assessments.push(Assessment {
            student_id: student_id.to_string(),
            academic_year_id,
            term: term.to_string(),
            score,
        });
    }

    pub fn add_disciplinary_case(&self, student_id: &str, academic_year_id: Uuid) {
        self.state()
            .disciplinary_cases
            .push((student_id.to_string(), academic_year_id));
    }

    /// Appends a statement line, carrying the running balance forward.
    pub fn add_fee_entry(
        &self,
        student_id: &str,
        academic_year_id: Uuid,
        date: NaiveDate,
        description: &str,
        debit: f64,
        credit: f64,
    ) {
        let mut state = self.state();
        let previous = state
            .fees
            .iter()
            .filter(|fee| fee.student_id == student_id && fee.academic_year_id == academic_year_id)
            .last()
            .map(|fee| fee.row.balance)
            .unwrap_or(0.0);
        state.fees.push(FeeEntry {
            student_id: student_id.to_string(),
            academic_year_id,
            row: FeeStatementRow {
                date,
                description: description.to_string(),
                debit,
                credit,
                balance: previous + debit - credit,
            },
        });
    }

    #[cfg(test)]
    pub fn student_class(&self, student_id: &str) -> Option<String> {
        self.state()
            .students
            .iter()
            .find(|student| student.id == student_id)
            .map(|student| student.current_class.clone())
    }
}

#[async_trait]
impl PromotionStore for MemoryStore {
    async fn school_by_code(&self, code: &str) -> PromotionResult<School> {
        self.lock_state()?
            .schools
            .iter()
            .find(|school| school.code == code)
            .cloned()
            .ok_or_else(|| PromotionError::not_found(format!("school {code}")))
    }

    async fn academic_years(&self, school_id: Uuid) -> PromotionResult<Vec<AcademicYear>> {
        let mut years: Vec<AcademicYear> = self
            .lock_state()?
            .years
            .iter()
            .filter(|year| year.school_id == school_id)
            .cloned()
            .collect();
        years.sort_by_key(|year| year.start_date);
        Ok(years)
    }

    async fn grades(&self, school_id: Uuid) -> PromotionResult<Vec<Grade>> {
        Ok(self
            .lock_state()?
            .grades
            .get(&school_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn classes(&self, school_id: Uuid) -> PromotionResult<Vec<SchoolClass>> {
        Ok(self
            .lock_state()?
            .classes
            .get(&school_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn roster(
        &self,
        school_id: Uuid,
        academic_year_id: Uuid,
        term: Option<&str>,
    ) -> PromotionResult<Vec<StudentRecord>> {
        let state = self.lock_state()?;
        let mut roster: Vec<StudentRecord> = state
            .students
            .iter()
            .filter(|student| student.school_id == school_id && student.current_class != ALUMNI)
            .map(|student| {
                let scores: Vec<f64> = state
                    .assessments
                    .iter()
                    .filter(|a| {
                        a.student_id == student.id
                            && a.academic_year_id == academic_year_id
                            && term.map_or(true, |term| a.term == term)
                    })
                    .map(|a| a.score)
                    .collect();
                let average_grade = if scores.is_empty() {
                    0.0
                } else {
                    scores.iter().sum::<f64>() / scores.len() as f64
                };
                let disciplinary_cases = state
                    .disciplinary_cases
                    .iter()
                    .filter(|(id, year)| *id == student.id && *year == academic_year_id)
                    .count() as i32;

                StudentRecord {
                    id: student.id.clone(),
                    name: student.name.clone(),
                    current_class: student.current_class.clone(),
                    average_grade,
                    disciplinary_cases,
                }
            })
            .collect();
        roster.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roster)
    }

    async fn fee_statement(
        &self,
        school_id: Uuid,
        student_id: &str,
        academic_year_id: Uuid,
    ) -> PromotionResult<Vec<FeeStatementRow>> {
        let state = self.lock_state()?;
        if !state
            .students
            .iter()
            .any(|student| student.school_id == school_id && student.id == student_id)
        {
            return Err(PromotionError::not_found(format!("student {student_id}")));
        }
        Ok(state
            .fees
            .iter()
            .filter(|fee| fee.student_id == student_id && fee.academic_year_id == academic_year_id)
            .map(|fee| fee.row.clone())
            .collect())
    }

    async fn list_criteria(&self, school_id: Uuid) -> PromotionResult<Vec<PromotionCriteria>> {
        Ok(self
            .lock_state()?
            .criteria
            .iter()
            .filter(|record| record.school_id == school_id)
            .cloned()
            .collect())
    }

    async fn get_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionCriteria> {
        self.lock_state()?
            .criteria
            .iter()
            .find(|record| record.school_id == school_id && record.id == id)
            .cloned()
            .ok_or_else(|| PromotionError::not_found(format!("promotion criteria {id}")))
    }

    async fn insert_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()> {
        self.lock_state()?.criteria.push(criteria.clone());
        Ok(())
    }

    async fn update_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()> {
        let mut state = self.lock_state()?;
        let record = state
            .criteria
            .iter_mut()
            .find(|record| record.school_id == criteria.school_id && record.id == criteria.id)
            .ok_or_else(|| PromotionError::not_found(format!("promotion criteria {}", criteria.id)))?;
        *record = criteria.clone();
        Ok(())
    }

    async fn delete_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()> {
        let mut state = self.lock_state()?;
        let before = state.criteria.len();
        state
            .criteria
            .retain(|record| !(record.school_id == school_id && record.id == id));
        if state.criteria.len() == before {
            return Err(PromotionError::not_found(format!("promotion criteria {id}")));
        }
        Ok(())
    }

    async fn activate_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()> {
        let mut state = self.lock_state()?;
        if !state
            .criteria
            .iter()
            .any(|record| record.school_id == school_id && record.id == id)
        {
            return Err(PromotionError::not_found(format!("promotion criteria {id}")));
        }
        for record in state
            .criteria
            .iter_mut()
            .filter(|record| record.school_id == school_id)
        {
            record.is_active = record.id == id;
        }
        Ok(())
    }

    async fn progression(&self, school_id: Uuid) -> PromotionResult<ProgressionMap> {
        Ok(self
            .lock_state()?
            .progression
            .get(&school_id)
            .cloned()
            .unwrap_or_else(|| ProgressionMap::empty(school_id)))
    }

    async fn replace_progression(
        &self,
        school_id: Uuid,
        rules: &[ProgressionRule],
        expected_version: Option<i64>,
    ) -> PromotionResult<ProgressionMap> {
        let mut state = self.lock_state()?;
        let current = state
            .progression
            .get(&school_id)
            .map(|map| map.version)
            .unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(PromotionError::Conflict(format!(
                    "progression rules are at version {current}, not {expected}"
                )));
            }
        }
        let map = ProgressionMap {
            school_id,
            version: current + 1,
            rules: rules.to_vec(),
            updated_at: Some(Utc::now()),
        };
        state.progression.insert(school_id, map.clone());
        Ok(map)
    }

    async fn insert_snapshot(&self, snapshot: &EligibilitySnapshot) -> PromotionResult<()> {
        self.lock_state()?.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn snapshot(&self, school_id: Uuid, id: Uuid) -> PromotionResult<EligibilitySnapshot> {
        self.lock_state()?
            .snapshots
            .iter()
            .find(|snapshot| snapshot.school_id == school_id && snapshot.id == id)
            .cloned()
            .ok_or_else(|| PromotionError::not_found(format!("eligibility snapshot {id}")))
    }

    async fn record_promotion(&self, entry: &PromotionLogEntry) -> PromotionResult<bool> {
        let mut state = self.lock_state()?;
        let duplicate = state.logs.iter().any(|logged| {
            logged.school_id == entry.school_id
                && logged.student_id == entry.student_id
                && logged.from_year == entry.from_year
                && logged.promotion_type != PromotionType::Excluded
        });
        if duplicate {
            return Ok(false);
        }

        let student = state
            .students
            .iter_mut()
            .find(|student| student.school_id == entry.school_id && student.id == entry.student_id)
            .ok_or_else(|| PromotionError::not_found(format!("student {}", entry.student_id)))?;
        student.current_class = entry.to_class.clone();
        state.logs.push(entry.clone());
        Ok(true)
    }

    async fn append_log(&self, entry: &PromotionLogEntry) -> PromotionResult<()> {
        self.lock_state()?.logs.push(entry.clone());
        Ok(())
    }

    async fn promotion_logs(
        &self,
        school_id: Uuid,
        filter: &HistoryFilter,
    ) -> PromotionResult<Vec<PromotionLogEntry>> {
        let mut logs: Vec<PromotionLogEntry> = self
            .lock_state()?
            .logs
            .iter()
            .filter(|entry| entry.school_id == school_id && filter.matches(entry))
            .cloned()
            .collect();
        logs.reverse();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(logs)
    }

    async fn save_session(&self, session: &PromotionSession) -> PromotionResult<()> {
        self.lock_state()?
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn session(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionSession> {
        self.lock_state()?
            .sessions
            .get(&id)
            .filter(|session| session.school_id == school_id)
            .cloned()
            .ok_or_else(|| PromotionError::not_found(format!("promotion session {id}")))
    }
}
