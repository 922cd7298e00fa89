use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
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

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Loads the demo school. Safe to run repeatedly: rows are upserted by their
/// natural keys and student placements are left alone on re-runs.
pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let demo = seed::demo_school()?;

    let school_id: Uuid = sqlx::query(
        r#"
        INSERT INTO promotions.schools (id, code, name)
        VALUES ($1, $2, $3)
        ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(demo.code)
    .bind(demo.name)
    .fetch_one(pool)
    .await?
    .get("id");

    let mut year_ids = std::collections::HashMap::new();
    for year in &demo.years {
        let year_id: Uuid = sqlx::query(
            r#"
            INSERT INTO promotions.academic_years
            (id, school_id, name, start_date, end_date, is_current, terms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (school_id, name) DO UPDATE
            SET start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                is_current = EXCLUDED.is_current,
                terms = EXCLUDED.terms
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(school_id)
        .bind(year.name)
        .bind(year.start_date)
        .bind(year.end_date)
        .bind(year.is_current)
        .bind(&year.terms)
        .fetch_one(pool)
        .await?
        .get("id");
        year_ids.insert(year.name, year_id);
    }

    for (id, name) in &demo.grades {
        sqlx::query(
            r#"
            INSERT INTO promotions.grades (school_id, id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (school_id, id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(school_id)
        .bind(*id)
        .bind(*name)
        .execute(pool)
        .await?;
    }

    for (id, name, grade_id) in &demo.classes {
        sqlx::query(
            r#"
            INSERT INTO promotions.classes (school_id, id, name, grade_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (school_id, id) DO UPDATE
            SET name = EXCLUDED.name, grade_id = EXCLUDED.grade_id
            "#,
        )
        .bind(school_id)
        .bind(*id)
        .bind(*name)
        .bind(*grade_id)
        .execute(pool)
        .await?;
    }

    for student in &demo.students {
        let year_id = *year_ids
            .get(student.year)
            .with_context(|| format!("unknown seed year {}", student.year))?;

        sqlx::query(
            r#"
            INSERT INTO promotions.students (school_id, id, full_name, current_class)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (school_id, id) DO UPDATE SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(school_id)
        .bind(student.id)
        .bind(student.name)
        .bind(student.class_name)
        .execute(pool)
        .await?;

        for (term, score) in &student.scores {
            sqlx::query(
                r#"
                INSERT INTO promotions.assessments
                (id, school_id, student_id, academic_year_id, term, score, source_key)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(school_id)
            .bind(student.id)
            .bind(year_id)
            .bind(*term)
            .bind(*score)
            .bind(format!("seed-{}-{}-{}", student.id, student.year, term))
            .execute(pool)
            .await?;
        }

        for case in 0..student.disciplinary_cases {
            sqlx::query(
                r#"
                INSERT INTO promotions.disciplinary_cases
                (id, school_id, student_id, academic_year_id, description, source_key)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(school_id)
            .bind(student.id)
            .bind(year_id)
            .bind("Reported by the deputy head")
            .bind(format!("seed-{}-{}-case-{case}", student.id, student.year))
            .execute(pool)
            .await?;
        }

        let mut balance = 0.0;
        for (seq, fee) in student.fees.iter().enumerate() {
            balance += fee.debit - fee.credit;
            sqlx::query(
                r#"
                INSERT INTO promotions.fee_statement_entries
                (id, school_id, student_id, academic_year_id, seq, entry_date,
                 description, debit, credit, balance)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (school_id, student_id, academic_year_id, seq) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(school_id)
            .bind(student.id)
            .bind(year_id)
            .bind(seq as i32)
            .bind(fee.date)
            .bind(fee.description)
            .bind(fee.debit)
            .bind(fee.credit)
            .bind(balance)
            .execute(pool)
            .await?;
        }
    }

    let criteria = &demo.criteria;
    sqlx::query(
        r#"
        INSERT INTO promotions.promotion_criteria
        (id, school_id, name, description, min_grade, max_fee_balance,
         max_disciplinary_cases, is_active, is_default, priority)
        SELECT $1, $2, $3, $4, $5, $6, $7, TRUE, TRUE, 1
        WHERE NOT EXISTS (
            SELECT 1 FROM promotions.promotion_criteria WHERE school_id = $2 AND name = $3
        )
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(school_id)
    .bind(criteria.name)
    .bind(criteria.description)
    .bind(criteria.min_grade)
    .bind(criteria.max_fee_balance)
    .bind(criteria.max_disciplinary_cases)
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CRITERIA_COLUMNS: &str = "id, school_id, name, description, min_grade, max_fee_balance, \
     max_disciplinary_cases, is_active, is_default, priority, created_at";

const LOG_COLUMNS: &str = "id, school_id, student_id, student_name, from_class, to_class, \
     from_grade, to_grade, from_year, to_year, promoted_by, promotion_type, reason, \
     average_grade, outstanding_balance, disciplinary_cases, created_at";

fn criteria_from_row(row: &PgRow) -> Result<PromotionCriteria, sqlx::Error> {
    Ok(PromotionCriteria {
        id: row.try_get("id")?,
        school_id: row.try_get("school_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        min_grade: row.try_get("min_grade")?,
        max_fee_balance: row.try_get("max_fee_balance")?,
        max_disciplinary_cases: row.try_get("max_disciplinary_cases")?,
        is_active: row.try_get("is_active")?,
        is_default: row.try_get("is_default")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
    })
}

fn log_from_row(row: &PgRow) -> PromotionResult<PromotionLogEntry> {
    let promotion_type: String = row.try_get("promotion_type")?;
    Ok(PromotionLogEntry {
        id: row.try_get("id")?,
        school_id: row.try_get("school_id")?,
        student_id: row.try_get("student_id")?,
        student_name: row.try_get("student_name")?,
        from_class: row.try_get("from_class")?,
        to_class: row.try_get("to_class")?,
        from_grade: row.try_get("from_grade")?,
        to_grade: row.try_get("to_grade")?,
        from_year: row.try_get("from_year")?,
        to_year: row.try_get("to_year")?,
        promoted_by: row.try_get("promoted_by")?,
        promotion_type: PromotionType::parse(&promotion_type).ok_or_else(|| {
            PromotionError::Storage(format!("unknown promotion type {promotion_type}"))
        })?,
        reason: row.try_get("reason")?,
        average_grade: row.try_get("average_grade")?,
        outstanding_balance: row.try_get("outstanding_balance")?,
        disciplinary_cases: row.try_get("disciplinary_cases")?,
        created_at: row.try_get("created_at")?,
    })
}

fn insert_log<'q>(sql: &'q str, entry: &'q PromotionLogEntry) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(sql)
        .bind(entry.id)
        .bind(entry.school_id)
        .bind(&entry.student_id)
        .bind(&entry.student_name)
        .bind(&entry.from_class)
        .bind(&entry.to_class)
        .bind(&entry.from_grade)
        .bind(&entry.to_grade)
        .bind(&entry.from_year)
        .bind(&entry.to_year)
        .bind(&entry.promoted_by)
        .bind(entry.promotion_type.as_str())
        .bind(&entry.reason)
        .bind(entry.average_grade)
        .bind(entry.outstanding_balance)
        .bind(entry.disciplinary_cases)
        .bind(entry.created_at)
}

const INSERT_LOG: &str = r#"
    INSERT INTO promotions.promotion_logs
    (id, school_id, student_id, student_name, from_class, to_class, from_grade, to_grade,
     from_year, to_year, promoted_by, promotion_type, reason, average_grade,
     outstanding_balance, disciplinary_cases, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
"#;

#[async_trait]
impl PromotionStore for PgStore {
    async fn school_by_code(&self, code: &str) -> PromotionResult<School> {
        let row = sqlx::query("SELECT id, code, name FROM promotions.schools WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PromotionError::not_found(format!("school {code}")))?;

        Ok(School {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            name: row.try_get("name")?,
        })
    }

    async fn academic_years(&self, school_id: Uuid) -> PromotionResult<Vec<AcademicYear>> {
        let rows = sqlx::query(
            "SELECT id, school_id, name, start_date, end_date, is_current, terms \
             FROM promotions.academic_years WHERE school_id = $1 ORDER BY start_date",
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?;

        let mut years = Vec::with_capacity(rows.len());
        for row in rows {
            years.push(AcademicYear {
                id: row.try_get("id")?,
                school_id: row.try_get("school_id")?,
                name: row.try_get("name")?,
                start_date: row.try_get("start_date")?,
                end_date: row.try_get("end_date")?,
                is_current: row.try_get("is_current")?,
                terms: row.try_get("terms")?,
            });
        }
        Ok(years)
    }

    async fn grades(&self, school_id: Uuid) -> PromotionResult<Vec<Grade>> {
        let rows = sqlx::query("SELECT id, name FROM promotions.grades WHERE school_id = $1 ORDER BY id")
            .bind(school_id)
            .fetch_all(&self.pool)
            .await?;

        let mut grades = Vec::with_capacity(rows.len());
        for row in rows {
            grades.push(Grade {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(grades)
    }

    async fn classes(&self, school_id: Uuid) -> PromotionResult<Vec<SchoolClass>> {
        let rows = sqlx::query(
            "SELECT id, name, grade_id FROM promotions.classes WHERE school_id = $1 ORDER BY name",
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?;

        let mut classes = Vec::with_capacity(rows.len());
        for row in rows {
            classes.push(SchoolClass {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                grade_id: row.try_get("grade_id")?,
            });
        }
        Ok(classes)
    }

    async fn roster(
        &self,
        school_id: Uuid,
        academic_year_id: Uuid,
        term: Option<&str>,
    ) -> PromotionResult<Vec<StudentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.full_name, s.current_class,
                   COALESCE((
                       SELECT AVG(a.score) FROM promotions.assessments a
                       WHERE a.school_id = s.school_id AND a.student_id = s.id
                         AND a.academic_year_id = $2
                         AND ($3::TEXT IS NULL OR a.term = $3)
                   ), 0)::DOUBLE PRECISION AS average_grade,
                   (
                       SELECT COUNT(*) FROM promotions.disciplinary_cases d
                       WHERE d.school_id = s.school_id AND d.student_id = s.id
                         AND d.academic_year_id = $2
                   )::INTEGER AS disciplinary_cases
            FROM promotions.students s
            WHERE s.school_id = $1 AND s.current_class <> $4
            ORDER BY s.full_name
            "#,
        )
        .bind(school_id)
        .bind(academic_year_id)
        .bind(term)
        .bind(ALUMNI)
        .fetch_all(&self.pool)
        .await?;

        let mut roster = Vec::with_capacity(rows.len());
        for row in rows {
            roster.push(StudentRecord {
                id: row.try_get("id")?,
                name: row.try_get("full_name")?,
                current_class: row.try_get("current_class")?,
                average_grade: row.try_get("average_grade")?,
                disciplinary_cases: row.try_get("disciplinary_cases")?,
            });
        }
        Ok(roster)
    }

    async fn fee_statement(
        &self,
        school_id: Uuid,
        student_id: &str,
        academic_year_id: Uuid,
    ) -> PromotionResult<Vec<FeeStatementRow>> {
        let rows = sqlx::query(
            r#"
            SELECT entry_date, description, debit, credit, balance
            FROM promotions.fee_statement_entries
            WHERE school_id = $1 AND student_id = $2 AND academic_year_id = $3
            ORDER BY seq
            "#,
        )
        .bind(school_id)
        .bind(student_id)
        .bind(academic_year_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            let known = sqlx::query("SELECT 1 FROM promotions.students WHERE school_id = $1 AND id = $2")
                .bind(school_id)
                .bind(student_id)
                .fetch_optional(&self.pool)
                .await?;
            if known.is_none() {
                return Err(PromotionError::not_found(format!("student {student_id}")));
            }
        }

        let mut statement = Vec::with_capacity(rows.len());
        for row in rows {
            statement.push(FeeStatementRow {
                date: row.try_get("entry_date")?,
                description: row.try_get("description")?,
                debit: row.try_get("debit")?,
                credit: row.try_get("credit")?,
                balance: row.try_get("balance")?,
            });
        }
        Ok(statement)
    }

    async fn list_criteria(&self, school_id: Uuid) -> PromotionResult<Vec<PromotionCriteria>> {
        let query = format!(
            "SELECT {CRITERIA_COLUMNS} FROM promotions.promotion_criteria WHERE school_id = $1"
        );
        let rows = sqlx::query(&query)
            .bind(school_id)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(criteria_from_row(row)?);
        }
        Ok(records)
    }

    async fn get_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionCriteria> {
        let query = format!(
            "SELECT {CRITERIA_COLUMNS} FROM promotions.promotion_criteria \
             WHERE school_id = $1 AND id = $2"
        );
        let row = sqlx::query(&query)
            .bind(school_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PromotionError::not_found(format!("promotion criteria {id}")))?;
        Ok(criteria_from_row(&row)?)
    }

    async fn insert_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO promotions.promotion_criteria
            (id, school_id, name, description, min_grade, max_fee_balance,
             max_disciplinary_cases, is_active, is_default, priority, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(criteria.id)
        .bind(criteria.school_id)
        .bind(&criteria.name)
        .bind(&criteria.description)
        .bind(criteria.min_grade)
        .bind(criteria.max_fee_balance)
        .bind(criteria.max_disciplinary_cases)
        .bind(criteria.is_active)
        .bind(criteria.is_default)
        .bind(criteria.priority)
        .bind(criteria.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_criteria(&self, criteria: &PromotionCriteria) -> PromotionResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE promotions.promotion_criteria
            SET name = $3, description = $4, min_grade = $5, max_fee_balance = $6,
                max_disciplinary_cases = $7, is_active = $8, is_default = $9, priority = $10
            WHERE school_id = $1 AND id = $2
            "#,
        )
        .bind(criteria.school_id)
        .bind(criteria.id)
        .bind(&criteria.name)
        .bind(&criteria.description)
        .bind(criteria.min_grade)
        .bind(criteria.max_fee_balance)
        .bind(criteria.max_disciplinary_cases)
        .bind(criteria.is_active)
        .bind(criteria.is_default)
        .bind(criteria.priority)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PromotionError::not_found(format!(
                "promotion criteria {}",
                criteria.id
            )));
        }
        Ok(())
    }

    async fn delete_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()> {
        let result = sqlx::query(
            "DELETE FROM promotions.promotion_criteria WHERE school_id = $1 AND id = $2",
        )
        .bind(school_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PromotionError::not_found(format!("promotion criteria {id}")));
        }
        Ok(())
    }

    async fn activate_criteria(&self, school_id: Uuid, id: Uuid) -> PromotionResult<()> {
        let mut tx = self.pool.begin().await?;
        let known = sqlx::query(
            "SELECT 1 FROM promotions.promotion_criteria WHERE school_id = $1 AND id = $2",
        )
        .bind(school_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if known.is_none() {
            return Err(PromotionError::not_found(format!("promotion criteria {id}")));
        }

        sqlx::query(
            "UPDATE promotions.promotion_criteria SET is_active = (id = $2) WHERE school_id = $1",
        )
        .bind(school_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn progression(&self, school_id: Uuid) -> PromotionResult<ProgressionMap> {
        let header = sqlx::query(
            "SELECT version, updated_at FROM promotions.progression_versions WHERE school_id = $1",
        )
        .bind(school_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(header) = header else {
            return Ok(ProgressionMap::empty(school_id));
        };

        let rows = sqlx::query(
            r#"
            SELECT from_class, to_class, sort_order FROM promotions.progression_rules
            WHERE school_id = $1
            ORDER BY sort_order, from_class
            "#,
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            rules.push(ProgressionRule {
                from_class: row.try_get("from_class")?,
                to_class: row.try_get("to_class")?,
                order: row.try_get("sort_order")?,
            });
        }

        Ok(ProgressionMap {
            school_id,
            version: header.try_get("version")?,
            rules,
            updated_at: header.try_get("updated_at")?,
        })
    }

    async fn replace_progression(
        &self,
        school_id: Uuid,
        rules: &[ProgressionRule],
        expected_version: Option<i64>,
    ) -> PromotionResult<ProgressionMap> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO promotions.progression_versions (school_id, version)
            VALUES ($1, 0)
            ON CONFLICT (school_id) DO NOTHING
            "#,
        )
        .bind(school_id)
        .execute(&mut *tx)
        .await?;

        let current: i64 = sqlx::query(
            "SELECT version FROM promotions.progression_versions WHERE school_id = $1 FOR UPDATE",
        )
        .bind(school_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("version")?;

        if let Some(expected) = expected_version {
            if expected != current {
                return Err(PromotionError::Conflict(format!(
                    "progression rules are at version {current}, not {expected}"
                )));
            }
        }

        sqlx::query("DELETE FROM promotions.progression_rules WHERE school_id = $1")
            .bind(school_id)
            .execute(&mut *tx)
            .await?;

        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO promotions.progression_rules (school_id, from_class, to_class, sort_order)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(school_id)
            .bind(&rule.from_class)
            .bind(&rule.to_class)
            .bind(rule.order)
            .execute(&mut *tx)
            .await?;
        }

        let updated_at: DateTime<Utc> = Utc::now();
        sqlx::query(
            "UPDATE promotions.progression_versions SET version = $2, updated_at = $3 WHERE school_id = $1",
        )
        .bind(school_id)
        .bind(current + 1)
        .bind(updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ProgressionMap {
            school_id,
            version: current + 1,
            rules: rules.to_vec(),
            updated_at: Some(updated_at),
        })
    }

    async fn insert_snapshot(&self, snapshot: &EligibilitySnapshot) -> PromotionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO promotions.eligibility_snapshots
            (id, school_id, academic_year_id, term, fingerprint, students, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.school_id)
        .bind(snapshot.academic_year_id)
        .bind(&snapshot.term)
        .bind(&snapshot.fingerprint)
        .bind(Json(&snapshot.students))
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snapshot(&self, school_id: Uuid, id: Uuid) -> PromotionResult<EligibilitySnapshot> {
        let row = sqlx::query(
            r#"
            SELECT id, school_id, academic_year_id, term, fingerprint, students, created_at
            FROM promotions.eligibility_snapshots
            WHERE school_id = $1 AND id = $2
            "#,
        )
        .bind(school_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PromotionError::not_found(format!("eligibility snapshot {id}")))?;

        let Json(students): Json<BTreeMap<String, String>> = row.try_get("students")?;
        Ok(EligibilitySnapshot {
            id: row.try_get("id")?,
            school_id: row.try_get("school_id")?,
            academic_year_id: row.try_get("academic_year_id")?,
            term: row.try_get("term")?,
            fingerprint: row.try_get("fingerprint")?,
            students,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn record_promotion(&self, entry: &PromotionLogEntry) -> PromotionResult<bool> {
        let mut tx = self.pool.begin().await?;

        let insert = format!(
            "{INSERT_LOG} ON CONFLICT (school_id, student_id, from_year) \
             WHERE promotion_type <> 'excluded' DO NOTHING"
        );
        let inserted = insert_log(&insert, entry).execute(&mut *tx).await?;
        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        let moved = sqlx::query(
            "UPDATE promotions.students SET current_class = $3 WHERE school_id = $1 AND id = $2",
        )
        .bind(entry.school_id)
        .bind(&entry.student_id)
        .bind(&entry.to_class)
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() == 0 {
            return Err(PromotionError::not_found(format!("student {}", entry.student_id)));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn append_log(&self, entry: &PromotionLogEntry) -> PromotionResult<()> {
        insert_log(INSERT_LOG, entry).execute(&self.pool).await?;
        Ok(())
    }

    async fn promotion_logs(
        &self,
        school_id: Uuid,
        filter: &HistoryFilter,
    ) -> PromotionResult<Vec<PromotionLogEntry>> {
        let mut query = format!(
            "SELECT {LOG_COLUMNS} FROM promotions.promotion_logs WHERE school_id = $1"
        );
        let mut next = 2;
        if filter.academic_year.is_some() {
            query.push_str(&format!(" AND from_year = ${next}"));
            next += 1;
        }
        if filter.student_id.is_some() {
            query.push_str(&format!(" AND student_id = ${next}"));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut rows = sqlx::query(&query).bind(school_id);
        if let Some(year) = &filter.academic_year {
            rows = rows.bind(year);
        }
        if let Some(student_id) = &filter.student_id {
            rows = rows.bind(student_id);
        }

        let records = rows.fetch_all(&self.pool).await?;
        let mut logs = Vec::with_capacity(records.len());
        for row in &records {
            logs.push(log_from_row(row)?);
        }
        Ok(logs)
    }

    async fn save_session(&self, session: &PromotionSession) -> PromotionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO promotions.promotion_sessions (id, school_id, stage, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET stage = EXCLUDED.stage, state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(session.id)
        .bind(session.school_id)
        .bind(session.stage.as_str())
        .bind(Json(session))
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session(&self, school_id: Uuid, id: Uuid) -> PromotionResult<PromotionSession> {
        let row = sqlx::query(
            "SELECT state FROM promotions.promotion_sessions WHERE school_id = $1 AND id = $2",
        )
        .bind(school_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PromotionError::not_found(format!("promotion session {id}")))?;

        let Json(session): Json<PromotionSession> = row.try_get("state")?;
        Ok(session)
    }
}
