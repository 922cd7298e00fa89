use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{PromotionError, PromotionResult};
use crate::models::{Grade, ProgressionMap, ProgressionRule, SchoolClass, ALUMNI};
use crate::store::{self, PromotionStore};

/// Freshly derived rules alongside the targets that have no class record yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedProgression {
    pub rules: Vec<ProgressionRule>,
    pub missing: Vec<String>,
}

/// All ASCII digits in the name read as one number: "Grade 10" -> 10.
pub fn grade_number(name: &str) -> Option<u64> {
    let digits: String = name.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Numbered grades ascending. Names without digits go first; ties keep their
/// input order.
pub fn sort_grades(grades: &[Grade]) -> Vec<&Grade> {
    let mut ordered: Vec<&Grade> = grades.iter().collect();
    ordered.sort_by_key(|grade| match grade_number(&grade.name) {
        Some(number) => (1u8, number),
        None => (0u8, 0),
    });
    ordered
}

/// What remains of the class name once the grade name is taken out: "Grade 1A" -> "A".
pub fn stream_suffix(class_name: &str, grade_name: &str) -> String {
    class_name.replacen(grade_name, "", 1).trim().to_string()
}

fn synthesize(next_grade: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        next_grade.to_string()
    } else {
        format!("{next_grade} {suffix}")
    }
}

pub fn build(grades: &[Grade], classes: &[SchoolClass]) -> Vec<ProgressionRule> {
    let ordered = sort_grades(grades);
    let alumni = classes
        .iter()
        .find(|class| class.name == ALUMNI)
        .map(|class| class.name.clone())
        .unwrap_or_else(|| ALUMNI.to_string());

    let mut rules = Vec::new();
    for (index, grade) in ordered.iter().enumerate() {
        let next = ordered.get(index + 1);
        let sources = classes
            .iter()
            .filter(|class| class.grade_id == grade.id && class.name != ALUMNI);

        for class in sources {
            let to_class = match next {
                Some(next_grade) => {
                    let suffix = stream_suffix(&class.name, &grade.name);
                    classes
                        .iter()
                        .find(|candidate| {
                            candidate.grade_id == next_grade.id && candidate.name.ends_with(&suffix)
                        })
                        .map(|candidate| candidate.name.clone())
                        .unwrap_or_else(|| synthesize(&next_grade.name, &suffix))
                }
                None => alumni.clone(),
            };

            rules.push(ProgressionRule {
                from_class: class.name.clone(),
                to_class,
                order: index as i32 + 1,
            });
        }
    }
    rules
}

/// Targets that are neither an existing class nor the alumni destination.
pub fn missing_targets(rules: &[ProgressionRule], classes: &[SchoolClass]) -> Vec<String> {
    let known: HashSet<&str> = classes.iter().map(|class| class.name.as_str()).collect();
    rules
        .iter()
        .map(|rule| rule.to_class.as_str())
        .filter(|target| *target != ALUMNI && !known.contains(target))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn validate(rules: &[ProgressionRule]) -> PromotionResult<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.from_class.trim().is_empty() {
            return Err(PromotionError::validation("fromClass is required on every rule"));
        }
        if rule.to_class.trim().is_empty() {
            return Err(PromotionError::validation(format!(
                "toClass is required for {}",
                rule.from_class
            )));
        }
        if !seen.insert(rule.from_class.as_str()) {
            return Err(PromotionError::validation(format!(
                "duplicate rule for {}",
                rule.from_class
            )));
        }
    }
    Ok(())
}

pub async fn derive(store: &dyn PromotionStore, school_id: Uuid) -> PromotionResult<DerivedProgression> {
    let grades = store.grades(school_id).await?;
    let classes = store.classes(school_id).await?;
    let rules = build(&grades, &classes);
    let missing = missing_targets(&rules, &classes);
    Ok(DerivedProgression { rules, missing })
}

pub async fn load(store: &dyn PromotionStore, school_id: Uuid) -> PromotionResult<ProgressionMap> {
    store.progression(school_id).await
}

/// Replaces the saved rule set wholesale.
pub async fn save(
    store: &dyn PromotionStore,
    school_id: Uuid,
    rules: &[ProgressionRule],
    expected_version: Option<i64>,
) -> PromotionResult<ProgressionMap> {
    validate(rules)?;
    let map = store
        .replace_progression(school_id, rules, expected_version)
        .await?;
    info!(
        school_id = %school_id,
        rules = map.rules.len(),
        version = map.version,
        "progression rules saved"
    );
    Ok(map)
}

/// A student as shown on the progression review screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStudent {
    pub id: String,
    pub name: String,
    pub current_class: String,
    pub target_class: Option<String>,
}

/// Students of the current year with the class the saved rules would move
/// them to.
pub async fn review(store: &dyn PromotionStore, school_id: Uuid) -> PromotionResult<Vec<ReviewStudent>> {
    let year = store::current_year(store, school_id).await?;
    let roster = store.roster(school_id, year.id, None).await?;
    let map = store.progression(school_id).await?;

    Ok(roster
        .into_iter()
        .map(|student| ReviewStudent {
            target_class: map.target_for(&student.current_class).map(str::to_string),
            id: student.id,
            name: student.name,
            current_class: student.current_class,
        })
        .collect())
}
