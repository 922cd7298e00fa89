use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{PromotionError, PromotionResult};
use crate::models::{
    BulkPromotionRequest, BulkPromotionResult, PromotionPreview, School, StudentEligibility,
};
use crate::store::{self, PromotionStore};
use crate::{criteria, eligibility, executor, progression};

/// Literal an administrator must type before a batch is executed.
pub const CONFIRMATION_TEXT: &str = "CONFIRM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WizardStage {
    SelectYear,
    Criteria,
    Preview,
    Progression,
    Confirm,
    Results,
}

impl WizardStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WizardStage::SelectYear => "select-year",
            WizardStage::Criteria => "criteria",
            WizardStage::Preview => "preview",
            WizardStage::Progression => "progression",
            WizardStage::Confirm => "confirm",
            WizardStage::Results => "results",
        }
    }
}

impl fmt::Display for WizardStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WizardAction {
    SelectYear {
        #[serde(rename = "academicYearId")]
        academic_year_id: Uuid,
        #[serde(default)]
        term: Option<String>,
    },
    ChooseCriteria {
        #[serde(default, rename = "criteriaId")]
        criteria_id: Option<Uuid>,
    },
    Preview,
    Override {
        #[serde(rename = "studentId")]
        student_id: String,
        note: String,
    },
    Exclude {
        #[serde(rename = "studentId")]
        student_id: String,
        note: String,
    },
    ClearAdjustment {
        #[serde(rename = "studentId")]
        student_id: String,
    },
    AcceptPreview,
    ConfirmProgression,
    Execute {
        confirmation: String,
        #[serde(default, rename = "promotedBy")]
        promoted_by: Option<String>,
    },
    Rewind {
        stage: WizardStage,
    },
}

impl WizardAction {
    fn name(&self) -> &'static str {
        match self {
            WizardAction::SelectYear { .. } => "select a year",
            WizardAction::ChooseCriteria { .. } => "choose criteria",
            WizardAction::Preview => "preview eligibility",
            WizardAction::Override { .. } => "override a student",
            WizardAction::Exclude { .. } => "exclude a student",
            WizardAction::ClearAdjustment { .. } => "clear an adjustment",
            WizardAction::AcceptPreview => "accept the preview",
            WizardAction::ConfirmProgression => "confirm progression",
            WizardAction::Execute { .. } => "execute promotions",
            WizardAction::Rewind { .. } => "rewind",
        }
    }
}

/// Persisted state of one promotion run, so a reload can resume where the
/// administrator left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionSession {
    pub id: Uuid,
    pub school_id: Uuid,
    pub stage: WizardStage,
    pub academic_year_id: Option<Uuid>,
    pub term: Option<String>,
    pub criteria_id: Option<Uuid>,
    pub snapshot_id: Option<Uuid>,
    pub eligible: Vec<StudentEligibility>,
    pub ineligible: Vec<StudentEligibility>,
    pub overrides: BTreeMap<String, String>,
    pub exclusions: BTreeMap<String, String>,
    pub progression_version: Option<i64>,
    pub result: Option<BulkPromotionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromotionSession {
    pub fn new(school_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            school_id,
            stage: WizardStage::SelectYear,
            academic_year_id: None,
            term: None,
            criteria_id: None,
            snapshot_id: None,
            eligible: Vec::new(),
            ineligible: Vec::new(),
            overrides: BTreeMap::new(),
            exclusions: BTreeMap::new(),
            progression_version: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn require_stage(&self, stage: WizardStage, action: &WizardAction) -> PromotionResult<()> {
        if self.stage == stage {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &WizardAction) -> PromotionError {
        PromotionError::InvalidTransition {
            action: action.name().to_string(),
            stage: self.stage.to_string(),
        }
    }

    fn has_preview(&self) -> bool {
        self.snapshot_id.is_some()
    }

    fn clear_preview(&mut self) {
        self.snapshot_id = None;
        self.eligible.clear();
        self.ineligible.clear();
        self.overrides.clear();
        self.exclusions.clear();
    }

    /// Stores a fresh preview, keeping adjustments that still apply to the
    /// student's new classification.
    pub fn apply_preview(&mut self, preview: PromotionPreview) {
        let eligible: Vec<&str> = preview
            .eligible_students
            .iter()
            .map(|s| s.student_id.as_str())
            .collect();
        let ineligible: Vec<&str> = preview
            .ineligible_students
            .iter()
            .map(|s| s.student_id.as_str())
            .collect();
        self.exclusions
            .retain(|student_id, _| eligible.contains(&student_id.as_str()));
        self.overrides
            .retain(|student_id, _| ineligible.contains(&student_id.as_str()));

        self.snapshot_id = Some(preview.snapshot_id);
        self.eligible = preview.eligible_students;
        self.ineligible = preview.ineligible_students;
    }

    fn adjust(&mut self, action: &WizardAction) -> PromotionResult<()> {
        self.require_stage(WizardStage::Preview, action)?;
        if !self.has_preview() {
            return Err(PromotionError::validation("run the eligibility preview first"));
        }

        match action {
            WizardAction::Override { student_id, note } => {
                let note = required_note(note)?;
                if !self.ineligible.iter().any(|s| &s.student_id == student_id) {
                    return Err(PromotionError::validation(format!(
                        "{student_id} is not in the ineligible list"
                    )));
                }
                self.overrides.insert(student_id.clone(), note);
            }
            WizardAction::Exclude { student_id, note } => {
                let note = required_note(note)?;
                if !self.eligible.iter().any(|s| &s.student_id == student_id) {
                    return Err(PromotionError::validation(format!(
                        "{student_id} is not in the eligible list"
                    )));
                }
                self.exclusions.insert(student_id.clone(), note);
            }
            WizardAction::ClearAdjustment { student_id } => {
                self.overrides.remove(student_id);
                self.exclusions.remove(student_id);
            }
            _ => return Err(self.invalid(action)),
        }
        Ok(())
    }

    fn rewind(&mut self, target: WizardStage, action: &WizardAction) -> PromotionResult<()> {
        if self.stage == WizardStage::Results || target >= self.stage {
            return Err(self.invalid(action));
        }
        if target < WizardStage::Preview {
            self.clear_preview();
        }
        if target < WizardStage::Criteria {
            self.criteria_id = None;
        }
        self.progression_version = None;
        self.stage = target;
        Ok(())
    }
}

fn required_note(note: &str) -> PromotionResult<String> {
    let note = note.trim();
    if note.is_empty() {
        return Err(PromotionError::validation("a reason is required"));
    }
    Ok(note.to_string())
}

pub async fn start(store: &dyn PromotionStore, school: &School) -> PromotionResult<PromotionSession> {
    let session = PromotionSession::new(school.id);
    store.save_session(&session).await?;
    info!(school = %school.code, session_id = %session.id, "promotion session started");
    Ok(session)
}

pub async fn load(
    store: &dyn PromotionStore,
    school: &School,
    session_id: Uuid,
) -> PromotionResult<PromotionSession> {
    store.session(school.id, session_id).await
}

/// Applies one action and persists the session when it succeeds. A failed
/// action leaves the stored session untouched.
pub async fn apply(
    store: &dyn PromotionStore,
    school: &School,
    session_id: Uuid,
    action: WizardAction,
    concurrency: usize,
) -> PromotionResult<PromotionSession> {
    let mut session = store.session(school.id, session_id).await?;

    match &action {
        WizardAction::SelectYear {
            academic_year_id,
            term,
        } => {
            session.require_stage(WizardStage::SelectYear, &action)?;
            let year = store::year_by_id(store, school.id, *academic_year_id).await?;
            let term = term
                .as_deref()
                .map(str::trim)
                .filter(|term| !term.is_empty())
                .map(str::to_string);
            if let Some(term) = &term {
                if !year.terms.is_empty() && !year.terms.contains(term) {
                    return Err(PromotionError::validation(format!(
                        "{term} is not a term of {}",
                        year.name
                    )));
                }
            }
            session.academic_year_id = Some(year.id);
            session.term = term;
            session.stage = WizardStage::Criteria;
        }
        WizardAction::ChooseCriteria { criteria_id } => {
            session.require_stage(WizardStage::Criteria, &action)?;
            let record = match criteria_id {
                Some(id) => store.get_criteria(school.id, *id).await?,
                None => criteria::active(store, school.id).await?,
            };
            session.criteria_id = Some(record.id);
            session.stage = WizardStage::Preview;
        }
        WizardAction::Preview => {
            session.require_stage(WizardStage::Preview, &action)?;
            let (Some(year_id), Some(criteria_id)) = (session.academic_year_id, session.criteria_id)
            else {
                return Err(session.invalid(&action));
            };
            let record = store.get_criteria(school.id, criteria_id).await?;
            let preview = eligibility::preview(
                store,
                school.id,
                year_id,
                session.term.as_deref(),
                &record,
                concurrency,
            )
            .await?;
            session.apply_preview(preview);
        }
        WizardAction::Override { .. }
        | WizardAction::Exclude { .. }
        | WizardAction::ClearAdjustment { .. } => session.adjust(&action)?,
        WizardAction::AcceptPreview => {
            session.require_stage(WizardStage::Preview, &action)?;
            if !session.has_preview() {
                return Err(PromotionError::validation("run the eligibility preview first"));
            }
            session.stage = WizardStage::Progression;
        }
        WizardAction::ConfirmProgression => {
            session.require_stage(WizardStage::Progression, &action)?;
            let map = progression::load(store, school.id).await?;
            executor::assemble(
                &session.eligible,
                &session.ineligible,
                &session.overrides,
                &session.exclusions,
                &map,
            )?;
            session.progression_version = Some(map.version);
            session.stage = WizardStage::Confirm;
        }
        WizardAction::Execute {
            confirmation,
            promoted_by,
        } => {
            session.require_stage(WizardStage::Confirm, &action)?;
            if confirmation != CONFIRMATION_TEXT {
                return Err(PromotionError::validation(format!(
                    "type {CONFIRMATION_TEXT} to execute the promotion"
                )));
            }
            let promoted_by = promoted_by
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    PromotionError::Unauthenticated("promotedBy is required".to_string())
                })?;

            let map = progression::load(store, school.id).await?;
            if session.progression_version != Some(map.version) {
                return Err(PromotionError::Conflict(
                    "progression rules changed after they were confirmed".to_string(),
                ));
            }
            let (students, ineligible_students) = executor::assemble(
                &session.eligible,
                &session.ineligible,
                &session.overrides,
                &session.exclusions,
                &map,
            )?;
            let request = BulkPromotionRequest {
                students,
                ineligible_students,
                promoted_by: Some(promoted_by.to_string()),
                academic_year_id: session.academic_year_id,
                snapshot_id: session.snapshot_id,
                term: session.term.clone(),
            };
            let result = executor::execute(store, school, &request, concurrency).await?;
            session.result = Some(result);
            session.stage = WizardStage::Results;
        }
        WizardAction::Rewind { stage } => session.rewind(*stage, &action)?,
    }

    session.updated_at = Utc::now();
    store.save_session(&session).await?;
    info!(
        session_id = %session.id,
        stage = %session.stage,
        action = action.name(),
        "promotion session advanced"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::ALUMNI;

    async fn seeded() -> (MemoryStore, School) {
        let store = MemoryStore::seeded().unwrap();
        let school = store.school_by_code("demo").await.unwrap();
        (store, school)
    }

    async fn at_preview(store: &MemoryStore, school: &School) -> PromotionSession {
        previewed_for_term(store, school, None).await
    }

    async fn previewed_for_term(
        store: &MemoryStore,
        school: &School,
        term: Option<&str>,
    ) -> PromotionSession {
        let session = start(store, school).await.unwrap();
        let year = store::current_year(store, school.id).await.unwrap();
        apply(
            store,
            school,
            session.id,
            WizardAction::SelectYear {
                academic_year_id: year.id,
                term: term.map(str::to_string),
            },
            2,
        )
        .await
        .unwrap();
        apply(store, school, session.id, WizardAction::ChooseCriteria { criteria_id: None }, 2)
            .await
            .unwrap();
        apply(store, school, session.id, WizardAction::Preview, 2)
            .await
            .unwrap()
    }

    #[test]
    fn actions_parse_from_tagged_json() {
        let action: WizardAction = serde_json::from_str(
            r#"{"action":"override","studentId":"stu-002","note":"Passed the resit"}"#,
        )
        .unwrap();
        assert!(matches!(action, WizardAction::Override { ref student_id, .. } if student_id == "stu-002"));

        let action: WizardAction =
            serde_json::from_str(r#"{"action":"rewind","stage":"criteria"}"#).unwrap();
        assert!(matches!(action, WizardAction::Rewind { stage: WizardStage::Criteria }));
    }

    #[tokio::test]
    async fn out_of_order_actions_are_rejected() {
        let (store, school) = seeded().await;
        let session = start(&store, &school).await.unwrap();

        let result = apply(&store, &school, session.id, WizardAction::Preview, 2).await;
        assert!(matches!(result, Err(PromotionError::InvalidTransition { .. })));

        let stored = load(&store, &school, session.id).await.unwrap();
        assert_eq!(stored.stage, WizardStage::SelectYear);
    }

    #[tokio::test]
    async fn overrides_require_an_ineligible_student_and_a_note() {
        let (store, school) = seeded().await;
        let session = at_preview(&store, &school).await;

        let eligible_override = WizardAction::Override {
            student_id: "stu-001".to_string(),
            note: "n/a".to_string(),
        };
        assert!(apply(&store, &school, session.id, eligible_override, 2).await.is_err());

        let blank_note = WizardAction::Override {
            student_id: "stu-002".to_string(),
            note: "  ".to_string(),
        };
        assert!(apply(&store, &school, session.id, blank_note, 2).await.is_err());

        let ok = WizardAction::Override {
            student_id: "stu-002".to_string(),
            note: "Passed the resit".to_string(),
        };
        let session = apply(&store, &school, session.id, ok, 2).await.unwrap();
        assert_eq!(
            session.overrides.get("stu-002").map(String::as_str),
            Some("Passed the resit")
        );
    }

    #[tokio::test]
    async fn full_run_promotes_and_survives_reload() {
        let (store, school) = seeded().await;
        let derived = progression::derive(&store, school.id).await.unwrap();
        progression::save(&store, school.id, &derived.rules, None)
            .await
            .unwrap();

        let session = at_preview(&store, &school).await;
        apply(
            &store,
            &school,
            session.id,
            WizardAction::Override {
                student_id: "stu-002".to_string(),
                note: "Passed the resit".to_string(),
            },
            2,
        )
        .await
        .unwrap();
        apply(
            &store,
            &school,
            session.id,
            WizardAction::Exclude {
                student_id: "stu-005".to_string(),
                note: "Staying for bridging year".to_string(),
            },
            2,
        )
        .await
        .unwrap();

        let reloaded = load(&store, &school, session.id).await.unwrap();
        assert_eq!(reloaded.overrides.len(), 1);
        assert_eq!(reloaded.exclusions.len(), 1);

        apply(&store, &school, session.id, WizardAction::AcceptPreview, 2)
            .await
            .unwrap();
        apply(&store, &school, session.id, WizardAction::ConfirmProgression, 2)
            .await
            .unwrap();

        let wrong = WizardAction::Execute {
            confirmation: "confirm".to_string(),
            promoted_by: Some("admin1".to_string()),
        };
        assert!(matches!(
            apply(&store, &school, session.id, wrong, 2).await,
            Err(PromotionError::Validation(_))
        ));

        let done = apply(
            &store,
            &school,
            session.id,
            WizardAction::Execute {
                confirmation: CONFIRMATION_TEXT.to_string(),
                promoted_by: Some("admin1".to_string()),
            },
            2,
        )
        .await
        .unwrap();

        assert_eq!(done.stage, WizardStage::Results);
        let result = done.result.unwrap();
        let mut promoted: Vec<&str> = result.promoted.iter().map(|p| p.student_id.as_str()).collect();
        promoted.sort();
        assert_eq!(promoted, vec!["stu-001", "stu-002"]);
        assert_eq!(result.excluded.len(), 3);
        assert!(result.errors.is_empty());
        assert_eq!(store.student_class("stu-002").as_deref(), Some("Grade 2B"));
        assert_ne!(store.student_class("stu-005").as_deref(), Some(ALUMNI));
    }

    #[tokio::test]
    async fn execution_stops_when_rules_change_after_confirmation() {
        let (store, school) = seeded().await;
        let derived = progression::derive(&store, school.id).await.unwrap();
        progression::save(&store, school.id, &derived.rules, None)
            .await
            .unwrap();
        let session = at_preview(&store, &school).await;
        apply(&store, &school, session.id, WizardAction::AcceptPreview, 2)
            .await
            .unwrap();
        apply(&store, &school, session.id, WizardAction::ConfirmProgression, 2)
            .await
            .unwrap();

        progression::save(&store, school.id, &derived.rules, None)
            .await
            .unwrap();

        let result = apply(
            &store,
            &school,
            session.id,
            WizardAction::Execute {
                confirmation: CONFIRMATION_TEXT.to_string(),
                promoted_by: Some("admin1".to_string()),
            },
            2,
        )
        .await;
        assert!(matches!(result, Err(PromotionError::Conflict(_))));
    }

    #[tokio::test]
    async fn confirm_progression_needs_a_rule_for_every_promoted_class() {
        let (store, school) = seeded().await;
        let session = at_preview(&store, &school).await;
        apply(&store, &school, session.id, WizardAction::AcceptPreview, 2)
            .await
            .unwrap();

        let result = apply(&store, &school, session.id, WizardAction::ConfirmProgression, 2).await;
        assert!(matches!(result, Err(PromotionError::Validation(_))));
    }

    #[tokio::test]
    async fn rewinding_before_preview_clears_adjustments() {
        let (store, school) = seeded().await;
        let session = at_preview(&store, &school).await;
        apply(
            &store,
            &school,
            session.id,
            WizardAction::Exclude {
                student_id: "stu-001".to_string(),
                note: "Transferring".to_string(),
            },
            2,
        )
        .await
        .unwrap();

        let rewound = apply(
            &store,
            &school,
            session.id,
            WizardAction::Rewind {
                stage: WizardStage::Criteria,
            },
            2,
        )
        .await
        .unwrap();

        assert_eq!(rewound.stage, WizardStage::Criteria);
        assert!(rewound.exclusions.is_empty());
        assert!(rewound.snapshot_id.is_none());

        let forward = apply(
            &store,
            &school,
            session.id,
            WizardAction::Rewind {
                stage: WizardStage::Confirm,
            },
            2,
        )
        .await;
        assert!(matches!(forward, Err(PromotionError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn term_scoped_run_logs_the_term_average() {
        let (store, school) = seeded().await;
        let derived = progression::derive(&store, school.id).await.unwrap();
        progression::save(&store, school.id, &derived.rules, None)
            .await
            .unwrap();

        let session = previewed_for_term(&store, &school, Some("Term 1")).await;
        let previewed = session
            .eligible
            .iter()
            .find(|s| s.student_id == "stu-001")
            .map(|s| s.average_grade);
        assert_eq!(previewed, Some(72.0));

        apply(&store, &school, session.id, WizardAction::AcceptPreview, 2)
            .await
            .unwrap();
        apply(&store, &school, session.id, WizardAction::ConfirmProgression, 2)
            .await
            .unwrap();
        apply(
            &store,
            &school,
            session.id,
            WizardAction::Execute {
                confirmation: CONFIRMATION_TEXT.to_string(),
                promoted_by: Some("admin1".to_string()),
            },
            2,
        )
        .await
        .unwrap();

        let filter = crate::models::HistoryFilter {
            academic_year: None,
            student_id: Some("stu-001".to_string()),
        };
        let logs = store.promotion_logs(school.id, &filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].average_grade, 72.0);
    }
}
