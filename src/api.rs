use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::criteria::{self, CriteriaDraft};
use crate::error::{PromotionError, PromotionResult};
use crate::models::{BulkPromotionRequest, HistoryFilter, ProgressionRule, School};
use crate::store::{self, PromotionStore};
use crate::wizard::{self, WizardAction};
use crate::{eligibility, executor, history, progression};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PromotionStore>,
    pub fee_concurrency: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn PromotionStore>, fee_concurrency: usize) -> Self {
        Self {
            store,
            fee_concurrency,
        }
    }

    fn store(&self) -> &dyn PromotionStore {
        self.store.as_ref()
    }

    async fn school(&self, code: &str) -> PromotionResult<School> {
        self.store.school_by_code(code).await
    }
}

impl IntoResponse for PromotionError {
    fn into_response(self) -> Response {
        let status = match &self {
            PromotionError::Validation(_) => StatusCode::BAD_REQUEST,
            PromotionError::NotFound(_) => StatusCode::NOT_FOUND,
            PromotionError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            PromotionError::Conflict(_)
            | PromotionError::StaleSnapshot(_)
            | PromotionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            PromotionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }

        let message = match self {
            PromotionError::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, PromotionError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> PromotionResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| PromotionError::validation(rejection.body_text()))
}

fn params<T>(query: Result<Query<T>, QueryRejection>) -> PromotionResult<T> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| PromotionError::validation(rejection.body_text()))
}

fn parse_id(field: &str, raw: &str) -> PromotionResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| PromotionError::validation(format!("{field} must be a valid id")))
}

pub fn router(state: AppState) -> Router {
    let school = Router::new()
        .route("/academic-years", get(academic_years))
        .route(
            "/promotions",
            get(list_criteria)
                .post(create_criteria)
                .put(change_criteria)
                .delete(delete_criteria),
        )
        .route("/promotions/bulk", get(preview).post(execute))
        .route("/promotions/sessions", post(start_session))
        .route(
            "/promotions/sessions/:id",
            get(get_session).post(apply_session_action),
        )
        .route("/progression", get(get_progression).post(save_progression))
        .route("/progression/build", get(build_progression))
        .route("/progression/review", get(review_progression))
        .route("/promotion-logs", get(promotion_logs))
        .route("/students/:id/fee-statement", get(fee_statement));

    Router::new()
        .route("/api/health", get(health))
        .nest("/api/schools/:code", school)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn academic_years(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<Value> {
    let school = state.school(&code).await?;
    let years = state.store.academic_years(school.id).await?;
    Ok(Json(json!({ "data": years })))
}

#[derive(Debug, Default, Deserialize)]
struct PromotionsQuery {
    action: Option<String>,
    id: Option<String>,
}

fn require_criteria_action(query: &PromotionsQuery) -> PromotionResult<()> {
    match query.action.as_deref() {
        Some("criteria") => Ok(()),
        Some(other) => Err(PromotionError::validation(format!("unsupported action {other}"))),
        None => Err(PromotionError::validation("action is required")),
    }
}

async fn list_criteria(
    State(state): State<AppState>,
    Path(code): Path<String>,
    query: Result<Query<PromotionsQuery>, QueryRejection>,
) -> ApiResult<Value> {
    require_criteria_action(&params(query)?)?;
    let school = state.school(&code).await?;
    let records = criteria::list(state.store(), school.id).await?;
    Ok(Json(json!({ "data": records })))
}

async fn create_criteria(
    State(state): State<AppState>,
    Path(code): Path<String>,
    query: Result<Query<PromotionsQuery>, QueryRejection>,
    payload: Result<Json<CriteriaDraft>, JsonRejection>,
) -> ApiResult<Value> {
    require_criteria_action(&params(query)?)?;
    let draft = body(payload)?;
    let school = state.school(&code).await?;
    let record = criteria::create(state.store(), school.id, &draft).await?;
    Ok(Json(json!({ "data": record })))
}

#[derive(Debug, Deserialize)]
struct CriteriaRef {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct CriteriaUpdate {
    id: Uuid,
    #[serde(flatten)]
    draft: CriteriaDraft,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "kebab-case")]
enum CriteriaCommand {
    UpdateCriteria(CriteriaUpdate),
    ActivateCriteria(CriteriaRef),
}

async fn change_criteria(
    State(state): State<AppState>,
    Path(code): Path<String>,
    payload: Result<Json<CriteriaCommand>, JsonRejection>,
) -> ApiResult<Value> {
    let command = body(payload)?;
    let school = state.school(&code).await?;
    let record = match command {
        CriteriaCommand::UpdateCriteria(update) => {
            criteria::update(state.store(), school.id, update.id, &update.draft).await?
        }
        CriteriaCommand::ActivateCriteria(target) => {
            criteria::activate(state.store(), school.id, target.id).await?
        }
    };
    Ok(Json(json!({ "data": record })))
}

async fn delete_criteria(
    State(state): State<AppState>,
    Path(code): Path<String>,
    query: Result<Query<PromotionsQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let query = params(query)?;
    require_criteria_action(&query)?;
    let id = query
        .id
        .as_deref()
        .ok_or_else(|| PromotionError::validation("id is required"))?;
    let id = parse_id("id", id)?;

    let school = state.school(&code).await?;
    criteria::delete(state.store(), school.id, id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewQuery {
    action: Option<String>,
    year: Option<String>,
    term: Option<String>,
    criteria_id: Option<String>,
}

async fn preview(
    State(state): State<AppState>,
    Path(code): Path<String>,
    query: Result<Query<PreviewQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let query = params(query)?;
    if query.action.as_deref() != Some("preview") {
        return Err(PromotionError::validation("action=preview is required"));
    }

    let school = state.school(&code).await?;
    let year = store::resolve_year(state.store(), school.id, query.year.as_deref()).await?;
    let rules = match query.criteria_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            state
                .store
                .get_criteria(school.id, parse_id("criteriaId", id)?)
                .await?
        }
        None => criteria::active(state.store(), school.id).await?,
    };
    let term = query.term.as_deref().map(str::trim).filter(|term| !term.is_empty());

    let preview = eligibility::preview(
        state.store(),
        school.id,
        year.id,
        term,
        &rules,
        state.fee_concurrency,
    )
    .await?;
    Ok(Json(serde_json::to_value(preview)?))
}

async fn execute(
    State(state): State<AppState>,
    Path(code): Path<String>,
    payload: Result<Json<BulkPromotionRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let request = body(payload)?;
    let school = state.school(&code).await?;
    let result = executor::execute(state.store(), &school, &request, state.fee_concurrency).await?;
    Ok(Json(serde_json::to_value(result)?))
}

async fn start_session(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<Value> {
    let school = state.school(&code).await?;
    let session = wizard::start(state.store(), &school).await?;
    Ok(Json(serde_json::to_value(session)?))
}

async fn get_session(
    State(state): State<AppState>,
    Path((code, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let id = parse_id("session id", &id)?;
    let school = state.school(&code).await?;
    let session = wizard::load(state.store(), &school, id).await?;
    Ok(Json(serde_json::to_value(session)?))
}

async fn apply_session_action(
    State(state): State<AppState>,
    Path((code, id)): Path<(String, String)>,
    payload: Result<Json<WizardAction>, JsonRejection>,
) -> ApiResult<Value> {
    let id = parse_id("session id", &id)?;
    let action = body(payload)?;
    let school = state.school(&code).await?;
    let session = wizard::apply(state.store(), &school, id, action, state.fee_concurrency).await?;
    Ok(Json(serde_json::to_value(session)?))
}

async fn get_progression(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<Value> {
    let school = state.school(&code).await?;
    let map = progression::load(state.store(), school.id).await?;
    Ok(Json(serde_json::to_value(map)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveProgression {
    rules: Vec<ProgressionRule>,
    #[serde(default)]
    expected_version: Option<i64>,
}

async fn save_progression(
    State(state): State<AppState>,
    Path(code): Path<String>,
    payload: Result<Json<SaveProgression>, JsonRejection>,
) -> ApiResult<Value> {
    let request = body(payload)?;
    let school = state.school(&code).await?;
    let map = progression::save(
        state.store(),
        school.id,
        &request.rules,
        request.expected_version,
    )
    .await?;
    Ok(Json(serde_json::to_value(map)?))
}

async fn build_progression(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<Value> {
    let school = state.school(&code).await?;
    let derived = progression::derive(state.store(), school.id).await?;
    Ok(Json(serde_json::to_value(derived)?))
}

async fn review_progression(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<Value> {
    let school = state.school(&code).await?;
    let students = progression::review(state.store(), school.id).await?;
    Ok(Json(json!({ "students": students })))
}

async fn promotion_logs(
    State(state): State<AppState>,
    Path(code): Path<String>,
    query: Result<Query<HistoryFilter>, QueryRejection>,
) -> ApiResult<Value> {
    let filter = params(query)?;
    let school = state.school(&code).await?;
    let logs = history::list(state.store(), school.id, &filter).await?;
    Ok(Json(serde_json::to_value(logs)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeStatementQuery {
    academic_year_id: Option<String>,
}

async fn fee_statement(
    State(state): State<AppState>,
    Path((code, student_id)): Path<(String, String)>,
    query: Result<Query<FeeStatementQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let query = params(query)?;
    let school = state.school(&code).await?;
    let year = store::resolve_year(state.store(), school.id, query.academic_year_id.as_deref()).await?;
    let rows = state
        .store
        .fee_statement(school.id, &student_id, year.id)
        .await?;
    Ok(Json(serde_json::to_value(rows)?))
}
