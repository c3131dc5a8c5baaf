use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use podtrack_auth::{AuthError, OidcAuthenticator};
use podtrack_contracts::{
    Actor, CanonicalIdentity, Criterion, Identity, NewPod, POD_ENTITY_TYPE, Page, Pod, PodPatch,
    PodRow, Transaction,
};
use podtrack_ledger::AuditRecord;
use podtrack_policy::facet;
use podtrack_policy::identity::EngineerRoster;
use podtrack_policy::partition::Partition;
use podtrack_policy::visibility::{self, Operation};
use podtrack_policy::{QueryError, SearchInput, plan_search};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{AuthMode, GatewayConfig, StartupError, StoreBackend};
use crate::store::{MemoryStore, Mutated, PgStore, PodChange, Store, StoreError};

pub const REQUEST_ID_HEADER: &str = "x-podtrack-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    store: Store,
    oidc: Option<OidcAuthenticator>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let store = match config.store_backend {
        StoreBackend::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "postgres store backend requires PODTRACK_DB_URL".to_string(),
            })?;
            let store =
                PgStore::connect(db_url, config.query_timeout(), config.ledger_write_timeout())
                    .await
                    .map_err(|err| StartupError {
                        code: "ERR_DB_UNAVAILABLE",
                        message: format!("failed to initialize store: {}", err),
                    })?;
            Store::Postgres(store)
        }
        StoreBackend::Memory => Store::Memory(MemoryStore::new()),
    };

    router_with_store(config, store).await
}

/// Builds the service around an existing store handle. Tests use this to
/// seed the in-memory backend before serving.
pub async fn router_with_store(config: GatewayConfig, store: Store) -> Result<Router, StartupError> {
    let oidc = if config.auth_mode == AuthMode::Oidc {
        let oidc_config = config.oidc.clone().ok_or_else(|| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc auth mode requires oidc config".to_string(),
        })?;

        Some(
            OidcAuthenticator::new(oidc_config)
                .await
                .map_err(|err| StartupError {
                    code: err.code,
                    message: err.message,
                })?,
        )
    } else {
        None
    };

    tracing::info!(
        store_backend = store.backend_name(),
        auth_mode = ?config.auth_mode,
        "gateway.router_ready"
    );

    let state = AppState {
        config,
        store,
        oidc,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/pods", post(create_pod))
        .route("/v1/pods/search", post(search_pods))
        .route("/v1/pods/facets", get(pod_facets))
        .route("/v1/pods/{code}", patch(update_pod).delete(delete_pod))
        .route("/v1/pods/{code}/complete", post(complete_pod))
        .route("/v1/engineers", get(engineer_roster))
        .route("/v1/identities/{id}/merge", post(merge_identity))
        .route(
            "/v1/transactions",
            get(list_transactions).post(record_transaction),
        )
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = tokio::time::timeout(
        state.config.query_timeout().max(Duration::from_millis(50)),
        state.store.ping(),
    )
    .await
    .is_ok_and(|res| res.is_ok());
    checks.insert("store", store_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) = extract_actor(&state, &headers).await
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SearchRequest {
    #[serde(default)]
    is_history: bool,
    #[serde(default)]
    page: Option<Value>,
    #[serde(default)]
    page_size: Option<Value>,
    #[serde(default)]
    filters: Vec<Criterion>,
}

async fn search_pods(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<Page<PodRow>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "pods.search",
        request_id = %request_id,
        actor_id = %actor.actor_id,
        role = actor.role.as_str(),
        is_history = tracing::field::Empty,
        total_count = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result: Result<Json<Page<PodRow>>, ApiError> = async {
        let Json(req) = req.map_err(|err| invalid_body(&err))?;
        tracing::Span::current().record("is_history", req.is_history);

        let plan = plan_search(
            SearchInput {
                role: actor.role,
                is_history: req.is_history,
                page: lenient_int(req.page.as_ref()),
                page_size: lenient_int(req.page_size.as_ref()),
                criteria: &req.filters,
            },
            state.config.page_defaults,
        )
        .map_err(|err| query_error_response(&err))?;
        crate::metrics::observe_visibility_gate(plan.predicate.role().as_str());

        let page = state
            .store
            .search(&plan)
            .await
            .map_err(|err| store_error_response("pods.search", &err))?;
        let identities = state
            .store
            .identities()
            .await
            .map_err(|err| store_error_response("pods.search", &err))?;
        let roster = EngineerRoster::resolve(&identities);

        tracing::Span::current().record("total_count", page.total_count);
        Ok(Json(enrich_page(page, &roster)))
    }
    .instrument(span.clone())
    .await;

    finish(&span, started, &result);
    crate::metrics::observe_http_request(
        "/v1/pods/search",
        "POST",
        status_of(&result, StatusCode::OK),
        started.elapsed(),
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FacetQuery {
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    is_history: Option<String>,
    #[serde(default)]
    filters: Option<String>,
}

async fn pod_facets(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<FacetQuery>, QueryRejection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "pods.facets",
        request_id = %request_id,
        actor_id = %actor.actor_id,
        role = actor.role.as_str(),
        field = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result: Result<Json<Vec<String>>, ApiError> = async {
        let Query(query) = query.map_err(|err| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PAYLOAD",
                format!("invalid query string: {}", err.body_text()),
                false,
            )
        })?;

        let field = query
            .field
            .as_deref()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .ok_or_else(|| {
                json_error(
                    StatusCode::BAD_REQUEST,
                    "ERR_INVALID_PAYLOAD",
                    "field query parameter is required",
                    false,
                )
            })?;
        tracing::Span::current().record("field", field);

        let is_history = parse_is_history(query.is_history.as_deref())?;
        let criteria = facet::parse_serialized_criteria(query.filters.as_deref())
            .map_err(|err| query_error_response(&err))?;
        let plan = facet::plan(field, &criteria, Partition::from_is_history(is_history))
            .map_err(|err| query_error_response(&err))?;

        let values = state
            .store
            .facet_values(&plan)
            .await
            .map_err(|err| store_error_response("pods.facets", &err))?;
        Ok(Json(values))
    }
    .instrument(span.clone())
    .await;

    finish(&span, started, &result);
    crate::metrics::observe_http_request(
        "/v1/pods/facets",
        "GET",
        status_of(&result, StatusCode::OK),
        started.elapsed(),
    );
    result
}

async fn engineer_roster(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<CanonicalIdentity>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "engineers.roster",
        request_id = %request_id,
        actor_id = %actor.actor_id,
        role = actor.role.as_str(),
        entries = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result: Result<Json<Vec<CanonicalIdentity>>, ApiError> = async {
        let identities = state
            .store
            .identities()
            .await
            .map_err(|err| store_error_response("engineers.roster", &err))?;
        let entries = EngineerRoster::resolve(&identities).into_entries();
        tracing::Span::current().record("entries", entries.len());
        Ok(Json(entries))
    }
    .instrument(span.clone())
    .await;

    finish(&span, started, &result);
    crate::metrics::observe_http_request(
        "/v1/engineers",
        "GET",
        status_of(&result, StatusCode::OK),
        started.elapsed(),
    );
    result
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MutationResponse<T> {
    entity: T,
    transaction: Transaction,
}

impl<T> From<Mutated<T>> for MutationResponse<T> {
    fn from(mutated: Mutated<T>) -> Self {
        Self {
            entity: mutated.entity,
            transaction: mutated.audit,
        }
    }
}

async fn create_pod(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<NewPod>, JsonRejection>,
) -> Result<(StatusCode, Json<MutationResponse<Pod>>), ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    require_permission(&actor, Operation::CreatePod)?;
    let Json(new_pod) = req.map_err(|err| invalid_body(&err))?;

    let code = new_pod.code.trim().to_string();
    let result = audited_mutation(
        &headers,
        &actor,
        "CREATE",
        &code,
        "/v1/pods",
        "POST",
        StatusCode::CREATED,
        state.store.create_pod(&actor, new_pod),
    )
    .await;
    result.map(|mutated| (StatusCode::CREATED, Json(mutated.into())))
}

async fn update_pod(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
    req: Result<Json<PodPatch>, JsonRejection>,
) -> Result<Json<MutationResponse<Pod>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    require_permission(&actor, Operation::UpdatePod)?;
    let Json(pod_patch) = req.map_err(|err| invalid_body(&err))?;

    change_pod(&state, &headers, &actor, &code, PodChange::Update(pod_patch)).await
}

async fn complete_pod(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<MutationResponse<Pod>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    require_permission(&actor, Operation::CompletePod)?;

    change_pod(&state, &headers, &actor, &code, PodChange::Complete).await
}

async fn delete_pod(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<MutationResponse<Pod>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    require_permission(&actor, Operation::DeletePod)?;

    change_pod(&state, &headers, &actor, &code, PodChange::Delete).await
}

async fn change_pod(
    state: &AppState,
    headers: &HeaderMap,
    actor: &Actor,
    code: &str,
    change: PodChange,
) -> Result<Json<MutationResponse<Pod>>, ApiError> {
    let (route, method) = match change {
        PodChange::Update(_) => ("/v1/pods/{code}", "PATCH"),
        PodChange::Complete => ("/v1/pods/{code}/complete", "POST"),
        PodChange::Delete => ("/v1/pods/{code}", "DELETE"),
    };

    audited_mutation(
        headers,
        actor,
        change.action(),
        code,
        route,
        method,
        StatusCode::OK,
        state.store.change_pod(actor, code, &change),
    )
    .await
    .map(|mutated| Json(mutated.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MergeRequest {
    target_id: String,
}

async fn merge_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(source_id): Path<String>,
    req: Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<MutationResponse<Identity>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    require_permission(&actor, Operation::MergeIdentity)?;
    let Json(req) = req.map_err(|err| invalid_body(&err))?;

    let source_id = source_id.trim().to_string();
    let target_id = req.target_id.trim().to_string();
    audited_mutation(
        &headers,
        &actor,
        "MERGE",
        &source_id,
        "/v1/identities/{id}/merge",
        "POST",
        StatusCode::OK,
        state.store.merge_identity(&actor, &source_id, &target_id),
    )
    .await
    .map(|mutated| Json(mutated.into()))
}

/// Runs one audit-then-write store call under the `pods.mutate` span and
/// records its outcome.
#[allow(clippy::too_many_arguments)]
async fn audited_mutation<T, F>(
    headers: &HeaderMap,
    actor: &Actor,
    action: &'static str,
    entity_id: &str,
    route: &'static str,
    method: &'static str,
    success: StatusCode,
    write: F,
) -> Result<Mutated<T>, ApiError>
where
    F: Future<Output = Result<Mutated<T>, StoreError>>,
{
    let request_id = extract_request_id(headers);
    let span = tracing::info_span!(
        "pods.mutate",
        request_id = %request_id,
        actor_id = %actor.actor_id,
        role = actor.role.as_str(),
        action,
        entity_id = %entity_id,
        transaction_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result: Result<Mutated<T>, ApiError> = async {
        match write.await {
            Ok(mutated) => {
                tracing::Span::current().record("transaction_id", mutated.audit.id.as_str());
                crate::metrics::observe_mutation(action, "ok");
                Ok(mutated)
            }
            Err(err) => {
                if matches!(err, StoreError::AuditWriteFailed(_)) {
                    crate::metrics::inc_audit_write_failure();
                }
                crate::metrics::observe_mutation(action, "error");
                Err(store_error_response("pods.mutate", &err))
            }
        }
    }
    .instrument(span.clone())
    .await;

    finish(&span, started, &result);
    crate::metrics::observe_http_request(
        route,
        method,
        status_of(&result, success),
        started.elapsed(),
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrailQuery {
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    entity_id: Option<String>,
}

async fn list_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<TrailQuery>, QueryRejection>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    require_permission(&actor, Operation::ReadAudit)?;
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "audit.list",
        request_id = %request_id,
        actor_id = %actor.actor_id,
        role = actor.role.as_str(),
        entity_type = tracing::field::Empty,
        entity_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result: Result<Json<Vec<Transaction>>, ApiError> = async {
        let Query(query) = query.map_err(|err| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PAYLOAD",
                format!("invalid query string: {}", err.body_text()),
                false,
            )
        })?;
        let entity_type = required_param(query.entity_type.as_deref(), "entityType")?;
        let entity_id = required_param(query.entity_id.as_deref(), "entityId")?;
        tracing::Span::current().record("entity_type", entity_type);
        tracing::Span::current().record("entity_id", entity_id);

        // A pod outside the caller's display partition has no readable
        // history, matching how mutations report it.
        if entity_type == POD_ENTITY_TYPE {
            let pod = state
                .store
                .pod(entity_id)
                .await
                .map_err(|err| store_error_response("audit.list", &err))?;
            if pod.is_some_and(|pod| !visibility::in_display_partition(actor.role, &pod)) {
                return Err(store_error_response(
                    "audit.list",
                    &StoreError::NotFound(format!("pod {}", entity_id)),
                ));
            }
        }

        let trail = state
            .store
            .audit_trail(entity_type, entity_id)
            .await
            .map_err(|err| store_error_response("audit.list", &err))?;
        Ok(Json(trail))
    }
    .instrument(span.clone())
    .await;

    finish(&span, started, &result);
    crate::metrics::observe_http_request(
        "/v1/transactions",
        "GET",
        status_of(&result, StatusCode::OK),
        started.elapsed(),
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RecordTransactionRequest {
    entity_type: String,
    entity_id: String,
    action: String,
    #[serde(default)]
    details: Value,
    actor_id: String,
}

async fn record_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<RecordTransactionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    let actor = extract_actor(&state, &headers).await?;
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "audit.record",
        request_id = %request_id,
        actor_id = %actor.actor_id,
        role = actor.role.as_str(),
        entity_type = tracing::field::Empty,
        transaction_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result: Result<(StatusCode, Json<Transaction>), ApiError> = async {
        let Json(req) = req.map_err(|err| invalid_body(&err))?;
        tracing::Span::current().record("entity_type", req.entity_type.as_str());

        if req.actor_id.trim() != actor.actor_id {
            return Err(json_error(
                StatusCode::FORBIDDEN,
                "ERR_FORBIDDEN",
                "actorId must match the authenticated actor",
                false,
            ));
        }

        let written = state
            .store
            .record_audit(AuditRecord {
                entity_type: req.entity_type.trim(),
                entity_id: req.entity_id.trim(),
                action: req.action.trim(),
                details: &req.details,
                actor_id: &actor.actor_id,
            })
            .await
            .map_err(|err| {
                if matches!(err, StoreError::AuditWriteFailed(_)) {
                    crate::metrics::inc_audit_write_failure();
                }
                store_error_response("audit.record", &err)
            })?;

        tracing::Span::current().record("transaction_id", written.id.as_str());
        Ok((StatusCode::CREATED, Json(written)))
    }
    .instrument(span.clone())
    .await;

    finish(&span, started, &result);
    crate::metrics::observe_http_request(
        "/v1/transactions",
        "POST",
        status_of(&result, StatusCode::CREATED),
        started.elapsed(),
    );
    result
}

fn enrich_page(page: Page<Pod>, roster: &EngineerRoster) -> Page<PodRow> {
    let Page {
        rows,
        total_count,
        total_pages,
        current_page,
    } = page;

    let rows = rows
        .into_iter()
        .map(|pod| PodRow {
            engineer_name: pod
                .engineer_id
                .as_deref()
                .and_then(|id| roster.display_name_for(id))
                .map(str::to_string),
            created_by_name: roster
                .display_name_for(&pod.created_by_id)
                .map(str::to_string),
            pod,
        })
        .collect();

    Page {
        rows,
        total_count,
        total_pages,
        current_page,
    }
}

/// Page numbers arrive from form-backed clients as numbers or strings;
/// anything unparsable falls back to the configured default.
fn lenient_int(raw: Option<&Value>) -> Option<i64> {
    match raw? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_is_history(raw: Option<&str>) -> Result<bool, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(_) => Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PAYLOAD",
            "isHistory must be true or false",
            false,
        )),
    }
}

fn required_param<'a>(raw: Option<&'a str>, name: &str) -> Result<&'a str, ApiError> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PAYLOAD",
                format!("{} query parameter is required", name),
                false,
            )
        })
}

fn finish<T>(span: &tracing::Span, started: Instant, result: &Result<T, ApiError>) {
    let latency_ms = started.elapsed().as_millis() as u64;
    span.record("latency_ms", latency_ms);
    span.record("outcome", if result.is_ok() { "ok" } else { "error" });
}

fn status_of<T>(result: &Result<T, ApiError>, success: StatusCode) -> u16 {
    match result {
        Ok(_) => success.as_u16(),
        Err((status, _)) => status.as_u16(),
    }
}

async fn extract_actor(state: &AppState, headers: &HeaderMap) -> Result<Actor, ApiError> {
    let authenticated = match state.config.auth_mode {
        AuthMode::Local => podtrack_auth::authenticate_local(
            headers,
            state.config.local_auth_shared_secret.as_deref(),
        ),
        AuthMode::Oidc => {
            let Some(auth) = state.oidc.as_ref() else {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERR_INTERNAL",
                    "oidc authenticator is not initialized",
                    false,
                ));
            };
            auth.authenticate(headers).await
        }
    };

    authenticated.map_err(|err| auth_error_response(&err))
}

fn auth_error_response(err: &AuthError) -> ApiError {
    if err.is_unavailable() {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_AUTH_UNAVAILABLE",
            err.message.clone(),
            true,
        );
    }
    json_error(
        StatusCode::UNAUTHORIZED,
        "ERR_UNAUTHORIZED",
        err.message.clone(),
        false,
    )
}

fn require_permission(actor: &Actor, operation: Operation) -> Result<(), ApiError> {
    if visibility::permits(actor.role, operation) {
        return Ok(());
    }
    Err(json_error(
        StatusCode::FORBIDDEN,
        "ERR_FORBIDDEN",
        format!(
            "role {} may not perform {}",
            actor.role.as_str(),
            operation.as_str()
        ),
        false,
    ))
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn invalid_body(err: &JsonRejection) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_PAYLOAD",
        format!("invalid JSON body: {}", err.body_text()),
        false,
    )
}

fn query_error_response(err: &QueryError) -> ApiError {
    match err {
        QueryError::InvalidField(field) => json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_FIELD",
            format!("field `{}` is not filterable", field),
            false,
        ),
        QueryError::InvalidPayload(reason) => json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PAYLOAD",
            reason.clone(),
            false,
        ),
    }
}

fn store_error_response(operation: &'static str, err: &StoreError) -> ApiError {
    match err {
        StoreError::NotFound(what) => json_error(
            StatusCode::NOT_FOUND,
            "ERR_NOT_FOUND",
            format!("{} not found", what),
            false,
        ),
        StoreError::InvalidPayload(reason) => json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PAYLOAD",
            reason.clone(),
            false,
        ),
        StoreError::AuditWriteFailed(reason) => {
            tracing::error!(operation, reason = %reason, "audit write failed; mutation aborted");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_AUDIT_WRITE_FAILED",
                "audit trail unavailable; nothing was changed",
                true,
            )
        }
        StoreError::Timeout => {
            tracing::warn!(operation, "store operation timed out");
            json_error(
                StatusCode::GATEWAY_TIMEOUT,
                "ERR_TIMEOUT",
                "store operation timed out",
                true,
            )
        }
        StoreError::Backend(reason) => {
            tracing::error!(operation, reason = %reason, "store backend failure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_INTERNAL",
                "internal error",
                false,
            )
        }
    }
}
