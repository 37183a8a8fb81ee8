use std::sync::Arc;

use askama::Template;
use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderValue, StatusCode},
    response::{sse::Sse, Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::{error, info};

use invoice_dash_core::form::{FieldErrors, InvoiceForm};
use invoice_dash_core::pagination::pagination_links;
use invoice_dash_core::types::Invoice;
use invoice_dash_identity::{Credentials, IdentityClient};
use invoice_dash_storage::Database;

use crate::auth::{AuthOutcome, Authenticator};
use crate::invoices::{InvoiceService, MutationError, MutationOutcome, INVOICES_PATH};
use crate::problem::ProblemResponse;
use crate::revalidate::{
    cache_key, revalidation_keep_alive, revalidation_stream, ListViewCache, RevalidationEvent,
    RevalidationHub,
};
use crate::telemetry;
use crate::views::InvoicePage;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    invoices: InvoiceService,
    authenticator: Authenticator,
    revalidation: RevalidationHub,
    list_cache: ListViewCache,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, identity: IdentityClient) -> Self {
        let clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> = Arc::new(Utc::now);
        let invoices = InvoiceService::new(storage.clone(), clock.clone());
        Self {
            metrics,
            storage,
            clock,
            invoices,
            authenticator: Authenticator::new(identity),
            revalidation: RevalidationHub::new(),
            list_cache: ListViewCache::new(),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock.clone();
        self.invoices = InvoiceService::new(self.storage.clone(), clock);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn invoices(&self) -> &InvoiceService {
        &self.invoices
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn revalidation(&self) -> &RevalidationHub {
        &self.revalidation
    }

    pub fn list_cache(&self) -> &ListViewCache {
        &self.list_cache
    }

    /// Invalidates cached renderings for every path in `outcome` and tells
    /// subscribed dashboards about it.
    fn apply_revalidation(&self, outcome: &MutationOutcome) {
        for path in &outcome.revalidate {
            let dropped = self.list_cache.invalidate(path);
            counter!("revalidations_total", "path" => *path).increment(1);
            info!(stage = "revalidate", path, dropped, "revalidated cached view");
            self.revalidation.publish(RevalidationEvent {
                path: path.to_string(),
                at: self.now(),
            });
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/login", post(login))
        .route("/dashboard/events", get(revalidation_events))
        .route("/dashboard/customers", get(list_customers))
        .route(
            "/dashboard/invoices",
            get(list_invoices).post(create_invoice),
        )
        .route("/dashboard/invoices/:id", get(get_invoice))
        .route("/dashboard/invoices/:id/edit", post(update_invoice))
        .route("/dashboard/invoices/:id/delete", post(delete_invoice))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

/// Result of a form submission, shown next to the form.
#[derive(Debug, Serialize)]
struct FormState {
    message: Option<String>,
    errors: FieldErrors,
}

impl FormState {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            errors: FieldErrors::default(),
        }
    }
}

fn mutation_response(state: &AppState, result: Result<MutationOutcome, MutationError>) -> Response {
    match result {
        Ok(outcome) => {
            state.apply_revalidation(&outcome);
            match outcome.redirect {
                Some(location) => Redirect::to(location).into_response(),
                None => {
                    let body = FormState {
                        message: outcome.message,
                        errors: FieldErrors::default(),
                    };
                    (StatusCode::OK, Json(body)).into_response()
                }
            }
        }
        Err(MutationError::Validation { message, errors }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(FormState {
                message: Some(message.to_string()),
                errors,
            }),
        )
            .into_response(),
        Err(err @ MutationError::Database { .. }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(FormState::message(err.message())),
        )
            .into_response(),
    }
}

async fn create_invoice(State(state): State<AppState>, Form(form): Form<InvoiceForm>) -> Response {
    let result = state.invoices().create_invoice(&form).await;
    mutation_response(&state, result)
}

async fn update_invoice(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Form(form): Form<InvoiceForm>,
) -> Response {
    let result = state.invoices().update_invoice(&id, &form).await;
    mutation_response(&state, result)
}

async fn delete_invoice(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = state.invoices().delete_invoice(&id).await;
    mutation_response(&state, result)
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Invoice>, ProblemResponse> {
    let invoice = state.storage().invoices().fetch(&id).await.map_err(|err| {
        error!(stage = "storage", invoice_id = %id, error = %err, "failed to load invoice");
        ProblemResponse::internal("failed to load invoice")
    })?;

    invoice
        .map(Json)
        .ok_or_else(|| ProblemResponse::not_found(format!("invoice {id} does not exist")))
}

#[derive(Debug, Serialize)]
struct CustomerOption {
    id: String,
    name: String,
}

async fn list_customers(
    State(state): State<AppState>,
) -> Result<Json<Vec<CustomerOption>>, ProblemResponse> {
    let customers = state.storage().customers().list().await.map_err(|err| {
        error!(stage = "storage", error = %err, "failed to list customers");
        ProblemResponse::internal("failed to load customers")
    })?;

    Ok(Json(
        customers
            .into_iter()
            .map(|customer| CustomerOption {
                id: customer.id,
                name: customer.name,
            })
            .collect(),
    ))
}

async fn list_invoices(
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ProblemResponse> {
    let key = cache_key(INVOICES_PATH, raw_query.as_deref());
    if let Some(body) = state.list_cache().get(&key) {
        return Ok(cached_html(body, "hit"));
    }
    // Read before querying so a mutation that lands mid-render wins.
    let generation = state.list_cache().generation();

    let search = param(&params, "query").unwrap_or_default();
    // Anything unparsable or zero falls back to the first page.
    let requested_page = param(&params, "page")
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|page| *page > 0)
        .unwrap_or(1);

    let repo = state.storage().invoices();
    let total_pages = repo.count_pages(search).await.map_err(|err| {
        error!(stage = "storage", error = %err, "failed to count invoice pages");
        ProblemResponse::internal("failed to load invoices")
    })?;
    let plan = pagination_links(requested_page, total_pages, INVOICES_PATH, &params);
    let entries = repo
        .list_filtered(search, plan.current_page)
        .await
        .map_err(|err| {
            error!(stage = "storage", error = %err, "failed to list invoices");
            ProblemResponse::internal("failed to load invoices")
        })?;

    let body = InvoicePage::new(&entries, search, &plan)
        .render()
        .map_err(|err| {
            error!(stage = "render", error = %err, "failed to render invoice list");
            ProblemResponse::internal("failed to render invoices")
        })?;
    state.list_cache().insert(key, body.clone(), generation);
    Ok(cached_html(body, "miss"))
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn cached_html(body: String, cache: &'static str) -> Response {
    let mut response = Html(body).into_response();
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static(cache));
    response
}

async fn login(State(state): State<AppState>, Form(credentials): Form<Credentials>) -> Response {
    match state.authenticator().authenticate(&credentials).await {
        Ok(AuthOutcome::Authenticated { redirect }) => Redirect::to(redirect).into_response(),
        Ok(AuthOutcome::Rejected(message)) => (StatusCode::UNAUTHORIZED, message).into_response(),
        Err(err) => ProblemResponse::new(
            StatusCode::BAD_GATEWAY,
            "identity_provider_failure",
            err.to_string(),
        )
        .into_response(),
    }
}

async fn revalidation_events(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>> {
    Sse::new(revalidation_stream(state.revalidation())).keep_alive(revalidation_keep_alive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;
    use url::Url;

    use crate::invoices::test_support::{invoice_count, seeded_database};
    use crate::revalidate::LIST_CACHE_CAPACITY;

    struct TestContext {
        _dir: TempDir,
        identity: MockServer,
        state: AppState,
    }

    async fn setup_context() -> TestContext {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let (dir, database) = seeded_database().await;
        let identity = MockServer::start_async().await;
        let base = Url::parse(&identity.url("/")).expect("url");

        let state = AppState::new(
            metrics,
            database,
            IdentityClient::new(base, reqwest::Client::new()),
        )
        .with_clock(Arc::new(|| {
            Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap()
        }));

        TestContext {
            _dir: dir,
            identity,
            state,
        }
    }

    fn form_request(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(
                serde_urlencoded::to_string(fields).expect("encode form"),
            ))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> Response {
        app_router(state.clone())
            .oneshot(request)
            .await
            .expect("handler should respond")
    }

    async fn body_text(response: Response) -> String {
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8")
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_str(&body_text(response).await).expect("json body")
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("location header")
    }

    async fn create(state: &AppState, customer: &str, amount: &str) -> Response {
        send(
            state,
            form_request(
                "/dashboard/invoices",
                &[("customerId", customer), ("amount", amount), ("status", "pending")],
            ),
        )
        .await
    }

    async fn only_invoice_id(state: &AppState) -> String {
        let (id,): (String,) = sqlx::query_as("SELECT id FROM invoices")
            .fetch_one(state.storage().pool())
            .await
            .expect("invoice id");
        id
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let ctx = setup_context().await;
        let response = send(&ctx.state, get("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let ctx = setup_context().await;
        let response = send(&ctx.state, get("/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn create_redirects_to_list_and_stores_cents() {
        let ctx = setup_context().await;
        let response = create(&ctx.state, "c-1", "99.9").await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/dashboard/invoices");

        let id = only_invoice_id(&ctx.state).await;
        let response = send(&ctx.state, get(&format!("/dashboard/invoices/{id}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let invoice = body_json(response).await;
        assert_eq!(invoice["amount"], 9990);
        assert_eq!(invoice["status"], "pending");
        assert_eq!(invoice["date"], "2024-06-15");
    }

    #[tokio::test]
    async fn create_with_invalid_status_returns_field_errors() {
        let ctx = setup_context().await;
        let response = send(
            &ctx.state,
            form_request(
                "/dashboard/invoices",
                &[("customerId", "c-1"), ("amount", "10"), ("status", "void")],
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Missing Fields. Failed to Create Invoice.");
        assert!(body["errors"]["status"].is_array());
        assert_eq!(invoice_count(ctx.state.storage()).await, 0);
    }

    #[tokio::test]
    async fn create_for_unknown_customer_reports_database_error() {
        let ctx = setup_context().await;
        let response = create(&ctx.state, "ghost", "10").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Database Error: Failed to Create Invoice.");
    }

    #[tokio::test]
    async fn update_of_missing_invoice_reports_database_error() {
        let ctx = setup_context().await;
        let response = send(
            &ctx.state,
            form_request(
                "/dashboard/invoices/missing/edit",
                &[("customerId", "c-1"), ("amount", "1"), ("status", "paid")],
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Database Error: Failed to Update Invoice.");
    }

    #[tokio::test]
    async fn update_redirects_and_changes_row() {
        let ctx = setup_context().await;
        create(&ctx.state, "c-1", "5").await;
        let id = only_invoice_id(&ctx.state).await;

        let response = send(
            &ctx.state,
            form_request(
                &format!("/dashboard/invoices/{id}/edit"),
                &[("customerId", "c-2"), ("amount", "7.5"), ("status", "paid")],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/dashboard/invoices");

        let invoice = ctx
            .state
            .storage()
            .invoices()
            .fetch(&id)
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(invoice.customer_id, "c-2");
        assert_eq!(invoice.amount, 750);
    }

    #[tokio::test]
    async fn delete_twice_returns_message_both_times() {
        let ctx = setup_context().await;
        create(&ctx.state, "c-1", "5").await;
        let id = only_invoice_id(&ctx.state).await;
        let uri = format!("/dashboard/invoices/{id}/delete");

        for _ in 0..2 {
            let response = send(&ctx.state, form_request(&uri, &[])).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["message"], "Deleted Invoice.");
        }
        assert_eq!(invoice_count(ctx.state.storage()).await, 0);
    }

    #[tokio::test]
    async fn get_missing_invoice_is_not_found() {
        let ctx = setup_context().await;
        let response = send(&ctx.state, get("/dashboard/invoices/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn list_view_is_cached_until_a_mutation_revalidates_it() {
        let ctx = setup_context().await;

        let first = send(&ctx.state, get("/dashboard/invoices")).await;
        assert_eq!(first.headers().get("x-cache").unwrap(), "miss");
        assert!(body_text(first).await.contains("No invoices found."));

        let second = send(&ctx.state, get("/dashboard/invoices")).await;
        assert_eq!(second.headers().get("x-cache").unwrap(), "hit");

        let mut events = ctx.state.revalidation().subscribe();
        create(&ctx.state, "c-1", "1234.5").await;
        let event = events.try_recv().expect("revalidation event published");
        assert_eq!(event.path, "/dashboard/invoices");

        let third = send(&ctx.state, get("/dashboard/invoices")).await;
        assert_eq!(third.headers().get("x-cache").unwrap(), "miss");
        let html = body_text(third).await;
        assert!(html.contains("$1,234.50"));
        assert!(html.contains("Evil Rabbit"));
    }

    #[tokio::test]
    async fn list_render_overlapping_a_mutation_is_not_cached() {
        let ctx = setup_context().await;
        let generation = ctx.state.list_cache().generation();

        create(&ctx.state, "c-1", "10").await;
        let stored = ctx.state.list_cache().insert(
            cache_key(INVOICES_PATH, None),
            "<p>before the create</p>".to_string(),
            generation,
        );
        assert!(!stored);

        let response = send(&ctx.state, get("/dashboard/invoices")).await;
        assert_eq!(response.headers().get("x-cache").unwrap(), "miss");
        assert!(body_text(response).await.contains("$10.00"));
    }

    #[tokio::test]
    async fn distinct_searches_do_not_grow_the_cache_without_bound() {
        let ctx = setup_context().await;
        for i in 0..LIST_CACHE_CAPACITY + 20 {
            let uri = format!("/dashboard/invoices?query=junk{i}");
            let response = send(&ctx.state, get(&uri)).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(ctx.state.list_cache().len(), LIST_CACHE_CAPACITY);
    }

    #[tokio::test]
    async fn list_view_paginates_and_filters() {
        let ctx = setup_context().await;
        for amount in 1..=7 {
            create(&ctx.state, "c-1", &amount.to_string()).await;
        }
        create(&ctx.state, "c-2", "42").await;

        let html = body_text(send(&ctx.state, get("/dashboard/invoices?page=2")).await).await;
        assert!(html.contains("<span class=\"page last active\">2</span>"));
        assert!(html.contains("?page=1\">1</a>"));
        assert!(html.contains("arrow-right disabled"));

        let html =
            body_text(send(&ctx.state, get("/dashboard/invoices?query=delba")).await).await;
        assert!(html.contains("Delba de Oliveira"));
        assert!(!html.contains("Evil Rabbit"));
        assert!(html.contains("<span class=\"page single active\">1</span>"));
    }

    #[tokio::test]
    async fn customers_are_listed_for_the_form() {
        let ctx = setup_context().await;
        let body = body_json(send(&ctx.state, get("/dashboard/customers")).await).await;
        assert_eq!(
            body,
            json!([
                { "id": "c-2", "name": "Delba de Oliveira" },
                { "id": "c-1", "name": "Evil Rabbit" }
            ])
        );
    }

    #[tokio::test]
    async fn login_with_wrong_password_shows_invalid_credentials() {
        let ctx = setup_context().await;
        ctx.identity
            .mock_async(|when, then| {
                when.method(POST).path("/verify");
                then.status(401).json_body(json!({ "error": "CredentialsSignin" }));
            })
            .await;

        let response = send(
            &ctx.state,
            form_request(
                "/login",
                &[("email", "user@nextmail.com"), ("password", "wrong")],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(response).await, "Invalid credentials.");
    }

    #[tokio::test]
    async fn login_success_redirects_to_dashboard() {
        let ctx = setup_context().await;
        ctx.identity
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/verify")
                    .json_body(json!({ "email": "user@nextmail.com", "password": "123456" }));
                then.status(200)
                    .json_body(json!({ "user_id": "u-1", "email": "user@nextmail.com" }));
            })
            .await;

        let response = send(
            &ctx.state,
            form_request(
                "/login",
                &[("email", "user@nextmail.com"), ("password", "123456")],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/dashboard");
    }

    #[tokio::test]
    async fn login_during_provider_outage_is_a_gateway_error() {
        let ctx = setup_context().await;
        ctx.identity
            .mock_async(|when, then| {
                when.method(POST).path("/verify");
                then.status(503).body("down");
            })
            .await;

        let response = send(
            &ctx.state,
            form_request(
                "/login",
                &[("email", "user@nextmail.com"), ("password", "123456")],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["type"], "identity_provider_failure");
    }
}
