use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{FromRef, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, header, request::Parts},
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use std::collections::HashMap;
use std::sync::Arc;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};
use uuid::Uuid;

// --- Module Structure ---

// Core framework: identity registries, views, snapshots, routing and dispatch.
pub mod auth;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod routing;
pub mod snapshot;
pub mod views;

// The project showcase application built on top of it.
pub mod config;
pub mod handlers;
pub mod models;
pub mod routes;

use auth::{AuthLevel, Credential, CredentialState, SessionStore};
use context::OutboundResponse;
use dispatch::{Dispatcher, InboundRequest};
use error::{ServiceError, StartupError};
use models::Project;
use registry::IdentityRegistry;
use routing::RouteTable;
use snapshot::SnapshotStore;

// --- Public Re-exports ---

pub use config::AppConfig;

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "synchrony_session";

/// Largest request body the transport buffers before dispatch.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// ProjectState
///
/// The registry of every submitted project.
pub type ProjectState = Arc<IdentityRegistry<Project>>;

/// AppState
///
/// The application context: one typed registry handle per entity type plus the immutable
/// configuration. Cloning is cheap; every clone shares the same registries.
#[derive(Clone)]
pub struct AppState {
    pub credentials: CredentialState,
    pub projects: ProjectState,
    pub config: AppConfig,
}

// --- Axum FromRef Extractor Implementations ---

// These let the dispatcher and handlers pull single components out of the shared AppState.

impl FromRef<AppState> for CredentialState {
    fn from_ref(app_state: &AppState) -> CredentialState {
        app_state.credentials.clone()
    }
}

impl FromRef<AppState> for ProjectState {
    fn from_ref(app_state: &AppState) -> ProjectState {
        app_state.projects.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

impl AppState {
    /// Empty registries, as on a first run.
    pub fn new(config: AppConfig) -> Self {
        Self {
            credentials: Arc::new(IdentityRegistry::new()),
            projects: Arc::new(IdentityRegistry::new()),
            config,
        }
    }

    /// load
    ///
    /// Hydrates every registry from `store` and seeds the bootstrap admin into an empty
    /// credential registry.
    ///
    /// *Fail-fast*: a snapshot that exists but cannot be decoded is an error. The caller must not
    /// start serving with an empty registry in its place.
    pub fn load(store: &SnapshotStore, config: &AppConfig) -> Result<Self, StartupError> {
        let credentials = store.load::<Credential>()?.unwrap_or_default();
        let projects = store.load::<Project>()?.unwrap_or_default();
        let state = Self {
            credentials: Arc::new(credentials),
            projects: Arc::new(projects),
            config: config.clone(),
        };
        state.seed_admin()?;
        Ok(state)
    }

    /// Saves every registry. Call only once traffic has drained.
    pub fn persist(&self, store: &SnapshotStore) -> Result<(), StartupError> {
        store.save(&*self.credentials)?;
        store.save(&*self.projects)?;
        Ok(())
    }

    fn seed_admin(&self) -> Result<(), StartupError> {
        let Some((email, password)) = self.config.bootstrap_admin() else {
            return Ok(());
        };
        if !self.credentials.is_empty() {
            return Ok(());
        }
        let mut admin = Credential::new(email, password, self.config.bcrypt_cost)?;
        admin.set_level(AuthLevel::Admin);
        let record = self.credentials.insert(admin)?;
        tracing::info!(id = record.id(), %email, "bootstrap admin seeded");
        Ok(())
    }
}

/// HttpState
///
/// What the axum fallback handler needs: the dispatcher with its frozen route table and the
/// transport-owned session store.
#[derive(Clone)]
struct HttpState {
    dispatcher: Dispatcher<AppState>,
    sessions: SessionStore,
}

/// create_router
///
/// Freezes the application's route table into a dispatcher, mounts it as the single fallback
/// service and wraps it in the observability layers.
pub fn create_router(state: AppState) -> Router {
    let routes = RouteTable::from_routes(routes::all_routes());
    tracing::debug!(routes = routes.len(), "route table frozen");

    let http_state = HttpState {
        dispatcher: Dispatcher::new(state, routes),
        sessions: SessionStore::new(),
    };

    // 1. CORS Configuration (applied in step 2)
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    // Header name constant for Request Correlation.
    let x_request_id = HeaderName::from_static("x-request-id");

    // 2. Every path goes through the dispatcher, which owns resolution, 404 and 405.
    let base_router = Router::new()
        .fallback(serve_request)
        .with_state(http_state);

    // CorsLayer answers every OPTIONS request itself, so only genuine preflights (those carrying
    // Access-Control-Request-Method) go through it; plain OPTIONS reaches route discovery.
    let with_cors = base_router.clone().layer(cors);
    let cors_router = Router::new().fallback_service(tower::service_fn(move |request: Request| {
        let target = if is_discovery(&request) {
            base_router.clone()
        } else {
            with_cors.clone()
        };
        target.oneshot(request)
    }));

    // 3. Observability and Correlation Layers
    cors_router.layer(
        ServiceBuilder::new()
            // 3a. Request ID Generation: a UUID for every incoming request.
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            // 3b. Request Tracing: one span per request, carrying the request ID.
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(trace_span_logger)
                    .on_response(
                        DefaultOnResponse::new()
                            .level(Level::INFO)
                            .latency_unit(tower_http::LatencyUnit::Millis),
                    ),
            )
            // 3c. Request ID Propagation back to the client.
            .layer(PropagateRequestIdLayer::new(x_request_id)),
    )
}

/// An `OPTIONS` request that is not a CORS preflight.
fn is_discovery(request: &Request) -> bool {
    request.method() == Method::OPTIONS
        && !request
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

/// serve_request
///
/// The transport adapter: turns an axum request into an `InboundRequest`, attaches the cookie
/// session, runs the dispatcher on the blocking pool and writes the `OutboundResponse` back.
async fn serve_request(State(http): State<HttpState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            tracing::warn!(error = %err, "request body rejected");
            let rejection = if exceeds_body_limit(&err) {
                ServiceError::PayloadTooLarge
            } else {
                ServiceError::bad_request("request body unreadable")
            };
            return OutboundResponse::from_error(&rejection).into_response();
        }
    };

    let (known_id, session) = http.sessions.resolve(session_cookie(&parts.headers));
    let inbound = InboundRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        params: request_params(&parts, &body),
        body,
        authorization: parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };

    let dispatcher = http.dispatcher.clone();
    let dispatched = Arc::clone(&session);
    let outcome =
        tokio::task::spawn_blocking(move || dispatcher.dispatch(inbound, &dispatched)).await;
    let mut response = outcome.unwrap_or_else(|err| {
        tracing::error!(error = %err, "dispatch task failed");
        OutboundResponse::from_error(&ServiceError::Internal("request handler failed".into()))
    });

    // A cookie is only issued once the session has something to remember.
    let issued = match known_id {
        Some(_) => None,
        None => http.sessions.retain(&session),
    };
    if let Some(session_id) = issued {
        let cookie = format!("{SESSION_COOKIE}={session_id}; HttpOnly; Path=/");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers.append(header::SET_COOKIE, value);
        }
    }
    response.into_response()
}

/// Whether a body read failed on `MAX_BODY_BYTES` rather than on the transport.
fn exceeds_body_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

/// The session id from the `Cookie` header(s), if one parses.
fn session_cookie(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE)?.strip_prefix('='))
        .find_map(|id| Uuid::parse_str(id.trim()).ok())
}

/// request_params
///
/// Merges URL-encoded form bodies and the query string into one parameter map. The query string
/// wins when both carry the same key.
fn request_params(parts: &Parts, body: &[u8]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let is_form = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        params.extend(url::form_urlencoded::parse(body).into_owned());
    }
    if let Some(query) = parts.uri.query() {
        params.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
    }
    params
}

/// trace_span_logger
///
/// Used by `TraceLayer` to open one span per request carrying method, URI and the `x-request-id`
/// header, so every log line of a request can be correlated.
fn trace_span_logger(request: &axum::http::Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}

/// shutdown_signal
///
/// Resolves on Ctrl+C or SIGTERM. Passed to `with_graceful_shutdown` so in-flight requests
/// finish before the registries are snapshotted.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "unable to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    fn parts(uri: &str, content_type: Option<&str>) -> Parts {
        let mut builder = HttpRequest::builder().method(Method::POST).uri(uri);
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn query_string_wins_over_form_body() {
        let params = request_params(
            &parts("/register?email=q%40example.com", Some("application/x-www-form-urlencoded")),
            b"email=b%40example.com&password=secret+pw",
        );
        assert_eq!(params["email"], "q@example.com");
        assert_eq!(params["password"], "secret pw");
    }

    #[test]
    fn non_form_bodies_are_not_parsed_as_parameters() {
        let params = request_params(&parts("/projects", Some("application/json")), b"title=x");
        assert!(params.is_empty());
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={id}")).unwrap(),
        );
        assert_eq!(session_cookie(&headers), Some(id));

        headers.insert(header::COOKIE, HeaderValue::from_static("synchrony_session=garbage"));
        assert_eq!(session_cookie(&headers), None);
    }

    #[test]
    fn bootstrap_admin_is_seeded_only_into_empty_registries() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let config = AppConfig {
            admin_email: Some("root@example.com".into()),
            admin_password: Some("rootpassword".into()),
            ..AppConfig::default()
        };

        let state = AppState::load(&store, &config).unwrap();
        assert_eq!(state.credentials.len(), 1);
        assert_eq!(
            auth::authenticate(&state.credentials, "root@example.com", "rootpassword").map(|(_, level)| level),
            Some(AuthLevel::Admin)
        );
        state.persist(&store).unwrap();

        let reloaded = AppState::load(&store, &config).unwrap();
        assert_eq!(reloaded.credentials.len(), 1);
        assert_eq!(reloaded.credentials.allocation(), 1);
    }
}
