use axum::{
    extract::FromRef,
    http::{HeaderValue, Method, header},
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::{self, BasicCredentials, CredentialState, Session};
use crate::context::{OutboundResponse, RequestContext};
use crate::error::ServiceError;
use crate::routing::RouteTable;

/// InboundRequest
///
/// What the transport hands the dispatcher: method, raw path, the merged parameter map, body bytes
/// and the raw `Authorization` header if one was sent.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub params: HashMap<String, String>,
    pub body: Vec<u8>,
    pub authorization: Option<String>,
}

impl InboundRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            params: HashMap::new(),
            body: Vec::new(),
            authorization: None,
        }
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn authorization(mut self, header: impl Into<String>) -> Self {
        self.authorization = Some(header.into());
        self
    }
}

/// Dispatcher
///
/// Runs the per-request state machine over a frozen `RouteTable`:
/// credential upgrade, path resolution, method check, context build, authorization gate, execution.
/// Every stage either advances or ends the request with its status; nothing is retried.
///
/// *Note*: `dispatch` is synchronous. The transport runs it on the blocking pool since bcrypt
/// verification and handler bodies are CPU-bound.
pub struct Dispatcher<S> {
    state: S,
    routes: Arc<RouteTable<S>>,
}

impl<S: Clone> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            routes: Arc::clone(&self.routes),
        }
    }
}

impl<S> Dispatcher<S>
where
    CredentialState: FromRef<S>,
{
    pub fn new(state: S, routes: RouteTable<S>) -> Self {
        Self {
            state,
            routes: Arc::new(routes),
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn routes(&self) -> &RouteTable<S> {
        &self.routes
    }

    /// dispatch
    ///
    /// Handles one request against `session`, which may be upgraded as a side effect.
    /// Always produces a response; failures are rendered as `{"error": ...}` with their status.
    pub fn dispatch(&self, request: InboundRequest, session: &Arc<Session>) -> OutboundResponse {
        if let Err(err) = self.upgrade_session(request.authorization.as_deref(), session) {
            return OutboundResponse::from_error(&err);
        }

        let Some((path, excess)) = self.routes.resolve(&request.path) else {
            tracing::debug!(path = %request.path, "no route matches");
            return OutboundResponse::from_error(&ServiceError::NotFound);
        };

        let allow = self
            .routes
            .methods_for(path)
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let mut response = self.route(&request, path, excess, session);
        if let Ok(value) = HeaderValue::from_str(&allow) {
            response.headers.insert(header::ALLOW, value);
        }
        response
    }

    fn route(
        &self,
        request: &InboundRequest,
        path: &str,
        excess: String,
        session: &Arc<Session>,
    ) -> OutboundResponse {
        let Some(route) = self.routes.handler_for(&request.method, path) else {
            if request.method == Method::OPTIONS {
                let mut response = OutboundResponse::default();
                if let Some(doc) = self.routes.discovery(path) {
                    response.headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                    response.body = doc.to_string().into_bytes();
                }
                return response;
            }
            tracing::debug!(method = %request.method, path, "method not allowed");
            return OutboundResponse::from_error(&ServiceError::MethodNotAllowed);
        };

        let outcome = RequestContext::build(
            route,
            excess,
            request.params.clone(),
            request.body.clone(),
            Arc::clone(session),
        )
        .and_then(|context| {
            context.authorize()?;
            Ok(context)
        })
        .and_then(|mut context| {
            tracing::debug!(
                route = route.name(),
                excess = context.excess_path(),
                level = %context.session_level(),
                "executing handler"
            );
            route.invoke(&self.state, &mut context)?;
            Ok(context.into_response())
        });

        let mut response = outcome.unwrap_or_else(|err| {
            match &err {
                ServiceError::Internal(reason) => {
                    tracing::error!(route = route.name(), %reason, "handler failed")
                }
                other => tracing::debug!(route = route.name(), error = %other, "request rejected"),
            }
            OutboundResponse::from_error(&err)
        });
        if route.result_varies() {
            response
                .headers
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
        }
        response
    }

    /// Applies an `Authorization` header to the session. Absent or malformed headers are skipped;
    /// a well-formed header matching no account is `Unauthenticated`.
    fn upgrade_session(&self, header: Option<&str>, session: &Session) -> Result<(), ServiceError> {
        let Some(basic) = header.and_then(BasicCredentials::parse) else {
            return Ok(());
        };
        let credentials = CredentialState::from_ref(&self.state);
        match auth::authenticate(&credentials, &basic.email, &basic.password) {
            Some((account, level)) => {
                if session.upgrade_account(level, account) {
                    tracing::info!(email = %basic.email, account, %level, "session upgraded");
                }
                Ok(())
            }
            None => {
                tracing::warn!(email = %basic.email, "credentials rejected");
                Err(ServiceError::Unauthenticated)
            }
        }
    }
}
