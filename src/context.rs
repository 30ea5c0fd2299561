use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::auth::{AuthLevel, Session};
use crate::error::{ServiceError, ServiceResult};
use crate::registry::Identity;
use crate::routing::Route;
use crate::views::{self, Persistent, ViewError, WILDCARD_VIEW};

/// OutboundResponse
///
/// The transport-neutral response produced by one dispatch: status, headers and body bytes.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Default for OutboundResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }
}

impl OutboundResponse {
    /// A JSON `{"error": ...}` body with the status belonging to `err`. Internal failures get a
    /// generic message; callers log the detail.
    pub fn from_error(err: &ServiceError) -> Self {
        let mut response = Self {
            status: err.status(),
            ..Self::default()
        };
        response.write_json_value(&json!({ "error": err.public_message() }));
        response
    }

    pub fn header(&self, name: impl axum::http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parses the body as JSON; `Value::Null` when empty or not JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    fn write_json_value(&mut self, value: &Value) {
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = value.to_string().into_bytes();
    }
}

impl IntoResponse for OutboundResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// RequestContext
///
/// Everything a handler may touch for one request: the declared parameters (validated, defaults
/// applied), the excess path, the raw body, the session, and the response being written.
pub struct RequestContext {
    excess_path: String,
    params: HashMap<String, Option<String>>,
    body: Vec<u8>,
    session: Arc<Session>,
    required: AuthLevel,
    response: OutboundResponse,
}

impl RequestContext {
    /// build
    ///
    /// Collects the parameters `route` declares. Fails with `BadRequest` if a required parameter
    /// is missing; optional parameters absent from the request take their declared default.
    pub fn build<S>(
        route: &Route<S>,
        excess_path: String,
        mut supplied: HashMap<String, String>,
        body: Vec<u8>,
        session: Arc<Session>,
    ) -> ServiceResult<Self> {
        let mut params = HashMap::new();
        for key in route.required_parameters() {
            let value = supplied
                .remove(key)
                .ok_or_else(|| ServiceError::bad_request(format!("missing required parameter `{key}`")))?;
            params.insert(key.clone(), Some(value));
        }
        for (key, default) in route.optional_parameters() {
            let value = supplied.remove(key).or_else(|| default.clone());
            params.insert(key.clone(), value);
        }
        Ok(Self {
            excess_path,
            params,
            body,
            session,
            required: route.level(),
            response: OutboundResponse::default(),
        })
    }

    /// authorize
    ///
    /// Compares the session level to the route's minimum. An anonymous session is
    /// `Unauthenticated`; a signed-in one below the minimum is `Forbidden`.
    pub fn authorize(&self) -> ServiceResult {
        let level = self.session.level();
        if level >= self.required {
            Ok(())
        } else if level == AuthLevel::None {
            Err(ServiceError::Unauthenticated)
        } else {
            Err(ServiceError::Forbidden)
        }
    }

    // --- Request side ---

    /// The unmatched path remainder, e.g. `/42/comments`. Empty on an exact match.
    pub fn excess_path(&self) -> &str {
        &self.excess_path
    }

    /// Non-empty segments of the excess path.
    pub fn excess_segments(&self) -> Vec<&str> {
        self.excess_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    /// Parses the first excess segment, e.g. the `42` in `items/42`.
    pub fn excess_id<T: FromStr>(&self) -> ServiceResult<Option<T>> {
        match self.excess_segments().first() {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ServiceError::bad_request(format!("`{raw}` is not a valid identifier"))),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_deref())
    }

    /// A declared parameter converted to `T`. Absent or unparseable values are `BadRequest`.
    pub fn parse_param<T: FromStr>(&self, key: &str) -> ServiceResult<T> {
        let raw = self
            .param(key)
            .ok_or_else(|| ServiceError::bad_request(format!("missing parameter `{key}`")))?;
        raw.parse()
            .map_err(|_| ServiceError::bad_request(format!("invalid value for `{key}`: `{raw}`")))
    }

    /// Like `parse_param`, but `None` when the parameter is absent.
    pub fn parse_optional<T: FromStr>(&self, key: &str) -> ServiceResult<Option<T>> {
        match self.param(key) {
            None => Ok(None),
            Some(_) => self.parse_param(key).map(Some),
        }
    }

    /// Presence check for flag-style parameters.
    pub fn flag(&self, key: &str) -> bool {
        self.param(key).is_some()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> ServiceResult<&str> {
        std::str::from_utf8(&self.body).map_err(|_| ServiceError::bad_request("body is not UTF-8"))
    }

    pub fn json_body<T: DeserializeOwned>(&self) -> ServiceResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ServiceError::bad_request(format!("malformed JSON body: {e}")))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Identity of the credential that authenticated this session, if any.
    pub fn account(&self) -> Option<Identity> {
        self.session.account()
    }

    pub fn session_level(&self) -> AuthLevel {
        self.session.level()
    }

    pub fn authenticated(&self, level: AuthLevel) -> bool {
        self.session.authenticated(level)
    }

    /// Raises the session level for this and every later request on the same session.
    /// Never lowers it.
    pub fn upgrade_session(&self, level: AuthLevel) -> bool {
        self.session.upgrade(level)
    }

    // --- Response side ---

    pub fn set_status(&mut self, status: StatusCode) {
        self.response.status = status;
    }

    pub fn set_header(&mut self, name: HeaderName, value: &str) -> ServiceResult {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ServiceError::Internal(format!("invalid header value: {e}")))?;
        self.response.headers.insert(name, value);
        Ok(())
    }

    /// Sets the response `Content-Type`.
    pub fn mark_as(&mut self, mime: &str) -> ServiceResult {
        self.set_header(header::CONTENT_TYPE, mime)
    }

    pub fn send_json<T: Serialize>(&mut self, value: &T) -> ServiceResult {
        let value = serde_json::to_value(value).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.response.write_json_value(&value);
        Ok(())
    }

    /// Renders `entity` at `view`. The wildcard view is reserved for snapshots and refused here.
    pub fn send_entity<E: Persistent>(&mut self, entity: &E, view: &str) -> ServiceResult {
        if view == WILDCARD_VIEW {
            return Err(ViewError::ReservedView.into());
        }
        let value = views::encode(entity, view)?;
        self.response.write_json_value(&value);
        Ok(())
    }

    /// Renders every entity at `view` as a JSON array.
    pub fn send_entities<'a, E, I>(&mut self, entities: I, view: &str) -> ServiceResult
    where
        E: Persistent,
        I: IntoIterator<Item = &'a E>,
    {
        if view == WILDCARD_VIEW {
            return Err(ViewError::ReservedView.into());
        }
        let values = entities
            .into_iter()
            .map(|entity| views::encode(entity, view))
            .collect::<Result<Vec<_>, _>>()?;
        self.response.write_json_value(&Value::Array(values));
        Ok(())
    }

    pub fn send_text(&mut self, text: &str) -> ServiceResult {
        self.mark_as("text/plain; charset=utf-8")?;
        self.response.body = text.as_bytes().to_vec();
        Ok(())
    }

    pub fn send_bytes(&mut self, bytes: Vec<u8>) {
        self.response.body = bytes;
    }

    /// Ends the response with `status` and a JSON error body, for outcomes that are not
    /// `ServiceError`s (e.g. `409 Conflict`).
    pub fn error(&mut self, status: StatusCode, message: &str) {
        self.response.status = status;
        self.response.write_json_value(&json!({ "error": message }));
    }

    pub fn into_response(self) -> OutboundResponse {
        self.response
    }
}
