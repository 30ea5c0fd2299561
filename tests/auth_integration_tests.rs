use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use synchrony::{
    AppConfig, AppState, SESSION_COOKIE,
    auth::{AuthLevel, BasicCredentials, Credential},
    create_router,
};
use tower::ServiceExt;

// --- Test Utilities ---

const PASSWORD: &str = "password123";

fn create_app_state() -> AppState {
    let state = AppState::new(AppConfig::default());
    for (email, level) in [
        ("user@example.com", AuthLevel::User),
        ("admin@example.com", AuthLevel::Admin),
    ] {
        let mut credential = Credential::new(email, PASSWORD, state.config.bcrypt_cost).unwrap();
        credential.set_level(level);
        state.credentials.insert(credential).unwrap();
    }
    state
}

fn basic(email: &str, password: &str) -> String {
    BasicCredentials {
        email: email.into(),
        password: password.into(),
    }
    .to_header()
}

async fn get(router: &Router, uri: &str, headers: &[(header::HeaderName, String)]) -> Response {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// The `name=value` pair of the session cookie set on `response`.
fn session_cookie(response: &Response) -> String {
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("a new session sets its cookie")
        .to_str()
        .unwrap();
    assert!(set_cookie.contains("HttpOnly"));
    set_cookie.split(';').next().unwrap().to_string()
}

// --- Tests ---

#[tokio::test]
async fn test_session_cookie_carries_the_authenticated_level() {
    let router = create_router(create_app_state());

    let first = get(
        &router,
        "/me",
        &[(header::AUTHORIZATION, basic("user@example.com", PASSWORD))],
    )
    .await;
    assert_eq!(first.status(), StatusCode::OK);
    let cookie = session_cookie(&first);
    assert!(cookie.starts_with(SESSION_COOKIE));

    // No credentials this time: the session remembers the level.
    let second = get(&router, "/me", &[(header::COOKIE, cookie.clone())]).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert!(second.headers().get(header::SET_COOKIE).is_none());

    // Without the cookie the request is anonymous again.
    let third = get(&router, "/me", &[]).await;
    assert_eq!(third.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_anonymous_traffic_gets_no_session() {
    let router = create_router(create_app_state());

    for uri in ["/nope", "/projects", "/me", "/admin/projects"] {
        for _ in 0..25 {
            let response = get(&router, uri, &[]).await;
            assert!(
                response.headers().get(header::SET_COOKIE).is_none(),
                "{uri} issued a session"
            );
        }
    }

    // A rejected credential proves nothing either.
    let rejected = get(
        &router,
        "/projects",
        &[(header::AUTHORIZATION, basic("user@example.com", "not-the-password"))],
    )
    .await;
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert!(rejected.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn test_session_upgrade_never_downgrades() {
    let router = create_router(create_app_state());

    let admin = get(
        &router,
        "/admin/projects",
        &[(header::AUTHORIZATION, basic("admin@example.com", PASSWORD))],
    )
    .await;
    assert_eq!(admin.status(), StatusCode::OK);
    let cookie = session_cookie(&admin);

    // A weaker credential on the same session keeps the admin level.
    let weaker = get(
        &router,
        "/admin/projects",
        &[
            (header::COOKIE, cookie.clone()),
            (header::AUTHORIZATION, basic("user@example.com", PASSWORD)),
        ],
    )
    .await;
    assert_eq!(weaker.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_wrong_password_is_rejected_even_on_public_routes() {
    let router = create_router(create_app_state());

    let response = get(
        &router,
        "/projects",
        &[(header::AUTHORIZATION, basic("user@example.com", "not-the-password"))],
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let unknown = get(
        &router,
        "/projects",
        &[(header::AUTHORIZATION, basic("nobody@example.com", PASSWORD))],
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_authorization_headers_are_anonymous() {
    let router = create_router(create_app_state());

    let headers = [
        "Bearer some.jwt.token".to_string(),
        "Basic not-base64!".to_string(),
        format!("Basic {}", STANDARD.encode("missing-colon")),
        format!("Basic {}", STANDARD.encode("a:b:c")),
    ];
    for value in headers {
        let public = get(&router, "/projects", &[(header::AUTHORIZATION, value.clone())]).await;
        assert_eq!(public.status(), StatusCode::OK, "public route with {value:?}");

        let protected = get(&router, "/me", &[(header::AUTHORIZATION, value.clone())]).await;
        assert_eq!(protected.status(), StatusCode::UNAUTHORIZED, "/me with {value:?}");
    }
}

#[tokio::test]
async fn test_insufficient_level_is_forbidden() {
    let router = create_router(create_app_state());
    let response = get(
        &router,
        "/admin/projects",
        &[(header::AUTHORIZATION, basic("user@example.com", PASSWORD))],
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_request_ids_are_propagated() {
    let router = create_router(create_app_state());
    let response = get(&router, "/projects", &[]).await;
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_cors_preflight_is_answered_but_discovery_is_not_shadowed() {
    let router = create_router(create_app_state());

    let preflight = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/projects")
                .header(header::ORIGIN, "https://example.org")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(preflight
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

    let discovery = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/projects")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(discovery.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(discovery.into_body(), usize::MAX)
        .await
        .unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(doc["GET"]["name"], "Projects");
}
