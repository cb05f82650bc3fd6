//! Auth gate and the login-flow handlers
//!
//! For a routed request the gate ends in one of three places: the route needs
//! no authentication, a verified identity is attached, or the gate answers the
//! request itself (login redirect, CSRF rejection, provider outage while
//! starting a login). A credential that fails verification for any reason,
//! including an unreachable provider, is treated as absent. The
//! reserved `/auth/*` paths never reach the routing table and are answered
//! here directly.

use crate::metrics::AuthDecision;
use crate::response::{json, redirect, text, with_cookies, GatewayBody};
use crate::settings::GatewaySettings;
use gateway_auth::cookies::{decode_redirect, find_cookie};
use gateway_auth::csrf::{self, CsrfInputs, CSRF_HEADER};
use gateway_auth::{
    random_token, CookieFactory, CorrelationState, ProviderHandle, StateVerifier,
};
use gateway_core::{GatewayError, Identity};
use hyper::header::{AUTHORIZATION, COOKIE, HOST, ORIGIN, REFERER};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Where the gate left a routed request
pub enum GateOutcome {
    /// Forward without identity
    Skipped,
    /// Forward with identity headers
    Authenticated { identity: Identity, credential: String },
    /// The gate produced the response
    Respond(AuthDecision, Response<GatewayBody>),
}

pub struct AuthGate {
    settings: Arc<GatewaySettings>,
    cookies: CookieFactory,
    verifier: StateVerifier,
}

impl AuthGate {
    pub fn new(settings: Arc<GatewaySettings>) -> Self {
        let cookies = CookieFactory::new(settings.cookies.clone(), settings.tls);
        Self {
            settings,
            cookies,
            verifier: StateVerifier::default(),
        }
    }

    /// Decide what happens to a request matched to a route
    pub async fn evaluate(
        &self,
        parts: &Parts,
        auth_required: bool,
        provider: &ProviderHandle,
    ) -> GateOutcome {
        if !auth_required || !provider.is_enabled() {
            return GateOutcome::Skipped;
        }

        let session = self.cookie(parts, &self.settings.cookies.session);
        if session.is_some() && csrf::is_state_changing(parts.method.as_str()) {
            if let Err(e) = self.check_csrf(parts) {
                debug!(error = %e, "CSRF check failed");
                return GateOutcome::Respond(
                    AuthDecision::Rejected,
                    text(StatusCode::BAD_REQUEST, "CSRF check failed\n"),
                );
            }
        }

        if let Some(credential) = session.or_else(|| bearer_token(parts)) {
            match provider.validate(&credential).await {
                Ok(identity) => {
                    return GateOutcome::Authenticated {
                        identity,
                        credential,
                    }
                }
                // Any credential that cannot be verified restarts the login
                Err(e) if e.is_unauthenticated() => debug!(error = %e, "Credential rejected"),
                Err(e) => warn!(provider = provider.name(), error = %e, "Credential check failed"),
            }
        }

        let original = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        self.start_login(provider, &sanitize_local_path(original)).await
    }

    /// Answer one of the reserved auth paths
    pub async fn handle_auth_path(&self, parts: &Parts, provider: &ProviderHandle) -> Response<GatewayBody> {
        let paths = &self.settings.paths;
        let path = parts.uri.path();

        if path == paths.login {
            self.login(parts, provider).await
        } else if path == paths.callback {
            self.callback(parts, provider).await
        } else if path == paths.logout {
            self.logout(parts, provider)
        } else if path == paths.info {
            self.info(parts, provider).await
        } else if path == paths.error {
            let reason = query_param(parts, "reason").unwrap_or(Cow::Borrowed("unknown"));
            let reason: String = reason.chars().filter(|c| !c.is_control()).take(200).collect();
            text(
                StatusCode::UNAUTHORIZED,
                format!("Authentication failed: {}\n", reason),
            )
        } else {
            text(StatusCode::NOT_FOUND, "Not Found\n")
        }
    }

    async fn login(&self, parts: &Parts, provider: &ProviderHandle) -> Response<GatewayBody> {
        if !provider.is_enabled() {
            return text(StatusCode::NOT_FOUND, "Authentication is not configured\n");
        }
        let target = query_param(parts, "redirect_uri")
            .map(|raw| sanitize_local_path(&raw))
            .unwrap_or_else(|| "/".to_string());
        let GateOutcome::Respond(_, response) = self.start_login(provider, &target).await else {
            return text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n");
        };
        response
    }

    /// Mint correlation state and send the browser to the provider
    async fn start_login(&self, provider: &ProviderHandle, original: &str) -> GateOutcome {
        let state = CorrelationState::mint(original);
        match provider.login_url(&state.token, original).await {
            Ok(url) => {
                debug!(provider = provider.name(), "Redirecting to login");
                let response = with_cookies(
                    redirect(url.as_str()),
                    [
                        self.cookies.state(&state.cookie_value()),
                        self.cookies.redirect(&state.original_url),
                    ],
                );
                GateOutcome::Respond(AuthDecision::Redirected, response)
            }
            Err(GatewayError::NotConfigured) => GateOutcome::Respond(
                AuthDecision::Rejected,
                text(StatusCode::NOT_FOUND, "Authentication is not configured\n"),
            ),
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "Cannot build login URL");
                GateOutcome::Respond(AuthDecision::Unavailable, unavailable())
            }
        }
    }

    async fn callback(&self, parts: &Parts, provider: &ProviderHandle) -> Response<GatewayBody> {
        let names = self.cookies.names();
        let state_cookie = self.cookie(parts, &names.state);
        let redirect_cookie = self.cookie(parts, &names.redirect);
        let mut cookies = vec![self.cookies.expire(&names.state), self.cookies.expire(&names.redirect)];

        if !provider.is_enabled() {
            return with_cookies(
                text(StatusCode::NOT_FOUND, "Authentication is not configured\n"),
                cookies,
            );
        }

        let presented = query_param(parts, "state");
        if let Err(e) = self.verifier.verify(presented.as_deref(), state_cookie.as_deref()) {
            info!(error = %e, "Rejected login callback");
            return with_cookies(text(StatusCode::BAD_REQUEST, "Invalid login state\n"), cookies);
        }

        if let Some(error) = query_param(parts, "error") {
            warn!(provider = provider.name(), error = %error, "Provider returned an error");
            return with_cookies(redirect(&self.error_location(&error)), cookies);
        }

        let Some(code) = query_param(parts, "code").filter(|c| !c.is_empty()) else {
            return with_cookies(redirect(&self.error_location("missing_code")), cookies);
        };

        match provider.complete_login(&code).await {
            Ok(outcome) => {
                info!(
                    provider = provider.name(),
                    user = %outcome.identity.username,
                    groups = outcome.identity.groups.len(),
                    "Login completed"
                );
                let max_age = outcome
                    .expires_in
                    .map(|lifetime| lifetime.min(self.settings.session_max_age))
                    .unwrap_or(self.settings.session_max_age);
                cookies.push(self.cookies.session(&outcome.session_token, max_age));
                cookies.push(self.cookies.csrf(&random_token(), max_age));

                let target = redirect_cookie
                    .as_deref()
                    .and_then(decode_redirect)
                    .map(|path| sanitize_local_path(&path))
                    .unwrap_or_else(|| "/".to_string());
                with_cookies(redirect(&target), cookies)
            }
            Err(GatewayError::ProviderUnavailable(reason)) => {
                warn!(provider = provider.name(), reason = %reason, "Token exchange failed");
                with_cookies(unavailable(), cookies)
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "Login rejected");
                with_cookies(redirect(&self.error_location("login_failed")), cookies)
            }
        }
    }

    /// Clear the local session; hand off to the provider when it has a logout endpoint
    fn logout(&self, parts: &Parts, provider: &ProviderHandle) -> Response<GatewayBody> {
        let names = self.cookies.names();
        let cookies = [self.cookies.expire(&names.session), self.cookies.expire(&names.csrf)];
        let post_logout = query_param(parts, "redirect_uri")
            .map(|raw| sanitize_local_path(&raw))
            .unwrap_or_else(|| "/".to_string());

        let remote = if provider.is_enabled() {
            provider.logout_url(&self.settings.absolute_url(&post_logout))
        } else {
            None
        };
        match remote {
            Some(url) => with_cookies(redirect(&url), cookies),
            None => with_cookies(text(StatusCode::OK, "Logged out\n"), cookies),
        }
    }

    async fn info(&self, parts: &Parts, provider: &ProviderHandle) -> Response<GatewayBody> {
        let credential = self
            .cookie(parts, &self.settings.cookies.session)
            .or_else(|| bearer_token(parts));

        let identity = match credential {
            Some(credential) if provider.is_enabled() => provider.validate(&credential).await.ok(),
            _ => None,
        };

        let body = AuthInfo {
            authenticated: identity.is_some(),
            user: identity.as_ref().map(|identity| UserInfo {
                username: &identity.username,
                email: identity.email.as_deref(),
                groups: &identity.groups,
            }),
        };
        json(StatusCode::OK, &body)
    }

    fn check_csrf(&self, parts: &Parts) -> gateway_core::Result<()> {
        let host = header_str(parts, HOST.as_str()).or_else(|| parts.uri.authority().map(|a| a.as_str()));
        let cookie_token = self.cookie(parts, &self.settings.cookies.csrf);
        csrf::check(&CsrfInputs {
            host,
            origin: header_str(parts, ORIGIN.as_str()),
            referer: header_str(parts, REFERER.as_str()),
            header_token: header_str(parts, CSRF_HEADER),
            cookie_token: cookie_token.as_deref(),
        })
    }

    fn cookie(&self, parts: &Parts, name: &str) -> Option<String> {
        find_cookie(
            parts.headers.get_all(COOKIE).iter().filter_map(|v| v.to_str().ok()),
            name,
        )
        .filter(|value| !value.is_empty())
    }

    fn error_location(&self, reason: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(reason.as_bytes()).collect();
        format!("{}?reason={}", self.settings.paths.error, encoded)
    }
}

#[derive(Serialize)]
struct AuthInfo<'a> {
    authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserInfo<'a>>,
}

#[derive(Serialize)]
struct UserInfo<'a> {
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    groups: &'a [String],
}

fn unavailable() -> Response<GatewayBody> {
    text(
        StatusCode::SERVICE_UNAVAILABLE,
        "Authentication service unavailable\n",
    )
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn query_param<'a>(parts: &'a Parts, name: &str) -> Option<Cow<'a, str>> {
    let query = parts.uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

/// Keep only same-origin absolute paths as redirect targets
pub fn sanitize_local_path(raw: &str) -> String {
    let local = raw.starts_with('/')
        && !raw.starts_with("//")
        && !raw.starts_with("/\\")
        && !raw.chars().any(|c| c.is_control());
    if local {
        raw.to_string()
    } else {
        "/".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_auth::{AuthProvider, DisabledProvider, LoginOutcome, ProviderContext, StaticProvider};
    use gateway_core::StaticIdentityConfig;
    use hyper::header::{LOCATION, SET_COOKIE};
    use hyper::{Method, Request};
    use url::Url;

    /// Issuer whose authorize endpoint is known but whose verification backend is down
    struct UnreachableVerifier;

    #[async_trait::async_trait]
    impl AuthProvider for UnreachableVerifier {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn login_url(&self, state: &str, _post_login_path: &str) -> gateway_core::Result<Url> {
            let mut url = Url::parse("https://idp.example.com/authorize").unwrap();
            url.query_pairs_mut().append_pair("state", state);
            Ok(url)
        }

        async fn complete_login(&self, _code: &str) -> gateway_core::Result<LoginOutcome> {
            Err(GatewayError::ProviderUnavailable("connection refused".to_string()))
        }

        async fn validate(&self, _token: &str) -> gateway_core::Result<Identity> {
            Err(GatewayError::ProviderUnavailable("connection refused".to_string()))
        }

        fn logout_url(&self, _post_logout_path: &str) -> Option<String> {
            None
        }
    }

    fn gate() -> AuthGate {
        AuthGate::new(Arc::new(GatewaySettings::default()))
    }

    fn static_provider() -> ProviderHandle {
        let config = StaticIdentityConfig {
            username: "dev".to_string(),
            email: None,
            groups: vec!["devs".to_string()],
            subject: None,
        };
        Arc::new(StaticProvider::new(
            config,
            &ProviderContext::new("http://localhost:8080/auth/callback"),
        ))
    }

    fn parts(method: Method, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn set_cookies(response: &Response<GatewayBody>) -> Vec<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_sanitize_local_path() {
        assert_eq!(sanitize_local_path("/app/x?y=1"), "/app/x?y=1");
        assert_eq!(sanitize_local_path("//evil.example.com"), "/");
        assert_eq!(sanitize_local_path("/\\evil.example.com"), "/");
        assert_eq!(sanitize_local_path("https://evil.example.com/"), "/");
        assert_eq!(sanitize_local_path(""), "/");
    }

    #[test]
    fn test_bearer_token() {
        let p = parts(Method::GET, "/", &[("authorization", "Bearer abc")]);
        assert_eq!(bearer_token(&p).as_deref(), Some("abc"));
        let p = parts(Method::GET, "/", &[("authorization", "Basic abc")]);
        assert_eq!(bearer_token(&p), None);
    }

    #[tokio::test]
    async fn test_disabled_provider_skips() {
        let provider: ProviderHandle = Arc::new(DisabledProvider);
        let p = parts(Method::GET, "/app/x", &[]);
        assert!(matches!(gate().evaluate(&p, true, &provider).await, GateOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_unauthenticated_request_redirects_with_state() {
        let provider = static_provider();
        let p = parts(Method::GET, "/app/x?y=1", &[]);
        let GateOutcome::Respond(decision, response) = gate().evaluate(&p, true, &provider).await else {
            panic!("expected a redirect");
        };
        assert_eq!(decision, AuthDecision::Redirected);
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[LOCATION].to_str().unwrap();
        assert!(location.starts_with("http://localhost:8080/auth/callback?code=static&state="));
        let cookies = set_cookies(&response);
        assert!(cookies.iter().any(|c| c.starts_with("oidc_state=")));
        assert!(cookies.iter().any(|c| c.starts_with("auth_redirect=")));
    }

    #[tokio::test]
    async fn test_unverifiable_credential_restarts_login() {
        let provider: ProviderHandle = Arc::new(UnreachableVerifier);
        for headers in [
            [("cookie", "auth_token=opaque")],
            [("authorization", "Bearer opaque")],
        ] {
            let p = parts(Method::GET, "/app/x", &headers);
            let GateOutcome::Respond(decision, response) = gate().evaluate(&p, true, &provider).await else {
                panic!("expected a redirect");
            };
            assert_eq!(decision, AuthDecision::Redirected);
            assert_eq!(response.status(), StatusCode::FOUND);
            let location = response.headers()[LOCATION].to_str().unwrap();
            assert!(location.starts_with("https://idp.example.com/authorize?state="));
        }
    }

    #[tokio::test]
    async fn test_full_static_flow() {
        let gate = gate();
        let provider = static_provider();

        let p = parts(Method::GET, "/app/x", &[]);
        let GateOutcome::Respond(_, response) = gate.evaluate(&p, true, &provider).await else {
            panic!("expected a redirect");
        };
        let location = response.headers()[LOCATION].to_str().unwrap().to_string();
        let callback = location.trim_start_matches("http://localhost:8080");
        let cookie_header = set_cookies(&response)
            .iter()
            .map(|c| c.split(';').next().unwrap().to_string())
            .collect::<Vec<_>>()
            .join("; ");

        let p = parts(Method::GET, callback, &[("cookie", &cookie_header)]);
        let response = gate.handle_auth_path(&p, &provider).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/app/x");
        let session = set_cookies(&response)
            .into_iter()
            .find(|c| c.starts_with("auth_token=") && !c.starts_with("auth_token=;"))
            .unwrap();
        let session = session.split(';').next().unwrap().to_string();

        let p = parts(Method::GET, "/app/x", &[("cookie", &session)]);
        let GateOutcome::Authenticated { identity, .. } = gate.evaluate(&p, true, &provider).await else {
            panic!("expected an identity");
        };
        assert_eq!(identity.username, "dev");

        // Same callback again is a replay
        let p = parts(Method::GET, callback, &[("cookie", &cookie_header)]);
        let response = gate.handle_auth_path(&p, &provider).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cross_site_post_with_session_is_rejected() {
        let provider = static_provider();
        let p = parts(
            Method::POST,
            "/app/x",
            &[
                ("host", "gateway.example.com"),
                ("origin", "https://evil.example.com"),
                ("cookie", "auth_token=whatever"),
            ],
        );
        let GateOutcome::Respond(decision, response) = gate().evaluate(&p, true, &provider).await else {
            panic!("expected a rejection");
        };
        assert_eq!(decision, AuthDecision::Rejected);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_disabled_is_not_found() {
        let provider: ProviderHandle = Arc::new(DisabledProvider);
        let p = parts(Method::GET, "/auth/login", &[]);
        let response = gate().handle_auth_path(&p, &provider).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logout_clears_session_without_remote_endpoint() {
        let provider = static_provider();
        let p = parts(Method::POST, "/auth/logout", &[("cookie", "auth_token=abc")]);
        let response = gate().handle_auth_path(&p, &provider).await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert!(cookies
            .iter()
            .any(|c| c.starts_with("auth_token=;") && c.contains("Max-Age=0")));
    }

    #[tokio::test]
    async fn test_error_page() {
        let provider: ProviderHandle = Arc::new(DisabledProvider);
        let p = parts(Method::GET, "/auth/error?reason=access_denied", &[]);
        let response = gate().handle_auth_path(&p, &provider).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
