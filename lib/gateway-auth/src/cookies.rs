//! Cookies used by the login flow and the session
use crate::state::STATE_TTL;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cookie::{Cookie, SameSite};
use std::time::Duration;

/// Cookie names, configurable per deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookieNames {
    pub session: String,
    pub state: String,
    pub redirect: String,
    pub csrf: String,
}

impl Default for CookieNames {
    fn default() -> Self {
        Self {
            session: "auth_token".to_string(),
            state: "oidc_state".to_string(),
            redirect: "auth_redirect".to_string(),
            csrf: "csrf_token".to_string(),
        }
    }
}

/// Builds `Set-Cookie` values with the gateway's attribute policy
///
/// Every cookie is `Path=/` and `SameSite=Lax`; `Secure` follows the listener.
/// All but the CSRF cookie are `HttpOnly`, since scripts must be able to echo
/// the CSRF token back in a header.
#[derive(Clone, Debug)]
pub struct CookieFactory {
    names: CookieNames,
    secure: bool,
}

impl CookieFactory {
    pub fn new(names: CookieNames, secure: bool) -> Self {
        Self { names, secure }
    }

    pub fn names(&self) -> &CookieNames {
        &self.names
    }

    pub fn session(&self, token: &str, max_age: Duration) -> Cookie<'static> {
        self.build(&self.names.session, token.to_string(), max_age, true)
    }

    pub fn state(&self, value: &str) -> Cookie<'static> {
        self.build(&self.names.state, value.to_string(), STATE_TTL, true)
    }

    /// Post-login path, encoded so any path survives cookie value rules
    pub fn redirect(&self, path: &str) -> Cookie<'static> {
        self.build(&self.names.redirect, URL_SAFE_NO_PAD.encode(path), STATE_TTL, true)
    }

    pub fn csrf(&self, token: &str, max_age: Duration) -> Cookie<'static> {
        self.build(&self.names.csrf, token.to_string(), max_age, false)
    }

    /// Removal cookie for `name`
    pub fn expire(&self, name: &str) -> Cookie<'static> {
        let mut cookie = self.build(name, String::new(), Duration::ZERO, true);
        cookie.make_removal();
        cookie
    }

    fn build(&self, name: &str, value: String, max_age: Duration, http_only: bool) -> Cookie<'static> {
        Cookie::build((name.to_string(), value))
            .path("/")
            .http_only(http_only)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(max_age.as_secs() as i64))
            .build()
    }
}

/// Decode the value stored by [`CookieFactory::redirect`]
pub fn decode_redirect(value: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
    String::from_utf8(bytes).ok()
}

/// Find a cookie by name across one or more `Cookie` request headers
pub fn find_cookie<'a, I>(headers: I, name: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    headers.into_iter().find_map(|header| {
        Cookie::split_parse(header)
            .filter_map(|c| c.ok())
            .find(|c| c.name() == name)
            .map(|c| c.value().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let factory = CookieFactory::new(CookieNames::default(), true);
        let header = factory.session("tok", Duration::from_secs(3600)).to_string();
        assert!(header.starts_with("auth_token=tok"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("Secure"));
        assert!(header.contains("SameSite=Lax"));
        assert!(header.contains("Path=/"));
        assert!(header.contains("Max-Age=3600"));
    }

    #[test]
    fn test_plain_listener_cookies_are_not_secure() {
        let factory = CookieFactory::new(CookieNames::default(), false);
        let header = factory.state("abc.123").to_string();
        assert!(header.starts_with("oidc_state=abc.123"));
        assert!(!header.contains("Secure"));
        assert!(header.contains("Max-Age=300"));
    }

    #[test]
    fn test_csrf_cookie_is_script_readable() {
        let factory = CookieFactory::new(CookieNames::default(), false);
        let header = factory.csrf("xyz", Duration::from_secs(60)).to_string();
        assert!(header.starts_with("csrf_token=xyz"));
        assert!(!header.contains("HttpOnly"));
    }

    #[test]
    fn test_expire_clears_value() {
        let factory = CookieFactory::new(CookieNames::default(), false);
        let header = factory.expire("auth_token").to_string();
        assert!(header.starts_with("auth_token=;"));
        assert!(header.contains("Max-Age=0"));
    }

    #[test]
    fn test_redirect_value_round_trip() {
        let factory = CookieFactory::new(CookieNames::default(), false);
        let cookie = factory.redirect("/app/x?a=1; b=2");
        assert_eq!(decode_redirect(cookie.value()).as_deref(), Some("/app/x?a=1; b=2"));
        assert!(decode_redirect("***").is_none());
    }

    #[test]
    fn test_find_cookie() {
        let headers = ["theme=dark; auth_token=abc", "oidc_state=s.1"];
        assert_eq!(find_cookie(headers, "auth_token").as_deref(), Some("abc"));
        assert_eq!(find_cookie(headers, "oidc_state").as_deref(), Some("s.1"));
        assert_eq!(find_cookie(headers, "missing"), None);
    }
}
