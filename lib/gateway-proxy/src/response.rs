//! Response builders for gateway-generated responses
use cookie::Cookie;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LOCATION, SET_COOKIE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::warn;

pub type GatewayBody = Full<Bytes>;

pub fn text(status: StatusCode, body: impl Into<String>) -> Response<GatewayBody> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<GatewayBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        }
    }
}

/// 302 to `location`; an unencodable location degrades to `/`
pub fn redirect(location: &str) -> Response<GatewayBody> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::FOUND;
    let value = HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/"));
    response.headers_mut().insert(LOCATION, value);
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Append `Set-Cookie` headers
pub fn with_cookies<'c>(
    mut response: Response<GatewayBody>,
    cookies: impl IntoIterator<Item = Cookie<'c>>,
) -> Response<GatewayBody> {
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!(cookie = cookie.name(), error = %e, "Dropping unencodable cookie"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_sets_location() {
        let response = redirect("/app?x=1");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/app?x=1");
    }

    #[test]
    fn test_with_cookies_appends() {
        let response = with_cookies(
            text(StatusCode::OK, "ok"),
            [Cookie::new("a", "1"), Cookie::new("b", "2")],
        );
        assert_eq!(response.headers().get_all(SET_COOKIE).iter().count(), 2);
    }
}
