//! CSRF checks for cookie-authenticated, state-changing requests
//!
//! A request passes when its `Origin` (or, absent that, `Referer`) names the
//! same host the request was sent to, or when it carries an `X-CSRF-Token`
//! header equal to the `csrf_token` cookie (double submit).

use gateway_core::{GatewayError, Result};
use subtle::ConstantTimeEq;
use url::Url;

/// Header carrying the double-submit token
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Methods that never change state and are exempt from the check
pub fn is_state_changing(method: &str) -> bool {
    !matches!(
        method.to_ascii_uppercase().as_str(),
        "GET" | "HEAD" | "OPTIONS" | "TRACE"
    )
}

/// Request values the check looks at
#[derive(Debug, Default, Clone, Copy)]
pub struct CsrfInputs<'a> {
    pub host: Option<&'a str>,
    pub origin: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub header_token: Option<&'a str>,
    pub cookie_token: Option<&'a str>,
}

pub fn check(inputs: &CsrfInputs<'_>) -> Result<()> {
    if let (Some(header), Some(cookie)) = (inputs.header_token, inputs.cookie_token) {
        if !header.is_empty() && bool::from(header.as_bytes().ct_eq(cookie.as_bytes())) {
            return Ok(());
        }
    }

    let host = inputs
        .host
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GatewayError::CsrfMismatch("request has no Host".to_string()))?;

    // `Origin: null` is sent by sandboxed and privacy-sensitive contexts
    let source = inputs
        .origin
        .filter(|o| !o.is_empty() && *o != "null")
        .or(inputs.referer)
        .ok_or_else(|| GatewayError::CsrfMismatch("no Origin, Referer or CSRF token".to_string()))?;

    if same_authority(source, host) {
        Ok(())
    } else {
        Err(GatewayError::CsrfMismatch(format!(
            "cross-site request from {}",
            source
        )))
    }
}

/// Whether `source` names the same host and effective port as the `Host` value
///
/// The `Host` header is read with the source's scheme, so a default port is
/// equal to an elided one on either side.
fn same_authority(source: &str, host: &str) -> bool {
    let Ok(source) = Url::parse(source) else {
        return false;
    };
    let Ok(target) = Url::parse(&format!("{}://{}", source.scheme(), host)) else {
        return false;
    };
    if target.path() != "/" || target.query().is_some() || !target.username().is_empty() {
        return false;
    }
    match (source.host_str(), target.host_str()) {
        (Some(a), Some(b)) => {
            a.eq_ignore_ascii_case(b) && source.port_or_known_default() == target.port_or_known_default()
        }
        _ => false,
    }
}
