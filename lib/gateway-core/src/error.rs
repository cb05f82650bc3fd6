use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or unreadable routing/provider configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Discovery or token exchange could not reach the identity provider
    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Expired, malformed or unverifiable credential
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Correlation state or CSRF token did not match
    #[error("State mismatch: {0}")]
    CsrfMismatch(String),

    /// Backend unreachable or returned a transport error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Backend did not answer within the configured timeout
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Request or response body exceeded the configured limit
    #[error("Body too large: {0}")]
    BodyTooLarge(String),

    /// Operation requires a configured identity provider
    #[error("Authentication is not configured")]
    NotConfigured,

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    /// HTTP status code a request-scoped error is surfaced as
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::ProviderUnavailable(_) => 503,
            GatewayError::InvalidCredential(_) => 401,
            GatewayError::CsrfMismatch(_) => 400,
            GatewayError::Upstream(_) => 502,
            GatewayError::UpstreamTimeout(_) => 504,
            GatewayError::BodyTooLarge(_) => 413,
            GatewayError::NotConfigured => 404,
            GatewayError::Config(_) | GatewayError::Yaml(_) => 500,
        }
    }

    /// Whether the error means "caller is simply not authenticated"
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, GatewayError::InvalidCredential(_))
    }
}
