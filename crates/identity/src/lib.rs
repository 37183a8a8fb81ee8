//! Client for the external identity provider that verifies dashboard logins.

use std::fmt;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Client responsible for credential verification against the identity provider.
#[derive(Clone)]
pub struct IdentityClient {
    http: Client,
    base_url: Url,
}

impl IdentityClient {
    /// Creates a new client with the provided HTTP instance and base URL.
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    /// Verifies the credentials with a single provider call.
    ///
    /// A rejection the provider tags with a known kind is returned as
    /// [`IdentityError::Rejected`]; anything else is unclassified.
    pub async fn verify(
        &self,
        credentials: &Credentials,
    ) -> Result<VerifiedIdentity, IdentityError> {
        let url = self.base_url.join("verify")?;
        let response = self.http.post(url).json(credentials).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            if let Ok(rejection) = serde_json::from_str::<RejectionBody>(&body) {
                return Err(IdentityError::Rejected(AuthFailureKind::from_code(
                    &rejection.error,
                )));
            }
        }

        Err(IdentityError::Status { status, body })
    }
}

/// Email/password pair forwarded to the provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity returned by the provider for accepted credentials.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    error: String,
}

/// Classified reasons the provider gives for refusing a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailureKind {
    /// Wrong email or password.
    CredentialsSignin,
    AccessDenied,
    Verification,
    Other(String),
}

impl AuthFailureKind {
    fn from_code(code: &str) -> Self {
        match code {
            "CredentialsSignin" => Self::CredentialsSignin,
            "AccessDenied" => Self::AccessDenied,
            "Verification" => Self::Verification,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CredentialsSignin => "CredentialsSignin",
            Self::AccessDenied => "AccessDenied",
            Self::Verification => "Verification",
            Self::Other(code) => code,
        }
    }
}

/// Errors that can occur while verifying credentials.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("credentials rejected: {}", .0.as_str())]
    Rejected(AuthFailureKind),
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}
