use metrics::counter;
use thiserror::Error;
use tracing::{error, info, warn};

use invoice_dash_identity::{AuthFailureKind, Credentials, IdentityClient, IdentityError};

/// Where a successful login lands.
pub const LOGIN_SUCCESS_REDIRECT: &str = "/dashboard";

pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid credentials.";
pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong.";

/// Result of a login attempt the login form knows how to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated { redirect: &'static str },
    Rejected(&'static str),
}

/// Provider failure that carries no classification. Callers must not turn
/// it into a form message.
#[derive(Debug, Error)]
#[error("identity provider failed: {0}")]
pub struct UnclassifiedAuthError(#[source] pub IdentityError);

/// Delegates credential checks to the identity provider.
#[derive(Clone)]
pub struct Authenticator {
    client: IdentityClient,
}

impl Authenticator {
    pub fn new(client: IdentityClient) -> Self {
        Self { client }
    }

    pub async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, UnclassifiedAuthError> {
        match self.client.verify(credentials).await {
            Ok(identity) => {
                info!(stage = "auth", user_id = %identity.user_id, "login accepted");
                counter!("auth_attempts_total", "result" => "ok").increment(1);
                Ok(AuthOutcome::Authenticated {
                    redirect: LOGIN_SUCCESS_REDIRECT,
                })
            }
            Err(IdentityError::Rejected(AuthFailureKind::CredentialsSignin)) => {
                info!(stage = "auth", "login rejected: bad credentials");
                counter!("auth_attempts_total", "result" => "invalid_credentials").increment(1);
                Ok(AuthOutcome::Rejected(INVALID_CREDENTIALS_MESSAGE))
            }
            Err(IdentityError::Rejected(kind)) => {
                warn!(stage = "auth", kind = kind.as_str(), "login rejected");
                counter!("auth_attempts_total", "result" => "rejected").increment(1);
                Ok(AuthOutcome::Rejected(GENERIC_FAILURE_MESSAGE))
            }
            Err(err) => {
                error!(stage = "auth", error = %err, "identity provider call failed");
                counter!("auth_attempts_total", "result" => "unclassified").increment(1);
                Err(UnclassifiedAuthError(err))
            }
        }
    }
}
