//! Auth failures and their HTTP status mapping.

use dqm_queue::{JobError, SubmitError};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("License has expired")]
    LicenseExpired,

    #[error("Too many failed attempts")]
    TooManyAttempts { retry_after: i64 },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Account is not authorized")]
    NotAuthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Username already exists")]
    UsernameTaken,

    #[error("Database unavailable: {0}")]
    Unavailable(#[from] SubmitError),

    #[error("Database error: {0}")]
    Database(#[from] JobError),
}

impl AuthError {
    pub fn status(&self) -> u16 {
        match self {
            AuthError::InvalidInput(_) | AuthError::UnknownDatabase(_) => 400,
            AuthError::InvalidApiKey | AuthError::InvalidCredentials | AuthError::InvalidToken => 401,
            AuthError::LicenseExpired | AuthError::AccountDisabled | AuthError::NotAuthorized => 403,
            AuthError::UsernameTaken => 409,
            AuthError::TooManyAttempts { .. } => 429,
            AuthError::Database(_) => 500,
            AuthError::Unavailable(_) => 503,
        }
    }

    fn body(&self) -> JsonValue {
        let mut body = json!({ "success": false, "error": self.to_string() });
        if let AuthError::TooManyAttempts { retry_after } = self {
            body["retry_after"] = json!(retry_after);
        }
        body
    }
}

/// HTTP status and JSON body for an auth result. `ok_status` is used on
/// success (200 for login/renew/logout, 201 for register).
pub fn reply<T: Serialize>(result: &Result<T, AuthError>, ok_status: u16) -> (u16, JsonValue) {
    match result {
        Ok(value) => {
            let mut body = serde_json::to_value(value).unwrap_or(JsonValue::Null);
            match body.as_object_mut() {
                Some(object) => {
                    object.insert("success".to_string(), JsonValue::Bool(true));
                }
                None => body = json!({ "success": true }),
            }
            (ok_status, body)
        }
        Err(err) => (err.status(), err.body()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqm_queue::TierKind;

    #[test]
    fn statuses_follow_http_conventions() {
        assert_eq!(AuthError::InvalidInput("tz".into()).status(), 400);
        assert_eq!(AuthError::InvalidCredentials.status(), 401);
        assert_eq!(AuthError::LicenseExpired.status(), 403);
        assert_eq!(AuthError::UsernameTaken.status(), 409);
        assert_eq!(AuthError::TooManyAttempts { retry_after: 900 }.status(), 429);
        assert_eq!(
            AuthError::from(SubmitError::QueueFull {
                connection: "a".into(),
                tier: TierKind::Lead
            })
            .status(),
            503
        );
        assert_eq!(AuthError::from(JobError::Cancelled).status(), 500);
    }

    #[test]
    fn reply_marks_success_and_errors() {
        let ok: Result<JsonValue, AuthError> = Ok(json!({ "token": "t" }));
        let (status, body) = reply(&ok, 200);
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);
        assert_eq!(body["token"], "t");

        let unit: Result<(), AuthError> = Ok(());
        assert_eq!(reply(&unit, 200).1, json!({ "success": true }));

        let limited: Result<(), AuthError> = Err(AuthError::TooManyAttempts { retry_after: 900 });
        let (status, body) = reply(&limited, 200);
        assert_eq!(status, 429);
        assert_eq!(body["retry_after"], 900);
        assert_eq!(body["error"], "Too many failed attempts");
    }
}
