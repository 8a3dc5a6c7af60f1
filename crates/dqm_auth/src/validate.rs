//! Request input checks. Every failure is a 400.

use crate::error::AuthError;

const MAX_FIELD_LEN: usize = 255;
const MAX_SECRET_LEN: usize = 128;
const MIN_PASSWORD_LEN: usize = 8;

fn invalid(message: impl Into<String>) -> AuthError {
    AuthError::InvalidInput(message.into())
}

fn required(field: &str, value: &str, max: usize) -> Result<(), AuthError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{} is required", field)));
    }
    if value.chars().count() > max {
        return Err(invalid(format!("{} is too long", field)));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid(format!("{} contains control characters", field)));
    }
    Ok(())
}

/// IANA-style zone names (`UTC`, `America/Vancouver`, `Etc/GMT+8`).
pub(crate) fn timezone(tz: &str) -> Result<(), AuthError> {
    required("tz", tz, 64)?;
    let valid = tz
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '+' | '-'));
    if !valid {
        return Err(invalid("tz is not a valid time zone name"));
    }
    Ok(())
}

pub(crate) fn login(login_id: &str, password: &str, api_key: &str, tz: &str) -> Result<(), AuthError> {
    required("login_id", login_id, MAX_FIELD_LEN)?;
    required("password", password, MAX_SECRET_LEN)?;
    required("api_key", api_key, MAX_SECRET_LEN)?;
    timezone(tz)
}

pub(crate) fn username(username: &str) -> Result<(), AuthError> {
    let len = username.chars().count();
    if !(3..=50).contains(&len) {
        return Err(invalid("username must be 3 to 50 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid("username may only contain letters, digits, '_', '-' and '.'"));
    }
    Ok(())
}

pub(crate) fn email(email: &str) -> Result<(), AuthError> {
    required("email", email, MAX_FIELD_LEN)?;
    let Some((local, domain)) = email.split_once('@') else {
        return Err(invalid("email is not valid"));
    };
    if local.is_empty() || domain.contains('@') || !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid("email is not valid"));
    }
    Ok(())
}

pub(crate) fn register(
    username_value: &str,
    password: &str,
    email_value: &str,
    full_name: Option<&str>,
    api_key: &str,
) -> Result<(), AuthError> {
    username(username_value)?;
    required("password", password, MAX_SECRET_LEN)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(invalid(format!("password must be at least {} characters", MIN_PASSWORD_LEN)));
    }
    email(email_value)?;
    if let Some(name) = full_name {
        if name.chars().count() > MAX_FIELD_LEN {
            return Err(invalid("full_name is too long"));
        }
    }
    required("api_key", api_key, MAX_SECRET_LEN)
}
