//! SQL used by the auth service, written once with `?` placeholders.

use dqm_db::EngineKind;

pub(crate) const LICENSE_BY_KEY: &str = "SELECT license_id, expires_at, enabled FROM licenses WHERE api_key = ?";

pub(crate) const RECENT_FAILURES: &str =
    "SELECT COUNT(*) AS failures FROM login_failures WHERE login_id = ? AND failed_at > ?";

pub(crate) const RECORD_FAILURE: &str = "INSERT INTO login_failures (login_id, failed_at) VALUES (?, ?)";

pub(crate) const CLEAR_FAILURES: &str = "DELETE FROM login_failures WHERE login_id = ?";

pub(crate) const ACCOUNT_BY_LOGIN: &str = "SELECT account_id, username, email, password_hash, enabled, authorized, roles \
     FROM accounts WHERE username = ? OR email = ?";

pub(crate) const ACCOUNT_ID_BY_USERNAME: &str = "SELECT account_id FROM accounts WHERE username = ?";

pub(crate) const INSERT_ACCOUNT: &str =
    "INSERT INTO accounts (username, email, full_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?)";

pub(crate) const INSERT_TOKEN: &str =
    "INSERT INTO tokens (token_hash, account_id, expires_at, created_at) VALUES (?, ?, ?, ?)";

pub(crate) const TOKEN_ACCOUNT: &str = "SELECT a.account_id, a.username, a.email, a.roles, a.enabled \
     FROM tokens t JOIN accounts a ON a.account_id = t.account_id \
     WHERE t.token_hash = ? AND t.expires_at > ?";

pub(crate) const DELETE_TOKEN: &str = "DELETE FROM tokens WHERE token_hash = ?";

/// Rewrite `?` placeholders into the engine's native form.
pub(crate) fn sql(kind: EngineKind, template: &str) -> String {
    if kind != EngineKind::Postgres {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len() + 8);
    let mut index = 0;
    for c in template.chars() {
        if c == '?' {
            index += 1;
            out.push('$');
            out.push_str(&index.to_string());
        } else {
            out.push(c);
        }
    }
    out
}
