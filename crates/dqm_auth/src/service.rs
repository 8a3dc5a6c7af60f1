//! Login, token renewal, logout and registration.
//!
//! Every database access goes through the queue manager: lookups run on the
//! Fast tier when it is running, otherwise on the Lead; writes always run on
//! the Lead so they are serialized per connection.

use crate::error::AuthError;
use crate::queries::{self, sql};
use crate::signing::{new_token, password_hash, token_hash, verify_password};
use crate::validate;
use chrono::Utc;
use dqm_db::{DbRow, DbValue, EngineError, FromDbValue, Operation, OperationResult};
use dqm_queue::{DqmInstance, JobError, Registry, TierKind, TierState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifetime of an issued token.
pub const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Window over which failed logins are counted.
pub const RATE_LIMIT_WINDOW_SECS: i64 = 900;
/// Failed logins within the window before further attempts are refused.
pub const MAX_FAILED_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub database: String,
    pub login_id: String,
    pub password: String,
    pub api_key: String,
    pub tz: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub database: String,
    pub username: String,
    pub password: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub api_key: String,
}

/// Returned by login and renew.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: i64,
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub roles: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registered {
    pub user_id: i64,
    pub username: String,
}

struct Account {
    id: i64,
    username: String,
    email: String,
    roles: String,
}

fn field<T: FromDbValue>(row: &DbRow, name: &str) -> Result<T, AuthError> {
    row.get_by_name(name)
        .map_err(|e| AuthError::Database(JobError::Engine(e)))
}

impl Account {
    fn from_row(row: &DbRow) -> Result<Self, AuthError> {
        Ok(Self {
            id: field(row, "account_id")?,
            username: field(row, "username")?,
            email: field(row, "email")?,
            roles: field(row, "roles")?,
        })
    }
}

/// One connection's view for a single request.
struct Session {
    instance: Arc<DqmInstance>,
}

impl Session {
    fn read_tier(&self) -> TierKind {
        match self.instance.tier(TierKind::Fast) {
            Some(fast) if fast.state() == TierState::Running => TierKind::Fast,
            _ => TierKind::Lead,
        }
    }

    async fn run(&self, tier: TierKind, operation: Operation) -> Result<OperationResult, AuthError> {
        let handle = self.instance.submit(tier, operation).await?;
        Ok(handle.await?)
    }

    async fn read_one(&self, template: &str, params: Vec<DbValue>) -> Result<Option<DbRow>, AuthError> {
        let operation = Operation::query(sql(self.instance.engine_kind(), template), params);
        let result = self.run(self.read_tier(), operation).await?;
        Ok(result.first_row())
    }

    async fn write(&self, template: &str, params: Vec<DbValue>) -> Result<u64, AuthError> {
        let operation = Operation::execute(sql(self.instance.engine_kind(), template), params);
        Ok(self.run(TierKind::Lead, operation).await?.rows_affected())
    }
}

pub struct AuthService {
    registry: Arc<Registry>,
}

impl AuthService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    fn session(&self, database: &str) -> Result<Session, AuthError> {
        if database.trim().is_empty() {
            return Err(AuthError::InvalidInput("database is required".to_string()));
        }
        self.registry
            .get(database)
            .map(|instance| Session { instance })
            .ok_or_else(|| AuthError::UnknownDatabase(database.to_string()))
    }

    async fn check_license(&self, db: &Session, api_key: &str, now: i64) -> Result<(), AuthError> {
        let Some(row) = db.read_one(queries::LICENSE_BY_KEY, vec![api_key.into()]).await? else {
            warn!("API key verification failed");
            return Err(AuthError::InvalidApiKey);
        };
        if field::<i64>(&row, "enabled")? == 0 {
            return Err(AuthError::InvalidApiKey);
        }
        if let Some(expires_at) = field::<Option<i64>>(&row, "expires_at")? {
            if expires_at <= now {
                warn!(license_id = field::<i64>(&row, "license_id")?, "License expired");
                return Err(AuthError::LicenseExpired);
            }
        }
        Ok(())
    }

    async fn record_failure(&self, db: &Session, login_id: &str, now: i64) -> Result<(), AuthError> {
        db.write(queries::RECORD_FAILURE, vec![login_id.into(), now.into()])
            .await?;
        Ok(())
    }

    async fn issue_token(&self, db: &Session, account: Account, now: i64) -> Result<TokenGrant, AuthError> {
        let token = new_token();
        let expires_at = now + TOKEN_LIFETIME_SECS;
        db.write(
            queries::INSERT_TOKEN,
            vec![
                token_hash(&token).into(),
                account.id.into(),
                expires_at.into(),
                now.into(),
            ],
        )
        .await?;
        debug!(user_id = account.id, expires_at, "Token stored");
        Ok(TokenGrant {
            token,
            expires_at,
            user_id: account.id,
            username: account.username,
            email: account.email,
            roles: account.roles,
        })
    }

    /// 200 with a token, or 400/401/403/429.
    pub async fn login(&self, request: &LoginRequest) -> Result<TokenGrant, AuthError> {
        validate::login(&request.login_id, &request.password, &request.api_key, &request.tz)?;
        let db = self.session(&request.database)?;
        let now = Utc::now().timestamp();
        self.check_license(&db, &request.api_key, now).await?;

        let login_id = request.login_id.as_str();
        let failures = match db
            .read_one(
                queries::RECENT_FAILURES,
                vec![login_id.into(), (now - RATE_LIMIT_WINDOW_SECS).into()],
            )
            .await?
        {
            Some(row) => field::<i64>(&row, "failures")?,
            None => 0,
        };
        if failures >= MAX_FAILED_ATTEMPTS {
            warn!(failures, "Rate limit exceeded for {}", login_id);
            return Err(AuthError::TooManyAttempts {
                retry_after: RATE_LIMIT_WINDOW_SECS,
            });
        }

        let Some(row) = db
            .read_one(queries::ACCOUNT_BY_LOGIN, vec![login_id.into(), login_id.into()])
            .await?
        else {
            warn!("Account not found for login_id: {}", login_id);
            self.record_failure(&db, login_id, now).await?;
            return Err(AuthError::InvalidCredentials);
        };

        // Account state is only revealed to callers who know the password.
        let stored: String = field(&row, "password_hash")?;
        let account = Account::from_row(&row)?;
        if !verify_password(&account.username, &request.password, &stored) {
            warn!(user_id = account.id, "Invalid password");
            self.record_failure(&db, login_id, now).await?;
            return Err(AuthError::InvalidCredentials);
        }
        if field::<i64>(&row, "enabled")? == 0 {
            return Err(AuthError::AccountDisabled);
        }
        if field::<i64>(&row, "authorized")? == 0 {
            return Err(AuthError::NotAuthorized);
        }

        db.write(queries::CLEAR_FAILURES, vec![login_id.into()]).await?;
        let grant = self.issue_token(&db, account, now).await?;
        info!(database = %request.database, user_id = grant.user_id, "Login succeeded");
        Ok(grant)
    }

    /// Exchange a live token for a fresh one. The old token stops working.
    pub async fn renew(&self, database: &str, token: &str) -> Result<TokenGrant, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let db = self.session(database)?;
        let now = Utc::now().timestamp();
        let hash = token_hash(token);

        let Some(row) = db
            .read_one(queries::TOKEN_ACCOUNT, vec![hash.clone().into(), now.into()])
            .await?
        else {
            return Err(AuthError::InvalidToken);
        };
        if field::<i64>(&row, "enabled")? == 0 {
            return Err(AuthError::InvalidToken);
        }
        let account = Account::from_row(&row)?;

        // A concurrent renew or logout may have consumed it since the lookup.
        if db.write(queries::DELETE_TOKEN, vec![hash.into()]).await? == 0 {
            return Err(AuthError::InvalidToken);
        }
        let grant = self.issue_token(&db, account, now).await?;
        debug!(database = %database, user_id = grant.user_id, "Token renewed");
        Ok(grant)
    }

    /// Revoke a token. 401 when it is unknown or already revoked.
    pub async fn logout(&self, database: &str, token: &str) -> Result<(), AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let db = self.session(database)?;
        if db.write(queries::DELETE_TOKEN, vec![token_hash(token).into()]).await? == 0 {
            return Err(AuthError::InvalidToken);
        }
        debug!(database = %database, "Token revoked");
        Ok(())
    }

    /// 201 with the new account id, or 400/401/403/409.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Registered, AuthError> {
        validate::register(
            &request.username,
            &request.password,
            &request.email,
            request.full_name.as_deref(),
            &request.api_key,
        )?;
        let db = self.session(&request.database)?;
        let now = Utc::now().timestamp();
        self.check_license(&db, &request.api_key, now).await?;

        let username = request.username.as_str();
        if self.account_id(&db, username).await?.is_some() {
            return Err(AuthError::UsernameTaken);
        }

        let full_name = match &request.full_name {
            Some(name) => DbValue::from(name.as_str()),
            None => DbValue::Null,
        };
        let inserted = db
            .write(
                queries::INSERT_ACCOUNT,
                vec![
                    username.into(),
                    request.email.as_str().into(),
                    full_name,
                    password_hash(username, &request.password).into(),
                    now.into(),
                ],
            )
            .await;
        match inserted {
            Ok(_) => {}
            // Lost a race with a concurrent registration of the same name.
            Err(AuthError::Database(JobError::Engine(err))) => {
                if self.account_id(&db, username).await?.is_some() {
                    return Err(AuthError::UsernameTaken);
                }
                return Err(AuthError::Database(JobError::Engine(err)));
            }
            Err(other) => return Err(other),
        }

        let user_id = self.account_id(&db, username).await?.ok_or_else(|| {
            AuthError::Database(JobError::Engine(EngineError::fatal(
                "account missing after insert",
            )))
        })?;
        info!(database = %request.database, user_id, "Registered {}", username);
        Ok(Registered {
            user_id,
            username: username.to_string(),
        })
    }

    async fn account_id(&self, db: &Session, username: &str) -> Result<Option<i64>, AuthError> {
        match db
            .read_one(queries::ACCOUNT_ID_BY_USERNAME, vec![username.into()])
            .await?
        {
            Some(row) => Ok(Some(field(&row, "account_id")?)),
            None => Ok(None),
        }
    }
}
