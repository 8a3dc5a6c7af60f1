//! Auth flows against a migrated SQLite database.

use dqm_auth::{
    demo_migrations, reply, AuthError, AuthService, LoginRequest, RegisterRequest, DEMO_SCHEMA, MAX_FAILED_ATTEMPTS,
};
use dqm_db::{DbValue, Operation};
use dqm_queue::{ConnectionConfig, DqmSettings, Registry, RegistryBuilder, TierKind};
use std::sync::Arc;
use tempfile::TempDir;

const DB: &str = "Acuranzo";
const API_KEY: &str = "acz-demo-key";
const EXPIRED_KEY: &str = "acz-expired-key";

struct Fixture {
    _tmp: TempDir,
    registry: Arc<Registry>,
    auth: Arc<AuthService>,
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = ConnectionConfig::new(DB, format!("sqlite:{}", tmp.path().join("auth.db").display()))
        .with_tier(TierKind::Fast, 2);
    config.automigrate = true;
    config.schema = Some(DEMO_SCHEMA.to_string());

    let registry = Arc::new(
        RegistryBuilder::new(DqmSettings::default())
            .schema(DEMO_SCHEMA, demo_migrations)
            .build(vec![config])
            .unwrap(),
    );
    let outcomes = registry.start_all().await;
    assert!(outcomes[0].ready, "{:?}", outcomes[0].error);

    for (key, expires_at) in [(API_KEY, DbValue::Null), (EXPIRED_KEY, DbValue::from(1_000_i64))] {
        registry
            .submit(
                DB,
                TierKind::Lead,
                Operation::execute(
                    "INSERT INTO licenses (api_key, name, expires_at) VALUES (?, ?, ?)",
                    vec![key.into(), "Demo".into(), expires_at],
                ),
            )
            .await
            .unwrap()
            .await
            .unwrap();
    }

    let auth = Arc::new(AuthService::new(Arc::clone(&registry)));
    Fixture {
        _tmp: tmp,
        registry,
        auth,
    }
}

fn registration(username: &str) -> RegisterRequest {
    RegisterRequest {
        database: DB.to_string(),
        username: username.to_string(),
        password: "correct horse battery".to_string(),
        email: format!("{}@example.com", username),
        full_name: Some("Demo User".to_string()),
        api_key: API_KEY.to_string(),
    }
}

fn login(login_id: &str, password: &str) -> LoginRequest {
    LoginRequest {
        database: DB.to_string(),
        login_id: login_id.to_string(),
        password: password.to_string(),
        api_key: API_KEY.to_string(),
        tz: "America/Vancouver".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn register_then_login() {
    let f = fixture().await;

    let registered = f.auth.register(&registration("alice")).await;
    assert_eq!(reply(&registered, 201).0, 201);
    let registered = registered.unwrap();
    assert_eq!(registered.username, "alice");

    let grant = f.auth.login(&login("alice", "correct horse battery")).await.unwrap();
    assert_eq!(grant.user_id, registered.user_id);
    assert_eq!(grant.email, "alice@example.com");
    assert_eq!(grant.roles, "user");
    assert_eq!(grant.token.len(), 32);

    // login_id may also be the email address.
    assert!(f
        .auth
        .login(&login("alice@example.com", "correct horse battery"))
        .await
        .is_ok());

    let wrong = f.auth.login(&login("alice", "wrong password")).await;
    assert_eq!(wrong, Err(AuthError::InvalidCredentials));
    let (status, body) = reply(&wrong, 200);
    assert_eq!(status, 401);
    assert!(body.get("token").is_none());

    assert_eq!(
        f.auth.login(&login("nobody", "whatever")).await,
        Err(AuthError::InvalidCredentials)
    );

    // Lookups went to the Fast tier, writes to the Lead.
    let status = &f.registry.status()[0];
    let fast = status.tiers.iter().find(|t| t.tier == TierKind::Fast).unwrap();
    assert!(fast.metrics.completed > 0);
    assert!(status.tiers[0].metrics.completed > 0);

    f.registry.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renew_rotates_and_logout_revokes() {
    let f = fixture().await;
    f.auth.register(&registration("bob")).await.unwrap();
    let first = f.auth.login(&login("bob", "correct horse battery")).await.unwrap();

    let second = f.auth.renew(DB, &first.token).await.unwrap();
    assert_ne!(second.token, first.token);
    assert!(second.expires_at >= first.expires_at);
    assert_eq!(f.auth.renew(DB, &first.token).await, Err(AuthError::InvalidToken));

    assert_eq!(f.auth.logout(DB, &second.token).await, Ok(()));
    assert_eq!(f.auth.logout(DB, &second.token).await, Err(AuthError::InvalidToken));
    assert_eq!(f.auth.renew(DB, &second.token).await, Err(AuthError::InvalidToken));
    assert_eq!(f.auth.renew(DB, "").await.unwrap_err().status(), 401);

    f.registry.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejects_bad_input_keys_and_accounts() {
    let f = fixture().await;
    f.auth.register(&registration("carol")).await.unwrap();

    let mut bad_tz = login("carol", "correct horse battery");
    bad_tz.tz = "Mars; DROP TABLE".into();
    assert_eq!(f.auth.login(&bad_tz).await.unwrap_err().status(), 400);

    let mut unknown_db = login("carol", "correct horse battery");
    unknown_db.database = "Nowhere".into();
    assert_eq!(
        f.auth.login(&unknown_db).await,
        Err(AuthError::UnknownDatabase("Nowhere".into()))
    );

    let mut bad_key = login("carol", "correct horse battery");
    bad_key.api_key = "not-a-key".into();
    assert_eq!(f.auth.login(&bad_key).await, Err(AuthError::InvalidApiKey));

    let mut expired = registration("dave");
    expired.api_key = EXPIRED_KEY.into();
    assert_eq!(f.auth.register(&expired).await.unwrap_err().status(), 403);

    let mut short = registration("erin");
    short.password = "short".into();
    assert_eq!(f.auth.register(&short).await.unwrap_err().status(), 400);

    f.registry
        .submit(
            DB,
            TierKind::Lead,
            Operation::execute("UPDATE accounts SET enabled = 0 WHERE username = ?", vec!["carol".into()]),
        )
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(
        f.auth.login(&login("carol", "correct horse battery")).await,
        Err(AuthError::AccountDisabled)
    );
    // Without the password the account state stays hidden.
    let guessed = f.auth.login(&login("carol", "wrong password")).await;
    assert_eq!(guessed, Err(AuthError::InvalidCredentials));
    assert_eq!(guessed.unwrap_err().status(), 401);

    f.registry.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_failures_are_rate_limited() {
    let f = fixture().await;
    f.auth.register(&registration("frank")).await.unwrap();

    for _ in 0..MAX_FAILED_ATTEMPTS {
        assert_eq!(
            f.auth.login(&login("frank", "wrong password")).await,
            Err(AuthError::InvalidCredentials)
        );
    }
    let limited = f.auth.login(&login("frank", "correct horse battery")).await;
    assert_eq!(limited, Err(AuthError::TooManyAttempts { retry_after: 900 }));
    assert_eq!(reply(&limited, 200).0, 429);

    f.registry.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_registration_yields_one_account() {
    let f = fixture().await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let auth = Arc::clone(&f.auth);
        tasks.push(tokio::spawn(async move { auth.register(&registration("grace")).await }));
    }
    let mut created = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(AuthError::UsernameTaken) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);

    let count = f
        .registry
        .submit(
            DB,
            TierKind::Fast,
            Operation::query("SELECT COUNT(*) AS n FROM accounts WHERE username = 'grace'", vec![]),
        )
        .await
        .unwrap()
        .await
        .unwrap()
        .first_row()
        .unwrap()
        .get_by_name::<i64>("n")
        .unwrap();
    assert_eq!(count, 1);

    // Tiers are still healthy and drain cleanly.
    let reports = f.registry.shutdown_all().await;
    assert!(reports[0].clean);
}
