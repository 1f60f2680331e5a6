use chrono::Duration;

use auth_server::auth::mailer::MailKind;
use auth_server::auth::service::{ActivationOutcome, LoginCommand, LoginResult, NewAccount};
use auth_server::auth::{AuthContext, AuthError, AuthResult};
use auth_server::store::{
    ADMIN_AUTHORITY, AccountStatus, CredentialStore, DeviceInfo, RefreshTokenStore,
    SessionStatus, SessionStore, UserRecord,
};
use auth_server::test_support::{TestHarness, test_config_with};

const PASSWORD: &str = "correct horse";

fn command(identifier: &str, password: &str) -> LoginCommand {
    LoginCommand {
        identifier: identifier.to_string(),
        password: password.to_string(),
        remember_me: false,
        device: DeviceInfo::default(),
    }
}

async fn login(harness: &TestHarness, identifier: &str, password: &str) -> AuthResult<LoginResult> {
    harness.service.login(command(identifier, password)).await
}

async fn login_context(harness: &TestHarness, identifier: &str, password: &str) -> (LoginResult, AuthContext) {
    let result = login(harness, identifier, password)
        .await
        .expect("login succeeds");
    let ctx = harness
        .service
        .authenticate(&result.tokens.access.token)
        .await
        .expect("fresh access token authenticates");
    (result, ctx)
}

async fn create_admin(harness: &TestHarness) -> UserRecord {
    let hash = harness
        .service
        .passwords()
        .hash_password(PASSWORD)
        .expect("hash");
    let mut admin = UserRecord::pending("root", "root@example.com", hash, "en", harness.service.now());
    admin.activated = true;
    admin.account_status = AccountStatus::Active;
    admin.authorities.push(ADMIN_AUTHORITY.to_string());
    harness.store.insert_user(&admin).await.expect("insert admin");
    admin
}

#[tokio::test]
async fn register_then_activate_then_login() {
    let harness = TestHarness::new();
    let user = harness
        .service
        .register(NewAccount {
            login: "Alice".into(),
            email: "Alice@Example.com".into(),
            password: PASSWORD.into(),
            language: Some("fr".into()),
        })
        .await
        .expect("registration succeeds");
    assert_eq!(user.login, "alice");
    assert_eq!(user.email, "alice@example.com");
    assert_eq!(user.account_status, AccountStatus::PendingVerification);

    assert!(matches!(
        login(&harness, "alice", PASSWORD).await,
        Err(AuthError::NotActivated)
    ));

    let key = harness
        .mailer
        .last_token(MailKind::Activation, "alice@example.com")
        .expect("activation mail");
    let outcome = harness.service.activate(&key).await.expect("activation");
    assert!(matches!(outcome, ActivationOutcome::Activated(ref u) if u.activated && u.email_verified));
    assert!(matches!(
        harness.service.activate(&key).await,
        Err(AuthError::InvalidActivationKey)
    ));

    let result = login(&harness, "ALICE@example.com", PASSWORD)
        .await
        .expect("login by email");
    assert_eq!(result.user.id, user.id);
    assert_eq!(result.tokens.access.expires_in, 900);
    assert!(result.user.last_login_at.is_some());
}

#[tokio::test]
async fn duplicate_login_or_email_is_rejected() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;

    let taken_login = harness
        .service
        .register(NewAccount {
            login: "ALICE".into(),
            email: "other@example.com".into(),
            password: PASSWORD.into(),
            language: None,
        })
        .await;
    assert!(matches!(taken_login, Err(AuthError::LoginTaken)));

    let taken_email = harness
        .service
        .register(NewAccount {
            login: "bob".into(),
            email: "alice@EXAMPLE.com".into(),
            password: PASSWORD.into(),
            language: None,
        })
        .await;
    assert!(matches!(taken_email, Err(AuthError::EmailTaken)));
}

#[tokio::test]
async fn login_shaped_like_an_email_cannot_shadow_an_address() {
    let harness = TestHarness::new();
    harness.register_active("victim", "victim@example.com", PASSWORD).await;

    let squatter = harness
        .service
        .register(NewAccount {
            login: "victim@example.com".into(),
            email: "attacker@example.net".into(),
            password: "attacker secret".into(),
            language: None,
        })
        .await;
    assert!(matches!(squatter, Err(AuthError::Validation(_))));

    let result = login(&harness, "victim@example.com", PASSWORD)
        .await
        .expect("owner logs in by email");
    assert_eq!(result.user.login, "victim");
}

#[tokio::test]
async fn registration_survives_mail_failure() {
    let harness = TestHarness::new();
    harness.mailer.fail_sends(true);

    let user = harness
        .service
        .register(NewAccount {
            login: "carol".into(),
            email: "carol@example.com".into(),
            password: PASSWORD.into(),
            language: None,
        })
        .await
        .expect("registration succeeds without mail");

    assert_eq!(harness.mailer.sent().len(), 1);
    let stored = harness.store.find_user(user.id).await.unwrap().unwrap();
    assert!(stored.email_verification_token.is_some());
}

#[tokio::test]
async fn weak_password_is_rejected_at_registration() {
    let harness = TestHarness::new();
    let result = harness
        .service
        .register(NewAccount {
            login: "dave".into(),
            email: "dave@example.com".into(),
            password: "short".into(),
            language: None,
        })
        .await;
    assert!(matches!(result, Err(AuthError::Validation(_))));
    assert!(harness.mailer.sent().is_empty());
}

#[tokio::test]
async fn unknown_user_gets_invalid_credentials() {
    let harness = TestHarness::new();
    assert!(matches!(
        login(&harness, "nobody", PASSWORD).await,
        Err(AuthError::InvalidCredentials)
    ));
}

#[tokio::test]
async fn five_failures_lock_the_account_for_thirty_minutes() {
    let harness = TestHarness::new();
    let user = harness.register_active("alice", "alice@example.com", PASSWORD).await;

    for _ in 0..5 {
        assert!(matches!(
            login(&harness, "alice", "wrong password").await,
            Err(AuthError::InvalidCredentials)
        ));
    }
    let stored = harness.store.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(stored.failed_login_attempts, 5);
    assert_eq!(stored.account_status, AccountStatus::Locked);

    // The right password does not help while the lock holds.
    assert!(matches!(
        login(&harness, "alice", PASSWORD).await,
        Err(AuthError::AccountLocked)
    ));

    harness.clock.advance(Duration::minutes(31));
    let result = login(&harness, "alice", PASSWORD)
        .await
        .expect("login after the lock expires");
    assert_eq!(result.user.failed_login_attempts, 0);
    assert!(result.user.account_locked_until.is_none());
    assert_eq!(result.user.account_status, AccountStatus::Active);
}

#[tokio::test]
async fn successful_login_resets_the_failure_counter() {
    let harness = TestHarness::new();
    let user = harness.register_active("alice", "alice@example.com", PASSWORD).await;

    for _ in 0..4 {
        let _ = login(&harness, "alice", "wrong password").await;
    }
    login(&harness, "alice", PASSWORD).await.expect("login");
    let stored = harness.store.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(stored.failed_login_attempts, 0);

    // A fresh run of failures starts from zero.
    let _ = login(&harness, "alice", "wrong password").await;
    let stored = harness.store.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(stored.failed_login_attempts, 1);
}

#[tokio::test]
async fn remember_me_extends_the_access_window() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;

    let mut cmd = command("alice", PASSWORD);
    cmd.remember_me = true;
    let result = harness.service.login(cmd).await.expect("login");
    assert_eq!(result.tokens.access.expires_in, 7 * 24 * 60 * 60);
}

#[tokio::test]
async fn access_token_expires_with_the_clock() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (result, _) = login_context(&harness, "alice", PASSWORD).await;

    harness.clock.advance(Duration::minutes(16));
    assert!(matches!(
        harness.service.authenticate(&result.tokens.access.token).await,
        Err(AuthError::TokenExpired)
    ));
}

#[tokio::test]
async fn refresh_rotates_both_tokens() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (first, _) = login_context(&harness, "alice", PASSWORD).await;

    harness.clock.advance(Duration::minutes(5));
    let rotated = harness
        .service
        .refresh(&first.tokens.refresh.token, &DeviceInfo::default())
        .await
        .expect("refresh succeeds");
    assert_eq!(rotated.session_id, first.tokens.session_id);
    assert_ne!(rotated.refresh.token, first.tokens.refresh.token);
    assert_eq!(rotated.refresh.family_id, first.tokens.refresh.family_id);

    // The superseded access token no longer matches the session.
    assert!(matches!(
        harness.service.authenticate(&first.tokens.access.token).await,
        Err(AuthError::TokenInvalid)
    ));
    harness
        .service
        .authenticate(&rotated.access.token)
        .await
        .expect("rotated access token authenticates");

    let previous = harness
        .store
        .find_refresh_token(first.tokens.refresh.token_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(previous.replaced_by, Some(rotated.refresh.token_id));
}

#[tokio::test]
async fn replayed_refresh_token_revokes_the_chain_and_session() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (first, _) = login_context(&harness, "alice", PASSWORD).await;

    let rotated = harness
        .service
        .refresh(&first.tokens.refresh.token, &DeviceInfo::default())
        .await
        .expect("first redemption");

    let replay = harness
        .service
        .refresh(&first.tokens.refresh.token, &DeviceInfo::default())
        .await;
    assert!(matches!(replay, Err(AuthError::TokenReuseDetected { .. })));

    let successor = harness
        .store
        .find_refresh_token(rotated.refresh.token_id)
        .await
        .unwrap()
        .unwrap();
    assert!(successor.revoked);

    let session = harness
        .store
        .find_session(first.tokens.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Revoked);

    assert!(harness
        .service
        .refresh(&rotated.refresh.token, &DeviceInfo::default())
        .await
        .is_err());
    assert!(matches!(
        harness.service.authenticate(&rotated.access.token).await,
        Err(AuthError::TokenInvalid)
    ));
}

#[tokio::test]
async fn concurrent_refresh_has_exactly_one_winner() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (first, _) = login_context(&harness, "alice", PASSWORD).await;

    let device = DeviceInfo::default();
    let token = first.tokens.refresh.token.clone();
    let (a, b) = tokio::join!(
        harness.service.refresh(&token, &device),
        harness.service.refresh(&token, &device)
    );

    let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(AuthError::TokenReuseDetected { .. })));
}

#[tokio::test]
async fn expired_refresh_token_is_rejected_without_cascade() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (first, _) = login_context(&harness, "alice", PASSWORD).await;

    harness.clock.advance(Duration::days(31));
    assert!(matches!(
        harness
            .service
            .refresh(&first.tokens.refresh.token, &DeviceInfo::default())
            .await,
        Err(AuthError::TokenExpired)
    ));
    let token = harness
        .store
        .find_refresh_token(first.tokens.refresh.token_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!token.revoked);
}

#[tokio::test]
async fn garbage_refresh_token_is_invalid() {
    let harness = TestHarness::new();
    for token in ["", "not-a-token", "00000000-0000-0000-0000-000000000000.secret"] {
        assert!(matches!(
            harness.service.refresh(token, &DeviceInfo::default()).await,
            Err(AuthError::TokenInvalid)
        ));
    }
}

#[tokio::test]
async fn logout_invalidates_the_access_token() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (result, ctx) = login_context(&harness, "alice", PASSWORD).await;

    harness.service.logout(&ctx).await.expect("logout");
    assert!(matches!(
        harness.service.authenticate(&result.tokens.access.token).await,
        Err(AuthError::TokenInvalid)
    ));

    let session = harness
        .store
        .find_session(result.tokens.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::LoggedOut);
    let token = harness
        .store
        .find_refresh_token(result.tokens.refresh.token_id)
        .await
        .unwrap()
        .unwrap();
    assert!(token.revoked);

    // Logging out twice is harmless.
    harness.service.logout(&ctx).await.expect("second logout");
}

#[tokio::test]
async fn new_login_on_the_same_device_supersedes_the_old_session() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;

    let mut cmd = command("alice", PASSWORD);
    cmd.device.device_id = Some("laptop".into());
    let first = harness.service.login(cmd.clone()).await.expect("first login");
    let second = harness.service.login(cmd).await.expect("second login");

    let old = harness
        .store
        .find_session(first.tokens.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.status, SessionStatus::Revoked);
    assert!(matches!(
        harness.service.authenticate(&first.tokens.access.token).await,
        Err(AuthError::TokenInvalid)
    ));
    harness
        .service
        .authenticate(&second.tokens.access.token)
        .await
        .expect("newest session stays active");
}

#[tokio::test]
async fn single_session_policy_can_be_disabled() {
    let harness = TestHarness::with_config(test_config_with(&[(
        "AUTH_SINGLE_SESSION_PER_DEVICE",
        "false",
    )]));
    harness.register_active("alice", "alice@example.com", PASSWORD).await;

    let mut cmd = command("alice", PASSWORD);
    cmd.device.device_id = Some("laptop".into());
    let first = harness.service.login(cmd.clone()).await.expect("first login");
    harness.service.login(cmd).await.expect("second login");

    harness
        .service
        .authenticate(&first.tokens.access.token)
        .await
        .expect("both sessions stay active");
}

#[tokio::test]
async fn reset_token_is_single_use_and_revokes_sessions() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (session, _) = login_context(&harness, "alice", PASSWORD).await;

    harness.service.forgot_password("Alice@Example.com").await;
    let token = harness
        .mailer
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .expect("reset mail");

    harness
        .service
        .reset_password(&token, "a brand new secret")
        .await
        .expect("reset succeeds");
    assert!(matches!(
        harness
            .service
            .reset_password(&token, "yet another secret")
            .await,
        Err(AuthError::InvalidOrExpiredToken)
    ));

    assert!(matches!(
        login(&harness, "alice", PASSWORD).await,
        Err(AuthError::InvalidCredentials)
    ));
    login(&harness, "alice", "a brand new secret")
        .await
        .expect("login with the new password");

    assert!(matches!(
        harness.service.authenticate(&session.tokens.access.token).await,
        Err(AuthError::TokenInvalid)
    ));
}

#[tokio::test]
async fn reset_revokes_sessions_even_when_history_cannot_be_written() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (session, _) = login_context(&harness, "alice", PASSWORD).await;

    harness.service.forgot_password("alice@example.com").await;
    let token = harness
        .mailer
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .expect("reset mail");

    harness.store.fail_password_history(true);
    harness
        .service
        .reset_password(&token, "a brand new secret")
        .await
        .expect("reset succeeds without history");

    let refresh = harness
        .store
        .find_refresh_token(session.tokens.refresh.token_id)
        .await
        .unwrap()
        .unwrap();
    assert!(refresh.revoked);
    assert!(matches!(
        harness.service.authenticate(&session.tokens.access.token).await,
        Err(AuthError::TokenInvalid)
    ));
}

#[tokio::test]
async fn registration_mails_the_key_even_when_history_cannot_be_written() {
    let harness = TestHarness::new();
    harness.store.fail_password_history(true);

    harness
        .service
        .register(NewAccount {
            login: "dave".into(),
            email: "dave@example.com".into(),
            password: PASSWORD.into(),
            language: None,
        })
        .await
        .expect("registration succeeds without history");
    assert!(harness
        .mailer
        .last_token(MailKind::Activation, "dave@example.com")
        .is_some());
}

#[tokio::test]
async fn expired_reset_token_leaves_the_password_unchanged() {
    let harness = TestHarness::new();
    let user = harness.register_active("alice", "alice@example.com", PASSWORD).await;

    harness.service.forgot_password("alice@example.com").await;
    let token = harness
        .mailer
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .expect("reset mail");

    harness.clock.advance(Duration::minutes(61));
    assert!(matches!(
        harness
            .service
            .reset_password(&token, "a brand new secret")
            .await,
        Err(AuthError::InvalidOrExpiredToken)
    ));

    let stored = harness.store.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(stored.password_hash, user.password_hash);
    login(&harness, "alice", PASSWORD)
        .await
        .expect("old password still works");
}

#[tokio::test]
async fn reset_rejects_a_recent_password_without_consuming_the_token() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;

    harness.service.forgot_password("alice@example.com").await;
    let token = harness
        .mailer
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .expect("reset mail");

    assert!(matches!(
        harness.service.reset_password(&token, PASSWORD).await,
        Err(AuthError::PasswordReused)
    ));
    harness
        .service
        .reset_password(&token, "a brand new secret")
        .await
        .expect("token still usable");
}

#[tokio::test]
async fn forgot_password_is_silent_for_unknown_addresses() {
    let harness = TestHarness::new();
    harness.service.forgot_password("ghost@example.com").await;
    assert!(harness.mailer.sent().is_empty());
}

#[tokio::test]
async fn reset_also_unlocks_a_locked_account() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    for _ in 0..5 {
        let _ = login(&harness, "alice", "wrong password").await;
    }

    harness.service.forgot_password("alice@example.com").await;
    let token = harness
        .mailer
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .expect("reset mail");
    harness
        .service
        .reset_password(&token, "a brand new secret")
        .await
        .expect("reset");

    login(&harness, "alice", "a brand new secret")
        .await
        .expect("account is usable again");
}

#[tokio::test]
async fn change_password_with_wrong_current_password_changes_nothing() {
    let harness = TestHarness::new();
    let user = harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (_, ctx) = login_context(&harness, "alice", PASSWORD).await;
    let before = harness.store.find_user(user.id).await.unwrap().unwrap();

    assert!(matches!(
        harness
            .service
            .change_password(&ctx, "not my password", "a brand new secret")
            .await,
        Err(AuthError::WrongCurrentPassword)
    ));

    let after = harness.store.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(after.password_hash, before.password_hash);
    assert_eq!(after.version, before.version);
}

#[tokio::test]
async fn change_password_keeps_the_current_session_only() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;

    let mut phone = command("alice", PASSWORD);
    phone.device.device_id = Some("phone".into());
    let other = harness.service.login(phone).await.expect("second device");
    let (current, ctx) = login_context(&harness, "alice", PASSWORD).await;

    assert!(matches!(
        harness.service.change_password(&ctx, PASSWORD, PASSWORD).await,
        Err(AuthError::PasswordReused)
    ));
    harness
        .service
        .change_password(&ctx, PASSWORD, "a brand new secret")
        .await
        .expect("change succeeds");

    harness
        .service
        .authenticate(&current.tokens.access.token)
        .await
        .expect("current session survives");
    harness
        .service
        .refresh(&current.tokens.refresh.token, &DeviceInfo::default())
        .await
        .expect("current refresh chain survives");
    assert!(matches!(
        harness.service.authenticate(&other.tokens.access.token).await,
        Err(AuthError::TokenInvalid)
    ));
}

#[tokio::test]
async fn stale_device_refresh_after_password_change_ends_every_session() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;

    let mut phone = command("alice", PASSWORD);
    phone.device.device_id = Some("phone".into());
    let other = harness.service.login(phone).await.expect("second device");
    let (current, ctx) = login_context(&harness, "alice", PASSWORD).await;

    harness
        .service
        .change_password(&ctx, PASSWORD, "a brand new secret")
        .await
        .expect("change succeeds");

    assert!(matches!(
        harness
            .service
            .refresh(&other.tokens.refresh.token, &DeviceInfo::default())
            .await,
        Err(AuthError::TokenReuseDetected { .. })
    ));
    let kept = harness
        .store
        .find_session(current.tokens.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.status, SessionStatus::Revoked);
}

#[tokio::test]
async fn expired_activation_key_can_be_reissued() {
    let harness = TestHarness::new();
    harness
        .service
        .register(NewAccount {
            login: "erin".into(),
            email: "erin@example.com".into(),
            password: PASSWORD.into(),
            language: None,
        })
        .await
        .expect("registration");
    let stale = harness
        .mailer
        .last_token(MailKind::Activation, "erin@example.com")
        .expect("activation mail");

    harness.clock.advance(Duration::hours(25));
    assert!(matches!(
        harness.service.activate(&stale).await,
        Err(AuthError::ActivationKeyExpired)
    ));

    harness.service.resend_activation("erin@example.com").await;
    let fresh = harness
        .mailer
        .last_token(MailKind::Activation, "erin@example.com")
        .expect("second activation mail");
    assert_ne!(fresh, stale);
    assert!(matches!(
        harness.service.activate(&fresh).await,
        Ok(ActivationOutcome::Activated(_))
    ));
}

#[tokio::test]
async fn sessions_can_be_listed_and_revoked_by_their_owner() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    harness.register_active("bob", "bob@example.com", PASSWORD).await;

    let mut phone = command("alice", PASSWORD);
    phone.device.device_id = Some("phone".into());
    let other = harness.service.login(phone).await.expect("phone login");
    let (_, ctx) = login_context(&harness, "alice", PASSWORD).await;
    let (_, bob) = login_context(&harness, "bob", PASSWORD).await;

    let sessions = harness.service.list_sessions(&ctx).await.expect("list");
    assert_eq!(sessions.len(), 2);

    assert!(matches!(
        harness
            .service
            .revoke_session(&bob, other.tokens.session_id)
            .await,
        Err(AuthError::NotFound)
    ));
    harness
        .service
        .revoke_session(&ctx, other.tokens.session_id)
        .await
        .expect("owner revokes");
    assert_eq!(harness.service.list_sessions(&ctx).await.unwrap().len(), 1);
    assert!(harness
        .service
        .refresh(&other.tokens.refresh.token, &DeviceInfo::default())
        .await
        .is_err());
}

#[tokio::test]
async fn admin_deactivation_revokes_every_session() {
    let harness = TestHarness::new();
    create_admin(&harness).await;
    let user = harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (alice, alice_ctx) = login_context(&harness, "alice", PASSWORD).await;
    let (_, admin) = login_context(&harness, "root", PASSWORD).await;

    assert!(matches!(
        harness.service.admin_deactivate(&alice_ctx, user.id).await,
        Err(AuthError::Forbidden)
    ));

    let deactivated = harness
        .service
        .admin_deactivate(&admin, user.id)
        .await
        .expect("admin deactivates");
    assert_eq!(deactivated.account_status, AccountStatus::Inactive);

    let active = harness
        .store
        .list_sessions_for_user(user.id, Some(SessionStatus::Active))
        .await
        .unwrap();
    assert!(active.is_empty());
    assert!(matches!(
        harness.service.authenticate(&alice.tokens.access.token).await,
        Err(AuthError::TokenInvalid)
    ));
    assert!(matches!(
        login(&harness, "alice", PASSWORD).await,
        Err(AuthError::NotActivated)
    ));

    harness
        .service
        .admin_activate(&admin, user.id)
        .await
        .expect("admin reactivates");
    login(&harness, "alice", PASSWORD)
        .await
        .expect("login after reactivation");
}

#[tokio::test]
async fn admin_unlock_clears_the_lock() {
    let harness = TestHarness::new();
    create_admin(&harness).await;
    let user = harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (_, admin) = login_context(&harness, "root", PASSWORD).await;

    for _ in 0..5 {
        let _ = login(&harness, "alice", "wrong password").await;
    }
    let unlocked = harness
        .service
        .admin_unlock(&admin, user.id)
        .await
        .expect("unlock");
    assert_eq!(unlocked.failed_login_attempts, 0);
    assert_eq!(unlocked.account_status, AccountStatus::Active);
    login(&harness, "alice", PASSWORD)
        .await
        .expect("login after unlock");
}

#[tokio::test]
async fn admin_revoke_sessions_counts_revocations() {
    let harness = TestHarness::new();
    create_admin(&harness).await;
    let user = harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (_, admin) = login_context(&harness, "root", PASSWORD).await;
    login(&harness, "alice", PASSWORD).await.expect("login");
    login(&harness, "alice", PASSWORD).await.expect("login");

    let revoked = harness
        .service
        .admin_revoke_sessions(&admin, user.id)
        .await
        .expect("revoke");
    assert_eq!(revoked, 2);
    assert!(matches!(
        harness
            .service
            .admin_revoke_sessions(&admin, uuid::Uuid::new_v4())
            .await,
        Err(AuthError::NotFound)
    ));
}

#[tokio::test]
async fn login_history_records_failures_and_successes() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let _ = login(&harness, "alice", "wrong password").await;
    let (_, ctx) = login_context(&harness, "alice", PASSWORD).await;

    let history = harness
        .service
        .recent_logins(&ctx, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|event| event.successful).count(), 1);
    assert!(history
        .iter()
        .any(|event| event.failure_reason.as_deref() == Some("bad_credentials")));
}

#[tokio::test]
async fn purge_removes_closed_sessions_but_keeps_refresh_tokens() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (first, ctx) = login_context(&harness, "alice", PASSWORD).await;
    harness.service.logout(&ctx).await.expect("logout");

    let early = harness.service.purge_expired().await.expect("purge");
    assert_eq!(early.sessions, 0);

    harness.clock.advance(Duration::days(61));
    let report = harness.service.purge_expired().await.expect("purge");
    assert_eq!(report.sessions, 1);

    let token = harness
        .store
        .find_refresh_token(first.tokens.refresh.token_id)
        .await
        .unwrap()
        .expect("refresh token row is retained");
    assert!(token.revoked);
}

#[tokio::test]
async fn consumed_token_replayed_after_purge_still_revokes_the_live_chain() {
    let harness = TestHarness::new();
    harness.register_active("alice", "alice@example.com", PASSWORD).await;
    let (first, _) = login_context(&harness, "alice", PASSWORD).await;

    harness.clock.advance(Duration::days(29));
    let second = harness
        .service
        .refresh(&first.tokens.refresh.token, &DeviceInfo::default())
        .await
        .expect("second link");
    harness.clock.advance(Duration::days(29));
    let third = harness
        .service
        .refresh(&second.refresh.token, &DeviceInfo::default())
        .await
        .expect("third link");

    harness.clock.advance(Duration::days(3));
    harness.service.purge_expired().await.expect("purge");

    let replay = harness
        .service
        .refresh(&first.tokens.refresh.token, &DeviceInfo::default())
        .await;
    assert!(matches!(replay, Err(AuthError::TokenReuseDetected { .. })));

    let live = harness
        .store
        .find_refresh_token(third.refresh.token_id)
        .await
        .unwrap()
        .unwrap();
    assert!(live.revoked);
    let session = harness
        .store
        .find_session(third.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Revoked);
}
