use std::io::{self, Write};

use chrono::Utc;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use auth_server::auth::service::{validate_email, validate_login};
use auth_server::auth::{AuthConfig, PasswordService};
use auth_server::store::{
    ADMIN_AUTHORITY, AccountStatus, CredentialStore, PasswordChangeReason, PasswordHistoryRecord,
    PasswordHistoryStore, PgStore, StoreError, UserRecord, run_migrations,
};

#[derive(Parser, Debug)]
#[command(name = "create_user", about = "Provision an activated local account")]
struct Args {
    /// Login name (case insensitive).
    #[arg(long)]
    login: String,

    /// Email address for the account (case insensitive).
    #[arg(long)]
    email: String,

    /// Plaintext password to hash and store for this user.
    #[arg(long)]
    password: String,

    /// Grant `ROLE_ADMIN` in addition to the default authority.
    #[arg(long)]
    admin: bool,

    #[arg(long, default_value = "en")]
    language: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let login = args.login.trim().to_lowercase();
    let email = args.email.trim().to_lowercase();

    if let Err(err) = validate_login(&login).and_then(|_| validate_email(&email)) {
        writeln!(io::stderr(), "error: {err}")?;
        std::process::exit(1);
    }

    // Argon2 parameters follow AUTH_ARGON2_* when the full auth config is present.
    let password_service = match AuthConfig::from_env() {
        Ok(config) => PasswordService::from_config(&config),
        Err(_) => PasswordService::new(),
    }
    .map_err(|err| io::Error::other(format!("argon2 init failed: {err}")))?;

    if let Err(err) = password_service.validate_strength(&args.password) {
        writeln!(io::stderr(), "error: {err}")?;
        std::process::exit(1);
    }
    let password_hash = password_service
        .hash_password(&args.password)
        .map_err(|err| io::Error::other(format!("password hash failed: {err}")))?;

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    run_migrations(&pool).await?;
    let store = PgStore::new(pool);

    let now = Utc::now();
    let mut user = UserRecord::pending(&login, &email, password_hash, &args.language, now);
    user.activated = true;
    user.email_verified = true;
    user.account_status = AccountStatus::Active;
    if args.admin {
        user.authorities.push(ADMIN_AUTHORITY.to_string());
    }

    match store.insert_user(&user).await {
        Ok(()) => {}
        Err(StoreError::Duplicate(field)) => {
            writeln!(io::stderr(), "error: {field} is already taken")?;
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    }

    store
        .append_password_history(&PasswordHistoryRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            password_hash: user.password_hash.clone(),
            changed_at: now,
            reason: PasswordChangeReason::Admin,
        })
        .await?;

    println!(
        "Created user '{}' <{}> with id {} and authorities {}",
        user.login,
        user.email,
        user.id,
        user.authorities.join(",")
    );
    Ok(())
}
