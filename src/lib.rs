#[macro_use]
extern crate rocket;

pub mod auth;
pub mod db;
pub mod request_logger;
pub mod routes;
pub mod store;

use crate::auth::{AuthConfig, AuthService, AuthState, LogMailer, SystemClock};
use crate::db::AuthDb;
use crate::request_logger::RequestLogger;
use crate::store::{AuthStore, MemoryStore, PgStore, StoreBackend};
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket, Route};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};
use std::time::Duration;

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let rocket = mount_api(rocket::build());
    match StoreBackend::from_env() {
        Ok(StoreBackend::Postgres) => attach_postgres(rocket),
        Ok(StoreBackend::Memory) => {
            log::warn!("using the in-memory store; accounts and sessions are lost on restart");
            rocket
                .manage(StoreBackend::Memory)
                .attach(AdHoc::try_on_ignite("Auth Service", |rocket| async move {
                    install_auth_service(rocket, Arc::new(MemoryStore::new()))
                }))
        }
        Err(err) => rocket.attach(AdHoc::try_on_ignite(
            "Store Backend",
            move |rocket| async move {
                log::error!("invalid AUTH_STORE_BACKEND: {}", err);
                Err(rocket)
            },
        )),
    }
}

/// Every documented API route, including the generated `openapi.json`.
pub fn api_routes() -> Vec<Route> {
    openapi_get_routes![
        // Health routes
        routes::health::health_check,
        // Auth routes
        auth::routes::register,
        auth::routes::login,
        auth::routes::refresh,
        auth::routes::logout,
        auth::routes::activate,
        auth::routes::verify_email,
        auth::routes::resend_activation,
        auth::routes::forgot_password,
        auth::routes::reset_password,
        auth::routes::change_password,
        auth::routes::current_user,
        auth::routes::list_sessions,
        auth::routes::revoke_session,
        // Admin routes
        auth::routes::admin_unlock,
        auth::routes::admin_activate,
        auth::routes::admin_deactivate,
        auth::routes::admin_revoke_sessions,
    ]
}

/// Attaches the request logger, CORS, the API and docs mounts and the purge task.
/// The caller is responsible for managing [`AuthState`] and [`StoreBackend`].
pub fn mount_api(rocket: Rocket<Build>) -> Rocket<Build> {
    // Configure CORS
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Delete]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket
        .attach(RequestLogger)
        .attach(cors)
        .attach(AdHoc::on_liftoff("Spawn Purge Task", |rocket| {
            Box::pin(async move {
                match rocket.state::<AuthState>() {
                    Some(state) => {
                        let service = state.service.clone();
                        tokio::spawn(async move {
                            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                            loop {
                                ticker.tick().await;
                                if let Err(err) = service.purge_expired().await {
                                    log::warn!("purge of expired credentials failed: {}", err);
                                }
                            }
                        });
                    }
                    None => log::error!("failed to spawn purge task: auth state not found"),
                }
            })
        }))
        .mount("/api/v1", api_routes())
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Auth API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

fn attach_postgres(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .manage(StoreBackend::Postgres)
        .attach(AuthDb::init())
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match AuthDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match store::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        .attach(AdHoc::try_on_ignite("Auth Service", |rocket| async move {
            let pool = match AuthDb::fetch(&rocket) {
                Some(db) => (**db).clone(),
                None => {
                    log::error!("database pool not available for the auth store");
                    return Err(rocket);
                }
            };
            install_auth_service(rocket, Arc::new(PgStore::new(pool)))
        }))
}

fn install_auth_service<S>(rocket: Rocket<Build>, store: Arc<S>) -> Result<Rocket<Build>, Rocket<Build>>
where
    S: AuthStore + 'static,
{
    let config = match AuthConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("invalid auth configuration: {}", err);
            return Err(rocket);
        }
    };

    match AuthService::new(config, store, Arc::new(LogMailer), Arc::new(SystemClock)) {
        Ok(service) => Ok(rocket.manage(AuthState::new(service))),
        Err(err) => {
            log::error!("failed to initialise auth service: {}", err);
            Err(rocket)
        }
    }
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket};

    use crate::auth::mailer::MailKind;
    use crate::auth::service::NewAccount;
    use crate::auth::{AuthConfig, AuthService, AuthState, ManualClock, RecordingMailer};
    use crate::store::{MemoryStore, StoreBackend, UserRecord};

    pub use database::{TestDatabase, TestDatabaseError};

    pub const TEST_JWT_SECRET: &str = "0123456789abcdef0123456789abcdef";

    /// Default configuration with cheap Argon2 parameters.
    pub fn test_config() -> AuthConfig {
        test_config_with(&[])
    }

    /// Test configuration with selected `AUTH_*` keys overridden.
    pub fn test_config_with(overrides: &[(&str, &str)]) -> AuthConfig {
        let overrides: Vec<(String, String)> = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AuthConfig::from_lookup(|key| {
            if let Some((_, value)) = overrides.iter().find(|(k, _)| k == key) {
                return Some(value.clone());
            }
            match key {
                "AUTH_JWT_SECRET" => Some(TEST_JWT_SECRET.to_string()),
                "AUTH_ARGON2_MEMORY_KIB" => Some("1024".to_string()),
                "AUTH_ARGON2_ITERATIONS" => Some("1".to_string()),
                _ => None,
            }
        })
        .expect("test configuration is valid")
    }

    pub fn test_epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0)
            .single()
            .expect("valid test epoch")
    }

    /// Auth service wired to an in-memory store, a manual clock and a recording mailer.
    pub struct TestHarness {
        pub service: Arc<AuthService>,
        pub store: Arc<MemoryStore>,
        pub clock: Arc<ManualClock>,
        pub mailer: Arc<RecordingMailer>,
    }

    impl TestHarness {
        pub fn new() -> Self {
            Self::with_config(test_config())
        }

        pub fn with_config(config: AuthConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let clock = Arc::new(ManualClock::new(test_epoch()));
            let mailer = Arc::new(RecordingMailer::new());
            let service = AuthService::new(config, store.clone(), mailer.clone(), clock.clone())
                .expect("test auth service builds");

            Self {
                service: Arc::new(service),
                store,
                clock,
                mailer,
            }
        }

        pub fn state(&self) -> AuthState {
            AuthState {
                service: self.service.clone(),
            }
        }

        /// Registers an account and activates it with the mailed key.
        pub async fn register_active(&self, login: &str, email: &str, password: &str) -> UserRecord {
            self.service
                .register(NewAccount {
                    login: login.to_string(),
                    email: email.to_string(),
                    password: password.to_string(),
                    language: None,
                })
                .await
                .expect("registration succeeds");
            let key = self
                .mailer
                .last_token(MailKind::Activation, email)
                .expect("activation mail was sent");
            match self.service.activate(&key).await.expect("activation succeeds") {
                crate::auth::service::ActivationOutcome::Activated(user) => user,
                crate::auth::service::ActivationOutcome::AlreadyActive(user) => user,
            }
        }

        /// Rocket instance serving the full API on top of this harness.
        pub fn rocket(&self) -> Rocket<Build> {
            TestRocketBuilder::new().manage_auth_state(self.state()).build()
        }

        pub fn blocking_client(&self) -> Client {
            Client::tracked(self.rocket()).expect("valid Rocket instance")
        }

        pub async fn client(&self) -> AsyncClient {
            AsyncClient::tracked(self.rocket())
                .await
                .expect("valid Rocket instance")
        }
    }

    impl Default for TestHarness {
        fn default() -> Self {
            Self::new()
        }
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{
            ContainerAsync, ImageExt, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("neither TEST_DATABASE_URL nor AUTH_TEST_CONTAINERS is set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Provision a fresh database on the server named by `TEST_DATABASE_URL`,
            /// or in a disposable container when `AUTH_TEST_CONTAINERS=1`.
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::new(&url, None).await;
                }
                if std::env::var("AUTH_TEST_CONTAINERS").as_deref() == Ok("1") {
                    return Self::new_container().await;
                }
                Err(TestDatabaseError::MissingUrl)
            }

            async fn new_container() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().with_tag("16-alpine").start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
                Self::new(&url, Some(container)).await
            }

            async fn new(
                url: &str,
                container: Option<ContainerAsync<Postgres>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options: PgConnectOptions = url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql)
                    .execute(&admin_pool)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                crate::store::run_migrations(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container,
                })
            }

            /// Cloneable connection pool for use in tests and Rocket state.
            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ =
                                drop_database_with_fallback(admin_options.clone(), &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database_with_fallback(
                                        admin_options.clone(),
                                        &db_name,
                                    )
                                    .await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    pub struct TestRocketBuilder {
        figment: Figment,
        auth_state: Option<AuthState>,
        backend: StoreBackend,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                auth_state: None,
                backend: StoreBackend::Memory,
            }
        }

        pub fn manage_auth_state(mut self, state: AuthState) -> Self {
            self.auth_state = Some(state);
            self
        }

        pub fn backend(mut self, backend: StoreBackend) -> Self {
            self.backend = backend;
            self
        }

        /// Finish building the Rocket instance with every API route mounted.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = crate::mount_api(rocket::custom(self.figment)).manage(self.backend);
            if let Some(state) = self.auth_state {
                rocket = rocket.manage(state);
            }
            rocket
        }

        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }

    impl Default for TestRocketBuilder {
        fn default() -> Self {
            Self::new()
        }
    }
}
