use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("auth_db")]
pub struct AuthDb(sqlx::PgPool);
