//! Service-level HTTP handlers. Authentication and admin handlers live in
//! [`crate::auth::routes`].

pub mod health;
