//! Clinic core library.
//!
//! Identity graph (persons, titulares, beneficiarios), waiting queue,
//! consultation recording and the role-based access gate, all backed by a
//! single SQLite store owned by [`db::Clinic`]. The UI layer sits outside
//! this crate and talks to it through the typed service API.

pub mod auth;
pub mod db;
pub mod directory;
pub mod episodes;
pub mod error;
pub mod identity;
pub mod models;
pub mod queue;

pub use db::Clinic;
pub use error::{ClinicError, Result};

/// Process configuration, read from the environment (`.env` supported).
pub mod config {
    /// Env var naming the SQLite file. Defaults to `clinica.db`.
    pub const DB_ENV: &str = "CLINICA_DB";
    /// Env var with the tracing filter. Defaults to `info`.
    pub const LOG_ENV: &str = "CLINICA_LOG";

    #[derive(Debug, Clone)]
    pub struct Config {
        pub database_path: String,
        pub log_filter: String,
    }

    impl Config {
        pub fn from_env() -> Self {
            Config {
                database_path: std::env::var(DB_ENV)
                    .unwrap_or_else(|_| "clinica.db".to_string()),
                log_filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string()),
            }
        }
    }
}
