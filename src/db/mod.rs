//! Persistence gateway for the clinic store.
//!
//! Owns the single SQLite pool everything else writes through. Tables are
//! created idempotently on every open; reference data (roles, permissions,
//! the bootstrap superuser, companies, the CIE-10 starter catalog) is seeded
//! only when the backing file was absent before the open, so a deliberately
//! emptied table is never refilled behind the operator's back.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::hash_secret;
use crate::error::{ClinicError, Result};
use crate::models::{Permission, Session};

/// Service facade over the clinic store. The `impl` blocks live with their
/// components: identity graph, directory search, queue, episode recorder and
/// the access control gate each extend this type in their own module.
pub struct Clinic {
    pub(crate) pool: SqlitePool,
    /// Live authenticated sessions keyed by opaque token.
    pub(crate) sessions: DashMap<String, Session>,
}

impl Clinic {
    /// Open (and create if missing) the store at `path`. Seeds reference
    /// data only when the backing file did not exist beforehand. Failure to
    /// open or migrate is fatal to the caller; there is no degraded mode.
    #[instrument(skip(path))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fresh = !path.exists();

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrate(&pool).await?;
        if fresh {
            seed(&pool).await?;
            info!(path = %path.display(), "created and seeded clinic store");
        }

        Ok(Clinic { pool, sessions: DashMap::new() })
    }

    /// In-memory store for tests; always migrated and seeded. A single
    /// connection keeps every statement on the same memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrate(&pool).await?;
        seed(&pool).await?;
        Ok(Clinic { pool, sessions: DashMap::new() })
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS persons (
        id TEXT PRIMARY KEY,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        nationality TEXT NOT NULL,
        national_id TEXT NOT NULL,
        birth_date TEXT NOT NULL,
        sex TEXT NOT NULL,
        phone TEXT,
        phone_alt TEXT,
        email TEXT UNIQUE,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (nationality, national_id)
    )",
    "CREATE TABLE IF NOT EXISTS companies (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        tax_id TEXT NOT NULL UNIQUE,
        phone TEXT,
        address TEXT
    )",
    "CREATE TABLE IF NOT EXISTS account_holders (
        id TEXT PRIMARY KEY,
        person_id TEXT NOT NULL UNIQUE
            REFERENCES persons(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        company_id TEXT REFERENCES companies(id) ON DELETE SET NULL
    )",
    "CREATE TABLE IF NOT EXISTS dependents (
        id TEXT PRIMARY KEY,
        person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
        holder_id TEXT NOT NULL
            REFERENCES account_holders(id) ON DELETE CASCADE,
        UNIQUE (person_id, holder_id)
    )",
    "CREATE TABLE IF NOT EXISTS patient_records (
        id TEXT PRIMARY KEY,
        person_id TEXT NOT NULL UNIQUE
            REFERENCES persons(id) ON DELETE CASCADE,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS queue_entries (
        id TEXT PRIMARY KEY,
        person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
        patient_record_id TEXT NOT NULL
            REFERENCES patient_records(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        service TEXT NOT NULL,
        account_type TEXT NOT NULL,
        status TEXT NOT NULL,
        checked_in_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cie10_codes (
        code TEXT PRIMARY KEY,
        description TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS consultations (
        id TEXT PRIMARY KEY,
        patient_record_id TEXT NOT NULL
            REFERENCES patient_records(id) ON DELETE CASCADE,
        queue_entry_id TEXT REFERENCES queue_entries(id) ON DELETE SET NULL,
        anamnesis TEXT NOT NULL,
        physical_exam TEXT NOT NULL,
        treatment_plan TEXT,
        recorded_by TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS consultation_diagnoses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        consultation_id TEXT NOT NULL
            REFERENCES consultations(id) ON DELETE CASCADE,
        code TEXT NOT NULL REFERENCES cie10_codes(code),
        description TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS consultation_documents (
        id TEXT PRIMARY KEY,
        consultation_id TEXT NOT NULL
            REFERENCES consultations(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        description TEXT,
        payload BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS treatment_orders (
        id TEXT PRIMARY KEY,
        patient_record_id TEXT NOT NULL
            REFERENCES patient_records(id) ON DELETE CASCADE,
        consultation_id TEXT REFERENCES consultations(id) ON DELETE SET NULL,
        procedure TEXT NOT NULL,
        frequency TEXT NOT NULL,
        valid_from TEXT NOT NULL,
        valid_until TEXT NOT NULL,
        status TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS treatment_executions (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL
            REFERENCES treatment_orders(id) ON DELETE CASCADE,
        executed_at INTEGER NOT NULL,
        observations TEXT,
        executed_by TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS roles (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS permissions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        permission TEXT NOT NULL,
        module TEXT NOT NULL,
        UNIQUE (role_id, permission)
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        role_id TEXT NOT NULL REFERENCES roles(id),
        person_id TEXT REFERENCES persons(id) ON DELETE SET NULL,
        created_at INTEGER NOT NULL
    )",
    // Storage backstop for the one-open-visit-per-person rule; the enqueue
    // pre-check handles the friendly message, this closes the race window.
    "CREATE UNIQUE INDEX IF NOT EXISTS queue_one_open
        ON queue_entries (person_id) WHERE status != 'completado'",
];

async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Roles shipped with a fresh store and their permission bundles.
const SEED_ROLES: &[(&str, &[Permission])] = &[
    ("superuser", &Permission::ALL),
    (
        "medico",
        &[
            Permission::ManageQueue,
            Permission::RecordConsultations,
            Permission::ManageTreatments,
            Permission::ManageCatalog,
            Permission::ViewReports,
        ],
    ),
    (
        "recepcion",
        &[
            Permission::ManagePersons,
            Permission::ManageAffiliations,
            Permission::ManageQueue,
            Permission::ViewReports,
        ],
    ),
];

const SEED_COMPANIES: &[(&str, &str)] = &[
    ("Innovatech", "J-30123456-7"),
    ("Corporación Orinoco", "J-29887766-1"),
];

/// Starter diagnosis catalog. Operators extend it through the catalog API.
const SEED_CIE10: &[(&str, &str)] = &[
    ("A09", "Diarrea y gastroenteritis de presunto origen infeccioso"),
    ("E11.9", "Diabetes mellitus tipo 2 sin complicaciones"),
    ("I10", "Hipertensión esencial (primaria)"),
    ("J00", "Rinofaringitis aguda (resfriado común)"),
    ("J03.9", "Amigdalitis aguda, no especificada"),
    ("J45.9", "Asma, no especificada"),
    ("K29.7", "Gastritis, no especificada"),
    ("M54.5", "Lumbago no especificado"),
    ("N39.0", "Infección de vías urinarias, sitio no especificado"),
    ("R51", "Cefalea"),
];

async fn seed(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    let now = Utc::now().timestamp();

    let mut superuser_role_id = None;
    for (name, permissions) in SEED_ROLES {
        let role_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO roles (id, name) VALUES (?, ?)")
            .bind(&role_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        for permission in *permissions {
            sqlx::query(
                "INSERT INTO permissions (role_id, permission, module) VALUES (?, ?, ?)",
            )
            .bind(&role_id)
            .bind(permission.as_str())
            .bind(permission.module())
            .execute(&mut *tx)
            .await?;
        }
        if *name == "superuser" {
            superuser_role_id = Some(role_id);
        }
    }

    // Bootstrap superuser; the operator is expected to rotate the secret.
    if let Some(role_id) = superuser_role_id {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, role_id, person_id, created_at)
             VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind("admin")
        .bind(hash_secret("admin")?)
        .bind(&role_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    for (name, tax_id) in SEED_COMPANIES {
        sqlx::query("INSERT INTO companies (id, name, tax_id) VALUES (?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(name)
            .bind(tax_id)
            .execute(&mut *tx)
            .await?;
    }

    for (code, description) in SEED_CIE10 {
        sqlx::query("INSERT INTO cie10_codes (code, description) VALUES (?, ?)")
            .bind(code)
            .bind(description)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Unix seconds → UTC datetime for rows read back from the store.
pub(crate) fn datetime_from_unix(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ClinicError::Integrity(format!("corrupt timestamp in store: {secs}")))
}

/// ISO date column → `NaiveDate`.
pub(crate) fn date_from_column(value: &str) -> Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ClinicError::Integrity(format!("corrupt date in store: {value}")))
}
