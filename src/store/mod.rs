//! SQLite persistence for configurations, registrations, prompts and the
//! metrics ledger.
//!
//! One pooled database; every connection applies the same pragmas on
//! checkout (WAL, foreign keys on, busy timeout). Timestamps are RFC 3339
//! UTC strings with fixed millisecond precision, so string comparison is
//! chronological comparison — the metrics queries rely on that.
//!
//! `api_call_metrics` deliberately carries no foreign key on
//! `registration_id`: authentication failures are recorded against ids
//! that may not exist.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::providers::ProviderKind;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Visible prefix/suffix length of a masked key.
const MASK_VISIBLE: usize = 4;

// ── Entities ──────────────────────────────────────────────────────────────────

/// One named provider configuration. `settings` is the provider-specific
/// JSON record as stored (sensitive fields encrypted).
#[derive(Debug, Clone)]
pub struct InferenceConfiguration {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub settings: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl InferenceConfiguration {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        kind: ProviderKind,
        settings: impl Into<String>,
    ) -> Self {
        let ts = now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            kind,
            settings: settings.into(),
            active: true,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }
}

/// An externally exposed endpoint: binds a gateway key to one configuration
/// and optionally one system prompt.
#[derive(Debug, Clone)]
pub struct ApiRegistration {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub api_key: String,
    pub configuration_id: String,
    pub system_prompt_id: Option<String>,
    pub active: bool,
    pub created_at: String,
}

impl ApiRegistration {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        configuration_id: impl Into<String>,
        system_prompt_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            description: None,
            api_key: new_api_key(),
            configuration_id: configuration_id.into(),
            system_prompt_id,
            active: true,
            created_at: now(),
        }
    }
}

/// A reusable prompt. Prompts in the structured-output category may carry a
/// field specification (JSON array, see the schema module) and a free-form
/// schema description.
#[derive(Debug, Clone)]
pub struct SystemPrompt {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub category: String,
    pub content: String,
    pub schema_fields: Option<String>,
    pub schema_description: Option<String>,
}

impl SystemPrompt {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        category: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            category: category.into(),
            content: content.into(),
            schema_fields: None,
            schema_description: None,
        }
    }
}

// ── Pool / schema ─────────────────────────────────────────────────────────────

/// Open (creating if needed) the database at `path` and return a pool whose
/// connections share the standard pragmas.
pub fn open_pool(path: &Path) -> Result<DbPool, GatewayError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Store(format!("create {}: {e}", parent.display())))?;
        }
    }
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = Pool::builder().build(manager)?;
    info!(path = %path.display(), "database pool ready");
    Ok(pool)
}

/// Create all tables. Idempotent; run once at startup.
pub fn init_schema(conn: &Connection) -> Result<(), GatewayError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS inference_configurations (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            name        TEXT NOT NULL,
            kind        TEXT NOT NULL,
            settings    TEXT NOT NULL,
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS system_prompts (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL,
            title               TEXT NOT NULL,
            category            TEXT NOT NULL,
            content             TEXT NOT NULL,
            schema_fields       TEXT,
            schema_description  TEXT
        );

        CREATE TABLE IF NOT EXISTS api_registrations (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL,
            name              TEXT NOT NULL,
            description       TEXT,
            api_key           TEXT NOT NULL UNIQUE,
            configuration_id  TEXT NOT NULL REFERENCES inference_configurations(id),
            system_prompt_id  TEXT REFERENCES system_prompts(id),
            active            INTEGER NOT NULL DEFAULT 1,
            created_at        TEXT NOT NULL
        );

        -- No foreign key on registration_id: failed-auth calls are recorded
        -- against ids that may not exist.
        CREATE TABLE IF NOT EXISTS api_call_metrics (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            registration_id   TEXT NOT NULL,
            timestamp         TEXT NOT NULL,
            method            TEXT NOT NULL,
            endpoint          TEXT NOT NULL,
            response_time_ms  INTEGER NOT NULL,
            status_code       INTEGER NOT NULL,
            request_size      INTEGER NOT NULL,
            response_size     INTEGER NOT NULL,
            error_message     TEXT,
            user_agent        TEXT,
            client_ip         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_metrics_registration_time
            ON api_call_metrics (registration_id, timestamp);",
    )?;
    Ok(())
}

/// Current time as a fixed-precision RFC 3339 UTC string.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Configurations ────────────────────────────────────────────────────────────

pub fn insert_configuration(
    conn: &Connection,
    config: &InferenceConfiguration,
) -> Result<(), GatewayError> {
    conn.execute(
        "INSERT INTO inference_configurations
            (id, user_id, name, kind, settings, active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            &config.id,
            &config.user_id,
            &config.name,
            config.kind.as_str(),
            &config.settings,
            config.active,
            &config.created_at,
            &config.updated_at,
        ),
    )?;
    Ok(())
}

pub fn get_configuration(
    conn: &Connection,
    id: &str,
) -> Result<Option<InferenceConfiguration>, GatewayError> {
    let row = conn
        .query_row(
            "SELECT id, user_id, name, kind, settings, active, created_at, updated_at
             FROM inference_configurations WHERE id = ?1",
            [id],
            configuration_from_row,
        )
        .optional()?;
    Ok(row)
}

/// The user's default configuration: the earliest-created active one.
/// Insertion order (rowid) is the tie-break, which makes the default stable
/// across equal timestamps.
pub fn first_active_configuration(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<InferenceConfiguration>, GatewayError> {
    let row = conn
        .query_row(
            "SELECT id, user_id, name, kind, settings, active, created_at, updated_at
             FROM inference_configurations
             WHERE user_id = ?1 AND active = 1
             ORDER BY created_at ASC, rowid ASC
             LIMIT 1",
            [user_id],
            configuration_from_row,
        )
        .optional()?;
    Ok(row)
}

fn configuration_from_row(row: &Row<'_>) -> Result<InferenceConfiguration, rusqlite::Error> {
    let kind_str: String = row.get(3)?;
    let kind = kind_str
        .parse::<ProviderKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(InferenceConfiguration {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        kind,
        settings: row.get(4)?,
        active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

// ── Registrations ─────────────────────────────────────────────────────────────

pub fn insert_registration(
    conn: &Connection,
    registration: &ApiRegistration,
) -> Result<(), GatewayError> {
    conn.execute(
        "INSERT INTO api_registrations
            (id, user_id, name, description, api_key, configuration_id,
             system_prompt_id, active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        (
            &registration.id,
            &registration.user_id,
            &registration.name,
            &registration.description,
            &registration.api_key,
            &registration.configuration_id,
            &registration.system_prompt_id,
            registration.active,
            &registration.created_at,
        ),
    )?;
    Ok(())
}

pub fn get_registration(
    conn: &Connection,
    id: &str,
) -> Result<Option<ApiRegistration>, GatewayError> {
    let row = conn
        .query_row(
            "SELECT id, user_id, name, description, api_key, configuration_id,
                    system_prompt_id, active, created_at
             FROM api_registrations WHERE id = ?1",
            [id],
            registration_from_row,
        )
        .optional()?;
    Ok(row)
}

/// The authentication lookup: both the id and the key must match an active
/// row. A miss says nothing about which part was wrong.
pub fn find_active_registration(
    conn: &Connection,
    id: &str,
    api_key: &str,
) -> Result<Option<ApiRegistration>, GatewayError> {
    let row = conn
        .query_row(
            "SELECT id, user_id, name, description, api_key, configuration_id,
                    system_prompt_id, active, created_at
             FROM api_registrations
             WHERE id = ?1 AND api_key = ?2 AND active = 1",
            [id, api_key],
            registration_from_row,
        )
        .optional()?;
    Ok(row)
}

fn registration_from_row(row: &Row<'_>) -> Result<ApiRegistration, rusqlite::Error> {
    Ok(ApiRegistration {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        api_key: row.get(4)?,
        configuration_id: row.get(5)?,
        system_prompt_id: row.get(6)?,
        active: row.get(7)?,
        created_at: row.get(8)?,
    })
}

// ── Prompts ───────────────────────────────────────────────────────────────────

pub fn insert_prompt(conn: &Connection, prompt: &SystemPrompt) -> Result<(), GatewayError> {
    conn.execute(
        "INSERT INTO system_prompts
            (id, user_id, title, category, content, schema_fields, schema_description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        (
            &prompt.id,
            &prompt.user_id,
            &prompt.title,
            &prompt.category,
            &prompt.content,
            &prompt.schema_fields,
            &prompt.schema_description,
        ),
    )?;
    Ok(())
}

pub fn get_prompt(conn: &Connection, id: &str) -> Result<Option<SystemPrompt>, GatewayError> {
    let row = conn
        .query_row(
            "SELECT id, user_id, title, category, content, schema_fields, schema_description
             FROM system_prompts WHERE id = ?1",
            [id],
            |row| {
                Ok(SystemPrompt {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    title: row.get(2)?,
                    category: row.get(3)?,
                    content: row.get(4)?,
                    schema_fields: row.get(5)?,
                    schema_description: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Generate a fresh gateway key: `pg-` + 32 hex chars.
pub fn new_api_key() -> String {
    format!("pg-{}", Uuid::new_v4().simple())
}

/// Display form of a key: first and last four characters, the rest elided.
pub fn masked_api_key(key: &str) -> String {
    if key.len() <= MASK_VISIBLE * 2 {
        return "****".to_string();
    }
    format!("{}...{}", &key[..MASK_VISIBLE], &key[key.len() - MASK_VISIBLE..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir.path().join("test.db")).unwrap();
        init_schema(&pool.get().unwrap()).unwrap();
        (dir, pool)
    }

    #[test]
    fn schema_init_is_idempotent() {
        let (_dir, pool) = test_pool();
        init_schema(&pool.get().unwrap()).unwrap();
    }

    #[test]
    fn configuration_round_trip() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let config = InferenceConfiguration::new(
            "u1",
            "prod gemini",
            ProviderKind::CloudMultimodal,
            r#"{"apiKey":"enc"}"#,
        );
        insert_configuration(&conn, &config).unwrap();

        let loaded = get_configuration(&conn, &config.id).unwrap().unwrap();
        assert_eq!(loaded.name, "prod gemini");
        assert_eq!(loaded.kind, ProviderKind::CloudMultimodal);
        assert!(loaded.active);
        assert!(get_configuration(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn first_active_prefers_earliest_insertion() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let first =
            InferenceConfiguration::new("u1", "first", ProviderKind::Local, r#"{"model":"m"}"#);
        let mut second =
            InferenceConfiguration::new("u1", "second", ProviderKind::Local, r#"{"model":"m"}"#);
        // identical timestamps force the rowid tie-break
        second.created_at = first.created_at.clone();
        second.updated_at = first.updated_at.clone();
        insert_configuration(&conn, &first).unwrap();
        insert_configuration(&conn, &second).unwrap();

        let default = first_active_configuration(&conn, "u1").unwrap().unwrap();
        assert_eq!(default.name, "first");

        // deactivating the first shifts the default
        conn.execute("UPDATE inference_configurations SET active = 0 WHERE id = ?1", [&first.id])
            .unwrap();
        let default = first_active_configuration(&conn, "u1").unwrap().unwrap();
        assert_eq!(default.name, "second");

        assert!(first_active_configuration(&conn, "someone-else").unwrap().is_none());
    }

    #[test]
    fn registration_auth_lookup_requires_both_parts() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let config =
            InferenceConfiguration::new("u1", "c", ProviderKind::Local, r#"{"model":"m"}"#);
        insert_configuration(&conn, &config).unwrap();
        let reg = ApiRegistration::new("u1", "my api", &config.id, None);
        insert_registration(&conn, &reg).unwrap();

        assert!(find_active_registration(&conn, &reg.id, &reg.api_key).unwrap().is_some());
        assert!(find_active_registration(&conn, &reg.id, "wrong-key").unwrap().is_none());
        assert!(find_active_registration(&conn, "wrong-id", &reg.api_key).unwrap().is_none());

        conn.execute("UPDATE api_registrations SET active = 0 WHERE id = ?1", [&reg.id]).unwrap();
        assert!(find_active_registration(&conn, &reg.id, &reg.api_key).unwrap().is_none());
    }

    #[test]
    fn prompt_round_trip_with_schema_fields() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let mut prompt = SystemPrompt::new("u1", "extract", "Structured Output", "Extract facts.");
        prompt.schema_fields = Some(r#"[{"name":"summary","type":"string"}]"#.into());
        insert_prompt(&conn, &prompt).unwrap();

        let loaded = get_prompt(&conn, &prompt.id).unwrap().unwrap();
        assert_eq!(loaded.category, "Structured Output");
        assert!(loaded.schema_fields.is_some());
        assert!(loaded.schema_description.is_none());
    }

    #[test]
    fn api_keys_have_prefix_and_mask() {
        let key = new_api_key();
        assert!(key.starts_with("pg-"));
        assert_eq!(key.len(), 35);
        assert_ne!(new_api_key(), key);

        let masked = masked_api_key(&key);
        assert!(masked.starts_with("pg-"));
        assert!(masked.contains("..."));
        assert!(!masked.contains(&key[5..20]));
        assert_eq!(masked_api_key("short"), "****");
    }
}
