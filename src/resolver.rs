//! Configuration resolution: explicit id or the user's default, stored
//! settings text decoded into a usable JSON object with credentials
//! decrypted.

use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use crate::error::GatewayError;
use crate::providers::ProviderKind;
use crate::store;
use crate::vault::Vault;

/// A configuration ready for provider construction: settings parsed and
/// decrypted.
#[derive(Debug, Clone)]
pub struct ResolvedConfiguration {
    pub configuration_id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub settings: Value,
}

/// Resolve `configuration_id` for `user_id`, or the user's default when no
/// id is given. An explicit id must belong to the user and be active. The
/// two not-found cases carry distinct messages: an explicit id that
/// matched nothing is a different operator mistake than a user with no
/// active configuration at all.
pub fn resolve(
    conn: &Connection,
    vault: &Vault,
    user_id: &str,
    configuration_id: Option<&str>,
) -> Result<ResolvedConfiguration, GatewayError> {
    let config = match configuration_id {
        Some(id) => store::get_configuration(conn, id)?
            .filter(|c| c.user_id == user_id && c.active)
            .ok_or_else(|| {
                GatewayError::ConfigurationNotFound(format!(
                    "no active configuration with id '{id}'"
                ))
            })?,
        None => store::first_active_configuration(conn, user_id)?.ok_or_else(|| {
            GatewayError::ConfigurationNotFound(format!(
                "user '{user_id}' has no active configuration"
            ))
        })?,
    };
    debug!(configuration = %config.id, kind = %config.kind, "resolved configuration");

    let mut settings = parse_settings(&config.settings)?;
    vault.decrypt_sensitive_fields(config.kind, &mut settings);

    Ok(ResolvedConfiguration {
        configuration_id: config.id,
        name: config.name,
        kind: config.kind,
        settings,
    })
}

/// Decode stored settings text. Tolerates one level of double encoding (a
/// JSON string containing a JSON object), which older writers produced.
fn parse_settings(raw: &str) -> Result<Value, GatewayError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| GatewayError::InvalidSettings(format!("settings are not JSON: {e}")))?;
    let value = match value {
        Value::String(inner) => serde_json::from_str(&inner).map_err(|e| {
            GatewayError::InvalidSettings(format!("double-encoded settings are not JSON: {e}"))
        })?,
        other => other,
    };
    if !value.is_object() {
        return Err(GatewayError::InvalidSettings("settings must be a JSON object".into()));
    }
    Ok(value)
}
