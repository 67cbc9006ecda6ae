use serde_json::Value;
use sqlx::PgPool;

use super::{NodeSchema, StateStore, StoreError};

/// State store backed by a single Postgres table.
///
/// ```sql
/// CREATE TABLE state_nodes (
///     path     TEXT PRIMARY KEY,
///     role     TEXT,
///     unit     TEXT,
///     writable BOOLEAN NOT NULL DEFAULT FALSE,
///     value    TEXT
/// );
/// ```
///
/// Values are stored as JSON text.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it is missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_nodes (
                path     TEXT PRIMARY KEY,
                role     TEXT,
                unit     TEXT,
                writable BOOLEAN NOT NULL DEFAULT FALSE,
                value    TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("state_nodes", e))?;

        Ok(())
    }
}

fn map_sqlx_error(path: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(e.to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42501") => StoreError::PermissionDenied {
            path: path.to_string(),
            message: db.message().to_string(),
        },
        other => StoreError::Transient(other.to_string()),
    }
}

fn encode(path: &str, value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::InvalidValue {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn decode(path: &str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::InvalidValue {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// Escape `LIKE` wildcards so a meter slug never matches foreign paths.
fn like_prefix(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 3);
    for ch in path.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push_str(".%");
    out
}

#[async_trait::async_trait]
impl StateStore for PgStateStore {
    async fn get_value(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM state_nodes WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(path, e))?;

        match row {
            Some((Some(raw),)) => decode(path, &raw).map(Some),
            _ => Ok(None),
        }
    }

    async fn set_value(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let raw = encode(path, &value)?;
        sqlx::query(
            r#"
            INSERT INTO state_nodes (path, value)
            VALUES ($1, $2)
            ON CONFLICT (path) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(path)
        .bind(raw)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(path, e))?;

        Ok(())
    }

    async fn ensure_node(&self, path: &str, schema: &NodeSchema) -> Result<(), StoreError> {
        let initial = match schema.role.initial_value() {
            Some(v) => Some(encode(path, &v)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO state_nodes (path, role, unit, writable, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (path) DO UPDATE
                SET role = COALESCE(state_nodes.role, EXCLUDED.role),
                    unit = COALESCE(state_nodes.unit, EXCLUDED.unit),
                    writable = state_nodes.writable OR EXCLUDED.writable
            "#,
        )
        .bind(path)
        .bind(schema.role.as_str())
        .bind(schema.unit.as_deref())
        .bind(schema.writable)
        .bind(initial)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(path, e))?;

        Ok(())
    }

    async fn node_exists(&self, path: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM state_nodes WHERE path = $1)")
            .bind(path)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(path, e))
    }

    async fn delete_subtree(&self, path: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM state_nodes WHERE path = $1 OR path LIKE $2 ESCAPE '\\'")
            .bind(path)
            .bind(like_prefix(path))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(path, e))?;

        tracing::debug!(path, removed = result.rows_affected(), "deleted state subtree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("gas.main_2"), "gas.main\\_2.%");
        assert_eq!(like_prefix("water.100%"), "water.100\\%.%");
    }

    #[test]
    fn pool_timeouts_are_severe() {
        assert!(map_sqlx_error("x", sqlx::Error::PoolTimedOut).is_severe());
        assert!(!map_sqlx_error("x", sqlx::Error::RowNotFound).is_severe());
    }
}
