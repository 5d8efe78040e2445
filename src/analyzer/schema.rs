//! Schema context gathering (§4.5 step 1): resolves the tables referenced by
//! a fingerprint into column lists, existing indexes and row-count estimates,
//! so the rule engine and the oracle prompt both have something to reason
//! about beyond raw SQL text.
//!
//! Identifier extraction is grounded on `QueryFingerprint::extract_tables` in
//! `profile_analyzer/analyzer/query_history.rs` (a `FROM`/`JOIN` regex over
//! the uppercased statement), extended here to keep case, strip aliases,
//! and preserve quoted/schema-qualified names per §4.5. Connection pooling
//! for the introspection queries reuses `MySQLPoolManager`'s
//! one-pool-per-host `DashMap` pattern.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::SourceType;
use crate::store::probe_registry::ProbeConnection;
use crate::utils::LruCache;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub indexed_columns: Vec<String>,
    pub row_estimate: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaContext {
    pub tables: Vec<TableInfo>,
    /// Table references the extractor found but could not resolve against
    /// the live schema (dropped table, cross-database synonym, a regex miss
    /// on an exotic join syntax) — logged, never fatal (§4.5 step 1).
    pub unresolved: Vec<String>,
}

static FROM_JOIN_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:from|join)\s+((?:`[^`]+`|"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)(?:\s*\.\s*(?:`[^`]+`|"[^"]+"|[A-Za-z_][A-Za-z0-9_]*))?)(?:\s+(?:as\s+)?(?:`[^`]+`|"[^"]+"|[A-Za-z_][A-Za-z0-9_]*))?"#,
    )
    .unwrap()
});

const RESERVED_ALIAS_WORDS: &[&str] = &[
    "where", "on", "using", "join", "inner", "left", "right", "full", "outer", "cross", "group",
    "order", "limit", "having", "union", "set",
];

fn strip_quotes(ident: &str) -> String {
    let trimmed = ident.trim();
    if (trimmed.starts_with('`') && trimmed.ends_with('`'))
        || (trimmed.starts_with('"') && trimmed.ends_with('"'))
    {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extracts the distinct table references from a `FROM`/`JOIN` clause,
/// handling aliased tables, schema-qualified names and quoted identifiers.
/// Best-effort: an unparseable join list simply yields fewer refs, never an
/// error (§4.5 step 1).
pub fn extract_table_refs(sql: &str) -> Vec<TableRef> {
    let mut seen = std::collections::HashSet::new();
    let mut refs = Vec::new();

    for caps in FROM_JOIN_TABLE.captures_iter(sql) {
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let parts: Vec<&str> = raw.splitn(2, '.').collect();
        let (schema, name) = if parts.len() == 2 {
            (Some(strip_quotes(parts[0])), strip_quotes(parts[1]))
        } else {
            (None, strip_quotes(parts[0]))
        };

        if name.is_empty() || RESERVED_ALIAS_WORDS.contains(&name.to_lowercase().as_str()) {
            continue;
        }

        let table_ref = TableRef { schema, name };
        let key = (table_ref.schema.clone(), table_ref.name.to_lowercase());
        if seen.insert(key) {
            refs.push(table_ref);
        }
    }

    refs
}

#[derive(Clone)]
pub struct SchemaGatherer {
    mysql_pools: DashMap<String, mysql_async::Pool>,
    cache: std::sync::Arc<LruCache<String, TableInfo>>,
}

impl SchemaGatherer {
    pub fn new(cache_size: usize) -> Self {
        Self { mysql_pools: DashMap::new(), cache: std::sync::Arc::new(LruCache::new(cache_size)) }
    }

    fn cache_key(conn: &ProbeConnection, table: &TableRef) -> String {
        format!("{}:{}:{}", conn.database.host, table.schema.as_deref().unwrap_or(""), table.name)
    }

    /// Resolves `refs` against `conn`'s live schema. Never fails the caller:
    /// connection or query errors degrade individual tables to `unresolved`
    /// rather than aborting the whole analysis (§4.5 step 1, §7).
    pub async fn gather(&self, conn: &ProbeConnection, refs: &[TableRef]) -> SchemaContext {
        let mut tables = Vec::new();
        let mut unresolved = Vec::new();

        for table_ref in refs {
            let key = Self::cache_key(conn, table_ref);
            if let Some(cached) = self.cache.get(&key) {
                tables.push(cached);
                continue;
            }

            let resolved = match conn.database.dialect {
                SourceType::Mysql => self.gather_mysql(conn, table_ref).await,
                SourceType::Postgres => self.gather_postgres(conn, table_ref).await,
            };

            match resolved {
                Some(info) => {
                    self.cache.insert(key, info.clone());
                    tables.push(info);
                },
                None => unresolved.push(table_ref.name.clone()),
            }
        }

        if !unresolved.is_empty() {
            tracing::debug!(?unresolved, "schema context: unresolved table references");
        }

        SchemaContext { tables, unresolved }
    }

    fn mysql_pool(&self, conn: &ProbeConnection) -> mysql_async::Pool {
        if let Some(pool) = self.mysql_pools.get(&conn.database.host) {
            return pool.clone();
        }
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(
                conn.database.host.split(':').next().unwrap_or(&conn.database.host).to_string(),
            )
            .tcp_port(conn.database.port)
            .db_name(Some(conn.database.database_name.clone()))
            .user(Some(conn.database.monitor_username.clone()))
            .pass(Some(conn.monitor_password.clone()));
        let pool = mysql_async::Pool::new(opts);
        self.mysql_pools.insert(conn.database.host.clone(), pool.clone());
        pool
    }

    async fn gather_mysql(&self, conn: &ProbeConnection, table_ref: &TableRef) -> Option<TableInfo> {
        use mysql_async::prelude::*;

        let pool = self.mysql_pool(conn);
        let mut handle = pool.get_conn().await.ok()?;
        let schema = table_ref.schema.clone().unwrap_or_else(|| conn.database.database_name.clone());

        let columns: Vec<String> = handle
            .exec(
                "SELECT column_name FROM information_schema.columns WHERE table_schema = ? AND table_name = ?",
                (schema.clone(), table_ref.name.clone()),
            )
            .await
            .ok()?;
        if columns.is_empty() {
            return None;
        }

        let indexed_columns: Vec<String> = handle
            .exec(
                "SELECT DISTINCT column_name FROM information_schema.statistics WHERE table_schema = ? AND table_name = ?",
                (schema.clone(), table_ref.name.clone()),
            )
            .await
            .unwrap_or_default();

        let row_estimate: Option<i64> = handle
            .exec_first(
                "SELECT table_rows FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
                (schema, table_ref.name.clone()),
            )
            .await
            .ok()
            .flatten();

        Some(TableInfo { name: table_ref.name.clone(), columns, indexed_columns, row_estimate })
    }

    async fn gather_postgres(&self, conn: &ProbeConnection, table_ref: &TableRef) -> Option<TableInfo> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(conn.database.host.split(':').next().unwrap_or(&conn.database.host))
            .port(conn.database.port)
            .dbname(&conn.database.database_name)
            .user(&conn.database.monitor_username)
            .password(&conn.monitor_password);

        let (client, connection) = config.connect(tokio_postgres::NoTls).await.ok()?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let schema = table_ref.schema.clone().unwrap_or_else(|| "public".to_string());

        let columns: Vec<String> = client
            .query(
                "SELECT column_name FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2",
                &[&schema, &table_ref.name],
            )
            .await
            .ok()?
            .iter()
            .map(|row| row.get(0))
            .collect();
        if columns.is_empty() {
            return None;
        }

        let indexed_columns: Vec<String> = client
            .query(
                r#"SELECT DISTINCT a.attname FROM pg_index i
                   JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                   JOIN pg_class c ON c.oid = i.indrelid
                   JOIN pg_namespace n ON n.oid = c.relnamespace
                   WHERE n.nspname = $1 AND c.relname = $2"#,
                &[&schema, &table_ref.name],
            )
            .await
            .unwrap_or_default()
            .iter()
            .map(|row| row.get(0))
            .collect();

        let row_estimate: Option<i64> = client
            .query_opt(
                r#"SELECT c.reltuples::bigint FROM pg_class c
                   JOIN pg_namespace n ON n.oid = c.relnamespace
                   WHERE n.nspname = $1 AND c.relname = $2"#,
                &[&schema, &table_ref.name],
            )
            .await
            .ok()
            .flatten()
            .map(|row| row.get(0));

        Some(TableInfo { name: table_ref.name.clone(), columns, indexed_columns, row_estimate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_from() {
        let refs = extract_table_refs("SELECT * FROM orders WHERE id = 1");
        assert_eq!(refs, vec![TableRef { schema: None, name: "orders".into() }]);
    }

    #[test]
    fn extracts_aliased_and_joined_tables() {
        let refs = extract_table_refs(
            "SELECT o.id FROM orders o JOIN customers AS c ON o.customer_id = c.id",
        );
        assert_eq!(
            refs,
            vec![
                TableRef { schema: None, name: "orders".into() },
                TableRef { schema: None, name: "customers".into() },
            ]
        );
    }

    #[test]
    fn extracts_schema_qualified_and_quoted_names() {
        let refs = extract_table_refs(r#"SELECT * FROM `app`.`orders` o"#);
        assert_eq!(refs, vec![TableRef { schema: Some("app".into()), name: "orders".into() }]);

        let refs2 = extract_table_refs(r#"SELECT * FROM "public"."orders""#);
        assert_eq!(refs2, vec![TableRef { schema: Some("public".into()), name: "orders".into() }]);
    }

    #[test]
    fn dedups_repeated_table_references() {
        let refs = extract_table_refs("SELECT * FROM t a, t b WHERE a.id = b.parent_id");
        assert_eq!(refs.len(), 1);
    }
}
