use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Store;
use crate::config::SeedDatabase;
use crate::models::{HealthState, MonitoredDatabase, MonitoredDatabaseUpsert, SourceType};
use crate::utils::error::{AppError, AppResult};

/// Internal-only view that also carries the monitor password, so probes can
/// be constructed without the password ever crossing into the public
/// `MonitoredDatabase` read model (§3: the registry is read, not exposed,
/// by the core).
#[derive(Debug, Clone)]
pub struct ProbeConnection {
    pub database: MonitoredDatabase,
    pub monitor_password: String,
}

fn row_to_database(row: &sqlx::sqlite::SqliteRow) -> AppResult<MonitoredDatabase> {
    let dialect: String = row.try_get("dialect")?;
    let health_state: String = row.try_get("health_state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let enabled: i64 = row.try_get("enabled")?;

    Ok(MonitoredDatabase {
        id: row.try_get("id")?,
        dialect: SourceType::parse(&dialect).map_err(AppError::Internal)?,
        host: row.try_get("host")?,
        port: row.try_get::<i64, _>("port")? as u16,
        database_name: row.try_get("database_name")?,
        monitor_username: row.try_get("monitor_username")?,
        tenant_scope: row.try_get("tenant_scope")?,
        enabled: enabled != 0,
        last_cursor: row.try_get("last_cursor")?,
        health_state: HealthState::parse(&health_state).map_err(AppError::Internal)?,
        last_error: row.try_get("last_error")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

impl Store {
    pub async fn list_monitored_databases(&self, enabled_only: bool) -> AppResult<Vec<MonitoredDatabase>> {
        let rows = if enabled_only {
            sqlx::query("SELECT * FROM monitored_databases WHERE enabled = 1 ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM monitored_databases ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(row_to_database).collect()
    }

    /// Internal variant used by the Collector/Scheduler to materialise live
    /// probe handles, carrying the monitor credential.
    pub async fn list_probe_connections(&self, enabled_only: bool) -> AppResult<Vec<ProbeConnection>> {
        let rows = if enabled_only {
            sqlx::query("SELECT * FROM monitored_databases WHERE enabled = 1 ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM monitored_databases ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter()
            .map(|row| {
                Ok(ProbeConnection {
                    database: row_to_database(row)?,
                    monitor_password: row.try_get("monitor_password")?,
                })
            })
            .collect()
    }

    pub async fn upsert_monitored_database(&self, row: MonitoredDatabaseUpsert) -> AppResult<i64> {
        let now = Utc::now().to_rfc3339();
        if let Some(id) = row.id {
            sqlx::query(
                r#"UPDATE monitored_databases SET
                    dialect = ?, host = ?, port = ?, database_name = ?, monitor_username = ?,
                    monitor_password = ?, tenant_scope = ?, enabled = ?, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(row.dialect.as_str())
            .bind(&row.host)
            .bind(row.port as i64)
            .bind(&row.database_name)
            .bind(&row.monitor_username)
            .bind(&row.monitor_password)
            .bind(&row.tenant_scope)
            .bind(row.enabled as i64)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(id)
        } else {
            let result = sqlx::query(
                r#"INSERT INTO monitored_databases
                    (dialect, host, port, database_name, monitor_username, monitor_password,
                     tenant_scope, enabled, health_state, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'HEALTHY', ?, ?)"#,
            )
            .bind(row.dialect.as_str())
            .bind(&row.host)
            .bind(row.port as i64)
            .bind(&row.database_name)
            .bind(&row.monitor_username)
            .bind(&row.monitor_password)
            .bind(&row.tenant_scope)
            .bind(row.enabled as i64)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        }
    }

    pub async fn update_probe_cursor(&self, id: i64, cursor: &str) -> AppResult<()> {
        sqlx::query("UPDATE monitored_databases SET last_cursor = ?, updated_at = ? WHERE id = ?")
            .bind(cursor)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_probe_health(
        &self,
        id: i64,
        state: HealthState,
        error: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE monitored_databases SET health_state = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seeds the registry from the config file's `seed_databases` list on
    /// first boot, only if the table is empty (§9c) — lets the core run
    /// standalone before the registration collaborator has populated it.
    pub async fn seed_if_empty(&self, seeds: &[SeedDatabase]) -> AppResult<()> {
        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM monitored_databases")
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;
        if count > 0 || seeds.is_empty() {
            return Ok(());
        }

        for seed in seeds {
            let dialect = SourceType::parse(&seed.dialect).map_err(AppError::Validation)?;
            self.upsert_monitored_database(MonitoredDatabaseUpsert {
                id: None,
                dialect,
                host: seed.host.clone(),
                port: seed.port,
                database_name: seed.database_name.clone(),
                monitor_username: seed.monitor_username.clone(),
                monitor_password: seed.monitor_password.clone(),
                tenant_scope: seed.tenant_scope.clone(),
                enabled: true,
            })
            .await?;
        }
        tracing::info!(count = seeds.len(), "seeded monitored_databases from config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn sample() -> MonitoredDatabaseUpsert {
        MonitoredDatabaseUpsert {
            id: None,
            dialect: SourceType::Mysql,
            host: "db.internal".into(),
            port: 3306,
            database_name: "app".into(),
            monitor_username: "slowlog_monitor".into(),
            monitor_password: "secret".into(),
            tenant_scope: "tenant-a".into(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn upsert_then_list_excludes_password() {
        let store = test_store().await;
        let id = store.upsert_monitored_database(sample()).await.unwrap();
        let dbs = store.list_monitored_databases(true).await.unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].id, id);

        let conns = store.list_probe_connections(true).await.unwrap();
        assert_eq!(conns[0].monitor_password, "secret");
    }

    #[tokio::test]
    async fn cursor_and_health_updates_persist() {
        let store = test_store().await;
        let id = store.upsert_monitored_database(sample()).await.unwrap();
        store.update_probe_cursor(id, "cursor-123").await.unwrap();
        store.record_probe_health(id, HealthState::Degraded, Some("timeout")).await.unwrap();

        let dbs = store.list_monitored_databases(false).await.unwrap();
        assert_eq!(dbs[0].last_cursor.as_deref(), Some("cursor-123"));
        assert_eq!(dbs[0].health_state, HealthState::Degraded);
        assert_eq!(dbs[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn seed_only_applies_when_table_empty() {
        let store = test_store().await;
        store
            .seed_if_empty(&[SeedDatabase {
                dialect: "mysql".into(),
                host: "seed.internal".into(),
                port: 3306,
                database_name: "app".into(),
                monitor_username: "monitor".into(),
                monitor_password: "pw".into(),
                tenant_scope: "t".into(),
            }])
            .await
            .unwrap();
        assert_eq!(store.list_monitored_databases(false).await.unwrap().len(), 1);

        store
            .seed_if_empty(&[SeedDatabase {
                dialect: "mysql".into(),
                host: "other.internal".into(),
                port: 3306,
                database_name: "app".into(),
                monitor_username: "monitor".into(),
                monitor_password: "pw".into(),
                tenant_scope: "t".into(),
            }])
            .await
            .unwrap();
        assert_eq!(store.list_monitored_databases(false).await.unwrap().len(), 1);
    }
}
