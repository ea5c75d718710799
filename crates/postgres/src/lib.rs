//! Postgres-backed implementation of the cluster version store.
//!
//! Version rows live in `repository_versions`. Named advisory locks are
//! mapped onto `pg_advisory_lock` keys by hashing the textual lock name.
//! Lock guards hold a dedicated connection for the lifetime of the lock:
//! Postgres advisory locks are session-scoped, so the lock dies with the
//! connection and can never leak back into the pool. That same dedicated
//! connection is what `will_write` runs on, keeping the durable write marker
//! and the advisory lock on one session.

mod connection;
mod sql;

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    errors::connection_lost,
    types::{
        DeviceId,
        RepositoryId,
        WorkingCopyVersion,
        WriteOwner,
        WriteProperties,
    },
    version_store::{
        read_lock_name,
        write_lock_name,
        ReadLockGuard,
        VersionStore,
        WriteLockGuard,
    },
};
use errors::ErrorMetadata;
use serde_json::Value as JsonValue;
use sha2::{
    Digest,
    Sha256,
};
use tokio_postgres::{
    config::TargetSessionAttrs,
    error::SqlState,
    Row,
};

pub use crate::connection::SyncPgPool;
use crate::connection::{
    is_disconnect,
    PgConnection,
};

pub struct PostgresVersionStore {
    pool: Arc<SyncPgPool>,
}

impl PostgresVersionStore {
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        let mut config: tokio_postgres::Config =
            url.parse().map_err(anyhow::Error::from)?;
        // Version rows coordinate writers; talking to a replica would be
        // silently wrong.
        config.target_session_attrs(TargetSessionAttrs::ReadWrite);
        Self::with_pool(SyncPgPool::new(config)?).await
    }

    pub async fn with_pool(pool: Arc<SyncPgPool>) -> anyhow::Result<Self> {
        {
            let client = pool.get_connection("init_sql").await?;
            client.batch_execute(sql::INIT_SQL).await?;
        }
        Ok(Self { pool })
    }

    async fn acquire_lock(
        &self,
        name: &str,
        timeout: Duration,
        timeout_tag: &'static str,
        label: &'static str,
    ) -> anyhow::Result<(PgConnection, i64)> {
        let key = advisory_lock_key(name);
        let mut conn = self.pool.get_connection(label).await?;
        conn.dedicate();
        // Bound the wait server-side; the lock statement itself blocks for
        // as long as another session holds the lock.
        conn.batch_execute(&sql::set_statement_timeout(timeout.as_millis()))
            .await?;
        let started = tokio::time::Instant::now();
        let statement = conn.prepare_cached(sql::ADVISORY_LOCK).await?;
        if let Err(e) = conn.query_unbounded(&statement, &[&key]).await {
            if e.downcast_ref::<tokio_postgres::Error>()
                .and_then(|e| e.code())
                == Some(&SqlState::QUERY_CANCELED)
            {
                return Err(e.context(ErrorMetadata::transient(
                    timeout_tag,
                    format!("timed out waiting {}s for {name}", timeout.as_secs()),
                )));
            }
            return Err(e);
        }
        tracing::info!(
            "acquired {name} after {}ms",
            started.elapsed().as_millis()
        );
        conn.batch_execute(sql::CLEAR_STATEMENT_TIMEOUT).await?;
        Ok((conn, key))
    }
}

#[async_trait]
impl VersionStore for PostgresVersionStore {
    async fn load_versions(
        &self,
        repository: RepositoryId,
    ) -> anyhow::Result<BTreeMap<DeviceId, WorkingCopyVersion>> {
        let conn = self.pool.get_connection("load_versions").await?;
        let statement = conn.prepare_cached(sql::LOAD_VERSIONS).await?;
        let rows = conn.query(&statement, &[&repository_param(repository)]).await?;
        rows.iter().map(parse_version_row).collect()
    }

    async fn update_version(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        version: i64,
    ) -> anyhow::Result<()> {
        let conn = self.pool.get_connection("update_version").await?;
        let statement = conn.prepare_cached(sql::UPDATE_VERSION).await?;
        conn.execute(
            &statement,
            &[&repository_param(repository), &device.as_str(), &version],
        )
        .await?;
        Ok(())
    }

    async fn did_write(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        old_version: i64,
        new_version: i64,
        owner: &WriteOwner,
    ) -> anyhow::Result<()> {
        // Deliberately not pinned to the lock connection: releasing the
        // durable marker must work on a fresh session after the original
        // connection (and its advisory lock) died.
        let conn = self
            .pool
            .get_connection("did_write")
            .await
            .map_err(connection_lost)?;
        let statement = conn.prepare_cached(sql::DID_WRITE).await?;
        let modified = conn
            .execute(
                &statement,
                &[
                    &repository_param(repository),
                    &device.as_str(),
                    &new_version,
                    &owner.as_str(),
                ],
            )
            .await
            .map_err(|e| {
                if is_disconnect(&e) {
                    connection_lost(e)
                } else {
                    e
                }
            })?;
        if modified == 1 {
            tracing::info!(
                "released write marker on {repository}: {old_version} -> {new_version}"
            );
        } else {
            tracing::info!(
                "ignoring write marker release on {repository}: owner token does not match"
            );
        }
        Ok(())
    }

    async fn read_lock(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn ReadLockGuard>> {
        let name = read_lock_name(repository, &device);
        let (conn, key) = self
            .acquire_lock(&name, timeout, "ReadLockTimeout", "read_lock")
            .await?;
        Ok(Box::new(PgReadLockGuard { conn, key }))
    }

    async fn write_lock(
        &self,
        repository: RepositoryId,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn WriteLockGuard>> {
        let name = write_lock_name(repository);
        let (conn, key) = self
            .acquire_lock(&name, timeout, "WriteLockTimeout", "write_lock")
            .await?;
        Ok(Box::new(PgWriteLockGuard { conn, key }))
    }
}

/// Map a textual lock name onto Postgres's 64-bit advisory lock keyspace.
pub(crate) fn advisory_lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest shorter than 8 bytes"))
}

fn repository_param(repository: RepositoryId) -> i64 {
    u64::from(repository) as i64
}

fn parse_version_row(row: &Row) -> anyhow::Result<(DeviceId, WorkingCopyVersion)> {
    let device: String = row.try_get("device_id")?;
    let properties: Option<JsonValue> = row.try_get("write_properties")?;
    let write_properties = properties
        .map(serde_json::from_value::<WriteProperties>)
        .transpose()?;
    let owner: Option<String> = row.try_get("write_owner")?;
    Ok((
        DeviceId::from(device),
        WorkingCopyVersion {
            version: row.try_get("version")?,
            is_writing: row.try_get("is_writing")?,
            write_properties,
            write_owner: owner.map(WriteOwner::from),
        },
    ))
}

struct PgReadLockGuard {
    conn: PgConnection,
    key: i64,
}

#[async_trait]
impl ReadLockGuard for PgReadLockGuard {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let statement = self.conn.prepare_cached(sql::ADVISORY_UNLOCK).await?;
        self.conn.query(&statement, &[&self.key]).await?;
        // The dedicated connection closes on drop, which would release the
        // lock anyway; unlocking first just does it without a session churn.
        Ok(())
    }
}

struct PgWriteLockGuard {
    conn: PgConnection,
    key: i64,
}

#[async_trait]
impl WriteLockGuard for PgWriteLockGuard {
    async fn will_write(
        &self,
        repository: RepositoryId,
        device: DeviceId,
        properties: WriteProperties,
        owner: &WriteOwner,
    ) -> anyhow::Result<()> {
        let statement = self.conn.prepare_cached(sql::WILL_WRITE).await?;
        let properties = serde_json::to_value(&properties)?;
        self.conn
            .execute(
                &statement,
                &[
                    &repository_param(repository),
                    &device.as_str(),
                    &properties,
                    &owner.as_str(),
                ],
            )
            .await
            .map_err(|e| {
                if is_disconnect(&e) {
                    connection_lost(e)
                } else {
                    e
                }
            })?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let statement = self.conn.prepare_cached(sql::ADVISORY_UNLOCK).await?;
        self.conn.query(&statement, &[&self.key]).await?;
        Ok(())
    }
}
