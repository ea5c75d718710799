//! Implements a Postgres connection pool and statement cache.
//!
//! Unlike deadpool-postgres, we:
//! - limit the number of cached prepared statements owned by each connection
//!   in order to avoid high/unbounded memory usage on the Postgres server
//! - discard idle connections past their lifetime at checkout
//! - let a caller dedicate a connection, taking it out of pool circulation
//!   for session-scoped state such as advisory locks.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            self,
            AtomicBool,
        },
        Arc,
        LazyLock,
    },
    time::Duration,
};

use anyhow::Context as _;
use cmd_util::env::env_config;
use common::knobs::{
    POSTGRES_INACTIVE_CONNECTION_LIFETIME,
    POSTGRES_MAX_CACHED_STATEMENTS,
    POSTGRES_MAX_CONNECTIONS,
};
use futures::{
    select_biased,
    Future,
    FutureExt,
};
use lru::LruCache;
use parking_lot::Mutex;
use rustls::{
    ClientConfig,
    RootCertStore,
};
use tokio::{
    sync::{
        OwnedSemaphorePermit,
        Semaphore,
    },
    time::{
        sleep,
        Instant,
    },
};
use tokio_postgres::{
    types::ToSql,
    Row,
    Statement,
};
use tokio_postgres_rustls::MakeRustlsConnect;

static POSTGRES_TIMEOUT: LazyLock<u64> =
    LazyLock::new(|| env_config("POSTGRES_TIMEOUT_SECONDS", 30));

#[derive(Debug, thiserror::Error)]
#[error("Postgres timeout")]
pub struct PostgresTimeout;

/// Bound row operations so a hung connection cannot wedge a synchronizer
/// forever. Advisory lock waits are exempt; they are bounded server-side by
/// `statement_timeout` instead.
pub(crate) async fn with_timeout<R, E, Fut: Future<Output = Result<R, E>>>(
    f: Fut,
) -> anyhow::Result<R>
where
    E: Into<anyhow::Error>,
{
    select_biased! {
        r = f.fuse() => {
            match r {
                Ok(r) => Ok(r),
                Err(e) => Err(e.into())
            }
        },
        _ = sleep(Duration::from_secs(*POSTGRES_TIMEOUT)).fuse() => {
            Err(anyhow::anyhow!(PostgresTimeout))
        },
    }
}

type StatementCache = LruCache<String, Statement>;

/// A Postgres connection, owned by either the pool ([`SyncPgPool`]) or an
/// active [`PgConnection`].
struct PooledConnection {
    client: tokio_postgres::Client,
    statement_cache: Mutex<StatementCache>,
    last_used: Instant,
}

impl PooledConnection {
    fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            statement_cache: Mutex::new(LruCache::new(*POSTGRES_MAX_CACHED_STATEMENTS)),
            last_used: Instant::now(),
        }
    }
}

async fn prepare_cached(
    client: &tokio_postgres::Client,
    cache: &Mutex<StatementCache>,
    statement: &str,
) -> anyhow::Result<Statement> {
    if let Some(prepared) = cache.lock().get(statement) {
        return Ok(prepared.clone());
    }
    let prepared = client.prepare(statement).await?;
    // N.B.: if the cache is at capacity, this will drop the oldest statement,
    // which will send a message on the connection asking to deallocate it.
    cache.lock().put(statement.to_owned(), prepared.clone());
    Ok(prepared)
}

fn handle_error(poisoned: &AtomicBool, e: impl Into<anyhow::Error>) -> anyhow::Error {
    let e: anyhow::Error = e.into();
    if e.downcast_ref::<tokio_postgres::Error>()
        .is_some_and(|e| e.is_closed() || e.to_string().contains("unexpected message from server"))
        || e.downcast_ref::<PostgresTimeout>().is_some()
    {
        tracing::error!("Not reusing connection after error: {e:#}");
        poisoned.store(true, atomic::Ordering::Relaxed);
    }
    e
}

/// True when `e` means the connection to the server is gone rather than the
/// statement having failed.
pub(crate) fn is_disconnect(e: &anyhow::Error) -> bool {
    e.downcast_ref::<tokio_postgres::Error>()
        .is_some_and(|e| e.is_closed())
}

/// An active Postgres connection from a [`SyncPgPool`].
///
/// Returns the underlying connection to the pool when dropped, unless it was
/// poisoned by an error or dedicated to session-scoped state.
pub(crate) struct PgConnection {
    pool: Arc<SyncPgPool>,
    _permit: OwnedSemaphorePermit,
    conn: Option<PooledConnection>,
    poisoned: AtomicBool,
    dedicated: bool,
    label: &'static str,
}

impl PgConnection {
    fn conn(&self) -> &PooledConnection {
        self.conn
            .as_ref()
            .expect("connection is only taken in Drop")
    }

    /// Take this connection out of pool circulation. Advisory locks are
    /// session-scoped, so a lock-holding connection must die with its guard
    /// instead of carrying the lock back into the pool.
    pub fn dedicate(&mut self) {
        self.dedicated = true;
    }

    pub async fn batch_execute(&self, query: &str) -> anyhow::Result<()> {
        with_timeout(self.conn().client.batch_execute(query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn prepare_cached(&self, query: &str) -> anyhow::Result<Statement> {
        let conn = self.conn();
        with_timeout(prepare_cached(&conn.client, &conn.statement_cache, query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        with_timeout(self.conn().client.query(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout(self.conn().client.execute(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    /// Like [`Self::query`] but without the client-side timeout, for
    /// statements that are expected to block (advisory lock waits).
    pub async fn query_unbounded(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        self.conn()
            .client
            .query(statement, params)
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if self.dedicated || *self.poisoned.get_mut() {
            tracing::debug!("closing {} connection instead of pooling it", self.label);
            return;
        }
        let mut conn = self.conn.take().expect("connection is only taken in Drop");
        conn.last_used = Instant::now();
        let mut idle_conns = self.pool.connections.lock();
        // don't return connections to a closed pool
        if !self.pool.semaphore.is_closed() {
            idle_conns.push_back(conn);
        }
    }
}

/// A Postgres connection pool.
///
/// This struct is always used behind an `Arc`.
pub struct SyncPgPool {
    pg_config: tokio_postgres::Config,
    tls_connect: MakeRustlsConnect,
    /// Limits the total number of connections that can be handed out
    /// simultaneously.
    semaphore: Arc<Semaphore>,
    /// Idle connections, ordered by `last_used` from oldest to newest.
    connections: Mutex<VecDeque<PooledConnection>>,
}

impl SyncPgPool {
    pub fn new(pg_config: tokio_postgres::Config) -> anyhow::Result<Arc<Self>> {
        let mut roots = RootCertStore::empty();
        let native_certs = rustls_native_certs::load_native_certs();
        anyhow::ensure!(
            native_certs.errors.is_empty(),
            "failed to load native certs: {:?}",
            native_certs.errors
        );
        for cert in native_certs.certs {
            roots.add(cert)?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let tls_connect = MakeRustlsConnect::new(config);

        let max_size = *POSTGRES_MAX_CONNECTIONS;
        tracing::info!("Postgres connection pool max size {max_size}");
        Ok(Arc::new(SyncPgPool {
            pg_config,
            tls_connect,
            semaphore: Arc::new(Semaphore::new(max_size)),
            connections: Mutex::new(VecDeque::new()),
        }))
    }

    /// Assumes that we already have a semaphore permit.
    async fn get_connection_internal(&self) -> anyhow::Result<PooledConnection> {
        {
            let mut conns = self.connections.lock();
            // Always reuse the newest connection; discard closed or stale
            // ones instead of handing them out.
            while let Some(conn) = conns.pop_back() {
                if conn.client.is_closed() {
                    continue;
                }
                if conn.last_used.elapsed() > *POSTGRES_INACTIVE_CONNECTION_LIFETIME {
                    continue;
                }
                return Ok(conn);
            }
        }
        self.create_connection().await
    }

    async fn create_connection(&self) -> anyhow::Result<PooledConnection> {
        let (client, connection) = self.pg_config.connect(self.tls_connect.clone()).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("postgres connection error: {e}");
            }
        });
        Ok(PooledConnection::new(client))
    }

    pub(crate) async fn get_connection(
        self: &Arc<Self>,
        label: &'static str,
    ) -> anyhow::Result<PgConnection> {
        let (permit, conn) = with_timeout(async {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .context("SyncPgPool has been shut down")?;
            let conn = self.get_connection_internal().await?;
            anyhow::Ok((permit, conn))
        })
        .await?;
        Ok(PgConnection {
            pool: self.clone(),
            _permit: permit,
            conn: Some(conn),
            poisoned: AtomicBool::new(false),
            dedicated: false,
            label,
        })
    }

    /// Drops all pooled connections and prevents the creation of new ones.
    pub fn shutdown(&self) {
        // N.B.: this doesn't abort in-progress connections, but they won't be
        // returned to the pool on drop.
        self.semaphore.close();
        self.connections.lock().clear();
    }
}
