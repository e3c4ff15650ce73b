//! Replica writers. One trait, one implementation per flavor, both
//! applying the dialect's session setup on connect (replication role on
//! Postgres, foreign-key checks off on MySQL — connection-scoped, gone
//! on disconnect). Write errors split into transient (retry) and SQL
//! (fatal) so the applier can retry the former and halt on the latter.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use common::err::{KResult, KashoError};
use dialect::Dialect;

/// How a replica write failed: `Transient` retries with backoff,
/// `Sql` is surfaced as an apply error.
#[derive(Debug)]
pub enum WriteError {
    Transient(String),
    Sql(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Transient(m) => write!(f, "transient: {}", m),
            WriteError::Sql(m) => write!(f, "{}", m),
        }
    }
}

#[async_trait]
pub trait ReplicaWriter: Send {
    /// Execute a statement, returning affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64, WriteError>;

    /// Text-mode query for the resync discovery paths.
    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>, WriteError>;

    async fn close(&mut self) -> KResult<()>;
}

pub struct PgReplicaWriter {
    client: tokio_postgres::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl PgReplicaWriter {
    pub async fn connect(replica_url: &str, dialect: &dyn Dialect) -> KResult<Self> {
        let dsn = dialect.shape_dsn(replica_url)?;
        let conn_string = dialect.connection_string(&dsn);
        let (client, connection) = tokio_postgres::connect(&conn_string, NoTls)
            .await
            .map_err(|e| KashoError::Connection(format!("replica: {}", e)))?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("replica connection task ended: {}", e);
            }
        });
        for setup in dialect.session_setup() {
            client
                .batch_execute(setup)
                .await
                .map_err(|e| KashoError::Connection(format!("session setup: {}", e)))?;
            debug!(statement = setup, "replica session setup");
        }
        Ok(PgReplicaWriter { client, handle })
    }
}

#[async_trait]
impl ReplicaWriter for PgReplicaWriter {
    async fn execute(&mut self, sql: &str) -> Result<u64, WriteError> {
        self.client.execute(sql, &[]).await.map_err(classify_pg)
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>, WriteError> {
        let messages = self.client.simple_query(sql).await.map_err(classify_pg)?;
        let mut rows = Vec::new();
        for message in messages {
            if let tokio_postgres::SimpleQueryMessage::Row(row) = message {
                let mut cells = Vec::with_capacity(row.len());
                for i in 0..row.len() {
                    cells.push(row.get(i).map(|s| s.to_string()));
                }
                rows.push(cells);
            }
        }
        Ok(rows)
    }

    async fn close(&mut self) -> KResult<()> {
        self.handle.abort();
        Ok(())
    }
}

fn classify_pg(e: tokio_postgres::Error) -> WriteError {
    if e.as_db_error().is_some() {
        WriteError::Sql(e.to_string())
    } else {
        WriteError::Transient(e.to_string())
    }
}

pub struct MySqlReplicaWriter {
    conn: mysql_async::Conn,
}

impl MySqlReplicaWriter {
    pub async fn connect(replica_url: &str, dialect: &dyn Dialect) -> KResult<Self> {
        let dsn = dialect.shape_dsn(replica_url)?;
        let url = dialect.connection_string(&dsn);
        let opts = mysql_async::Opts::from_url(&url)
            .map_err(|e| KashoError::Config(format!("{}: {}", url, e)))?;
        let mut conn = mysql_async::Conn::new(opts)
            .await
            .map_err(|e| KashoError::Connection(format!("replica: {}", e)))?;
        for setup in dialect.session_setup() {
            conn.query_drop(setup)
                .await
                .map_err(|e| KashoError::Connection(format!("session setup: {}", e)))?;
            debug!(statement = setup, "replica session setup");
        }
        Ok(MySqlReplicaWriter { conn })
    }
}

#[async_trait]
impl ReplicaWriter for MySqlReplicaWriter {
    async fn execute(&mut self, sql: &str) -> Result<u64, WriteError> {
        self.conn.query_drop(sql).await.map_err(classify_mysql)?;
        Ok(self.conn.affected_rows())
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>, WriteError> {
        let rows: Vec<mysql_async::Row> =
            self.conn.query(sql).await.map_err(classify_mysql)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.get::<Option<String>, _>(i).flatten())
                    .collect()
            })
            .collect())
    }

    async fn close(&mut self) -> KResult<()> {
        // dropping the Conn returns it to the driver's cleanup path
        Ok(())
    }
}

fn classify_mysql(e: mysql_async::Error) -> WriteError {
    match e {
        mysql_async::Error::Server(server) => WriteError::Sql(server.to_string()),
        other => WriteError::Transient(other.to_string()),
    }
}
