//! Target database abstraction
//!
//! The engine never talks to a database driver directly; it goes through
//! [`ConnectionFactory`] and [`TargetConnection`]. Postgres ships in-tree
//! via sqlx. Other targets (Snowflake among them) are supplied by the
//! embedding application as factory implementations.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor, PgConnection};

/// Error from a single query execution
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Execution(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Error establishing a connection to the target
#[derive(Debug, thiserror::Error)]
#[error("failed to connect to target: {0}")]
pub struct ConnectError(pub String);

/// One live connection to the target database
#[async_trait]
pub trait TargetConnection: Send {
    /// Execute a statement, discarding any rows
    async fn execute(&mut self, statement: &str) -> Result<(), QueryError>;

    /// Close the connection, flushing any protocol goodbye
    async fn close(self: Box<Self>);
}

/// Creates connections to the target database
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TargetConnection>, ConnectError>;

    /// Human-readable target description for logging
    fn target_name(&self) -> &str;
}

/// Postgres target via sqlx
pub struct PostgresFactory {
    options: PgConnectOptions,
    name: String,
}

impl PostgresFactory {
    pub fn new(dsn: &str) -> Result<Self, ConnectError> {
        let options: PgConnectOptions = dsn
            .parse()
            .map_err(|e: sqlx::Error| ConnectError(e.to_string()))?;
        // Per-statement logging would drown the load loop
        let options = options.disable_statement_logging();
        Ok(Self {
            options,
            name: format!("postgres://{}", dsn.split('@').next_back().unwrap_or("?")),
        })
    }
}

#[async_trait]
impl ConnectionFactory for PostgresFactory {
    async fn connect(&self) -> Result<Box<dyn TargetConnection>, ConnectError> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| ConnectError(e.to_string()))?;
        Ok(Box::new(PostgresConnection { conn }))
    }

    fn target_name(&self) -> &str {
        &self.name
    }
}

struct PostgresConnection {
    conn: PgConnection,
}

#[async_trait]
impl TargetConnection for PostgresConnection {
    async fn execute(&mut self, statement: &str) -> Result<(), QueryError> {
        self.conn.execute(statement).await.map_err(|e| match e {
            sqlx::Error::Io(io) => QueryError::ConnectionLost(io.to_string()),
            other => QueryError::Execution(other.to_string()),
        })?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        let _ = self.conn.close().await;
    }
}

/// Connect timeout applied around any factory's `connect()`
pub async fn connect_with_timeout(
    factory: &dyn ConnectionFactory,
    timeout: Duration,
) -> Result<Box<dyn TargetConnection>, ConnectError> {
    match tokio::time::timeout(timeout, factory.connect()).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError(format!(
            "connect to {} timed out after {timeout:?}",
            factory.target_name()
        ))),
    }
}
