use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::LevelFilter;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};

use super::{CapabilityCheck, ConnectionTarget};
use crate::error::ProbeError;

const APPLICATION_NAME: &str = "stackgate-probe";

/// PostgreSQL capability check: `SELECT version()` over a fresh connection.
pub struct PostgresCheck {
    timeout: Duration,
}

impl PostgresCheck {
    /// `timeout` bounds one whole attempt, connect included.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn identify(&self, target: &ConnectionTarget) -> Result<String, ProbeError> {
        let options = PgConnectOptions::from_str(target.as_str())?
            .application_name(APPLICATION_NAME)
            .log_statements(LevelFilter::Debug);

        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(connect_error)?;
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;

        Ok(version)
    }
}

/// Transport failures reaching the server, as opposed to errors it answered with.
fn connect_error(e: sqlx::Error) -> ProbeError {
    match e {
        sqlx::Error::Io(e) => ProbeError::Connect(e.to_string()),
        sqlx::Error::Tls(e) => ProbeError::Connect(e.to_string()),
        e => ProbeError::Datastore(e),
    }
}

#[async_trait]
impl CapabilityCheck for PostgresCheck {
    async fn check(&self, target: &ConnectionTarget) -> Result<String, ProbeError> {
        tokio::time::timeout(self.timeout, self.identify(target))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }
}
