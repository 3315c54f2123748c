//! Idempotent role provisioning against PostgreSQL.
//!
//! Provisioning grants a directory-backed account access by ensuring a
//! login role of the same name exists and is a member of the configured
//! group role. Access is then managed entirely on the group. Every call
//! uses one throwaway connection, authenticated as the configured connect
//! principal and scoped to the target database; the connection is released
//! on every path and never pooled.
//!
//! The sequence is not transactional: a crash between the create and the
//! grant can leave a role without its membership. The existence probe makes
//! the whole call safe to retry, which is the recovery story.

use std::future::Future;
use std::time::Duration;

use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use thiserror::Error;
use tokio::time::timeout;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("database connection timed out after {0:?}")]
    ConnectTimedOut(Duration),

    #[error("provisioning statement failed: {0}")]
    Statement(#[source] sqlx::Error),
}

impl ProvisionError {
    /// True when the database itself could not be reached, as opposed to a
    /// statement being rejected.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ProvisionError::Connect(_) | ProvisionError::ConnectTimedOut(_)
        )
    }
}

/// Grants one account access to the target database.
pub trait Provisioner {
    fn grant(&self, name: &str) -> impl Future<Output = Result<(), ProvisionError>> + Send;
}

/// The production provisioner.
pub struct PgProvisioner {
    options: PgConnectOptions,
    group_name: String,
    connect_timeout: Duration,
}

impl PgProvisioner {
    pub fn new(config: &Config) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.database.host)
            .port(config.database.port)
            .database(&config.database_name)
            .username(&config.connect_user)
            .password(&config.connect_password)
            .ssl_mode(PgSslMode::Disable)
            .application_name("rolegated");

        Self {
            options,
            group_name: config.group_name.clone(),
            connect_timeout: config.database.connect_timeout(),
        }
    }

    async fn provision(&self, conn: &mut PgConnection, name: &str) -> Result<(), ProvisionError> {
        let existing: Option<String> =
            sqlx::query_scalar("select rolname from pg_roles where rolname = $1")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await
                .map_err(ProvisionError::Statement)?;

        if existing.is_none() {
            sqlx::query(&create_role_sql(name))
                .execute(&mut *conn)
                .await
                .map_err(ProvisionError::Statement)?;
            tracing::info!(role = name, "created database role");
        }

        // regranting an existing membership is a notice on the server, not
        // an error, so the grant runs unconditionally
        sqlx::query(&grant_membership_sql(&self.group_name, name))
            .execute(&mut *conn)
            .await
            .map_err(ProvisionError::Statement)?;

        Ok(())
    }
}

impl Provisioner for PgProvisioner {
    async fn grant(&self, name: &str) -> Result<(), ProvisionError> {
        let mut conn = match timeout(
            self.connect_timeout,
            PgConnection::connect_with(&self.options),
        )
        .await
        {
            Err(_) => return Err(ProvisionError::ConnectTimedOut(self.connect_timeout)),
            Ok(Err(err)) => return Err(ProvisionError::Connect(err)),
            Ok(Ok(conn)) => conn,
        };

        let result = self.provision(&mut conn, name).await;

        // release the connection on every path
        let _ = conn.close().await;

        result
    }
}

/// Role names cannot be bound as statement parameters in DDL, so they are
/// interpolated as quoted identifiers. The accepted name alphabet cannot
/// contain a quote character.
fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

fn create_role_sql(name: &str) -> String {
    format!("create role {} with login inherit", quote_ident(name))
}

fn grant_membership_sql(group: &str, name: &str) -> String {
    format!("grant {} to {}", quote_ident(group), quote_ident(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_quote_identifiers() {
        assert_eq!(
            create_role_sql("alice-01"),
            r#"create role "alice-01" with login inherit"#
        );
        assert_eq!(
            grant_membership_sql("fcs_users", "alice-01"),
            r#"grant "fcs_users" to "alice-01""#
        );
    }

    #[test]
    fn unreachable_classification() {
        assert!(ProvisionError::ConnectTimedOut(Duration::from_secs(2)).is_unreachable());
        assert!(ProvisionError::Connect(sqlx::Error::PoolClosed).is_unreachable());
        assert!(!ProvisionError::Statement(sqlx::Error::RowNotFound).is_unreachable());
    }
}
