//! Existence lookups against the LDAP directory.
//!
//! The daemon never reads anything out of the directory; it only needs to
//! know whether an exact record exists for a candidate account name. Each
//! lookup opens its own session, binds anonymously, performs a base-scope
//! search against the configured DN template, and unbinds unconditionally
//! before returning, on every path.
//!
//! Connect failures and per-attempt timeouts are treated as transient and
//! retried on the fixed policy from the configuration; a rejected bind or
//! a failed search result is fatal to the call immediately.

use std::future::Future;
use std::time::Duration;

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchOptions};
use thiserror::Error;
use tokio::time::timeout;

use crate::config::DirectorySettings;
use crate::services::retry::RetryPolicy;

/// Outcome of an existence lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found,
    NotFound,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory connection failed: {0}")]
    Connect(#[source] LdapError),

    #[error("directory bind rejected: {0}")]
    Bind(#[source] LdapError),

    #[error("directory search failed: {0}")]
    Search(#[source] LdapError),

    #[error("directory operation timed out after {0:?}")]
    TimedOut(Duration),
}

impl DirectoryError {
    /// The "server down" and "timeout" classes are worth another attempt;
    /// everything else fails the call on the spot.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::Connect(_) | DirectoryError::TimedOut(_)
        )
    }
}

/// Answers whether an account name exists upstream.
pub trait Directory {
    fn exists(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Lookup, DirectoryError>> + Send;
}

/// The production lookup client.
pub struct LdapDirectory {
    url: String,
    entry_dn: String,
    policy: RetryPolicy,
    op_timeout: Duration,
}

impl LdapDirectory {
    pub fn new(settings: &DirectorySettings) -> Self {
        Self {
            url: settings.url.clone(),
            entry_dn: settings.entry_dn.clone(),
            policy: settings.retry_policy(),
            op_timeout: settings.op_timeout(),
        }
    }

    async fn connect_and_bind(&self) -> Result<Ldap, DirectoryError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.op_timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(DirectoryError::Connect)?;

        tokio::spawn(async move {
            if let Err(err) = conn.drive().await {
                tracing::debug!(%err, "directory connection closed");
            }
        });

        // a bind is the directory's way of saying "authenticate"; the
        // lookup runs anonymously and the session carries no caller identity
        let bound = match timeout(self.op_timeout, ldap.simple_bind("", "")).await {
            Err(_) => {
                let _ = ldap.unbind().await;
                return Err(DirectoryError::TimedOut(self.op_timeout));
            }
            Ok(Err(err)) => {
                let _ = ldap.unbind().await;
                return Err(DirectoryError::Bind(err));
            }
            Ok(Ok(result)) => result,
        };
        if let Err(err) = bound.success() {
            let _ = ldap.unbind().await;
            return Err(DirectoryError::Bind(err));
        }

        Ok(ldap)
    }

    /// Base-scope search for the exact entry, retried on its own budget.
    /// The borrow of the live session keeps this loop manual instead of
    /// going through [`RetryPolicy::run`].
    async fn search_entry(&self, ldap: &mut Ldap, dn: &str) -> Result<Lookup, DirectoryError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match timeout(
                self.op_timeout,
                ldap.with_search_options(SearchOptions::new().sizelimit(1))
                    .search(dn, Scope::Base, "(objectClass=*)", vec!["1.1"]),
            )
            .await
            {
                Err(_) => DirectoryError::TimedOut(self.op_timeout),
                Ok(Err(err)) if is_transient_ldap(&err) => DirectoryError::Search(err),
                Ok(Err(err)) => return Err(DirectoryError::Search(err)),
                Ok(Ok(result)) => match result.success() {
                    Ok((entries, _)) => {
                        return Ok(if entries.is_empty() {
                            Lookup::NotFound
                        } else {
                            Lookup::Found
                        });
                    }
                    // a base search for an absent entry fails with
                    // noSuchObject rather than returning zero entries
                    Err(LdapError::LdapResult { result })
                        if result.rc == NO_SUCH_OBJECT =>
                    {
                        return Ok(Lookup::NotFound);
                    }
                    Err(err) => return Err(DirectoryError::Search(err)),
                },
            };

            if attempt >= self.policy.max_attempts {
                return Err(err);
            }
            self.policy.pause().await;
        }
    }
}

/// LDAP resultCode for a search whose base object does not exist.
const NO_SUCH_OBJECT: u32 = 32;

fn is_transient_ldap(err: &LdapError) -> bool {
    matches!(err, LdapError::Io { .. } | LdapError::EndOfStream)
}

impl Directory for LdapDirectory {
    async fn exists(&self, name: &str) -> Result<Lookup, DirectoryError> {
        let dn = self.entry_dn.replace("{name}", name);

        let mut ldap = self
            .policy
            .run(|| self.connect_and_bind(), DirectoryError::is_transient)
            .await?;

        let outcome = self.search_entry(&mut ldap, &dn).await;

        // the session is torn down on every path, success or failure
        let _ = ldap.unbind().await;

        outcome
    }
}
