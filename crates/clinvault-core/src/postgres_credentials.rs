//! PostgreSQL credential backend.
//!
//! Feature-gated behind `postgres`. Opens a short-lived admin connection per
//! call with `sqlx`; roles are created with `VALID UNTIL` so PostgreSQL
//! itself refuses logins after expiry even if a revoke is missed.

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tracing::debug;

use crate::credentials::{
    AccountSpec, AdminCredentials, CredentialBackend, DbTarget, RevokeOutcome, sanitize_identifier,
};
use crate::error::CredentialError;

/// Creates `LOGIN` roles in a PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PostgresCredentialBackend {
    name: String,
}

impl PostgresCredentialBackend {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn err(&self, e: impl std::fmt::Display) -> CredentialError {
        CredentialError::Backend {
            backend: self.name.clone(),
            reason: e.to_string(),
        }
    }

    async fn connect(
        &self,
        admin: &AdminCredentials,
        target: &DbTarget,
    ) -> Result<PgConnection, CredentialError> {
        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&admin.username)
            .password(&admin.password)
            .database(&target.database);
        PgConnection::connect_with(&options)
            .await
            .map_err(|e| self.err(e))
    }
}

#[async_trait::async_trait]
impl CredentialBackend for PostgresCredentialBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision(
        &self,
        admin: &AdminCredentials,
        target: &DbTarget,
        account: &AccountSpec,
    ) -> Result<(), CredentialError> {
        let role = sanitize_identifier(&account.username);
        let database = sanitize_identifier(&target.database);
        let valid_until = account.valid_until.format("%Y-%m-%d %H:%M:%S%:z");
        let password = account.password.replace('\'', "''");

        let mut statements = vec![
            format!("CREATE ROLE \"{role}\" LOGIN PASSWORD '{password}' VALID UNTIL '{valid_until}'"),
            format!("GRANT CONNECT ON DATABASE \"{database}\" TO \"{role}\""),
            format!("GRANT USAGE ON SCHEMA public TO \"{role}\""),
            format!("GRANT SELECT ON ALL TABLES IN SCHEMA public TO \"{role}\""),
        ];
        if !account.read_only {
            statements.push(format!(
                "GRANT INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA public TO \"{role}\""
            ));
            statements.push(format!(
                "GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA public TO \"{role}\""
            ));
        }

        let mut conn = self.connect(admin, target).await?;
        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut conn)
                .await
                .map_err(|e| self.err(e))?;
        }
        conn.close().await.map_err(|e| self.err(e))?;
        debug!(role = %role, read_only = account.read_only, "postgres role created");
        Ok(())
    }

    async fn revoke(
        &self,
        admin: &AdminCredentials,
        target: &DbTarget,
        username: &str,
    ) -> Result<RevokeOutcome, CredentialError> {
        let role = sanitize_identifier(username);
        let mut conn = self.connect(admin, target).await?;

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_roles WHERE rolname = $1")
            .bind(&role)
            .fetch_optional(&mut conn)
            .await
            .map_err(|e| self.err(e))?;
        if exists.is_none() {
            conn.close().await.map_err(|e| self.err(e))?;
            return Ok(RevokeOutcome::NotFound);
        }

        for statement in [
            format!("DROP OWNED BY \"{role}\""),
            format!("DROP ROLE IF EXISTS \"{role}\""),
        ] {
            sqlx::query(&statement)
                .execute(&mut conn)
                .await
                .map_err(|e| self.err(e))?;
        }
        conn.close().await.map_err(|e| self.err(e))?;
        debug!(role = %role, "postgres role dropped");
        Ok(RevokeOutcome::Dropped)
    }
}
