// Copyright 2024-2026 chronicle-store contributors.
// This file is part of chronicle-store.

// chronicle-store is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// chronicle-store is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with chronicle-store.  If not, see <http://www.gnu.org/licenses/>.

//! Admin-side IO for the PostgreSQL substrate: migrations, role
//! bootstrap and zero-trust user provisioning. Principal-scoped data
//! access lives in [`crate::store`].

pub mod listener;
pub mod models;
pub mod queries;

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, Postgres};
use sqlx::Connection;

pub use self::listener::Listener;
use crate::error::{Result, StoreError};

/// Group role every provisioned principal inherits.
pub const GROUP_ROLE: &str = "app_user";
/// Admin role: bypasses row-level security, provisions users.
pub const ADMIN_ROLE: &str = "app_admin";

/// Run all the migrations.
pub async fn migrate<T: AsRef<str>>(url: T) -> Result<()> {
	let mut conn = PgConnection::connect(url.as_ref()).await?;
	sqlx::migrate!("./src/migrations").run(&mut conn).await?;
	Ok(())
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatabaseConfig {
	/// PostgreSQL url.
	pub url: String,
}

impl fmt::Display for DatabaseConfig {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.url)
	}
}

/// Administrative handle on the substrate. Connect with a role that owns
/// the schema (table owner or superuser).
#[derive(Clone)]
pub struct Database {
	/// pool of database connections
	pool: PgPool,
	url: String,
}

impl Database {
	/// Connect to the database
	pub async fn new(url: String) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.min_connections(1)
			.max_connections(8)
			.idle_timeout(Duration::from_secs(60))
			.connect(url.as_str())
			.await?;
		Ok(Self { pool, url })
	}

	/// Start the database with a pre-defined pool
	pub fn with_pool(url: String, pool: PgPool) -> Self {
		Self { pool, url }
	}

	pub async fn conn(&self) -> Result<DbConn> {
		self.pool.acquire().await.map_err(Into::into)
	}

	pub fn pool(&self) -> &sqlx::PgPool {
		&self.pool
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	/// Create the application roles and run every migration. Idempotent;
	/// run once at deployment and after upgrades.
	pub async fn setup(&self, admin_password: &str) -> Result<()> {
		self.bootstrap_roles(admin_password).await?;
		migrate(&self.url).await?;
		Ok(())
	}

	// Roles are cluster-level and carry passwords, so they are
	// bootstrapped at runtime rather than inside static migrations.
	async fn bootstrap_roles(&self, admin_password: &str) -> Result<()> {
		let mut conn = self.conn().await?;

		let group_exists = role_exists(&mut conn, GROUP_ROLE).await?;
		if !group_exists {
			sqlx::query(&format!(
				"CREATE ROLE {} NOLOGIN NOSUPERUSER NOCREATEDB NOCREATEROLE NOBYPASSRLS",
				GROUP_ROLE
			))
			.execute(&mut *conn)
			.await?;
		}

		let admin_exists = role_exists(&mut conn, ADMIN_ROLE).await?;
		let password = escape_literal(admin_password);
		if !admin_exists {
			sqlx::query(&format!(
				"CREATE ROLE {} LOGIN PASSWORD '{}' NOSUPERUSER NOCREATEDB CREATEROLE NOBYPASSRLS",
				ADMIN_ROLE, password
			))
			.execute(&mut *conn)
			.await?;
		} else {
			sqlx::query(&format!("ALTER ROLE {} PASSWORD '{}'", ADMIN_ROLE, password))
				.execute(&mut *conn)
				.await?;
		}

		// The admin grants the group role to freshly provisioned users.
		sqlx::query(&format!("GRANT {} TO {} WITH ADMIN OPTION", GROUP_ROLE, ADMIN_ROLE))
			.execute(&mut *conn)
			.await?;
		Ok(())
	}

	/// Create a login role for a user with minimal privileges: no RLS
	/// bypass, no role escalation, no schema rights, membership in
	/// `app_user` only. Re-provisioning an existing user resets the
	/// password.
	pub async fn provision_user(&self, username: &str, password: &str) -> Result<()> {
		validate_identifier(username)?;
		let password = escape_literal(password);
		let mut conn = self.conn().await?;

		if role_exists(&mut conn, username).await? {
			sqlx::query(&format!("ALTER ROLE \"{}\" PASSWORD '{}'", username, password))
				.execute(&mut *conn)
				.await?;
			return Ok(());
		}

		sqlx::query(&format!(
			"CREATE ROLE \"{}\" LOGIN PASSWORD '{}' NOSUPERUSER NOCREATEDB NOCREATEROLE NOBYPASSRLS",
			username, password
		))
		.execute(&mut *conn)
		.await?;
		sqlx::query(&format!("GRANT {} TO \"{}\"", GROUP_ROLE, username)).execute(&mut *conn).await?;
		log::info!("provisioned user '{}'", username);
		Ok(())
	}
}

pub type DbConn = PoolConnection<Postgres>;

async fn role_exists(conn: &mut DbConn, role: &str) -> Result<bool> {
	let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_roles WHERE rolname = $1")
		.bind(role)
		.fetch_optional(&mut **conn)
		.await?;
	Ok(exists.is_some())
}

// Role names cannot be bound as parameters; refuse anything that is not
// a plain identifier.
fn validate_identifier(name: &str) -> Result<()> {
	let ok = !name.is_empty()
		&& name.len() <= 63
		&& name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
		&& !name.chars().next().map_or(false, |c| c.is_ascii_digit());
	if ok {
		Ok(())
	} else {
		Err(StoreError::validation("username", format!("invalid identifier {:?}", name)))
	}
}

fn escape_literal(s: &str) -> String {
	s.replace('\'', "''")
}
