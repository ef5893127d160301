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

use std::io;

use thiserror::Error;

use crate::expr::ExprError;
use crate::workflow::WorkflowError;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Boxed error type carried by user-supplied callbacks (actions, hooks,
/// effects). Failures cross the store boundary opaquely.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

// SQLSTATE codes the store maps to precise error kinds.
const INSUFFICIENT_PRIVILEGE: &str = "42501";
const INVALID_PASSWORD: &str = "28P01";
const INVALID_AUTHORIZATION: &str = "28000";

/// Chronicle Store Error Enum
#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),

	// database error
	#[error("sqlx error: {0}")]
	Sql(sqlx::Error),
	#[error("migration error: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),

	// access control
	#[error("authentication failed: {0}")]
	Auth(String),
	#[error("permission denied: {0}")]
	PermissionDenied(String),

	// optimistic concurrency
	#[error("version conflict: expected {expected}, actual {actual}")]
	VersionConflict { expected: i64, actual: i64 },

	/// The entity never existed, or the caller cannot see it. The two are
	/// indistinguishable: an ACL failure *is* invisibility.
	#[error("entity not found or not visible")]
	NotFound,

	// state machine
	#[error("cannot transition from '{from}' to '{to}', allowed: {allowed:?}")]
	InvalidTransition { from: String, to: String, allowed: Vec<String> },
	#[error("guard failed for transition '{from}' -> '{to}': {guard}")]
	GuardFailure { from: String, to: String, guard: String },
	#[error("'{principal}' not permitted for transition '{from}' -> '{to}', allowed: {allowed_by:?}")]
	TransitionNotPermitted { from: String, to: String, principal: String, allowed_by: Vec<String> },
	#[error("action failed for transition '{from}' -> '{to}': {source}")]
	ActionFailed { from: String, to: String, source: BoxedError },

	// schema / value errors
	#[error("validation failed on '{field}': {reason}")]
	Validation { field: String, reason: String },
	#[error("cannot serialize '{field}': {reason}")]
	Serialization { field: String, reason: String },

	#[error(transparent)]
	Arithmetic(#[from] ExprError),

	#[error(transparent)]
	Workflow(#[from] WorkflowError),

	// channel error
	#[error("sending on a disconnected channel")]
	Channel,
}

impl StoreError {
	pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
		StoreError::Validation { field: field.into(), reason: reason.into() }
	}

	pub(crate) fn serialization(field: impl Into<String>, reason: impl Into<String>) -> Self {
		StoreError::Serialization { field: field.into(), reason: reason.into() }
	}
}

impl From<sqlx::Error> for StoreError {
	fn from(e: sqlx::Error) -> Self {
		match &e {
			sqlx::Error::RowNotFound => return StoreError::NotFound,
			sqlx::Error::Database(db) => {
				if let Some(code) = db.code() {
					if code == INSUFFICIENT_PRIVILEGE {
						return StoreError::PermissionDenied(db.message().to_string());
					}
					if code == INVALID_PASSWORD || code == INVALID_AUTHORIZATION {
						return StoreError::Auth(db.message().to_string());
					}
				}
			}
			_ => {}
		}
		StoreError::Sql(e)
	}
}

impl<T> From<flume::SendError<T>> for StoreError {
	fn from(_: flume::SendError<T>) -> Self {
		Self::Channel
	}
}
