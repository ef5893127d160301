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

//! Common SQL queries on the event table abstracted into rust functions.
//! Row-level security does the visibility filtering on every one of
//! them; callers never re-implement ACL checks in SQL.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::PgConnection;
use uuid::Uuid;

use super::models::{AuditRow, EventModel, LatestHead, SharedWith};
use crate::error::Result;

const EVENT_COLUMNS: &str = "event_id, entity_id, version, type_name, owner, updated_by, readers, writers, \
	 data, state, event_kind, event_meta, tx_time, valid_from, valid_to";

/// Latest version of one entity, capability columns included, for the
/// copy-forward step of version assignment.
pub(crate) async fn latest_head(conn: &mut PgConnection, entity_id: Uuid) -> Result<Option<LatestHead>> {
	sqlx::query_as::<_, LatestHead>(
		"SELECT version, owner, readers, writers, state, event_kind, data
		 FROM object_events
		 WHERE entity_id = $1
		 ORDER BY version DESC
		 LIMIT 1",
	)
	.bind(entity_id)
	.fetch_optional(conn)
	.await
	.map_err(Into::into)
}

/// Latest version of one entity of a known type, tombstones included —
/// the caller decides what a tombstone means for its operation.
pub(crate) async fn latest_event(
	conn: &mut PgConnection,
	type_name: &str,
	entity_id: Uuid,
) -> Result<Option<EventModel>> {
	sqlx::query_as::<_, EventModel>(&format!(
		"SELECT {} FROM object_events
		 WHERE entity_id = $1 AND type_name = $2
		 ORDER BY version DESC
		 LIMIT 1",
		EVENT_COLUMNS
	))
	.bind(entity_id)
	.bind(type_name)
	.fetch_optional(conn)
	.await
	.map_err(Into::into)
}

/// Every version of one entity in ascending version order, tombstones
/// included.
pub(crate) async fn history(conn: &mut PgConnection, type_name: &str, entity_id: Uuid) -> Result<Vec<EventModel>> {
	sqlx::query_as::<_, EventModel>(&format!(
		"SELECT {} FROM object_events
		 WHERE entity_id = $1 AND type_name = $2
		 ORDER BY version ASC",
		EVENT_COLUMNS
	))
	.bind(entity_id)
	.bind(type_name)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

/// Bi-temporal point-in-time read: the latest version satisfying
/// `tx_time <= $3` and `valid_from <= $4`, each constraint applied only
/// when present.
pub(crate) async fn as_of(
	conn: &mut PgConnection,
	type_name: &str,
	entity_id: Uuid,
	tx_time: Option<DateTime<Utc>>,
	valid_time: Option<DateTime<Utc>>,
) -> Result<Option<EventModel>> {
	sqlx::query_as::<_, EventModel>(&format!(
		"SELECT {} FROM object_events
		 WHERE entity_id = $1 AND type_name = $2
		 AND ($3::timestamptz IS NULL OR tx_time <= $3)
		 AND ($4::timestamptz IS NULL OR valid_from <= $4)
		 ORDER BY version DESC
		 LIMIT 1",
		EVENT_COLUMNS
	))
	.bind(entity_id)
	.bind(type_name)
	.bind(tx_time)
	.bind(valid_time)
	.fetch_optional(conn)
	.await
	.map_err(Into::into)
}

/// Latest-version projection of every visible entity of a type,
/// tombstones excluded, optionally filtered by JSONB containment and an
/// extra predicate fragment, paginated on `tx_time` descending.
pub(crate) async fn latest_by_type(
	conn: &mut PgConnection,
	type_name: &str,
	filter: Option<&Json>,
	predicate_sql: Option<&str>,
	before: Option<DateTime<Utc>>,
	limit: i64,
) -> Result<Vec<EventModel>> {
	let mut sql = format!(
		"SELECT {} FROM (
			SELECT DISTINCT ON (entity_id) {}
			FROM object_events
			WHERE type_name = $1
			ORDER BY entity_id, version DESC
		 ) latest
		 WHERE event_kind <> 'DELETED'
		 AND ($2::jsonb IS NULL OR data @> $2)
		 AND ($3::timestamptz IS NULL OR tx_time < $3)",
		EVENT_COLUMNS, EVENT_COLUMNS
	);
	if let Some(predicate) = predicate_sql {
		sql.push_str(" AND (");
		sql.push_str(predicate);
		sql.push(')');
	}
	sql.push_str(" ORDER BY tx_time DESC LIMIT $4");

	sqlx::query_as::<_, EventModel>(&sql)
		.bind(type_name)
		.bind(filter)
		.bind(before)
		.bind(limit)
		.fetch_all(conn)
		.await
		.map_err(Into::into)
}

/// Ordered audit tuples for one entity.
pub(crate) async fn audit(conn: &mut PgConnection, entity_id: Uuid) -> Result<Vec<AuditRow>> {
	sqlx::query_as::<_, AuditRow>(
		"SELECT version, event_kind, owner, updated_by, state, event_meta, tx_time, valid_from
		 FROM object_events
		 WHERE entity_id = $1
		 ORDER BY version ASC",
	)
	.bind(entity_id)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

/// Number of visible non-tombstone entities, optionally of one type.
pub(crate) async fn count(conn: &mut PgConnection, type_name: Option<&str>) -> Result<i64> {
	sqlx::query_scalar::<_, i64>(
		"SELECT COUNT(*) FROM (
			SELECT DISTINCT ON (entity_id) event_kind
			FROM object_events
			WHERE ($1::text IS NULL OR type_name = $1)
			ORDER BY entity_id, version DESC
		 ) latest
		 WHERE event_kind <> 'DELETED'",
	)
	.bind(type_name)
	.fetch_one(conn)
	.await
	.map_err(Into::into)
}

/// Distinct type names visible to the caller.
pub(crate) async fn distinct_types(conn: &mut PgConnection) -> Result<Vec<String>> {
	sqlx::query_scalar::<_, String>("SELECT DISTINCT type_name FROM object_events ORDER BY type_name")
		.fetch_all(conn)
		.await
		.map_err(Into::into)
}

/// Readers/writers of the latest version of one entity.
pub(crate) async fn shared_with(conn: &mut PgConnection, entity_id: Uuid) -> Result<Option<SharedWith>> {
	sqlx::query_as::<_, SharedWith>(
		"SELECT readers, writers FROM object_events
		 WHERE entity_id = $1
		 ORDER BY version DESC
		 LIMIT 1",
	)
	.bind(entity_id)
	.fetch_optional(conn)
	.await
	.map_err(Into::into)
}

/// Catch-up query: every event after the checkpoint, ascending by
/// `tx_time`.
pub(crate) async fn events_since(conn: &mut PgConnection, after: DateTime<Utc>) -> Result<Vec<EventModel>> {
	sqlx::query_as::<_, EventModel>(&format!(
		"SELECT {} FROM object_events
		 WHERE tx_time > $1
		 ORDER BY tx_time ASC",
		EVENT_COLUMNS
	))
	.bind(after)
	.fetch_all(conn)
	.await
	.map_err(Into::into)
}

/// A subscriber's persisted high-water mark, if any.
pub(crate) async fn load_checkpoint(
	conn: &mut PgConnection,
	subscriber_id: &str,
) -> Result<Option<DateTime<Utc>>> {
	sqlx::query_scalar::<_, DateTime<Utc>>(
		"SELECT last_tx_time FROM subscription_checkpoints WHERE subscriber_id = $1",
	)
	.bind(subscriber_id)
	.fetch_optional(conn)
	.await
	.map_err(Into::into)
}

/// Advance a subscriber's high-water mark.
pub(crate) async fn save_checkpoint(
	conn: &mut PgConnection,
	subscriber_id: &str,
	last_tx_time: DateTime<Utc>,
) -> Result<()> {
	sqlx::query(
		"INSERT INTO subscription_checkpoints (subscriber_id, last_tx_time)
		 VALUES ($1, $2)
		 ON CONFLICT (subscriber_id) DO UPDATE
			SET last_tx_time = EXCLUDED.last_tx_time,
				updated_at = now()",
	)
	.bind(subscriber_id)
	.bind(last_tx_time)
	.execute(conn)
	.await?;
	Ok(())
}
