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

//! Row models for the event and checkpoint tables.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::entity::{self, Entity};
use crate::error::{Result, StoreError};
use crate::types::{ChangeEvent, EventKind, StoreMeta};

/// One full row of `object_events`.
#[derive(Debug, Clone, FromRow)]
pub struct EventModel {
	pub event_id: Uuid,
	pub entity_id: Uuid,
	pub version: i64,
	pub type_name: String,
	pub owner: String,
	pub updated_by: String,
	pub readers: Vec<String>,
	pub writers: Vec<String>,
	pub data: Json,
	pub state: Option<String>,
	pub event_kind: String,
	pub event_meta: Option<Json>,
	pub tx_time: DateTime<Utc>,
	pub valid_from: DateTime<Utc>,
	pub valid_to: Option<DateTime<Utc>>,
}

impl EventModel {
	pub fn kind(&self) -> Result<EventKind> {
		self.event_kind
			.parse()
			.map_err(|e: String| StoreError::validation("event_kind", e))
	}

	pub fn is_tombstone(&self) -> bool {
		self.event_kind == EventKind::Deleted.as_str()
	}

	/// Deserialize the snapshot into a typed entity with its store
	/// metadata populated.
	pub fn to_entity<E: Entity>(&self) -> Result<E> {
		let mut entity: E = entity::from_document(&self.data)?;
		*entity.meta_mut() = self.to_meta()?;
		Ok(entity)
	}

	pub fn to_meta(&self) -> Result<StoreMeta> {
		Ok(StoreMeta {
			entity_id: Some(self.entity_id),
			version: Some(self.version),
			owner: Some(self.owner.clone()),
			updated_by: Some(self.updated_by.clone()),
			state: self.state.clone(),
			event_kind: Some(self.kind()?),
			tx_time: Some(self.tx_time),
			valid_from: Some(self.valid_from),
		})
	}

	pub fn change_event(&self) -> Result<ChangeEvent> {
		Ok(ChangeEvent {
			entity_id: self.entity_id,
			version: self.version,
			event_kind: self.kind()?,
			type_name: self.type_name.clone(),
			updated_by: self.updated_by.clone(),
			state: self.state.clone(),
			tx_time: self.tx_time,
		})
	}
}

/// The columns a mutation gets back from `RETURNING`, written onto the
/// in-memory entity so callers can chain with correct OCC tracking.
#[derive(Debug, Clone, FromRow)]
pub struct EventHeader {
	pub entity_id: Uuid,
	pub version: i64,
	pub owner: String,
	pub updated_by: String,
	pub state: Option<String>,
	pub event_kind: String,
	pub tx_time: DateTime<Utc>,
	pub valid_from: DateTime<Utc>,
}

impl EventHeader {
	pub fn apply<E: Entity>(&self, entity: &mut E) -> Result<()> {
		let kind: EventKind = self
			.event_kind
			.parse()
			.map_err(|e: String| StoreError::validation("event_kind", e))?;
		let meta = entity.meta_mut();
		meta.entity_id = Some(self.entity_id);
		meta.version = Some(self.version);
		meta.owner = Some(self.owner.clone());
		meta.updated_by = Some(self.updated_by.clone());
		meta.state = self.state.clone();
		meta.event_kind = Some(kind);
		meta.tx_time = Some(self.tx_time);
		meta.valid_from = Some(self.valid_from);
		Ok(())
	}
}

/// Latest-version snapshot used by the optimistic-concurrency path:
/// capability columns are copied forward onto the next version.
#[derive(Debug, Clone, FromRow)]
pub struct LatestHead {
	pub version: i64,
	pub owner: String,
	pub readers: Vec<String>,
	pub writers: Vec<String>,
	pub state: Option<String>,
	pub event_kind: String,
	pub data: Json,
}

/// One `audit` tuple, ascending by version.
#[derive(Debug, Clone, FromRow)]
pub struct AuditRow {
	pub version: i64,
	pub event_kind: String,
	pub owner: String,
	pub updated_by: String,
	pub state: Option<String>,
	pub event_meta: Option<Json>,
	pub tx_time: DateTime<Utc>,
	pub valid_from: DateTime<Utc>,
}

/// Who an entity is shared with.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SharedWith {
	pub readers: Vec<String>,
	pub writers: Vec<String>,
}
