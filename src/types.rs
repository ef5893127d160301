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

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::expr::Value;

/// What a single event row records about an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
	Created,
	Updated,
	Deleted,
	StateChange,
	Corrected,
}

impl EventKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			EventKind::Created => "CREATED",
			EventKind::Updated => "UPDATED",
			EventKind::Deleted => "DELETED",
			EventKind::StateChange => "STATE_CHANGE",
			EventKind::Corrected => "CORRECTED",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"CREATED" => Ok(EventKind::Created),
			"UPDATED" => Ok(EventKind::Updated),
			"DELETED" => Ok(EventKind::Deleted),
			"STATE_CHANGE" => Ok(EventKind::StateChange),
			"CORRECTED" => Ok(EventKind::Corrected),
			other => Err(format!("unknown event kind '{}'", other)),
		}
	}
}

/// Substrate-assigned metadata written back onto an entity after every
/// read and mutation. `version` doubles as the expected version for the
/// optimistic-concurrency check on the next mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreMeta {
	pub entity_id: Option<Uuid>,
	pub version: Option<i64>,
	pub owner: Option<String>,
	pub updated_by: Option<String>,
	pub state: Option<String>,
	pub event_kind: Option<EventKind>,
	pub tx_time: Option<DateTime<Utc>>,
	pub valid_from: Option<DateTime<Utc>>,
}

/// The closed set of legal field types on a domain entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
	Str,
	Int,
	Float,
	Bool,
	Instant,
	Decimal,
	Uuid,
}

impl FieldKind {
	pub fn name(&self) -> &'static str {
		match self {
			FieldKind::Str => "string",
			FieldKind::Int => "integer",
			FieldKind::Float => "float",
			FieldKind::Bool => "boolean",
			FieldKind::Instant => "instant",
			FieldKind::Decimal => "decimal",
			FieldKind::Uuid => "uuid",
		}
	}
}

/// One entry in an entity's field descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
	pub name: &'static str,
	pub kind: FieldKind,
	pub nullable: bool,
}

impl FieldDef {
	pub const fn new(name: &'static str, kind: FieldKind) -> Self {
		Self { name, kind, nullable: false }
	}

	pub const fn nullable(name: &'static str, kind: FieldKind) -> Self {
		Self { name, kind, nullable: true }
	}
}

/// A runtime field value. Decimals are carried as floats; the tagged JSON
/// representation preserves which one the field declared.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
	Null,
	Str(String),
	Int(i64),
	Float(f64),
	Bool(bool),
	Instant(DateTime<Utc>),
	Decimal(f64),
	Uuid(Uuid),
}

impl FieldValue {
	pub fn is_null(&self) -> bool {
		matches!(self, FieldValue::Null)
	}

	/// Expression-level view of this field. Instants become epoch
	/// microseconds so they stay comparable inside guards and computeds.
	pub fn to_value(&self) -> Value {
		match self {
			FieldValue::Null => Value::Null,
			FieldValue::Str(s) => Value::Str(s.clone()),
			FieldValue::Int(i) => Value::Int(*i),
			FieldValue::Float(f) => Value::Float(*f),
			FieldValue::Bool(b) => Value::Bool(*b),
			FieldValue::Instant(t) => Value::Int(t.timestamp_micros()),
			FieldValue::Decimal(d) => Value::Float(*d),
			FieldValue::Uuid(u) => Value::Str(u.to_string()),
		}
	}

	/// Inverse of [`to_value`](Self::to_value) for a known field kind.
	/// Returns `None` when the value cannot represent the kind.
	pub fn from_value(kind: FieldKind, value: &Value) -> Option<FieldValue> {
		match (kind, value) {
			(_, Value::Null) => Some(FieldValue::Null),
			(FieldKind::Str, Value::Str(s)) => Some(FieldValue::Str(s.clone())),
			(FieldKind::Int, Value::Int(i)) => Some(FieldValue::Int(*i)),
			(FieldKind::Float, Value::Int(i)) => Some(FieldValue::Float(*i as f64)),
			(FieldKind::Float, Value::Float(f)) => Some(FieldValue::Float(*f)),
			(FieldKind::Bool, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
			(FieldKind::Instant, Value::Int(micros)) => {
				let secs = micros.div_euclid(1_000_000);
				let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
				DateTime::from_timestamp(secs, nanos).map(FieldValue::Instant)
			}
			(FieldKind::Decimal, Value::Int(i)) => Some(FieldValue::Decimal(*i as f64)),
			(FieldKind::Decimal, Value::Float(f)) => Some(FieldValue::Decimal(*f)),
			(FieldKind::Uuid, Value::Str(s)) => Uuid::parse_str(s).ok().map(FieldValue::Uuid),
			_ => None,
		}
	}
}

impl From<&str> for FieldValue {
	fn from(s: &str) -> Self {
		FieldValue::Str(s.to_string())
	}
}

impl From<String> for FieldValue {
	fn from(s: String) -> Self {
		FieldValue::Str(s)
	}
}

impl From<i64> for FieldValue {
	fn from(i: i64) -> Self {
		FieldValue::Int(i)
	}
}

impl From<f64> for FieldValue {
	fn from(f: f64) -> Self {
		FieldValue::Float(f)
	}
}

impl From<bool> for FieldValue {
	fn from(b: bool) -> Self {
		FieldValue::Bool(b)
	}
}

impl From<DateTime<Utc>> for FieldValue {
	fn from(t: DateTime<Utc>) -> Self {
		FieldValue::Instant(t)
	}
}

impl From<Uuid> for FieldValue {
	fn from(u: Uuid) -> Self {
		FieldValue::Uuid(u)
	}
}

impl<T> From<Option<T>> for FieldValue
where
	T: Into<FieldValue>,
{
	fn from(v: Option<T>) -> Self {
		match v {
			Some(v) => v.into(),
			None => FieldValue::Null,
		}
	}
}

/// Notification payload for an entity change, published by the
/// after-insert trigger and carried by the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
	pub entity_id: Uuid,
	pub version: i64,
	pub event_kind: EventKind,
	pub type_name: String,
	pub updated_by: String,
	#[serde(default)]
	pub state: Option<String>,
	pub tx_time: DateTime<Utc>,
}
