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

//! The [`Entity`] trait and the JSONB document codec.
//!
//! A domain type declares a static table of field descriptors and
//! field-wise get/set; everything else — serialization, validation,
//! reactive tracking, guard contexts — is derived from the descriptors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as Json};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::expr::Value;
use crate::types::{FieldDef, FieldKind, FieldValue, StoreMeta};

// i64 values beyond 2^53 lose precision as JSON numbers; carry them as
// strings instead.
const SAFE_INT: i64 = 1 << 53;

/// A storable domain type: named typed fields plus store-assigned
/// metadata. Implementations are plain value types; the descriptor table
/// is the single source of truth for the schema.
pub trait Entity: Clone + Default + Send + Sync + 'static {
	/// Stable identifier of this class in the event table.
	const TYPE_NAME: &'static str;

	/// Field descriptors, in declaration order.
	fn fields() -> &'static [FieldDef];

	/// Read one field by name. `None` for unknown fields.
	fn get(&self, field: &str) -> Option<FieldValue>;

	/// Write one field by name. Returns false for unknown fields.
	fn set(&mut self, field: &str, value: FieldValue) -> bool;

	fn meta(&self) -> &StoreMeta;

	fn meta_mut(&mut self) -> &mut StoreMeta;
}

/// Serialize an entity to its JSONB document. Validates nullability and
/// field kinds on the way out.
pub fn to_document<E: Entity>(entity: &E) -> Result<Json> {
	let mut doc = Map::with_capacity(E::fields().len());
	for def in E::fields() {
		let value = entity.get(def.name).unwrap_or(FieldValue::Null);
		doc.insert(def.name.to_string(), encode_field(def, &value)?);
	}
	Ok(Json::Object(doc))
}

/// Deserialize an entity from a JSONB document. Extra fields are
/// ignored; missing non-nullable fields fail validation.
pub fn from_document<E: Entity>(doc: &Json) -> Result<E> {
	let obj = doc
		.as_object()
		.ok_or_else(|| StoreError::validation(E::TYPE_NAME, "document is not a JSON object"))?;
	let mut entity = E::default();
	for def in E::fields() {
		let value = decode_field(def, obj.get(def.name))?;
		entity.set(def.name, value);
	}
	Ok(entity)
}

/// Expression context over an entity's current field values, for guards.
pub fn eval_context<E: Entity>(entity: &E) -> BTreeMap<String, Value> {
	E::fields()
		.iter()
		.map(|def| {
			let value = entity.get(def.name).unwrap_or(FieldValue::Null);
			(def.name.to_string(), value.to_value())
		})
		.collect()
}

fn encode_field(def: &FieldDef, value: &FieldValue) -> Result<Json> {
	if value.is_null() {
		if !def.nullable {
			return Err(StoreError::validation(def.name, "null not allowed (field is not nullable)"));
		}
		return Ok(Json::Null);
	}
	match (def.kind, value) {
		(FieldKind::Str, FieldValue::Str(s)) => Ok(Json::String(s.clone())),
		(FieldKind::Bool, FieldValue::Bool(b)) => Ok(Json::Bool(*b)),
		(FieldKind::Int, FieldValue::Int(i)) => {
			if i.unsigned_abs() <= SAFE_INT as u64 {
				Ok(json!(i))
			} else {
				Ok(Json::String(i.to_string()))
			}
		}
		(FieldKind::Float, FieldValue::Float(f)) => encode_float(def, *f),
		(FieldKind::Instant, FieldValue::Instant(t)) => {
			Ok(json!({ "__type__": "datetime", "value": t.to_rfc3339() }))
		}
		(FieldKind::Decimal, FieldValue::Decimal(d)) => {
			if !d.is_finite() {
				return Err(StoreError::serialization(def.name, "non-finite decimal"));
			}
			Ok(json!({ "__type__": "Decimal", "value": d.to_string() }))
		}
		(FieldKind::Uuid, FieldValue::Uuid(u)) => {
			Ok(json!({ "__type__": "UUID", "value": u.to_string() }))
		}
		(kind, other) => Err(StoreError::validation(
			def.name,
			format!("expected {}, got {:?}", kind.name(), other),
		)),
	}
}

fn encode_float(def: &FieldDef, f: f64) -> Result<Json> {
	if !f.is_finite() {
		return Err(StoreError::serialization(def.name, "non-finite float"));
	}
	serde_json::Number::from_f64(f)
		.map(Json::Number)
		.ok_or_else(|| StoreError::serialization(def.name, "float is not representable"))
}

fn decode_field(def: &FieldDef, raw: Option<&Json>) -> Result<FieldValue> {
	let raw = match raw {
		None | Some(Json::Null) => {
			if def.nullable {
				return Ok(FieldValue::Null);
			}
			return Err(StoreError::validation(def.name, "missing non-nullable field"));
		}
		Some(raw) => raw,
	};
	let mismatch = || StoreError::validation(def.name, format!("expected {}, got {}", def.kind.name(), raw));
	match def.kind {
		FieldKind::Str => raw.as_str().map(|s| FieldValue::Str(s.to_string())).ok_or_else(mismatch),
		FieldKind::Bool => raw.as_bool().map(FieldValue::Bool).ok_or_else(mismatch),
		FieldKind::Int => match raw {
			Json::Number(n) => n.as_i64().map(FieldValue::Int).ok_or_else(mismatch),
			// Out-of-safe-range integers arrive as strings.
			Json::String(s) => s.parse::<i64>().map(FieldValue::Int).map_err(|_| mismatch()),
			_ => Err(mismatch()),
		},
		FieldKind::Float => raw.as_f64().map(FieldValue::Float).ok_or_else(mismatch),
		FieldKind::Instant => {
			let s = tagged_value(raw, "datetime").ok_or_else(mismatch)?;
			DateTime::parse_from_rfc3339(s)
				.map(|t| FieldValue::Instant(t.with_timezone(&Utc)))
				.map_err(|e| StoreError::validation(def.name, format!("bad datetime: {}", e)))
		}
		FieldKind::Decimal => match raw {
			Json::Number(n) => n.as_f64().map(FieldValue::Decimal).ok_or_else(mismatch),
			_ => {
				let s = tagged_value(raw, "Decimal").ok_or_else(mismatch)?;
				s.parse::<f64>().map(FieldValue::Decimal).map_err(|_| mismatch())
			}
		},
		FieldKind::Uuid => {
			let s = match raw {
				Json::String(s) => s.as_str(),
				_ => tagged_value(raw, "UUID").ok_or_else(mismatch)?,
			};
			Uuid::parse_str(s)
				.map(FieldValue::Uuid)
				.map_err(|e| StoreError::validation(def.name, format!("bad uuid: {}", e)))
		}
	}
}

fn tagged_value<'a>(raw: &'a Json, tag: &str) -> Option<&'a str> {
	let obj = raw.as_object()?;
	if obj.get("__type__")?.as_str()? != tag {
		return None;
	}
	obj.get("value")?.as_str()
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::types::FieldKind::{Bool, Decimal, Float, Instant, Int, Str};

	/// Minimal three-field entity used across the unit suites.
	#[derive(Debug, Clone, Default, PartialEq)]
	pub struct Widget {
		pub name: String,
		pub color: String,
		pub weight: f64,
		pub meta: StoreMeta,
	}

	impl Widget {
		pub fn new(name: &str, color: &str, weight: f64) -> Self {
			Self { name: name.to_string(), color: color.to_string(), weight, meta: StoreMeta::default() }
		}
	}

	impl Entity for Widget {
		const TYPE_NAME: &'static str = "Widget";

		fn fields() -> &'static [FieldDef] {
			static FIELDS: [FieldDef; 3] = [
				FieldDef::new("name", Str),
				FieldDef::new("color", Str),
				FieldDef::new("weight", Float),
			];
			&FIELDS
		}

		fn get(&self, field: &str) -> Option<FieldValue> {
			match field {
				"name" => Some(FieldValue::Str(self.name.clone())),
				"color" => Some(FieldValue::Str(self.color.clone())),
				"weight" => Some(FieldValue::Float(self.weight)),
				_ => None,
			}
		}

		fn set(&mut self, field: &str, value: FieldValue) -> bool {
			match (field, value) {
				("name", FieldValue::Str(s)) => self.name = s,
				("color", FieldValue::Str(s)) => self.color = s,
				("weight", FieldValue::Float(f)) => self.weight = f,
				("weight", FieldValue::Int(i)) => self.weight = i as f64,
				_ => return false,
			}
			true
		}

		fn meta(&self) -> &StoreMeta {
			&self.meta
		}

		fn meta_mut(&mut self) -> &mut StoreMeta {
			&mut self.meta
		}
	}

	/// Entity exercising every field kind.
	#[derive(Debug, Clone, Default, PartialEq)]
	pub struct Ledger {
		pub label: String,
		pub count: i64,
		pub ratio: f64,
		pub active: bool,
		pub recorded_at: Option<DateTime<Utc>>,
		pub amount: f64,
		pub reference: Option<Uuid>,
		pub meta: StoreMeta,
	}

	impl Entity for Ledger {
		const TYPE_NAME: &'static str = "Ledger";

		fn fields() -> &'static [FieldDef] {
			static FIELDS: [FieldDef; 7] = [
				FieldDef::new("label", Str),
				FieldDef::new("count", Int),
				FieldDef::new("ratio", Float),
				FieldDef::new("active", Bool),
				FieldDef::nullable("recorded_at", Instant),
				FieldDef::new("amount", Decimal),
				FieldDef::nullable("reference", FieldKind::Uuid),
			];
			&FIELDS
		}

		fn get(&self, field: &str) -> Option<FieldValue> {
			match field {
				"label" => Some(FieldValue::Str(self.label.clone())),
				"count" => Some(FieldValue::Int(self.count)),
				"ratio" => Some(FieldValue::Float(self.ratio)),
				"active" => Some(FieldValue::Bool(self.active)),
				"recorded_at" => Some(self.recorded_at.into()),
				"amount" => Some(FieldValue::Decimal(self.amount)),
				"reference" => Some(self.reference.into()),
				_ => None,
			}
		}

		fn set(&mut self, field: &str, value: FieldValue) -> bool {
			match (field, value) {
				("label", FieldValue::Str(s)) => self.label = s,
				("count", FieldValue::Int(i)) => self.count = i,
				("ratio", FieldValue::Float(f)) => self.ratio = f,
				("active", FieldValue::Bool(b)) => self.active = b,
				("recorded_at", FieldValue::Instant(t)) => self.recorded_at = Some(t),
				("recorded_at", FieldValue::Null) => self.recorded_at = None,
				("amount", FieldValue::Decimal(d)) => self.amount = d,
				("amount", FieldValue::Float(f)) => self.amount = f,
				("reference", FieldValue::Uuid(u)) => self.reference = Some(u),
				("reference", FieldValue::Null) => self.reference = None,
				_ => return false,
			}
			true
		}

		fn meta(&self) -> &StoreMeta {
			&self.meta
		}

		fn meta_mut(&mut self) -> &mut StoreMeta {
			&mut self.meta
		}
	}

	#[test]
	fn widget_round_trips() {
		let w = Widget::new("gear", "blue", 1.5);
		let doc = to_document(&w).unwrap();
		assert_eq!(doc, json!({"name": "gear", "color": "blue", "weight": 1.5}));
		let back: Widget = from_document(&doc).unwrap();
		assert_eq!(back.name, "gear");
		assert_eq!(back.color, "blue");
		assert!((back.weight - 1.5).abs() < f64::EPSILON);
	}

	#[test]
	fn tagged_forms_round_trip() {
		let t = DateTime::parse_from_rfc3339("2026-01-15T10:30:00Z").unwrap().with_timezone(&Utc);
		let id = Uuid::new_v4();
		let l = Ledger {
			label: "fills".into(),
			count: 3,
			ratio: 0.25,
			active: true,
			recorded_at: Some(t),
			amount: 123.456,
			reference: Some(id),
			meta: StoreMeta::default(),
		};
		let doc = to_document(&l).unwrap();
		assert_eq!(doc["recorded_at"]["__type__"], "datetime");
		assert_eq!(doc["amount"]["__type__"], "Decimal");
		assert_eq!(doc["reference"]["__type__"], "UUID");

		let back: Ledger = from_document(&doc).unwrap();
		assert_eq!(back.recorded_at, Some(t));
		assert_eq!(back.reference, Some(id));
		assert!((back.amount - 123.456).abs() < 1e-9);
	}

	#[test]
	fn big_integers_become_strings() {
		let l = Ledger { label: "big".into(), count: i64::MAX, ..Default::default() };
		let doc = to_document(&l).unwrap();
		assert_eq!(doc["count"], json!(i64::MAX.to_string()));
		let back: Ledger = from_document(&doc).unwrap();
		assert_eq!(back.count, i64::MAX);
	}

	#[test]
	fn non_finite_float_fails_serialization() {
		let w = Widget::new("bad", "x", f64::NAN);
		match to_document(&w) {
			Err(StoreError::Serialization { field, .. }) => assert_eq!(field, "weight"),
			other => panic!("expected serialization error, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn extra_fields_are_ignored() {
		let doc = json!({"name": "x", "color": "y", "weight": 1.0, "extra": "ignored"});
		let w: Widget = from_document(&doc).unwrap();
		assert_eq!(w.name, "x");
	}

	#[test]
	fn missing_non_nullable_field_fails() {
		let doc = json!({"name": "x", "weight": 1.0});
		match from_document::<Widget>(&doc) {
			Err(StoreError::Validation { field, .. }) => assert_eq!(field, "color"),
			other => panic!("expected validation error, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn eval_context_maps_fields_to_values() {
		let w = Widget::new("gear", "blue", 1.5);
		let ctx = eval_context(&w);
		assert_eq!(ctx.get("color"), Some(&Value::Str("blue".into())));
		assert_eq!(ctx.get("weight"), Some(&Value::Float(1.5)));
	}
}
