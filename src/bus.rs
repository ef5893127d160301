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

//! In-process pub/sub for entity change events.
//!
//! Three subscription scopes: by type name, by entity id, and catch-all.
//! Emit snapshots the matching subscribers under the lock and dispatches
//! outside it; a failing subscriber is logged and does not block the
//! rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::BoxedError;
use crate::types::ChangeEvent;

pub type Subscriber = Arc<dyn Fn(&ChangeEvent) -> Result<(), BoxedError> + Send + Sync>;

/// Token returned by subscribe calls, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
	by_type: HashMap<String, Vec<(SubscriptionId, Subscriber)>>,
	by_entity: HashMap<Uuid, Vec<(SubscriptionId, Subscriber)>>,
	all: Vec<(SubscriptionId, Subscriber)>,
}

/// Thread-safe in-process event bus.
#[derive(Default)]
pub struct EventBus {
	inner: Mutex<Subscribers>,
	next_id: AtomicU64,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	fn next_id(&self) -> SubscriptionId {
		SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
	}

	/// Subscribe to all changes for a given type name.
	pub fn on_type(&self, type_name: impl Into<String>, subscriber: Subscriber) -> SubscriptionId {
		let id = self.next_id();
		self.inner.lock().by_type.entry(type_name.into()).or_default().push((id, subscriber));
		id
	}

	/// Subscribe to changes of one entity.
	pub fn on_entity(&self, entity_id: Uuid, subscriber: Subscriber) -> SubscriptionId {
		let id = self.next_id();
		self.inner.lock().by_entity.entry(entity_id).or_default().push((id, subscriber));
		id
	}

	/// Subscribe to every change regardless of type or entity.
	pub fn on_all(&self, subscriber: Subscriber) -> SubscriptionId {
		let id = self.next_id();
		self.inner.lock().all.push((id, subscriber));
		id
	}

	/// Remove a subscription. Returns whether it existed.
	pub fn off(&self, id: SubscriptionId) -> bool {
		let mut inner = self.inner.lock();
		let mut removed = false;
		let before = inner.all.len();
		inner.all.retain(|(sid, _)| *sid != id);
		removed |= inner.all.len() != before;
		for subs in inner.by_type.values_mut() {
			let before = subs.len();
			subs.retain(|(sid, _)| *sid != id);
			removed |= subs.len() != before;
		}
		for subs in inner.by_entity.values_mut() {
			let before = subs.len();
			subs.retain(|(sid, _)| *sid != id);
			removed |= subs.len() != before;
		}
		removed
	}

	/// Dispatch an event to every matching subscriber. Subscriber
	/// failures are isolated.
	pub fn emit(&self, event: &ChangeEvent) {
		let matching: Vec<Subscriber> = {
			let inner = self.inner.lock();
			let mut out: Vec<Subscriber> = inner.all.iter().map(|(_, s)| s.clone()).collect();
			if let Some(subs) = inner.by_type.get(&event.type_name) {
				out.extend(subs.iter().map(|(_, s)| s.clone()));
			}
			if let Some(subs) = inner.by_entity.get(&event.entity_id) {
				out.extend(subs.iter().map(|(_, s)| s.clone()));
			}
			out
		};
		for subscriber in matching {
			if let Err(e) = subscriber(event) {
				log::warn!("subscriber failed on {} v{}: {}", event.entity_id, event.version, e);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex as StdMutex;

	use chrono::Utc;

	use super::*;
	use crate::types::EventKind;

	fn event(type_name: &str, entity_id: Uuid, version: i64) -> ChangeEvent {
		ChangeEvent {
			entity_id,
			version,
			event_kind: EventKind::Updated,
			type_name: type_name.to_string(),
			updated_by: "alice".to_string(),
			state: None,
			tx_time: Utc::now(),
		}
	}

	fn counting() -> (Arc<StdMutex<Vec<i64>>>, Subscriber) {
		let seen = Arc::new(StdMutex::new(Vec::new()));
		let sink = seen.clone();
		let sub: Subscriber = Arc::new(move |e: &ChangeEvent| {
			sink.lock().unwrap().push(e.version);
			Ok(())
		});
		(seen, sub)
	}

	#[test]
	fn scopes_match_independently() {
		let bus = EventBus::new();
		let id_a = Uuid::new_v4();
		let id_b = Uuid::new_v4();

		let (by_type, s1) = counting();
		let (by_entity, s2) = counting();
		let (all, s3) = counting();
		bus.on_type("Widget", s1);
		bus.on_entity(id_a, s2);
		bus.on_all(s3);

		bus.emit(&event("Widget", id_a, 1));
		bus.emit(&event("Order", id_b, 2));
		bus.emit(&event("Order", id_a, 3));

		assert_eq!(*by_type.lock().unwrap(), vec![1]);
		assert_eq!(*by_entity.lock().unwrap(), vec![1, 3]);
		assert_eq!(*all.lock().unwrap(), vec![1, 2, 3]);
	}

	#[test]
	fn unsubscribe_stops_delivery() {
		let bus = EventBus::new();
		let (seen, sub) = counting();
		let id = bus.on_type("Widget", sub);
		bus.emit(&event("Widget", Uuid::new_v4(), 1));
		assert!(bus.off(id));
		bus.emit(&event("Widget", Uuid::new_v4(), 2));
		assert_eq!(*seen.lock().unwrap(), vec![1]);
		assert!(!bus.off(id));
	}

	#[test]
	fn failing_subscriber_does_not_block_others() {
		crate::initialize();
		let bus = EventBus::new();
		bus.on_all(Arc::new(|_: &ChangeEvent| Err("bad subscriber".into())));
		let (seen, sub) = counting();
		bus.on_all(sub);
		bus.emit(&event("Widget", Uuid::new_v4(), 7));
		assert_eq!(*seen.lock().unwrap(), vec![7]);
	}
}
