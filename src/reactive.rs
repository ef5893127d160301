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

//! Reactive computation graph over tracked entities.
//!
//! Each data field of a tracked entity becomes a writable signal cell;
//! named computeds evaluate expressions over those signals; effects
//! observe computeds. Propagation is cooperative and single-threaded:
//! a write marks dependents dirty, then drains in dependency order
//! before returning. `batch_update` coalesces marks and drains once.
//! Cross-entity aggregates are group computeds over a dynamic member
//! set, or free-form multi computeds with read-tracked dependencies.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::entity::Entity;
use crate::error::BoxedError;
use crate::expr::{Context, Expr, Value};
use crate::types::FieldValue;

/// Process-unique handle for a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle(u64);

/// Handle for a registered effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectId(u64);

type CellId = usize;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
	#[error("node is not tracked")]
	UnknownNode,
	#[error("no field '{0}' on node")]
	UnknownField(String),
	#[error("no computed '{0}' on node")]
	UnknownComputed(String),
	#[error("computed '{0}' already exists on node")]
	DuplicateComputed(String),
	#[error("no group '{0}'")]
	UnknownGroup(String),
	#[error("group '{0}' already exists")]
	DuplicateGroup(String),
	#[error("group '{0}' has fixed membership")]
	StaticMembership(String),
	#[error("'{0}' would depend on itself")]
	DependencyCycle(String),
}

/// Effect callback. Failures are isolated: logged, never propagated.
pub type EffectCallback = Box<dyn FnMut(&str, &Value) -> Result<(), BoxedError> + Send>;

/// Reducer over the member values of a group computed.
pub type Reducer = Box<dyn Fn(&[Value]) -> Value + Send>;

/// Free-form computed body; reads through the [`GraphReader`] are its
/// dependencies.
pub type MultiFn = Box<dyn Fn(&GraphReader<'_>) -> Value + Send>;

// Object-safe view of a tracked entity, so one graph can hold many types.
trait TrackedEntity: Send {
	fn set_value(&mut self, field: &str, value: &Value);
	fn as_any(&self) -> &dyn Any;
}

struct TrackedBox<E: Entity>(E);

impl<E: Entity> TrackedEntity for TrackedBox<E> {
	fn set_value(&mut self, field: &str, value: &Value) {
		let def = match E::fields().iter().find(|d| d.name == field) {
			Some(def) => def,
			None => return,
		};
		match FieldValue::from_value(def.kind, value) {
			Some(v) => {
				self.0.set(field, v);
			}
			None => log::warn!("cannot mirror {:?} into {} field '{}'", value, def.kind.name(), field),
		}
	}

	fn as_any(&self) -> &dyn Any {
		&self.0
	}
}

enum CellKind {
	Signal,
	ExprComputed { node: NodeHandle, expr: Expr },
	// Revision counter bumped on membership changes.
	Members,
	GroupComputed { name: String, computed_name: String, reduce: Reducer },
	MultiComputed { f: MultiFn },
}

struct Cell {
	value: Value,
	kind: CellKind,
	label: String,
	deps: Vec<CellId>,
	dependents: BTreeSet<CellId>,
}

struct NodeState {
	entity: Box<dyn TrackedEntity>,
	signals: BTreeMap<String, CellId>,
	computeds: BTreeMap<String, CellId>,
	effects: BTreeMap<String, EffectId>,
}

struct GroupState {
	cell: CellId,
	members_cell: Option<CellId>,
	members: Vec<NodeHandle>,
	effects: Vec<EffectId>,
}

struct EffectState {
	cell: CellId,
	callback: EffectCallback,
}

/// The reactive graph. Owned by one thread; callers needing to share it
/// must provide external mutual exclusion.
#[derive(Default)]
pub struct ReactiveGraph {
	cells: Vec<Cell>,
	nodes: HashMap<NodeHandle, NodeState>,
	groups: BTreeMap<String, GroupState>,
	effects: HashMap<EffectId, EffectState>,
	next_node: u64,
	next_effect: u64,
	batching: bool,
	dirty: BTreeSet<CellId>,
}

impl ReactiveGraph {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register an entity. Each data field becomes a writable signal
	/// seeded with the field's current value; metadata is excluded.
	pub fn track<E: Entity>(&mut self, entity: E) -> NodeHandle {
		let handle = NodeHandle(self.next_node);
		self.next_node += 1;

		let mut signals = BTreeMap::new();
		for def in E::fields() {
			let initial = entity.get(def.name).map(|v| v.to_value()).unwrap_or(Value::Null);
			let id = self.alloc_cell(initial, CellKind::Signal, def.name.to_string());
			signals.insert(def.name.to_string(), id);
		}

		self.nodes.insert(
			handle,
			NodeState {
				entity: Box::new(TrackedBox(entity)),
				signals,
				computeds: BTreeMap::new(),
				effects: BTreeMap::new(),
			},
		);
		handle
	}

	/// Borrow the tracked entity back, typed. The entity reflects every
	/// `update`/`batch_update` applied through the graph.
	pub fn entity<E: Entity>(&self, handle: NodeHandle) -> Option<&E> {
		self.nodes.get(&handle).and_then(|n| n.entity.as_any().downcast_ref::<E>())
	}

	/// Install a named computed: `expr` evaluated over the node's field
	/// signals. Dependencies are the fields the expression reads.
	pub fn computed(&mut self, handle: NodeHandle, name: &str, expr: Expr) -> Result<(), GraphError> {
		let node = self.nodes.get(&handle).ok_or(GraphError::UnknownNode)?;
		if node.computeds.contains_key(name) {
			return Err(GraphError::DuplicateComputed(name.to_string()));
		}
		let id = self.alloc_cell(Value::Null, CellKind::ExprComputed { node: handle, expr }, name.to_string());
		self.nodes.get_mut(&handle).expect("checked above").computeds.insert(name.to_string(), id);
		let (value, deps) = self.compute_cell(id);
		self.rewire(id, deps);
		self.cells[id].value = value;
		Ok(())
	}

	/// Attach an effect to a computed. Fires once immediately, then on
	/// every change of the computed's value.
	pub fn effect(
		&mut self,
		handle: NodeHandle,
		computed_name: &str,
		callback: EffectCallback,
	) -> Result<EffectId, GraphError> {
		let node = self.nodes.get(&handle).ok_or(GraphError::UnknownNode)?;
		let cell = *node
			.computeds
			.get(computed_name)
			.ok_or_else(|| GraphError::UnknownComputed(computed_name.to_string()))?;

		let id = EffectId(self.next_effect);
		self.next_effect += 1;
		self.effects.insert(id, EffectState { cell, callback });
		if let Some(old) = self.nodes.get_mut(&handle).expect("checked above").effects.insert(computed_name.to_string(), id)
		{
			self.effects.remove(&old);
		}
		self.fire_effect(id);
		Ok(id)
	}

	/// Set a single field signal; propagate to dependents; mirror the
	/// value into the underlying entity.
	pub fn update(&mut self, handle: NodeHandle, field: &str, value: Value) -> Result<(), GraphError> {
		self.set_signal(handle, field, value)?;
		if !self.batching {
			self.drain();
		}
		Ok(())
	}

	/// Atomically set several fields. Effects fire at most once per
	/// affected computed, observing post-batch values.
	pub fn batch_update(&mut self, handle: NodeHandle, updates: Vec<(String, Value)>) -> Result<(), GraphError> {
		{
			let node = self.nodes.get(&handle).ok_or(GraphError::UnknownNode)?;
			for (field, _) in &updates {
				if !node.signals.contains_key(field.as_str()) {
					return Err(GraphError::UnknownField(field.clone()));
				}
			}
		}
		self.batching = true;
		for (field, value) in updates {
			// Fields were checked above; failures here are impossible.
			let _ = self.set_signal(handle, &field, value);
		}
		self.batching = false;
		self.drain();
		Ok(())
	}

	/// Read the current value of a computed.
	pub fn get(&self, handle: NodeHandle, computed_name: &str) -> Result<Value, GraphError> {
		let node = self.nodes.get(&handle).ok_or(GraphError::UnknownNode)?;
		let cell = node
			.computeds
			.get(computed_name)
			.ok_or_else(|| GraphError::UnknownComputed(computed_name.to_string()))?;
		Ok(self.cells[*cell].value.clone())
	}

	/// Read the current value of a field signal.
	pub fn get_field(&self, handle: NodeHandle, field: &str) -> Result<Value, GraphError> {
		let node = self.nodes.get(&handle).ok_or(GraphError::UnknownNode)?;
		let cell = node.signals.get(field).ok_or_else(|| GraphError::UnknownField(field.to_string()))?;
		Ok(self.cells[*cell].value.clone())
	}

	/// Remove the effect attached to a computed, if any.
	pub fn remove_effect(&mut self, handle: NodeHandle, computed_name: &str) -> Result<(), GraphError> {
		let node = self.nodes.get_mut(&handle).ok_or(GraphError::UnknownNode)?;
		if let Some(id) = node.effects.remove(computed_name) {
			self.effects.remove(&id);
		}
		Ok(())
	}

	/// Remove a node and every signal, computed and effect hanging off
	/// it.
	pub fn untrack(&mut self, handle: NodeHandle) {
		let node = match self.nodes.remove(&handle) {
			Some(node) => node,
			None => return,
		};
		for id in node.effects.values() {
			self.effects.remove(id);
		}
		for cell in node.signals.values().chain(node.computeds.values()) {
			self.kill_cell(*cell);
		}
	}

	// ── Cross-entity aggregation ─────────────────────────────────

	/// A derived cell reducing a named computed across a dynamic set of
	/// nodes. Membership changes via [`add_to_group`](Self::add_to_group)
	/// and [`remove_from_group`](Self::remove_from_group) trigger
	/// recomputation.
	pub fn group_computed(
		&mut self,
		name: &str,
		members: &[NodeHandle],
		computed_name: &str,
		reduce: Reducer,
	) -> Result<(), GraphError> {
		if self.groups.contains_key(name) {
			return Err(GraphError::DuplicateGroup(name.to_string()));
		}
		let members_cell = self.alloc_cell(Value::Int(0), CellKind::Members, format!("{}#members", name));
		let cell = self.alloc_cell(
			Value::Null,
			CellKind::GroupComputed {
				name: name.to_string(),
				computed_name: computed_name.to_string(),
				reduce,
			},
			name.to_string(),
		);
		self.groups.insert(
			name.to_string(),
			GroupState { cell, members_cell: Some(members_cell), members: members.to_vec(), effects: Vec::new() },
		);
		let (value, deps) = self.compute_cell(cell);
		self.rewire(cell, deps);
		self.cells[cell].value = value;
		Ok(())
	}

	/// A derived cell defined by an arbitrary function of the graph.
	/// Dependencies are whatever cells the function reads. Membership
	/// cannot be mutated.
	pub fn multi_computed(&mut self, name: &str, f: MultiFn) -> Result<(), GraphError> {
		if self.groups.contains_key(name) {
			return Err(GraphError::DuplicateGroup(name.to_string()));
		}
		let cell = self.alloc_cell(Value::Null, CellKind::MultiComputed { f }, name.to_string());
		self.groups
			.insert(name.to_string(), GroupState { cell, members_cell: None, members: Vec::new(), effects: Vec::new() });
		let (value, deps) = self.compute_cell(cell);
		self.rewire(cell, deps);
		self.cells[cell].value = value;
		if self.reaches(cell, cell) {
			self.remove_group(name);
			return Err(GraphError::DependencyCycle(name.to_string()));
		}
		Ok(())
	}

	/// Read the current value of a group or multi computed.
	pub fn get_group(&self, name: &str) -> Result<Value, GraphError> {
		let group = self.groups.get(name).ok_or_else(|| GraphError::UnknownGroup(name.to_string()))?;
		Ok(self.cells[group.cell].value.clone())
	}

	/// Attach an effect to a group computed. Fires once immediately.
	pub fn group_effect(&mut self, name: &str, callback: EffectCallback) -> Result<EffectId, GraphError> {
		let cell = self.groups.get(name).ok_or_else(|| GraphError::UnknownGroup(name.to_string()))?.cell;
		let id = EffectId(self.next_effect);
		self.next_effect += 1;
		self.effects.insert(id, EffectState { cell, callback });
		self.groups.get_mut(name).expect("checked above").effects.push(id);
		self.fire_effect(id);
		Ok(id)
	}

	pub fn add_to_group(&mut self, name: &str, handle: NodeHandle) -> Result<(), GraphError> {
		self.mutate_members(name, |members| {
			if !members.contains(&handle) {
				members.push(handle);
				true
			} else {
				false
			}
		})
	}

	pub fn remove_from_group(&mut self, name: &str, handle: NodeHandle) -> Result<(), GraphError> {
		self.mutate_members(name, |members| {
			let before = members.len();
			members.retain(|h| *h != handle);
			members.len() != before
		})
	}

	/// Tear down a group computed and its effects.
	pub fn remove_group(&mut self, name: &str) {
		let group = match self.groups.remove(name) {
			Some(group) => group,
			None => return,
		};
		for id in &group.effects {
			self.effects.remove(id);
		}
		self.kill_cell(group.cell);
		if let Some(members_cell) = group.members_cell {
			self.kill_cell(members_cell);
		}
	}

	// ── Internals ────────────────────────────────────────────────

	fn alloc_cell(&mut self, value: Value, kind: CellKind, label: String) -> CellId {
		let id = self.cells.len();
		self.cells.push(Cell { value, kind, label, deps: Vec::new(), dependents: BTreeSet::new() });
		id
	}

	fn set_signal(&mut self, handle: NodeHandle, field: &str, value: Value) -> Result<(), GraphError> {
		let cell_id = {
			let node = self.nodes.get(&handle).ok_or(GraphError::UnknownNode)?;
			*node.signals.get(field).ok_or_else(|| GraphError::UnknownField(field.to_string()))?
		};
		if self.cells[cell_id].value == value {
			return Ok(());
		}
		self.cells[cell_id].value = value.clone();
		if let Some(node) = self.nodes.get_mut(&handle) {
			node.entity.set_value(field, &value);
		}
		let dependents: Vec<CellId> = self.cells[cell_id].dependents.iter().copied().collect();
		self.dirty.extend(dependents);
		Ok(())
	}

	fn mutate_members(
		&mut self,
		name: &str,
		f: impl FnOnce(&mut Vec<NodeHandle>) -> bool,
	) -> Result<(), GraphError> {
		let (cell, members_cell) = {
			let group = self.groups.get_mut(name).ok_or_else(|| GraphError::UnknownGroup(name.to_string()))?;
			let members_cell = group.members_cell.ok_or_else(|| GraphError::StaticMembership(name.to_string()))?;
			if !f(&mut group.members) {
				return Ok(());
			}
			(group.cell, members_cell)
		};
		// Bump the membership revision and recompute the group.
		if let Value::Int(rev) = self.cells[members_cell].value {
			self.cells[members_cell].value = Value::Int(rev + 1);
		}
		self.dirty.insert(cell);
		if !self.batching {
			self.drain();
		}
		Ok(())
	}

	/// Compute a cell's next value and dependency list, without mutating
	/// the graph.
	fn compute_cell(&self, id: CellId) -> (Value, Vec<CellId>) {
		match &self.cells[id].kind {
			CellKind::Signal | CellKind::Members => (self.cells[id].value.clone(), self.cells[id].deps.clone()),
			CellKind::ExprComputed { node, expr } => {
				let node = match self.nodes.get(node) {
					Some(n) => n,
					None => return (Value::Null, Vec::new()),
				};
				let ctx = SignalContext { cells: &self.cells, signals: &node.signals };
				let deps: Vec<CellId> =
					expr.fields().iter().filter_map(|f| node.signals.get(*f).copied()).collect();
				let value = match expr.eval(&ctx) {
					Ok(v) => v,
					Err(e) => {
						// A failing computed propagates null to its dependents.
						log::debug!("computed '{}' failed: {}", self.cells[id].label, e);
						Value::Null
					}
				};
				(value, deps)
			}
			CellKind::GroupComputed { name, computed_name, reduce } => {
				let group = match self.groups.get(name) {
					Some(g) => g,
					None => return (Value::Null, Vec::new()),
				};
				let mut deps = Vec::new();
				if let Some(members_cell) = group.members_cell {
					deps.push(members_cell);
				}
				let mut values = Vec::with_capacity(group.members.len());
				for handle in &group.members {
					if let Some(node) = self.nodes.get(handle) {
						if let Some(cell) = node.computeds.get(computed_name.as_str()) {
							deps.push(*cell);
							values.push(self.cells[*cell].value.clone());
						}
					}
				}
				(reduce(&values), deps)
			}
			CellKind::MultiComputed { f } => {
				let reader = GraphReader { graph: self, reads: RefCell::new(Vec::new()) };
				let value = f(&reader);
				(value, reader.reads.into_inner())
			}
		}
	}

	fn rewire(&mut self, id: CellId, deps: Vec<CellId>) {
		let old = std::mem::take(&mut self.cells[id].deps);
		for dep in old {
			self.cells[dep].dependents.remove(&id);
		}
		for dep in &deps {
			self.cells[*dep].dependents.insert(id);
		}
		self.cells[id].deps = deps;
	}

	fn kill_cell(&mut self, id: CellId) {
		self.rewire(id, Vec::new());
		let dependents = std::mem::take(&mut self.cells[id].dependents);
		for dependent in dependents {
			self.cells[dependent].deps.retain(|d| *d != id);
		}
		self.dirty.remove(&id);
		self.cells[id].value = Value::Null;
	}

	// Drain dirty cells in dependency order, then fire effects once per
	// changed cell with the settled values.
	fn drain(&mut self) {
		let mut changed: BTreeSet<CellId> = BTreeSet::new();
		loop {
			let ready = self
				.dirty
				.iter()
				.copied()
				.find(|id| !self.cells[*id].deps.iter().any(|d| self.dirty.contains(d)));
			let id = match ready {
				Some(id) => id,
				None if self.dirty.is_empty() => break,
				None => {
					log::error!("dependency cycle among reactive cells; dropping {} marks", self.dirty.len());
					self.dirty.clear();
					break;
				}
			};
			self.dirty.remove(&id);
			let (value, deps) = self.compute_cell(id);
			self.rewire(id, deps);
			if self.cells[id].value != value {
				self.cells[id].value = value;
				changed.insert(id);
				let dependents: Vec<CellId> = self.cells[id].dependents.iter().copied().collect();
				self.dirty.extend(dependents);
			}
		}

		let firing: Vec<EffectId> =
			self.effects.iter().filter(|(_, e)| changed.contains(&e.cell)).map(|(id, _)| *id).collect();
		for id in firing {
			self.fire_effect(id);
		}
	}

	fn fire_effect(&mut self, id: EffectId) {
		let (label, value) = match self.effects.get(&id) {
			Some(e) => (self.cells[e.cell].label.clone(), self.cells[e.cell].value.clone()),
			None => return,
		};
		if let Some(effect) = self.effects.get_mut(&id) {
			if let Err(e) = (effect.callback)(&label, &value) {
				log::warn!("effect on '{}' failed: {}", label, e);
			}
		}
	}

	fn reaches(&self, from: CellId, target: CellId) -> bool {
		let mut stack: Vec<CellId> = self.cells[from].deps.clone();
		let mut seen = BTreeSet::new();
		while let Some(id) = stack.pop() {
			if id == target {
				return true;
			}
			if seen.insert(id) {
				stack.extend(self.cells[id].deps.iter().copied());
			}
		}
		false
	}
}

struct SignalContext<'a> {
	cells: &'a [Cell],
	signals: &'a BTreeMap<String, CellId>,
}

impl Context for SignalContext<'_> {
	fn get(&self, field: &str) -> Option<Value> {
		self.signals.get(field).map(|id| self.cells[*id].value.clone())
	}
}

/// Read-tracked view of the graph handed to multi computeds. Every read
/// becomes a dependency of the computed being evaluated.
pub struct GraphReader<'a> {
	graph: &'a ReactiveGraph,
	reads: RefCell<Vec<CellId>>,
}

impl GraphReader<'_> {
	pub fn get(&self, handle: NodeHandle, computed_name: &str) -> Value {
		match self.graph.nodes.get(&handle).and_then(|n| n.computeds.get(computed_name)) {
			Some(cell) => {
				self.reads.borrow_mut().push(*cell);
				self.graph.cells[*cell].value.clone()
			}
			None => Value::Null,
		}
	}

	pub fn get_field(&self, handle: NodeHandle, field: &str) -> Value {
		match self.graph.nodes.get(&handle).and_then(|n| n.signals.get(field)) {
			Some(cell) => {
				self.reads.borrow_mut().push(*cell);
				self.graph.cells[*cell].value.clone()
			}
			None => Value::Null,
		}
	}

	pub fn get_group(&self, name: &str) -> Value {
		match self.graph.groups.get(name) {
			Some(group) => {
				self.reads.borrow_mut().push(group.cell);
				self.graph.cells[group.cell].value.clone()
			}
			None => Value::Null,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use super::*;
	use crate::entity::tests::Widget;
	use crate::expr::Expr;

	fn recorder() -> (Arc<Mutex<Vec<(String, Value)>>>, EffectCallback) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		let cb: EffectCallback = Box::new(move |name, value| {
			sink.lock().unwrap().push((name.to_string(), value.clone()));
			Ok(())
		});
		(seen, cb)
	}

	fn sum_reducer() -> Reducer {
		Box::new(|values| {
			let mut total = 0.0;
			for v in values {
				if let Some(x) = v.as_f64() {
					total += x;
				}
			}
			Value::Float(total)
		})
	}

	#[test]
	fn computed_tracks_field_updates() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "double_weight", Expr::field("weight") * 2.0).unwrap();
		assert_eq!(graph.get(n, "double_weight").unwrap(), Value::Float(4.0));

		graph.update(n, "weight", Value::Float(3.5)).unwrap();
		assert_eq!(graph.get(n, "double_weight").unwrap(), Value::Float(7.0));
		assert_eq!(graph.get_field(n, "weight").unwrap(), Value::Float(3.5));
	}

	#[test]
	fn updates_mirror_into_the_entity() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.update(n, "color", Value::Str("red".into())).unwrap();
		let w: &Widget = graph.entity(n).unwrap();
		assert_eq!(w.color, "red");
	}

	#[test]
	fn effect_fires_on_registration_and_change() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "mv", Expr::field("weight") * 10.0).unwrap();
		let (seen, cb) = recorder();
		graph.effect(n, "mv", cb).unwrap();
		graph.update(n, "weight", Value::Float(3.0)).unwrap();

		let seen = seen.lock().unwrap();
		assert_eq!(
			*seen,
			vec![("mv".to_string(), Value::Float(20.0)), ("mv".to_string(), Value::Float(30.0))]
		);
	}

	#[test]
	fn effect_does_not_fire_when_value_is_unchanged() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "mv", Expr::field("weight") * 10.0).unwrap();
		let (seen, cb) = recorder();
		graph.effect(n, "mv", cb).unwrap();
		// The computed does not read color; no effect should fire.
		graph.update(n, "color", Value::Str("red".into())).unwrap();
		assert_eq!(seen.lock().unwrap().len(), 1);
	}

	#[test]
	fn batch_update_fires_effects_once_with_final_values() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "summary", Expr::field("color").concat(Expr::field("weight"))).unwrap();
		let (seen, cb) = recorder();
		graph.effect(n, "summary", cb).unwrap();

		graph
			.batch_update(
				n,
				vec![("color".to_string(), Value::Str("red".into())), ("weight".to_string(), Value::Float(9.0))],
			)
			.unwrap();

		let seen = seen.lock().unwrap();
		// Once at registration, once for the whole batch.
		assert_eq!(seen.len(), 2);
		assert_eq!(seen[1].1, Value::Str("red9".into()));
	}

	#[test]
	fn failing_effect_is_isolated() {
		crate::initialize();
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "a", Expr::field("weight") + 1.0).unwrap();
		graph.computed(n, "b", Expr::field("weight") + 2.0).unwrap();
		graph.effect(n, "a", Box::new(|_, _| Err("boom".into()))).unwrap();
		let (seen, cb) = recorder();
		graph.effect(n, "b", cb).unwrap();

		graph.update(n, "weight", Value::Float(5.0)).unwrap();
		// The failing effect on "a" must not block the effect on "b".
		assert_eq!(seen.lock().unwrap().last().unwrap().1, Value::Float(7.0));
	}

	#[test]
	fn failing_computed_propagates_null() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "bad", Expr::lit(1i64) / Expr::field("weight")).unwrap();
		graph.update(n, "weight", Value::Float(0.0)).unwrap();
		assert_eq!(graph.get(n, "bad").unwrap(), Value::Null);
	}

	#[test]
	fn group_computed_aggregates_and_tracks_membership() {
		let mut graph = ReactiveGraph::new();
		let a = graph.track(Widget::new("a", "x", 1.0));
		let b = graph.track(Widget::new("b", "x", 2.0));
		let c = graph.track(Widget::new("c", "x", 4.0));
		for n in [a, b, c] {
			graph.computed(n, "w2", Expr::field("weight") * 2.0).unwrap();
		}

		graph.group_computed("total", &[a, b], "w2", sum_reducer()).unwrap();
		assert_eq!(graph.get_group("total").unwrap(), Value::Float(6.0));

		let (seen, cb) = recorder();
		graph.group_effect("total", cb).unwrap();

		// Member value change propagates into the group.
		graph.update(a, "weight", Value::Float(10.0)).unwrap();
		assert_eq!(graph.get_group("total").unwrap(), Value::Float(24.0));

		// Membership change recomputes.
		graph.add_to_group("total", c).unwrap();
		assert_eq!(graph.get_group("total").unwrap(), Value::Float(32.0));
		graph.remove_from_group("total", a).unwrap();
		assert_eq!(graph.get_group("total").unwrap(), Value::Float(12.0));

		let seen = seen.lock().unwrap();
		assert_eq!(seen.first().unwrap().1, Value::Float(6.0));
		assert_eq!(seen.last().unwrap().1, Value::Float(12.0));
	}

	#[test]
	fn multi_computed_tracks_what_it_reads() {
		let mut graph = ReactiveGraph::new();
		let a = graph.track(Widget::new("a", "x", 3.0));
		let b = graph.track(Widget::new("b", "x", 1.0));
		graph.computed(a, "mv", Expr::field("weight") * 100.0).unwrap();
		graph.computed(b, "mv", Expr::field("weight") * 100.0).unwrap();

		graph
			.multi_computed(
				"spread",
				Box::new(move |g: &GraphReader| {
					match (g.get(a, "mv").as_f64(), g.get(b, "mv").as_f64()) {
						(Some(x), Some(y)) => Value::Float(x - y),
						_ => Value::Null,
					}
				}),
			)
			.unwrap();
		assert_eq!(graph.get_group("spread").unwrap(), Value::Float(200.0));

		graph.update(b, "weight", Value::Float(2.0)).unwrap();
		assert_eq!(graph.get_group("spread").unwrap(), Value::Float(100.0));
	}

	#[test]
	fn membership_mutation_is_invalid_on_multi_computed() {
		let mut graph = ReactiveGraph::new();
		let a = graph.track(Widget::new("a", "x", 3.0));
		graph.multi_computed("m", Box::new(|_: &GraphReader| Value::Int(1))).unwrap();
		assert_eq!(graph.add_to_group("m", a), Err(GraphError::StaticMembership("m".to_string())));
	}

	#[test]
	fn untrack_cleans_up() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "mv", Expr::field("weight") * 10.0).unwrap();
		graph.effect(n, "mv", Box::new(|_, _| Ok(()))).unwrap();
		graph.untrack(n);
		assert_eq!(graph.get(n, "mv"), Err(GraphError::UnknownNode));
		assert_eq!(graph.update(n, "weight", Value::Float(1.0)), Err(GraphError::UnknownNode));
		assert!(graph.effects.is_empty());
	}

	#[test]
	fn duplicate_names_are_rejected() {
		let mut graph = ReactiveGraph::new();
		let n = graph.track(Widget::new("gear", "blue", 2.0));
		graph.computed(n, "mv", Expr::field("weight")).unwrap();
		assert_eq!(
			graph.computed(n, "mv", Expr::field("weight")),
			Err(GraphError::DuplicateComputed("mv".to_string()))
		);
		graph.group_computed("g", &[n], "mv", sum_reducer()).unwrap();
		assert_eq!(
			graph.multi_computed("g", Box::new(|_: &GraphReader| Value::Null)),
			Err(GraphError::DuplicateGroup("g".to_string()))
		);
	}
}
