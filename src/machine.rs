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

//! Declarative state machines for entity lifecycles.
//!
//! A machine is an initial state plus a list of transitions; each
//! transition carries three tiers of side-effects:
//!
//! - tier 1, `action`: runs inside the durable commit. A failure aborts
//!   the state change and no event is persisted.
//! - tier 2, `on_exit`/`on_enter`: fire after the commit; failures are
//!   logged and swallowed.
//! - tier 3, `start_workflow`: dispatched to the [`WorkflowEngine`]
//!   after the commit; dispatch failures are swallowed, durability is
//!   the engine's concern.
//!
//! Machines are registered per entity type in a [`MachineRegistry`]
//! handed to the store client at construction.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::{BoxedError, Result, StoreError};
use crate::expr::{Context, Expr};
use crate::workflow::{WorkflowEngine, WorkflowError, WorkflowHandle};

/// Tier-1 hook: may mutate the entity; the mutated snapshot is what gets
/// persisted with the state-change event.
pub type ActionFn<E> = Arc<dyn Fn(&mut E, &str, &str) -> Result<(), BoxedError> + Send + Sync>;

/// Tier-2 hook.
pub type HookFn<E> = Arc<dyn Fn(&E, &str, &str) -> Result<(), BoxedError> + Send + Sync>;

/// Tier-3 hook: dispatches a durable workflow for the entity.
pub type DispatchFn<E> =
	Arc<dyn Fn(&Arc<dyn WorkflowEngine>, &E) -> Result<WorkflowHandle, WorkflowError> + Send + Sync>;

/// A single state-machine edge.
pub struct Transition<E> {
	pub from_state: String,
	pub to_state: String,
	pub guard: Option<Expr>,
	pub action: Option<ActionFn<E>>,
	pub on_exit: Option<HookFn<E>>,
	pub on_enter: Option<HookFn<E>>,
	pub start_workflow: Option<DispatchFn<E>>,
	pub allowed_by: Option<Vec<String>>,
}

impl<E> Transition<E> {
	pub fn new(from_state: impl Into<String>, to_state: impl Into<String>) -> Self {
		Self {
			from_state: from_state.into(),
			to_state: to_state.into(),
			guard: None,
			action: None,
			on_exit: None,
			on_enter: None,
			start_workflow: None,
			allowed_by: None,
		}
	}

	/// Expression that must evaluate truthy against the entity's current
	/// field values.
	pub fn guard(mut self, guard: Expr) -> Self {
		self.guard = Some(guard);
		self
	}

	pub fn action(mut self, f: impl Fn(&mut E, &str, &str) -> Result<(), BoxedError> + Send + Sync + 'static) -> Self {
		self.action = Some(Arc::new(f));
		self
	}

	pub fn on_exit(mut self, f: impl Fn(&E, &str, &str) -> Result<(), BoxedError> + Send + Sync + 'static) -> Self {
		self.on_exit = Some(Arc::new(f));
		self
	}

	pub fn on_enter(mut self, f: impl Fn(&E, &str, &str) -> Result<(), BoxedError> + Send + Sync + 'static) -> Self {
		self.on_enter = Some(Arc::new(f));
		self
	}

	pub fn start_workflow(
		mut self,
		f: impl Fn(&Arc<dyn WorkflowEngine>, &E) -> Result<WorkflowHandle, WorkflowError> + Send + Sync + 'static,
	) -> Self {
		self.start_workflow = Some(Arc::new(f));
		self
	}

	/// Principals allowed to trigger this edge. Edges without a list are
	/// open to any principal with write capability.
	pub fn allowed_by(mut self, principals: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.allowed_by = Some(principals.into_iter().map(Into::into).collect());
		self
	}
}

impl<E> Clone for Transition<E> {
	fn clone(&self) -> Self {
		Self {
			from_state: self.from_state.clone(),
			to_state: self.to_state.clone(),
			guard: self.guard.clone(),
			action: self.action.clone(),
			on_exit: self.on_exit.clone(),
			on_enter: self.on_enter.clone(),
			start_workflow: self.start_workflow.clone(),
			allowed_by: self.allowed_by.clone(),
		}
	}
}

/// A declarative state machine for one entity type.
pub struct StateMachine<E> {
	pub initial: String,
	transitions: Vec<Transition<E>>,
}

impl<E> StateMachine<E> {
	pub fn new(initial: impl Into<String>) -> Self {
		Self { initial: initial.into(), transitions: Vec::new() }
	}

	pub fn transition(mut self, t: Transition<E>) -> Self {
		self.transitions.push(t);
		self
	}

	/// The edge for `(from, to)`, if one exists.
	pub fn get(&self, from_state: &str, to_state: &str) -> Option<&Transition<E>> {
		self.transitions.iter().find(|t| t.from_state == from_state && t.to_state == to_state)
	}

	/// Valid successor states of `from_state`, without running guards.
	pub fn allowed_transitions(&self, from_state: &str) -> Vec<String> {
		self.transitions.iter().filter(|t| t.from_state == from_state).map(|t| t.to_state.clone()).collect()
	}

	/// Validate an edge before any side-effect runs: the edge must
	/// exist, the guard must pass, and the principal must be permitted —
	/// in that order.
	pub fn validate(
		&self,
		from_state: &str,
		to_state: &str,
		ctx: &dyn Context,
		principal: &str,
	) -> Result<&Transition<E>> {
		let t = self.get(from_state, to_state).ok_or_else(|| StoreError::InvalidTransition {
			from: from_state.to_string(),
			to: to_state.to_string(),
			allowed: self.allowed_transitions(from_state),
		})?;

		if let Some(guard) = &t.guard {
			// An evaluation failure counts as falsy, like a null guard.
			let passed = guard.eval(ctx).map(|v| v.truthy()).unwrap_or(false);
			if !passed {
				return Err(StoreError::GuardFailure {
					from: from_state.to_string(),
					to: to_state.to_string(),
					guard: guard.to_string(),
				});
			}
		}

		if let Some(allowed_by) = &t.allowed_by {
			if !allowed_by.iter().any(|p| p == principal) {
				return Err(StoreError::TransitionNotPermitted {
					from: from_state.to_string(),
					to: to_state.to_string(),
					principal: principal.to_string(),
					allowed_by: allowed_by.clone(),
				});
			}
		}

		Ok(t)
	}
}

/// Per-entity-type machine registry, passed into the store client at
/// construction instead of living as mutable global state.
#[derive(Default)]
pub struct MachineRegistry {
	machines: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MachineRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<E: Entity>(&mut self, machine: StateMachine<E>) {
		self.machines.insert(TypeId::of::<E>(), Box::new(Arc::new(machine)));
	}

	pub fn with<E: Entity>(mut self, machine: StateMachine<E>) -> Self {
		self.register(machine);
		self
	}

	pub fn get<E: Entity>(&self) -> Option<Arc<StateMachine<E>>> {
		self.machines.get(&TypeId::of::<E>()).and_then(|m| m.downcast_ref::<Arc<StateMachine<E>>>()).cloned()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::entity::tests::Widget;
	use crate::entity::eval_context;
	use crate::expr::Value;

	fn machine() -> StateMachine<Widget> {
		StateMachine::new("PENDING")
			.transition(Transition::new("PENDING", "PARTIAL"))
			.transition(Transition::new("PENDING", "FILLED").guard(Expr::field("weight").gt(0i64)))
			.transition(Transition::new("PENDING", "CANCELLED").allowed_by(["risk_manager"]))
			.transition(Transition::new("PARTIAL", "FILLED"))
	}

	fn ctx_of(weight: f64) -> BTreeMap<String, Value> {
		eval_context(&Widget::new("w", "blue", weight))
	}

	#[test]
	fn missing_edge_reports_allowed_successors() {
		let m = machine();
		match m.validate("PENDING", "SETTLED", &ctx_of(1.0), "alice") {
			Err(StoreError::InvalidTransition { allowed, .. }) => {
				assert_eq!(allowed, vec!["PARTIAL", "FILLED", "CANCELLED"]);
			}
			other => panic!("expected InvalidTransition, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn terminal_state_has_empty_allowed_set() {
		let m = machine();
		match m.validate("FILLED", "PENDING", &ctx_of(1.0), "alice") {
			Err(StoreError::InvalidTransition { allowed, .. }) => assert!(allowed.is_empty()),
			other => panic!("expected InvalidTransition, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn guard_gates_the_edge() {
		let m = machine();
		assert!(m.validate("PENDING", "FILLED", &ctx_of(1.0), "alice").is_ok());
		match m.validate("PENDING", "FILLED", &ctx_of(0.0), "alice") {
			Err(StoreError::GuardFailure { guard, .. }) => assert!(guard.contains("weight")),
			other => panic!("expected GuardFailure, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn guard_over_unknown_field_fails_as_falsy() {
		let m = StateMachine::<Widget>::new("A")
			.transition(Transition::new("A", "B").guard(Expr::field("no_such_field").gt(0i64)));
		let ctx = ctx_of(1.0);
		assert!(matches!(m.validate("A", "B", &ctx, "alice"), Err(StoreError::GuardFailure { .. })));
	}

	#[test]
	fn rbac_is_checked_after_the_guard() {
		let m = machine();
		match m.validate("PENDING", "CANCELLED", &ctx_of(1.0), "alice") {
			Err(StoreError::TransitionNotPermitted { allowed_by, .. }) => {
				assert_eq!(allowed_by, vec!["risk_manager"]);
			}
			other => panic!("expected TransitionNotPermitted, got {:?}", other.map(|_| ())),
		}
		assert!(m.validate("PENDING", "CANCELLED", &ctx_of(1.0), "risk_manager").is_ok());
	}

	#[test]
	fn allowed_transitions_do_not_run_guards() {
		let m = machine();
		// weight 0 would fail the FILLED guard, but enumeration ignores it.
		assert_eq!(m.allowed_transitions("PENDING"), vec!["PARTIAL", "FILLED", "CANCELLED"]);
	}

	#[test]
	fn registry_is_keyed_by_entity_type() {
		let registry = MachineRegistry::new().with(machine());
		let m = registry.get::<Widget>().expect("machine registered");
		assert_eq!(m.initial, "PENDING");
		assert!(registry.get::<crate::entity::tests::Ledger>().is_none());
	}
}
