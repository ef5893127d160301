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

//! Bi-temporal, event-sourced object store on PostgreSQL.
//!
//! Every change to an entity appends one immutable event row; the latest
//! version is the current state, history is always retrievable, and
//! row-level security makes invisibility the failure mode for missing
//! permissions. On top of the storage engine sit a declarative state
//! machine with three tiers of side-effects, an algebraic expression
//! graph that compiles to native evaluation, JSONB predicates and Legend
//! Pure fragments, and a change-notification layer with durable catch-up.

#![forbid(unsafe_code)]

pub mod bus;
pub mod database;
pub mod entity;
mod error;
pub mod expr;
mod logger;
pub mod machine;
pub mod reactive;
pub mod store;
pub mod types;
pub mod workflow;

pub use self::bus::EventBus;
pub use self::database::{migrate, Database, DatabaseConfig, Listener};
pub use self::entity::Entity;
pub use self::error::{BoxedError, Result, StoreError};
pub use self::expr::{Expr, ExprError, Value};
pub use self::logger::init_logger;
pub use self::machine::{MachineRegistry, StateMachine, Transition};
pub use self::reactive::ReactiveGraph;
pub use self::store::{ClientConfig, QueryPage, StoreClient};
pub use self::types::{ChangeEvent, EventKind, FieldDef, FieldKind, FieldValue, StoreMeta};
pub use self::workflow::{WorkflowDispatcher, WorkflowEngine, WorkflowHandle, WorkflowStatus};

#[cfg(test)]
pub(crate) fn initialize() {
	use std::sync::Once;
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		let _ = pretty_env_logger::try_init();
	});
}
