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

//! A PostgreSQL listener for the event-table notification channel.
//!
//! One long-running task per subscriber: loads the subscriber's durable
//! high-water mark, replays every event the substrate committed while it
//! was down (ascending `tx_time`, checkpoint advanced per event), then
//! waits on LISTEN/NOTIFY and dispatches each payload to the in-process
//! event bus. A stop signal finishes the in-flight notification,
//! persists the checkpoint and terminates.

use std::sync::Arc;
use std::time::Duration;

use async_std::future::timeout;
use async_std::task::{self, JoinHandle};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use sqlx::postgres::{PgConnection, PgListener, PgNotification};
use sqlx::Connection;

use super::queries;
use crate::bus::EventBus;
use crate::error::{Result, StoreError};
use crate::types::ChangeEvent;

/// Channel the after-insert trigger publishes on.
pub const NOTIFY_CHANNEL: &str = "object_events";

pub struct Builder {
	pg_url: String,
	bus: Arc<EventBus>,
	subscriber_id: Option<String>,
}

impl Builder {
	pub fn new(pg_url: &str, bus: Arc<EventBus>) -> Self {
		Self { pg_url: pg_url.to_string(), bus, subscriber_id: None }
	}

	/// Persist the catch-up checkpoint under this id. Without one the
	/// listener is live-only and replays nothing across restarts.
	#[must_use]
	pub fn subscriber_id(mut self, id: impl Into<String>) -> Self {
		self.subscriber_id = Some(id.into());
		self
	}

	/// Spawns this listener which will dispatch to the bus in the background
	pub async fn spawn(self) -> Result<Listener> {
		let (tx, rx) = flume::bounded(1);
		let pg_url = self.pg_url.clone();

		// Connect and LISTEN before catch-up. Otherwise an event committed
		// between catch-up and the first wait would be missed; committed
		// both ways it is at worst delivered twice, and writes are
		// idempotent by (entity_id, version).
		let mut listener = PgListener::connect(&pg_url).await?;
		listener.listen(NOTIFY_CHANNEL).await?;

		let fut = async move {
			let mut conn = PgConnection::connect(&pg_url).await?;
			let mut state = ListenerState {
				bus: self.bus,
				subscriber_id: self.subscriber_id,
				last_tx_time: None,
			};

			state.load_checkpoint(&mut conn).await?;
			state.catch_up(&mut conn).await?;

			let mut stream = listener.into_stream();
			loop {
				let mut listen_fut = stream.next().fuse();

				futures::select! {
					notif = listen_fut => {
						match notif {
							Some(Ok(n)) => state.handle_notification(n, &mut conn).await,
							Some(Err(e)) => {
								// Transient disconnect: the stream reconnects
								// underneath us; replay whatever the gap hid.
								log::warn!("notification channel error, replaying from checkpoint: {}", e);
								if let Err(e) = state.catch_up(&mut conn).await {
									log::error!("catch-up after reconnect failed: {}", e);
								}
							}
							None => break,
						}
					},
					r = rx.recv_async() => {
						match r {
							Ok(_) => break,
							Err(e) => {
								log::warn!("ending due to: {:?}", e);
							}
						}
					},
					complete => break,
				};
			}

			// Collect the remaining buffered notifications before exiting,
			// as long as the collection completes in a reasonable time.
			let drain = async {
				for msg in stream.collect::<Vec<_>>().await {
					match msg {
						Ok(n) => state.handle_notification(n, &mut conn).await,
						Err(e) => log::warn!("dropping notification on shutdown: {}", e),
					}
				}
			};
			if timeout(Duration::from_secs(1), drain).await.is_err() {
				log::warn!("clean-up notification collection timed out");
			}
			Ok::<(), StoreError>(())
		};

		let handle = Some(task::spawn(fut));
		Ok(Listener { tx, handle })
	}
}

struct ListenerState {
	bus: Arc<EventBus>,
	subscriber_id: Option<String>,
	last_tx_time: Option<DateTime<Utc>>,
}

impl ListenerState {
	async fn load_checkpoint(&mut self, conn: &mut PgConnection) -> Result<()> {
		if let Some(id) = &self.subscriber_id {
			self.last_tx_time = queries::load_checkpoint(conn, id).await?;
		}
		Ok(())
	}

	/// Replay events committed after the checkpoint, in ascending
	/// `tx_time`, advancing the checkpoint per event. A first run has no
	/// checkpoint; it starts from "now" instead of replaying history.
	async fn catch_up(&mut self, conn: &mut PgConnection) -> Result<()> {
		let since = match self.last_tx_time {
			Some(since) => since,
			None => {
				// First run: start from the substrate's clock, not ours,
				// so clock skew cannot hide events from the next restart.
				let now: DateTime<Utc> =
					sqlx::query_scalar("SELECT now()").fetch_one(&mut *conn).await?;
				self.last_tx_time = Some(now);
				self.save_checkpoint(conn).await;
				return Ok(());
			}
		};

		let missed = queries::events_since(conn, since).await?;
		if missed.is_empty() {
			return Ok(());
		}
		log::info!("catching up on {} missed event(s) since {}", missed.len(), since);
		for model in missed {
			match model.change_event() {
				Ok(event) => {
					let tx_time = event.tx_time;
					self.bus.emit(&event);
					self.last_tx_time = Some(tx_time);
					self.save_checkpoint(conn).await;
				}
				Err(e) => log::warn!("skipping malformed event row during catch-up: {}", e),
			}
		}
		Ok(())
	}

	/// Parse one notification and dispatch it to the bus. A malformed
	/// payload is skipped, not fatal.
	async fn handle_notification(&mut self, notification: PgNotification, conn: &mut PgConnection) {
		let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
			Ok(event) => event,
			Err(e) => {
				log::warn!("skipping malformed notification payload: {}", e);
				return;
			}
		};
		let tx_time = event.tx_time;
		self.bus.emit(&event);
		self.last_tx_time = Some(tx_time);
		self.save_checkpoint(conn).await;
	}

	async fn save_checkpoint(&self, conn: &mut PgConnection) {
		let (id, last) = match (&self.subscriber_id, self.last_tx_time) {
			(Some(id), Some(last)) => (id, last),
			_ => return,
		};
		if let Err(e) = queries::save_checkpoint(conn, id, last).await {
			log::error!("failed to persist checkpoint for '{}': {}", id, e);
		}
	}
}

/// A background listener bridging LISTEN/NOTIFY to the event bus.
/// Dropping this will kill the listener.
pub struct Listener {
	// Shutdown signal
	tx: flume::Sender<()>,
	handle: Option<JoinHandle<Result<()>>>,
}

impl Listener {
	pub fn builder(pg_url: &str, bus: Arc<EventBus>) -> Builder {
		Builder::new(pg_url, bus)
	}

	pub async fn kill(&mut self) -> Result<()> {
		let _ = self.tx.send_async(()).await;
		if let Some(handle) = self.handle.take() {
			handle.await?;
		}
		Ok(())
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		if self.handle.is_some() {
			if let Err(e) = task::block_on(self.kill()) {
				log::error!("failed to terminate listener {}", e)
			}
		}
	}
}
