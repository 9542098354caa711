//! Append-only audit trail for a single sync run.
//!
//! Grounded on `SyncService.create_sync_log`/`add_log_detail` in
//! `server/sync/sync_service.py`, redone so the detail rows never block the
//! reconciler: each call to [`SyncLogHandle::detail`] hands the row to a
//! bounded channel and returns immediately, matching how the teacher crate
//! threads `EntryStatus` values through an `mpsc::Receiver` in
//! `source_ldap.rs` rather than writing synchronously inline.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
	models::{ObjectType, SyncAction, SyncConfig, SyncLog, SyncLogDetail, SyncLogId},
	repository::ConfigRepository,
};

/// Channel capacity for buffered detail rows. Generously sized since a
/// single run rarely produces more than a few thousand rows; the reconciler
/// never wants to block on persistence mid-diff.
const DETAIL_CHANNEL_CAPACITY: usize = 4096;

/// An open (not yet sealed) sync run.
///
/// Detail rows appended via [`Self::detail`] are flushed to the repository
/// by a background task; [`Self::seal`] waits for that task to drain before
/// returning, so by the time it resolves every row is durable.
#[derive(Debug)]
pub struct SyncLogHandle {
	id: SyncLogId,
	config_id: crate::models::SyncConfigId,
	started_at: chrono::DateTime<Utc>,
	sender: mpsc::Sender<SyncLogDetail>,
	flush_task: tokio::task::JoinHandle<()>,
	users_synced: u64,
	departments_synced: u64,
}

impl SyncLogHandle {
	/// Opens a new run for `config`, spawning the background flush task.
	pub fn open(config: &SyncConfig, repo: Arc<dyn ConfigRepository>) -> Self {
		let id = SyncLogId(Uuid::new_v4());
		let (sender, mut receiver) = mpsc::channel(DETAIL_CHANNEL_CAPACITY);
		let flush_task = tokio::spawn(async move {
			while let Some(detail) = receiver.recv().await {
				if let Err(e) = repo.append_sync_log_detail(&detail).await {
					warn!(error = %e, "failed to persist sync log detail");
				}
			}
		});
		info!(sync_log_id = %id, config_id = %config.id, "opened sync log");
		Self {
			id,
			config_id: config.id,
			started_at: Utc::now(),
			sender,
			flush_task,
			users_synced: 0,
			departments_synced: 0,
		}
	}

	/// Records that one upstream department reached the decision step,
	/// regardless of whether it turned out to be a no-op, a mutation, or a
	/// failed mutation.
	pub fn mark_department_processed(&mut self) {
		self.departments_synced += 1;
	}

	/// Records that one upstream user reached the decision step, regardless
	/// of whether it turned out to be a no-op, a mutation, or a failed
	/// mutation.
	pub fn mark_user_processed(&mut self) {
		self.users_synced += 1;
	}

	/// Appends one detail row. Never fails the caller: a send failure (the
	/// flush task died) is logged and swallowed, since losing an audit row
	/// must never abort a sync run.
	pub async fn detail(
		&mut self,
		object_type: ObjectType,
		action: SyncAction,
		object_id: impl Into<String>,
		object_name: impl Into<String>,
		old_data: Option<Value>,
		new_data: Option<Value>,
		details: impl Into<String>,
	) {
		let row = SyncLogDetail {
			sync_log_id: self.id,
			object_type,
			action,
			object_id: object_id.into(),
			object_name: object_name.into(),
			old_data,
			new_data,
			details: details.into(),
		};
		if self.sender.send(row).await.is_err() {
			warn!("sync log detail flush task is gone, dropping row");
		}
	}

	/// Closes the detail channel, waits for every buffered row to flush, and
	/// returns the sealed [`SyncLog`].
	///
	/// # Errors
	///
	/// Returns an error if the flush task panicked.
	pub async fn seal(self, success: bool) -> anyhow::Result<SyncLog> {
		drop(self.sender);
		self.flush_task.await?;
		Ok(SyncLog {
			id: self.id,
			config_id: self.config_id,
			started_at: self.started_at,
			success,
			users_synced: self.users_synced,
			departments_synced: self.departments_synced,
		})
	}
}
