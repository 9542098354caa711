//! Contract between the reconciliation engine and whatever owns durable
//! storage for configuration and audit records.
//!
//! The engine never talks to a database directly; it only depends on this
//! trait, matching how the teacher crate keeps persistence concerns
//! (`cache_path`/bincode, in that case) behind a narrow interface rather than
//! reaching for a specific store from deep inside sync logic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{LdapConfig, LdapConfigId, SyncConfig, SyncConfigId, SyncLog, SyncLogDetail};

/// Read/write access the engine needs from the surrounding application.
///
/// Implementations are responsible for all actual persistence; this crate
/// ships no database-backed implementation, only the in-memory fake under
/// `tests/` used to exercise the reconciler and scheduler.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
	/// Returns every enabled [`SyncConfig`], for the scheduler to refresh
	/// its job table from.
	async fn enabled_sync_configs(&self) -> anyhow::Result<Vec<SyncConfig>>;

	/// Looks up a single [`SyncConfig`] by id.
	async fn sync_config(&self, id: SyncConfigId) -> anyhow::Result<SyncConfig>;

	/// Looks up the [`LdapConfig`] a [`SyncConfig`] writes into.
	async fn ldap_config(&self, id: LdapConfigId) -> anyhow::Result<LdapConfig>;

	/// Records that a [`SyncConfig`] finished a run at `at`.
	async fn set_last_sync_time(&self, id: SyncConfigId, at: DateTime<Utc>) -> anyhow::Result<()>;

	/// Persists a (possibly not yet sealed) [`SyncLog`].
	async fn save_sync_log(&self, log: &SyncLog) -> anyhow::Result<()>;

	/// Appends one [`SyncLogDetail`] row.
	async fn append_sync_log_detail(&self, detail: &SyncLogDetail) -> anyhow::Result<()>;
}

/// A non-persistent [`ConfigRepository`], holding everything in memory for
/// the lifetime of the process.
///
/// This is the repository the standalone binary wires up from a config
/// file: it has no database of its own, matching this crate's scope (a
/// durable, multi-process-safe store is an application concern, not this
/// engine's). `SyncLog`/`SyncLogDetail` rows are kept only for the current
/// process lifetime and are mainly useful for tests and local runs.
#[derive(Debug)]
pub struct InMemoryConfigRepository {
	ldap_configs: HashMap<LdapConfigId, LdapConfig>,
	sync_configs: Mutex<HashMap<SyncConfigId, SyncConfig>>,
	logs: Mutex<Vec<SyncLog>>,
	details: Mutex<Vec<SyncLogDetail>>,
}

impl InMemoryConfigRepository {
	/// Builds a repository seeded with the given configs.
	#[must_use]
	pub fn new(ldap_configs: Vec<LdapConfig>, sync_configs: Vec<SyncConfig>) -> Self {
		Self {
			ldap_configs: ldap_configs.into_iter().map(|c| (c.id, c)).collect(),
			sync_configs: Mutex::new(sync_configs.into_iter().map(|c| (c.id, c)).collect()),
			logs: Mutex::new(Vec::new()),
			details: Mutex::new(Vec::new()),
		}
	}
}

#[async_trait]
impl ConfigRepository for InMemoryConfigRepository {
	async fn enabled_sync_configs(&self) -> anyhow::Result<Vec<SyncConfig>> {
		Ok(self.sync_configs.lock().await.values().filter(|c| c.enabled).cloned().collect())
	}

	async fn sync_config(&self, id: SyncConfigId) -> anyhow::Result<SyncConfig> {
		self.sync_configs
			.lock()
			.await
			.get(&id)
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("no sync config with id {id}"))
	}

	async fn ldap_config(&self, id: LdapConfigId) -> anyhow::Result<LdapConfig> {
		self.ldap_configs.get(&id).cloned().ok_or_else(|| anyhow::anyhow!("no LDAP config with id {id}"))
	}

	async fn set_last_sync_time(&self, id: SyncConfigId, at: DateTime<Utc>) -> anyhow::Result<()> {
		if let Some(config) = self.sync_configs.lock().await.get_mut(&id) {
			config.last_sync_time = Some(at);
		}
		Ok(())
	}

	async fn save_sync_log(&self, log: &SyncLog) -> anyhow::Result<()> {
		self.logs.lock().await.push(log.clone());
		Ok(())
	}

	async fn append_sync_log_detail(&self, detail: &SyncLogDetail) -> anyhow::Result<()> {
		self.details.lock().await.push(detail.clone());
		Ok(())
	}
}
