//! Configuration and audit-log data types.
//!
//! These mirror the rows a real deployment would keep in its own database;
//! this crate only defines the shapes and the [`crate::repository::ConfigRepository`]
//! contract for reading/writing them, not the storage itself.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies an [`LdapConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LdapConfigId(pub Uuid);

impl fmt::Display for LdapConfigId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Identifies a [`SyncConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncConfigId(pub Uuid);

impl fmt::Display for SyncConfigId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Identifies a [`SyncLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncLogId(pub Uuid);

impl fmt::Display for SyncLogId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Connection details for the downstream LDAP directory.
#[derive(Clone, Deserialize)]
pub struct LdapConfig {
	/// Unique id of this connection profile.
	pub id: LdapConfigId,
	/// e.g. `ldaps://dc1.example.com:636`
	pub server_uri: url::Url,
	/// Bind DN used to authenticate.
	pub bind_dn: String,
	/// Bind password. Deliberately excluded from `Debug` output.
	pub bind_password: String,
	/// Root of the directory this sync is allowed to touch.
	pub base_dn: String,
	/// Whether `server_uri` requires TLS negotiation beyond what the scheme
	/// implies (kept distinct from `ldaps://` for StartTLS support).
	pub use_ssl: bool,
	/// Soft-disable switch; disabled configs are skipped by the scheduler.
	pub enabled: bool,
}

impl fmt::Debug for LdapConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LdapConfig")
			.field("id", &self.id)
			.field("server_uri", &self.server_uri)
			.field("bind_dn", &self.bind_dn)
			.field("bind_password", &"<redacted>")
			.field("base_dn", &self.base_dn)
			.field("use_ssl", &self.use_ssl)
			.field("enabled", &self.enabled)
			.finish()
	}
}

/// Which upstream identity provider a [`SyncConfig`] pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
	/// 企业微信 (WeCom).
	WeCom,
	/// 飞书 (Feishu).
	Feishu,
	/// 钉钉 (DingTalk).
	DingTalk,
}

impl fmt::Display for ProviderKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ProviderKind::WeCom => "wecom",
			ProviderKind::Feishu => "feishu",
			ProviderKind::DingTalk => "dingtalk",
		};
		write!(f, "{name}")
	}
}

/// How often a [`SyncConfig`] is run by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
	/// Never triggered by the timer; only via `run_now`.
	Manual,
	/// Once per hour, on the hour the process happens to tick.
	Hourly,
	/// Once per day at 01:00 local time.
	Daily,
	/// Once per week, Monday at 01:00 local time.
	Weekly,
}

/// One provider/tenant sync pairing.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
	/// Unique id of this sync configuration.
	pub id: SyncConfigId,
	/// Human-readable label, surfaced in logs and audit rows.
	pub name: String,
	/// Which upstream provider this config pulls from.
	pub provider: ProviderKind,
	/// The LDAP connection this config writes into.
	pub ldap_config_id: LdapConfigId,
	/// Whether to reconcile user accounts.
	pub sync_users: bool,
	/// Whether to reconcile the department tree.
	pub sync_departments: bool,
	/// RDN of the OU synced users are rooted under, relative to `base_dn`.
	pub user_ou: String,
	/// RDN of the OU synced departments are rooted under, relative to
	/// `base_dn`.
	pub department_ou: String,
	/// Trigger cadence for the scheduler.
	pub frequency: SyncFrequency,
	/// Timestamp of the last run that completed (successfully or not).
	pub last_sync_time: Option<DateTime<Utc>>,
	/// Soft-disable switch; disabled configs are skipped by the scheduler.
	pub enabled: bool,
}

impl SyncConfig {
	/// Checks the invariants the reconciler relies on.
	///
	/// # Errors
	///
	/// Returns an error if an OU is required but empty.
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.sync_users && self.user_ou.trim().is_empty() {
			anyhow::bail!("sync_users is enabled but user_ou is empty");
		}
		if self.sync_departments && self.department_ou.trim().is_empty() {
			anyhow::bail!("sync_departments is enabled but department_ou is empty");
		}
		Ok(())
	}
}

/// The kind of directory object a [`SyncLogDetail`] row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
	/// A synced LDAP user entry.
	User,
	/// A synced LDAP department (`organizationalUnit`) entry.
	Department,
	/// Not tied to a single object; run-level bookkeeping.
	System,
}

/// The decision the reconciler made about a single object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
	/// A new LDAP object was created.
	Create,
	/// An existing LDAP object's attributes were changed in place.
	Update,
	/// An existing LDAP object was renamed and/or reparented.
	Move,
	/// An existing LDAP object was removed. Unused by the reconciler itself
	/// (deletion is out of scope for this revision) but kept in the model
	/// since audit consumers may record deletions performed out-of-band.
	Delete,
	/// Informational note with no corresponding mutation.
	Info,
	/// The reconciler attempted a mutation and it failed.
	Error,
}

/// A single sync run.
///
/// Constructed via [`crate::audit::SyncLogWriter::open`] in an "open" state
/// and transitioned to "sealed" exactly once via
/// [`crate::audit::SyncLogHandle::seal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
	/// Unique id of this run.
	pub id: SyncLogId,
	/// The config this run executed.
	pub config_id: SyncConfigId,
	/// When the run started.
	pub started_at: DateTime<Utc>,
	/// Whether the run completed without aborting. `false` does not
	/// necessarily mean zero objects were synced -- see [`Self::users_synced`].
	pub success: bool,
	/// Count of upstream users that reached the decision step this run,
	/// whether or not they ended up unchanged, mutated, or failed.
	pub users_synced: u64,
	/// Count of upstream departments that reached the decision step this
	/// run, whether or not they ended up unchanged, mutated, or failed.
	pub departments_synced: u64,
}

/// One row of a [`SyncLog`]'s detail trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogDetail {
	/// The run this row belongs to.
	pub sync_log_id: SyncLogId,
	/// Whether this row describes a user, a department, or is run-level.
	pub object_type: ObjectType,
	/// What the reconciler did (or tried to do).
	pub action: SyncAction,
	/// The upstream `ext_id`, or an empty string for `System` rows.
	pub object_id: String,
	/// Display name at the time of this event.
	pub object_name: String,
	/// Attribute snapshot before the change, if applicable.
	pub old_data: Option<serde_json::Value>,
	/// Attribute snapshot after the change, if applicable.
	pub new_data: Option<serde_json::Value>,
	/// Free-form human-readable description, e.g. the error message for
	/// `SyncAction::Error` rows.
	pub details: String,
}
