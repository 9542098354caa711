//! Upstream identity provider clients.
//!
//! Each provider normalizes its own department/user tree to the common
//! [`UpstreamDepartment`]/[`UpstreamUser`] shapes the reconciler works with,
//! hiding pagination, authentication, and token refresh behind a single
//! `#[async_trait]` interface. Grounded on
//! `server/utils/{wecom,feishu,dingtalk}_api.py`.

pub mod dingtalk;
pub mod feishu;
mod token_cache;
pub mod wecom;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use dingtalk::DingTalkClient;
pub use feishu::FeiShuClient;
pub use wecom::WeComClient;

/// A department as reported by an upstream provider, already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDepartment {
	/// The provider's own department id.
	pub ext_id: String,
	/// Display name.
	pub name: String,
	/// Upstream id of the parent department, or `None` for a root
	/// department.
	pub parent_ext_id: Option<String>,
}

/// A user as reported by an upstream provider, already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamUser {
	/// The provider's own user id.
	pub ext_id: String,
	/// Display name.
	pub name: String,
	/// Email address, if the provider has one on file.
	pub email: Option<String>,
	/// Mobile number, if the provider has one on file.
	pub mobile: Option<String>,
	/// Upstream department ids this user belongs to, in provider-reported
	/// order. The first entry is used as the primary department when
	/// resolving the user's DN.
	pub department_ext_ids: Vec<String>,
}

/// The outcome of a single provider pull.
///
/// Distinct from an empty `Vec` so a failed pull is never mistaken for a
/// legitimately empty upstream tree.
#[derive(Debug)]
pub enum ProviderFetch<T> {
	/// The pull succeeded; `T` items were returned (possibly zero).
	Ok(Vec<T>),
	/// The pull failed outright.
	Failed(anyhow::Error),
}

impl<T> ProviderFetch<T> {
	/// Converts into a `Result`, for callers that want `?`-propagation
	/// instead of matching.
	///
	/// # Errors
	///
	/// Returns the wrapped error if this is [`ProviderFetch::Failed`].
	pub fn into_result(self) -> anyhow::Result<Vec<T>> {
		match self {
			ProviderFetch::Ok(items) => Ok(items),
			ProviderFetch::Failed(e) => Err(e),
		}
	}
}

/// Fetches departments and users from a single upstream identity provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
	/// Fetches the full department tree.
	async fn get_departments(&self) -> ProviderFetch<UpstreamDepartment>;

	/// Fetches the full user list, with department memberships attached.
	async fn get_users(&self) -> ProviderFetch<UpstreamUser>;
}
