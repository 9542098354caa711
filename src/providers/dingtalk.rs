//! 钉钉 (DingTalk) provider client.
//!
//! Grounded on `server/utils/dingtalk_api.py`'s `DingTalkAPI`: `gettoken`,
//! `topapi/v2/department/list`, and `topapi/v2/user/list` per department
//! with `cursor`/`size`/`has_more` pagination, deduplicated by `userid`
//! across departments; root department id `1`.
//!
//! Unlike the Python original's `_sync_dingtalk_users`, this client exposes
//! the provider's own `userid` as `ext_id` without the `dingtalk_`-prefixed
//! form the original's duplicated inner block derived -- keeping DingTalk
//! consistent with how WeCom and Feishu identify users.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{instrument, warn};

use super::{token_cache::TokenCache, ProviderClient, ProviderFetch, UpstreamDepartment, UpstreamUser};

/// Root department id DingTalk uses for the top of the tree.
const ROOT_DEPARTMENT_ID: i64 = 1;

/// Credentials for a single DingTalk app.
#[derive(Debug, Clone, Deserialize)]
pub struct DingTalkConfig {
	/// App key (`appkey`).
	pub client_id: String,
	/// App secret (`appsecret`).
	pub client_secret: String,
	/// API host, overridable so tests can point this client at a mock
	/// server instead of the real DingTalk endpoint.
	#[serde(default = "default_base_url")]
	pub base_url: String,
}

fn default_base_url() -> String {
	"https://oapi.dingtalk.com".to_owned()
}

/// Client for the DingTalk (钉钉) contacts API.
#[derive(Debug)]
pub struct DingTalkClient {
	config: DingTalkConfig,
	http: reqwest::Client,
	token: TokenCache,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DepartmentListResponse {
	result: Vec<RawDepartment>,
}

#[derive(Debug, Deserialize)]
struct RawDepartment {
	dept_id: i64,
	parent_id: i64,
	name: String,
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
	result: UserListResult,
}

#[derive(Debug, Deserialize)]
struct UserListResult {
	has_more: bool,
	next_cursor: Option<i64>,
	list: Vec<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
	userid: String,
	name: String,
	email: Option<String>,
	mobile: Option<String>,
	dept_id_list: Vec<i64>,
}

impl DingTalkClient {
	/// Creates a new client for the given app credentials.
	#[must_use]
	pub fn new(config: DingTalkConfig) -> Self {
		Self { config, http: reqwest::Client::new(), token: TokenCache::default() }
	}

	async fn access_token(&self) -> anyhow::Result<String> {
		let client_id = self.config.client_id.clone();
		let client_secret = self.config.client_secret.clone();
		let http = self.http.clone();
		let url = format!("{}/gettoken", self.config.base_url);
		self.token
			.get_or_refresh(|| async move {
				let resp: TokenResponse = http
					.get(url)
					.query(&[("appkey", client_id.as_str()), ("appsecret", client_secret.as_str())])
					.send()
					.await?
					.error_for_status()?
					.json()
					.await?;
				Ok((resp.access_token, Duration::from_secs(resp.expires_in)))
			})
			.await
	}

	async fn fetch_departments(&self) -> anyhow::Result<Vec<UpstreamDepartment>> {
		let token = self.access_token().await?;
		let resp: DepartmentListResponse = self
			.http
			.post(format!("{}/topapi/v2/department/list", self.config.base_url))
			.query(&[("access_token", token.as_str())])
			.json(&serde_json::json!({}))
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(resp
			.result
			.into_iter()
			.map(|d| UpstreamDepartment {
				ext_id: d.dept_id.to_string(),
				name: d.name,
				parent_ext_id: if d.parent_id == ROOT_DEPARTMENT_ID {
					None
				} else {
					Some(d.parent_id.to_string())
				},
			})
			.collect())
	}

	async fn fetch_department_users(&self, dept_id: &str) -> anyhow::Result<Vec<RawUser>> {
		let token = self.access_token().await?;
		let mut users = Vec::new();
		let mut cursor: i64 = 0;
		loop {
			let resp: UserListResponse = self
				.http
				.post(format!("{}/topapi/v2/user/list", self.config.base_url))
				.query(&[("access_token", token.as_str())])
				.json(&serde_json::json!({
					"dept_id": dept_id,
					"cursor": cursor,
					"size": 100,
				}))
				.send()
				.await?
				.error_for_status()?
				.json()
				.await?;
			users.extend(resp.result.list);
			if !resp.result.has_more {
				break;
			}
			match resp.result.next_cursor {
				Some(next) => cursor = next,
				None => break,
			}
		}
		Ok(users)
	}
}

#[async_trait]
impl ProviderClient for DingTalkClient {
	#[instrument(skip(self))]
	async fn get_departments(&self) -> ProviderFetch<UpstreamDepartment> {
		match self.fetch_departments().await {
			Ok(depts) => ProviderFetch::Ok(depts),
			Err(e) => ProviderFetch::Failed(e),
		}
	}

	#[instrument(skip(self))]
	async fn get_users(&self) -> ProviderFetch<UpstreamUser> {
		let departments = match self.fetch_departments().await {
			Ok(depts) => depts,
			Err(e) => return ProviderFetch::Failed(e),
		};

		let mut seen = std::collections::HashSet::new();
		let mut users = Vec::new();
		for dept in &departments {
			let raw = match self.fetch_department_users(&dept.ext_id).await {
				Ok(raw) => raw,
				Err(e) => {
					warn!(department = %dept.ext_id, error = %e, "failed to list users for department");
					continue;
				}
			};
			for user in raw {
				if !seen.insert(user.userid.clone()) {
					continue;
				}
				users.push(UpstreamUser {
					ext_id: user.userid,
					name: user.name,
					email: user.email,
					mobile: user.mobile,
					department_ext_ids: user.dept_id_list.into_iter().map(|d| d.to_string()).collect(),
				});
			}
		}
		ProviderFetch::Ok(users)
	}
}
