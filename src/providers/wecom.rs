//! 企业微信 (WeCom) provider client.
//!
//! Grounded on `server/utils/wecom_api.py`'s `WeComAPI`: `gettoken`,
//! `department/list`, and a `user/list` call per department (`fetch_child=0`)
//! with cross-department deduplication by `userid`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{instrument, warn};

use super::{token_cache::TokenCache, ProviderClient, ProviderFetch, UpstreamDepartment, UpstreamUser};

/// Credentials for a single WeCom corp/app pair.
#[derive(Debug, Clone, Deserialize)]
pub struct WeComConfig {
	/// Corp id.
	pub corp_id: String,
	/// App secret for `agent_id`.
	pub app_secret: String,
	/// Agent id the secret belongs to.
	pub agent_id: String,
	/// API host, overridable so tests can point this client at a mock
	/// server instead of the real WeCom endpoint.
	#[serde(default = "default_base_url")]
	pub base_url: String,
}

fn default_base_url() -> String {
	"https://qyapi.weixin.qq.com".to_owned()
}

/// Client for the WeCom (企业微信) contacts API.
#[derive(Debug)]
pub struct WeComClient {
	config: WeComConfig,
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
	department: Vec<RawDepartment>,
}

#[derive(Debug, Deserialize)]
struct RawDepartment {
	id: i64,
	parentid: i64,
	name: String,
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
	userlist: Vec<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
	userid: String,
	name: String,
	email: Option<String>,
	mobile: Option<String>,
	department: Vec<i64>,
}

impl WeComClient {
	/// Creates a new client for the given corp/app credentials.
	#[must_use]
	pub fn new(config: WeComConfig) -> Self {
		Self { config, http: reqwest::Client::new(), token: TokenCache::default() }
	}

	async fn access_token(&self) -> anyhow::Result<String> {
		let corp_id = self.config.corp_id.clone();
		let secret = self.config.app_secret.clone();
		let http = self.http.clone();
		let url = format!("{}/cgi-bin/gettoken", self.config.base_url);
		self.token
			.get_or_refresh(|| async move {
				let resp: TokenResponse = http
					.get(url)
					.query(&[("corpid", corp_id.as_str()), ("corpsecret", secret.as_str())])
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
			.get(format!("{}/cgi-bin/department/list", self.config.base_url))
			.query(&[("access_token", token.as_str())])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(resp
			.department
			.into_iter()
			.map(|d| UpstreamDepartment {
				ext_id: d.id.to_string(),
				name: d.name,
				parent_ext_id: if d.parentid == 0 { None } else { Some(d.parentid.to_string()) },
			})
			.collect())
	}

	async fn fetch_department_users(&self, department_id: &str) -> anyhow::Result<Vec<RawUser>> {
		let token = self.access_token().await?;
		let resp: UserListResponse = self
			.http
			.get(format!("{}/cgi-bin/user/list", self.config.base_url))
			.query(&[
				("access_token", token.as_str()),
				("department_id", department_id),
				("fetch_child", "0"),
			])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(resp.userlist)
	}
}

#[async_trait]
impl ProviderClient for WeComClient {
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
					department_ext_ids: user.department.into_iter().map(|d| d.to_string()).collect(),
				});
			}
		}
		ProviderFetch::Ok(users)
	}
}

#[cfg(test)]
mod tests {
	use wiremock::{
		matchers::{method, path, query_param},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;

	fn config(base_url: String) -> WeComConfig {
		WeComConfig {
			corp_id: "corp1".to_owned(),
			app_secret: "secret1".to_owned(),
			agent_id: "1000001".to_owned(),
			base_url,
		}
	}

	#[tokio::test]
	async fn fetches_and_normalizes_departments() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/cgi-bin/gettoken"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"access_token": "tok-1",
				"expires_in": 7200,
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/cgi-bin/department/list"))
			.and(query_param("access_token", "tok-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"department": [
					{ "id": 1, "parentid": 0, "name": "Root" },
					{ "id": 2, "parentid": 1, "name": "Engineering" },
				],
			})))
			.mount(&server)
			.await;

		let client = WeComClient::new(config(server.uri()));
		let departments = client.get_departments().await.into_result().expect("fetch should succeed");

		assert_eq!(departments.len(), 2);
		assert_eq!(departments[0].ext_id, "1");
		assert_eq!(departments[0].parent_ext_id, None);
		assert_eq!(departments[1].parent_ext_id.as_deref(), Some("1"));
	}

	#[tokio::test]
	async fn deduplicates_users_seen_in_more_than_one_department() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/cgi-bin/gettoken"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"access_token": "tok-1",
				"expires_in": 7200,
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/cgi-bin/department/list"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"department": [
					{ "id": 1, "parentid": 0, "name": "Root" },
					{ "id": 2, "parentid": 1, "name": "Engineering" },
				],
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/cgi-bin/user/list"))
			.and(query_param("department_id", "1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"userlist": [
					{ "userid": "u1", "name": "Ada", "email": null, "mobile": null, "department": [1, 2] },
				],
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/cgi-bin/user/list"))
			.and(query_param("department_id", "2"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"userlist": [
					{ "userid": "u1", "name": "Ada", "email": null, "mobile": null, "department": [1, 2] },
				],
			})))
			.mount(&server)
			.await;

		let client = WeComClient::new(config(server.uri()));
		let users = client.get_users().await.into_result().expect("fetch should succeed");

		assert_eq!(users.len(), 1, "user present under both departments must only appear once");
		assert_eq!(users[0].department_ext_ids, vec!["1".to_owned(), "2".to_owned()]);
	}

	#[tokio::test]
	async fn an_upstream_error_response_surfaces_as_a_failed_fetch() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/cgi-bin/gettoken"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let client = WeComClient::new(config(server.uri()));
		match client.get_departments().await {
			ProviderFetch::Failed(_) => {}
			ProviderFetch::Ok(_) => panic!("a 500 from the token endpoint must not look like success"),
		}
	}
}
