//! 飞书 (Feishu) provider client.
//!
//! Grounded on `server/utils/feishu_api.py`'s `FeiShuAPI`: a tenant access
//! token fetched from `tenant_access_token/internal`, `page_token`-based
//! pagination on `contact/v3/departments/children` and `contact/v3/users`,
//! and the `"0"` string sentinel for the root department.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use super::{token_cache::TokenCache, ProviderClient, ProviderFetch, UpstreamDepartment, UpstreamUser};

/// Credentials for a single Feishu app.
#[derive(Debug, Clone, Deserialize)]
pub struct FeiShuConfig {
	/// App id.
	pub app_id: String,
	/// App secret.
	pub app_secret: String,
	/// API host, overridable so tests can point this client at a mock
	/// server instead of the real Feishu endpoint.
	#[serde(default = "default_base_url")]
	pub base_url: String,
}

fn default_base_url() -> String {
	"https://open.feishu.cn".to_owned()
}

/// Client for the Feishu (飞书) contacts API.
#[derive(Debug)]
pub struct FeiShuClient {
	config: FeiShuConfig,
	http: reqwest::Client,
	token: TokenCache,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	tenant_access_token: String,
	expire: u64,
}

#[derive(Debug, Deserialize)]
struct DepartmentPage {
	items: Option<Vec<RawDepartment>>,
	has_more: bool,
	page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDepartment {
	department_id: String,
	parent_department_id: String,
	name: String,
}

#[derive(Debug, Deserialize)]
struct UserPage {
	items: Option<Vec<RawUser>>,
	has_more: bool,
	page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
	open_id: String,
	name: String,
	email: Option<String>,
	mobile: Option<String>,
	department_ids: Vec<String>,
}

impl FeiShuClient {
	/// Creates a new client for the given app credentials.
	#[must_use]
	pub fn new(config: FeiShuConfig) -> Self {
		Self { config, http: reqwest::Client::new(), token: TokenCache::default() }
	}

	async fn access_token(&self) -> anyhow::Result<String> {
		let app_id = self.config.app_id.clone();
		let app_secret = self.config.app_secret.clone();
		let http = self.http.clone();
		let url = format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.config.base_url);
		self.token
			.get_or_refresh(|| async move {
				let resp: TokenResponse = http
					.post(url)
					.json(&serde_json::json!({ "app_id": app_id, "app_secret": app_secret }))
					.send()
					.await?
					.error_for_status()?
					.json()
					.await?;
				Ok((resp.tenant_access_token, Duration::from_secs(resp.expire)))
			})
			.await
	}

	async fn fetch_departments(&self) -> anyhow::Result<Vec<UpstreamDepartment>> {
		let token = self.access_token().await?;
		let mut departments = Vec::new();
		let mut page_token: Option<String> = None;
		loop {
			let mut query = vec![("department_id", "0".to_owned()), ("fetch_child", "true".to_owned())];
			if let Some(token) = &page_token {
				query.push(("page_token", token.clone()));
			}
			let page: DepartmentPage = self
				.http
				.get(format!("{}/open-apis/contact/v3/departments/children", self.config.base_url))
				.bearer_auth(&token)
				.query(&query)
				.send()
				.await?
				.error_for_status()?
				.json()
				.await?;
			for dept in page.items.unwrap_or_default() {
				let parent_ext_id =
					if dept.parent_department_id == "0" { None } else { Some(dept.parent_department_id) };
				departments.push(UpstreamDepartment {
					ext_id: dept.department_id,
					name: dept.name,
					parent_ext_id,
				});
			}
			if !page.has_more {
				break;
			}
			page_token = page.page_token;
			if page_token.is_none() {
				break;
			}
		}
		Ok(departments)
	}

	async fn fetch_users(&self) -> anyhow::Result<Vec<UpstreamUser>> {
		let token = self.access_token().await?;
		let mut users = Vec::new();
		let mut page_token: Option<String> = None;
		loop {
			let mut query = Vec::new();
			if let Some(token) = &page_token {
				query.push(("page_token", token.clone()));
			}
			let page: UserPage = self
				.http
				.get(format!("{}/open-apis/contact/v3/users", self.config.base_url))
				.bearer_auth(&token)
				.query(&query)
				.send()
				.await?
				.error_for_status()?
				.json()
				.await?;
			for user in page.items.unwrap_or_default() {
				users.push(UpstreamUser {
					ext_id: user.open_id,
					name: user.name,
					email: user.email,
					mobile: user.mobile,
					department_ext_ids: user.department_ids,
				});
			}
			if !page.has_more {
				break;
			}
			page_token = page.page_token;
			if page_token.is_none() {
				break;
			}
		}
		Ok(users)
	}
}

#[async_trait]
impl ProviderClient for FeiShuClient {
	#[instrument(skip(self))]
	async fn get_departments(&self) -> ProviderFetch<UpstreamDepartment> {
		match self.fetch_departments().await {
			Ok(depts) => ProviderFetch::Ok(depts),
			Err(e) => ProviderFetch::Failed(e),
		}
	}

	#[instrument(skip(self))]
	async fn get_users(&self) -> ProviderFetch<UpstreamUser> {
		match self.fetch_users().await {
			Ok(users) => ProviderFetch::Ok(users),
			Err(e) => ProviderFetch::Failed(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use wiremock::{
		matchers::{method, path},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;

	fn config(base_url: String) -> FeiShuConfig {
		FeiShuConfig { app_id: "app1".to_owned(), app_secret: "secret1".to_owned(), base_url }
	}

	#[tokio::test]
	async fn paginates_departments_until_has_more_is_false() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/open-apis/auth/v3/tenant_access_token/internal"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"tenant_access_token": "tok-1",
				"expire": 7200,
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/open-apis/contact/v3/departments/children"))
			.and(|req: &wiremock::Request| !req.url.query_pairs().any(|(k, _)| k == "page_token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"items": [{ "department_id": "1", "parent_department_id": "0", "name": "Root" }],
				"has_more": true,
				"page_token": "page-2",
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/open-apis/contact/v3/departments/children"))
			.and(|req: &wiremock::Request| req.url.query_pairs().any(|(k, v)| k == "page_token" && v == "page-2"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"items": [{ "department_id": "2", "parent_department_id": "1", "name": "Engineering" }],
				"has_more": false,
				"page_token": null,
			})))
			.mount(&server)
			.await;

		let client = FeiShuClient::new(config(server.uri()));
		let departments = client.get_departments().await.into_result().expect("fetch should succeed");

		assert_eq!(departments.len(), 2, "both pages should be collected");
		assert_eq!(departments[1].parent_ext_id.as_deref(), Some("1"));
	}

	#[tokio::test]
	async fn root_department_id_zero_maps_to_no_parent() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/open-apis/auth/v3/tenant_access_token/internal"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"tenant_access_token": "tok-1",
				"expire": 7200,
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/open-apis/contact/v3/departments/children"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"items": [{ "department_id": "1", "parent_department_id": "0", "name": "Root" }],
				"has_more": false,
				"page_token": null,
			})))
			.mount(&server)
			.await;

		let client = FeiShuClient::new(config(server.uri()));
		let departments = client.get_departments().await.into_result().expect("fetch should succeed");

		assert_eq!(departments[0].parent_ext_id, None);
	}
}
