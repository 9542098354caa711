//! The core two-phase diff-and-apply algorithm: departments, then users.
//!
//! Grounded on `SyncService.sync`/`_sync_wecom_departments`/
//! `_sync_wecom_users` (and their Feishu/DingTalk counterparts) in
//! `server/sync/sync_service.py`. The phase ordering, the forward-reference
//! "attach unresolved parents at the base OU" rule, and the
//! move-then-modify-in-place fallback order are all carried over from that
//! file; the provider-specific field names are not (those live in
//! `providers/`).

use std::{collections::HashMap, sync::Arc};

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::{
	audit::SyncLogHandle,
	identity_index::{department_tag_prefix, user_tag_prefix, DeptEntry, IdentityIndex, UserEntry},
	ldap_client::{AttrMap, LdapClient},
	models::{LdapConfig, ObjectType, SyncAction, SyncConfig, SyncLog},
	providers::{ProviderClient, UpstreamDepartment, UpstreamUser},
	repository::ConfigRepository,
};

/// Runs one sync: fetch upstream departments/users, diff against what's
/// already tagged in LDAP, and apply the difference.
pub struct Reconciler {
	config: SyncConfig,
	ldap_config: LdapConfig,
	provider: Arc<dyn ProviderClient>,
}

impl Reconciler {
	/// Builds a reconciler for one `(SyncConfig, provider client)` pairing.
	#[must_use]
	pub fn new(
		config: SyncConfig,
		ldap_config: LdapConfig,
		provider: Arc<dyn ProviderClient>,
	) -> Self {
		Self { config, ldap_config, provider }
	}

	/// Runs a full sync against an already-connected LDAP session.
	///
	/// The LDAP session's lifecycle (connect/close) is owned by the caller,
	/// so a connection failure never reaches this function -- it always
	/// receives a session it can use immediately, and never needs to decide
	/// whether to close one it didn't open.
	///
	/// # Errors
	///
	/// Returns an error only for failures that should abort the entire run:
	/// an invalid [`SyncConfig`], the base OUs being uncreatable, or the
	/// upstream provider failing outright. Per-item failures (a single
	/// department or user that can't be reconciled) are recorded as
	/// [`SyncAction::Error`] detail rows and do not abort the run.
	#[instrument(skip(self, ldap, repo), fields(config_id = %self.config.id, provider = %self.config.provider))]
	pub async fn sync(
		&self,
		ldap: &dyn LdapClient,
		repo: Arc<dyn ConfigRepository>,
	) -> anyhow::Result<SyncLog> {
		self.config.validate()?;
		let mut log = SyncLogHandle::open(&self.config, Arc::clone(&repo));

		let result = self.run_phases(ldap, &mut log).await;

		let success = match &result {
			Ok(()) => true,
			Err(e) => {
				warn!(error = %e, "sync run aborted");
				log.detail(
					ObjectType::System,
					SyncAction::Error,
					String::new(),
					self.config.name.clone(),
					None,
					None,
					format!("run aborted: {e}"),
				)
				.await;
				false
			}
		};

		let sealed = log.seal(success).await?;
		repo.save_sync_log(&sealed).await?;
		repo.set_last_sync_time(self.config.id, sealed.started_at).await?;
		info!(success = sealed.success, users = sealed.users_synced, departments = sealed.departments_synced, "sync run finished");
		Ok(sealed)
	}

	async fn run_phases(&self, ldap: &dyn LdapClient, log: &mut SyncLogHandle) -> anyhow::Result<()> {
		let base_dn = &self.ldap_config.base_dn;
		let department_base = format!("ou={},{base_dn}", self.config.department_ou);
		let user_base = format!("ou={},{base_dn}", self.config.user_ou);
		self.ensure_base_ous(ldap, &department_base, &user_base).await?;

		let mut index = IdentityIndex::build(ldap, base_dn, self.config.provider).await?;

		if self.config.sync_departments {
			let departments =
				self.provider.get_departments().await.into_result().map_err(|e| {
					anyhow::anyhow!("fetching departments from {}: {e}", self.config.provider)
				})?;
			self.reconcile_departments(ldap, log, &mut index, departments, &department_base).await;
		}

		if self.config.sync_users {
			let users = self
				.provider
				.get_users()
				.await
				.into_result()
				.map_err(|e| anyhow::anyhow!("fetching users from {}: {e}", self.config.provider))?;
			self.reconcile_users(ldap, log, &index, users, &user_base).await;
		}

		Ok(())
	}

	async fn ensure_base_ous(
		&self,
		ldap: &dyn LdapClient,
		department_base: &str,
		user_base: &str,
	) -> anyhow::Result<()> {
		for (dn, ou) in
			[(department_base, &self.config.department_ou), (user_base, &self.config.user_ou)]
		{
			if !ldap.exists(dn).await? {
				let mut attrs: AttrMap = HashMap::new();
				attrs.insert("ou".to_owned(), [ou.clone()].into_iter().collect());
				ldap.add(dn, &["top", "organizationalUnit"], &attrs).await?;
			}
		}
		Ok(())
	}

	/// Phase 1: reconcile departments, parents before children via a sort on
	/// `ext_id`. This is a monotonicity shortcut, not a true topological
	/// sort -- it relies on every provider handing out parent ids before
	/// child ids, which holds for WeCom/Feishu/DingTalk in practice but
	/// isn't guaranteed by their APIs.
	async fn reconcile_departments(
		&self,
		ldap: &dyn LdapClient,
		log: &mut SyncLogHandle,
		index: &mut IdentityIndex,
		mut departments: Vec<UpstreamDepartment>,
		department_base: &str,
	) {
		departments.sort_by(|a, b| sort_key(&a.ext_id).cmp(&sort_key(&b.ext_id)));
		let tag_prefix = department_tag_prefix(self.config.provider);

		for dept in departments {
			let parent_dn = match &dept.parent_ext_id {
				None => department_base.to_owned(),
				Some(parent_ext_id) => match index.departments.get(parent_ext_id) {
					Some(parent) => parent.dn.clone(),
					None => {
						warn!(ext_id = %dept.ext_id, parent = %parent_ext_id, "parent department unresolved this run, attaching at base OU");
						department_base.to_owned()
					}
				},
			};
			let target_dn = format!("ou={},{parent_dn}", escape_rdn_value(&dept.name));
			let tag = format!("{tag_prefix}{}", dept.ext_id);
			log.mark_department_processed();

			match index.departments.get(&dept.ext_id).cloned() {
				Some(existing) if existing.dn == target_dn => {
					// Already in place; nothing to do.
				}
				Some(existing) => {
					// `existing.dn != target_dn` holds here (the no-op case was matched
					// above), so this is always at least a reparent-shaped move; a name
					// change on top of that additionally gets its own `update` row, per
					// the distinct rename/reparent audit rows
					// `_sync_wecom_departments` emits.
					let name_changed = existing.name != dept.name;
					if name_changed {
						log.detail(
							ObjectType::Department,
							SyncAction::Update,
							dept.ext_id.clone(),
							dept.name.clone(),
							Some(json!({ "name": existing.name })),
							Some(json!({ "name": dept.name })),
							format!("department renamed: {} -> {}", existing.name, dept.name),
						)
						.await;
					}
					log.detail(
						ObjectType::Department,
						SyncAction::Move,
						dept.ext_id.clone(),
						dept.name.clone(),
						Some(json!({ "parent_ext_id": existing.parent_ext_id })),
						Some(json!({ "parent_ext_id": dept.parent_ext_id })),
						"department moved",
					)
					.await;

					match ldap.move_object(&existing.dn, &target_dn).await {
						Ok(()) => {
							index.departments.insert(
								dept.ext_id.clone(),
								DeptEntry {
									dn: target_dn,
									name: dept.name.clone(),
									parent_ext_id: dept.parent_ext_id.clone(),
								},
							);
						}
						Err(e) => {
							log.detail(
								ObjectType::Department,
								SyncAction::Error,
								dept.ext_id.clone(),
								dept.name.clone(),
								Some(json!({ "dn": existing.dn })),
								Some(json!({ "dn": target_dn })),
								format!("failed to move department: {e}"),
							)
							.await;
						}
					}
				}
				None => {
					let mut attrs: AttrMap = HashMap::new();
					attrs.insert("ou".to_owned(), [dept.name.clone()].into_iter().collect());
					attrs.insert("description".to_owned(), [tag].into_iter().collect());
					match ldap.add(&target_dn, &["top", "organizationalUnit"], &attrs).await {
						Ok(()) => {
							log.detail(
								ObjectType::Department,
								SyncAction::Create,
								dept.ext_id.clone(),
								dept.name.clone(),
								None,
								Some(json!({ "dn": target_dn })),
								"department created",
							)
							.await;
							index.departments.insert(
								dept.ext_id.clone(),
								DeptEntry {
									dn: target_dn,
									name: dept.name.clone(),
									parent_ext_id: dept.parent_ext_id.clone(),
								},
							);
						}
						Err(e) => {
							log.detail(
								ObjectType::Department,
								SyncAction::Error,
								dept.ext_id.clone(),
								dept.name.clone(),
								None,
								Some(json!({ "dn": target_dn })),
								format!("failed to create department: {e}"),
							)
							.await;
						}
					}
				}
			}
		}
	}

	/// Phase 2: reconcile users against the department tree phase 1 left in
	/// place.
	async fn reconcile_users(
		&self,
		ldap: &dyn LdapClient,
		log: &mut SyncLogHandle,
		index: &IdentityIndex,
		users: Vec<UpstreamUser>,
		user_base: &str,
	) {
		let tag_prefix = user_tag_prefix(self.config.provider);

		for user in users {
			let primary_dn = user
				.department_ext_ids
				.iter()
				.find_map(|ext_id| index.departments.get(ext_id))
				.map_or_else(|| user_base.to_owned(), |dept| dept.dn.clone());
			let target_dn = format!("uid={},{primary_dn}", escape_rdn_value(&user.ext_id));
			let tag = format!("{tag_prefix}{}", user.ext_id);
			log.mark_user_processed();

			let mut attrs: AttrMap = HashMap::new();
			attrs.insert("cn".to_owned(), [user.name.clone()].into_iter().collect());
			attrs.insert("sn".to_owned(), [user.name.clone()].into_iter().collect());
			attrs.insert("employeeNumber".to_owned(), [user.ext_id.clone()].into_iter().collect());
			attrs.insert("description".to_owned(), [tag].into_iter().collect());
			if let Some(email) = &user.email {
				attrs.insert("mail".to_owned(), [email.clone()].into_iter().collect());
			}
			if let Some(mobile) = &user.mobile {
				attrs.insert("telephoneNumber".to_owned(), [mobile.clone()].into_iter().collect());
			}

			match index.users.get(&user.ext_id) {
				Some(existing) => {
					self.reconcile_existing_user(ldap, log, &user, existing, &target_dn, &attrs).await;
				}
				None => {
					match ldap.add_user_cascading(&target_dn, &attrs).await {
						Ok(()) => {
							log.detail(
								ObjectType::User,
								SyncAction::Create,
								user.ext_id.clone(),
								user.name.clone(),
								None,
								Some(attrs_to_json(&attrs)),
								"user created",
							)
							.await;
						}
						Err(e) => {
							log.detail(
								ObjectType::User,
								SyncAction::Error,
								user.ext_id.clone(),
								user.name.clone(),
								None,
								Some(attrs_to_json(&attrs)),
								format!("failed to create user: {e}"),
							)
							.await;
						}
					}
				}
			}
		}
	}

	async fn reconcile_existing_user(
		&self,
		ldap: &dyn LdapClient,
		log: &mut SyncLogHandle,
		user: &UpstreamUser,
		existing: &UserEntry,
		target_dn: &str,
		attrs: &AttrMap,
	) {
		let mut current_dn = existing.dn.clone();

		if current_dn != *target_dn {
			match ldap.move_object(&current_dn, target_dn).await {
				Ok(()) => {
					log.detail(
						ObjectType::User,
						SyncAction::Move,
						user.ext_id.clone(),
						user.name.clone(),
						Some(json!({ "dn": current_dn })),
						Some(json!({ "dn": target_dn })),
						"user renamed or reparented",
					)
					.await;
					current_dn = target_dn.to_owned();
				}
				Err(e) => {
					warn!(ext_id = %user.ext_id, error = %e, "failed to move user, falling back to in-place modify");
					log.detail(
						ObjectType::User,
						SyncAction::Error,
						user.ext_id.clone(),
						user.name.clone(),
						Some(json!({ "dn": current_dn })),
						Some(json!({ "dn": target_dn })),
						format!("failed to move user: {e}"),
					)
					.await;
				}
			}
		}

		let changed = changed_attrs(&existing.attrs, attrs);
		if changed.is_empty() {
			return;
		}
		match ldap.modify(&current_dn, &changed).await {
			Ok(()) => {
				log.detail(
					ObjectType::User,
					SyncAction::Update,
					user.ext_id.clone(),
					user.name.clone(),
					Some(attrs_snapshot_to_json(&existing.attrs)),
					Some(attrs_to_json(&changed)),
					"user attributes updated",
				)
				.await;
			}
			Err(e) => {
				log.detail(
					ObjectType::User,
					SyncAction::Error,
					user.ext_id.clone(),
					user.name.clone(),
					Some(attrs_snapshot_to_json(&existing.attrs)),
					Some(attrs_to_json(&changed)),
					format!("failed to update user attributes: {e}"),
				)
				.await;
			}
		}
	}
}

/// Tracked attributes diffed between the existing LDAP entry and the
/// upstream record; `description` is excluded since it only ever encodes
/// the stable identity tag.
const DIFFED_ATTRS: &[&str] = &["cn", "mail", "telephoneNumber"];

fn changed_attrs(existing: &HashMap<String, String>, new: &AttrMap) -> AttrMap {
	let mut changed = AttrMap::new();
	for attr in DIFFED_ATTRS {
		let new_value = new.get(*attr).and_then(|v| v.iter().next());
		let old_value = existing.get(*attr);
		match (new_value, old_value) {
			(Some(new_value), Some(old_value)) if new_value == old_value => {}
			(Some(new_value), _) => {
				changed.insert((*attr).to_owned(), [new_value.clone()].into_iter().collect());
			}
			(None, Some(_)) => {
				// Upstream dropped the attribute; the engine does not clear
				// attributes it once wrote, to avoid silently destroying
				// data a human may have added out of band.
			}
			(None, None) => {}
		}
	}
	changed
}

fn attrs_to_json(attrs: &AttrMap) -> serde_json::Value {
	let map: serde_json::Map<String, serde_json::Value> = attrs
		.iter()
		.map(|(k, v)| (k.clone(), json!(v.iter().cloned().collect::<Vec<_>>())))
		.collect();
	serde_json::Value::Object(map)
}

fn attrs_snapshot_to_json(attrs: &HashMap<String, String>) -> serde_json::Value {
	let map: serde_json::Map<String, serde_json::Value> =
		attrs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
	serde_json::Value::Object(map)
}

/// Sort key for the `ext_id`-ordering shortcut: numeric ids sort
/// numerically, anything else falls back to lexicographic order so mixed
/// provider id formats never panic.
fn sort_key(ext_id: &str) -> (u8, u64, String) {
	match ext_id.parse::<u64>() {
		Ok(n) => (0, n, String::new()),
		Err(_) => (1, 0, ext_id.to_owned()),
	}
}

/// Minimal RDN value escaping for the characters the LDAP DN string
/// representation (RFC 4514) treats specially.
fn escape_rdn_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	for c in value.chars() {
		if matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

#[cfg(test)]
mod tests {
	use uuid::Uuid;

	use super::*;
	use crate::{
		models::{LdapConfigId, ProviderKind, SyncConfigId, SyncFrequency},
		repository::InMemoryConfigRepository,
		test_support::{FakeLdap, FakeProvider},
	};

	fn sync_config() -> SyncConfig {
		SyncConfig {
			id: SyncConfigId(Uuid::new_v4()),
			name: "test-wecom".to_owned(),
			provider: ProviderKind::WeCom,
			ldap_config_id: LdapConfigId(Uuid::new_v4()),
			sync_users: true,
			sync_departments: true,
			user_ou: "users".to_owned(),
			department_ou: "departments".to_owned(),
			frequency: SyncFrequency::Manual,
			last_sync_time: None,
			enabled: true,
		}
	}

	fn ldap_config(id: LdapConfigId) -> LdapConfig {
		LdapConfig {
			id,
			server_uri: url::Url::parse("ldaps://ldap.example.test").unwrap(),
			bind_dn: "cn=admin,dc=example,dc=test".to_owned(),
			bind_password: "secret".to_owned(),
			base_dn: "dc=example,dc=test".to_owned(),
			use_ssl: true,
			enabled: true,
		}
	}

	fn repo() -> Arc<InMemoryConfigRepository> {
		Arc::new(InMemoryConfigRepository::new(vec![], vec![]))
	}

	#[tokio::test]
	async fn creates_departments_and_users_from_scratch() {
		let config = sync_config();
		let ldap_cfg = ldap_config(config.ldap_config_id);
		let fake_ldap = FakeLdap::new();
		let provider = FakeProvider {
			departments: vec![
				UpstreamDepartment { ext_id: "1".into(), name: "Engineering".into(), parent_ext_id: None },
				UpstreamDepartment {
					ext_id: "2".into(),
					name: "Backend".into(),
					parent_ext_id: Some("1".into()),
				},
			],
			users: vec![UpstreamUser {
				ext_id: "u1".into(),
				name: "Ada".into(),
				email: Some("ada@example.test".into()),
				mobile: None,
				department_ext_ids: vec!["2".into()],
			}],
		};

		let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
		let log = reconciler.sync(&fake_ldap, repo()).await.expect("sync should succeed");

		assert!(log.success);
		assert_eq!(log.departments_synced, 2);
		assert_eq!(log.users_synced, 1);
		assert!(fake_ldap.contains("ou=Engineering,ou=departments,dc=example,dc=test"));
		assert!(
			fake_ldap.contains("ou=Backend,ou=Engineering,ou=departments,dc=example,dc=test")
		);
		assert!(fake_ldap
			.contains("uid=u1,ou=Backend,ou=Engineering,ou=departments,dc=example,dc=test"));
	}

	#[tokio::test]
	async fn unresolved_parent_attaches_at_department_base() {
		let config = sync_config();
		let ldap_cfg = ldap_config(config.ldap_config_id);
		let fake_ldap = FakeLdap::new();
		let provider = FakeProvider {
			departments: vec![UpstreamDepartment {
				ext_id: "9".into(),
				name: "Orphan".into(),
				parent_ext_id: Some("missing".into()),
			}],
			users: vec![],
		};

		let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
		let log = reconciler.sync(&fake_ldap, repo()).await.expect("sync should succeed");

		assert!(log.success);
		assert!(fake_ldap.contains("ou=Orphan,ou=departments,dc=example,dc=test"));
	}

	#[tokio::test]
	async fn renamed_department_is_moved_not_recreated() {
		let config = sync_config();
		let ldap_cfg = ldap_config(config.ldap_config_id);
		let fake_ldap = FakeLdap::new();
		fake_ldap.seed(
			"ou=departments,dc=example,dc=test",
			&["top", "organizationalUnit"],
			&[("ou", "departments")],
		);
		fake_ldap.seed(
			"ou=users,dc=example,dc=test",
			&["top", "organizationalUnit"],
			&[("ou", "users")],
		);
		fake_ldap.seed(
			"ou=OldName,ou=departments,dc=example,dc=test",
			&["top", "organizationalUnit"],
			&[("ou", "OldName"), ("description", "企业微信部门ID: 1")],
		);

		let provider = FakeProvider {
			departments: vec![UpstreamDepartment {
				ext_id: "1".into(),
				name: "NewName".into(),
				parent_ext_id: None,
			}],
			users: vec![],
		};

		let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
		let log = reconciler.sync(&fake_ldap, repo()).await.expect("sync should succeed");

		assert!(log.success);
		assert_eq!(log.departments_synced, 1);
		assert!(!fake_ldap.contains("ou=OldName,ou=departments,dc=example,dc=test"));
		assert!(fake_ldap.contains("ou=NewName,ou=departments,dc=example,dc=test"));
		// Total entry count unchanged by the rename: base OUs (2) + the one
		// department, never duplicated.
		assert_eq!(fake_ldap.len(), 3);
	}

	#[tokio::test]
	async fn second_run_is_idempotent() {
		let config = sync_config();
		let ldap_cfg = ldap_config(config.ldap_config_id);
		let fake_ldap = FakeLdap::new();
		let provider = FakeProvider {
			departments: vec![UpstreamDepartment {
				ext_id: "1".into(),
				name: "Engineering".into(),
				parent_ext_id: None,
			}],
			users: vec![UpstreamUser {
				ext_id: "u1".into(),
				name: "Ada".into(),
				email: None,
				mobile: None,
				department_ext_ids: vec!["1".into()],
			}],
		};

		let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
		let repository = repo();
		reconciler.sync(&fake_ldap, Arc::clone(&repository) as Arc<dyn crate::repository::ConfigRepository>).await.expect("first sync should succeed");
		let entry_count_after_first = fake_ldap.len();

		let second_log = reconciler
			.sync(&fake_ldap, repository as Arc<dyn crate::repository::ConfigRepository>)
			.await
			.expect("second sync should succeed");

		assert!(second_log.success);
		assert_eq!(fake_ldap.len(), entry_count_after_first, "idempotent run must not duplicate entries");
		// Counts reflect every upstream object reached this run, not just
		// the ones that produced a mutation -- a no-change run still
		// "processed" one department and one user.
		assert_eq!(second_log.departments_synced, 1);
		assert_eq!(second_log.users_synced, 1);
	}

	#[tokio::test]
	async fn transient_move_failure_is_logged_and_run_continues_with_stale_dn() {
		/// Rejects `modify_dn` for one department and `add` for the
		/// copy-then-delete fallback's target, forcing [`LdapClient::move_object`]
		/// to exhaust every strategy and return `Err`.
		struct FlakyMove(FakeLdap);

		#[async_trait::async_trait]
		impl LdapClient for FlakyMove {
			async fn exists(&self, dn: &str) -> anyhow::Result<bool> {
				self.0.exists(dn).await
			}

			async fn add(&self, dn: &str, object_classes: &[&str], attrs: &AttrMap) -> anyhow::Result<()> {
				if dn == "ou=Sales,ou=departments,dc=example,dc=test" {
					anyhow::bail!("copy-then-delete create refused by server");
				}
				self.0.add(dn, object_classes, attrs).await
			}

			async fn modify(&self, dn: &str, attrs: &AttrMap) -> anyhow::Result<()> {
				self.0.modify(dn, attrs).await
			}

			async fn modify_dn(
				&self,
				old_dn: &str,
				new_rdn: &str,
				new_superior: Option<&str>,
			) -> anyhow::Result<()> {
				if old_dn == "ou=Sales,ou=Support,ou=departments,dc=example,dc=test" {
					anyhow::bail!("modify_dn rejected by server");
				}
				self.0.modify_dn(old_dn, new_rdn, new_superior).await
			}

			async fn delete(&self, dn: &str) -> anyhow::Result<()> {
				self.0.delete(dn).await
			}

			async fn search_by_filter(
				&self,
				base: &str,
				filter: &str,
				scope: crate::ldap_client::LdapScope,
				attrs: &[&str],
			) -> anyhow::Result<Vec<crate::ldap_client::LdapEntry>> {
				self.0.search_by_filter(base, filter, scope, attrs).await
			}
		}

		let config = sync_config();
		let ldap_cfg = ldap_config(config.ldap_config_id);
		let ldap = FlakyMove(FakeLdap::new());

		let first_provider = FakeProvider {
			departments: vec![
				UpstreamDepartment { ext_id: "1".into(), name: "Sales".into(), parent_ext_id: None },
				UpstreamDepartment { ext_id: "2".into(), name: "Support".into(), parent_ext_id: None },
			],
			users: vec![UpstreamUser {
				ext_id: "u1".into(),
				name: "Ada".into(),
				email: None,
				mobile: None,
				department_ext_ids: vec!["1".into()],
			}],
		};
		let reconciler = Reconciler::new(config.clone(), ldap_cfg.clone(), Arc::new(first_provider));
		reconciler.sync(&ldap, repo()).await.expect("first run should succeed");
		assert!(ldap.0.contains("uid=u1,ou=Sales,ou=departments,dc=example,dc=test"));

		let second_provider = FakeProvider {
			departments: vec![
				UpstreamDepartment { ext_id: "1".into(), name: "Sales".into(), parent_ext_id: Some("2".into()) },
				UpstreamDepartment { ext_id: "2".into(), name: "Support".into(), parent_ext_id: None },
			],
			users: vec![UpstreamUser {
				ext_id: "u1".into(),
				name: "Ada".into(),
				email: None,
				mobile: None,
				department_ext_ids: vec!["1".into()],
			}],
		};
		let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(second_provider));
		let log = reconciler.sync(&ldap, repo()).await.expect("the run itself must not abort");

		assert!(log.success, "a per-item move failure does not fail the whole run");
		// Both strategies for moving Sales were rejected, so it stays at its
		// pre-run DN, and its dependent user is placed there too.
		assert!(ldap.0.contains("ou=Sales,ou=departments,dc=example,dc=test"));
		assert!(!ldap.0.contains("ou=Sales,ou=Support,ou=departments,dc=example,dc=test"));
		assert!(ldap.0.contains("uid=u1,ou=Sales,ou=departments,dc=example,dc=test"));
	}

	#[tokio::test]
	async fn duplicate_department_name_is_logged_as_error_not_silently_dropped() {
		let config = sync_config();
		let ldap_cfg = ldap_config(config.ldap_config_id);
		let fake_ldap = FakeLdap::new();
		let provider = FakeProvider {
			departments: vec![
				UpstreamDepartment { ext_id: "1".into(), name: "Sales".into(), parent_ext_id: None },
				UpstreamDepartment { ext_id: "2".into(), name: "Sales".into(), parent_ext_id: None },
			],
			users: vec![],
		};

		let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
		let log = reconciler.sync(&fake_ldap, repo()).await.expect("sync should succeed overall");

		assert!(log.success);
		// Both departments reached the decision step even though only one
		// could actually be created under the shared `ou=Sales` RDN.
		assert_eq!(log.departments_synced, 2);
		assert!(fake_ldap.contains("ou=Sales,ou=departments,dc=example,dc=test"));
	}

	#[tokio::test]
	async fn user_attribute_update_is_applied_in_place() {
		let config = sync_config();
		let ldap_cfg = ldap_config(config.ldap_config_id);
		let fake_ldap = FakeLdap::new();
		let provider = FakeProvider {
			departments: vec![],
			users: vec![UpstreamUser {
				ext_id: "u1".into(),
				name: "Ada Lovelace".into(),
				email: Some("ada@example.test".into()),
				mobile: None,
				department_ext_ids: vec![],
			}],
		};

		let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
		let repository = repo();
		reconciler
			.sync(&fake_ldap, Arc::clone(&repository) as Arc<dyn crate::repository::ConfigRepository>)
			.await
			.expect("first sync should succeed");
		assert_eq!(
			fake_ldap.attr("uid=u1,ou=users,dc=example,dc=test", "mail").as_deref(),
			Some("ada@example.test")
		);

		let provider2 = FakeProvider {
			departments: vec![],
			users: vec![UpstreamUser {
				ext_id: "u1".into(),
				name: "Ada Lovelace".into(),
				email: Some("ada.lovelace@example.test".into()),
				mobile: None,
				department_ext_ids: vec![],
			}],
		};
		let config2 = sync_config();
		let reconciler2 = Reconciler::new(
			SyncConfig { id: reconciler.config.id, ..config2 },
			ldap_config(reconciler.config.ldap_config_id),
			Arc::new(provider2),
		);
		let log = reconciler2
			.sync(&fake_ldap, repository as Arc<dyn crate::repository::ConfigRepository>)
			.await
			.expect("second sync should succeed");

		assert!(log.success);
		assert_eq!(
			fake_ldap.attr("uid=u1,ou=users,dc=example,dc=test", "mail").as_deref(),
			Some("ada.lovelace@example.test")
		);
	}
}
