#![allow(clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use identity_ldap_sync::{
	models::{LdapConfig, LdapConfigId, ProviderKind, SyncConfig, SyncConfigId, SyncFrequency},
	providers::{ProviderClient, ProviderFetch, UpstreamDepartment, UpstreamUser},
	repository::InMemoryConfigRepository,
	scheduler::ProviderClientFactory,
	test_support::{FakeLdap, FakeLdapClientFactory, FakeProvider, FakeProviderClientFactory},
	ConfigRepository, Reconciler, Scheduler,
};
use test_log::test;
use uuid::Uuid;

fn ldap_config(id: LdapConfigId) -> LdapConfig {
	LdapConfig {
		id,
		server_uri: url::Url::parse("ldaps://ldap.example.test").expect("static URL parses"),
		bind_dn: "cn=admin,dc=example,dc=test".to_owned(),
		bind_password: "secret".to_owned(),
		base_dn: "dc=example,dc=test".to_owned(),
		use_ssl: true,
		enabled: true,
	}
}

fn sync_config(ldap_config_id: LdapConfigId, frequency: SyncFrequency) -> SyncConfig {
	SyncConfig {
		id: SyncConfigId(Uuid::new_v4()),
		name: "acceptance-wecom".to_owned(),
		provider: ProviderKind::WeCom,
		ldap_config_id,
		sync_users: true,
		sync_departments: true,
		user_ou: "users".to_owned(),
		department_ou: "departments".to_owned(),
		frequency,
		last_sync_time: None,
		enabled: true,
	}
}

/// Exercises a full first-time population through [`Scheduler::run_now`],
/// the same path a standalone deployment's scheduler timer would take,
/// rather than calling [`Reconciler::sync`] directly.
#[test(tokio::test)]
async fn scheduler_run_now_populates_an_empty_directory() {
	let ldap_cfg = ldap_config(LdapConfigId(Uuid::new_v4()));
	let config = sync_config(ldap_cfg.id, SyncFrequency::Manual);
	let config_id = config.id;

	let repo = Arc::new(InMemoryConfigRepository::new(vec![ldap_cfg], vec![config]));
	let ldap = Arc::new(FakeLdap::new());
	let provider = Arc::new(FakeProvider {
		departments: vec![
			UpstreamDepartment { ext_id: "1".into(), name: "Engineering".into(), parent_ext_id: None },
			UpstreamDepartment {
				ext_id: "2".into(),
				name: "Platform".into(),
				parent_ext_id: Some("1".into()),
			},
		],
		users: vec![UpstreamUser {
			ext_id: "u1".into(),
			name: "Grace Hopper".into(),
			email: Some("grace@example.test".into()),
			mobile: None,
			department_ext_ids: vec!["2".into()],
		}],
	});

	let scheduler = Scheduler::with_ldap_factory(
		Arc::clone(&repo) as Arc<dyn ConfigRepository>,
		Arc::new(FakeProviderClientFactory { provider: Arc::clone(&provider) }),
		Arc::new(FakeLdapClientFactory { ldap: Arc::clone(&ldap) }),
	);

	let log = scheduler.run_now(config_id).await.expect("run_now should succeed");

	assert!(log.success);
	assert_eq!(log.departments_synced, 2);
	assert_eq!(log.users_synced, 1);
	assert!(ldap.contains("ou=Platform,ou=Engineering,ou=departments,dc=example,dc=test"));
	assert!(
		ldap.contains("uid=u1,ou=Platform,ou=Engineering,ou=departments,dc=example,dc=test")
	);

	let refreshed = repo.sync_config(config_id).await.expect("config still present");
	assert!(refreshed.last_sync_time.is_some(), "run_now should record last_sync_time");
}

/// A department that changes parent between two runs must be moved, and the
/// users under it must follow without being recreated.
#[test(tokio::test)]
async fn department_reparent_moves_users_along_with_it() {
	let config = sync_config(LdapConfigId(Uuid::new_v4()), SyncFrequency::Manual);
	let ldap_cfg = ldap_config(config.ldap_config_id);
	let ldap = FakeLdap::new();

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
	let repo = Arc::new(InMemoryConfigRepository::new(vec![], vec![]));
	let reconciler = Reconciler::new(config.clone(), ldap_cfg.clone(), Arc::new(first_provider));
	reconciler
		.sync(&ldap, Arc::clone(&repo) as Arc<dyn ConfigRepository>)
		.await
		.expect("first run should succeed");
	assert!(ldap.contains("uid=u1,ou=Sales,ou=departments,dc=example,dc=test"));

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
	let log =
		reconciler.sync(&ldap, repo as Arc<dyn ConfigRepository>).await.expect("second run should succeed");

	assert!(log.success);
	assert!(!ldap.contains("ou=Sales,ou=departments,dc=example,dc=test"));
	assert!(ldap.contains("ou=Sales,ou=Support,ou=departments,dc=example,dc=test"));
	assert!(ldap.contains("uid=u1,ou=Sales,ou=Support,ou=departments,dc=example,dc=test"));
}

/// A server that rejects `inetOrgPerson`-bearing object classes must still
/// end up with a user entry, created under a lower combination of the
/// cascade.
#[test(tokio::test)]
async fn user_creation_falls_back_through_the_schema_cascade() {
	struct RejectsInetOrgPerson(FakeLdap);

	#[async_trait]
	impl identity_ldap_sync::ldap_client::LdapClient for RejectsInetOrgPerson {
		async fn exists(&self, dn: &str) -> anyhow::Result<bool> {
			self.0.exists(dn).await
		}

		async fn add(
			&self,
			dn: &str,
			object_classes: &[&str],
			attrs: &identity_ldap_sync::ldap_client::AttrMap,
		) -> anyhow::Result<()> {
			if object_classes.contains(&"inetOrgPerson") {
				anyhow::bail!("schema violation: inetOrgPerson is not permitted on this server");
			}
			self.0.add(dn, object_classes, attrs).await
		}

		async fn modify(
			&self,
			dn: &str,
			attrs: &identity_ldap_sync::ldap_client::AttrMap,
		) -> anyhow::Result<()> {
			self.0.modify(dn, attrs).await
		}

		async fn modify_dn(
			&self,
			old_dn: &str,
			new_rdn: &str,
			new_superior: Option<&str>,
		) -> anyhow::Result<()> {
			self.0.modify_dn(old_dn, new_rdn, new_superior).await
		}

		async fn delete(&self, dn: &str) -> anyhow::Result<()> {
			self.0.delete(dn).await
		}

		async fn search_by_filter(
			&self,
			base: &str,
			filter: &str,
			scope: identity_ldap_sync::ldap_client::LdapScope,
			attrs: &[&str],
		) -> anyhow::Result<Vec<identity_ldap_sync::ldap_client::LdapEntry>> {
			self.0.search_by_filter(base, filter, scope, attrs).await
		}
	}

	let config = sync_config(LdapConfigId(Uuid::new_v4()), SyncFrequency::Manual);
	let ldap_cfg = ldap_config(config.ldap_config_id);
	let ldap = RejectsInetOrgPerson(FakeLdap::new());
	let provider = FakeProvider {
		departments: vec![],
		users: vec![UpstreamUser {
			ext_id: "u1".into(),
			name: "Margaret Hamilton".into(),
			email: Some("margaret@example.test".into()),
			mobile: None,
			department_ext_ids: vec![],
		}],
	};

	let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
	let repo = Arc::new(InMemoryConfigRepository::new(vec![], vec![]));
	let log = reconciler
		.sync(&ldap, repo as Arc<dyn ConfigRepository>)
		.await
		.expect("sync should succeed despite the schema rejections");

	assert!(log.success);
	let dn = "uid=u1,ou=users,dc=example,dc=test";
	let classes = ldap.0.object_classes(dn).expect("user entry should exist under some cascade tier");
	assert_eq!(classes, vec!["top", "person", "organizationalPerson"]);
	assert!(!classes.iter().any(|c| c == "inetOrgPerson"));
}

/// A provider client with a configurable artificial delay, used to widen the
/// window in which two `run_now` calls for the same config can race.
struct SlowProvider {
	inner: FakeProvider,
	delay: Duration,
}

#[async_trait]
impl ProviderClient for SlowProvider {
	async fn get_departments(&self) -> ProviderFetch<UpstreamDepartment> {
		tokio::time::sleep(self.delay).await;
		self.inner.get_departments().await
	}

	async fn get_users(&self) -> ProviderFetch<UpstreamUser> {
		self.inner.get_users().await
	}
}

struct SlowProviderClientFactory(Arc<SlowProvider>);

impl ProviderClientFactory for SlowProviderClientFactory {
	fn build(&self, _config: &SyncConfig) -> anyhow::Result<Arc<dyn ProviderClient>> {
		Ok(Arc::clone(&self.0) as Arc<dyn ProviderClient>)
	}
}

/// A second `run_now` for a config that already has a run in flight must be
/// refused rather than starting a concurrent, conflicting second pass over
/// the same directory subtree.
#[test(tokio::test)]
async fn run_now_rejects_a_concurrent_run_for_the_same_config() {
	let ldap_cfg = ldap_config(LdapConfigId(Uuid::new_v4()));
	let config = sync_config(ldap_cfg.id, SyncFrequency::Manual);
	let config_id = config.id;
	let repo = Arc::new(InMemoryConfigRepository::new(vec![ldap_cfg], vec![config]));

	let provider = Arc::new(SlowProvider {
		inner: FakeProvider {
			departments: vec![UpstreamDepartment {
				ext_id: "1".into(),
				name: "Engineering".into(),
				parent_ext_id: None,
			}],
			users: vec![],
		},
		delay: Duration::from_millis(50),
	});
	let ldap = Arc::new(FakeLdap::new());

	let scheduler = Arc::new(Scheduler::with_ldap_factory(
		Arc::clone(&repo) as Arc<dyn ConfigRepository>,
		Arc::new(SlowProviderClientFactory(provider)),
		Arc::new(FakeLdapClientFactory { ldap }),
	));

	let (first, second) = tokio::join!(scheduler.run_now(config_id), scheduler.run_now(config_id));

	let outcomes = [first, second];
	let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
	let rejected = outcomes.iter().filter(|r| r.is_err()).count();
	assert_eq!(succeeded, 1, "exactly one of the two concurrent runs should proceed");
	assert_eq!(rejected, 1, "the other must be rejected, not queued or silently dropped");

	// The guard must release once the run finishes, so a later run_now for
	// the same config is not permanently locked out.
	let third = scheduler.run_now(config_id).await;
	assert!(third.is_ok(), "run_now must be usable again once the in-flight run has completed");
}

/// Two different [`SyncConfig`]s never contend with each other's
/// `active_runs` guard, even when triggered back to back.
#[test(tokio::test)]
async fn independent_configs_run_without_contending() {
	let ldap_cfg_a = ldap_config(LdapConfigId(Uuid::new_v4()));
	let ldap_cfg_b = ldap_config(LdapConfigId(Uuid::new_v4()));
	let config_a = sync_config(ldap_cfg_a.id, SyncFrequency::Manual);
	let config_b = sync_config(ldap_cfg_b.id, SyncFrequency::Manual);
	let (id_a, id_b) = (config_a.id, config_b.id);

	let repo = Arc::new(InMemoryConfigRepository::new(
		vec![ldap_cfg_a, ldap_cfg_b],
		vec![config_a, config_b],
	));
	let ldap_a = Arc::new(FakeLdap::new());
	let ldap_b = Arc::new(FakeLdap::new());
	let provider = Arc::new(FakeProvider::default());

	let scheduler_a = Arc::new(Scheduler::with_ldap_factory(
		Arc::clone(&repo) as Arc<dyn ConfigRepository>,
		Arc::new(FakeProviderClientFactory { provider: Arc::clone(&provider) }),
		Arc::new(FakeLdapClientFactory { ldap: ldap_a }),
	));
	let scheduler_b = Arc::new(Scheduler::with_ldap_factory(
		repo as Arc<dyn ConfigRepository>,
		Arc::new(FakeProviderClientFactory { provider }),
		Arc::new(FakeLdapClientFactory { ldap: ldap_b }),
	));

	let (a, b) = tokio::join!(scheduler_a.run_now(id_a), scheduler_b.run_now(id_b));
	assert!(a.expect("config a's run should succeed").success);
	assert!(b.expect("config b's run should succeed").success);
}

/// Covers the "mixed-format upstream ids" edge case: numeric and
/// non-numeric `ext_id`s from the same provider pull must not panic the
/// parent-before-child sort shortcut, even when that heuristic can't
/// actually establish a correct order across formats (numeric ids always
/// sort before non-numeric ones, regardless of value).
#[test(tokio::test)]
async fn mixed_ext_id_formats_do_not_panic_the_department_sort() {
	let config = sync_config(LdapConfigId(Uuid::new_v4()), SyncFrequency::Manual);
	let ldap_cfg = ldap_config(config.ldap_config_id);
	let ldap = FakeLdap::new();
	let provider = FakeProvider {
		departments: vec![
			UpstreamDepartment { ext_id: "root-eu".into(), name: "Europe".into(), parent_ext_id: None },
			UpstreamDepartment {
				ext_id: "42".into(),
				name: "Berlin".into(),
				parent_ext_id: Some("root-eu".into()),
			},
		],
		users: vec![],
	};
	let reconciler = Reconciler::new(config, ldap_cfg, Arc::new(provider));
	let repo = Arc::new(InMemoryConfigRepository::new(vec![], vec![]));
	let log = reconciler
		.sync(&ldap, repo as Arc<dyn ConfigRepository>)
		.await
		.expect("mixed ext_id formats should not abort the run");

	assert!(log.success);
	assert_eq!(log.departments_synced, 2);
	assert!(ldap.contains("ou=Europe,ou=departments,dc=example,dc=test"));
	// "42" sorts before "root-eu" under the numeric-first shortcut, so Berlin
	// is processed before its parent is known and lands at the base OU
	// rather than nested -- the sort is a same-provider heuristic, not a
	// real topological sort, and mixed formats are exactly where it can't
	// resolve nesting. What matters here is that it degrades to a flat
	// attachment instead of panicking or aborting the run.
	assert!(ldap.contains("ou=Berlin,ou=departments,dc=example,dc=test"));
}
