//! In-memory fakes shared by this crate's own unit tests and its `tests/`
//! integration suite.
//!
//! Not part of the crate's stable public API (see the `#[doc(hidden)]` on
//! its `mod` declaration in `lib.rs`). Grounded on the trait-object fakes the
//! `proxmox-ldap`/`proxmox-backup` realm sync jobs use in their own unit
//! tests to exercise sync logic without a live LDAP server.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs, clippy::missing_docs_in_private_items)]

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
	ldap_client::{AttrMap, LdapClient, LdapEntry, LdapScope},
	models::SyncConfig,
	providers::{ProviderClient, ProviderFetch, UpstreamDepartment, UpstreamUser},
	scheduler::{LdapClientFactory, ProviderClientFactory},
};

#[derive(Debug, Clone)]
struct FakeEntry {
	object_classes: Vec<String>,
	attrs: HashMap<String, Vec<String>>,
}

/// A minimal in-memory LDAP directory, enough to exercise
/// [`crate::reconciler::Reconciler`] and the default `move_object`
/// three-tier fallback without a real server.
#[derive(Debug, Default)]
pub struct FakeLdap {
	entries: Mutex<HashMap<String, FakeEntry>>,
}

impl FakeLdap {
	/// Builds an empty directory.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds an entry directly, bypassing `add`, for test setup.
	pub fn seed(&self, dn: &str, object_classes: &[&str], attrs: &[(&str, &str)]) {
		let mut map: HashMap<String, Vec<String>> = HashMap::new();
		for (k, v) in attrs {
			map.entry((*k).to_owned()).or_default().push((*v).to_owned());
		}
		self.entries.lock().unwrap().insert(
			dn.to_owned(),
			FakeEntry {
				object_classes: object_classes.iter().map(|s| (*s).to_owned()).collect(),
				attrs: map,
			},
		);
	}

	/// Returns the attribute value currently stored at `dn`, if any.
	#[must_use]
	pub fn attr(&self, dn: &str, attr: &str) -> Option<String> {
		self.entries.lock().unwrap().get(dn)?.attrs.get(attr)?.first().cloned()
	}

	/// Returns whether an entry exists at exactly this DN.
	#[must_use]
	pub fn contains(&self, dn: &str) -> bool {
		self.entries.lock().unwrap().contains_key(dn)
	}

	/// Number of entries currently stored.
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.lock().unwrap().len()
	}

	/// Returns the object classes currently stored at `dn`, if any.
	#[must_use]
	pub fn object_classes(&self, dn: &str) -> Option<Vec<String>> {
		Some(self.entries.lock().unwrap().get(dn)?.object_classes.clone())
	}
}

fn split_dn(dn: &str) -> Option<(String, String)> {
	let idx = dn.find(',')?;
	Some((dn[..idx].to_owned(), dn[idx + 1..].to_owned()))
}

/// Evaluates the handful of filter shapes this crate ever generates:
/// `(objectClass=*)`, `(&(a=b)(c=*d*))`, and single-clause equality.
fn matches(entry: &FakeEntry, filter: &str) -> bool {
	if filter == "(objectClass=*)" {
		return true;
	}
	let inner = filter.strip_prefix('(').and_then(|f| f.strip_suffix(')')).unwrap_or(filter);
	if let Some(rest) = inner.strip_prefix('&') {
		return split_clauses(rest).iter().all(|clause| matches_clause(entry, clause));
	}
	matches_clause(entry, inner)
}

fn split_clauses(s: &str) -> Vec<&str> {
	let mut clauses = Vec::new();
	let mut depth = 0;
	let mut start = None;
	for (i, c) in s.char_indices() {
		match c {
			'(' => {
				if depth == 0 {
					start = Some(i + 1);
				}
				depth += 1;
			}
			')' => {
				depth -= 1;
				if depth == 0 {
					if let Some(start) = start.take() {
						clauses.push(&s[start..i]);
					}
				}
			}
			_ => {}
		}
	}
	clauses
}

fn matches_clause(entry: &FakeEntry, clause: &str) -> bool {
	let Some((attr, value)) = clause.split_once('=') else { return false };
	if attr.eq_ignore_ascii_case("objectClass") {
		if value == "*" {
			return true;
		}
		return entry.object_classes.iter().any(|c| c.eq_ignore_ascii_case(value));
	}
	let Some(values) = entry.attrs.get_case_insensitive(attr) else { return false };
	if value == "*" {
		return !values.is_empty();
	}
	if let Some(needle) = value.strip_prefix('*').and_then(|v| v.strip_suffix('*')) {
		return values.iter().any(|v| v.contains(needle));
	}
	values.iter().any(|v| v == value)
}

trait CaseInsensitiveGet {
	fn get_case_insensitive(&self, key: &str) -> Option<&Vec<String>>;
}

impl CaseInsensitiveGet for HashMap<String, Vec<String>> {
	fn get_case_insensitive(&self, key: &str) -> Option<&Vec<String>> {
		self.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v)
	}
}

#[async_trait]
impl LdapClient for FakeLdap {
	async fn exists(&self, dn: &str) -> anyhow::Result<bool> {
		Ok(self.entries.lock().unwrap().contains_key(dn))
	}

	async fn add(&self, dn: &str, object_classes: &[&str], attrs: &AttrMap) -> anyhow::Result<()> {
		let mut entries = self.entries.lock().unwrap();
		if entries.contains_key(dn) {
			anyhow::bail!("entry already exists: {dn}");
		}
		let attrs = attrs.iter().map(|(k, v)| (k.clone(), v.iter().cloned().collect())).collect();
		entries.insert(
			dn.to_owned(),
			FakeEntry { object_classes: object_classes.iter().map(|s| (*s).to_owned()).collect(), attrs },
		);
		Ok(())
	}

	async fn modify(&self, dn: &str, attrs: &AttrMap) -> anyhow::Result<()> {
		let mut entries = self.entries.lock().unwrap();
		let entry = entries.get_mut(dn).ok_or_else(|| anyhow::anyhow!("no such entry: {dn}"))?;
		for (name, values) in attrs {
			entry.attrs.insert(name.clone(), values.iter().cloned().collect());
		}
		Ok(())
	}

	async fn modify_dn(
		&self,
		old_dn: &str,
		new_rdn: &str,
		new_superior: Option<&str>,
	) -> anyhow::Result<()> {
		let mut entries = self.entries.lock().unwrap();
		let entry = entries.remove(old_dn).ok_or_else(|| anyhow::anyhow!("no such entry: {old_dn}"))?;
		let (_, old_parent) = split_dn(old_dn).ok_or_else(|| anyhow::anyhow!("malformed dn"))?;
		let parent = new_superior.map_or(old_parent, ToOwned::to_owned);
		let new_dn = format!("{new_rdn},{parent}");
		if entries.contains_key(&new_dn) {
			entries.insert(old_dn.to_owned(), entry);
			anyhow::bail!("target already exists: {new_dn}");
		}
		entries.insert(new_dn, entry);
		Ok(())
	}

	async fn delete(&self, dn: &str) -> anyhow::Result<()> {
		self.entries
			.lock()
			.unwrap()
			.remove(dn)
			.map(|_| ())
			.ok_or_else(|| anyhow::anyhow!("no such entry: {dn}"))
	}

	async fn search_by_filter(
		&self,
		base: &str,
		filter: &str,
		scope: LdapScope,
		_attrs: &[&str],
	) -> anyhow::Result<Vec<LdapEntry>> {
		let entries = self.entries.lock().unwrap();
		let mut hits = Vec::new();
		for (dn, entry) in entries.iter() {
			let in_scope = match scope {
				LdapScope::Base => dn == base,
				LdapScope::OneLevel => split_dn(dn).is_some_and(|(_, parent)| parent == base),
				LdapScope::Subtree => dn == base || dn.ends_with(&format!(",{base}")),
			};
			if in_scope && matches(entry, filter) {
				let mut attrs = entry.attrs.clone();
				attrs.insert("objectClass".to_owned(), entry.object_classes.clone());
				hits.push(LdapEntry { dn: dn.clone(), attrs });
			}
		}
		Ok(hits)
	}
}

/// A provider client returning a fixed, pre-baked set of departments/users.
#[derive(Debug, Default)]
pub struct FakeProvider {
	/// Departments to return from [`ProviderClient::get_departments`].
	pub departments: Vec<UpstreamDepartment>,
	/// Users to return from [`ProviderClient::get_users`].
	pub users: Vec<UpstreamUser>,
}

#[async_trait]
impl ProviderClient for FakeProvider {
	async fn get_departments(&self) -> ProviderFetch<UpstreamDepartment> {
		ProviderFetch::Ok(self.departments.clone())
	}

	async fn get_users(&self) -> ProviderFetch<UpstreamUser> {
		ProviderFetch::Ok(self.users.clone())
	}
}

/// A thin [`LdapClient`] that forwards every call to a shared, cloned
/// [`FakeLdap`], so a [`Scheduler`](crate::scheduler::Scheduler) test can
/// open the "same" fake directory across more than one run, the way
/// [`crate::scheduler::DefaultLdapClientFactory`] opens the same real server
/// across runs.
#[derive(Debug, Clone)]
pub struct SharedFakeLdap(pub Arc<FakeLdap>);

#[async_trait]
impl LdapClient for SharedFakeLdap {
	async fn exists(&self, dn: &str) -> anyhow::Result<bool> {
		self.0.exists(dn).await
	}

	async fn add(&self, dn: &str, object_classes: &[&str], attrs: &AttrMap) -> anyhow::Result<()> {
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
		self.0.modify_dn(old_dn, new_rdn, new_superior).await
	}

	async fn delete(&self, dn: &str) -> anyhow::Result<()> {
		self.0.delete(dn).await
	}

	async fn search_by_filter(
		&self,
		base: &str,
		filter: &str,
		scope: LdapScope,
		attrs: &[&str],
	) -> anyhow::Result<Vec<LdapEntry>> {
		self.0.search_by_filter(base, filter, scope, attrs).await
	}
}

/// An [`LdapClientFactory`] that always hands out the same shared
/// [`FakeLdap`] directory, regardless of which [`crate::models::LdapConfig`]
/// is passed in.
#[derive(Debug, Clone)]
pub struct FakeLdapClientFactory {
	/// The directory every `connect` call returns a handle to.
	pub ldap: Arc<FakeLdap>,
}

#[async_trait]
impl LdapClientFactory for FakeLdapClientFactory {
	async fn connect(
		&self,
		_config: &crate::models::LdapConfig,
	) -> anyhow::Result<Box<dyn LdapClient>> {
		Ok(Box::new(SharedFakeLdap(Arc::clone(&self.ldap))))
	}
}

/// A [`ProviderClientFactory`] that always hands out the same pre-baked
/// [`FakeProvider`], regardless of which [`SyncConfig`] is passed in.
#[derive(Debug, Clone)]
pub struct FakeProviderClientFactory {
	/// The department/user snapshot every `build` call returns a client
	/// over.
	pub provider: Arc<FakeProvider>,
}

impl ProviderClientFactory for FakeProviderClientFactory {
	fn build(&self, _config: &SyncConfig) -> anyhow::Result<Arc<dyn ProviderClient>> {
		Ok(Arc::clone(&self.provider) as Arc<dyn ProviderClient>)
	}
}
