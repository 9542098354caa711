//! Per-run maps from upstream identity to LDAP DN.
//!
//! Grounded on `SyncService._get_existing_dept_map`/`_get_existing_user_map`
//! in `server/sync/sync_service.py`: both scan the directory once per run
//! for entries carrying the identity tag in `description`, then consult the
//! in-memory map for the rest of the run instead of re-searching per item.
//! There is deliberately no persistent id-to-DN store between runs; a
//! vanished or renamed identity tag just means the object looks new to the
//! next run.

use std::collections::HashMap;

use tracing::{instrument, warn};

use crate::{
	ldap_client::{LdapClient, LdapScope},
	models::ProviderKind,
};

/// What the index knows about a previously-synced department.
#[derive(Debug, Clone)]
pub struct DeptEntry {
	/// Current DN of the department.
	pub dn: String,
	/// Current `ou` value.
	pub name: String,
	/// Upstream id of the parent department, if any.
	pub parent_ext_id: Option<String>,
}

/// What the index knows about a previously-synced user.
#[derive(Debug, Clone)]
pub struct UserEntry {
	/// Current DN of the user.
	pub dn: String,
	/// Attributes relevant to diffing (`cn`, `mail`, `telephoneNumber`).
	pub attrs: HashMap<String, String>,
}

/// Maps upstream `ext_id`s to what's currently in LDAP, for one sync run.
///
/// Never persisted; rebuilt from scratch (via directory search) at the start
/// of every run and updated in place as the reconciler creates and moves
/// objects, so later lookups within the same run see prior decisions.
#[derive(Debug, Default)]
pub struct IdentityIndex {
	/// `ext_id` -> department entry.
	pub departments: HashMap<String, DeptEntry>,
	/// `ext_id` -> user entry.
	pub users: HashMap<String, UserEntry>,
}

/// Builds the `description` tag prefix a given provider uses to mark
/// department entries, e.g. `"企业微信部门ID: "`.
#[must_use]
pub fn department_tag_prefix(provider: ProviderKind) -> &'static str {
	match provider {
		ProviderKind::WeCom => "企业微信部门ID: ",
		ProviderKind::Feishu => "飞书部门ID: ",
		ProviderKind::DingTalk => "钉钉部门ID: ",
	}
}

/// Builds the `description` tag prefix a given provider uses to mark user
/// entries, e.g. `"企业微信用户，用户ID："`.
#[must_use]
pub fn user_tag_prefix(provider: ProviderKind) -> &'static str {
	match provider {
		ProviderKind::WeCom => "企业微信用户，用户ID：",
		ProviderKind::Feishu => "飞书用户，用户ID：",
		ProviderKind::DingTalk => "钉钉用户，用户ID：",
	}
}

impl IdentityIndex {
	/// Scans `base_dn` for previously-synced departments and users tagged
	/// for `provider`, populating both maps.
	#[instrument(skip(ldap), fields(base_dn))]
	pub async fn build(
		ldap: &dyn LdapClient,
		base_dn: &str,
		provider: ProviderKind,
	) -> anyhow::Result<Self> {
		let dept_prefix = department_tag_prefix(provider);
		let dept_hits = ldap
			.search_by_filter(
				base_dn,
				&format!("(&(objectClass=organizationalUnit)(description=*{dept_prefix}*))"),
				LdapScope::Subtree,
				&["dn", "ou", "description"],
			)
			.await?;

		let mut departments = HashMap::new();
		let mut dn_to_ext_id = HashMap::new();
		for entry in &dept_hits {
			let Some(ext_id) = extract_tag(&entry.attrs, "description", dept_prefix) else {
				continue;
			};
			dn_to_ext_id.insert(entry.dn.clone(), ext_id.clone());
			let name = entry.attrs.get("ou").and_then(|v| v.first()).cloned().unwrap_or_default();
			departments.insert(ext_id, (entry.dn.clone(), name));
		}
		let departments = departments
			.into_iter()
			.map(|(ext_id, (dn, name))| {
				let parent_ext_id = parent_dn(&dn).and_then(|p| dn_to_ext_id.get(&p).cloned());
				(ext_id, DeptEntry { dn, name, parent_ext_id })
			})
			.collect();

		// No `objectClass` constraint here: the cascading object-class
		// strategy in `ldap_client::add_user_cascading` can create a user
		// under a schema that lacks `person` entirely (e.g. `account`,
		// `posixAccount`), and the identity tag in `description` is only used
		// to narrow the search; `ext_id` itself is resolved from the
		// userid/employeeNumber/uid fallback below.
		let user_prefix = user_tag_prefix(provider);
		let user_hits = ldap
			.search_by_filter(
				base_dn,
				&format!("(description=*{user_prefix}*)"),
				LdapScope::Subtree,
				&["dn", "cn", "mail", "telephoneNumber", "description", "userid", "employeeNumber", "uid"],
			)
			.await?;

		let mut users = HashMap::new();
		for entry in &user_hits {
			let Some(ext_id) = resolve_user_ext_id(&entry.attrs, provider) else {
				warn!(dn = %entry.dn, "could not resolve ext_id for existing user entry");
				continue;
			};
			let mut attrs = HashMap::new();
			for key in ["cn", "mail", "telephoneNumber"] {
				if let Some(value) = entry.attrs.get(key).and_then(|v| v.first()) {
					attrs.insert(key.to_owned(), value.clone());
				}
			}
			users.insert(ext_id, UserEntry { dn: entry.dn.clone(), attrs });
		}

		Ok(Self { departments, users })
	}
}

/// Extracts the `ext_id` suffix from a `description` value that starts with
/// `prefix`, trimming any other description content that might share the
/// attribute (the original tolerates a tag anywhere in the value via a
/// substring filter; here we require it to start the value, which is all
/// this crate ever writes).
fn extract_tag(
	attrs: &HashMap<String, Vec<String>>,
	attr: &str,
	prefix: &str,
) -> Option<String> {
	attrs.get(attr)?.iter().find_map(|v| v.strip_prefix(prefix)).map(ToOwned::to_owned)
}

/// Resolves an existing user entry's `ext_id` the way
/// `_get_existing_user_map` does: try `userid`, then `employeeNumber`, then
/// `uid` with an optional leading `<provider>_` segment stripped. An empty
/// value at any step is treated the same as a missing one, matching the
/// falsy checks in the original.
fn resolve_user_ext_id(attrs: &HashMap<String, Vec<String>>, provider: ProviderKind) -> Option<String> {
	let first_non_empty = |key: &str| {
		attrs.get(key).and_then(|v| v.first()).map(String::as_str).filter(|v| !v.is_empty())
	};

	if let Some(userid) = first_non_empty("userid") {
		return Some(userid.to_owned());
	}
	if let Some(employee_number) = first_non_empty("employeeNumber") {
		return Some(employee_number.to_owned());
	}
	let uid = first_non_empty("uid")?;
	let provider_prefix = format!("{provider}_");
	Some(uid.strip_prefix(provider_prefix.as_str()).unwrap_or(uid).to_owned())
}

/// Returns the parent DN (everything after the first RDN component).
fn parent_dn(dn: &str) -> Option<String> {
	dn.find(',').map(|idx| dn[idx + 1..].to_owned())
}
