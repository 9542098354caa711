//! Error taxonomy for the reconciliation engine.
//!
//! Call sites mostly work in terms of `anyhow::Result`; this module exists so
//! that the handful of error kinds the reconciler needs to distinguish
//! between (to decide whether to abort a run or merely log and continue) are
//! typed rather than string-matched.

use thiserror::Error;

/// Errors the engine needs to branch on.
///
/// Everything else is passed around as `anyhow::Error` with `.context(...)`
/// call sites; this enum only exists for the handful of cases callers need
/// to distinguish programmatically.
#[derive(Debug, Error)]
pub enum EngineError {
	/// A `SyncConfig`/`LdapConfig` failed validation or could not be loaded.
	/// Aborts the run before any LDAP connection is attempted.
	#[error("configuration error: {0}")]
	Config(String),

	/// Failure to reach an upstream provider or the LDAP server. Aborts the
	/// run; partial results from before the failure are not rolled back.
	#[error("transport error: {0}")]
	Transport(String),

	/// A single department or user failed to reconcile (schema mismatch,
	/// unresolved parent, LDAP constraint violation). Recorded as an
	/// `(object_type, Error)` detail row; the run continues with the next
	/// item.
	#[error("item error for {object_id}: {message}")]
	Item {
		/// The upstream `ext_id` of the offending department or user.
		object_id: String,
		/// Human-readable description of the failure.
		message: String,
	},

	/// An upstream record could not be normalized into `UpstreamDepartment`/
	/// `UpstreamUser` (missing required field, unparseable value).
	#[error("schema error: {0}")]
	Schema(String),

	/// All cascading `objectClass` combinations were exhausted when
	/// creating an LDAP object.
	#[error("LDAP schema exhausted for {dn}: {attempts} attempts failed")]
	SchemaExhausted {
		/// The DN the engine attempted to create.
		dn: String,
		/// Number of `objectClass` combinations attempted.
		attempts: usize,
	},

	/// A caller-programming error: an invariant the engine relies on was
	/// violated (e.g. a `move_object` call with matching old/new DNs).
	#[error("logic error: {0}")]
	Logic(String),
}
