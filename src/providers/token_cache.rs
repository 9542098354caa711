//! Shared access-token caching for the three provider clients.
//!
//! Each provider's `_get_access_token` in `server/utils/*_api.py` caches a
//! bearer token with some expiry margin; this is the common shape factored
//! out, refreshed lazily on first use after expiry with a five-minute safety
//! margin (matching `feishu_api.py`'s `token_expire_time = time.time() +
//! expire - 300` and `dingtalk_api.py`'s identical pattern).

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// The margin subtracted from a provider-reported token lifetime before
/// treating it as expired, so a token is never used right up against the
/// edge of its real expiry.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CachedToken {
	value: String,
	expires_at: Instant,
}

/// A lazily-refreshed bearer token cache, one per provider client instance.
#[derive(Debug, Default)]
pub struct TokenCache {
	inner: Mutex<Option<CachedToken>>,
}

impl TokenCache {
	/// Returns a cached token if still valid, otherwise calls `fetch` to get
	/// a fresh `(token, lifetime)` pair and caches it.
	///
	/// # Errors
	///
	/// Returns whatever error `fetch` returns.
	pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> anyhow::Result<String>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = anyhow::Result<(String, Duration)>>,
	{
		let mut guard = self.inner.lock().await;
		if let Some(cached) = guard.as_ref() {
			if cached.expires_at > Instant::now() {
				return Ok(cached.value.clone());
			}
		}
		let (value, lifetime) = fetch().await?;
		let safe_lifetime = lifetime.saturating_sub(EXPIRY_SAFETY_MARGIN);
		*guard = Some(CachedToken { value: value.clone(), expires_at: Instant::now() + safe_lifetime });
		Ok(value)
	}
}
