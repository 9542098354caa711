//! Periodic and on-demand trigger for sync runs.
//!
//! Grounded on `SyncScheduler` in `server/sync/sync_scheduler.py`: a 60-second
//! timer loop, per-`SyncConfig` cadence (`hourly`/`daily@01:00`/
//! `weekly-Monday@01:00`/`manual`=no job), and a 5-second startup delay
//! before the first schedule refresh so a config store that isn't ready yet
//! at process start doesn't take the process down with it.
//!
//! Two deliberate departures from that file, per the redesign this crate
//! implements: the scheduler is an ordinary struct constructed once and
//! handed to whoever owns the process, not a `__new__`-enforced singleton;
//! and [`Scheduler::run_now`] refuses to start a second concurrent run for a
//! `SyncConfig` that already has one in flight, which the Python original
//! has no guard against at all.

use std::{
	collections::HashSet,
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveTime, TimeZone};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
	ldap_client::{Ldap3Client, LdapClient},
	models::{LdapConfig, SyncConfig, SyncConfigId, SyncFrequency, SyncLog},
	providers::{DingTalkClient, FeiShuClient, ProviderClient, WeComClient},
	reconciler::Reconciler,
	repository::ConfigRepository,
};

/// How often the scheduler's timer task wakes up to check for due jobs.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// How long the scheduler waits after [`Scheduler::start`] before its first
/// attempt to read `SyncConfig`s from the repository.
const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// One config's next-due time, recomputed after every run.
#[derive(Debug, Clone, Copy)]
struct ScheduledJob {
	config_id: SyncConfigId,
	frequency: SyncFrequency,
	next_due: chrono::DateTime<Local>,
}

/// Builds the provider client a [`SyncConfig`] needs, from whatever
/// provider-specific credentials the surrounding application supplies.
///
/// Kept as a trait so tests can construct a [`Scheduler`] around fakes
/// without touching real provider credentials.
pub trait ProviderClientFactory: Send + Sync {
	/// Returns a fresh provider client for `config`.
	fn build(&self, config: &SyncConfig) -> anyhow::Result<Arc<dyn ProviderClient>>;
}

/// Constructs the three built-in provider clients from a
/// [`ConfigRepository`]-agnostic credential source.
///
/// Real deployments will usually implement their own
/// [`ProviderClientFactory`] that reads credentials out of the application's
/// own secret storage; this one is a convenience default wiring the three
/// concrete clients directly from `(WeCom|FeiShu|DingTalk)Config` values.
pub struct DefaultProviderClientFactory {
	/// WeCom credentials, keyed by [`SyncConfigId`].
	pub wecom: std::collections::HashMap<SyncConfigId, crate::providers::wecom::WeComConfig>,
	/// Feishu credentials, keyed by [`SyncConfigId`].
	pub feishu: std::collections::HashMap<SyncConfigId, crate::providers::feishu::FeiShuConfig>,
	/// DingTalk credentials, keyed by [`SyncConfigId`].
	pub dingtalk: std::collections::HashMap<SyncConfigId, crate::providers::dingtalk::DingTalkConfig>,
}

impl ProviderClientFactory for DefaultProviderClientFactory {
	fn build(&self, config: &SyncConfig) -> anyhow::Result<Arc<dyn ProviderClient>> {
		use crate::models::ProviderKind;
		match config.provider {
			ProviderKind::WeCom => {
				let creds = self
					.wecom
					.get(&config.id)
					.ok_or_else(|| anyhow::anyhow!("no WeCom credentials for {}", config.id))?;
				Ok(Arc::new(WeComClient::new(creds.clone())))
			}
			ProviderKind::Feishu => {
				let creds = self
					.feishu
					.get(&config.id)
					.ok_or_else(|| anyhow::anyhow!("no Feishu credentials for {}", config.id))?;
				Ok(Arc::new(FeiShuClient::new(creds.clone())))
			}
			ProviderKind::DingTalk => {
				let creds = self
					.dingtalk
					.get(&config.id)
					.ok_or_else(|| anyhow::anyhow!("no DingTalk credentials for {}", config.id))?;
				Ok(Arc::new(DingTalkClient::new(creds.clone())))
			}
		}
	}
}

/// Opens a session against the downstream LDAP directory for a run to use.
///
/// Kept as a trait, mirroring [`ProviderClientFactory`], so tests can drive
/// [`Scheduler`] against an in-memory fake directory instead of a real LDAP
/// server.
#[async_trait]
pub trait LdapClientFactory: Send + Sync {
	/// Connects and binds a session for `config`.
	async fn connect(&self, config: &LdapConfig) -> anyhow::Result<Box<dyn LdapClient>>;
}

/// Builds real [`Ldap3Client`] sessions. The default factory wired up by
/// [`crate::run`].
#[derive(Debug, Default)]
pub struct DefaultLdapClientFactory;

#[async_trait]
impl LdapClientFactory for DefaultLdapClientFactory {
	async fn connect(&self, config: &LdapConfig) -> anyhow::Result<Box<dyn LdapClient>> {
		Ok(Box::new(Ldap3Client::connect(config).await?))
	}
}

/// Owns the job table and drives both periodic and on-demand sync runs.
///
/// Constructed once per process and shared (typically behind an `Arc`)
/// between whatever starts the background timer and whatever exposes
/// `run_now` to an admin surface.
pub struct Scheduler {
	repo: Arc<dyn ConfigRepository>,
	providers: Arc<dyn ProviderClientFactory>,
	ldap: Arc<dyn LdapClientFactory>,
	jobs: Mutex<Vec<ScheduledJob>>,
	active_runs: Mutex<HashSet<SyncConfigId>>,
}

impl Scheduler {
	/// Creates a scheduler with no jobs yet; call [`Self::start`] to begin
	/// the timer loop.
	#[must_use]
	pub fn new(repo: Arc<dyn ConfigRepository>, providers: Arc<dyn ProviderClientFactory>) -> Self {
		Self::with_ldap_factory(repo, providers, Arc::new(DefaultLdapClientFactory))
	}

	/// Creates a scheduler with an explicit [`LdapClientFactory`], for tests
	/// that need to substitute a fake directory.
	#[must_use]
	pub fn with_ldap_factory(
		repo: Arc<dyn ConfigRepository>,
		providers: Arc<dyn ProviderClientFactory>,
		ldap: Arc<dyn LdapClientFactory>,
	) -> Self {
		Self { repo, providers, ldap, jobs: Mutex::new(Vec::new()), active_runs: Mutex::new(HashSet::new()) }
	}

	/// Spawns the background timer task. The first schedule refresh is
	/// deferred by [`STARTUP_DELAY`] to tolerate a config store that isn't
	/// ready yet immediately after process start.
	pub fn start(self: &Arc<Self>) {
		let scheduler = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(STARTUP_DELAY).await;
			if let Err(e) = scheduler.refresh().await {
				warn!(error = %e, "initial schedule refresh failed, will retry on next tick");
			}
			let mut interval = tokio::time::interval(TICK_INTERVAL);
			loop {
				interval.tick().await;
				scheduler.tick().await;
			}
		});
	}

	/// Recomputes the job table from the repository's enabled configs.
	///
	/// # Errors
	///
	/// Returns an error if the repository cannot be read; existing jobs are
	/// left untouched in that case.
	#[instrument(skip(self))]
	pub async fn refresh(&self) -> anyhow::Result<()> {
		let configs = self.repo.enabled_sync_configs().await?;
		let now = Local::now();
		let mut jobs = Vec::with_capacity(configs.len());
		for config in &configs {
			if let Some(next_due) = next_due_time(config.frequency, now) {
				jobs.push(ScheduledJob { config_id: config.id, frequency: config.frequency, next_due });
			}
		}
		info!(job_count = jobs.len(), "refreshed schedule");
		*self.jobs.lock().await = jobs;
		Ok(())
	}

	/// Checks the job table for due jobs and triggers each of them. Runs
	/// are fire-and-forget from the timer's perspective -- it doesn't await
	/// their completion, so one slow run never delays the next tick's other
	/// due jobs.
	async fn tick(self: &Arc<Self>) {
		let now = Local::now();
		let due: Vec<SyncConfigId> = {
			let mut jobs = self.jobs.lock().await;
			let due: Vec<SyncConfigId> = jobs.iter().filter(|j| j.next_due <= now).map(|j| j.config_id).collect();
			for job in jobs.iter_mut() {
				if job.next_due <= now {
					if let Some(next) = next_due_time(job.frequency, now) {
						job.next_due = next;
					}
				}
			}
			due
		};
		for config_id in due {
			let scheduler = Arc::clone(self);
			tokio::spawn(async move {
				if let Err(e) = scheduler.run_now(config_id).await {
					warn!(%config_id, error = %e, "scheduled run failed");
				}
			});
		}
	}

	/// Triggers an immediate run for `config_id`, unless one is already in
	/// flight for the same config.
	///
	/// # Errors
	///
	/// Returns an error if the config/LDAP config can't be loaded, the LDAP
	/// connection can't be established, or the provider client can't be
	/// built. Per-item reconciliation failures are captured in the returned
	/// [`SyncLog`], not as an `Err` here.
	#[instrument(skip(self))]
	pub async fn run_now(&self, config_id: SyncConfigId) -> anyhow::Result<SyncLog> {
		{
			let mut active = self.active_runs.lock().await;
			if !active.insert(config_id) {
				anyhow::bail!("a sync run for {config_id} is already in progress");
			}
		}

		let result = self.run_now_inner(config_id).await;

		self.active_runs.lock().await.remove(&config_id);
		result
	}

	async fn run_now_inner(&self, config_id: SyncConfigId) -> anyhow::Result<SyncLog> {
		let config = self.repo.sync_config(config_id).await?;
		let ldap_config = self.repo.ldap_config(config.ldap_config_id).await?;
		let provider = self.providers.build(&config)?;

		let ldap = self.ldap.connect(&ldap_config).await?;
		let reconciler = Reconciler::new(config, ldap_config, provider);
		let result = reconciler.sync(ldap.as_ref(), Arc::clone(&self.repo)).await;
		if let Err(e) = ldap.close().await {
			warn!(error = %e, "failed to cleanly close LDAP connection after sync run");
		}
		result
	}
}

/// Computes the next local time a [`SyncFrequency`] is due, given `now`.
/// Returns `None` for [`SyncFrequency::Manual`], which has no timer trigger.
fn next_due_time(
	frequency: SyncFrequency,
	now: chrono::DateTime<Local>,
) -> Option<chrono::DateTime<Local>> {
	match frequency {
		SyncFrequency::Manual => None,
		SyncFrequency::Hourly => Some(now + chrono::Duration::hours(1)),
		SyncFrequency::Daily => Some(next_daily_at(now, 1, 0)),
		SyncFrequency::Weekly => Some(next_weekly_at(now, chrono::Weekday::Mon, 1, 0)),
	}
}

fn next_daily_at(now: chrono::DateTime<Local>, hour: u32, minute: u32) -> chrono::DateTime<Local> {
	let today_at = now.date_naive().and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default());
	let today_at = Local
		.from_local_datetime(&today_at)
		.single()
		.unwrap_or_else(|| now + chrono::Duration::days(1));
	if today_at > now {
		today_at
	} else {
		today_at + chrono::Duration::days(1)
	}
}

fn next_weekly_at(
	now: chrono::DateTime<Local>,
	weekday: chrono::Weekday,
	hour: u32,
	minute: u32,
) -> chrono::DateTime<Local> {
	let mut candidate = next_daily_at(now, hour, minute);
	while candidate.weekday() != weekday {
		candidate += chrono::Duration::days(1);
	}
	candidate
}
