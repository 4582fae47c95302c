//! Daily/monthly request accounting against client-side limits.

use crate::{
    config::{storage_keys, DAILY_REQUEST_LIMIT, MONTHLY_REQUEST_LIMIT},
    error::StorageError,
    models::{RequestPermission, UsageRecord},
    store::{get_json, set_json, KeyValueStore, Lookup},
};
use chrono::{Local, NaiveDate};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Source of "today" in the device-local timezone.
pub type Clock = fn() -> NaiveDate;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageLimits {
    pub daily: u64,
    pub monthly: u64,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            daily: DAILY_REQUEST_LIMIT,
            monthly: MONTHLY_REQUEST_LIMIT,
        }
    }
}

pub struct UsageTracker {
    store: Arc<dyn KeyValueStore>,
    limits: UsageLimits,
    clock: Clock,
    // Serialises read-modify-write of the persisted record.
    guard: Mutex<()>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, UsageLimits::default(), local_today)
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, limits: UsageLimits, clock: Clock) -> Self {
        Self {
            store,
            limits,
            clock,
            guard: Mutex::new(()),
        }
    }

    pub fn limits(&self) -> UsageLimits {
        self.limits
    }

    fn today(&self) -> String {
        (self.clock)().format(DATE_FORMAT).to_string()
    }

    pub async fn get_usage(&self) -> Result<UsageRecord, StorageError> {
        let _lock = self.guard.lock().await;
        self.load_current().await
    }

    /// Caller must hold `guard`.
    async fn load_current(&self) -> Result<UsageRecord, StorageError> {
        let today = self.today();
        let mut usage = match get_json::<UsageRecord>(self.store.as_ref(), storage_keys::API_USAGE)
            .await
        {
            Lookup::Found(usage) => usage,
            Lookup::Absent => {
                let usage = UsageRecord::zeroed(&today);
                self.save(&usage).await?;
                return Ok(usage);
            }
            Lookup::Corrupt(reason) | Lookup::Unreadable(reason) => {
                log::warn!("[usage] Resetting unreadable usage record: {}", reason);
                let usage = UsageRecord::zeroed(&today);
                self.save(&usage).await?;
                return Ok(usage);
            }
        };

        if usage.last_reset_date != today {
            log::info!(
                "[usage] New day {} (was {}), resetting daily count {}",
                today,
                usage.last_reset_date,
                usage.daily_count
            );
            usage.daily_count = 0;
            usage.last_reset_date = today;
            self.save(&usage).await?;
        }
        Ok(usage)
    }

    /// Advisory pre-check; a storage failure denies the request.
    pub async fn can_make_request(&self) -> RequestPermission {
        let usage = match self.get_usage().await {
            Ok(usage) => usage,
            Err(error) => {
                log::error!("[usage] Rate limit check failed: {}", error);
                return RequestPermission::denied("Rate limiting check failed");
            }
        };
        self.permission_for(&usage)
    }

    pub fn permission_for(&self, usage: &UsageRecord) -> RequestPermission {
        if usage.daily_count >= self.limits.daily {
            return RequestPermission::denied("Daily API usage limit exceeded");
        }
        if usage.monthly_count >= self.limits.monthly {
            return RequestPermission::denied("Monthly API usage limit exceeded");
        }
        RequestPermission::allowed()
    }

    /// Records one terminal outcome. Never call for intermediate retries.
    pub async fn increment_usage(&self, success: bool) -> Result<UsageRecord, StorageError> {
        let _lock = self.guard.lock().await;
        let mut usage = self.load_current().await?;
        usage.daily_count += 1;
        usage.monthly_count += 1;
        usage.total_requests += 1;
        if success {
            usage.successful_requests += 1;
        } else {
            usage.failed_requests += 1;
        }
        self.save(&usage).await?;
        Ok(usage)
    }

    pub async fn reset_monthly_usage(&self) -> Result<UsageRecord, StorageError> {
        let _lock = self.guard.lock().await;
        let mut usage = self.load_current().await?;
        usage.monthly_count = 0;
        self.save(&usage).await?;
        Ok(usage)
    }

    async fn save(&self, usage: &UsageRecord) -> Result<(), StorageError> {
        set_json(self.store.as_ref(), storage_keys::API_USAGE, usage).await
    }
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}
