//! Provider defaults, storage keys and the persisted client settings.

use crate::{
    error::StorageError,
    models::{ClientSettings, ClientSettingsPatch},
    store::{get_json, set_json, KeyValueStore, Lookup},
};
use std::{path::PathBuf, sync::Arc, time::Duration};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const RETRY_BASE_DELAY_MS: u64 = 1000;
pub const QUEUE_GAP_MS: u64 = 100;
pub const DAILY_REQUEST_LIMIT: u64 = 100;
pub const MONTHLY_REQUEST_LIMIT: u64 = 1000;
pub const MAX_IMAGE_BYTES: u64 = 4 * 1024 * 1024;
pub const DATA_DIR_NAME: &str = "crystal-guide";

pub mod storage_keys {
    pub const API_KEY: &str = "crystal_guide.api_key";
    pub const API_USAGE: &str = "crystal_guide.api_usage";
    pub const API_SETTINGS: &str = "crystal_guide.api_settings";
    pub const USER_SESSION: &str = "crystal_guide.user_session";
    pub const USER_ACCOUNTS: &str = "crystal_guide.user_accounts";
    pub const FAVORITES: &str = "crystal_guide.favorites";
    pub const COLLECTION: &str = "crystal_guide.collection";
}

/// Static provider parameters. The host may override them at startup.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry_base_delay: Duration,
    pub queue_gap: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            queue_gap: Duration::from_millis(QUEUE_GAP_MS),
        }
    }
}

/// `<local data dir>/crystal-guide`, falling back to home and then the cwd.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

/// Reads and writes [`ClientSettings`] as a single JSON blob.
pub struct SettingsManager {
    store: Arc<dyn KeyValueStore>,
}

impl SettingsManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Stored values merged over the defaults. Unreadable blobs yield defaults.
    pub async fn get(&self) -> ClientSettings {
        match get_json::<ClientSettingsPatch>(self.store.as_ref(), storage_keys::API_SETTINGS).await
        {
            Lookup::Found(stored) => ClientSettings::default().merged(&stored),
            Lookup::Absent => ClientSettings::default(),
            Lookup::Corrupt(reason) | Lookup::Unreadable(reason) => {
                log::warn!("[settings] Falling back to defaults: {}", reason);
                ClientSettings::default()
            }
        }
    }

    pub async fn update(&self, patch: &ClientSettingsPatch) -> Result<ClientSettings, StorageError> {
        let mut merged = self.get().await.merged(patch);
        merged.max_retries = merged.max_retries.clamp(1, 10);
        merged.timeout_ms = merged.timeout_ms.clamp(1000, 120_000);
        set_json(self.store.as_ref(), storage_keys::API_SETTINGS, &merged).await?;
        Ok(merged)
    }

    pub async fn reset(&self) -> Result<(), StorageError> {
        self.store.remove(storage_keys::API_SETTINGS).await
    }
}
