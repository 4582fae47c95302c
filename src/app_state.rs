use crate::{
    analysis::StoneAnalysisClient,
    auth::LocalAuth,
    config::{ProviderConfig, SettingsManager},
    error::{AuthError, StorageError},
    library::StoneShelf,
    models::{
        AnalysisRequest, AnalysisResult, ApiResponse, ApiStats, ClientSettings,
        ClientSettingsPatch, RequestPermission,
    },
    provider::{CompletionProvider, OpenAiProvider},
    store::{KeyValueStore, SqliteStore},
    usage::UsageTracker,
};
use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};

/// Everything a host needs, wired over one store.
pub struct AppState {
    pub store: Arc<dyn KeyValueStore>,
    pub usage: Arc<UsageTracker>,
    pub settings: Arc<SettingsManager>,
    pub client: StoneAnalysisClient,
    pub auth: LocalAuth,
    pub favorites: StoneShelf,
    pub collection: StoneShelf,
}

impl AppState {
    /// Opens the on-disk store under `data_dir` and loads the saved API key.
    pub async fn initialize(data_dir: PathBuf, config: ProviderConfig) -> Result<Self> {
        let store = SqliteStore::open(data_dir.clone())
            .await
            .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
        let provider = OpenAiProvider::new(&config.base_url)?;
        let state = Self::with_parts(Arc::new(store), Arc::new(provider), config);
        let has_key = state.client.load_api_key().await;
        log::info!(
            "[app] Ready (data dir {}, API key {})",
            data_dir.display(),
            if has_key { "set" } else { "missing" }
        );
        Ok(state)
    }

    /// Must be called inside a tokio runtime.
    pub fn with_parts(
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn CompletionProvider>,
        config: ProviderConfig,
    ) -> Self {
        let usage = Arc::new(UsageTracker::new(store.clone()));
        let settings = Arc::new(SettingsManager::new(store.clone()));
        let client = StoneAnalysisClient::new(
            provider,
            store.clone(),
            usage.clone(),
            settings.clone(),
            config,
        );
        Self {
            auth: LocalAuth::new(store.clone()),
            favorites: StoneShelf::favorites(store.clone()),
            collection: StoneShelf::collection(store.clone()),
            store,
            usage,
            settings,
            client,
        }
    }

    pub async fn is_api_key_set(&self) -> bool {
        self.client.is_api_key_set().await
    }

    pub async fn set_api_key(&self, key: &str) -> Result<(), StorageError> {
        self.client.set_api_key(key).await
    }

    pub async fn remove_api_key(&self) -> Result<(), StorageError> {
        self.client.remove_api_key().await
    }

    pub async fn validate_api_key(&self, key: Option<&str>) -> bool {
        self.client.validate_api_key(key).await
    }

    pub async fn analyze_stone(&self, request: AnalysisRequest) -> ApiResponse<AnalysisResult> {
        self.client.analyze(request).await
    }

    pub async fn get_api_stats(&self) -> ApiStats {
        self.client.get_api_stats().await
    }

    pub async fn can_make_request(&self) -> RequestPermission {
        self.client.can_make_request().await
    }

    pub async fn get_settings(&self) -> ClientSettings {
        self.settings.get().await
    }

    pub async fn update_settings(
        &self,
        patch: &ClientSettingsPatch,
    ) -> Result<ClientSettings, StorageError> {
        self.settings.update(patch).await
    }

    pub async fn reset_settings(&self) -> Result<(), StorageError> {
        self.settings.reset().await
    }

    /// Wipes storage and forgets the cached API key.
    pub async fn delete_account(&self) -> Result<(), AuthError> {
        self.auth.delete_account().await?;
        self.client.forget_cached_key();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::tests::{completion, ScriptedProvider},
        models::{AnalysisType, ImageFormat, StoneDraft},
        store::MemoryStore,
    };

    const CITRINE: &str = r#"{"stoneName":"Citrine","confidence":81,"properties":{"hardness":7,"color":"Yellow, Orange","category":"Quartz","origin":"Brazil"},"description":"Golden quartz."}"#;

    #[tokio::test(start_paused = true)]
    async fn key_round_trip_through_state() {
        let state = AppState::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedProvider::default()),
            ProviderConfig::default(),
        );
        assert!(!state.is_api_key_set().await);
        state.set_api_key("  sk-test  ").await.unwrap();
        assert!(state.is_api_key_set().await);
        state.remove_api_key().await.unwrap();
        assert!(!state.is_api_key_set().await);
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_result_can_be_saved_to_collection() {
        let state = AppState::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedProvider::replying(vec![Ok(completion(CITRINE))])),
            ProviderConfig::default(),
        );
        state.set_api_key("sk-test").await.unwrap();
        let response = state
            .analyze_stone(AnalysisRequest::new(
                "aGVsbG8=".to_string(),
                ImageFormat::Png,
                AnalysisType::Identification,
            ))
            .await;
        let result = response.data.unwrap();

        let draft: StoneDraft = result.to_stone_draft();
        let stone = state.collection.add_custom(draft).await.unwrap();
        assert_eq!(stone.name, "Citrine");
        assert_eq!(stone.color, vec!["Yellow".to_string(), "Orange".to_string()]);
        assert_eq!(state.collection.count().await, 1);
        assert_eq!(state.get_api_stats().await.successful_requests, 1);
    }

    #[tokio::test]
    async fn delete_account_forgets_key_and_data() {
        let state = AppState::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedProvider::default()),
            ProviderConfig::default(),
        );
        state.set_api_key("sk-test").await.unwrap();
        state
            .auth
            .register("ada@example.com", "secret1", "Ada")
            .await
            .unwrap();
        state.delete_account().await.unwrap();
        assert!(!state.is_api_key_set().await);
        assert!(state.auth.current_user().await.is_none());
    }

    #[tokio::test]
    async fn initialize_reloads_persisted_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProviderConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ProviderConfig::default()
        };
        {
            let state = AppState::initialize(dir.path().to_path_buf(), config.clone())
                .await
                .unwrap();
            state.set_api_key("sk-disk").await.unwrap();
        }
        let state = AppState::initialize(dir.path().to_path_buf(), config)
            .await
            .unwrap();
        assert!(state.is_api_key_set().await);
        assert_eq!(state.get_api_stats().await.total_requests, 0);
    }
}
