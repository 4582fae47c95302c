//! Stone identification against an OpenAI-compatible vision endpoint.

use crate::{
    config::{storage_keys, ProviderConfig, SettingsManager, MAX_IMAGE_BYTES},
    crypto,
    error::{AnalysisError, StorageError, TransportError},
    models::{
        AnalysisRequest, AnalysisResult, AnalysisType, ApiResponse, ApiStats, ImageFormat,
        RequestPermission,
    },
    provider::CompletionProvider,
    queue::RequestQueue,
    retry::{with_retry, RequestIds, RetryPolicy},
    store::{get_json, set_json, KeyValueStore, Lookup},
    usage::UsageTracker,
};
use regex::Regex;
use serde_json::{json, Value};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};
use zeroize::Zeroize;

const CHAT_COMPLETIONS: &str = "/chat/completions";
const MODELS: &str = "/models";

const BASE_PROMPT: &str = r#"
Analyze this stone/crystal image and provide detailed information in JSON format.

Please identify:
1. Stone name and type
2. Physical properties (hardness, color, category, origin)
3. Healing and metaphysical properties
4. Confidence level (0-100)
5. Alternative possibilities if uncertain

Return response in this exact JSON format:
{
  "stoneName": "string",
  "confidence": number,
  "properties": {
    "hardness": number,
    "color": "string",
    "category": "string",
    "origin": "string",
    "chakra": "string",
    "healingProperties": ["string"],
    "metaphysicalProperties": ["string"]
  },
  "description": "string",
  "alternativePossibilities": [
    {
      "name": "string",
      "confidence": number
    }
  ]
}
"#;

pub fn build_prompt(analysis_type: AnalysisType) -> String {
    let focus = match analysis_type {
        AnalysisType::Identification => {
            "Focus primarily on stone identification and basic properties."
        }
        AnalysisType::Properties => "Focus on detailed healing and metaphysical properties.",
        AnalysisType::Full => "Provide comprehensive analysis including all aspects.",
    };
    format!("{BASE_PROMPT}\n{focus}")
}

pub fn build_request_body(config: &ProviderConfig, request: &AnalysisRequest) -> Value {
    json!({
        "model": config.model,
        "messages": [
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": build_prompt(request.analysis_type()) },
                    { "type": "image_url", "image_url": { "url": request.data_uri() } }
                ]
            }
        ],
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
    })
}

fn json_object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)\{.*\}").ok())
        .as_ref()
}

/// First `{` through last `}` of a free-text reply.
pub fn extract_json_object(content: &str) -> Option<&str> {
    json_object_pattern()?
        .find(content)
        .map(|found| found.as_str())
}

/// Pulls an [`AnalysisResult`] out of a chat-completion response.
pub fn parse_analysis_response(response: &Value) -> Result<AnalysisResult, AnalysisError> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| AnalysisError::Parse("No content in API response".to_string()))?;
    let raw = extract_json_object(content)
        .ok_or_else(|| AnalysisError::Parse("No JSON found in response".to_string()))?;
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|error| AnalysisError::Parse(format!("Invalid JSON: {error}")))?;

    let has_name = parsed
        .get("stoneName")
        .and_then(Value::as_str)
        .is_some_and(|name| !name.trim().is_empty());
    let has_confidence = parsed.get("confidence").is_some_and(Value::is_number);
    if !has_name || !has_confidence {
        return Err(AnalysisError::Parse("Invalid response format".to_string()));
    }

    serde_json::from_value(parsed)
        .map_err(|error| AnalysisError::Parse(format!("Unexpected field types: {error}")))
}

/// Checks size and extension of a photo before it is encoded.
pub fn validate_image(path: &Path, size_bytes: u64) -> Result<ImageFormat, AnalysisError> {
    if size_bytes > MAX_IMAGE_BYTES {
        return Err(AnalysisError::InvalidImage(format!(
            "Image is too large; the maximum is {} MB",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(ImageFormat::from_extension)
        .ok_or_else(|| {
            AnalysisError::InvalidImage(
                "Unsupported image format; use JPEG, PNG or WebP".to_string(),
            )
        })
}

/// In-memory API key, wiped when replaced or cleared.
#[derive(Debug, Default)]
struct ApiKeySlot {
    key: Option<String>,
}

impl ApiKeySlot {
    fn set(&mut self, key: String) {
        self.clear();
        self.key = Some(key);
    }

    fn clear(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.zeroize();
        }
        self.key = None;
    }

    fn get(&self) -> Option<String> {
        self.key.as_ref().filter(|key| !key.is_empty()).cloned()
    }
}

impl Drop for ApiKeySlot {
    fn drop(&mut self) {
        self.clear();
    }
}

#[derive(Debug, Default)]
struct Latency {
    total_ms: AtomicU64,
    samples: AtomicU64,
}

impl Latency {
    fn record(&self, elapsed: Duration) {
        self.total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn average_ms(&self) -> f64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.total_ms.load(Ordering::Relaxed) as f64 / samples as f64
    }
}

pub struct StoneAnalysisClient {
    provider: Arc<dyn CompletionProvider>,
    store: Arc<dyn KeyValueStore>,
    usage: Arc<UsageTracker>,
    settings: Arc<SettingsManager>,
    queue: RequestQueue,
    config: ProviderConfig,
    api_key: Mutex<ApiKeySlot>,
    ids: RequestIds,
    latency: Arc<Latency>,
}

impl StoneAnalysisClient {
    /// Must be called inside a tokio runtime (spawns the queue worker).
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        store: Arc<dyn KeyValueStore>,
        usage: Arc<UsageTracker>,
        settings: Arc<SettingsManager>,
        config: ProviderConfig,
    ) -> Self {
        let queue = RequestQueue::spawn(config.queue_gap);
        Self {
            provider,
            store,
            usage,
            settings,
            queue,
            config,
            api_key: Mutex::new(ApiKeySlot::default()),
            ids: RequestIds::new(),
            latency: Arc::new(Latency::default()),
        }
    }

    fn cached_key(&self) -> Option<String> {
        match self.api_key.lock() {
            Ok(slot) => slot.get(),
            Err(_) => {
                log::error!("[analysis] API key cache lock poisoned");
                None
            }
        }
    }

    fn cache_key(&self, key: Option<String>) {
        match self.api_key.lock() {
            Ok(mut slot) => match key {
                Some(key) => slot.set(key),
                None => slot.clear(),
            },
            Err(_) => log::error!("[analysis] API key cache lock poisoned"),
        }
    }

    /// Loads the persisted key into memory. Returns whether one was found.
    pub async fn load_api_key(&self) -> bool {
        match get_json::<String>(self.store.as_ref(), storage_keys::API_KEY).await {
            Lookup::Found(key) if !key.is_empty() => {
                log::info!("[analysis] Loaded API key {}", crypto::fingerprint(&key));
                self.cache_key(Some(key));
                true
            }
            _ => false,
        }
    }

    async fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.cached_key() {
            return Some(key);
        }
        if self.load_api_key().await {
            return self.cached_key();
        }
        None
    }

    pub async fn is_api_key_set(&self) -> bool {
        self.resolve_api_key().await.is_some()
    }

    /// The key stays cached even when persisting it fails.
    pub async fn set_api_key(&self, key: &str) -> Result<(), StorageError> {
        let key = key.trim().to_string();
        log::info!("[analysis] Setting API key {}", crypto::fingerprint(&key));
        self.cache_key(Some(key.clone()));
        set_json(self.store.as_ref(), storage_keys::API_KEY, &key).await
    }

    pub async fn remove_api_key(&self) -> Result<(), StorageError> {
        self.cache_key(None);
        self.store.remove(storage_keys::API_KEY).await
    }

    /// Forgets the cached key without touching storage.
    pub fn forget_cached_key(&self) {
        self.cache_key(None);
    }

    /// `GET /models` with the given key, or the configured one.
    pub async fn validate_api_key(&self, key: Option<&str>) -> bool {
        let key = match key.map(str::trim).filter(|key| !key.is_empty()) {
            Some(key) => key.to_string(),
            None => match self.resolve_api_key().await {
                Some(key) => key,
                None => return false,
            },
        };
        let settings = self.settings.get().await;
        let timeout = Duration::from_millis(settings.timeout_ms);
        match tokio::time::timeout(timeout, self.provider.get(MODELS, &key)).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                log::warn!(
                    "[analysis] Key {} rejected: {}",
                    crypto::fingerprint(&key),
                    error
                );
                false
            }
            Err(_) => {
                log::warn!("[analysis] Key validation timed out");
                false
            }
        }
    }

    pub async fn can_make_request(&self) -> RequestPermission {
        self.usage.can_make_request().await
    }

    pub fn queue_length(&self) -> usize {
        self.queue.pending()
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> ApiResponse<AnalysisResult> {
        let Some(api_key) = self.resolve_api_key().await else {
            return ApiResponse::fail(&AnalysisError::NoApiKey, &self.ids.next());
        };

        let permission = self.usage.can_make_request().await;
        if !permission.allowed {
            let reason = permission
                .reason
                .unwrap_or_else(|| "Rate limit exceeded".to_string());
            log::warn!("[analysis] Request blocked: {}", reason);
            return ApiResponse::fail(&AnalysisError::RateLimitExceeded(reason), &self.ids.next());
        }

        let request_id = self.ids.next();
        let settings = self.settings.get().await;
        let policy = RetryPolicy {
            max_attempts: settings.attempts(),
            base_delay: self.config.retry_base_delay,
            attempt_timeout: Duration::from_millis(settings.timeout_ms),
        };
        let body = build_request_body(&self.config, &request);
        log::info!(
            "[analysis] {} queued ({} image, {:?})",
            request_id,
            request.image_format(),
            request.analysis_type()
        );

        let provider = self.provider.clone();
        let usage = self.usage.clone();
        let latency = self.latency.clone();
        let track_usage = settings.enable_usage_tracking;
        let job_id = request_id.clone();
        let queued = self.queue.enqueue(move || async move {
            let started = Instant::now();
            let outcome = with_retry(&policy, &job_id, |_| {
                provider.post_json(CHAT_COMPLETIONS, &api_key, &body)
            })
            .await;
            latency.record(started.elapsed());

            let result = outcome
                .map_err(AnalysisError::from)
                .and_then(|response| parse_analysis_response(&response));

            if track_usage {
                if let Err(error) = usage.increment_usage(result.is_ok()).await {
                    log::error!("[analysis] Failed to track API usage: {}", error);
                }
            }

            match result {
                Ok(analysis) => {
                    log::info!(
                        "[analysis] {} identified {} ({}%)",
                        job_id,
                        analysis.stone_name,
                        analysis.confidence
                    );
                    ApiResponse::ok(analysis, &job_id)
                }
                Err(error) => {
                    log::warn!("[analysis] {} failed: {:?}", job_id, error);
                    ApiResponse::fail(&error, &job_id)
                }
            }
        });

        match queued.await {
            Ok(response) => response,
            Err(error) => {
                log::error!("[analysis] {} not processed: {}", request_id, error);
                ApiResponse::fail(
                    &AnalysisError::Transport(TransportError::Network(error.to_string())),
                    &request_id,
                )
            }
        }
    }

    pub async fn get_api_stats(&self) -> ApiStats {
        let usage = match self.usage.get_usage().await {
            Ok(usage) => usage,
            Err(error) => {
                log::error!("[analysis] Failed to get usage data: {}", error);
                crate::models::UsageRecord::zeroed("")
            }
        };
        ApiStats {
            total_requests: usage.total_requests,
            successful_requests: usage.successful_requests,
            failed_requests: usage.failed_requests,
            average_response_time: self.latency.average_ms(),
            queue_length: self.queue.pending(),
            daily_count: usage.daily_count,
            monthly_count: usage.monthly_count,
        }
    }

    pub async fn clear_stats(&self) -> Result<(), StorageError> {
        self.usage.reset_monthly_usage().await.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::ErrorCode,
        models::{ClientSettingsPatch, UsageRecord},
        store::MemoryStore,
        usage::UsageLimits,
    };
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// Provider double that replays scripted replies and records calls.
    #[derive(Default)]
    pub(crate) struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<Value, TransportError>>>,
        pub(crate) posts: AtomicU32,
        pub(crate) bodies: Mutex<Vec<Value>>,
        pub(crate) hang: bool,
        pub(crate) delay: Option<Duration>,
    }

    impl ScriptedProvider {
        pub(crate) fn replying(replies: Vec<Result<Value, TransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        pub(crate) fn slow(reply: Value, delay: Duration) -> Self {
            Self {
                replies: Mutex::new(vec![Ok(reply)].into()),
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub(crate) fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn post_json(
            &self,
            _endpoint: &str,
            _api_key: &str,
            body: &Value,
        ) -> Result<Value, TransportError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().unwrap().push(body.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(TransportError::Network("provider_unreachable".to_string())))
        }

        async fn get(&self, _endpoint: &str, api_key: &str) -> Result<(), TransportError> {
            if api_key == "sk-valid" {
                Ok(())
            } else {
                Err(TransportError::Status {
                    status: 401,
                    reason: "invalid_api_key".to_string(),
                })
            }
        }
    }

    pub(crate) fn completion(content: &str) -> Value {
        json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
    }

    fn fixed_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        provider: Arc<ScriptedProvider>,
        client: StoneAnalysisClient,
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let usage = Arc::new(UsageTracker::with_clock(
            store.clone(),
            UsageLimits::default(),
            fixed_day,
        ));
        let settings = Arc::new(SettingsManager::new(store.clone()));
        let client = StoneAnalysisClient::new(
            provider.clone(),
            store.clone(),
            usage,
            settings,
            ProviderConfig::default(),
        );
        Harness {
            store,
            provider,
            client,
        }
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new("aGVsbG8=".to_string(), ImageFormat::Jpeg, AnalysisType::Full)
    }

    async fn usage(store: &MemoryStore) -> UsageRecord {
        get_json(store, storage_keys::API_USAGE)
            .await
            .into_option()
            .unwrap_or_else(|| UsageRecord::zeroed("2026-10-18"))
    }

    const AMETHYST: &str = r#"{"stoneName":"Amethyst","confidence":92,"properties":{"hardness":7,"color":"Purple","category":"Quartz","origin":"Brazil","chakra":"Crown","healingProperties":["Calm"],"metaphysicalProperties":["Intuition"]},"description":"Violet quartz.","alternativePossibilities":[{"name":"Fluorite","confidence":5}]}"#;

    #[test]
    fn prompt_varies_by_analysis_type() {
        let identification = build_prompt(AnalysisType::Identification);
        let properties = build_prompt(AnalysisType::Properties);
        let full = build_prompt(AnalysisType::Full);
        assert!(identification.contains("basic properties"));
        assert!(properties.contains("metaphysical properties."));
        assert!(full.contains("comprehensive"));
        for prompt in [&identification, &properties, &full] {
            assert!(prompt.contains("\"stoneName\""));
            assert!(prompt.contains("\"alternativePossibilities\""));
        }
    }

    #[test]
    fn request_body_embeds_prompt_and_image() {
        let body = build_request_body(&ProviderConfig::default(), &request());
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,aGVsbG8="
        );
        let temperature = body["temperature"].as_f64().unwrap();
        assert!((temperature - 0.3).abs() < 1e-6);
    }

    #[test]
    fn extracts_json_surrounded_by_prose() {
        let reply = format!("Sure! Here is the result: {AMETHYST}\nHope this helps.");
        let result = parse_analysis_response(&completion(&reply)).unwrap();
        assert_eq!(result.stone_name, "Amethyst");
        assert_eq!(result.confidence, 92.0);
        assert_eq!(result.properties.chakra.as_deref(), Some("Crown"));
        assert_eq!(
            result.alternative_possibilities.unwrap()[0].name,
            "Fluorite"
        );
    }

    #[test]
    fn rejects_replies_without_required_fields() {
        let missing_name = completion(r#"{"stoneName":"","confidence":50}"#);
        assert!(matches!(
            parse_analysis_response(&missing_name),
            Err(AnalysisError::Parse(_))
        ));
        let text_confidence = completion(r#"{"stoneName":"Jade","confidence":"high"}"#);
        assert!(matches!(
            parse_analysis_response(&text_confidence),
            Err(AnalysisError::Parse(_))
        ));
        let no_content = json!({ "choices": [] });
        assert!(matches!(
            parse_analysis_response(&no_content),
            Err(AnalysisError::Parse(_))
        ));
    }

    #[test]
    fn image_validation_checks_size_and_extension() {
        assert_eq!(
            validate_image(Path::new("stone.JPG"), 1024).unwrap(),
            ImageFormat::Jpeg
        );
        assert_eq!(
            validate_image(Path::new("stone.webp"), MAX_IMAGE_BYTES).unwrap(),
            ImageFormat::Webp
        );
        assert!(validate_image(Path::new("stone.png"), MAX_IMAGE_BYTES + 1).is_err());
        let error = validate_image(Path::new("stone.gif"), 10).unwrap_err();
        assert_eq!(error.code(), ErrorCode::InvalidImage);
        assert!(validate_image(Path::new("stone"), 10).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_key_fails_fast_without_usage() {
        let h = harness(ScriptedProvider::default());
        let response = h.client.analyze(request()).await;
        assert!(!response.success);
        assert_eq!(response.error_code, Some(ErrorCode::NoApiKey));
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 0);
        assert_eq!(usage(&h.store).await.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_daily_limit_blocks_before_network() {
        let h = harness(ScriptedProvider::default());
        h.client.set_api_key("sk-test").await.unwrap();
        set_json(
            h.store.as_ref(),
            storage_keys::API_USAGE,
            &UsageRecord {
                daily_count: 100,
                ..UsageRecord::zeroed("2026-10-18")
            },
        )
        .await
        .unwrap();

        let response = h.client.analyze(request()).await;
        assert_eq!(response.error_code, Some(ErrorCode::RateLimitExceeded));
        assert_eq!(
            response.error.as_deref(),
            Some("Daily API usage limit exceeded")
        );
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 0);
        assert_eq!(usage(&h.store).await.daily_count, 100);
        assert_eq!(usage(&h.store).await.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_analysis_counts_one_success() {
        let reply = format!("Sure! Here is the result: {AMETHYST}");
        let h = harness(ScriptedProvider::replying(vec![Ok(completion(&reply))]));
        h.client.set_api_key("sk-test").await.unwrap();

        let response = h.client.analyze(request()).await;
        assert!(response.success, "{:?}", response.error);
        assert!(response.request_id.starts_with("req_"));
        assert_eq!(response.data.unwrap().stone_name, "Amethyst");

        let record = usage(&h.store).await;
        assert_eq!(record.total_requests, 1);
        assert_eq!(record.successful_requests, 1);
        assert_eq!(record.failed_requests, 0);

        let bodies = h.provider.bodies.lock().unwrap();
        assert_eq!(
            bodies[0]["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,aGVsbG8="
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_reply_is_one_failure_without_retry() {
        let h = harness(ScriptedProvider::replying(vec![Ok(completion(
            "I could not identify this stone, sorry.",
        ))]));
        h.client.set_api_key("sk-test").await.unwrap();

        let response = h.client.analyze(request()).await;
        assert!(!response.success);
        assert_eq!(
            response.error.as_deref(),
            Some("Failed to parse analysis response")
        );
        assert_eq!(response.error_code, Some(ErrorCode::ParseError));
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 1);

        let record = usage(&h.store).await;
        assert_eq!(record.total_requests, 1);
        assert_eq!(record.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_retry_then_count_once() {
        let h = harness(ScriptedProvider::default());
        h.client.set_api_key("sk-test").await.unwrap();

        let response = h.client.analyze(request()).await;
        assert!(!response.success);
        assert_eq!(response.error_code, Some(ErrorCode::NetworkError));
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 3);

        let record = usage(&h.store).await;
        assert_eq!(record.total_requests, 1);
        assert_eq!(record.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_provider_recovers_within_retry_budget() {
        let reply = completion(AMETHYST);
        let h = harness(ScriptedProvider::replying(vec![
            Err(TransportError::Status {
                status: 503,
                reason: "provider_unavailable".to_string(),
            }),
            Ok(reply),
        ]));
        h.client.set_api_key("sk-test").await.unwrap();

        let response = h.client.analyze(request()).await;
        assert!(response.success);
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 2);
        assert_eq!(usage(&h.store).await.successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settings_disable_retry_and_tracking() {
        let h = harness(ScriptedProvider::default());
        h.client.set_api_key("sk-test").await.unwrap();
        SettingsManager::new(h.store.clone())
            .update(&ClientSettingsPatch {
                auto_retry: Some(false),
                enable_usage_tracking: Some(false),
                ..ClientSettingsPatch::default()
            })
            .await
            .unwrap();

        let response = h.client.analyze(request()).await;
        assert!(!response.success);
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 1);
        assert_eq!(usage(&h.store).await.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_analysis_still_completes_and_counts() {
        let h = harness(ScriptedProvider::slow(
            completion(AMETHYST),
            Duration::from_millis(500),
        ));
        h.client.set_api_key("sk-test").await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), h.client.analyze(request())).await;
        assert!(abandoned.is_err());
        assert_eq!(usage(&h.store).await.total_requests, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let record = usage(&h.store).await;
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 1);
        assert_eq!(record.total_requests, 1);
        assert_eq!(record.successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn null_optional_fields_still_succeed() {
        let reply = r#"{"stoneName":"Amethyst","confidence":92,"description":null,"properties":{"hardness":"6-7","healingProperties":null}}"#;
        let h = harness(ScriptedProvider::replying(vec![Ok(completion(reply))]));
        h.client.set_api_key("sk-test").await.unwrap();

        let response = h.client.analyze(request()).await;
        assert!(response.success, "{:?}", response.error);
        let result = response.data.unwrap();
        assert_eq!(result.description, "");
        assert_eq!(result.properties.hardness, 6.5);
        assert_eq!(usage(&h.store).await.failed_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_provider_times_out() {
        let h = harness(ScriptedProvider::hanging());
        h.client.set_api_key("sk-test").await.unwrap();

        let response = h.client.analyze(request()).await;
        assert_eq!(response.error_code, Some(ErrorCode::Timeout));
        assert_eq!(
            response.error.as_deref(),
            Some("Request timed out after 30000ms")
        );
        assert_eq!(h.provider.posts.load(Ordering::SeqCst), 3);
        assert_eq!(usage(&h.store).await.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn api_key_round_trip() {
        let h = harness(ScriptedProvider::default());
        assert!(!h.client.is_api_key_set().await);
        h.client.set_api_key("sk-test").await.unwrap();
        assert!(h.client.is_api_key_set().await);
        h.client.remove_api_key().await.unwrap();
        assert!(!h.client.is_api_key_set().await);
    }

    #[tokio::test(start_paused = true)]
    async fn key_is_loaded_from_storage_when_cache_is_cold() {
        let h = harness(ScriptedProvider::default());
        set_json(h.store.as_ref(), storage_keys::API_KEY, "sk-stored")
            .await
            .unwrap();
        assert!(h.client.is_api_key_set().await);
        h.client.forget_cached_key();
        assert!(h.client.is_api_key_set().await);
    }

    #[tokio::test(start_paused = true)]
    async fn key_stays_cached_when_persisting_fails() {
        let h = harness(ScriptedProvider::default());
        h.store.set_fail_writes(true);
        assert!(h.client.set_api_key("sk-test").await.is_err());
        assert!(h.client.is_api_key_set().await);
    }

    #[tokio::test(start_paused = true)]
    async fn validates_keys_against_models_endpoint() {
        let h = harness(ScriptedProvider::default());
        assert!(h.client.validate_api_key(Some("sk-valid")).await);
        assert!(!h.client.validate_api_key(Some("sk-revoked")).await);
        assert!(!h.client.validate_api_key(None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_usage_and_clear_resets_monthly() {
        let h = harness(ScriptedProvider::replying(vec![Ok(completion(AMETHYST))]));
        h.client.set_api_key("sk-test").await.unwrap();
        assert!(h.client.analyze(request()).await.success);

        let stats = h.client.get_api_stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.daily_count, 1);
        assert_eq!(stats.monthly_count, 1);
        assert_eq!(stats.queue_length, 0);

        h.client.clear_stats().await.unwrap();
        let stats = h.client.get_api_stats().await;
        assert_eq!(stats.monthly_count, 0);
        assert_eq!(stats.total_requests, 1);
    }
}
