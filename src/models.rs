use crate::error::{AnalysisError, ErrorCode};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub daily_count: u64,
    pub monthly_count: u64,
    pub last_reset_date: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

impl UsageRecord {
    pub fn zeroed(today: &str) -> Self {
        Self {
            daily_count: 0,
            monthly_count: 0,
            last_reset_date: today.to_string(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPermission {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RequestPermission {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    pub auto_retry: bool,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub enable_offline_queue: bool,
    pub enable_usage_tracking: bool,
    pub enable_analytics: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: 3,
            timeout_ms: 30_000,
            enable_offline_queue: true,
            enable_usage_tracking: true,
            enable_analytics: true,
        }
    }
}

/// Partial update for [`ClientSettings`]; also the on-disk shape, so blobs
/// written by older builds with missing fields still merge onto defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_offline_queue: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_usage_tracking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_analytics: Option<bool>,
}

impl ClientSettings {
    pub fn merged(mut self, patch: &ClientSettingsPatch) -> Self {
        if let Some(value) = patch.auto_retry {
            self.auto_retry = value;
        }
        if let Some(value) = patch.max_retries {
            self.max_retries = value;
        }
        if let Some(value) = patch.timeout_ms {
            self.timeout_ms = value;
        }
        if let Some(value) = patch.enable_offline_queue {
            self.enable_offline_queue = value;
        }
        if let Some(value) = patch.enable_usage_tracking {
            self.enable_usage_tracking = value;
        }
        if let Some(value) = patch.enable_analytics {
            self.enable_analytics = value;
        }
        self
    }

    /// Number of provider attempts one logical analysis may make.
    pub fn attempts(&self) -> u32 {
        if self.auto_retry {
            self.max_retries.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("unsupported image format: {s}"))
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Identification,
    Properties,
    #[default]
    Full,
}

impl FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identification" => Ok(AnalysisType::Identification),
            "properties" => Ok(AnalysisType::Properties),
            "full" => Ok(AnalysisType::Full),
            other => Err(format!("unknown analysis type: {other}")),
        }
    }
}

/// A photo submitted for analysis. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    image_data: String,
    image_format: ImageFormat,
    analysis_type: AnalysisType,
}

impl AnalysisRequest {
    /// `image_data` is the base64 payload without a `data:` prefix.
    pub fn new(image_data: String, image_format: ImageFormat, analysis_type: AnalysisType) -> Self {
        Self {
            image_data,
            image_format,
            analysis_type,
        }
    }

    pub fn image_data(&self) -> &str {
        &self.image_data
    }

    pub fn image_format(&self) -> ImageFormat {
        self.image_format
    }

    pub fn analysis_type(&self) -> AnalysisType {
        self.analysis_type
    }

    pub fn data_uri(&self) -> String {
        format!(
            "data:image/{};base64,{}",
            self.image_format.as_str(),
            self.image_data
        )
    }
}

/// Provider-shaped stone properties. Every field tolerates null or a
/// differently typed value and falls back to its default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoneProperties {
    #[serde(default, deserialize_with = "lenient_number")]
    pub hardness: f64,
    #[serde(default, deserialize_with = "lenient_text")]
    pub color: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub category: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub origin: String,
    #[serde(
        default,
        deserialize_with = "lenient_optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub chakra: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub healing_properties: Vec<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub metaphysical_properties: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativePossibility {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub stone_name: String,
    pub confidence: f64,
    #[serde(default, deserialize_with = "lenient_properties")]
    pub properties: StoneProperties,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: String,
    #[serde(
        default,
        deserialize_with = "lenient_alternatives",
        skip_serializing_if = "Option::is_none"
    )]
    pub alternative_possibilities: Option<Vec<AlternativePossibility>>,
}

impl AnalysisResult {
    /// Collection draft for a freshly identified stone.
    pub fn to_stone_draft(&self) -> StoneDraft {
        let healing = self.properties.healing_properties.clone();
        StoneDraft {
            name: Some(self.stone_name.clone()),
            scientific_name: Some(self.stone_name.clone()),
            category: non_empty(&self.properties.category),
            color: non_empty(&self.properties.color).map(|color| split_list(&color)),
            hardness: (self.properties.hardness > 0.0).then_some(self.properties.hardness),
            origin: non_empty(&self.properties.origin).map(|origin| split_list(&origin)),
            properties: (!healing.is_empty()).then(|| healing.clone()),
            healing_properties: (!healing.is_empty()).then_some(healing),
            uses: None,
            image_url: None,
            description: non_empty(&self.description),
            cleansing_methods: None,
        }
    }
}

/// Uniform envelope returned by every client entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub timestamp: i64,
    pub request_id: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, request_id: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
            timestamp: Utc::now().timestamp_millis(),
            request_id: request_id.to_string(),
        }
    }

    pub fn fail(error: &AnalysisError, request_id: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            error_code: Some(error.code()),
            timestamp: Utc::now().timestamp_millis(),
            request_id: request_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: f64,
    pub queue_length: usize,
    pub daily_count: u64,
    pub monthly_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleStatus {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub created_at: String,
    pub last_login_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stone {
    pub id: String,
    pub name: String,
    pub scientific_name: String,
    pub category: String,
    pub color: Vec<String>,
    pub hardness: f64,
    pub origin: Vec<String>,
    pub properties: Vec<String>,
    pub healing_properties: Vec<String>,
    pub uses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleansing_methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoneDraft {
    pub name: Option<String>,
    pub scientific_name: Option<String>,
    pub category: Option<String>,
    pub color: Option<Vec<String>>,
    pub hardness: Option<f64>,
    pub origin: Option<Vec<String>>,
    pub properties: Option<Vec<String>>,
    pub healing_properties: Option<Vec<String>>,
    pub uses: Option<Vec<String>>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub cleansing_methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfEntry {
    #[serde(flatten)]
    pub stone: Stone,
    pub date_added: String,
    #[serde(default)]
    pub is_custom: bool,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

// Providers answer `"color": "Purple"` or `"color": ["Purple", "Violet"]`.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(text_of).collect();
            Some(parts.join(", "))
        }
        _ => None,
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_of(&Value::deserialize(deserializer)?).unwrap_or_default())
}

fn lenient_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_of(&Value::deserialize(deserializer)?).filter(|text| !text.is_empty()))
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.iter().filter_map(text_of).collect(),
        Value::String(text) => split_list(&text),
        _ => Vec::new(),
    })
}

/// Numbers as-is; strings such as `"7"` or `"6-7"` yield the mean of the
/// numbers they contain.
fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_f64().unwrap_or_default(),
        Value::String(text) => {
            let numbers: Vec<f64> = text
                .split(|c: char| !(c.is_ascii_digit() || c == '.'))
                .filter_map(|part| part.parse::<f64>().ok())
                .collect();
            if numbers.is_empty() {
                0.0
            } else {
                numbers.iter().sum::<f64>() / numbers.len() as f64
            }
        }
        _ => 0.0,
    })
}

fn lenient_properties<'de, D>(deserializer: D) -> Result<StoneProperties, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_alternatives<'de, D>(deserializer: D) -> Result<Option<Vec<AlternativePossibility>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
        ),
        _ => None,
    })
}
