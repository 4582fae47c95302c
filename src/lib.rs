//! Crystal Guide core: stone identification through a vision model, with
//! request queuing, retries, usage limits and local persistence.

pub mod analysis;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod library;
pub mod models;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod store;
pub mod usage;

pub use app_state::AppState;
pub use config::ProviderConfig;
pub use error::{AnalysisError, AuthError, ErrorCode, StorageError, TransportError};
pub use models::{AnalysisRequest, AnalysisResult, AnalysisType, ApiResponse, ImageFormat};
