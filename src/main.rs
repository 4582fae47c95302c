//! Crystal Guide CLI
//!
//! Identify stones from photos and manage the local stone library.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Args, Parser, Subcommand};
use crystal_guide::{
    analysis::validate_image,
    config::{default_data_dir, DEFAULT_BASE_URL, DEFAULT_MODEL},
    models::{ClientSettingsPatch, SimpleStatus, StoneDraft},
    AnalysisRequest, AnalysisType, AppState, ProviderConfig,
};
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs;

#[derive(Parser)]
#[command(name = "crystal-guide")]
#[command(author, version, about = "Stone identification and crystal library CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (or set CRYSTAL_GUIDE_DATA_DIR)
    #[arg(long, env = "CRYSTAL_GUIDE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// OpenAI-compatible API base URL
    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Vision model name
    #[arg(long, global = true, default_value = DEFAULT_MODEL)]
    model: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the provider API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Identify a stone from a photo
    Analyze {
        /// JPEG, PNG or WebP image, at most 4 MB
        image: PathBuf,

        /// identification, properties or full
        #[arg(long = "type", default_value = "full")]
        analysis_type: AnalysisType,

        /// Add the identified stone to the collection
        #[arg(long)]
        save: bool,
    },

    /// Request statistics
    Stats,

    /// Daily and monthly usage limits
    Usage {
        #[command(subcommand)]
        action: UsageAction,
    },

    /// Client settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Favorite stones
    Favorites {
        #[command(subcommand)]
        action: ShelfAction,
    },

    /// Personal collection
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Local account
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store an API key
    Set { key: String },
    /// Forget the stored API key
    Remove,
    /// Show whether a key is configured
    Status,
    /// Check a key against the provider (the stored one by default)
    Validate { key: Option<String> },
}

#[derive(Subcommand)]
enum UsageAction {
    Show,
    /// Whether another request is allowed right now
    Check,
    ResetMonthly,
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Set(SettingsArgs),
    Reset,
}

#[derive(Args)]
struct SettingsArgs {
    #[arg(long)]
    auto_retry: Option<bool>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    enable_offline_queue: Option<bool>,
    #[arg(long)]
    enable_usage_tracking: Option<bool>,
    #[arg(long)]
    enable_analytics: Option<bool>,
}

#[derive(Subcommand)]
enum ShelfAction {
    List,
    Remove { id: String },
}

#[derive(Subcommand)]
enum CollectionAction {
    List,
    Remove {
        id: String,
    },
    /// Add a stone that is not in the catalog
    AddCustom {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        hardness: Option<f64>,
        /// Comma-separated colors
        #[arg(long, value_delimiter = ',')]
        color: Option<Vec<String>>,
        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    Register {
        email: String,
        password: String,
        name: String,
    },
    Login {
        email: String,
        password: String,
    },
    Logout,
    Whoami,
    /// Erase all local data
    Delete,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status(ok: bool, message: impl Into<String>) -> Result<()> {
    print_json(&SimpleStatus {
        ok,
        message: message.into(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = ProviderConfig {
        base_url: cli.base_url,
        model: cli.model,
        ..ProviderConfig::default()
    };
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let state = AppState::initialize(data_dir, config).await?;

    match cli.command {
        Commands::Key { action } => key(&state, action).await,
        Commands::Analyze {
            image,
            analysis_type,
            save,
        } => analyze(&state, image, analysis_type, save).await,
        Commands::Stats => print_json(&state.get_api_stats().await),
        Commands::Usage { action } => usage(&state, action).await,
        Commands::Settings { action } => settings(&state, action).await,
        Commands::Favorites { action } => match action {
            ShelfAction::List => print_json(&state.favorites.list().await),
            ShelfAction::Remove { id } => {
                let removed = state.favorites.remove(&id).await?;
                status(removed, if removed { "Removed" } else { "Not in favorites" })
            }
        },
        Commands::Collection { action } => collection(&state, action).await,
        Commands::Account { action } => account(&state, action).await,
    }
}

async fn key(state: &AppState, action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Set { key } => {
            if key.trim().is_empty() {
                bail!("API key must not be empty");
            }
            state.set_api_key(&key).await?;
            status(true, "API key saved")
        }
        KeyAction::Remove => {
            state.remove_api_key().await?;
            status(true, "API key removed")
        }
        KeyAction::Status => {
            let set = state.is_api_key_set().await;
            status(set, if set { "API key configured" } else { "API key not configured" })
        }
        KeyAction::Validate { key } => {
            let valid = state.validate_api_key(key.as_deref()).await;
            status(valid, if valid { "API key is valid" } else { "API key is invalid" })
        }
    }
}

async fn analyze(state: &AppState, image: PathBuf, analysis_type: AnalysisType, save: bool) -> Result<()> {
    let size = fs::metadata(&image)
        .await
        .with_context(|| format!("Cannot read {}", image.display()))?
        .len();
    let format = validate_image(&image, size)?;
    let bytes = fs::read(&image)
        .await
        .with_context(|| format!("Cannot read {}", image.display()))?;
    let request = AnalysisRequest::new(STANDARD.encode(bytes), format, analysis_type);

    let response = state.analyze_stone(request).await;
    print_json(&response)?;

    let Some(result) = response.data.as_ref() else {
        bail!(
            "Analysis failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    };
    if save {
        let stone = state.collection.add_custom(result.to_stone_draft()).await?;
        log::info!("[cli] Saved {} as {}", result.stone_name, stone.id);
        eprintln!("Saved to collection as {}", stone.id);
    }
    Ok(())
}

async fn usage(state: &AppState, action: UsageAction) -> Result<()> {
    match action {
        UsageAction::Show => print_json(&state.usage.get_usage().await?),
        UsageAction::Check => print_json(&state.can_make_request().await),
        UsageAction::ResetMonthly => print_json(&state.usage.reset_monthly_usage().await?),
    }
}

async fn settings(state: &AppState, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Show => print_json(&state.get_settings().await),
        SettingsAction::Set(args) => {
            let patch = ClientSettingsPatch {
                auto_retry: args.auto_retry,
                max_retries: args.max_retries,
                timeout_ms: args.timeout_ms,
                enable_offline_queue: args.enable_offline_queue,
                enable_usage_tracking: args.enable_usage_tracking,
                enable_analytics: args.enable_analytics,
            };
            print_json(&state.update_settings(&patch).await?)
        }
        SettingsAction::Reset => {
            state.reset_settings().await?;
            print_json(&state.get_settings().await)
        }
    }
}

async fn collection(state: &AppState, action: CollectionAction) -> Result<()> {
    match action {
        CollectionAction::List => print_json(&state.collection.list().await),
        CollectionAction::Remove { id } => {
            let removed = state.collection.remove(&id).await?;
            status(removed, if removed { "Removed" } else { "Not in collection" })
        }
        CollectionAction::AddCustom {
            name,
            category,
            hardness,
            color,
            description,
        } => {
            let draft = StoneDraft {
                name,
                category,
                hardness,
                color,
                description,
                ..StoneDraft::default()
            };
            print_json(&state.collection.add_custom(draft).await?)
        }
    }
}

async fn account(state: &AppState, action: AccountAction) -> Result<()> {
    match action {
        AccountAction::Register {
            email,
            password,
            name,
        } => print_json(&state.auth.register(&email, &password, &name).await?),
        AccountAction::Login { email, password } => {
            print_json(&state.auth.login(&email, &password).await?)
        }
        AccountAction::Logout => {
            state.auth.logout().await?;
            status(true, "Signed out")
        }
        AccountAction::Whoami => match state.auth.current_user().await {
            Some(user) => print_json(&user),
            None => status(false, "No user is signed in"),
        },
        AccountAction::Delete => {
            state.delete_account().await?;
            status(true, "All local data deleted")
        }
    }
}
