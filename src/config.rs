use crate::db::initialize_pool_from_path;
use crate::error::AppError;
use crate::store::http::HttpStore;
use crate::store::sqlite::SqliteStore;
use crate::store::{DurableStore, NullStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const ENV_STORE: &str = "INGEST_STORE";
pub const ENV_DB_PATH: &str = "INGEST_DB_PATH";
pub const ENV_BACKEND_URL: &str = "INGEST_BACKEND_URL";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "INGEST_MAX_RECONNECT_ATTEMPTS";

pub const DEFAULT_DB_PATH: &str = "data/stream-ingest.db";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    None,
    Sqlite { path: PathBuf },
    Http { base_url: String },
}

impl StoreSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sqlite { .. } => "sqlite",
            Self::Http { .. } => "http",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub store: StoreSettings,
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            store: StoreSettings::Sqlite {
                path: PathBuf::from(DEFAULT_DB_PATH),
            },
            max_reconnect_attempts: None,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let store_kind = read(ENV_STORE).unwrap_or_else(|| "sqlite".to_string());
        let store = parse_store(
            &store_kind,
            read(ENV_DB_PATH),
            read(ENV_BACKEND_URL),
        )?;

        let max_reconnect_attempts = match read(ENV_MAX_RECONNECT_ATTEMPTS) {
            Some(raw) => Some(raw.parse::<u32>().map_err(|error| {
                AppError::Config(format!(
                    "{ENV_MAX_RECONNECT_ATTEMPTS} must be a positive integer: {error}"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            store,
            max_reconnect_attempts,
        })
    }
}

pub fn parse_store(
    kind: &str,
    db_path: Option<String>,
    backend_url: Option<String>,
) -> Result<StoreSettings, AppError> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "none" | "off" => Ok(StoreSettings::None),
        "sqlite" => Ok(StoreSettings::Sqlite {
            path: PathBuf::from(db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string())),
        }),
        "http" => Ok(StoreSettings::Http {
            base_url: backend_url.unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
        }),
        other => Err(AppError::Config(format!(
            "unknown store '{other}' (expected sqlite, http or none)"
        ))),
    }
}

pub async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn DurableStore>, AppError> {
    match settings {
        StoreSettings::None => {
            info!("persistence disabled");
            Ok(Arc::new(NullStore))
        }
        StoreSettings::Sqlite { path } => {
            let pool = initialize_pool_from_path(path).await?;
            info!("persisting to sqlite database {}", path.display());
            Ok(Arc::new(SqliteStore::new(pool)))
        }
        StoreSettings::Http { base_url } => {
            let store = HttpStore::new(base_url)?;
            info!("persisting to backend api {base_url}");
            Ok(Arc::new(store))
        }
    }
}
