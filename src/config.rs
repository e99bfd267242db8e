use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use time::macros::time;

pub const MIN_SHEET_CHUNK_SIZE: u32 = 1000;

#[derive(Clone, Debug)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub http_port: u16,
    pub horoshop: HoroshopConfig,
    pub sheets: SheetsConfig,
    /// Zero disables the stale job sweep
    pub job_timeout_minutes: u64,
    pub retention_days: u32,
    pub telegram: TelegramConfig,
    pub scheduler: SchedulerConfig,
    /// Pull the storefront mirror before export in update_pipeline
    pub pipeline_sync_mirror: bool,
    pub export_files: ExportFilesConfig,
}

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub db: String,
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} user={} dbname={} password={}",
            self.host, self.user, self.db, self.password
        )
    }
}

#[derive(Clone, Debug)]
pub struct HoroshopConfig {
    pub domain: String,
    pub login: String,
    pub password: String,
    pub export_limit: usize,
    pub sync_delay: Duration,
    /// Zero retries forever
    pub max_retries: u32,
    pub store_raw: bool,
}

impl HoroshopConfig {
    pub fn is_configured(&self) -> bool {
        !self.domain.is_empty() && !self.login.is_empty() && !self.password.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct SheetsConfig {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub chunk_size: u32,
    pub min_interval: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub app_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub update_pipeline_at: time::Time,
    pub update_pipeline_supplier: String,
    pub cleanup_at: time::Time,
    pub horoshop_sync_at: Option<time::Time>,
}

#[derive(Clone, Debug)]
pub struct ExportFilesConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let user = string("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string());
        let mut host = string("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string());
        if host == "db" && !std::path::Path::new("/.dockerenv").exists() {
            log::warn!("POSTGRES_HOST=db outside of docker, falling back to 127.0.0.1");
            host = "127.0.0.1".to_string();
        }
        let postgres = PostgresConfig {
            host,
            password: string("POSTGRES_PASSWORD").unwrap_or_else(|| "postgres".to_string()),
            db: string("POSTGRES_DB").unwrap_or_else(|| user.clone()),
            user,
        };
        let horoshop = HoroshopConfig {
            domain: string("HOROSHOP_DOMAIN").unwrap_or_default(),
            login: string("HOROSHOP_LOGIN").unwrap_or_default(),
            password: string("HOROSHOP_PASSWORD").unwrap_or_default(),
            export_limit: parse_or("HOROSHOP_EXPORT_LIMIT", 500usize).max(1),
            sync_delay: Duration::from_millis(parse_or("HOROSHOP_SYNC_DELAY_MS", 250)),
            max_retries: parse_or("HOROSHOP_SYNC_MAX_RETRIES", 5),
            store_raw: envmnt::is_or("HOROSHOP_STORE_RAW", false),
        };
        let sheets = SheetsConfig {
            api_key: string("GOOGLE_SHEETS_API_KEY"),
            access_token: string("GOOGLE_SHEETS_ACCESS_TOKEN"),
            chunk_size: parse_or("GOOGLE_SHEETS_CHUNK_SIZE", 10_000u32).max(MIN_SHEET_CHUNK_SIZE),
            min_interval: Duration::from_millis(parse_or("GOOGLE_SHEETS_MIN_INTERVAL_MS", 1200)),
        };
        let telegram = TelegramConfig {
            bot_token: string("TELEGRAM_BOT_TOKEN"),
            chat_id: string("TELEGRAM_CHAT_ID"),
            app_name: string("TELEGRAM_APP_NAME"),
        };
        let scheduler = SchedulerConfig {
            enabled: envmnt::is_or("ENABLE_SCHEDULER", false),
            update_pipeline_at: time_or("UPDATE_PIPELINE_AT", time!(03:00)),
            update_pipeline_supplier: string("UPDATE_PIPELINE_SUPPLIER")
                .unwrap_or_else(|| catalog_types::supplier::DEFAULT_SUPPLIER_FILTER.to_string()),
            cleanup_at: time_or("CLEANUP_AT", time!(02:15)),
            horoshop_sync_at: string("HOROSHOP_SYNC_AT").and_then(|s| {
                crate::parse_time_of_day(&s)
                    .map_err(|err| log::warn!("Invalid HOROSHOP_SYNC_AT {s}: {err}"))
                    .ok()
            }),
        };
        Self {
            postgres,
            http_port: parse_or("HTTP_PORT", 8080),
            horoshop,
            sheets,
            job_timeout_minutes: parse_or("JOB_TIMEOUT_MINUTES", 0),
            retention_days: parse_or("JOB_RETENTION_DAYS", 10),
            telegram,
            scheduler,
            pipeline_sync_mirror: envmnt::is_or("UPDATE_PIPELINE_SYNC_MIRROR", false),
            export_files: ExportFilesConfig {
                enabled: envmnt::is_or("EXPORT_FILES", false),
                dir: PathBuf::from(envmnt::get_or("EXPORT_DIR", "export")),
            },
        }
    }
}

/// Trimmed value, `None` when unset or blank
fn string(key: &str) -> Option<String> {
    catalog_types::blank_as_none(std::env::var(key).ok())
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match string(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|err| {
            log::warn!("Invalid {key}={raw}: {err}, using {default}");
            default
        }),
    }
}

fn time_or(key: &str, default: time::Time) -> time::Time {
    match string(key) {
        None => default,
        Some(raw) => crate::parse_time_of_day(&raw).unwrap_or_else(|err| {
            log::warn!("Invalid {key}={raw}: {err}, using {default}");
            default
        }),
    }
}
