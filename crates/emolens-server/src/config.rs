use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;

/// JWT secrets that only make sense on a developer machine.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

/// Server configuration, loaded from `EMOLENS_*` environment variables.
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub results_dir: PathBuf,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    /// Mark the session cookie `Secure` (set when served over HTTPS).
    pub secure_cookies: bool,
    pub analyzer_url: String,
    pub analyzer_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Offset applied to history timestamps for display.
    pub display_offset: FixedOffset,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port: u16 = std::env::var("EMOLENS_PORT")
            .unwrap_or_else(|_| "5000".into())
            .parse()
            .context("EMOLENS_PORT must be a port number")?;

        let offset_minutes = env_i64("EMOLENS_DISPLAY_UTC_OFFSET_MINUTES", 300);
        let display_offset = i32::try_from(offset_minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .with_context(|| format!("invalid display offset: {offset_minutes} minutes"))?;

        Ok(Self {
            host: std::env::var("EMOLENS_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            db_path: env_path("EMOLENS_DB_PATH", "emolens.db"),
            upload_dir: env_path("EMOLENS_UPLOAD_DIR", "uploads"),
            results_dir: env_path("EMOLENS_RESULTS_DIR", "results"),
            jwt_secret: std::env::var("EMOLENS_JWT_SECRET")
                .unwrap_or_else(|_| "dev-secret-change-me".into()),
            token_ttl: chrono::Duration::hours(env_i64("EMOLENS_TOKEN_TTL_HOURS", 24)),
            secure_cookies: std::env::var("EMOLENS_SECURE_COOKIES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            analyzer_url: std::env::var("EMOLENS_ANALYZER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5005/analyze".into()),
            analyzer_timeout: Duration::from_secs(env_u64("EMOLENS_ANALYZER_TIMEOUT_SECS", 30)),
            max_upload_bytes: env_usize("EMOLENS_MAX_UPLOAD_BYTES", 16 * 1024 * 1024),
            display_offset,
        })
    }

    pub fn has_placeholder_secret(&self) -> bool {
        self.jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
