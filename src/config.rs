use anyhow::{ensure, Context, Result};
use std::time::Duration;

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,

    // ── Database (PostgreSQL) ───────────────────────────────────────────
    /// When absent the service keeps credentials in memory only.
    pub database_url: Option<String>,

    // ── Crypto ──────────────────────────────────────────────────────────
    /// 32-byte base64-encoded master key for AES-256-GCM encryption at rest.
    pub master_key: String,
    /// Base64-encoded HMAC key used for constant-time secret comparison.
    pub hmac_secret: String,

    // ── Caller auth ─────────────────────────────────────────────────────
    /// Shared secret for internal service calls (`x-internal-secret`).
    pub auth_service_secret: String,
    /// Shared secret accepted in the `Authorization` header of the cron trigger.
    pub cron_secret: Option<String>,
    /// Header set by the hosting platform's own scheduler.
    pub cron_trusted_header: String,

    // ── Auth gateway ────────────────────────────────────────────────────
    pub gateway_url: Option<String>,
    pub gateway_key: Option<String>,
    pub gateway_timeout: Duration,
    /// Fabricate tokens instead of calling the gateway. Local development only.
    pub offline_mode: bool,

    // ── Refresh scheduling ──────────────────────────────────────────────
    pub refresh: RefreshSettings,

    // ── Sync tracking ───────────────────────────────────────────────────
    /// Runs older than this may be taken over by a new `start`. `None` disables takeover.
    pub sync_stale_after: Option<Duration>,
}

/// Upper bound for every refresh window setting (30 days).
pub const MAX_REFRESH_WINDOW_MINUTES: i64 = 30 * 24 * 60;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub interval: Duration,
    pub buffer_minutes: i64,
    pub threshold_minutes: i64,
    pub deadline: Duration,
    pub concurrency: usize,
    pub daemon_enabled: bool,
}

impl RefreshSettings {
    /// Smallest threshold that keeps a token alive across one scheduling interval.
    pub fn min_threshold_minutes(&self) -> i64 {
        let interval_minutes =
            i64::try_from(self.interval.as_secs().div_ceil(60)).unwrap_or(i64::MAX);
        interval_minutes.saturating_add(self.buffer_minutes)
    }

    /// Raise `threshold_minutes` to the floor if it was configured below it.
    pub fn normalized(mut self) -> Self {
        let floor = self.min_threshold_minutes();
        if self.threshold_minutes < floor {
            tracing::warn!(
                configured = self.threshold_minutes,
                floor,
                "Refresh threshold below interval + buffer, raising it"
            );
            self.threshold_minutes = floor;
        }
        self.concurrency = self.concurrency.max(1);
        self
    }

    /// Reject windows that cannot be represented as clock offsets.
    pub fn validate(&self) -> Result<()> {
        let interval_minutes = self.interval.as_secs() / 60;
        ensure!(
            interval_minutes <= MAX_REFRESH_WINDOW_MINUTES as u64,
            "REFRESH_INTERVAL_SECS must be at most {} minutes",
            MAX_REFRESH_WINDOW_MINUTES
        );
        ensure!(
            (0..=MAX_REFRESH_WINDOW_MINUTES).contains(&self.buffer_minutes),
            "REFRESH_BUFFER_MINUTES must be between 0 and {MAX_REFRESH_WINDOW_MINUTES}, got {}",
            self.buffer_minutes
        );
        ensure!(
            (0..=2 * MAX_REFRESH_WINDOW_MINUTES + 1).contains(&self.threshold_minutes),
            "REFRESH_THRESHOLD_MINUTES must be between 0 and {}, got {}",
            2 * MAX_REFRESH_WINDOW_MINUTES + 1,
            self.threshold_minutes
        );
        Ok(())
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            buffer_minutes: 5,
            threshold_minutes: 10,
            deadline: Duration::from_secs(55),
            concurrency: 4,
            daemon_enabled: true,
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {name}: {raw:?}")),
        _ => Ok(default),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let interval = Duration::from_secs(env_parse("REFRESH_INTERVAL_SECS", 300u64)?);
        let buffer_minutes = env_parse("REFRESH_BUFFER_MINUTES", 5i64)?;
        let mut refresh = RefreshSettings {
            interval,
            buffer_minutes,
            threshold_minutes: 0,
            deadline: Duration::from_secs(env_parse("REFRESH_DEADLINE_SECS", 55u64)?),
            concurrency: env_parse("REFRESH_CONCURRENCY", 4usize)?,
            daemon_enabled: env_parse("REFRESH_DAEMON_ENABLED", true)?,
        };
        refresh.threshold_minutes =
            env_parse("REFRESH_THRESHOLD_MINUTES", refresh.min_threshold_minutes())?;
        refresh.validate()?;

        let gateway_url = env_opt("AUTH_GATEWAY_URL");
        if let Some(raw) = &gateway_url {
            url::Url::parse(raw).with_context(|| format!("Invalid AUTH_GATEWAY_URL: {raw}"))?;
        }

        let stale_minutes = env_parse("SYNC_STALE_AFTER_MINUTES", 60u64)?;

        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("PORT", 8430u16).context("Invalid PORT")?,

            database_url: env_opt("DATABASE_URL"),
            master_key: std::env::var("MASTER_KEY")
                .context("MASTER_KEY is required (32 bytes, base64)")?,
            hmac_secret: std::env::var("HMAC_SECRET")
                .context("HMAC_SECRET is required (base64)")?,

            auth_service_secret: std::env::var("AUTH_SERVICE_SECRET")
                .context("AUTH_SERVICE_SECRET is required for service-to-service auth")?,
            cron_secret: env_opt("CRON_SECRET"),
            cron_trusted_header: std::env::var("CRON_TRUSTED_HEADER")
                .unwrap_or_else(|_| "x-platform-cron".into())
                .to_ascii_lowercase(),

            gateway_url,
            gateway_key: env_opt("AUTH_GATEWAY_KEY"),
            gateway_timeout: Duration::from_secs(env_parse("AUTH_GATEWAY_TIMEOUT_SECS", 30u64)?),
            offline_mode: env_parse("OFFLINE_MODE", false)?,

            refresh: refresh.normalized(),

            sync_stale_after: (stale_minutes > 0)
                .then(|| Duration::from_secs(stale_minutes * 60)),
        })
    }
}
