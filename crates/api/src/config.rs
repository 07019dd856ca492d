use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use inferlink_auth::AuthenticatorConfig;
use inferlink_infra::{InferenceClientConfig, SubmissionConfig, SupervisorConfig, SweeperConfig};
use inferlink_jobs::RetryPolicy;

/// Process configuration, read once at startup.
#[derive(Clone)]
pub struct AppConfig {
    pub webhook_secret: Option<String>,
    pub production: bool,
    pub freshness_window: Duration,
    pub inference_base_url: String,
    pub inference_api_key: Option<String>,
    pub inference_timeout: Duration,
    pub max_attempts: u32,
    pub max_age: Duration,
    pub sweep_interval: Duration,
    pub retry_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub bind_addr: SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `get`.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let webhook_secret = get("WEBHOOK_SECRET").filter(|s| !s.is_empty());
        let production = get("APP_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production"));

        if production && webhook_secret.is_none() {
            bail!("WEBHOOK_SECRET must be set when APP_ENV=production");
        }

        let config = Self {
            webhook_secret,
            production,
            freshness_window: Duration::from_secs(parse_or(&get, "WEBHOOK_FRESHNESS_SECS", 300)?),
            inference_base_url: get("INFERENCE_BASE_URL").unwrap_or_else(|| "http://127.0.0.1:9000".to_string()),
            inference_api_key: get("INFERENCE_API_KEY").filter(|s| !s.is_empty()),
            inference_timeout: Duration::from_secs(parse_or(&get, "INFERENCE_TIMEOUT_SECS", 30)?),
            max_attempts: parse_or(&get, "JOB_MAX_ATTEMPTS", 5)?,
            max_age: Duration::from_secs(parse_or(&get, "JOB_MAX_AGE_SECS", 86_400)?),
            sweep_interval: Duration::from_secs(parse_or(&get, "SWEEP_INTERVAL_SECS", 60)?),
            retry_interval: Duration::from_secs(parse_or(&get, "RETRY_INTERVAL_SECS", 5)?),
            max_concurrent_tasks: parse_or(&get, "MAX_CONCURRENT_TASKS", 16)?,
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
        };

        config.retry_policy().validate().context("invalid retry configuration")?;
        if config.sweep_interval.is_zero() || config.retry_interval.is_zero() {
            bail!("SWEEP_INTERVAL_SECS and RETRY_INTERVAL_SECS must be positive");
        }

        Ok(config)
    }

    pub fn authenticator_config(&self) -> AuthenticatorConfig {
        let base = match &self.webhook_secret {
            Some(secret) => AuthenticatorConfig::with_secret(secret.clone()),
            None => AuthenticatorConfig::unauthenticated(),
        };
        base.with_freshness_window(self.freshness_window).production(self.production)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_max_age(self.max_age)
    }

    pub fn client_config(&self) -> InferenceClientConfig {
        let config = InferenceClientConfig::new(self.inference_base_url.clone())
            .with_request_timeout(self.inference_timeout);
        match &self.inference_api_key {
            Some(key) => config.with_api_key(key.clone()),
            None => config,
        }
    }

    pub fn submission_config(&self) -> SubmissionConfig {
        SubmissionConfig {
            submit_timeout: self.inference_timeout,
            fetch_timeout: self.inference_timeout,
            ..SubmissionConfig::default()
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            ..SweeperConfig::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::default()
            .with_name("api-submissions")
            .with_max_concurrent(self.max_concurrent_tasks)
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("production", &self.production)
            .field("freshness_window", &self.freshness_window)
            .field("inference_base_url", &self.inference_base_url)
            .field("inference_api_key", &self.inference_api_key.as_ref().map(|_| "<redacted>"))
            .field("inference_timeout", &self.inference_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("max_age", &self.max_age)
            .field("sweep_interval", &self.sweep_interval)
            .field("retry_interval", &self.retry_interval)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}
