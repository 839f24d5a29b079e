use std::{env, time::Duration};

use crate::sampling::SamplingConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// `None` lets a silent stream wait forever.
    pub stream_idle_timeout: Option<Duration>,
    pub debounce: Duration,
    pub min_prompt_chars: usize,
    pub auto_analyze: bool,
    pub top_k_mass: usize,
    pub sampling: SamplingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            stream_idle_timeout: Some(Duration::from_secs(60)),
            debounce: Duration::from_millis(1000),
            min_prompt_chars: 3,
            auto_analyze: true,
            top_k_mass: 20,
            sampling: SamplingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let base_url = env::var("TOKENLENS_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            anyhow::bail!("TOKENLENS_BASE_URL must be an http(s) URL, got {base_url:?}");
        }

        let request_timeout = env_parse::<u64>("REQUEST_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let connect_timeout = env_parse::<u64>("CONNECT_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);
        let stream_idle_timeout = match env_parse::<u64>("STREAM_IDLE_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.stream_idle_timeout,
        };

        let debounce = env_parse::<u64>("ANALYZE_DEBOUNCE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.debounce);
        let min_prompt_chars =
            env_parse("ANALYZE_MIN_PROMPT_CHARS").unwrap_or(defaults.min_prompt_chars);
        let auto_analyze = env_parse("AUTO_ANALYZE").unwrap_or(defaults.auto_analyze);
        let top_k_mass = env_parse("TOP_K_MASS").unwrap_or(defaults.top_k_mass);

        let base = defaults.sampling;
        let sampling = SamplingConfig {
            prompt: env::var("PROMPT").unwrap_or(base.prompt),
            temperature: env_parse("TEMPERATURE").unwrap_or(base.temperature),
            top_k: env_parse("TOP_K").unwrap_or(base.top_k),
            top_p: env_parse("TOP_P").unwrap_or(base.top_p),
            max_new_tokens: env_parse("MAX_NEW_TOKENS").unwrap_or(base.max_new_tokens),
            sample: env_parse("DO_SAMPLE").unwrap_or(base.sample),
        }
        .clamped();

        Ok(Self {
            base_url,
            request_timeout,
            connect_timeout,
            stream_idle_timeout,
            debounce,
            min_prompt_chars,
            auto_analyze,
            top_k_mass,
            sampling,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
