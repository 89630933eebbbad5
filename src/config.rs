//! Worker configuration loaded from environment variables.
//!
//! Every setting has a default so the worker starts with an empty
//! environment. Values that fail to parse fall back to the default and log a
//! warning instead of aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::stage::FolderLayout;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_root: PathBuf,
    pub queue: QueueConfig,
    pub whisper: WhisperConfig,
    pub translate: TranslateConfig,
    pub harness: HarnessConfig,
    pub telemetry: TelemetryConfig,
    pub dry_run: bool,
    pub retry_staging_on_start: bool,
}

/// OTLP span export. No endpoint means spans stay in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub capacity: usize,
    /// Period of the pending-job sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(5000),
            capacity: 100,
            sweep_interval: Some(Duration::from_millis(30_000)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhisperConfig {
    pub script: String,
    pub model: String,
    pub language: String,
    pub prompt: Option<String>,
    pub postprocess_script: String,
    pub optimize_subtitles: bool,
    pub split_sentences: bool,
    pub remove_punctuation: bool,
    pub max_cjk_chars: u32,
    pub max_english_words: u32,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            script: "/app/scripts/transcribe.py".to_string(),
            model: "large-v2".to_string(),
            language: "auto".to_string(),
            prompt: None,
            postprocess_script: "/app/scripts/subtitle_processor.py".to_string(),
            optimize_subtitles: false,
            split_sentences: false,
            remove_punctuation: false,
            max_cjk_chars: 25,
            max_english_words: 18,
        }
    }
}

impl WhisperConfig {
    pub fn wants_postprocess(&self) -> bool {
        self.optimize_subtitles || self.split_sentences || self.remove_punctuation
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslateConfig {
    pub script: String,
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub target_lang: String,
    pub custom_server: Option<String>,
    pub custom_endpoint: Option<String>,
    pub instruction: Option<String>,
    /// Requests per minute; 0 disables rate limiting.
    pub rate_limit_rpm: u32,
    pub extra_args: Vec<String>,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            script: "/app/llm-subtrans/scripts/llm-subtrans.py".to_string(),
            provider: "openai".to_string(),
            model: None,
            api_key: None,
            target_lang: "Simplified Chinese".to_string(),
            custom_server: None,
            custom_endpoint: None,
            instruction: None,
            rate_limit_rpm: 0,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub interpreter: String,
    pub timeout: Duration,
    pub failure_markers: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            timeout: Duration::from_secs(4 * 60 * 60),
            failure_markers: vec!["Error:".to_string(), "Traceback".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
            queue: QueueConfig::default(),
            whisper: WhisperConfig::default(),
            translate: TranslateConfig::default(),
            harness: HarnessConfig::default(),
            telemetry: TelemetryConfig {
                otlp_endpoint: None,
                service_name: "subtitle-worker".to_string(),
            },
            dry_run: false,
            retry_staging_on_start: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let sweep_ms: u64 = parse_or(&get, "QUEUE_SWEEP_INTERVAL_MS", 30_000);

        Self {
            data_root: get("DATA_ROOT").map(PathBuf::from).unwrap_or(defaults.data_root),
            queue: QueueConfig {
                max_retries: parse_or(&get, "QUEUE_MAX_RETRIES", defaults.queue.max_retries).max(1),
                retry_delay: Duration::from_millis(parse_or(&get, "QUEUE_RETRY_DELAY_MS", 5000)),
                capacity: parse_or(&get, "QUEUE_CAPACITY", defaults.queue.capacity).max(1),
                sweep_interval: (sweep_ms > 0).then(|| Duration::from_millis(sweep_ms)),
            },
            whisper: WhisperConfig {
                script: get("WHISPER_SCRIPT").unwrap_or(defaults.whisper.script),
                model: get("WHISPER_MODEL").unwrap_or(defaults.whisper.model),
                language: get("WHISPER_LANGUAGE").unwrap_or(defaults.whisper.language),
                prompt: get("WHISPER_PROMPT"),
                postprocess_script: get("POSTPROCESS_SCRIPT")
                    .unwrap_or(defaults.whisper.postprocess_script),
                optimize_subtitles: parse_bool(&get, "WHISPER_OPTIMIZE"),
                split_sentences: parse_bool(&get, "WHISPER_SPLIT"),
                remove_punctuation: parse_bool(&get, "WHISPER_REMOVE_PUNCTUATION"),
                max_cjk_chars: parse_or::<u32, _>(&get, "WHISPER_MAX_CJK_CHARS", 25).max(1),
                max_english_words: parse_or::<u32, _>(&get, "WHISPER_MAX_ENGLISH_WORDS", 18).max(1),
            },
            translate: TranslateConfig {
                script: get("TRANSLATE_SCRIPT").unwrap_or(defaults.translate.script),
                provider: get("TRANSLATE_PROVIDER").unwrap_or(defaults.translate.provider),
                model: get("TRANSLATE_MODEL"),
                api_key: get("TRANSLATE_API_KEY"),
                target_lang: get("TRANSLATE_TARGET_LANG").unwrap_or(defaults.translate.target_lang),
                custom_server: get("TRANSLATE_CUSTOM_SERVER"),
                custom_endpoint: get("TRANSLATE_CUSTOM_ENDPOINT"),
                instruction: get("TRANSLATE_INSTRUCTION"),
                rate_limit_rpm: parse_or(&get, "TRANSLATE_RATE_LIMIT_RPM", 0),
                extra_args: get("TRANSLATE_EXTRA_ARGS")
                    .map(|v| v.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            },
            harness: HarnessConfig {
                interpreter: get("HARNESS_INTERPRETER").unwrap_or(defaults.harness.interpreter),
                timeout: Duration::from_secs(parse_or(&get, "HARNESS_TIMEOUT_SECS", 4 * 60 * 60)),
                failure_markers: get("HARNESS_FAILURE_MARKERS")
                    .map(|v| split_list(&v))
                    .unwrap_or(defaults.harness.failure_markers),
            },
            telemetry: TelemetryConfig {
                otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
                service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.telemetry.service_name),
            },
            dry_run: parse_bool(&get, "DRY_RUN"),
            retry_staging_on_start: parse_bool(&get, "RETRY_STAGING_ON_START"),
        }
    }

    pub fn folders(&self) -> FolderLayout {
        FolderLayout::under(&self.data_root)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default {:?}", key, raw, default);
            default
        }),
        None => default,
    }
}

fn parse_bool<G>(get: &G, key: &str) -> bool
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!("Invalid boolean for {}: {:?}, using false", key, v);
            false
        }
        None => false,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
