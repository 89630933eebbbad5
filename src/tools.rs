//! Front-ends for the external transcription and translation tools.
//!
//! Both tools are opaque scripts: they consume a file path and leave a file
//! behind. This module only knows how to build their command lines and where
//! their output lands; running them is the harness's job.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{TranslateConfig, WhisperConfig};
use crate::error::HarnessError;
use crate::harness::{CommandSpec, Harness};
use crate::rate_limit::RateLimiter;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcribe: Send + Sync {
    /// Produces a subtitle for `video` and returns its path.
    async fn transcribe(
        &self,
        video: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, HarnessError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Translate: Send + Sync {
    /// Translates `subtitle` and returns the translated file's path.
    async fn translate(
        &self,
        subtitle: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, HarnessError>;
}

/// `<dir>/<stem><suffix>` for a sibling of `path`.
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}", stem, suffix))
}

/// Transcription through the faster-whisper script, with optional LLM
/// post-processing of the resulting subtitle.
pub struct Transcriber {
    harness: Harness,
    interpreter: String,
    whisper: WhisperConfig,
    translate: TranslateConfig,
}

impl Transcriber {
    pub fn new(
        harness: Harness,
        interpreter: impl Into<String>,
        whisper: WhisperConfig,
        translate: TranslateConfig,
    ) -> Self {
        Self {
            harness,
            interpreter: interpreter.into(),
            whisper,
            translate,
        }
    }

    pub fn command(&self, video: &Path) -> CommandSpec {
        let srt = sibling_with_suffix(video, ".srt");
        let mut args = vec![
            self.whisper.script.clone(),
            video.display().to_string(),
            srt.display().to_string(),
            "--model".to_string(),
            self.whisper.model.clone(),
        ];

        let lang = self.whisper.language.trim();
        if !lang.is_empty() && lang != "auto" {
            args.extend(["--language".to_string(), lang.to_string()]);
        }
        if let Some(prompt) = &self.whisper.prompt {
            args.extend(["--prompt".to_string(), prompt.clone()]);
        }

        CommandSpec::new(&self.interpreter, args, srt)
    }

    /// Post-processor invocation rewriting `srt` in place.
    ///
    /// Optimising and splitting need the translation provider's credentials;
    /// without an API key those switches cannot be honoured.
    pub fn postprocess_command(&self, srt: &Path) -> Result<CommandSpec, String> {
        let cfg = &self.whisper;
        let mut args = vec![
            cfg.postprocess_script.clone(),
            srt.display().to_string(),
            srt.display().to_string(),
        ];

        if cfg.optimize_subtitles || cfg.split_sentences {
            let api_key = self
                .translate
                .api_key
                .as_ref()
                .ok_or_else(|| "translate API key required for subtitle post-processing".to_string())?;

            let base_url = match self.translate.provider.to_lowercase().as_str() {
                "openrouter" => "https://openrouter.ai/api".to_string(),
                "custom" => self
                    .translate
                    .custom_server
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
                _ => "https://api.openai.com".to_string(),
            };
            let model = self
                .translate
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string());

            args.extend([
                "--api-key".to_string(),
                api_key.clone(),
                "--base-url".to_string(),
                base_url,
                "--model".to_string(),
                model,
            ]);
        }

        if cfg.optimize_subtitles {
            args.push("--optimize".to_string());
            if let Some(prompt) = &cfg.prompt {
                args.extend(["--reference".to_string(), prompt.clone()]);
            }
        }

        if cfg.split_sentences {
            args.extend([
                "--split".to_string(),
                "--max-cjk".to_string(),
                cfg.max_cjk_chars.to_string(),
                "--max-english".to_string(),
                cfg.max_english_words.to_string(),
            ]);
        }

        if cfg.remove_punctuation {
            args.push("--remove-punctuation".to_string());
        }

        Ok(CommandSpec::new(&self.interpreter, args, srt))
    }

    async fn postprocess(&self, srt: &Path, cancel: &CancellationToken) -> Result<(), String> {
        let spec = self.postprocess_command(srt)?;
        info!("Post-processing subtitles...");
        self.harness
            .run(&spec, cancel)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Transcribe for Transcriber {
    async fn transcribe(
        &self,
        video: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, HarnessError> {
        info!(
            "Transcribing (faster-whisper, model {}): {}",
            self.whisper.model,
            video.display()
        );

        let srt = self.harness.run(&self.command(video), cancel).await?;
        info!("Transcription complete: {}", srt.display());

        if self.whisper.wants_postprocess() {
            if let Err(e) = self.postprocess(&srt, cancel).await {
                if cancel.is_cancelled() {
                    return Err(HarnessError::Cancelled {
                        program: self.interpreter.clone(),
                    });
                }
                warn!("Post-processing failed (using original): {}", e);
            }
        }

        Ok(srt)
    }
}

/// Subtitle translation through llm-subtrans, gated by the rate limiter.
pub struct Translator {
    harness: Harness,
    interpreter: String,
    config: TranslateConfig,
    limiter: RateLimiter,
}

impl Translator {
    pub fn new(harness: Harness, interpreter: impl Into<String>, config: TranslateConfig) -> Self {
        let limiter = RateLimiter::per_minute(config.rate_limit_rpm);
        Self {
            harness,
            interpreter: interpreter.into(),
            config,
            limiter,
        }
    }

    /// `<stem>.<lang-code><ext>` next to the input subtitle.
    pub fn output_path(&self, subtitle: &Path) -> PathBuf {
        let ext = subtitle
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        sibling_with_suffix(subtitle, &format!(".{}{}", lang_code(&self.config.target_lang), ext))
    }

    pub fn command(&self, subtitle: &Path) -> CommandSpec {
        let output = self.output_path(subtitle);
        let cfg = &self.config;
        let mut args = vec![
            cfg.script.clone(),
            subtitle.display().to_string(),
            "--target_language".to_string(),
            cfg.target_lang.clone(),
            "-o".to_string(),
            output.display().to_string(),
        ];

        let provider = cfg.provider.to_lowercase();
        if provider == "custom" {
            args.extend(["--provider".to_string(), "custom".to_string()]);
            if let Some(server) = &cfg.custom_server {
                args.extend(["--server".to_string(), server.clone()]);
            }
            if let Some(endpoint) = &cfg.custom_endpoint {
                args.extend(["--endpoint".to_string(), endpoint.clone()]);
            }
            args.push("--chat".to_string());
        } else {
            args.extend(["--provider".to_string(), provider]);
            if let Some(model) = &cfg.model {
                args.extend(["--model".to_string(), model.clone()]);
            }
        }

        if let Some(key) = &cfg.api_key {
            args.extend(["--apikey".to_string(), key.clone()]);
        }
        if let Some(instruction) = &cfg.instruction {
            args.extend(["--instruction".to_string(), instruction.clone()]);
        }
        args.extend(cfg.extra_args.iter().cloned());

        CommandSpec::new(&self.interpreter, args, output)
    }
}

#[async_trait]
impl Translate for Translator {
    async fn translate(
        &self,
        subtitle: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, HarnessError> {
        self.limiter.wait(cancel).await?;

        info!(
            "Translating: {} -> {}",
            subtitle.display(),
            self.config.target_lang
        );
        let translated = self.harness.run(&self.command(subtitle), cancel).await?;
        info!("Translation complete: {}", translated.display());
        Ok(translated)
    }
}

/// Short language code used in translated file names.
pub fn lang_code(target_lang: &str) -> String {
    let code = match target_lang.trim().to_lowercase().as_str() {
        "simplified chinese" | "chinese" => "zh",
        "traditional chinese" => "zh-tw",
        "japanese" => "ja",
        "korean" => "ko",
        "spanish" => "es",
        "french" => "fr",
        "german" => "de",
        "italian" => "it",
        "portuguese" => "pt",
        "russian" => "ru",
        "english" => "en",
        "thai" => "th",
        "vietnamese" => "vi",
        "indonesian" => "id",
        "malay" => "ms",
        "arabic" => "ar",
        "hindi" => "hi",
        other => {
            let prefix: String = other.chars().take(2).collect();
            return if prefix.chars().count() == 2 {
                prefix
            } else {
                "xx".to_string()
            };
        }
    };
    code.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use pretty_assertions::assert_eq;

    fn harness() -> Harness {
        Harness::new(&HarnessConfig::default()).with_console_echo(false)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_transcribe_command() {
        let whisper = WhisperConfig {
            language: "ja".to_string(),
            prompt: Some("names".to_string()),
            ..WhisperConfig::default()
        };
        let t = Transcriber::new(harness(), "python3", whisper, TranslateConfig::default());

        let spec = t.command(Path::new("/data/processing/SONE-269.mp4"));

        assert_eq!(spec.program, "python3");
        assert_eq!(
            spec.args,
            strings(&[
                "/app/scripts/transcribe.py",
                "/data/processing/SONE-269.mp4",
                "/data/processing/SONE-269.srt",
                "--model",
                "large-v2",
                "--language",
                "ja",
                "--prompt",
                "names",
            ])
        );
        assert_eq!(spec.expected_output, PathBuf::from("/data/processing/SONE-269.srt"));
    }

    #[test]
    fn test_auto_language_is_omitted() {
        let t = Transcriber::new(harness(), "python3", WhisperConfig::default(), TranslateConfig::default());
        let spec = t.command(Path::new("/v/A.mp4"));
        assert!(!spec.args.contains(&"--language".to_string()));
    }

    #[test]
    fn test_postprocess_requires_api_key() {
        let whisper = WhisperConfig {
            split_sentences: true,
            ..WhisperConfig::default()
        };
        let t = Transcriber::new(harness(), "python3", whisper, TranslateConfig::default());
        assert!(t.postprocess_command(Path::new("/v/A.srt")).is_err());
    }

    #[test]
    fn test_postprocess_command() {
        let whisper = WhisperConfig {
            split_sentences: true,
            remove_punctuation: true,
            ..WhisperConfig::default()
        };
        let translate = TranslateConfig {
            provider: "openrouter".to_string(),
            api_key: Some("k".to_string()),
            ..TranslateConfig::default()
        };
        let t = Transcriber::new(harness(), "python3", whisper, translate);

        let spec = t.postprocess_command(Path::new("/v/A.srt")).unwrap();

        assert_eq!(
            spec.args,
            strings(&[
                "/app/scripts/subtitle_processor.py",
                "/v/A.srt",
                "/v/A.srt",
                "--api-key",
                "k",
                "--base-url",
                "https://openrouter.ai/api",
                "--model",
                "gpt-4o-mini",
                "--split",
                "--max-cjk",
                "25",
                "--max-english",
                "18",
                "--remove-punctuation",
            ])
        );
    }

    #[test]
    fn test_translate_command_custom_provider() {
        let config = TranslateConfig {
            provider: "Custom".to_string(),
            custom_server: Some("http://localhost:1234".to_string()),
            custom_endpoint: Some("/v1/chat/completions".to_string()),
            api_key: Some("secret".to_string()),
            extra_args: strings(&["--maxlines", "40"]),
            ..TranslateConfig::default()
        };
        let t = Translator::new(harness(), "python3", config);

        let spec = t.command(Path::new("/p/SONE-269.srt"));

        assert_eq!(spec.expected_output, PathBuf::from("/p/SONE-269.zh.srt"));
        assert_eq!(
            spec.args,
            strings(&[
                "/app/llm-subtrans/scripts/llm-subtrans.py",
                "/p/SONE-269.srt",
                "--target_language",
                "Simplified Chinese",
                "-o",
                "/p/SONE-269.zh.srt",
                "--provider",
                "custom",
                "--server",
                "http://localhost:1234",
                "--endpoint",
                "/v1/chat/completions",
                "--chat",
                "--apikey",
                "secret",
                "--maxlines",
                "40",
            ])
        );
    }

    #[test]
    fn test_lang_code() {
        assert_eq!(lang_code("Simplified Chinese"), "zh");
        assert_eq!(lang_code("traditional chinese"), "zh-tw");
        assert_eq!(lang_code("Japanese"), "ja");
        assert_eq!(lang_code("Klingon"), "kl");
        assert_eq!(lang_code("x"), "xx");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tools_run_through_interpreter() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcribe_script = dir.path().join("transcribe.sh");
        std::fs::write(&transcribe_script, "printf '1\\n' > \"$2\"\n").unwrap();
        let translate_script = dir.path().join("translate.sh");
        std::fs::write(
            &translate_script,
            "while [ $# -gt 0 ]; do if [ \"$1\" = \"-o\" ]; then printf 'x' > \"$2\"; fi; shift; done\n",
        )
        .unwrap();
        let video = dir.path().join("SONE-269.mp4");
        std::fs::write(&video, b"video").unwrap();

        let whisper = WhisperConfig {
            script: transcribe_script.display().to_string(),
            ..WhisperConfig::default()
        };
        let translate = TranslateConfig {
            script: translate_script.display().to_string(),
            target_lang: "Japanese".to_string(),
            ..TranslateConfig::default()
        };
        let cancel = CancellationToken::new();

        let transcriber = Transcriber::new(harness(), "sh", whisper, translate.clone());
        let srt = transcriber.transcribe(&video, &cancel).await.unwrap();
        assert_eq!(srt, dir.path().join("SONE-269.srt"));

        let translator = Translator::new(harness(), "sh", translate);
        let translated = translator.translate(&srt, &cancel).await.unwrap();
        assert_eq!(translated, dir.path().join("SONE-269.ja.srt"));
    }

    #[cfg(unix)]
    fn counting_translator(dir: &Path, rpm: u32) -> Translator {
        let script = dir.join("translate.sh");
        std::fs::write(
            &script,
            "echo run >> \"$(dirname \"$0\")/runs\"\n\
             while [ $# -gt 0 ]; do if [ \"$1\" = \"-o\" ]; then printf 'x' > \"$2\"; fi; shift; done\n",
        )
        .unwrap();
        let config = TranslateConfig {
            script: script.display().to_string(),
            rate_limit_rpm: rpm,
            ..TranslateConfig::default()
        };
        Translator::new(harness(), "sh", config)
    }

    #[cfg(unix)]
    fn runs(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_before_rate_limit_never_spawns() {
        let dir = tempfile::TempDir::new().unwrap();
        let srt = dir.path().join("SONE-269.srt");
        std::fs::write(&srt, b"1").unwrap();
        let translator = counting_translator(dir.path(), 60);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = translator.translate(&srt, &cancel).await;

        assert!(matches!(result, Err(HarnessError::RateLimitCancelled)));
        assert_eq!(runs(dir.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_while_throttled() {
        let dir = tempfile::TempDir::new().unwrap();
        let srt = dir.path().join("SONE-269.srt");
        std::fs::write(&srt, b"1").unwrap();
        // One request per minute: the second call has to wait for a token.
        let translator = counting_translator(dir.path(), 1);

        let cancel = CancellationToken::new();
        translator.translate(&srt, &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            translator.translate(&srt, &cancel),
        )
        .await
        .expect("cancel must end the wait");

        assert!(matches!(result, Err(HarnessError::RateLimitCancelled)));
        assert_eq!(runs(dir.path()), 1);
    }
}
