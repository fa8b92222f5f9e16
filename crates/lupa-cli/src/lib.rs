//! Command-line and environment configuration for the Lupa service.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "lupa", about = "Orquestrador de investigações de transparência pública")]
pub struct Cli {
    /// Socket address the gateway binds to.
    #[arg(long, env = "LUPA_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Directory holding the SQLite stores and runtime state.
    #[arg(long, env = "LUPA_STATE_DIR", default_value = "./lupa-state")]
    pub state_dir: String,

    /// Log filter, `tracing_subscriber` env-filter syntax.
    #[arg(long, env = "LUPA_LOG", default_value = "info")]
    pub log_filter: String,

    /// Intent classifier backend: primary provider name, or unset for the
    /// built-in lexicon classifier.
    #[arg(long, env = "LLM_PROVIDER")]
    pub llm_provider: Option<String>,

    /// OpenAI-compatible endpoint for the classifier backend.
    #[arg(long, env = "LLM_API_BASE", default_value = "https://api.openai.com/v1")]
    pub llm_api_base: String,

    /// API key for the classifier backend.
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Model used for intent classification.
    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Classifier time bound; timeouts degrade to `unknown`.
    #[arg(long, env = "LLM_TIMEOUT_MS", default_value_t = 2_500)]
    pub llm_timeout_ms: u64,

    /// Shared KV address; absence forces memory-only cache mode.
    #[arg(long, env = "CACHE_BACKEND_URL")]
    pub cache_backend_url: Option<String>,

    /// Federal portal API key; absence forces demo mode.
    #[arg(long, env = "TRANSPARENCY_API_KEY", hide_env_values = true)]
    pub transparency_api_key: Option<String>,

    /// Whole-investigation deadline.
    #[arg(long, env = "INVESTIGATION_TIMEOUT_SECONDS", default_value_t = 180)]
    pub investigation_timeout_seconds: u64,

    /// Failures inside the window that open a source's breaker.
    #[arg(long, env = "CIRCUIT_BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    pub circuit_breaker_failure_threshold: usize,

    /// Cooldown before an open breaker admits its half-open probe.
    #[arg(long, env = "CIRCUIT_BREAKER_COOLDOWN_SECONDS", default_value_t = 30)]
    pub circuit_breaker_cooldown_seconds: u64,

    /// Concurrent handles per agent type.
    #[arg(long, env = "AGENT_POOL_MAX_PER_TYPE", default_value_t = 4)]
    pub agent_pool_max_per_type: usize,

    /// Words per streamed text chunk.
    #[arg(long, env = "STREAM_TEXT_CHUNK_WORDS", default_value_t = 5)]
    pub stream_text_chunk_words: usize,

    /// Raw bytes per streamed audio chunk (pre-base64).
    #[arg(long, env = "STREAM_AUDIO_CHUNK_BYTES", default_value_t = 4096)]
    pub stream_audio_chunk_bytes: usize,

    /// Per-source fetch timeout.
    #[arg(long, env = "SOURCE_FETCH_TIMEOUT_MS", default_value_t = 10_000)]
    pub source_fetch_timeout_ms: u64,
}

impl Cli {
    pub fn demo_mode(&self) -> bool {
        self.transparency_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .is_none()
    }

    pub fn llm_classifier_enabled(&self) -> bool {
        matches!(
            (self.llm_provider.as_deref(), self.llm_api_key.as_deref()),
            (Some(provider), Some(key)) if !provider.trim().is_empty() && !key.trim().is_empty()
        )
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn unit_defaults_match_design_table() {
        let cli = Cli::parse_from(["lupa"]);
        assert_eq!(cli.bind, "0.0.0.0:8080");
        assert_eq!(cli.investigation_timeout_seconds, 180);
        assert_eq!(cli.circuit_breaker_failure_threshold, 5);
        assert_eq!(cli.circuit_breaker_cooldown_seconds, 30);
        assert_eq!(cli.agent_pool_max_per_type, 4);
        assert_eq!(cli.stream_text_chunk_words, 5);
        assert_eq!(cli.stream_audio_chunk_bytes, 4096);
        assert_eq!(cli.source_fetch_timeout_ms, 10_000);
        assert!(cli.demo_mode());
        assert!(!cli.llm_classifier_enabled());
    }

    #[test]
    fn unit_flags_override_defaults() {
        let cli = Cli::parse_from([
            "lupa",
            "--transparency-api-key",
            "chave-real",
            "--investigation-timeout-seconds",
            "60",
            "--llm-provider",
            "openai",
            "--llm-api-key",
            "sk-teste",
        ]);
        assert!(!cli.demo_mode());
        assert!(cli.llm_classifier_enabled());
        assert_eq!(cli.investigation_timeout_seconds, 60);
    }
}
