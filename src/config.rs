//! Configuration parsing and validation.
//!
//! knowbase is configured with a TOML file (default `./config/kb.toml`).
//! API keys are read from the environment, which `main` populates from a
//! `.env` file via `dotenvy` before the config is loaded.
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//!
//! [chunking]
//! max_tokens = 700
//! overlap_tokens = 80
//!
//! [retrieval]
//! hybrid_alpha = 0.6
//! final_limit = 12
//! context_chunks = 6
//!
//! [embedding]
//! provider = "openai"            # disabled | openai | ollama
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "gemini"            # extractive | openai | gemini | ollama
//! model = "gemini-1.5-flash"
//! models = ["gemini-1.5-flash", "gpt-4o", "gpt-4o-mini"]
//!
//! [chat]
//! history_turns = 4
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [connectors.filesystem.vault]
//! root = "~/Obsidian/Family"
//!
//! [connectors.filesystem.library]
//! root = "~/Calibre Library"
//! include_globs = ["**/*.epub", "**/*.pdf"]
//! ```
//!
//! Directories listed in `KB_NOTES_DIRS` (separated like `PATH`) are added
//! as extra filesystem connectors named `env1`, `env2`, and so on.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable listing extra notes directories.
pub const NOTES_DIRS_ENV: &str = "KB_NOTES_DIRS";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Passages handed to the language model per question.
    #[serde(default = "default_context_chunks")]
    pub context_chunks: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_limit: default_final_limit(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            context_chunks: default_context_chunks(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_final_limit() -> i64 {
    12
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_context_chunks() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for OpenAI-compatible or Ollama endpoints.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    /// Default model for questions that do not pick one.
    #[serde(default)]
    pub model: Option<String>,
    /// Models a question may select. Empty means only the default.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            models: Vec::new(),
            openai_base_url: default_openai_base_url(),
            gemini_base_url: default_gemini_base_url(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
        }
    }
}

impl LlmConfig {
    /// The model used when a question does not name one.
    pub fn default_model(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.provider)
    }

    /// Every model a question may select, default first.
    pub fn available_models(&self) -> Vec<String> {
        let mut out = vec![self.default_model().to_string()];
        for m in &self.models {
            if !out.contains(m) {
                out.push(m.clone());
            }
        }
        out
    }
}

fn default_llm_provider() -> String {
    "extractive".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    1024
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Prior turns replayed with each question.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
        }
    }
}

fn default_history_turns() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Conversations kept in memory; the least recently used is dropped first.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Conversations idle this long are dropped.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_sessions: default_max_sessions(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

fn default_max_sessions() -> usize {
    256
}

fn default_session_idle_secs() -> u64 {
    6 * 60 * 60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    /// Named filesystem connectors, e.g. `[connectors.filesystem.vault]`.
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Files larger than this are skipped.
    #[serde(default = "default_max_extract_bytes")]
    pub max_extract_bytes: u64,
}

impl FilesystemConnectorConfig {
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_extract_bytes: default_max_extract_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    ["**/*.md", "**/*.markdown", "**/*.txt", "**/*.pdf", "**/*.epub"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_extract_bytes() -> u64 {
    50 * 1024 * 1024
}

/// Add one filesystem connector per directory in a `PATH`-style list.
pub fn apply_notes_dirs(config: &mut Config, value: &str) {
    let dirs = std::env::split_paths(value).filter(|p| !p.as_os_str().is_empty());
    for (i, dir) in dirs.enumerate() {
        config
            .connectors
            .filesystem
            .entry(format!("env{}", i + 1))
            .or_insert_with(|| FilesystemConnectorConfig::with_root(dir));
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(dirs) = std::env::var(NOTES_DIRS_ENV) {
        apply_notes_dirs(&mut config, &dirs);
    }

    let home = std::env::var_os("HOME").map(PathBuf::from);
    if let Some(home) = home.as_deref() {
        config.db.path = expand_home(&config.db.path, home);
        for fs_config in config.connectors.filesystem.values_mut() {
            fs_config.root = expand_home(&fs_config.root, home);
        }
    }

    validate(&config)?;
    Ok(config)
}

/// Replace a leading `~` component with `home`.
fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.context_chunks == 0 {
        bail!("retrieval.context_chunks must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.unwrap_or(0) == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    match config.llm.provider.as_str() {
        "extractive" => {}
        "openai" | "gemini" | "ollama" => {
            if config.llm.model.is_none() {
                bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be extractive, openai, gemini, or ollama.",
            other
        ),
    }

    if config.chat.history_turns == 0 {
        bail!("chat.history_turns must be >= 1");
    }

    if config.server.max_sessions == 0 {
        bail!("server.max_sessions must be >= 1");
    }

    for (name, fs) in &config.connectors.filesystem {
        if fs.root.as_os_str().is_empty() {
            bail!("connectors.filesystem.{}.root must not be empty", name);
        }
        if name.is_empty() || name.contains(':') {
            bail!("invalid filesystem connector name: '{}'", name);
        }
    }

    Ok(())
}
