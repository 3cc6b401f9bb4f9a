//! TOML configuration for `postsync`.
//!
//! Every run reads a single file (default `./config/postsync.toml`). Sections
//! map one-to-one onto the pipeline stages: `[browser]` for the render
//! client, `[chunking]`, `[embedding]`, `[index]`, `[sync]` for run policy,
//! and one `[sources.<name>]` table per feed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling shared by the embedding service and the vector index.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserConfig {
    #[serde(default = "default_browser_host")]
    pub host: String,
    #[serde(default = "default_browser_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            host: default_browser_host(),
            port: default_browser_port(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl BrowserConfig {
    /// Local discovery endpoint advertising the control channel address.
    pub fn discovery_url(&self) -> String {
        format!("http://{}:{}/json/version", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn default_browser_host() -> String {
    "127.0.0.1".to_string()
}
fn default_browser_port() -> u16 {
    9222
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    30
}
fn default_settle_ms() -> u64 {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_words")]
    pub target_words: usize,
    /// Defaults to 10% of `target_words`.
    #[serde(default)]
    pub overlap_words: Option<usize>,
    /// Trailing words small enough to fold into the previous window.
    /// Defaults to `2 × overlap`.
    #[serde(default)]
    pub tail_min_words: Option<usize>,
    #[serde(default = "default_context_probe")]
    pub link_context_probe_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: default_target_words(),
            overlap_words: None,
            tail_min_words: None,
            link_context_probe_chars: default_context_probe(),
        }
    }
}

impl ChunkingConfig {
    pub fn overlap(&self) -> usize {
        self.overlap_words.unwrap_or(self.target_words / 10)
    }

    pub fn tail_threshold(&self) -> usize {
        self.tail_min_words.unwrap_or(self.overlap() * 2)
    }

    /// Words the window advances between consecutive chunks.
    pub fn step(&self) -> usize {
        self.target_words - self.overlap()
    }
}

fn default_target_words() -> usize {
    800
}
fn default_context_probe() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            base_url: default_embedding_base_url(),
            api_key_env: default_embedding_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout(),
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
fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_provider")]
    pub provider: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_index_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_index_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_content_preview")]
    pub content_preview_chars: usize,
    #[serde(default = "default_max_links_bytes")]
    pub max_links_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            host: None,
            api_key_env: default_index_key_env(),
            batch_size: default_batch_size(),
            timeout_secs: default_index_timeout(),
            content_preview_chars: default_content_preview(),
            max_links_bytes: default_max_links_bytes(),
        }
    }
}

impl IndexConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_index_provider() -> String {
    "disabled".to_string()
}
fn default_index_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}
fn default_index_timeout() -> u64 {
    30
}
fn default_content_preview() -> usize {
    1000
}
fn default_max_links_bytes() -> usize {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_item_delay_ms")]
    pub item_delay_ms: u64,
    #[serde(default = "default_item_timeout")]
    pub item_timeout_secs: u64,
    #[serde(default = "default_feed_timeout")]
    pub feed_timeout_secs: u64,
    #[serde(default = "default_feed_retries")]
    pub feed_max_retries: u32,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            item_delay_ms: default_item_delay_ms(),
            item_timeout_secs: default_item_timeout(),
            feed_timeout_secs: default_feed_timeout(),
            feed_max_retries: default_feed_retries(),
            owner: None,
            backup_dir: None,
        }
    }
}

fn default_item_delay_ms() -> u64 {
    2000
}
fn default_item_timeout() -> u64 {
    180
}
fn default_feed_timeout() -> u64 {
    30
}
fn default_feed_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub feed_url: String,
    pub namespace: String,
    /// `source` tag stamped on chunk metadata; defaults to the source name.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default = "default_author")]
    pub default_author: String,
    #[serde(default)]
    pub cookie_env: Option<String>,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_exclude_links")]
    pub exclude_links: Vec<String>,
}

impl SourceConfig {
    pub fn tag_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.tag.as_deref().unwrap_or(name)
    }
}

fn default_author() -> String {
    "Unknown".to_string()
}
fn default_cookie_name() -> String {
    "substack.sid".to_string()
}
fn default_exclude_links() -> Vec<String> {
    vec!["*substack.com/subscribe*".to_string()]
}

impl Config {
    /// Look up a configured source by name.
    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.sources.keys().map(String::as_str).collect();
            anyhow::anyhow!(
                "Unknown source: '{}'. Configured: {}",
                name,
                if known.is_empty() {
                    "(none)".to_string()
                } else {
                    known.join(", ")
                }
            )
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.target_words == 0 {
        anyhow::bail!("chunking.target_words must be > 0");
    }
    if chunking.overlap() >= chunking.target_words {
        anyhow::bail!("chunking.overlap_words must be < chunking.target_words");
    }
    if chunking.tail_threshold() > chunking.target_words {
        anyhow::bail!("chunking.tail_min_words must be <= chunking.target_words");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if !(1..=MAX_BATCH_SIZE).contains(&config.embedding.batch_size) {
        anyhow::bail!("embedding.batch_size must be in 1..={}", MAX_BATCH_SIZE);
    }

    match config.index.provider.as_str() {
        "disabled" | "pinecone" => {}
        other => anyhow::bail!(
            "Unknown index provider: '{}'. Must be disabled or pinecone.",
            other
        ),
    }
    if config.index.is_enabled() && config.index.host.is_none() {
        anyhow::bail!("index.host must be specified when provider is 'pinecone'");
    }
    if !(1..=MAX_BATCH_SIZE).contains(&config.index.batch_size) {
        anyhow::bail!("index.batch_size must be in 1..={}", MAX_BATCH_SIZE);
    }

    for (name, source) in &config.sources {
        if source.feed_url.trim().is_empty() {
            anyhow::bail!("sources.{}.feed_url must not be empty", name);
        }
        if source.namespace.trim().is_empty() {
            anyhow::bail!("sources.{}.namespace must not be empty", name);
        }
    }

    Ok(())
}
