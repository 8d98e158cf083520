use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Roots tracked automatically when the daemon starts.
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub index: VectorIndexConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub ranking: RankingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_path")]
    pub path: PathBuf,

    /// Longest edge of a stored thumbnail, in pixels.
    #[serde(default = "default_thumb_max_edge")]
    pub max_edge: u32,
}

fn default_thumb_path() -> PathBuf {
    data_dir().join("thumbs")
}

fn default_thumb_max_edge() -> u32 {
    384
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumb_path(),
            max_edge: default_thumb_max_edge(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,

    /// Initial capacity of a fresh index, and the floor for every resize.
    #[serde(default = "default_index_capacity")]
    pub default_capacity: usize,

    /// Minimum seconds between two index flushes from the ingest worker.
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
}

fn default_index_path() -> PathBuf {
    data_dir().join("index")
}

fn default_index_capacity() -> usize {
    250_000
}

fn default_persist_interval_secs() -> u64 {
    5
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            default_capacity: default_index_capacity(),
            persist_interval_secs: default_persist_interval_secs(),
        }
    }
}

impl VectorIndexConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_ingest_queue_max")]
    pub ingest_queue_max: usize,

    #[serde(default = "default_scan_queue_max")]
    pub scan_queue_max: usize,

    /// Persisted root errors are written at most once per this interval.
    #[serde(default = "default_root_error_interval_ms")]
    pub root_error_interval_ms: u64,

    /// Number of completed ingests kept for the activity feed.
    #[serde(default = "default_recent_max")]
    pub recent_max: usize,

    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Upper bound on how long shutdown waits for each worker thread.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_ingest_queue_max() -> usize {
    3000
}

fn default_scan_queue_max() -> usize {
    32
}

fn default_root_error_interval_ms() -> u64 {
    2000
}

fn default_recent_max() -> usize {
    50
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_queue_max: default_ingest_queue_max(),
            scan_queue_max: default_scan_queue_max(),
            root_error_interval_ms: default_root_error_interval_ms(),
            recent_max: default_recent_max(),
            monitor_interval_secs: default_monitor_interval_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn root_error_interval(&self) -> Duration {
        Duration::from_millis(self.root_error_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_enabled")]
    pub enabled: bool,

    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Fetch missing ONNX models on first use.
    #[serde(default = "default_auto_download")]
    pub auto_download: bool,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
}

fn default_embedding_enabled() -> bool {
    true
}

fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

fn default_auto_download() -> bool {
    true
}

fn default_embedding_dimension() -> usize {
    512 // CLIP ViT-B/32
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: default_embedding_enabled(),
            model_dir: default_model_dir(),
            auto_download: default_auto_download(),
            dimension: default_embedding_dimension(),
        }
    }
}

/// Tuning knobs for the hybrid ranker. The values are empirical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Lower bound of the first ANN breadth.
    #[serde(default = "default_base_k_min")]
    pub base_k_min: usize,

    /// Upper bound of the first ANN breadth.
    #[serde(default = "default_base_k_max")]
    pub base_k_max: usize,

    /// Slack added to `offset + limit` when sizing the first breadth.
    #[serde(default = "default_base_k_slack")]
    pub base_k_slack: usize,

    /// Hard cap on ANN breadth while widening.
    #[serde(default = "default_max_k")]
    pub max_k: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Number of top scores fed to the elbow detector.
    #[serde(default = "default_elbow_sample")]
    pub elbow_sample: usize,

    /// Last adjacent-pair index the elbow detector inspects.
    #[serde(default = "default_elbow_window")]
    pub elbow_window: usize,

    /// Absolute minimum drop that counts as an elbow.
    #[serde(default = "default_elbow_min_drop")]
    pub elbow_min_drop: f32,

    /// Minimum drop relative to the top score that counts as an elbow.
    #[serde(default = "default_elbow_relative_drop")]
    pub elbow_relative_drop: f32,

    /// Split size used when no elbow is steep enough.
    #[serde(default = "default_split")]
    pub default_split: usize,

    /// Keep threshold sits this far below the elbow score.
    #[serde(default = "default_keep_margin")]
    pub keep_margin: f32,

    #[serde(default = "default_keep_floor")]
    pub keep_floor: f32,

    #[serde(default = "default_keep_floor_weak")]
    pub keep_floor_weak: f32,

    /// Floor for queries of at most two tokens with a weak top score.
    #[serde(default = "default_keep_floor_short")]
    pub keep_floor_short: f32,

    #[serde(default = "default_weak_top_score")]
    pub weak_top_score: f32,

    #[serde(default = "default_short_query_top_score")]
    pub short_query_top_score: f32,

    #[serde(default = "default_highlight_min")]
    pub highlight_min: usize,

    #[serde(default = "default_highlight_max")]
    pub highlight_max: usize,

    /// Only this many leading eligible hits are counted for highlighting.
    #[serde(default = "default_highlight_window")]
    pub highlight_window: usize,

    #[serde(default = "default_max_query_tokens")]
    pub max_query_tokens: usize,

    #[serde(default = "default_lexical_limit")]
    pub lexical_limit: usize,

    #[serde(default = "default_max_page")]
    pub max_page: usize,
}

fn default_base_k_min() -> usize {
    200
}

fn default_base_k_max() -> usize {
    2500
}

fn default_base_k_slack() -> usize {
    50
}

fn default_max_k() -> usize {
    20_000
}

fn default_max_attempts() -> usize {
    10
}

fn default_elbow_sample() -> usize {
    300
}

fn default_elbow_window() -> usize {
    160
}

fn default_elbow_min_drop() -> f32 {
    0.02
}

fn default_elbow_relative_drop() -> f32 {
    0.06
}

fn default_split() -> usize {
    48
}

fn default_keep_margin() -> f32 {
    0.10
}

fn default_keep_floor() -> f32 {
    0.22
}

fn default_keep_floor_weak() -> f32 {
    0.18
}

fn default_keep_floor_short() -> f32 {
    0.16
}

fn default_weak_top_score() -> f32 {
    0.28
}

fn default_short_query_top_score() -> f32 {
    0.30
}

fn default_highlight_min() -> usize {
    12
}

fn default_highlight_max() -> usize {
    72
}

fn default_highlight_window() -> usize {
    200
}

fn default_max_query_tokens() -> usize {
    8
}

fn default_lexical_limit() -> usize {
    4000
}

fn default_max_page() -> usize {
    800
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            base_k_min: default_base_k_min(),
            base_k_max: default_base_k_max(),
            base_k_slack: default_base_k_slack(),
            max_k: default_max_k(),
            max_attempts: default_max_attempts(),
            elbow_sample: default_elbow_sample(),
            elbow_window: default_elbow_window(),
            elbow_min_drop: default_elbow_min_drop(),
            elbow_relative_drop: default_elbow_relative_drop(),
            default_split: default_split(),
            keep_margin: default_keep_margin(),
            keep_floor: default_keep_floor(),
            keep_floor_weak: default_keep_floor_weak(),
            keep_floor_short: default_keep_floor_short(),
            weak_top_score: default_weak_top_score(),
            short_query_top_score: default_short_query_top_score(),
            highlight_min: default_highlight_min(),
            highlight_max: default_highlight_max(),
            highlight_window: default_highlight_window(),
            max_query_tokens: default_max_query_tokens(),
            lexical_limit: default_lexical_limit(),
            max_page: default_max_page(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lighthouse")
}

fn default_db_path() -> PathBuf {
    data_dir().join("lighthouse.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            roots: Vec::new(),
            thumbnails: ThumbnailConfig::default(),
            index: VectorIndexConfig::default(),
            pipeline: PipelineConfig::default(),
            embedding: EmbeddingConfig::default(),
            ranking: RankingConfig::default(),
        }
    }
}

impl Config {
    /// Load from `LIGHTHOUSE_CONFIG` or the default location, writing
    /// defaults out when no file exists yet.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("LIGHTHOUSE_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lighthouse")
    }
}
