use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use veil_pipeline::{KafkaConfig, PipelineConfig};

/// Main configuration for the worker
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Only required by the recorder
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub annotation: AnnotationConfig,
    pub pipeline: PipelineConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3-compatible blob store
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (GCS interoperability, MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Analytical store
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Schema holding the records table
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Google Vision and Video Intelligence REST endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationConfig {
    #[serde(default = "default_vision_endpoint")]
    pub vision_endpoint: String,
    #[serde(default = "default_video_endpoint")]
    pub video_endpoint: String,
    /// Sent as the `key` query parameter
    pub api_key: Option<String>,
    /// Sent as a bearer token; takes precedence over the API key
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_service_name() -> String {
    "veil-worker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_dataset() -> String {
    "intelligentcontentfilter".to_string()
}

fn default_table() -> String {
    "filtered_content".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_vision_endpoint() -> String {
    "https://vision.googleapis.com".to_string()
}

fn default_video_endpoint() -> String {
    "https://videointelligence.googleapis.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            vision_endpoint: default_vision_endpoint(),
            video_endpoint: default_video_endpoint(),
            api_key: None,
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AnnotationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some() || self.access_token.is_some()
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Which stage a worker process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    Intake,
    Image,
    Video,
    Recorder,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Intake => "intake",
            StageName::Image => "image",
            StageName::Video => "video",
            StageName::Recorder => "recorder",
        }
    }

    /// Topic the stage consumes
    pub fn input_topic(self, pipeline: &PipelineConfig) -> &str {
        match self {
            StageName::Intake => &pipeline.topics.uploads,
            StageName::Image => &pipeline.topics.image,
            StageName::Video => &pipeline.topics.video,
            StageName::Recorder => &pipeline.topics.recorder,
        }
    }
}

impl FromStr for StageName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(StageName::Intake),
            "image" => Ok(StageName::Image),
            "video" => Ok(StageName::Video),
            "recorder" => Ok(StageName::Recorder),
            other => anyhow::bail!(
                "unknown stage {:?}, expected one of intake, image, video, recorder",
                other
            ),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkerConfig {
    /// Load configuration from defaults, config files and the environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "veil-worker")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/veil").required(false))
            .add_source(config::File::with_name("/etc/veil/veil").required(false))
            // VEIL__PIPELINE__BUCKETS__STAGING -> pipeline.buckets.staging
            .add_source(
                config::Environment::with_prefix("VEIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Check that everything `stage` needs is configured
    pub fn validate_for(&self, stage: StageName) -> anyhow::Result<()> {
        self.kafka.validate()?;
        self.pipeline.validate()?;

        match stage {
            StageName::Intake => {}
            StageName::Image | StageName::Video => {
                if !self.annotation.has_credentials() {
                    anyhow::bail!(
                        "annotation.api_key or annotation.access_token is required for the {} stage",
                        stage
                    );
                }
                if stage == StageName::Video {
                    self.validate_video_deadline()?;
                }
            }
            StageName::Recorder => {
                if self.database.is_none() {
                    anyhow::bail!("database.url is required for the recorder stage");
                }
            }
        }

        Ok(())
    }

    /// The consumer only polls Kafka between messages, so every redelivery of
    /// one video has to finish inside `max.poll.interval.ms` or the worker is
    /// evicted from its group and the video is handed to another worker.
    fn validate_video_deadline(&self) -> anyhow::Result<()> {
        let Some(deadline) = self.pipeline.video.deadline() else {
            anyhow::bail!("pipeline.video.deadline_secs is required for the video stage");
        };

        let redelivery = &self.kafka.redelivery;
        let worst_case = deadline
            .saturating_mul(redelivery.max_attempts.max(1))
            .saturating_add(redelivery.total_backoff());
        let poll_limit = Duration::from_millis(self.kafka.consumer.max_poll_interval_ms);

        if worst_case >= poll_limit {
            anyhow::bail!(
                "pipeline.video.deadline_secs allows {:?} per message over {} attempts, \
                 which exceeds kafka.consumer.max_poll_interval_ms ({:?})",
                worst_case,
                redelivery.max_attempts,
                poll_limit
            );
        }
        Ok(())
    }
}
