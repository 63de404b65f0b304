use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wavecrowd::corpus::DEFAULT_MAX_GROUP_SIZE;
use wavecrowd::marketplace::{HttpMarketplaceConfig, SANDBOX_ENDPOINT};
use wavecrowd::scheduler::{AllocatorConfig, DEFAULT_WAVE_SIZE, PublisherConfig, RetryPolicy, RewardSchedule};
use wavecrowd::template::{DEFAULT_ANNOTATION_URL, DEFAULT_TASK_LAYOUT, TaskLayout};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub store: StoreConfig,
    pub corpus: CorpusConfig,
    pub marketplace: MarketplaceConfig,
    pub retry: RetryConfig,
    pub allocator: AllocatorSection,
    pub rewards: RewardSchedule,
    pub publisher: PublisherConfig,
    pub layout: LayoutConfig,
    pub eligibility: EligibilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("wavecrowd")
                .join("wavecrowd.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    pub documents_dir: Option<PathBuf>,
    pub groups_file: Option<PathBuf>,
    pub max_group_size: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            documents_dir: None,
            groups_file: None,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub timeout_ms: u64,
    /// Send the marketplace's notification when a token is granted
    pub notify_workers: bool,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            endpoint: SANDBOX_ENDPOINT.to_string(),
            api_key_env: "WAVECROWD_API_KEY".to_string(),
            timeout_ms: 30000,
            notify_workers: false,
        }
    }
}

impl MarketplaceConfig {
    pub fn client_config(&self) -> HttpMarketplaceConfig {
        HttpMarketplaceConfig {
            endpoint: self.endpoint.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            api_key_env: self.api_key_env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorSection {
    pub wave_size: usize,
}

impl Default for AllocatorSection {
    fn default() -> Self {
        Self {
            wave_size: DEFAULT_WAVE_SIZE,
        }
    }
}

impl AllocatorSection {
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            wave_size: self.wave_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// `{{hash}}` is replaced by the pair hash
    pub annotation_url: String,
    /// Custom task layout; the built-in layout is used when unset
    pub template_file: Option<PathBuf>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            annotation_url: DEFAULT_ANNOTATION_URL.to_string(),
            template_file: None,
        }
    }
}

impl LayoutConfig {
    pub fn task_layout(&self) -> Result<TaskLayout> {
        let layout = match &self.template_file {
            Some(path) => fs::read_to_string(path)
                .context(format!("Failed to read task layout {}", path.display()))?,
            None => DEFAULT_TASK_LAYOUT.to_string(),
        };
        Ok(TaskLayout::new(&layout, &self.annotation_url)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    pub name_prefix: String,
    pub description: String,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            name_prefix: "AnnotatorGroup_".to_string(),
            description: "Annotator cohort for event coreference tasks".to_string(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Checks that do not depend on the subcommand
    pub fn validate(&self) -> Result<()> {
        if self.allocator.wave_size == 0 {
            return Err(eyre!("allocator.wave_size must be positive"));
        }
        if self.corpus.max_group_size < 2 {
            return Err(eyre!("corpus.max_group_size must allow at least one pair"));
        }
        if self.retry.max_attempts == 0 {
            return Err(eyre!("retry.max_attempts must be positive"));
        }
        self.rewards.validate()?;
        Ok(())
    }

    /// Everything `run` needs before the first task goes out
    pub fn validate_for_publishing(&self) -> Result<TaskLayout> {
        self.validate()?;
        self.publisher.validate()?;
        self.layout.task_layout()
    }
}
