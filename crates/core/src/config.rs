use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `NOTIFY_ENGINE__`, the latter
/// taking precedence.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the due-check loop.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// A schedule left in Sending longer than this is considered stuck.
    #[serde(default = "default_sending_timeout_secs")]
    pub sending_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

/// Per-message unit costs. SMS is charged per segment.
#[derive(Debug, Clone, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_sms_cost")]
    pub sms: f64,
    #[serde(default)]
    pub email: f64,
    #[serde(default = "default_whatsapp_cost")]
    pub whatsapp: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_allow_multipart")]
    pub allow_multipart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_tick_interval_secs() -> u64 {
    30
}
fn default_sending_timeout_secs() -> u64 {
    900
}
fn default_max_concurrent_dispatches() -> usize {
    8
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_sms_cost() -> f64 {
    0.01
}
fn default_whatsapp_cost() -> f64 {
    0.005
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_allow_multipart() -> bool {
    true
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            sending_timeout_secs: default_sending_timeout_secs(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            sms: default_sms_cost(),
            email: 0.0,
            whatsapp: default_whatsapp_cost(),
            currency: default_currency(),
        }
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            allow_multipart: default_allow_multipart(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            sender: SenderConfig::default(),
            costs: CostConfig::default(),
            sms: SmsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("NOTIFY_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
