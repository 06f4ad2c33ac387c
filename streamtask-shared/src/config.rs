/// Configuration for the Redis connection and the task stream
///
/// Both structs are resolved once, before a worker is constructed, and are
/// immutable afterwards.
///
/// # Environment Variables
///
/// Connection ([`RedisConfig::from_env`]):
///
/// - `REDIS_URL`: Full connection URL. Wins over `REDIS_ADDR` when set.
/// - `REDIS_ADDR`: `host:port`, or a comma-separated list of cluster seeds (default: 127.0.0.1:6379)
/// - `REDIS_CLUSTER`: Treat `REDIS_ADDR` as cluster seeds (default: false)
/// - `REDIS_USERNAME` / `REDIS_PASSWORD`: Credentials (default: none)
/// - `REDIS_DB`: Database index, single node only (default: 0)
/// - `REDIS_TLS`: Connect with TLS (default: false)
/// - `REDIS_TLS_INSECURE`: Skip certificate verification (default: false)
/// - `REDIS_CONNECTION_TIMEOUT_SECS`: Connection timeout (default: 5)
/// - `REDIS_COMMAND_TIMEOUT_SECS`: Health check timeout (default: 10)
///
/// Stream ([`StreamConfig::from_env`]):
///
/// - `STREAM_NAME`: Stream key (default: streamtask)
/// - `STREAM_GROUP`: Consumer group (default: streamtask)
/// - `STREAM_CONSUMER`: Consumer identity inside the group (default: streamtask)
/// - `STREAM_BLOCK_MS`: Group read block time (default: 60000)
/// - `STREAM_MAX_LENGTH`: Approximate stream cap, 0 disables trimming (default: 10000)
///
/// # Example
///
/// ```no_run
/// use streamtask_shared::config::{RedisConfig, StreamConfig};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let redis = RedisConfig::from_env()?;
/// let stream = StreamConfig::from_env()?;
/// println!("Consuming {} as {}/{}", stream.stream_name, stream.group, stream.consumer);
/// # Ok(())
/// # }
/// ```

use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default single-node address
pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";

/// Default stream, group and consumer name
pub const DEFAULT_NAME: &str = "streamtask";

/// Default group read block time
pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(60);

/// Shortest accepted group read block time
pub const MIN_BLOCK_TIME: Duration = Duration::from_millis(10);

/// Default approximate stream length cap
pub const DEFAULT_MAX_LENGTH: usize = 10_000;

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Full connection URL
    ///
    /// Format: redis[s]://[username:password@]host:port[/db]
    pub url: Option<String>,

    /// Address, or comma-separated cluster seed addresses
    pub addr: String,

    /// Whether `addr` lists cluster seeds
    pub cluster: bool,

    /// ACL username
    pub username: Option<String>,

    /// Password
    pub password: Option<String>,

    /// Database index (ignored for clusters)
    pub db: i64,

    /// Connect with TLS
    pub tls: bool,

    /// Skip TLS certificate verification
    pub tls_insecure: bool,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Command timeout in seconds (health checks)
    pub command_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            addr: DEFAULT_ADDR.to_string(),
            cluster: false,
            username: None,
            password: None,
            db: 0,
            tls: false,
            tls_insecure: false,
            connection_timeout_secs: 5,
            command_timeout_secs: 10,
        }
    }
}

impl RedisConfig {
    /// Creates a configuration for a single connection URL
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Creates a configuration for a set of cluster seed addresses
    pub fn cluster(addrs: &[&str]) -> Self {
        Self {
            addr: addrs.join(","),
            cluster: true,
            ..Self::default()
        }
    }

    /// Loads the configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric or boolean variable cannot be parsed.
    pub fn from_env() -> Result<Self, StoreError> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            url: non_empty_var("REDIS_URL"),
            addr: non_empty_var("REDIS_ADDR").unwrap_or(defaults.addr),
            cluster: parse_var("REDIS_CLUSTER", defaults.cluster)?,
            username: non_empty_var("REDIS_USERNAME"),
            password: non_empty_var("REDIS_PASSWORD"),
            db: parse_var("REDIS_DB", defaults.db)?,
            tls: parse_var("REDIS_TLS", defaults.tls)?,
            tls_insecure: parse_var("REDIS_TLS_INSECURE", defaults.tls_insecure)?,
            connection_timeout_secs: parse_var(
                "REDIS_CONNECTION_TIMEOUT_SECS",
                defaults.connection_timeout_secs,
            )?,
            command_timeout_secs: parse_var(
                "REDIS_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout_secs,
            )?,
        })
    }

    /// Resolves the connection target into one URL per node
    ///
    /// An explicit `url` yields a single URL. Otherwise `addr` is split on
    /// commas when `cluster` is set, and each address becomes a URL carrying
    /// the credentials and TLS settings.
    ///
    /// # Errors
    ///
    /// Returns an error if no address is configured, if an address has no
    /// port, or if several addresses are given without `cluster`.
    pub fn node_urls(&self) -> Result<Vec<String>, StoreError> {
        if let Some(url) = &self.url {
            return Ok(vec![url.clone()]);
        }

        let addrs: Vec<&str> = self
            .addr
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect();

        if addrs.is_empty() {
            return Err(StoreError::Config(
                "no Redis address configured".to_string(),
            ));
        }
        if addrs.len() > 1 && !self.cluster {
            return Err(StoreError::Config(format!(
                "{} addresses given but cluster mode is off",
                addrs.len()
            )));
        }

        addrs.into_iter().map(|addr| self.node_url(addr)).collect()
    }

    fn node_url(&self, addr: &str) -> Result<String, StoreError> {
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(StoreError::Config(format!(
                    "invalid Redis address '{}', expected host:port",
                    addr
                )))
            }
        }

        let scheme = if self.tls { "rediss" } else { "redis" };

        let userinfo = match (&self.username, &self.password) {
            (None, None) => String::new(),
            (user, pass) => format!(
                "{}:{}@",
                urlencoding::encode(user.as_deref().unwrap_or("")),
                urlencoding::encode(pass.as_deref().unwrap_or(""))
            ),
        };

        let mut url = format!("{}://{}{}", scheme, userinfo, addr);
        if !self.cluster && self.db != 0 {
            url.push_str(&format!("/{}", self.db));
        }
        if self.tls && self.tls_insecure {
            url.push_str("#insecure");
        }

        Ok(url)
    }
}

/// Stream and consumer-group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream key
    pub stream_name: String,

    /// Consumer group name
    pub group: String,

    /// Consumer identity inside the group
    pub consumer: String,

    /// How long a group read blocks waiting for a new entry
    pub block_time: Duration,

    /// Approximate cap on the stream length (0 = unbounded)
    pub max_length: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_name: DEFAULT_NAME.to_string(),
            group: DEFAULT_NAME.to_string(),
            consumer: DEFAULT_NAME.to_string(),
            block_time: DEFAULT_BLOCK_TIME,
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

impl StreamConfig {
    /// Creates a configuration with the given names and default limits
    pub fn new(
        stream_name: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            group: group.into(),
            consumer: consumer.into(),
            ..Self::default()
        }
    }

    /// Sets the group read block time
    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }

    /// Sets the approximate stream length cap
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Loads the configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable cannot be parsed, or if
    /// `STREAM_BLOCK_MS` is below [`MIN_BLOCK_TIME`].
    pub fn from_env() -> Result<Self, StoreError> {
        dotenvy::dotenv().ok();

        let block_ms = parse_var("STREAM_BLOCK_MS", DEFAULT_BLOCK_TIME.as_millis() as u64)?;
        let block_time = validate_block_time(Duration::from_millis(block_ms))?;

        Ok(Self {
            stream_name: non_empty_var("STREAM_NAME").unwrap_or_else(|| DEFAULT_NAME.to_string()),
            group: non_empty_var("STREAM_GROUP").unwrap_or_else(|| DEFAULT_NAME.to_string()),
            consumer: non_empty_var("STREAM_CONSUMER")
                .unwrap_or_else(|| DEFAULT_NAME.to_string()),
            block_time,
            max_length: parse_var("STREAM_MAX_LENGTH", DEFAULT_MAX_LENGTH)?,
        })
    }
}

/// Rejects block times short enough to turn the consumer loop into a busy poll
fn validate_block_time(block_time: Duration) -> Result<Duration, StoreError> {
    if block_time < MIN_BLOCK_TIME {
        return Err(StoreError::Config(format!(
            "STREAM_BLOCK_MS must be at least {}ms, got {}ms",
            MIN_BLOCK_TIME.as_millis(),
            block_time.as_millis()
        )));
    }
    Ok(block_time)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, StoreError> {
    match non_empty_var(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            StoreError::Config(format!("{} has an invalid value: '{}'", name, raw))
        }),
        None => Ok(default),
    }
}
