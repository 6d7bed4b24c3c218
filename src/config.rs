//! Contains the settings of the cache coordinators and the stores.
//!
//! Settings are read from a YAML document. Each section and each key is optional and falls back
//! to its default:
//!
//! ```yaml
//! cacher:
//!     lock_ttl: 30s
//!     wait_timeout: 30s
//!     initial_backoff: 10ms
//!     max_backoff: 500ms
//!     scan_batch_size: 100
//!     release_timeout: 5s
//! memory:
//!     default_ttl: 0
//!     cleanup_interval: 1m
//!     max_entries: 1000000
//!     max_memory: 1g
//! redis:
//!     url: redis://127.0.0.1:6379/0
//! ```
//!
//! Durations accept a number (milliseconds) or a string with one of the suffixes `ms`, `s`, `m`,
//! `h` or `d`. Sizes accept a number (bytes) or a string like `512m`.
//!
//! A [Config] keeps the currently active [Settings] and can observe its file for changes (see
//! [Config::watch]). The coordinators fetch [Config::current] for each operation, therefore
//! changed timings are picked up without a restart. Components which keep derived state (like
//! the limits of a [MemoryStore](crate::store::MemoryStore)) should listen on
//! [Config::notifier] and re-apply the settings once a change message is received.
//!
//! # Example
//! ```
//! # use cacher::config::Config;
//! # use std::time::Duration;
//! let config = Config::default();
//! config.load_from_string("
//! cacher:
//!     lock_ttl: 1m
//!     max_backoff: 250
//! ", None).unwrap();
//!
//! assert_eq!(config.current().cacher.lock_ttl, Duration::from_secs(60));
//! assert_eq!(config.current().cacher.max_backoff, Duration::from_millis(250));
//! assert_eq!(config.current().cacher.initial_backoff, Duration::from_millis(10));
//! ```
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::backoff::WaitSettings;
use crate::fmt::{parse_duration, parse_optional_duration, parse_size};

/// Contains the complete set of settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// The settings of the fetch coordinators.
    pub cacher: CacherSettings,
    /// The settings of the in-process store.
    pub memory: MemorySettings,
    /// The settings of the Redis store.
    pub redis: RedisSettings,
}

/// Controls the locking and waiting behaviour of the coordinators.
#[derive(Debug, Clone, PartialEq)]
pub struct CacherSettings {
    /// The expiry of a fetch lock. A held lock is extended every `lock_ttl / 3`.
    pub lock_ttl: Duration,
    /// The overall time a caller waits for the value fetched by another caller.
    pub wait_timeout: Duration,
    /// The first pause between two polls of a waiting caller.
    pub initial_backoff: Duration,
    /// The upper bound of the pause between two polls.
    pub max_backoff: Duration,
    /// The number of keys to scan and delete per round trip when deleting by prefix.
    pub scan_batch_size: usize,
    /// The upper bound for releasing a lock (which is independent of the caller's context).
    pub release_timeout: Duration,
}

impl Default for CacherSettings {
    fn default() -> Self {
        CacherSettings {
            lock_ttl: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            scan_batch_size: 100,
            release_timeout: Duration::from_secs(5),
        }
    }
}

impl CacherSettings {
    /// Extracts the parameters of the wait engine.
    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            timeout: self.wait_timeout,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

/// Controls the in-process store.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySettings {
    /// The ttl applied if a value is stored with a ttl of zero. **None** keeps such values forever.
    pub default_ttl: Option<Duration>,
    /// The interval in which expired entries are purged. **None** disables the janitor.
    pub cleanup_interval: Option<Duration>,
    /// The maximal number of entries.
    pub max_entries: usize,
    /// The maximal amount of memory (in bytes) used by keys and values.
    pub max_memory: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        MemorySettings {
            default_ttl: None,
            cleanup_interval: Some(Duration::from_secs(60)),
            max_entries: 1_000_000,
            max_memory: 1024 * 1024 * 1024,
        }
    }
}

/// Controls the connection to Redis.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisSettings {
    /// The connection url, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            url: "redis://127.0.0.1:6379/0".to_owned(),
        }
    }
}

impl Settings {
    /// Parses the given YAML document.
    ///
    /// An empty document yields the default settings.
    pub fn parse(data: &str) -> anyhow::Result<Settings> {
        let docs = YamlLoader::load_from_str(data).context("Cannot parse config data")?;
        match docs.first() {
            None | Some(Yaml::Null) => Ok(Settings::default()),
            Some(doc @ Yaml::Hash(_)) => Settings::from_yaml(doc),
            Some(_) => Err(anyhow::anyhow!(
                "Expected a mapping as root element of the config"
            )),
        }
    }

    fn from_yaml(doc: &Yaml) -> anyhow::Result<Settings> {
        let defaults = Settings::default();

        let cacher = &doc["cacher"];
        let cacher = CacherSettings {
            lock_ttl: read_duration(cacher, "cacher.lock_ttl", defaults.cacher.lock_ttl)?,
            wait_timeout: read_duration(
                cacher,
                "cacher.wait_timeout",
                defaults.cacher.wait_timeout,
            )?,
            initial_backoff: read_duration(
                cacher,
                "cacher.initial_backoff",
                defaults.cacher.initial_backoff,
            )?,
            max_backoff: read_duration(cacher, "cacher.max_backoff", defaults.cacher.max_backoff)?,
            scan_batch_size: read_number(
                cacher,
                "cacher.scan_batch_size",
                defaults.cacher.scan_batch_size,
            )?,
            release_timeout: read_duration(
                cacher,
                "cacher.release_timeout",
                defaults.cacher.release_timeout,
            )?,
        };

        let memory = &doc["memory"];
        let memory = MemorySettings {
            default_ttl: read_optional_duration(
                memory,
                "memory.default_ttl",
                defaults.memory.default_ttl,
            )?,
            cleanup_interval: read_optional_duration(
                memory,
                "memory.cleanup_interval",
                defaults.memory.cleanup_interval,
            )?,
            max_entries: read_number(memory, "memory.max_entries", defaults.memory.max_entries)?,
            max_memory: read_size(memory, "memory.max_memory", defaults.memory.max_memory)?,
        };

        let redis = RedisSettings {
            url: match &doc["redis"]["url"] {
                Yaml::String(url) => url.clone(),
                Yaml::BadValue | Yaml::Null => defaults.redis.url,
                _ => return Err(anyhow::anyhow!("Expected a string for 'redis.url'")),
            },
        };

        let settings = Settings {
            cacher,
            memory,
            redis,
        };
        settings.verify()?;

        Ok(settings)
    }

    fn verify(&self) -> anyhow::Result<()> {
        if self.cacher.lock_ttl.is_zero() {
            return Err(anyhow::anyhow!("'cacher.lock_ttl' must not be zero"));
        }
        if self.cacher.initial_backoff.is_zero() {
            return Err(anyhow::anyhow!("'cacher.initial_backoff' must not be zero"));
        }
        if self.cacher.max_backoff < self.cacher.initial_backoff {
            return Err(anyhow::anyhow!(
                "'cacher.max_backoff' must not be less than 'cacher.initial_backoff'"
            ));
        }
        if self.cacher.scan_batch_size == 0 {
            return Err(anyhow::anyhow!("'cacher.scan_batch_size' must not be zero"));
        }
        if self.memory.max_entries == 0 {
            return Err(anyhow::anyhow!("'memory.max_entries' must not be zero"));
        }

        Ok(())
    }
}

/// Extracts the last segment of a dotted path, which is the key within its section.
fn key_of(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

fn read_duration(section: &Yaml, path: &str, default: Duration) -> anyhow::Result<Duration> {
    match &section[key_of(path)] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(millis) if *millis >= 0 => Ok(Duration::from_millis(*millis as u64)),
        Yaml::String(value) => {
            parse_duration(value).with_context(|| format!("Invalid value for '{}'", path))
        }
        other => Err(anyhow::anyhow!(
            "Invalid value for '{}': {:?} is not a duration",
            path,
            other
        )),
    }
}

fn read_optional_duration(
    section: &Yaml,
    path: &str,
    default: Option<Duration>,
) -> anyhow::Result<Option<Duration>> {
    match &section[key_of(path)] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(0) => Ok(None),
        Yaml::Integer(millis) if *millis > 0 => Ok(Some(Duration::from_millis(*millis as u64))),
        Yaml::Boolean(false) => Ok(None),
        Yaml::String(value) => {
            parse_optional_duration(value).with_context(|| format!("Invalid value for '{}'", path))
        }
        other => Err(anyhow::anyhow!(
            "Invalid value for '{}': {:?} is not a duration",
            path,
            other
        )),
    }
}

fn read_number(section: &Yaml, path: &str, default: usize) -> anyhow::Result<usize> {
    match &section[key_of(path)] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(value) => usize::try_from(*value)
            .map_err(|_| anyhow::anyhow!("Invalid value for '{}': {} is negative", path, value)),
        other => Err(anyhow::anyhow!(
            "Invalid value for '{}': {:?} is not a number",
            path,
            other
        )),
    }
}

fn read_size(section: &Yaml, path: &str, default: usize) -> anyhow::Result<usize> {
    match &section[key_of(path)] {
        Yaml::String(value) => {
            parse_size(value).with_context(|| format!("Invalid value for '{}'", path))
        }
        _ => read_number(section, path, default),
    }
}

struct Loaded {
    settings: Arc<Settings>,
    last_modified: Option<SystemTime>,
}

/// Represents the change listener.
///
/// The message itself carries no information. Once it has been received, the settings have
/// changed and [Config::current] yields the new ones.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Provides access to the currently active settings.
pub struct Config {
    filename: Option<String>,
    tx: tokio::sync::broadcast::Sender<()>,
    loaded: ArcSwap<Loaded>,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_settings(Settings::default())
    }
}

impl Config {
    /// Creates a config which reads its settings from the given file.
    ///
    /// Note that nothing is read until [Config::load] is invoked. Until then, the default
    /// settings are active.
    pub fn new(file: &str) -> Self {
        let mut config = Config::default();
        config.filename = Some(file.to_owned());

        config
    }

    /// Creates a config which isn't backed by a file.
    pub fn from_settings(settings: Settings) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: None,
            tx,
            loaded: ArcSwap::new(Arc::new(Loaded {
                settings: Arc::new(settings),
                last_modified: None,
            })),
        }
    }

    /// Obtains a change notifier which receives a message once the settings changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Returns the currently active settings.
    ///
    /// The returned settings are a snapshot and should not be kept around for long, as they
    /// are not updated once the config is reloaded.
    pub fn current(&self) -> Arc<Settings> {
        self.loaded.load().settings.clone()
    }

    /// Replaces the active settings.
    pub fn update(&self, settings: Settings) {
        self.install(settings, None);
    }

    fn install(&self, settings: Settings, last_modified: Option<SystemTime>) {
        self.loaded.store(Arc::new(Loaded {
            settings: Arc::new(settings),
            last_modified,
        }));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());
    }

    async fn last_modified(&self) -> Option<SystemTime> {
        let filename = self.filename.as_ref()?;
        tokio::fs::metadata(filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the settings from the underlying file.
    ///
    /// A missing file keeps the current settings. An invalid file is reported as error and
    /// also keeps the current settings.
    pub async fn load(&self) -> anyhow::Result<()> {
        let filename = match &self.filename {
            Some(filename) => filename,
            None => return Ok(()),
        };

        log::info!("Loading config file {}...", filename);
        let last_modified = match self.last_modified().await {
            Some(last_modified) => last_modified,
            None => {
                log::info!("Config file {} doesn't exist - skipping config load.", filename);
                return Ok(());
            }
        };

        let data = tokio::fs::read_to_string(filename)
            .await
            .with_context(|| format!("Cannot load config file {}", filename))?;

        self.load_from_string(&data, Some(last_modified))
    }

    /// Loads the settings from the given string instead of a file.
    ///
    /// If the data cannot be parsed, an error is returned and the current settings remain
    /// active.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let settings = Settings::parse(data)?;
        self.install(settings, last_modified);

        Ok(())
    }

    /// Starts a background task which reloads the config once its file changes.
    ///
    /// The task checks the last modified date of the file every two seconds and stops once the
    /// config is dropped.
    pub fn watch(self: &Arc<Self>) {
        self.watch_every(Duration::from_secs(2));
    }

    fn watch_every(self: &Arc<Self>, interval: Duration) {
        let config = Arc::downgrade(self);
        crate::spawn!(run_config_change_monitor(config, interval));
    }
}

async fn run_config_change_monitor(config: Weak<Config>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let config = match config.upgrade() {
            Some(config) => config,
            None => return,
        };

        // Contains the timestamp when the file was loaded the last time or None if it hasn't
        // been loaded yet...
        let last_loaded = config.loaded.load().last_modified;
        let last_modified = config.last_modified().await;

        if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
            match config.load().await {
                Ok(_) => log::info!("Config was re-loaded."),
                Err(error) => log::error!("Failed to re-load config: {:#}", error),
            }
        }
    }
}
