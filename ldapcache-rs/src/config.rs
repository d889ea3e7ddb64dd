//! Contains the system configuration.
//!
//! The effective [Settings](Settings) are assembled from three layers, each overriding the
//! previous one:
//! 1. built-in defaults,
//! 2. the optional YAML file **config/settings.yml**,
//! 3. environment variables (as commonly used when running in a docker container).
//!
//! | Setting          | YAML key           | Environment              | Default         |
//! |------------------|--------------------|--------------------------|-----------------|
//! | listen address   | `server.listen`    | `LISTEN_INTERFACE`       | `:389`          |
//! | upstream server  | `upstream.address` | `TARGET_SERVER`          | `127.0.0.1:389` |
//! | upstream timeout | `upstream.timeout` | `UPSTREAM_TIMEOUT`       | none            |
//! | cache TTL        | `cache.duration`   | `CACHE_DURATION_MINUTES` | 15 minutes      |
//! | max entries      | `cache.size`       |                          | 100000          |
//! | max memory       | `cache.max_memory` |                          | 256 MiB         |
//!
//! A settings file might look like:
//! ```yaml
//! server:
//!     listen: "0.0.0.0:3389"
//! upstream:
//!     address: "ldap.internal:389"
//!     # Supports common suffixes like: ms, s, m, h, d
//!     timeout: 30s
//! cache:
//!     # Either plain minutes or a duration like "90s"
//!     duration: 15
//!     size: 100000
//!     # Supports common suffixes like: k, m, g, t
//!     max_memory: 256m
//! ```
//!
//! The file is observed for changes and reloaded once its modification date changes. Therefore
//! each user of the config should attach itself to the [Config::notifier](Config::notifier) and
//! re-process the settings once a change message is received. An invalid file (or invalid
//! environment) is rejected as a whole, so the previously loaded settings stay active. During
//! startup however, invalid settings abort the process.
//!
//! # Examples
//!
//! ```
//! # use ldapcache::config::Config;
//! # use std::time::Duration;
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! upstream:
//!     address: 10.0.0.1:389
//! cache:
//!     duration: 5
//! ", None).unwrap();
//!
//! let settings = config.current();
//! assert_eq!(settings.target_server, "10.0.0.1:389");
//! assert_eq!(settings.cache_duration, Duration::from_secs(5 * 60));
//! ```
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context};
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::fmt::{format_duration, parse_duration, parse_size};
use crate::platform::Platform;

/// Contains the default listen address. As in most LDAP tooling, a leading colon means
/// "all interfaces".
pub const DEFAULT_LISTEN_ADDRESS: &str = ":389";

/// Contains the default address of the upstream LDAP server.
pub const DEFAULT_TARGET_SERVER: &str = "127.0.0.1:389";

/// Contains the default time to live of cached replies.
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(15 * 60);

/// Contains the longest supported cache duration (about ten years). Expiry timestamps and the
/// sweep interval are computed from it, so larger values are rejected.
pub const MAX_CACHE_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Contains the default max number of cached requests.
pub const DEFAULT_CACHE_SIZE: usize = 100_000;

/// Contains the default max amount of memory occupied by cached replies.
pub const DEFAULT_CACHE_MEMORY: usize = 256 * 1024 * 1024;

/// Represents the effective settings of the proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// The address to accept client connections on.
    pub listen_address: String,

    /// The address of the upstream LDAP server.
    pub target_server: String,

    /// The max time to wait for the upstream server to connect or to reply. **None** waits
    /// forever.
    pub upstream_timeout: Option<Duration>,

    /// The time to live of each cached reply.
    pub cache_duration: Duration,

    /// The max number of cached requests.
    pub cache_size: usize,

    /// The max amount of memory (roughly) occupied by cached replies.
    pub cache_max_memory: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_address: normalize_address(DEFAULT_LISTEN_ADDRESS),
            target_server: DEFAULT_TARGET_SERVER.to_owned(),
            upstream_timeout: None,
            cache_duration: DEFAULT_CACHE_DURATION,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_max_memory: DEFAULT_CACHE_MEMORY,
        }
    }
}

impl Settings {
    /// Resolves the settings from the given YAML document and environment.
    ///
    /// The **env** lookup is passed in so that tests can provide a fake environment. Values
    /// of the environment take precedence over the ones in the document.
    ///
    /// # Example
    /// ```
    /// # use ldapcache::config::Settings;
    /// # use std::time::Duration;
    /// # use yaml_rust::Yaml;
    /// let settings = Settings::resolve(&Yaml::Null, |key| match key {
    ///     "LISTEN_INTERFACE" => Some(":1389".to_owned()),
    ///     "CACHE_DURATION_MINUTES" => Some("30".to_owned()),
    ///     _ => None,
    /// }).unwrap();
    ///
    /// assert_eq!(settings.listen_address, "0.0.0.0:1389");
    /// assert_eq!(settings.target_server, "127.0.0.1:389");
    /// assert_eq!(settings.cache_duration, Duration::from_secs(30 * 60));
    /// assert_eq!(settings.sweep_interval(), Duration::from_secs(60 * 60));
    /// ```
    pub fn resolve(doc: &Yaml, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Settings> {
        let listen_address = match env("LISTEN_INTERFACE") {
            Some(address) => address,
            None => yaml_string(doc, "server.listen")?
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned()),
        };

        let target_server = match env("TARGET_SERVER") {
            Some(address) => address,
            None => yaml_string(doc, "upstream.address")?
                .unwrap_or_else(|| DEFAULT_TARGET_SERVER.to_owned()),
        };

        let upstream_timeout = match env("UPSTREAM_TIMEOUT") {
            Some(timeout) => Some(timeout),
            None => yaml_string(doc, "upstream.timeout")?,
        }
        .map(|timeout| {
            parse_duration(&timeout)
                .with_context(|| format!("Invalid upstream timeout: '{}'", timeout))
        })
        .transpose()?
        .filter(|timeout| !timeout.is_zero());

        let cache_duration = match env("CACHE_DURATION_MINUTES") {
            Some(minutes) => parse_minutes(&minutes)
                .with_context(|| format!("Invalid CACHE_DURATION_MINUTES: '{}'", minutes))?,
            None => match query(doc, "cache.duration") {
                Yaml::BadValue | Yaml::Null => DEFAULT_CACHE_DURATION,
                Yaml::Integer(minutes) => parse_minutes(&minutes.to_string())
                    .with_context(|| format!("Invalid cache.duration: {}", minutes))?,
                Yaml::String(duration) => parse_duration(duration)
                    .with_context(|| format!("Invalid cache.duration: '{}'", duration))?,
                other => return Err(anyhow!("Invalid cache.duration: {:?}", other)),
            },
        };
        if cache_duration.is_zero() {
            return Err(anyhow!("The cache duration must be positive."));
        }
        if cache_duration > MAX_CACHE_DURATION {
            return Err(anyhow!(
                "The cache duration must not exceed {}.",
                format_duration(MAX_CACHE_DURATION)
            ));
        }

        let cache_size = match query(doc, "cache.size") {
            Yaml::BadValue | Yaml::Null => DEFAULT_CACHE_SIZE,
            Yaml::Integer(size) if *size > 0 => *size as usize,
            other => return Err(anyhow!("Invalid cache.size: {:?}", other)),
        };

        let cache_max_memory = match yaml_string(doc, "cache.max_memory")? {
            Some(size) => parse_size(&size)?,
            None => DEFAULT_CACHE_MEMORY,
        };

        Ok(Settings {
            listen_address: normalize_address(&listen_address),
            target_server,
            upstream_timeout,
            cache_duration,
            cache_size,
            cache_max_memory,
        })
    }

    /// Returns the interval in which expired cache entries are swept (twice the TTL).
    pub fn sweep_interval(&self) -> Duration {
        self.cache_duration * 2
    }
}

/// Turns an address like ":389" into one which can actually be bound.
fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_owned()
    }
}

fn parse_minutes(minutes: &str) -> anyhow::Result<Duration> {
    let minutes = minutes
        .trim()
        .parse::<u64>()
        .context("Expected a non-negative number of minutes")?;

    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("{} minutes cannot be represented as a duration", minutes))
}

fn query<'a>(doc: &'a Yaml, path: &str) -> &'a Yaml {
    path.split('.').fold(doc, |node, key| &node[key])
}

fn yaml_string(doc: &Yaml, path: &str) -> anyhow::Result<Option<String>> {
    match query(doc, path) {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::String(value) => Ok(Some(value.clone())),
        Yaml::Integer(value) => Ok(Some(value.to_string())),
        other => Err(anyhow!("Expected a string for '{}' but found {:?}", path, other)),
    }
}

fn environment(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder) and
/// can be obtained via `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    settings: ArcSwap<(Arc<Settings>, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the
/// settings were changed and need to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Until [load](Config::load) is called, the default settings are active.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            settings: ArcSwap::new(Arc::new((Arc::new(Settings::default()), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the settings changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Returns the currently active settings.
    ///
    /// Note that the returned settings are not updated once the config is reloaded, therefore
    /// they shouldn't be kept around for long.
    pub fn current(&self) -> Arc<Settings> {
        self.settings.load().0.clone()
    }

    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the underlying file (if present) and applies the environment on top of it.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        let metadata = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|metadata| metadata.is_file());

        match metadata {
            Some(metadata) => {
                log::info!("Loading config file {}...", &self.filename);
                let data = tokio::fs::read_to_string(&self.filename)
                    .await
                    .with_context(|| format!("Cannot load config file {}", &self.filename))?;
                self.load_from_string(data.as_str(), metadata.modified().ok())
            }
            None => {
                log::info!(
                    "Config file {} doesn't exist - using defaults and environment.",
                    &self.filename
                );
                self.load_from_string("", None)
            }
        }
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk. Note that the environment still takes precedence.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = YamlLoader::load_from_str(data)
            .map_err(|error| anyhow!("Cannot parse config file {}: {}", &self.filename, error))?;
        let doc = docs.into_iter().next().unwrap_or(Yaml::Null);

        let settings = Settings::resolve(&doc, environment)
            .with_context(|| format!("Invalid settings in {}", &self.filename))?;

        self.settings
            .store(Arc::new((Arc::new(settings), last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

/// Creates and installs a **Config** for the given platform.
///
/// This will read **config/settings.yml** (if present) and the environment and install a change
/// listener for this file. Invalid settings are reported as error as the proxy must not start
/// with a half-baked configuration.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless the
/// **Config** part is disabled.
pub async fn install(platform: Arc<Platform>) -> anyhow::Result<Arc<Config>> {
    let config = Arc::new(Config::new("config/settings.yml"));
    config.load().await?;
    platform.register::<Config>(config.clone());

    run_config_change_monitor(platform, config.clone());

    Ok(config)
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    crate::spawn!(async move {
        while platform.is_running() {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let last_modified = config.last_modified().await;
            let last_loaded = config.settings.load().1;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, Settings};
    use std::time::{Duration, SystemTime};
    use yaml_rust::YamlLoader;

    fn resolve(yaml: &str, env: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let doc = YamlLoader::load_from_str(yaml).unwrap().remove(0);
        Settings::resolve(&doc, |key| {
            env.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        })
    }

    #[test]
    fn defaults_are_applied() {
        let settings = resolve("{}", &[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.listen_address, "0.0.0.0:389");
        assert_eq!(settings.target_server, "127.0.0.1:389");
        assert_eq!(settings.cache_duration, Duration::from_secs(15 * 60));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(30 * 60));
        assert_eq!(settings.upstream_timeout, None);
    }

    #[test]
    fn yaml_values_are_applied() {
        let settings = resolve(
            "
server:
    listen: 127.0.0.1:1389
upstream:
    address: ldap.internal:389
    timeout: 30s
cache:
    duration: 90s
    size: 10
    max_memory: 1m
",
            &[],
        )
        .unwrap();

        assert_eq!(settings.listen_address, "127.0.0.1:1389");
        assert_eq!(settings.target_server, "ldap.internal:389");
        assert_eq!(settings.upstream_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.cache_duration, Duration::from_secs(90));
        assert_eq!(settings.cache_size, 10);
        assert_eq!(settings.cache_max_memory, 1024 * 1024);
    }

    #[test]
    fn the_environment_overrides_yaml() {
        let settings = resolve(
            "
server:
    listen: 127.0.0.1:1389
upstream:
    address: ldap.internal:389
cache:
    duration: 5
",
            &[
                ("LISTEN_INTERFACE", ":2389"),
                ("TARGET_SERVER", "10.1.1.1:636"),
                ("CACHE_DURATION_MINUTES", "1"),
                ("UPSTREAM_TIMEOUT", "0"),
            ],
        )
        .unwrap();

        assert_eq!(settings.listen_address, "0.0.0.0:2389");
        assert_eq!(settings.target_server, "10.1.1.1:636");
        assert_eq!(settings.cache_duration, Duration::from_secs(60));
        assert_eq!(settings.upstream_timeout, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_eq!(
            resolve("{}", &[("CACHE_DURATION_MINUTES", "fifteen")]).is_err(),
            true
        );
        assert_eq!(
            resolve("{}", &[("CACHE_DURATION_MINUTES", "-5")]).is_err(),
            true
        );
        assert_eq!(
            resolve("{}", &[("CACHE_DURATION_MINUTES", "0")]).is_err(),
            true
        );
        assert_eq!(resolve("{}", &[("UPSTREAM_TIMEOUT", "soon")]).is_err(), true);
        assert_eq!(resolve("cache:\n    duration: 9999999999d", &[]).is_err(), true);
        assert_eq!(resolve("cache:\n    duration: 9999999999", &[]).is_err(), true);
        assert_eq!(
            resolve("{}", &[("CACHE_DURATION_MINUTES", "18446744073709551615")]).is_err(),
            true
        );
        assert_eq!(resolve("cache:\n    size: -1", &[]).is_err(), true);
        assert_eq!(resolve("cache:\n    max_memory: 1.5g", &[]).is_err(), true);
        assert_eq!(resolve("server:\n    listen: [1, 2]", &[]).is_err(), true);
    }

    #[test]
    fn ensure_config_update_works() {
        crate::testing::test_async(async {
            let config = Config::new("test_settings.yml");
            config
                .load_from_string("cache:\n    duration: 42", Some(SystemTime::now()))
                .unwrap();

            let mut change_notifier = config.notifier();

            // A malformed config is rejected and the previous settings remain active...
            assert_eq!(
                config
                    .load_from_string("cache: 'invalid", Some(SystemTime::now()))
                    .is_err(),
                true
            );
            assert_eq!(
                config
                    .load_from_string("cache:\n    duration: 0", Some(SystemTime::now()))
                    .is_err(),
                true
            );
            assert_eq!(
                config.current().cache_duration,
                Duration::from_secs(42 * 60)
            );

            // A valid change is applied and broadcast...
            config
                .load_from_string("cache:\n    duration: 7", Some(SystemTime::now()))
                .unwrap();
            change_notifier.recv().await.unwrap();
            assert_eq!(config.current().cache_duration, Duration::from_secs(7 * 60));
        });
    }
}
