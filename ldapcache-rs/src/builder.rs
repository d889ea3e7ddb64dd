//! Provides a builder which is used to setup and initialize the proxy.
//!
//! The builder creates the [Platform](crate::platform::Platform) and installs the selected
//! components. Tests commonly only enable the parts they need, whereas the binary enables all
//! of them.
//!
//! # Example
//! Setting up the proxy with all components enabled:
//! ```no_run
//! # use ldapcache::builder::Builder;
//! # use ldapcache::server::Server;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Builder::new().enable_all().build().await?;
//!     platform.require::<Server>().event_loop().await
//! }
//! ```
use std::sync::Arc;

use anyhow::anyhow;

use crate::fmt::{format_duration, format_size};
use crate::platform::Platform;
use crate::{init_logging, LDAPCACHE_REVISION, LDAPCACHE_VERSION};

/// Initializes the proxy by creating and installing the selected components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_cache: bool,
    setup_server: bool,
}

impl Builder {
    /// Creates a new builder with all components disabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all components.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_cache = true;
        self.setup_server = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As the proxy is
    /// intended to be run in docker containers, this is all that is needed for proper logging.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the proxy once **CTRL-C**, **SIGHUP** or
    /// **SIGTERM** is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [Config](crate::config::Config) and loads the **settings.yml** along with the
    /// environment.
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    ///
    /// Note that the cache relies on a config being present, therefore it has to be disabled
    /// as well (which in turn requires the server to be disabled).
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Installs the [ReplyCache](crate::lru::cache::ReplyCache).
    ///
    /// This requires the config to be enabled.
    pub fn enable_cache(mut self) -> Self {
        self.setup_cache = true;
        self
    }

    /// Disables installing the cache after [enable_all()](Builder::enable_all) has been used.
    pub fn disable_cache(mut self) -> Self {
        self.setup_cache = false;
        self
    }

    /// Creates and installs a [Server](crate::server::Server) instance.
    ///
    /// This requires the cache to be enabled. Note that still, the main event loop has to be
    /// invoked manually via:
    /// `platform.require::<Server>().event_loop().await`.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Disables setting up a **Server** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) with all enabled components being
    /// registered.
    ///
    /// # Errors
    /// Fails if a component is enabled without the components it depends on or if the
    /// configuration (file or environment) is invalid.
    pub async fn build(self) -> anyhow::Result<Arc<Platform>> {
        if self.setup_cache && !self.setup_config {
            return Err(anyhow!("The reply cache cannot be enabled without the config."));
        }
        if self.setup_server && !self.setup_cache {
            return Err(anyhow!("The server cannot be enabled without the reply cache."));
        }

        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. LDAPCACHE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            LDAPCACHE_VERSION,
            LDAPCACHE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            let config = crate::config::install(platform.clone()).await?;
            let settings = config.current();
            log::info!(
                "Proxying {} to {} (upstream timeout: {}, cache: {} entries / {} for {}).",
                &settings.listen_address,
                &settings.target_server,
                settings
                    .upstream_timeout
                    .map(format_duration)
                    .unwrap_or_else(|| "none".to_owned()),
                settings.cache_size,
                format_size(settings.cache_max_memory),
                format_duration(settings.cache_duration)
            );
        }

        if self.setup_cache {
            let _ = crate::lru::cache::install(platform.clone());
        }

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        Ok(platform)
    }
}
