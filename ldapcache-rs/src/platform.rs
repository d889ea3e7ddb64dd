//! Provides a tiny registry which exposes the central components of the proxy.
//!
//! The platform keeps all shared components (the [Config](crate::config::Config), the
//! [ReplyCache](crate::lru::cache::ReplyCache) and the [Server](crate::server::Server)) as
//! **Arc<T>** around, so that each part can look up the others without wiring them by hand.
//! It also carries the central **is_running** flag which is toggled to *false* once
//! [Platform::terminate](Platform::terminate) is invoked. All long running loops (accept loop,
//! session loops, maintenance tasks) poll this flag and wind down once it flips.
//!
//! Note that once the shutdown has been initiated, the registry is cleared so that all
//! components are dropped. Code which might run after [Platform::terminate](Platform::terminate)
//! therefore has to use [Platform::find](Platform::find) rather than
//! [Platform::require](Platform::require).
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use ldapcache::config::Config;
//! # use ldapcache::platform::Platform;
//! # use ldapcache::lru::cache::ReplyCache;
//! let platform = Platform::new();
//! platform.register::<Config>(Arc::new(Config::new("settings.yml")));
//!
//! let config = platform.require::<Config>();
//! assert_eq!(config.current().target_server, "127.0.0.1:389");
//! assert_eq!(platform.find::<ReplyCache>().is_none(), true);
//!
//! platform.terminate();
//! assert_eq!(platform.is_running(), false);
//! assert_eq!(platform.find::<Config>().is_none(), true);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Keeps all central components of the proxy in a single place.
pub struct Platform {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new and running platform.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a component, replacing any previously registered one of the same type.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self.services.lock().insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered component.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a component which is known to be present.
    ///
    /// # Panics
    /// Panics if the component isn't available, which is also the case once the platform has
    /// been terminated.
    ///
    /// ```should_panic
    /// # use ldapcache::platform::Platform;
    /// # use ldapcache::server::Server;
    /// let platform = Platform::new();
    /// let _ = platform.require::<Server>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if !self.is_running() {
            panic!(
                "A required component ({}) has been requested but the proxy is already shutting down!",
                std::any::type_name::<T>()
            );
        }

        match self.find::<T>() {
            Some(service) => service,
            None => panic!(
                "A required component ({}) was not available in the platform registry!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate](Platform::terminate)
    /// has already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// This releases all components and toggles the [is_running()](Platform::is_running) flag
    /// to **false**.
    pub fn terminate(&self) {
        self.services.lock().clear();
        self.is_running.store(false, Ordering::Release);
    }
}
