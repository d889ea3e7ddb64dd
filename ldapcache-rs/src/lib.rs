//! ldapcache is a transparent caching proxy for LDAP.
//!
//! # Introduction
//! The proxy sits between LDAP clients and an upstream directory server. Each request is
//! identified by the fingerprint of its exact wire bytes. If an identical request has been
//! answered recently, the stored reply is delivered without contacting the upstream server at
//! all. This is especially useful for applications which open a new connection, bind and run
//! the very same searches over and over again.
//!
//! As LDAP is session oriented, a connection which was served from the cache so far still has
//! to be "known" to the upstream server once a request misses the cache. Therefore the proxy
//! replays all previous requests of this connection to the upstream server (discarding the
//! replies) before forwarding the missed request. From then on, the connection is simply
//! proxied (see [session]).
//!
//! # Features
//! * **Protocol aware framing**: requests and replies are split into complete BER encoded
//!   messages (see [message] and [reader]), multi-message replies (search entries and
//!   references) are collected as a whole.
//! * **Size and time constrained cache**: replies are kept for a configurable TTL and the cache
//!   is limited in both, the number of entries and the occupied memory (see [lru]).
//! * **100% Async/Await**: the whole server builds upon [tokio](https://tokio.rs/). Each client
//!   connection is handled in its own task and owns its upstream connection.
//! * **Reload-aware config facility**: the YAML config (and the environment) is watched and
//!   changes to the listen address or the cache settings are applied without a restart
//!   (see [config]).
//!
//! # Using ldapcache
//! The binary **ldapcache-io** enables all components and runs the server. The library itself
//! can be set up via the [Builder](builder::Builder).
#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod config;
pub mod fingerprint;
pub mod fmt;
pub mod lru;
pub mod message;
pub mod platform;
pub mod reader;
pub mod server;
pub mod session;
pub mod signals;
pub mod upstream;

/// Contains the version of the ldapcache library.
pub const LDAPCACHE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the ldapcache build being used.
pub const LDAPCACHE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// proxy, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests might build several platforms, therefore we must only initialize once...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ldapcache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use crate::message::Message;
    use crate::reader::FrameReader;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Starts a fake upstream server on a random local port.
    ///
    /// Each request is answered with the replies scripted for its message id. A request without
    /// a script makes the server hang up (just like a real one does for an unbind). Every
    /// received request is reported (along with the number of the connection it was received
    /// on) before it is answered.
    pub async fn mock_upstream(
        script: HashMap<i64, Vec<Message>>,
    ) -> (String, mpsc::UnboundedReceiver<(usize, Bytes)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let script = Arc::new(script);

        let _ = tokio::spawn(async move {
            let mut connection_number = 0;
            while let Ok((mut stream, _)) = listener.accept().await {
                connection_number += 1;
                let tx = tx.clone();
                let script = script.clone();
                let _ = tokio::spawn(async move {
                    let (reader, mut writer) = stream.split();
                    let mut reader = FrameReader::new(reader);
                    while let Ok(Some(request)) = reader.read_frame().await {
                        let _ = tx.send((connection_number, request.raw().clone()));
                        match request.message_id().and_then(|id| script.get(&id)) {
                            Some(replies) => {
                                for reply in replies {
                                    writer.write_all(reply.raw()).await.unwrap();
                                }
                                writer.flush().await.unwrap();
                            }
                            None => return,
                        }
                    }
                });
            }
        });

        (address, rx)
    }

    /// Drains all requests which have been reported by a mock upstream so far.
    pub fn received(rx: &mut mpsc::UnboundedReceiver<(usize, Bytes)>) -> Vec<(usize, Bytes)> {
        let mut result = Vec::new();
        while let Ok(request) = rx.try_recv() {
            result.push(request);
        }

        result
    }
}
