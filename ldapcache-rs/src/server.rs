//! Contains the server component of the proxy.
//!
//! Opens a server socket on the configured listen address (**server.listen** in the config,
//! **LISTEN_INTERFACE** in the environment or ":389" as fallback) and hands each incoming client
//! connection to its own [Session](crate::session::Session).
//!
//! If the listen address is changed in the config, the server socket is closed and re-opened on
//! the new address. While the new address cannot be bound, this is retried every 500ms, so that
//! a second instance can take over the port of a previous one which is shutting down. Note
//! however, that failing to bind the initial address aborts the [event_loop](Server::event_loop).
//!
//! # Example
//!
//! ```no_run
//! use ldapcache::builder::Builder;
//! use ldapcache::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Setup and create a platform...
//!     let platform = Builder::new().enable_all().build().await?;
//!
//!     // Run the proxy until the platform is terminated...
//!     platform.require::<Server>().event_loop().await
//! }
//! ```
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{Config, Settings};
use crate::lru::cache::ReplyCache;
use crate::platform::Platform;
use crate::session::{proxy_loop, Session};
use crate::spawn;
use crate::upstream::Upstream;

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so that
/// we can check if the platform has been shut down.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Specifies the interval in which we try to re-bind the server socket after an address change.
const REBIND_INTERVAL: Duration = Duration::from_millis(500);

/// Represents the server which accepts all client connections.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    local_address: Mutex<Option<SocketAddr>>,
    active_sessions: AtomicUsize,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done manually
    /// via [event_loop](Server::event_loop) as it is most probably done in the main thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            local_address: Mutex::new(None),
            active_sessions: AtomicUsize::new(0),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Returns the address the server socket is currently bound to.
    ///
    /// This is mostly useful if port 0 was configured and the OS picked a free port.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.local_address.lock()
    }

    /// Returns the number of currently connected clients.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of the
    /// server. Rather we toggle this flag to false if the listen address has changed. This way
    /// **server_loop** will exit and a new server socket for the appropriate address will be
    /// setup by the **event_loop**.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the listen address based on the current configuration.
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| config.current().listen_address.clone())
            .unwrap_or_else(|| Settings::default().listen_address)
    }

    /// Starts the event loop in a separate task.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            if let Err(error) = cloned_server.event_loop().await {
                log::error!("{:#}", error);
            }
        });
    }

    /// Starts the event loop in a separate task and waits until the server socket is bound.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.local_address().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Opens the server socket and serves incoming client connections.
    ///
    /// The task of this loop is to bind the server socket to the configured address. Once this
    /// was successful, we enter the [server_loop](Server::server_loop) to actually handle
    /// incoming connections. Once this loop returns, either the platform is no longer running
    /// and we should exit, or the config has changed and we should bind the new address.
    ///
    /// # Errors
    /// Fails if the initially configured address cannot be bound.
    pub async fn event_loop(&self) -> anyhow::Result<()> {
        let mut address = String::new();
        let mut initial_bind = true;
        let mut last_bind_error_reported = Instant::now();

        while self.platform.is_running() {
            // If the sever is started for the first time or if it has been restarted due to a
            // config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            match TcpListener::bind(&address).await {
                Ok(mut listener) => {
                    initial_bind = false;
                    log::info!("Opened server socket on {}...", &address);
                    *self.current_address.lock() = Some(address.clone());
                    *self.local_address.lock() = listener.local_addr().ok();

                    self.server_loop(&mut listener).await;

                    *self.local_address.lock() = None;
                    log::info!("Closing server socket on {}.", &address);
                }
                Err(error) if initial_bind => {
                    return Err(error)
                        .with_context(|| format!("Cannot open server address: {}", &address));
                }
                Err(error) => {
                    // We retry every 500ms but only log this every once in a while (every 5s) to
                    // not jam the log...
                    if last_bind_error_reported.elapsed().as_secs() > 5 {
                        log::error!(
                            "Cannot open server address: {} ({}). Retrying every 500ms...",
                            &address,
                            error
                        );
                        last_bind_error_reported = Instant::now();
                    }
                    tokio::time::sleep(REBIND_INTERVAL).await;
                }
            }
        }

        Ok(())
    }

    /// Runs the main server loop which processes incoming connections.
    ///
    /// This also listens on config changes and exits to the event_loop if the listen address
    /// changed.
    async fn server_loop(&self, listener: &mut TcpListener) {
        // Without a config, we listen on a channel which simply never fires...
        let (_no_config, no_changes) = tokio::sync::broadcast::channel(1);
        let mut config_changed_flag = self
            .platform
            .find::<Config>()
            .map(|config| config.notifier())
            .unwrap_or(no_changes);

        while self.platform.is_running() && self.is_running() {
            tokio::select! {
                // We use a timeout here so that the while condition (esp. platform.is_running())
                // is checked every once in a while...
                timeout_stream = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    match timeout_stream {
                        Ok(Ok((stream, peer_address))) => {
                            self.handle_new_connection(stream, peer_address)
                        }
                        Ok(Err(error)) => {
                            // Accept errors are mostly transient (e.g. running out of file
                            // handles), therefore we keep the socket open...
                            log::warn!("Failed to accept a connection: {}", error);
                        }
                        Err(_) => (),
                    }
                }
                change = config_changed_flag.recv() => {
                    if let Err(tokio::sync::broadcast::error::RecvError::Closed) = change {
                        return;
                    }

                    // If the config was changed, we need to check if the address itself changed...
                    let new_address = self.address();
                    if self.current_address.lock().as_deref() != Some(new_address.as_str()) {
                        log::info!("Server address has changed. Restarting server socket...");

                        // Force the event_loop to re-evaluate the expected server address...
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }

    /// Handles a new incoming connection.
    ///
    /// This will fork a task which executes the [proxy_loop](crate::session::proxy_loop) for
    /// this connection. The upstream settings are taken from the config which is active right
    /// now.
    fn handle_new_connection(&self, stream: TcpStream, peer_address: SocketAddr) {
        let platform = self.platform.clone();
        spawn!(async move {
            // Mark the connection as nodelay, as we always write complete replies.
            let _ = stream.set_nodelay(true);

            let (server, cache) = match (platform.find::<Server>(), platform.find::<ReplyCache>())
            {
                (Some(server), Some(cache)) => (server, cache),
                _ => {
                    log::error!(
                        "Dropping connection from {}: no reply cache is installed.",
                        peer_address
                    );
                    return;
                }
            };
            let settings = platform
                .find::<Config>()
                .map(|config| config.current())
                .unwrap_or_default();

            let upstream = Upstream::new(&settings.target_server, settings.upstream_timeout);
            let mut session = Session::new(cache, upstream);

            log::debug!("Opened connection from {}...", peer_address);
            let _ = server.active_sessions.fetch_add(1, Ordering::AcqRel);

            if let Err(error) = proxy_loop(platform, &mut session, stream).await {
                log::debug!(
                    "Closing connection to {} due to an error: {:#}",
                    peer_address,
                    error
                );
            }

            let _ = server.active_sessions.fetch_sub(1, Ordering::AcqRel);
            log::debug!(
                "Closed connection to {} ({}).",
                peer_address,
                session.stats()
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::lru::cache;
    use crate::message::Message;
    use crate::platform::Platform;
    use crate::reader::FrameReader;
    use crate::server::Server;
    use crate::testing::{mock_upstream, received, test_async};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn setup(upstream_address: &str) -> Arc<Platform> {
        let platform = Platform::new();
        let config = Arc::new(Config::new("test_settings.yml"));
        config
            .load_from_string(
                format!(
                    "
server:
    listen: 127.0.0.1:0
upstream:
    address: {}
    timeout: 5s
cache:
    duration: 60
",
                    upstream_address
                )
                .as_str(),
                None,
            )
            .unwrap();
        platform.register::<Config>(config);
        let _ = cache::install(platform.clone());
        let server = Server::install(&platform);
        Server::fork_and_await(&server).await;

        platform
    }

    async fn exchange(stream: &mut TcpStream, request: &Message, expected: usize) -> Vec<Message> {
        stream.write_all(request.raw()).await.unwrap();
        stream.flush().await.unwrap();

        let mut reader = FrameReader::new(stream);
        let mut replies = Vec::new();
        for _ in 0..expected {
            replies.push(reader.read_frame().await.unwrap().unwrap());
        }
        assert_eq!(reader.buffered(), 0);

        replies
    }

    #[test]
    fn integration_test() {
        test_async(async {
            let bind = Message::example(1, 0, b"cn=admin");
            let search = Message::example(2, 3, b"ou=people");
            let mut script = HashMap::new();
            let _ = script.insert(1, vec![Message::example(1, 1, b"")]);
            let _ = script.insert(
                2,
                vec![
                    Message::example(2, 4, b"cn=a"),
                    Message::example(2, 4, b"cn=b"),
                    Message::example(2, 5, b""),
                ],
            );
            let (upstream_address, mut rx) = mock_upstream(script).await;

            let platform = setup(&upstream_address).await;
            let server = platform.require::<Server>();
            let address = server.local_address().unwrap();

            // The first client populates the cache...
            let mut first = TcpStream::connect(address).await.unwrap();
            assert_eq!(exchange(&mut first, &bind, 1).await.len(), 1);
            let replies = exchange(&mut first, &search, 3).await;
            assert_eq!(received(&mut rx).len(), 2);

            // ...so that the second one is served without contacting upstream...
            let mut second = TcpStream::connect(address).await.unwrap();
            assert_eq!(exchange(&mut second, &bind, 1).await.len(), 1);
            let cached_replies = exchange(&mut second, &search, 3).await;
            assert_eq!(
                cached_replies.iter().map(|m| m.raw()).collect::<Vec<_>>(),
                replies.iter().map(|m| m.raw()).collect::<Vec<_>>()
            );
            assert_eq!(received(&mut rx).is_empty(), true);
            assert_eq!(server.active_sessions(), 2);

            drop(first);
            drop(second);
            for _ in 0..100 {
                if server.active_sessions() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(server.active_sessions(), 0);

            platform.terminate();
        });
    }

    #[test]
    fn concurrent_sessions_do_not_interleave() {
        test_async(async {
            let mut script = HashMap::new();
            for id in 1..=20 {
                let _ = script.insert(
                    id,
                    vec![
                        Message::example(id as i32, 4, format!("cn={}", id).as_bytes()),
                        Message::example(id as i32, 5, b""),
                    ],
                );
            }
            let (upstream_address, _rx) = mock_upstream(script).await;
            let platform = setup(&upstream_address).await;
            let address = platform.require::<Server>().local_address().unwrap();

            let mut clients = Vec::new();
            for offset in [0, 10] {
                clients.push(tokio::spawn(async move {
                    let mut stream = TcpStream::connect(address).await.unwrap();
                    for id in offset + 1..=offset + 10 {
                        let request = Message::example(id, 3, b"search");
                        let replies = exchange(&mut stream, &request, 2).await;
                        assert_eq!(replies[0].message_id(), Some(id as i64));
                        assert_eq!(replies[1].message_id(), Some(id as i64));
                    }
                }));
            }
            for client in clients {
                client.await.unwrap();
            }

            platform.terminate();
        });
    }

    #[test]
    fn an_occupied_address_fails_the_initial_bind() {
        test_async(async {
            let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let platform = Platform::new();
            let config = Arc::new(Config::new("test_settings.yml"));
            config
                .load_from_string(
                    format!("server:\n    listen: {}", occupied.local_addr().unwrap()).as_str(),
                    None,
                )
                .unwrap();
            platform.register::<Config>(config);

            let server = Server::install(&platform);
            assert_eq!(server.event_loop().await.is_err(), true);

            platform.terminate();
        });
    }

    #[test]
    fn connections_are_dropped_without_a_cache() {
        test_async(async {
            let (upstream_address, mut rx) = mock_upstream(HashMap::new()).await;
            let platform = Platform::new();
            let config = Arc::new(Config::new("test_settings.yml"));
            config
                .load_from_string(
                    format!(
                        "server:\n    listen: 127.0.0.1:0\nupstream:\n    address: {}",
                        upstream_address
                    )
                    .as_str(),
                    None,
                )
                .unwrap();
            platform.register::<Config>(config);
            let server = Server::install(&platform);
            Server::fork_and_await(&server).await;

            let mut stream = TcpStream::connect(server.local_address().unwrap())
                .await
                .unwrap();
            let _ = stream
                .write_all(Message::example(1, 0, b"cn=admin").raw())
                .await;
            let mut reader = FrameReader::new(&mut stream);
            assert_eq!(
                matches!(reader.read_frame().await, Ok(None) | Err(_)),
                true
            );
            assert_eq!(received(&mut rx).is_empty(), true);
            assert_eq!(server.active_sessions(), 0);

            platform.terminate();
        });
    }
}
