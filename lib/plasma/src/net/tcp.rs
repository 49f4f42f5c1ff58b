use crate::net::connection::{MessageHandlerFactory, TcpConnection};
use crate::net::framer::ByteIoFramerFactory;
use crate::run::Runner;
use slog::{info, warn, Logger};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Initiates outbound connections. The seam exists so retry logic and tests
/// can stand in for real TCP.
pub trait ConnectionFactory: Send + Sync {
    /// Attempts a connection to `host_port`. Failure to establish one is
    /// reported through `handler_factory.handle_connection_failure()`;
    /// success hands the connection to a handler from the same factory.
    fn connect(
        &self,
        host_port: &str,
        handler_factory: Arc<dyn MessageHandlerFactory>,
        framer_factory: Arc<dyn ByteIoFramerFactory>,
    );
}

/// Outbound TCP connection establishment, off-thread so callers never block
/// on connect timeouts.
pub struct TcpClientFactory {
    runner: Runner,
    logger: Logger,
}

impl TcpClientFactory {
    pub fn new(runner: Runner, logger: Logger) -> TcpClientFactory {
        TcpClientFactory { runner, logger }
    }
}

impl ConnectionFactory for TcpClientFactory {
    fn connect(
        &self,
        host_port: &str,
        handler_factory: Arc<dyn MessageHandlerFactory>,
        framer_factory: Arc<dyn ByteIoFramerFactory>,
    ) {
        let host_port = host_port.to_string();
        let runner = self.runner.clone();
        let logger = self.logger.clone();
        thread::Builder::new()
            .name(format!("connect {}", host_port))
            .spawn(move || {
                match TcpStream::connect(&host_port) {
                    Ok(stream) => {
                        info!(logger, "Connected to {}", host_port);
                        let started = TcpConnection::start(
                            stream,
                            host_port.clone(),
                            &handler_factory,
                            &framer_factory,
                            &runner,
                            &logger,
                        );
                        if let Err(error) = started {
                            warn!(logger, "Failed to set up connection to {}: {}", host_port, error);
                            handler_factory.handle_connection_failure();
                        }
                    }
                    Err(error) => {
                        warn!(logger, "Failed to connect to {}: {}", host_port, error);
                        handler_factory.handle_connection_failure();
                    }
                }
            })
            .expect("Failed to spawn connect thread");
    }
}

/// A listening endpoint accepting connections for one protocol.
pub struct TcpServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
}

impl TcpServer {
    pub fn listen(
        address: &str,
        handler_factory: Arc<dyn MessageHandlerFactory>,
        framer_factory: Arc<dyn ByteIoFramerFactory>,
        runner: &Runner,
        logger: &Logger,
    ) -> io::Result<TcpServer> {
        let listener = TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        info!(logger, "Listening on {}", local_addr);

        let accept_stop = stop.clone();
        let accept_runner = runner.clone();
        let accept_logger = logger.clone();
        thread::Builder::new()
            .name(format!("listen {}", local_addr))
            .spawn(move || {
                for incoming in listener.incoming() {
                    if accept_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match incoming {
                        Ok(stream) => {
                            let label = stream
                                .peer_addr()
                                .map(|addr| addr.to_string())
                                .unwrap_or_else(|_| "<unknown peer>".to_string());
                            let started = TcpConnection::start(
                                stream,
                                label,
                                &handler_factory,
                                &framer_factory,
                                &accept_runner,
                                &accept_logger,
                            );
                            if let Err(error) = started {
                                warn!(accept_logger, "Failed to set up accepted connection: {}", error);
                            }
                        }
                        Err(error) => {
                            warn!(accept_logger, "Accept failed: {}", error);
                        }
                    }
                }
            })
            .expect("Failed to spawn listener thread");

        Ok(TcpServer { local_addr, stop })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting. Established connections are unaffected.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // A throwaway connection unblocks the accept loop.
        let _ = TcpStream::connect(self.local_addr);
    }
}
