use crate::net::connection::{Connection, MessageHandler, MessageHandlerFactory};
use crate::net::framer::ByteIoFramerFactory;
use crate::net::tcp::ConnectionFactory;
use crate::run::Runner;
use crate::timer::TimerService;
use slog::{info, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Where and how persistently to connect.
#[derive(Debug, Clone)]
pub struct HostDesc {
    pub host_port: String,
    pub retry_interval_millis: u64,
}

/// Keeps attempting a connection to one host until it succeeds or the caller
/// gives up. Each failure schedules exactly one retry timer; nothing retries
/// in a loop on its own.
pub struct ConnectionRetrier {
    keep_trying: Arc<AtomicBool>,
    label: String,
    logger: Logger,
}

impl ConnectionRetrier {
    pub fn new(
        host: HostDesc,
        label: &str,
        connector: Arc<dyn ConnectionFactory>,
        handler_factory: Arc<dyn MessageHandlerFactory>,
        framer_factory: Arc<dyn ByteIoFramerFactory>,
        timer: &TimerService,
        runner: &Runner,
        logger: Logger,
    ) -> ConnectionRetrier {
        let keep_trying = Arc::new(AtomicBool::new(true));
        let factory = Arc::new_cyclic(|me: &Weak<RetryFactory>| RetryFactory {
            me: me.clone(),
            host: host.clone(),
            connector: connector.clone(),
            actual: handler_factory,
            framer_factory,
            keep_trying: keep_trying.clone(),
            timer: timer.clone(),
            runner: runner.clone(),
            logger: logger.clone(),
        });
        info!(logger, "{}: connecting to {}", label, host.host_port);
        connector.connect(&host.host_port, factory.clone(), factory.framer_factory.clone());
        ConnectionRetrier { keep_trying, label: label.to_string(), logger }
    }

    /// Stops retrying. A retry timer already pending will expire harmlessly.
    pub fn give_up(&self) {
        info!(self.logger, "{}: giving up", self.label);
        self.keep_trying.store(false, Ordering::SeqCst);
    }
}

/// Interposes on connection failures to schedule the next attempt, passing
/// everything else through to the application's factory.
struct RetryFactory {
    me: Weak<RetryFactory>,
    host: HostDesc,
    connector: Arc<dyn ConnectionFactory>,
    actual: Arc<dyn MessageHandlerFactory>,
    framer_factory: Arc<dyn ByteIoFramerFactory>,
    keep_trying: Arc<AtomicBool>,
    timer: TimerService,
    runner: Runner,
    logger: Logger,
}

impl MessageHandlerFactory for RetryFactory {
    fn provide_message_handler(&self, connection: &Arc<dyn Connection>) -> Box<dyn MessageHandler> {
        self.actual.provide_message_handler(connection)
    }

    fn handle_connection_failure(&self) {
        if !self.keep_trying.load(Ordering::SeqCst) {
            return;
        }
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        self.timer.after(self.host.retry_interval_millis, &self.runner, move || {
            if me.keep_trying.load(Ordering::SeqCst) {
                info!(me.logger, "Retrying connection to {}", me.host.host_port);
                me.connector.connect(&me.host.host_port, me.clone(), me.framer_factory.clone());
            }
        });
    }
}
