use slog::Logger;
use std::any::Any;

/// Sink for faults escaping deferred work (queued work items, timer targets).
/// The executing thread must survive the fault, so it hands the details here
/// instead of unwinding.
pub trait FaultReporter: Send + Sync {
    fn report(&self, context: &str, detail: &str);
}

/// Reports faults to a structured logger at error level.
pub struct LogFaultReporter {
    logger: Logger,
}

impl LogFaultReporter {
    pub fn new(logger: Logger) -> LogFaultReporter {
        LogFaultReporter { logger }
    }
}

impl FaultReporter for LogFaultReporter {
    fn report(&self, context: &str, detail: &str) {
        slog::error!(self.logger, "Uncaught fault in {}: {}", context, detail);
    }
}

/// Extracts a printable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "unknown panic payload"
    }
}
