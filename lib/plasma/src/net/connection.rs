use crate::net::error::{CommError, CommResult};
use crate::net::framer::{ByteIoFramer, ByteIoFramerFactory, Message, MessageReceiver, OutboundMessage};
use crate::run::Runner;
use slog::{debug, warn, Logger};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

const READ_BUFFER_SIZE: usize = 8192;

/// A live connection as seen by the application: an outbound message sink
/// with an identity. All methods may be called from any thread.
pub trait Connection: Send + Sync {
    /// Queues a message for transmission. Messages are written in the order
    /// queued; messages queued before `close` are still sent.
    fn send_msg(&self, message: OutboundMessage);

    /// Initiates an orderly shutdown once the send queue drains.
    fn close(&self);

    /// Printable identity for logging.
    fn label(&self) -> &str;
}

/// Application-side processing for one connection. All calls arrive on the
/// runner thread, one at a time.
pub trait MessageHandler: Send {
    fn process_message(&mut self, connection: &Arc<dyn Connection>, message: Message);

    /// The connection is gone; `reason` distinguishes clean closes
    /// (`EndOfInput`) from failures.
    fn connection_died(&mut self, connection: &Arc<dyn Connection>, reason: CommError);
}

/// Makes a handler for each new connection, and hears about connections that
/// never got established at all.
pub trait MessageHandlerFactory: Send + Sync {
    fn provide_message_handler(&self, connection: &Arc<dyn Connection>) -> Box<dyn MessageHandler>;

    /// An outbound connection attempt failed before a connection existed.
    fn handle_connection_failure(&self);
}

/// Receiver that carries framer deliveries from the I/O thread onto the
/// runner, so handlers only ever run in the serialized execution context.
struct DispatchReceiver {
    runner: Runner,
    handler: Arc<Mutex<Box<dyn MessageHandler>>>,
    connection: Arc<dyn Connection>,
}

impl MessageReceiver for DispatchReceiver {
    fn receive_msg(&mut self, message: Message) {
        let handler = self.handler.clone();
        let connection = self.connection.clone();
        self.runner.enqueue(move || {
            handler.lock().expect("Handler lock poisoned").process_message(&connection, message)
        });
    }
}

enum WriteItem {
    Msg(OutboundMessage),
    Close,
}

/// A TCP connection serviced by a dedicated reader thread and writer thread.
/// The reader feeds the framer; complete messages hop to the runner. The
/// writer drains the send queue through the framer's byte production.
pub struct TcpConnection {
    label: String,
    sender: Mutex<mpsc::Sender<WriteItem>>,
    closed: AtomicBool,
}

impl TcpConnection {
    /// Wires up a fresh connection over `stream` and starts its I/O threads.
    pub fn start(
        stream: TcpStream,
        label: String,
        handler_factory: &Arc<dyn MessageHandlerFactory>,
        framer_factory: &Arc<dyn ByteIoFramerFactory>,
        runner: &Runner,
        logger: &Logger,
    ) -> CommResult<Arc<TcpConnection>> {
        let writer_stream = stream.try_clone()?;
        let (sender, write_queue) = mpsc::channel();
        let connection = Arc::new(TcpConnection {
            label,
            sender: Mutex::new(sender),
            closed: AtomicBool::new(false),
        });
        let as_connection: Arc<dyn Connection> = connection.clone();
        let handler = Arc::new(Mutex::new(handler_factory.provide_message_handler(&as_connection)));
        let receiver = DispatchReceiver {
            runner: runner.clone(),
            handler: handler.clone(),
            connection: as_connection.clone(),
        };
        let framer: Arc<Mutex<Box<dyn ByteIoFramer>>> =
            Arc::new(Mutex::new(framer_factory.provide_framer(Box::new(receiver), connection.label())));

        spawn_reader(
            stream,
            connection.clone(),
            as_connection,
            framer.clone(),
            handler,
            runner.clone(),
            logger.clone(),
        );
        spawn_writer(writer_stream, connection.clone(), framer, write_queue, logger.clone());
        Ok(connection)
    }
}

impl Connection for TcpConnection {
    fn send_msg(&self, message: OutboundMessage) {
        let _ = self.sender.lock().expect("Send queue poisoned").send(WriteItem::Msg(message));
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.sender.lock().expect("Send queue poisoned").send(WriteItem::Close);
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

fn spawn_reader(
    mut stream: TcpStream,
    connection: Arc<TcpConnection>,
    as_connection: Arc<dyn Connection>,
    framer: Arc<Mutex<Box<dyn ByteIoFramer>>>,
    handler: Arc<Mutex<Box<dyn MessageHandler>>>,
    runner: Runner,
    logger: Logger,
) {
    let name = format!("read {}", connection.label());
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            let reason = loop {
                match stream.read(&mut buffer) {
                    Ok(0) => {
                        break match framer.lock().expect("Framer poisoned").receive_bytes(&[]) {
                            Ok(()) | Err(CommError::EndOfInput) => CommError::EndOfInput,
                            Err(error) => error,
                        };
                    }
                    Ok(count) => {
                        if let Err(error) = framer.lock().expect("Framer poisoned").receive_bytes(&buffer[..count]) {
                            break error;
                        }
                    }
                    Err(error) => break CommError::from(error),
                }
            };
            debug!(logger, "{} input ended: {}", connection.label(), reason);
            connection.close();
            runner.enqueue(move || {
                handler.lock().expect("Handler lock poisoned").connection_died(&as_connection, reason)
            });
        })
        .expect("Failed to spawn connection reader thread");
}

fn spawn_writer(
    mut stream: TcpStream,
    connection: Arc<TcpConnection>,
    framer: Arc<Mutex<Box<dyn ByteIoFramer>>>,
    write_queue: mpsc::Receiver<WriteItem>,
    logger: Logger,
) {
    let name = format!("write {}", connection.label());
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            for item in write_queue {
                match item {
                    WriteItem::Msg(message) => {
                        let rendered = framer.lock().expect("Framer poisoned").produce_bytes(&message);
                        match rendered {
                            Ok(bytes) => {
                                if stream.write_all(&bytes).is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                // An unwritable message is the sender's bug,
                                // not grounds for killing the connection.
                                warn!(
                                    logger,
                                    "{} dropping {} message: {}",
                                    connection.label(),
                                    message.kind(),
                                    error
                                );
                            }
                        }
                    }
                    WriteItem::Close => break,
                }
            }
            let _ = stream.shutdown(Shutdown::Both);
        })
        .expect("Failed to spawn connection writer thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logger;
    use ember::fault::LogFaultReporter;
    use serde_json::json;
    use std::time::Duration;

    struct NullConnection;

    impl Connection for NullConnection {
        fn send_msg(&self, _message: OutboundMessage) {}
        fn close(&self) {}
        fn label(&self) -> &str {
            "null"
        }
    }

    struct RecordingHandler {
        sink: mpsc::Sender<Message>,
    }

    impl MessageHandler for RecordingHandler {
        fn process_message(&mut self, _connection: &Arc<dyn Connection>, message: Message) {
            self.sink.send(message).unwrap();
        }

        fn connection_died(&mut self, _connection: &Arc<dyn Connection>, _reason: CommError) {}
    }

    #[test]
    fn dispatch_receiver_preserves_delivery_order() {
        let runner = Runner::new(
            "dispatch-test",
            Arc::new(LogFaultReporter::new(test_logger())),
            test_logger(),
        );
        let (tx, rx) = mpsc::channel();
        let handler: Arc<Mutex<Box<dyn MessageHandler>>> =
            Arc::new(Mutex::new(Box::new(RecordingHandler { sink: tx })));
        let connection: Arc<dyn Connection> = Arc::new(NullConnection);
        let mut receiver = DispatchReceiver { runner, handler, connection };

        for i in 0..20 {
            receiver.receive_msg(Message::Json(json!({ "seq": i })));
        }
        for i in 0..20 {
            let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(message, Message::Json(json!({ "seq": i })));
        }
    }
}
