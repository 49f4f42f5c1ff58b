pub mod http;
pub mod json;
pub mod rtcp;
pub mod websocket;

use crate::net::error::CommResult;
use serde_json::Value;

use self::http::{HttpError, HttpOptionsReply, HttpRequest};
use self::rtcp::RtcpRequest;
use self::websocket::{WebsocketHandshake, WebsocketRequest};

/// One complete inbound unit produced by a framer.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A decoded JSON message.
    Json(Value),
    /// Diagnostic for a malformed JSON block. Only delivered when debug
    /// replies are enabled.
    SyntaxError(String),
    /// A complete HTTP request, body included.
    Http(HttpRequest),
    /// A complete RTCP request, delivered messages included.
    Rtcp(RtcpRequest),
    /// A parsed WebSocket upgrade request, delivered once all handshake bytes
    /// have arrived. The application answers with a handshake reply.
    Websocket(WebsocketRequest),
}

/// One outbound unit for a framer to render into wire bytes.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Preformatted text, sent as the protocol's message body.
    Text(String),
    /// A JSON message, serialized by the framer.
    Json(Value),
    /// A WebSocket handshake reply.
    Handshake(WebsocketHandshake),
    /// An HTTP-style error reply.
    Error(HttpError),
    /// A CORS preflight reply.
    OptionsReply(HttpOptionsReply),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Text(_) => "text",
            OutboundMessage::Json(_) => "json",
            OutboundMessage::Handshake(_) => "handshake",
            OutboundMessage::Error(_) => "error",
            OutboundMessage::OptionsReply(_) => "options reply",
        }
    }
}

/// Consumer of complete inbound messages. Implementations are expected to
/// enqueue dispatch onto a `Runner` rather than act on the I/O thread.
pub trait MessageReceiver: Send {
    fn receive_msg(&mut self, message: Message);
}

/// Protocol state machine translating between raw socket bytes and complete
/// messages. Fed incrementally; arbitrary fragmentation of the byte stream
/// must not change what gets delivered.
pub trait ByteIoFramer: Send {
    /// Feeds freshly received bytes. An empty slice signals end of input.
    /// Any number of complete messages may be delivered to the receiver.
    fn receive_bytes(&mut self, data: &[u8]) -> CommResult<()>;

    /// Renders one outbound message into wire bytes.
    fn produce_bytes(&self, message: &OutboundMessage) -> CommResult<Vec<u8>>;
}

/// Per-connection framer construction, one factory per listening protocol.
pub trait ByteIoFramerFactory: Send + Sync {
    fn provide_framer(&self, receiver: Box<dyn MessageReceiver>, label: &str) -> Box<dyn ByteIoFramer>;
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Receiver that records everything delivered to it.
    #[derive(Clone)]
    pub struct CollectingReceiver {
        messages: Arc<Mutex<Vec<Message>>>,
    }

    impl CollectingReceiver {
        pub fn new() -> CollectingReceiver {
            CollectingReceiver { messages: Arc::new(Mutex::new(Vec::new())) }
        }

        pub fn collected(&self) -> Vec<Message> {
            self.messages.lock().unwrap().clone()
        }

        pub fn count(&self) -> usize {
            self.messages.lock().unwrap().len()
        }
    }

    impl MessageReceiver for CollectingReceiver {
        fn receive_msg(&mut self, message: Message) {
            self.messages.lock().unwrap().push(message);
        }
    }
}
