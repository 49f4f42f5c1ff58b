use crate::net::error::{CommError, CommResult};
use crate::net::framer::http::HttpRequest;
use crate::net::framer::json::{deliver_block, JsonBlockReader};
use crate::net::framer::{ByteIoFramer, ByteIoFramerFactory, Message, MessageReceiver, OutboundMessage};
use crate::net::input::ChunkedInputBuffer;
use slog::{debug, Logger};

/// GUID every conforming endpoint mixes into the accept digest.
pub const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const CRAZY_KEY_LENGTH: usize = 8;

/// A parsed WebSocket upgrade request: an HTTP request plus, for the legacy
/// handshake generation, the 8 raw key bytes that follow the headers.
#[derive(Debug, Clone, PartialEq)]
pub struct WebsocketRequest {
    http: HttpRequest,
    crazy_key: Option<Vec<u8>>,
}

impl WebsocketRequest {
    pub fn new() -> WebsocketRequest {
        WebsocketRequest { http: HttpRequest::new(), crazy_key: None }
    }

    pub fn method(&self) -> Option<&str> {
        self.http.method()
    }

    pub fn uri(&self) -> Option<&str> {
        self.http.uri()
    }

    /// Header value by lower-cased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.http.header(name)
    }

    /// The legacy handshake's trailing key bytes, when present.
    pub fn crazy_key(&self) -> Option<&[u8]> {
        self.crazy_key.as_deref()
    }

    fn wants_crazy_key(&self) -> bool {
        self.http.header("sec-websocket-key1").is_some()
    }
}

/// A computed handshake reply, ready for a framer to render.
#[derive(Debug, Clone, PartialEq)]
pub struct WebsocketHandshake {
    version: u8,
    bytes: Vec<u8>,
}

impl WebsocketHandshake {
    /// Legacy reply: the 16-byte MD5 digest sent after the 101 headers.
    pub fn legacy(digest: Vec<u8>) -> WebsocketHandshake {
        WebsocketHandshake { version: 0, bytes: digest }
    }

    /// Current reply: the base64 accept token for the `Sec-WebSocket-Accept`
    /// header.
    pub fn accept(token: String) -> WebsocketHandshake {
        WebsocketHandshake { version: 6, bytes: token.into_bytes() }
    }

    /// Computes the reply matching whichever handshake generation the request
    /// speaks.
    pub fn for_request(request: &WebsocketRequest) -> CommResult<WebsocketHandshake> {
        if let Some(key) = request.header("sec-websocket-key") {
            return Ok(WebsocketHandshake::accept(base64::encode(accept_token(key))));
        }
        if let (Some(key1), Some(key2), Some(token)) = (
            request.header("sec-websocket-key1"),
            request.header("sec-websocket-key2"),
            request.crazy_key(),
        ) {
            return Ok(WebsocketHandshake::legacy(legacy_digest(key1, key2, token)));
        }
        Err(CommError::UnsupportedHandshakeVersion)
    }
}

/// SHA-1 digest of the client key joined with the handshake GUID.
pub fn accept_token(key: &str) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    hasher.digest().bytes()
}

/// MD5 digest over the two decoded key numbers and the trailing key bytes,
/// per the legacy handshake.
pub fn legacy_digest(key1: &str, key2: &str, token: &[u8]) -> Vec<u8> {
    let mut material = Vec::with_capacity(16);
    material.extend_from_slice(&(insane_key_decode(key1) as u32).to_be_bytes());
    material.extend_from_slice(&(insane_key_decode(key2) as u32).to_be_bytes());
    material.extend_from_slice(token);
    md5::compute(&material).0.to_vec()
}

/// The legacy handshake's key obfuscation: the digits scattered through the
/// key form a number, which is then divided by the count of spaces.
pub fn insane_key_decode(key: &str) -> u64 {
    let mut number: u64 = 0;
    let mut spaces: u64 = 0;
    for c in key.chars() {
        if let Some(digit) = c.to_digit(10) {
            number = number * 10 + u64::from(digit);
        } else if c == ' ' {
            spaces += 1;
        }
    }
    if spaces == 0 {
        number
    } else {
        number / spaces
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WsStage {
    StartLine,
    Headers,
    HandshakeTail,
    Messages,
}

/// Framer for WebSocket connections: parses the HTTP-style upgrade request,
/// then carries the JSON message protocol inside 0x00/0xFF text frames.
pub struct WebsocketFramer {
    input: ChunkedInputBuffer,
    block_reader: JsonBlockReader,
    stage: WsStage,
    request: WebsocketRequest,
    receiver: Box<dyn MessageReceiver>,
    host_address: String,
    socket_uri: String,
    send_debug_replies: bool,
    label: String,
    logger: Logger,
}

impl WebsocketFramer {
    pub fn new(
        receiver: Box<dyn MessageReceiver>,
        label: &str,
        host_address: &str,
        socket_uri: &str,
        max_msg_length: usize,
        send_debug_replies: bool,
        logger: Logger,
    ) -> WebsocketFramer {
        WebsocketFramer {
            input: ChunkedInputBuffer::new(),
            block_reader: JsonBlockReader::new(max_msg_length),
            stage: WsStage::StartLine,
            request: WebsocketRequest::new(),
            receiver,
            host_address: host_address.to_string(),
            socket_uri: socket_uri.to_string(),
            send_debug_replies,
            label: label.to_string(),
            logger,
        }
    }

    /// Host name half of the configured address, for the legacy origin header.
    fn host_name(&self) -> &str {
        match self.host_address.find(':') {
            Some(colon) => &self.host_address[..colon],
            None => &self.host_address,
        }
    }

    fn deliver_upgrade(&mut self) {
        let request = std::mem::replace(&mut self.request, WebsocketRequest::new());
        debug!(self.logger, "{} -> websocket upgrade for {:?}", self.label, request.uri());
        self.receiver.receive_msg(Message::Websocket(request));
        self.stage = WsStage::Messages;
        self.input.enable_frame_mode();
    }

    fn render_handshake(&self, handshake: &WebsocketHandshake) -> CommResult<Vec<u8>> {
        match handshake.version {
            0 => {
                let mut reply = format!(
                    "HTTP/1.1 101 WebSocket Protocol Handshake\r\n\
                     Upgrade: WebSocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Origin: http://{}\r\n\
                     Sec-WebSocket-Location: ws://{}{}\r\n\
                     Sec-WebSocket-Protocol: *\r\n\r\n",
                    self.host_name(),
                    self.host_address,
                    self.socket_uri
                )
                .into_bytes();
                reply.extend_from_slice(&handshake.bytes);
                Ok(reply)
            }
            6 => {
                let mut reply = String::from(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: Websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: ",
                );
                reply.push_str(std::str::from_utf8(&handshake.bytes).map_err(|_| CommError::BadUtf8Encoding)?);
                reply.push_str("\r\n\r\n");
                Ok(reply.into_bytes())
            }
            _ => Err(CommError::UnsupportedHandshakeVersion),
        }
    }
}

impl ByteIoFramer for WebsocketFramer {
    fn receive_bytes(&mut self, data: &[u8]) -> CommResult<()> {
        self.input.add_chunk(data);
        loop {
            match self.stage {
                WsStage::StartLine => match self.input.read_ascii_line()? {
                    None => {
                        self.input.preserve_buffers();
                        return Ok(());
                    }
                    Some(line) => {
                        if !line.is_empty() {
                            self.request.http.parse_start_line(&line);
                            self.stage = WsStage::Headers;
                        }
                    }
                },
                WsStage::Headers => match self.input.read_ascii_line()? {
                    None => {
                        self.input.preserve_buffers();
                        return Ok(());
                    }
                    Some(line) => {
                        if line.is_empty() {
                            if self.request.wants_crazy_key() {
                                self.stage = WsStage::HandshakeTail;
                            } else {
                                self.deliver_upgrade();
                            }
                        } else {
                            self.request.http.parse_header_line(&line);
                        }
                    }
                },
                WsStage::HandshakeTail => match self.input.read_bytes(CRAZY_KEY_LENGTH) {
                    None => {
                        self.input.preserve_buffers();
                        return Ok(());
                    }
                    Some(token) => {
                        self.request.crazy_key = Some(token);
                        self.deliver_upgrade();
                    }
                },
                WsStage::Messages => match self.block_reader.next_block(&mut self.input)? {
                    None => {
                        self.input.preserve_buffers();
                        return Ok(());
                    }
                    Some(block) => {
                        deliver_block(block, &mut *self.receiver, self.send_debug_replies, &self.label, &self.logger);
                    }
                },
            }
        }
    }

    fn produce_bytes(&self, message: &OutboundMessage) -> CommResult<Vec<u8>> {
        match message {
            OutboundMessage::Text(text) => Ok(frame_text(text)),
            OutboundMessage::Json(value) => Ok(frame_text(&value.to_string())),
            OutboundMessage::Handshake(handshake) => self.render_handshake(handshake),
            OutboundMessage::Error(error) => Ok(crate::net::framer::http::render_error(error)),
            other => Err(CommError::UnwritableMessage(other.kind())),
        }
    }
}

fn frame_text(text: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(text.len() + 2);
    frame.push(0x00);
    frame.extend_from_slice(text.as_bytes());
    frame.push(0xFF);
    frame
}

/// Provides WebSocket framers for a listener at a fixed address and endpoint
/// URI, both of which the legacy handshake reply echoes back.
pub struct WebsocketFramerFactory {
    host_address: String,
    socket_uri: String,
    max_msg_length: usize,
    send_debug_replies: bool,
    logger: Logger,
}

impl WebsocketFramerFactory {
    pub fn new(
        host_address: &str,
        socket_uri: &str,
        max_msg_length: usize,
        send_debug_replies: bool,
        logger: Logger,
    ) -> WebsocketFramerFactory {
        WebsocketFramerFactory {
            host_address: host_address.to_string(),
            socket_uri: socket_uri.to_string(),
            max_msg_length,
            send_debug_replies,
            logger,
        }
    }
}

impl ByteIoFramerFactory for WebsocketFramerFactory {
    fn provide_framer(&self, receiver: Box<dyn MessageReceiver>, label: &str) -> Box<dyn ByteIoFramer> {
        Box::new(WebsocketFramer::new(
            receiver,
            label,
            &self.host_address,
            &self.socket_uri,
            self.max_msg_length,
            self.send_debug_replies,
            self.logger.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framer::testutil::CollectingReceiver;
    use crate::test_logger;
    use serde_json::json;

    fn framer(receiver: CollectingReceiver) -> WebsocketFramer {
        WebsocketFramer::new(
            Box::new(receiver),
            "testconn",
            "game.example.com:9001",
            "/ws",
            1024,
            false,
            test_logger(),
        )
    }

    const UPGRADE: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: game.example.com:9001\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    #[test]
    fn upgrade_request_delivered_then_frames_carry_json() {
        let receiver = CollectingReceiver::new();
        let mut framer = framer(receiver.clone());
        framer.receive_bytes(UPGRADE).unwrap();
        let collected = receiver.collected();
        assert_eq!(collected.len(), 1);
        match &collected[0] {
            Message::Websocket(request) => {
                assert_eq!(request.uri(), Some("/ws"));
                assert_eq!(request.header("sec-websocket-key"), Some("dGhlIHNhbXBsZSBub25jZQ=="));
            }
            other => panic!("expected an upgrade request, got {:?}", other),
        }

        // The frame's text ends with a newline, so the 0xFF terminator forms
        // the blank line that completes the message block.
        let mut frame = vec![0x00];
        frame.extend_from_slice(b"{\"op\":\"hello\"}\n");
        frame.push(0xFF);
        framer.receive_bytes(&frame).unwrap();
        assert_eq!(receiver.collected()[1], Message::Json(json!({"op": "hello"})));
    }

    #[test]
    fn frames_pipelined_with_upgrade_are_not_lost() {
        let receiver = CollectingReceiver::new();
        let mut framer = framer(receiver.clone());
        let mut wire = UPGRADE.to_vec();
        wire.push(0x00);
        wire.extend_from_slice(b"{\"op\":\"eager\"}\n");
        wire.push(0xFF);
        framer.receive_bytes(&wire).unwrap();
        assert_eq!(receiver.count(), 2);
        assert_eq!(receiver.collected()[1], Message::Json(json!({"op": "eager"})));
    }

    #[test]
    fn legacy_upgrade_waits_for_every_token_byte() {
        let receiver = CollectingReceiver::new();
        let mut framer = framer(receiver.clone());
        framer
            .receive_bytes(
                b"GET /ws HTTP/1.1\r\n\
                  Sec-WebSocket-Key1: 1 2\r\n\
                  Sec-WebSocket-Key2: 3 4\r\n\r\n",
            )
            .unwrap();
        for &byte in b"12345678".iter().take(7) {
            framer.receive_bytes(&[byte]).unwrap();
            assert_eq!(receiver.count(), 0);
        }
        framer.receive_bytes(&[b'8']).unwrap();
        let collected = receiver.collected();
        match &collected[0] {
            Message::Websocket(request) => assert_eq!(request.crazy_key(), Some(&b"12345678"[..])),
            other => panic!("expected an upgrade request, got {:?}", other),
        }
    }

    #[test]
    fn accept_token_matches_the_published_example() {
        let token = accept_token("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(base64::encode(&token), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn key_decode_divides_digits_by_spaces() {
        // digits 123, two spaces
        assert_eq!(insane_key_decode("a1 b2 c3"), 61);
        assert_eq!(insane_key_decode("42"), 42);
    }

    #[test]
    fn accept_handshake_renders_switching_protocols() {
        let receiver = CollectingReceiver::new();
        let framer = framer(receiver);
        let handshake = WebsocketHandshake::accept("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".to_string());
        let bytes = framer.produce_bytes(&OutboundMessage::Handshake(handshake)).unwrap();
        let expected = "HTTP/1.1 101 Switching Protocols\r\n\
                        Upgrade: Websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert_eq!(bytes, expected.as_bytes().to_vec());
    }

    #[test]
    fn legacy_handshake_ends_with_the_digest() {
        let receiver = CollectingReceiver::new();
        let framer = framer(receiver);
        let digest = vec![7u8; 16];
        let handshake = WebsocketHandshake::legacy(digest.clone());
        let bytes = framer.produce_bytes(&OutboundMessage::Handshake(handshake)).unwrap();
        let text = String::from_utf8_lossy(&bytes[..bytes.len() - 16]).into_owned();
        assert!(text.starts_with("HTTP/1.1 101 WebSocket Protocol Handshake\r\n"));
        assert!(text.contains("Sec-WebSocket-Origin: http://game.example.com\r\n"));
        assert!(text.contains("Sec-WebSocket-Location: ws://game.example.com:9001/ws\r\n"));
        assert_eq!(&bytes[bytes.len() - 16..], &digest[..]);
    }

    #[test]
    fn handshake_for_request_rejects_unknown_generations() {
        let mut request = WebsocketRequest::new();
        request.http.parse_start_line("GET /ws HTTP/1.1");
        assert_eq!(
            WebsocketHandshake::for_request(&request),
            Err(CommError::UnsupportedHandshakeVersion)
        );
    }

    #[test]
    fn outbound_json_is_framed() {
        let receiver = CollectingReceiver::new();
        let framer = framer(receiver);
        let bytes = framer.produce_bytes(&OutboundMessage::Json(json!({"op": "go"}))).unwrap();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(*bytes.last().unwrap(), 0xFF);
        assert_eq!(&bytes[1..bytes.len() - 1], b"{\"op\":\"go\"}");
    }
}
