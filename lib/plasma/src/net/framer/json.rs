use crate::net::error::{CommError, CommResult};
use crate::net::framer::{ByteIoFramer, ByteIoFramerFactory, Message, MessageReceiver, OutboundMessage};
use crate::net::input::ChunkedInputBuffer;
use slog::{debug, info, warn, Logger};
use serde_json::Value;

/// The parse of one blank-line-terminated block: zero or more complete JSON
/// values, with a diagnostic if trailing bytes failed to parse.
pub struct JsonBlock {
    pub messages: Vec<Value>,
    pub syntax_error: Option<String>,
}

/// Assembles newline-delimited text into blank-line-terminated blocks and
/// parses each block as a sequence of back-to-back JSON values. Shared by the
/// plain JSON framer and the framers that embed JSON message streams.
pub struct JsonBlockReader {
    msg_buffer: String,
    max_msg_length: usize,
}

impl JsonBlockReader {
    pub fn new(max_msg_length: usize) -> JsonBlockReader {
        JsonBlockReader { msg_buffer: String::new(), max_msg_length }
    }

    /// Advances over buffered lines. `Ok(None)` means no complete block is
    /// buffered yet; accumulated lines are retained for the next call.
    pub fn next_block(&mut self, input: &mut ChunkedInputBuffer) -> CommResult<Option<JsonBlock>> {
        loop {
            let line = match input.read_utf8_line()? {
                None => return Ok(None),
                Some(line) => line,
            };
            if line.is_empty() {
                if self.msg_buffer.is_empty() {
                    continue;
                }
                let block = parse_block(&self.msg_buffer);
                self.msg_buffer.clear();
                return Ok(Some(block));
            }
            if self.max_msg_length < self.msg_buffer.len() + line.len() + 1 {
                return Err(CommError::MessageTooLarge { limit: self.max_msg_length });
            }
            self.msg_buffer.push(' ');
            self.msg_buffer.push_str(&line);
        }
    }
}

fn parse_block(text: &str) -> JsonBlock {
    let mut messages = Vec::new();
    let mut syntax_error = None;
    for item in serde_json::Deserializer::from_str(text).into_iter::<Value>() {
        match item {
            Ok(value) => messages.push(value),
            Err(error) => {
                syntax_error = Some(format!("syntax error in message: {}", error));
                break;
            }
        }
    }
    JsonBlock { messages, syntax_error }
}

/// Delivers a parsed block to a receiver, with traffic logging.
pub(crate) fn deliver_block(
    block: JsonBlock,
    receiver: &mut dyn MessageReceiver,
    send_debug_replies: bool,
    label: &str,
    logger: &Logger,
) {
    for message in block.messages {
        info!(logger, "{} -> {}", label, message);
        receiver.receive_msg(Message::Json(message));
    }
    if let Some(problem) = block.syntax_error {
        warn!(logger, "{} sent an unparseable message: {}", label, problem);
        if send_debug_replies {
            receiver.receive_msg(Message::SyntaxError(problem));
        }
    }
}

/// Folds a parsed block into an RTCP message delivery. A block that yields
/// neither values nor a reportable problem leaves the request incomplete and
/// parsing continues with the next block.
pub(crate) fn deliver_block_to_request(
    block: JsonBlock,
    request: &mut crate::net::framer::rtcp::RtcpRequest,
    send_debug_replies: bool,
    logger: &Logger,
) {
    for message in block.messages {
        request.add_message(message);
    }
    if let Some(problem) = block.syntax_error {
        warn!(logger, "unparseable payload in message delivery: {}", problem);
        if send_debug_replies {
            request.note_problem(problem);
        }
    }
}

/// Framer for the raw JSON message protocol: messages are blocks of
/// newline-separated text ending at a blank line, each block holding one or
/// more JSON values.
pub struct JsonFramer {
    input: ChunkedInputBuffer,
    block_reader: JsonBlockReader,
    receiver: Box<dyn MessageReceiver>,
    send_debug_replies: bool,
    label: String,
    logger: Logger,
}

impl JsonFramer {
    pub fn new(
        receiver: Box<dyn MessageReceiver>,
        label: &str,
        max_msg_length: usize,
        send_debug_replies: bool,
        logger: Logger,
    ) -> JsonFramer {
        JsonFramer {
            input: ChunkedInputBuffer::new(),
            block_reader: JsonBlockReader::new(max_msg_length),
            receiver,
            send_debug_replies,
            label: label.to_string(),
            logger,
        }
    }
}

impl ByteIoFramer for JsonFramer {
    fn receive_bytes(&mut self, data: &[u8]) -> CommResult<()> {
        self.input.add_chunk(data);
        loop {
            match self.block_reader.next_block(&mut self.input)? {
                None => {
                    self.input.preserve_buffers();
                    return Ok(());
                }
                Some(block) => {
                    deliver_block(block, &mut *self.receiver, self.send_debug_replies, &self.label, &self.logger);
                }
            }
        }
    }

    fn produce_bytes(&self, message: &OutboundMessage) -> CommResult<Vec<u8>> {
        let body = match message {
            OutboundMessage::Text(text) => text.clone(),
            OutboundMessage::Json(value) => value.to_string(),
            other => return Err(CommError::UnwritableMessage(other.kind())),
        };
        debug!(self.logger, "{} <- {}", self.label, body);
        let mut bytes = body.into_bytes();
        bytes.extend_from_slice(b"\n\n");
        Ok(bytes)
    }
}

/// Provides JSON framers for new connections.
pub struct JsonFramerFactory {
    max_msg_length: usize,
    send_debug_replies: bool,
    logger: Logger,
}

impl JsonFramerFactory {
    pub fn new(max_msg_length: usize, send_debug_replies: bool, logger: Logger) -> JsonFramerFactory {
        JsonFramerFactory { max_msg_length, send_debug_replies, logger }
    }
}

impl ByteIoFramerFactory for JsonFramerFactory {
    fn provide_framer(&self, receiver: Box<dyn MessageReceiver>, label: &str) -> Box<dyn ByteIoFramer> {
        Box::new(JsonFramer::new(
            receiver,
            label,
            self.max_msg_length,
            self.send_debug_replies,
            self.logger.clone(),
        ))
    }
}
