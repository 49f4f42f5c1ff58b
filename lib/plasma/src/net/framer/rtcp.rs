use crate::net::error::{CommError, CommResult};
use crate::net::framer::json::{deliver_block_to_request, JsonBlockReader};
use crate::net::framer::{ByteIoFramer, ByteIoFramerFactory, Message, MessageReceiver, OutboundMessage};
use crate::net::input::ChunkedInputBuffer;
use serde_json::Value;
use slog::{debug, info, Logger};

/// The verb of an RTCP request line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RtcpVerb {
    /// `start`: open a fresh session.
    Start,
    /// `resume <session> <seq>`: reattach to an existing session.
    Resume,
    /// `ack <seq>`: acknowledge receipt, no payload.
    Ack,
    /// `<sendSeq> <recvSeq>`: a message delivery, payload follows.
    Message,
    /// `end <seq>`: orderly session teardown.
    End,
    /// `error <tag>`: client-reported failure.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParseState {
    AwaitingVerb,
    AwaitingMessage,
    Complete,
}

/// An RTCP request accumulated from the wire. Only `Message` requests carry
/// JSON payloads; everything else completes at the request line.
#[derive(Debug, Clone, PartialEq)]
pub struct RtcpRequest {
    verb: RtcpVerb,
    client_send_seq_num: u64,
    client_recv_seq_num: u64,
    session_id: Option<String>,
    error: Option<String>,
    messages: Vec<Value>,
    state: ParseState,
}

impl RtcpRequest {
    pub fn new() -> RtcpRequest {
        RtcpRequest {
            verb: RtcpVerb::Error,
            client_send_seq_num: 0,
            client_recv_seq_num: 0,
            session_id: None,
            error: None,
            messages: Vec::new(),
            state: ParseState::AwaitingVerb,
        }
    }

    pub fn verb(&self) -> RtcpVerb {
        self.verb
    }

    /// Highest server-to-client sequence number the client has seen.
    pub fn client_recv_seq_num(&self) -> u64 {
        self.client_recv_seq_num
    }

    /// Sequence number the client assigned to this delivery.
    pub fn client_send_seq_num(&self) -> u64 {
        self.client_send_seq_num
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Failure tag for `Error` requests, parse problems included.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn messages(&self) -> &[Value] {
        &self.messages
    }

    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Parses a request line. Anything malformed turns the request into an
    /// `Error` for the application to deal with; framing never guesses.
    pub fn parse_request_line(&mut self, line: &str) {
        let frags: Vec<&str> = line.split_whitespace().collect();
        self.state = ParseState::Complete;
        let verb = frags.first().copied().unwrap_or("");
        match verb {
            "start" => {
                if frags.len() == 1 {
                    self.verb = RtcpVerb::Start;
                } else {
                    self.fail("invalid start request");
                }
            }
            "resume" => {
                if frags.len() == 3 {
                    match frags[2].parse() {
                        Ok(seq_num) => {
                            self.verb = RtcpVerb::Resume;
                            self.session_id = Some(frags[1].to_string());
                            self.client_recv_seq_num = seq_num;
                        }
                        Err(_) => self.fail("invalid resume request"),
                    }
                } else {
                    self.fail("invalid resume request");
                }
            }
            "ack" => match self.parse_seq_arg(&frags) {
                Some(seq_num) => {
                    self.verb = RtcpVerb::Ack;
                    self.client_recv_seq_num = seq_num;
                }
                None => self.fail("invalid ack request"),
            },
            "end" => match self.parse_seq_arg(&frags) {
                Some(seq_num) => {
                    self.verb = RtcpVerb::End;
                    self.client_recv_seq_num = seq_num;
                }
                None => self.fail("invalid end request"),
            },
            "error" => {
                if frags.len() == 2 {
                    self.verb = RtcpVerb::Error;
                    self.error = Some(format!("client reported error: {}", frags[1]));
                } else {
                    self.fail("invalid error request");
                }
            }
            other => match other.parse() {
                Ok(send_seq_num) => match self.parse_seq_arg(&frags) {
                    Some(recv_seq_num) => {
                        self.verb = RtcpVerb::Message;
                        self.client_send_seq_num = send_seq_num;
                        self.client_recv_seq_num = recv_seq_num;
                        self.state = ParseState::AwaitingMessage;
                    }
                    None => self.fail("invalid message delivery request"),
                },
                Err(_) => self.fail("invalid RTCP verb"),
            },
        }
    }

    fn parse_seq_arg(&self, frags: &[&str]) -> Option<u64> {
        if frags.len() == 2 {
            frags[1].parse().ok()
        } else {
            None
        }
    }

    fn fail(&mut self, problem: &str) {
        self.verb = RtcpVerb::Error;
        self.error = Some(problem.to_string());
        self.state = ParseState::Complete;
    }

    pub(crate) fn add_message(&mut self, message: Value) {
        self.messages.push(message);
        self.state = ParseState::Complete;
    }

    pub(crate) fn note_problem(&mut self, problem: String) {
        self.fail(&problem);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RtcpStage {
    Request,
    Messages,
}

/// Framer for the reliable transport connection protocol: an ASCII request
/// line optionally followed by a JSON message block.
pub struct RtcpFramer {
    input: ChunkedInputBuffer,
    block_reader: JsonBlockReader,
    stage: RtcpStage,
    request: RtcpRequest,
    receiver: Box<dyn MessageReceiver>,
    send_debug_replies: bool,
    label: String,
    logger: Logger,
}

impl RtcpFramer {
    pub fn new(
        receiver: Box<dyn MessageReceiver>,
        label: &str,
        max_msg_length: usize,
        send_debug_replies: bool,
        logger: Logger,
    ) -> RtcpFramer {
        RtcpFramer {
            input: ChunkedInputBuffer::new(),
            block_reader: JsonBlockReader::new(max_msg_length),
            stage: RtcpStage::Request,
            request: RtcpRequest::new(),
            receiver,
            send_debug_replies,
            label: label.to_string(),
            logger,
        }
    }

    fn deliver(&mut self) {
        let request = std::mem::replace(&mut self.request, RtcpRequest::new());
        info!(self.logger, "{} -> {:?}", self.label, request.verb());
        self.receiver.receive_msg(Message::Rtcp(request));
        self.stage = RtcpStage::Request;
    }
}

impl ByteIoFramer for RtcpFramer {
    fn receive_bytes(&mut self, data: &[u8]) -> CommResult<()> {
        self.input.add_chunk(data);
        loop {
            match self.stage {
                RtcpStage::Request => match self.input.read_ascii_line()? {
                    None => {
                        self.input.preserve_buffers();
                        return Ok(());
                    }
                    Some(line) => {
                        if !line.is_empty() {
                            debug!(self.logger, "{} |> {}", self.label, line);
                            self.request.parse_request_line(&line);
                            if !self.request.is_complete() {
                                self.stage = RtcpStage::Messages;
                            }
                        }
                    }
                },
                RtcpStage::Messages => match self.block_reader.next_block(&mut self.input)? {
                    None => {
                        self.input.preserve_buffers();
                        return Ok(());
                    }
                    Some(block) => {
                        deliver_block_to_request(block, &mut self.request, self.send_debug_replies, &self.logger);
                    }
                },
            }
            if self.request.is_complete() {
                self.deliver();
            }
        }
    }

    fn produce_bytes(&self, message: &OutboundMessage) -> CommResult<Vec<u8>> {
        // Replies are preformatted by the session layer, sequence numbers and
        // all, so the framer passes the text through untouched.
        match message {
            OutboundMessage::Text(text) => {
                debug!(self.logger, "{} <| {}", self.label, text.trim_end());
                Ok(text.clone().into_bytes())
            }
            other => Err(CommError::UnwritableMessage(other.kind())),
        }
    }
}

/// Provides RTCP framers for new connections.
pub struct RtcpFramerFactory {
    max_msg_length: usize,
    send_debug_replies: bool,
    logger: Logger,
}

impl RtcpFramerFactory {
    pub fn new(max_msg_length: usize, send_debug_replies: bool, logger: Logger) -> RtcpFramerFactory {
        RtcpFramerFactory { max_msg_length, send_debug_replies, logger }
    }
}

impl ByteIoFramerFactory for RtcpFramerFactory {
    fn provide_framer(&self, receiver: Box<dyn MessageReceiver>, label: &str) -> Box<dyn ByteIoFramer> {
        Box::new(RtcpFramer::new(
            receiver,
            label,
            self.max_msg_length,
            self.send_debug_replies,
            self.logger.clone(),
        ))
    }
}
