use crate::net::error::{CommError, CommResult};
use crate::net::framer::{ByteIoFramer, ByteIoFramerFactory, Message, MessageReceiver, OutboundMessage};
use crate::net::input::ChunkedInputBuffer;
use hashbrown::HashMap;
use slog::{debug, Logger};
use std::fmt;

/// An HTTP request accumulated from the wire: start line, headers, then a
/// `Content-Length`-counted body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    method: Option<String>,
    uri: Option<String>,
    headers: HashMap<String, String>,
    content_length: usize,
    non_persistent: bool,
    url_encoded: bool,
    content: Option<String>,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest {
            method: None,
            uri: None,
            headers: HashMap::new(),
            content_length: 0,
            non_persistent: false,
            url_encoded: false,
            content: None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Header value by lower-cased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// True when the request asked for the connection to close after the reply.
    pub fn is_non_persistent(&self) -> bool {
        self.non_persistent
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Parses the request start line, e.g. `GET /test/select HTTP/1.1`.
    /// Malformed lines leave the method unset for the application to reject.
    pub fn parse_start_line(&mut self, line: &str) {
        let line = line.trim();
        let mut frags = line.split_whitespace();
        if let (Some(method), Some(uri)) = (frags.next(), frags.next()) {
            self.method = Some(method.to_uppercase());
            self.uri = Some(uri.to_lowercase());
        }
    }

    /// Parses one header line, tracking the handful of headers framing cares
    /// about and keeping the rest for the application.
    pub fn parse_header_line(&mut self, line: &str) {
        if let Some(colon) = line.find(':') {
            let name = line[..colon].trim().to_lowercase();
            let value = line[colon + 1..].trim().to_string();
            match name.as_str() {
                "content-length" => {
                    self.content_length = value.parse().unwrap_or(0);
                }
                "connection" => {
                    if value.eq_ignore_ascii_case("close") {
                        self.non_persistent = true;
                    }
                }
                "content-type" => {
                    if value.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
                        self.url_encoded = true;
                    }
                }
                _ => {}
            }
            self.headers.insert(name, value);
        }
    }

    /// Records the request body, reversing URL encoding when the headers
    /// declared it.
    pub(crate) fn set_content(&mut self, raw: String) {
        self.content = Some(if self.url_encoded { url_decode(&raw) } else { raw });
    }
}

fn url_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&text[i + 1..i + 3], 16) {
                    Ok(byte) => {
                        decoded.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} ({} header(s), {} content byte(s))",
            self.method.as_deref().unwrap_or("?"),
            self.uri.as_deref().unwrap_or("?"),
            self.headers.len(),
            self.content.as_ref().map_or(0, String::len)
        )
    }
}

/// An error reply: status code, reason phrase and a short message body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    pub code: u16,
    pub reason: String,
    pub body: String,
}

impl HttpError {
    pub fn new(code: u16, reason: &str, body: &str) -> HttpError {
        HttpError { code, reason: reason.to_string(), body: body.to_string() }
    }
}

/// Reply to a CORS preflight `OPTIONS` request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpOptionsReply {
    allow_headers: Option<String>,
}

impl HttpOptionsReply {
    /// Captures the headers the preflight asked permission for.
    pub fn from_request(request: &HttpRequest) -> HttpOptionsReply {
        HttpOptionsReply {
            allow_headers: request.header("access-control-request-headers").map(str::to_string),
        }
    }
}

pub(crate) fn render_error(error: &HttpError) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
        error.code,
        error.reason,
        error.body.len(),
        error.body
    )
    .into_bytes()
}

fn render_options_reply(reply: &HttpOptionsReply) -> Vec<u8> {
    let mut response = String::from(
        "HTTP/1.1 200 OK\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Max-Age: 31536000\r\n\
         Access-Control-Allow-Methods: GET, POST\r\n",
    );
    if let Some(headers) = &reply.allow_headers {
        response.push_str("Access-Control-Allow-Headers: ");
        response.push_str(headers);
        response.push_str("\r\n");
    }
    response.push_str("Content-Length: 0\r\n\r\n");
    response.into_bytes()
}

fn render_text_reply(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Cache-Control: no-cache\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HttpStage {
    StartLine,
    Headers,
    Body,
}

/// Framer for HTTP connections carrying select/poll style traffic: parses
/// whole requests and renders text, error and preflight replies.
pub struct HttpFramer {
    input: ChunkedInputBuffer,
    stage: HttpStage,
    request: HttpRequest,
    receiver: Box<dyn MessageReceiver>,
    max_msg_length: usize,
    label: String,
    logger: Logger,
}

impl HttpFramer {
    pub fn new(
        receiver: Box<dyn MessageReceiver>,
        label: &str,
        max_msg_length: usize,
        logger: Logger,
    ) -> HttpFramer {
        HttpFramer {
            input: ChunkedInputBuffer::new(),
            stage: HttpStage::StartLine,
            request: HttpRequest::new(),
            receiver,
            max_msg_length,
            label: label.to_string(),
            logger,
        }
    }

    fn deliver(&mut self) {
        let request = std::mem::replace(&mut self.request, HttpRequest::new());
        debug!(self.logger, "{} -> {}", self.label, request);
        self.receiver.receive_msg(Message::Http(request));
        self.stage = HttpStage::StartLine;
    }
}

impl ByteIoFramer for HttpFramer {
    fn receive_bytes(&mut self, data: &[u8]) -> CommResult<()> {
        self.input.add_chunk(data);
        loop {
            match self.stage {
                HttpStage::StartLine => {
                    match self.input.read_ascii_line()? {
                        None => {
                            self.input.preserve_buffers();
                            return Ok(());
                        }
                        Some(line) => {
                            // Tolerate blank lines between pipelined requests.
                            if !line.is_empty() {
                                self.request.parse_start_line(&line);
                                self.stage = HttpStage::Headers;
                            }
                        }
                    }
                }
                HttpStage::Headers => {
                    match self.input.read_ascii_line()? {
                        None => {
                            self.input.preserve_buffers();
                            return Ok(());
                        }
                        Some(line) => {
                            if line.is_empty() {
                                self.stage = HttpStage::Body;
                            } else {
                                self.request.parse_header_line(&line);
                            }
                        }
                    }
                }
                HttpStage::Body => {
                    let length = self.request.content_length();
                    if length > self.max_msg_length {
                        return Err(CommError::MessageTooLarge { limit: self.max_msg_length });
                    }
                    if length > 0 {
                        match self.input.read_bytes(length) {
                            None => {
                                self.input.preserve_buffers();
                                return Ok(());
                            }
                            Some(body) => {
                                let body = String::from_utf8(body).map_err(|_| CommError::BadUtf8Encoding)?;
                                self.request.set_content(body);
                            }
                        }
                    }
                    self.deliver();
                }
            }
        }
    }

    fn produce_bytes(&self, message: &OutboundMessage) -> CommResult<Vec<u8>> {
        match message {
            OutboundMessage::Text(text) => Ok(render_text_reply(text)),
            OutboundMessage::Error(error) => Ok(render_error(error)),
            OutboundMessage::OptionsReply(reply) => Ok(render_options_reply(reply)),
            other => Err(CommError::UnwritableMessage(other.kind())),
        }
    }
}

/// Provides HTTP framers for new connections.
pub struct HttpFramerFactory {
    max_msg_length: usize,
    logger: Logger,
}

impl HttpFramerFactory {
    pub fn new(max_msg_length: usize, logger: Logger) -> HttpFramerFactory {
        HttpFramerFactory { max_msg_length, logger }
    }
}

impl ByteIoFramerFactory for HttpFramerFactory {
    fn provide_framer(&self, receiver: Box<dyn MessageReceiver>, label: &str) -> Box<dyn ByteIoFramer> {
        Box::new(HttpFramer::new(receiver, label, self.max_msg_length, self.logger.clone()))
    }
}
