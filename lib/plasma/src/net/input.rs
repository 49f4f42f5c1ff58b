use crate::net::error::{CommError, CommResult};
use std::collections::VecDeque;

const LINE_FEED: u32 = 0x0A;
const CARRIAGE_RETURN: u32 = 0x0D;
const FRAME_START: u8 = 0x00;
const FRAME_END: u8 = 0xFF;

/// Input accumulator that presents a sequence of network read buffers as one
/// logical byte stream, without ever copying them together.
///
/// Reads are gated by a "useful" byte count covering everything up through the
/// last line terminator seen so far. A line read therefore either yields a
/// complete line or yields nothing at all; it never consumes a line fragment
/// that a later buffer will finish. Bytes past the last terminator stay put
/// until a subsequent `add_chunk` reveals their terminator, except for the
/// explicitly counted reads used for fixed-length payloads.
pub struct ChunkedInputBuffer {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the front chunk.
    pos: usize,
    /// Unread bytes across all chunks.
    total_count: usize,
    /// Unread bytes up through the last line terminator seen.
    useful_count: usize,
    at_eof: bool,
    frame_mode: bool,
}

impl ChunkedInputBuffer {
    pub fn new() -> ChunkedInputBuffer {
        ChunkedInputBuffer {
            chunks: VecDeque::new(),
            pos: 0,
            total_count: 0,
            useful_count: 0,
            at_eof: false,
            frame_mode: false,
        }
    }

    /// Appends a freshly received buffer. An empty buffer marks end of input;
    /// previously buffered bytes remain readable after the mark.
    pub fn add_chunk(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.at_eof = true;
            return;
        }
        if let Some(idx) = data.iter().rposition(|&b| self.is_terminator(b)) {
            self.useful_count = self.total_count + idx + 1;
        }
        self.total_count += data.len();
        self.chunks.push_back(data.to_vec());
    }

    /// Unread bytes currently buffered, terminated or not.
    #[inline]
    pub fn available(&self) -> usize {
        self.total_count
    }

    /// Marks at least `count` buffered bytes as readable regardless of line
    /// termination. Needed for fixed-length payloads that follow a header.
    pub fn update_useful_byte_count(&mut self, count: usize) {
        if self.useful_count < count {
            self.useful_count = count;
        }
    }

    /// Declares a suspension point: parsing stops here until more bytes arrive.
    /// Pending chunks are already retained across calls, so this is a marker
    /// for readers of the calling code rather than an operation.
    #[inline]
    pub fn preserve_buffers(&self) {}

    /// Switches line recognition to framed mode, where 0xFF delimits messages
    /// the way a newline does. Already buffered bytes are rescanned so frames
    /// that arrived together with the handshake become readable.
    pub fn enable_frame_mode(&mut self) {
        self.frame_mode = true;
        let mut offset = 0;
        let mut last_terminator = None;
        for (chunk_index, chunk) in self.chunks.iter().enumerate() {
            let start = if chunk_index == 0 { self.pos } else { 0 };
            if let Some(idx) = chunk[start..].iter().rposition(|&b| self.is_terminator(b)) {
                last_terminator = Some(offset + idx + 1);
            }
            offset += chunk.len() - start;
        }
        if let Some(count) = last_terminator {
            self.update_useful_byte_count(count);
        }
    }

    #[inline]
    fn is_terminator(&self, byte: u8) -> bool {
        byte == LINE_FEED as u8 || (self.frame_mode && byte == FRAME_END)
    }

    /// Next readable byte, `Ok(None)` when nothing terminated is buffered.
    pub fn read(&mut self) -> CommResult<Option<u8>> {
        if self.useful_count == 0 {
            if self.at_eof {
                if self.total_count > 0 {
                    Err(CommError::UnterminatedInput)
                } else {
                    Err(CommError::EndOfInput)
                }
            } else {
                Ok(None)
            }
        } else {
            Ok(Some(self.read_byte()))
        }
    }

    fn read_byte(&mut self) -> u8 {
        let (byte, exhausted) = {
            let front = self.chunks.front().expect("read past the end of buffered input");
            (front[self.pos], self.pos + 1 == front.len())
        };
        self.pos += 1;
        if exhausted {
            self.chunks.pop_front();
            self.pos = 0;
        }
        self.total_count -= 1;
        if self.useful_count > 0 {
            self.useful_count -= 1;
        }
        byte
    }

    /// Reads exactly `count` bytes if that many are buffered, `None` otherwise.
    /// Counted reads ignore line termination; the caller knows the length.
    pub fn read_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.total_count < count {
            return None;
        }
        self.update_useful_byte_count(count);
        let mut result = Vec::with_capacity(count);
        for _ in 0..count {
            result.push(self.read_byte());
        }
        Some(result)
    }

    fn read_char(&mut self, utf8: bool) -> CommResult<Option<u32>> {
        if utf8 {
            self.read_utf8_char()
        } else {
            Ok(self.read()?.map(u32::from))
        }
    }

    /// Decodes one UTF-8 character, spanning chunk boundaries as needed. In
    /// frame mode a frame start byte decodes as NUL (dropped by line assembly)
    /// and a frame end byte decodes as a newline.
    fn read_utf8_char(&mut self) -> CommResult<Option<u32>> {
        let byte_a = match self.read()? {
            None => return Ok(None),
            Some(b) => b,
        };
        if self.frame_mode && byte_a == FRAME_START {
            return Ok(Some(0));
        }
        if self.frame_mode && byte_a == FRAME_END {
            return Ok(Some(LINE_FEED));
        }
        if byte_a & 0x80 == 0 {
            return Ok(Some(u32::from(byte_a)));
        }
        let (mut code, extra) = if byte_a & 0xE0 == 0xC0 {
            (u32::from(byte_a & 0x1F), 1)
        } else if byte_a & 0xF0 == 0xE0 {
            (u32::from(byte_a & 0x0F), 2)
        } else if byte_a & 0xF8 == 0xF0 {
            (u32::from(byte_a & 0x07), 3)
        } else {
            return Err(CommError::BadUtf8Encoding);
        };
        for _ in 0..extra {
            let byte = match self.read()? {
                None => return Err(CommError::BadUtf8Encoding),
                Some(b) => b,
            };
            if byte & 0xC0 != 0x80 {
                return Err(CommError::BadUtf8Encoding);
            }
            code = code << 6 | u32::from(byte & 0x3F);
        }
        Ok(Some(code))
    }

    /// Reads one newline-terminated line of single-byte characters, without
    /// the terminator. Carriage returns and NULs are dropped. `Ok(None)` means
    /// no complete line is buffered yet.
    pub fn read_ascii_line(&mut self) -> CommResult<Option<String>> {
        self.read_line(false)
    }

    /// Reads one newline-terminated line of UTF-8 text, without the
    /// terminator. Carriage returns and NULs are dropped.
    pub fn read_utf8_line(&mut self) -> CommResult<Option<String>> {
        self.read_line(true)
    }

    fn read_line(&mut self, utf8: bool) -> CommResult<Option<String>> {
        let mut code = match self.read_char(utf8)? {
            None => return Ok(None),
            Some(c) => c,
        };
        if code == LINE_FEED {
            return Ok(Some(String::new()));
        }
        let mut line = String::new();
        loop {
            if code != CARRIAGE_RETURN && code != 0 {
                match std::char::from_u32(code) {
                    Some(c) => line.push(c),
                    None => return Err(CommError::BadUtf8Encoding),
                }
            }
            code = match self.read_char(utf8)? {
                // Terminator accounting guarantees a newline ahead of any
                // byte this loop can reach.
                None => return Err(CommError::UnterminatedInput),
                Some(c) => c,
            };
            if code == LINE_FEED {
                return Ok(Some(line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_available_only_once_terminated() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(b"hel");
        assert_eq!(input.read_ascii_line().unwrap(), None);
        input.add_chunk(b"lo\nwor");
        assert_eq!(input.read_ascii_line().unwrap(), Some("hello".to_string()));
        assert_eq!(input.read_ascii_line().unwrap(), None);
        input.add_chunk(b"ld\n");
        assert_eq!(input.read_ascii_line().unwrap(), Some("world".to_string()));
    }

    #[test]
    fn carriage_returns_and_nuls_dropped() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(b"ab\r\0cd\r\n");
        assert_eq!(input.read_ascii_line().unwrap(), Some("abcd".to_string()));
    }

    #[test]
    fn empty_line() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(b"\r\n");
        assert_eq!(input.read_ascii_line().unwrap(), Some("".to_string()));
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let text = "caf\u{e9}\n".as_bytes();
        let (head, tail) = text.split_at(4);
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(head);
        assert_eq!(input.read_utf8_line().unwrap(), None);
        input.add_chunk(tail);
        assert_eq!(input.read_utf8_line().unwrap(), Some("caf\u{e9}".to_string()));
    }

    #[test]
    fn four_byte_character_decodes() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk("\u{1F600}\n".as_bytes());
        assert_eq!(input.read_utf8_line().unwrap(), Some("\u{1F600}".to_string()));
    }

    #[test]
    fn byte_at_a_time_feeding_yields_same_line() {
        let mut input = ChunkedInputBuffer::new();
        for &byte in b"one line\n" {
            assert_eq!(input.read_ascii_line().unwrap(), None);
            input.add_chunk(&[byte]);
        }
        assert_eq!(input.read_ascii_line().unwrap(), Some("one line".to_string()));
    }

    #[test]
    fn counted_read_ignores_termination() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(b"abc");
        assert_eq!(input.read_bytes(5), None);
        input.add_chunk(b"de");
        assert_eq!(input.read_bytes(5).unwrap(), b"abcde".to_vec());
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn eof_with_clean_buffer() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(b"last\n");
        input.add_chunk(b"");
        assert_eq!(input.read_ascii_line().unwrap(), Some("last".to_string()));
        assert_eq!(input.read_ascii_line(), Err(CommError::EndOfInput));
    }

    #[test]
    fn eof_with_partial_line_is_an_error() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(b"no newline");
        input.add_chunk(b"");
        assert_eq!(input.read_ascii_line(), Err(CommError::UnterminatedInput));
    }

    #[test]
    fn frame_mode_delimits_on_frame_end() {
        let mut input = ChunkedInputBuffer::new();
        input.enable_frame_mode();
        input.add_chunk(&[0x00, b'h', b'i']);
        assert_eq!(input.read_utf8_line().unwrap(), None);
        input.add_chunk(&[0xFF]);
        assert_eq!(input.read_utf8_line().unwrap(), Some("hi".to_string()));
    }

    #[test]
    fn frame_mode_rescans_buffered_bytes() {
        let mut input = ChunkedInputBuffer::new();
        input.add_chunk(&[0x00, b'h', b'i', 0xFF]);
        assert_eq!(input.read_utf8_line().unwrap(), None);
        input.enable_frame_mode();
        assert_eq!(input.read_utf8_line().unwrap(), Some("hi".to_string()));
    }
}
