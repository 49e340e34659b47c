//! Block framing.
//!
//! Both directions of a MAPI connection are chunked into blocks: a 2-byte
//! little-endian header holding `(payload_len << 1) | is_last` followed by
//! up to [`BLOCK`] payload bytes. A flush ends the current message with a
//! last-block marker (an empty one if no payload is pending), which is how
//! the peer knows a request or reply is complete.

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::PROMPT_BEGIN;
use crate::stream::Stream;

/// Maximum payload bytes per block.
pub const BLOCK: usize = 8190;

pub struct BlockStream {
    stream: Stream,
    bigendian: bool,
    wbuf: Vec<u8>,
    rbuf: Vec<u8>,
    rpos: usize,
    /// A non-empty last block was consumed; the next fetch reports end of
    /// message before starting on the next one.
    at_eom: bool,
}

impl BlockStream {
    pub fn new(stream: Stream) -> Self {
        BlockStream {
            stream,
            bigendian: false,
            wbuf: Vec::with_capacity(BLOCK),
            rbuf: Vec::with_capacity(BLOCK),
            rpos: 0,
            at_eom: false,
        }
    }

    /// Record the peer's byte order, taken from the login challenge.
    /// Only relevant for binary result data, the textual protocol is
    /// unaffected.
    pub fn set_bigendian(&mut self, bigendian: bool) {
        self.bigendian = bigendian;
    }

    pub fn is_bigendian(&self) -> bool {
        self.bigendian
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.set_timeout(timeout)
    }

    fn read_header(&mut self) -> Result<(usize, bool)> {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header)?;
        let value = u16::from_le_bytes(header);
        let len = (value >> 1) as usize;
        if len > BLOCK {
            return Err(Error::Protocol(format!("block of {len} bytes is too large")));
        }
        Ok((len, value & 1 == 1))
    }

    /// Read one block worth of payload into the line buffer. Returns 0
    /// exactly once per message, after its last block has been drained.
    fn fetch(&mut self) -> Result<usize> {
        if self.at_eom {
            self.at_eom = false;
            return Ok(0);
        }
        let (len, last) = self.read_header()?;
        if len > 0 {
            let start = self.rbuf.len();
            self.rbuf.resize(start + len, 0);
            self.stream.read_exact(&mut self.rbuf[start..])?;
        }
        if last {
            if len == 0 {
                return Ok(0);
            }
            self.at_eom = true;
        }
        Ok(len)
    }

    fn compact(&mut self) {
        if self.rpos > 0 {
            self.rbuf.drain(..self.rpos);
            self.rpos = 0;
        }
    }

    /// Read the next newline-terminated line, without the newline.
    ///
    /// At the end of a message a prompt line (a single [`PROMPT_BEGIN`]
    /// byte) is synthesized, preceded by a fake newline if the server left
    /// a line unterminated.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(nl) = self.rbuf[self.rpos..].iter().position(|&b| b == b'\n') {
                let line = self.rbuf[self.rpos..self.rpos + nl].to_vec();
                self.rpos += nl + 1;
                if self.rpos == self.rbuf.len() {
                    self.compact();
                }
                return Ok(line);
            }
            self.compact();
            let n = self.fetch()?;
            if n == 0 {
                if !self.rbuf.is_empty() {
                    // newline was missing from the server
                    self.rbuf.push(b'\n');
                }
                self.rbuf.push(PROMPT_BEGIN);
                self.rbuf.push(b'\n');
            }
        }
    }

    /// Read one whole message (all blocks up to the last-block marker).
    /// Used for the login challenge, which arrives before line-oriented
    /// traffic starts.
    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        debug_assert!(self.rpos == self.rbuf.len());
        let mut out = Vec::new();
        loop {
            let (len, last) = self.read_header()?;
            if len > 0 {
                let start = out.len();
                out.resize(start + len, 0);
                self.stream.read_exact(&mut out[start..])?;
            }
            if last {
                return Ok(out);
            }
        }
    }

    /// Buffer outgoing bytes, emitting full blocks as they fill up.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.wbuf.extend_from_slice(data);
        while self.wbuf.len() >= BLOCK {
            self.emit_block(BLOCK, false)?;
        }
        Ok(())
    }

    /// End the current message: emit whatever is buffered as the last
    /// block and push it down the socket.
    pub fn flush(&mut self) -> Result<()> {
        let len = self.wbuf.len();
        debug_assert!(len < BLOCK);
        self.emit_block(len, true)?;
        self.stream.flush()?;
        Ok(())
    }

    fn emit_block(&mut self, len: usize, last: bool) -> Result<()> {
        let header = ((len as u16) << 1) | u8::from(last) as u16;
        self.stream.write_all(&header.to_le_bytes())?;
        self.stream.write_all(&self.wbuf[..len])?;
        self.wbuf.drain(..len);
        Ok(())
    }

    #[cfg(test)]
    pub fn mock(&mut self) -> &mut crate::stream::mock::MockStream {
        match &mut self.stream {
            Stream::Mock(m) => m,
            _ => unreachable!("not a mock stream"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testsupport {
    use super::*;
    use crate::stream::mock::MockStream;

    /// Frame `payload` the way a server would: full blocks followed by a
    /// last block.
    pub fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut rest = payload;
        loop {
            let n = rest.len().min(BLOCK);
            let last = rest.len() <= BLOCK;
            let header = ((n as u16) << 1) | u16::from(last);
            out.extend_from_slice(&header.to_le_bytes());
            out.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if last {
                return out;
            }
        }
    }

    pub fn block_stream_with_input(input: Vec<u8>) -> BlockStream {
        BlockStream::new(Stream::Mock(MockStream::with_input(input)))
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn write_framing() {
        let mut bs = block_stream_with_input(Vec::new());
        bs.write(b"hello").unwrap();
        bs.flush().unwrap();
        let written = &bs.mock().output;
        // 5 << 1 | 1 = 11
        assert_eq!(written.as_slice(), b"\x0b\x00hello");
    }

    #[test]
    fn write_splits_large_messages() {
        let mut bs = block_stream_with_input(Vec::new());
        let data = vec![b'x'; BLOCK + 10];
        bs.write(&data).unwrap();
        bs.flush().unwrap();
        let written = bs.mock().output.clone();
        // full block, not last
        let h0 = u16::from_le_bytes([written[0], written[1]]);
        assert_eq!((h0 >> 1) as usize, BLOCK);
        assert_eq!(h0 & 1, 0);
        // trailing block of 10, last
        let off = 2 + BLOCK;
        let h1 = u16::from_le_bytes([written[off], written[off + 1]]);
        assert_eq!(h1 >> 1, 10);
        assert_eq!(h1 & 1, 1);
        assert_eq!(written.len(), 2 + BLOCK + 2 + 10);
    }

    #[test]
    fn flush_with_empty_buffer_emits_terminator() {
        let mut bs = block_stream_with_input(Vec::new());
        bs.flush().unwrap();
        assert_eq!(bs.mock().output.as_slice(), b"\x01\x00");
    }

    #[test]
    fn read_lines_and_prompt_synthesis() {
        let mut input = frame(b"#hello\n[ 1 ]\n");
        input.extend_from_slice(&frame(b"[ 2 ]\n"));
        let mut bs = block_stream_with_input(input);

        assert_eq!(bs.read_line().unwrap(), b"#hello");
        assert_eq!(bs.read_line().unwrap(), b"[ 1 ]");
        // message ends: prompt is synthesized
        assert_eq!(bs.read_line().unwrap(), [PROMPT_BEGIN]);
        // next message continues normally
        assert_eq!(bs.read_line().unwrap(), b"[ 2 ]");
        assert_eq!(bs.read_line().unwrap(), [PROMPT_BEGIN]);
    }

    #[test]
    fn unterminated_line_gets_fake_newline() {
        let mut bs = block_stream_with_input(frame(b"partial"));
        assert_eq!(bs.read_line().unwrap(), b"partial");
        assert_eq!(bs.read_line().unwrap(), [PROMPT_BEGIN]);
    }

    #[test]
    fn line_split_across_blocks() {
        // one logical line spanning two blocks of one message
        let mut input = Vec::new();
        let part1 = vec![b'a'; BLOCK];
        let header = ((BLOCK as u16) << 1) | 0;
        input.extend_from_slice(&header.to_le_bytes());
        input.extend_from_slice(&part1);
        input.extend_from_slice(&frame(b"bbb\n"));
        let mut bs = block_stream_with_input(input);
        let line = bs.read_line().unwrap();
        assert_eq!(line.len(), BLOCK + 3);
        assert!(line.ends_with(b"bbb"));
    }

    #[test]
    fn read_message_collects_all_blocks() {
        let mut input = Vec::new();
        let header = ((3u16) << 1) | 0;
        input.extend_from_slice(&header.to_le_bytes());
        input.extend_from_slice(b"abc");
        input.extend_from_slice(&frame(b"def"));
        let mut bs = block_stream_with_input(input);
        assert_eq!(bs.read_message().unwrap(), b"abcdef");
    }

    #[test]
    fn empty_message_is_plain_prompt() {
        let mut bs = block_stream_with_input(frame(b""));
        assert_eq!(bs.read_line().unwrap(), [PROMPT_BEGIN]);
    }

    #[test]
    fn oversized_block_header_is_rejected() {
        let bad = (((BLOCK + 1) as u16) << 1).to_le_bytes();
        let mut bs = block_stream_with_input(bad.to_vec());
        assert!(bs.read_line().is_err());
    }
}
