//! Line echo protocol.
//!
//! Every successful receive is one message. Two response formats exist:
//!
//! ```text
//! synchronous engines:  Echo[<count before>]:<text>
//! io_uring engine:      Echo: <text>(Msg #<count after>)\n
//! ```
//!
//! `<text>` is the received bytes with a single trailing `\n` removed.

use bytes::{BufMut, BytesMut};
use std::io::Write;

/// Per-connection receive buffer size used by every engine.
pub const BUFFER_SIZE: usize = 1024;

/// Strip one trailing newline.
pub fn strip_newline(input: &[u8]) -> &[u8] {
    input.strip_suffix(b"\n").unwrap_or(input)
}

/// Build the response of the synchronous engines.
///
/// `seq` is the total message count observed before this message.
pub fn echo_response(seq: u64, input: &[u8]) -> BytesMut {
    let text = strip_newline(input);
    let mut out = BytesMut::with_capacity(text.len() + 24);
    out.put_slice(b"Echo[");
    out.put_slice(seq.to_string().as_bytes());
    out.put_slice(b"]:");
    out.put_slice(text);
    out
}

/// Rewrite `buf[..len]` in place into the io_uring response.
///
/// `seq` is the total message count after this message was counted. The
/// response is truncated to `buf.len()`; the returned value is its length.
pub fn uring_response(seq: u64, buf: &mut [u8], len: usize) -> usize {
    let mut response = Vec::with_capacity(len + 24);
    response.extend_from_slice(b"Echo: ");
    response.extend_from_slice(strip_newline(&buf[..len]));
    // Writing to a Vec cannot fail.
    let _ = writeln!(response, "(Msg #{seq})");

    let n = response.len().min(buf.len());
    buf[..n].copy_from_slice(&response[..n]);
    n
}
