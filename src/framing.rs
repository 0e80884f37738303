//! DNS message framing for stream transports (RFC 1035 §4.2.2).
//!
//! Every message on the wire is preceded by a 2-byte big-endian length.
//! Inbound bytes accumulate in the socket's reassembly buffer; complete
//! messages are handed to the receive callback as a region borrowed from
//! that buffer and the buffer is shifted down past the consumed bytes.

use crate::socket;
use crate::worker::WorkerCore;
use crate::STREAM_CLIENTS_PER_CONN;

/// Returns the payload length of the first buffered message, or `None`
/// while fewer than `2 + len` bytes are present.
pub(crate) fn message_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    Some(len)
}

/// Prepends the length header to an outbound message.
pub(crate) fn frame_header(len: usize) -> [u8; 2] {
    debug_assert!(len <= crate::MAX_MESSAGE_SIZE);
    (len as u16).to_be_bytes()
}

/// Delivers buffered messages on a DNS stream socket until the buffer runs
/// dry or backpressure stops the loop.
///
/// After each message the loop continues only if the socket is not in
/// sequential mode, is not a client, and the number of in-flight handles is
/// below the per-connection ceiling; otherwise reading stops and is resumed
/// when the in-flight handle is released.
pub(crate) fn deliver(core: &mut WorkerCore, key: usize) {
    loop {
        let (len, client) = {
            let Some(s) = core.sockets.get_mut(key) else { return };
            if s.closing || !s.reading || s.read_paused || s.backpressured {
                return;
            }
            let Some(len) = message_len(&s.buf) else { return };
            (len, s.client)
        };

        let Some(handle) = socket::stream_handle(core, key) else { return };
        let cb = core.sockets.get(key).and_then(|s| s.recv_cb.clone());
        if let Some(cb) = cb {
            let s = &core.sockets[key];
            cb(&handle, Ok(&s.buf[2..2 + len]));
        }

        let Some(s) = core.sockets.get_mut(key) else { return };
        s.buf.drain(..2 + len);
        s.got_message = true;

        if client {
            // One message per read call on client sockets.
            s.reading = false;
            s.recv_cb = None;
            socket::stop_timer(core, key);
            return;
        }

        socket::restart_read_timer(core, key);
        let Some(s) = core.sockets.get_mut(key) else { return };
        if s.sequential || s.ah.len() >= STREAM_CLIENTS_PER_CONN {
            s.backpressured = true;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_buffers_are_nomore() {
        assert_eq!(message_len(&[]), None);
        assert_eq!(message_len(&[0x00]), None);
        assert_eq!(message_len(&[0x00, 0x05]), None);
        assert_eq!(message_len(&[0x00, 0x05, b'h', b'e', b'l', b'l']), None);
    }

    #[test]
    fn complete_message_reports_payload_len() {
        let buf = [0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(message_len(&buf), Some(5));

        // Trailing bytes of the next message do not matter.
        let buf = [0x00, 0x01, 0xaa, 0x00, 0x02];
        assert_eq!(message_len(&buf), Some(1));
    }

    #[test]
    fn zero_length_message_is_complete() {
        assert_eq!(message_len(&[0x00, 0x00]), Some(0));
        assert_eq!(message_len(&[0x00, 0x00, 0xff]), Some(0));
    }

    #[test]
    fn header_round_trip() {
        let hdr = frame_header(0x0c);
        assert_eq!(hdr, [0x00, 0x0c]);
        let mut buf = hdr.to_vec();
        buf.extend_from_slice(&[0u8; 12]);
        assert_eq!(message_len(&buf), Some(12));
    }
}
