//! Byte sentinels and frame codec for the launcher/viewer sockets
//!
//! Frames on the wire are `MSG_START <id> <payload bytes> MSG_END`; the
//! sentinels sit above the printable ASCII range so they cannot collide with
//! the textual payloads. `MSG_EOF` is sent bare, both ways, as the closing
//! handshake. In-band single letters P/R/U/T on the command socket are not
//! framed at all.

/// Start-of-frame sentinel
pub const MSG_START: u8 = 0xfd;
/// End-of-frame sentinel
pub const MSG_END: u8 = 0xfe;
/// End-of-stream handshake byte
pub const MSG_EOF: u8 = 0xff;

/// Viewer reports its listening port
pub const PORT_MSG: u8 = b'O';
/// Run script payload
pub const SCRIPT_MSG: u8 = b'C';
/// Network description payload
pub const SIM_MSG: u8 = b'I';
/// Auxiliary description payload
pub const SND_MSG: u8 = b'N';

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message id byte (PORT_MSG, SCRIPT_MSG, SIM_MSG, SND_MSG)
    pub id: u8,
    /// Payload bytes between the id and MSG_END
    pub payload: Vec<u8>,
}

/// Encode a frame for the wire
pub fn encode_frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(MSG_START);
    out.push(id);
    out.extend_from_slice(payload);
    out.push(MSG_END);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    WantId,
    InPayload,
}

/// Incremental frame decoder.
///
/// Push received bytes in as they arrive; completed frames come back out.
/// Bytes outside a frame are discarded, which lets the decoder resynchronize
/// on the next MSG_START after a damaged stream.
#[derive(Debug)]
pub struct FrameReader {
    state: DecodeState,
    id: u8,
    payload: Vec<u8>,
    eof_seen: bool,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    /// Create an idle decoder
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            id: 0,
            payload: Vec::new(),
            eof_seen: false,
        }
    }

    /// True once a bare MSG_EOF has been seen outside any frame
    pub fn eof(&self) -> bool {
        self.eof_seen
    }

    /// True while the decoder is between frames; bytes arriving now are
    /// in-band (command letters), not payload
    pub fn idle(&self) -> bool {
        self.state == DecodeState::Idle
    }

    /// Feed received bytes; returns any frames completed by this chunk
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for &b in bytes {
            match self.state {
                DecodeState::Idle => {
                    if b == MSG_START {
                        self.state = DecodeState::WantId;
                        self.payload.clear();
                    } else if b == MSG_EOF {
                        self.eof_seen = true;
                    }
                }
                DecodeState::WantId => {
                    if b == MSG_END {
                        // empty frame with no id; drop it
                        self.state = DecodeState::Idle;
                    } else {
                        self.id = b;
                        self.state = DecodeState::InPayload;
                    }
                }
                DecodeState::InPayload => {
                    if b == MSG_END {
                        frames.push(Frame {
                            id: self.id,
                            payload: std::mem::take(&mut self.payload),
                        });
                        self.state = DecodeState::Idle;
                    } else if b == MSG_START {
                        // lost the end of the previous frame; resync
                        log::warn!("frame resync: MSG_START inside payload");
                        self.state = DecodeState::WantId;
                        self.payload.clear();
                    } else {
                        self.payload.push(b);
                    }
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let wire = encode_frame(SCRIPT_MSG, b"hello\nscript\n");
        let mut reader = FrameReader::new();
        let frames = reader.push(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, SCRIPT_MSG);
        assert_eq!(frames[0].payload, b"hello\nscript\n");
    }

    #[test]
    fn test_split_delivery() {
        let wire = encode_frame(PORT_MSG, b"40001");
        let mut reader = FrameReader::new();
        assert!(reader.push(&wire[..3]).is_empty());
        let frames = reader.push(&wire[3..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"40001");
    }

    #[test]
    fn test_eof_outside_frame() {
        let mut reader = FrameReader::new();
        reader.push(&[MSG_EOF]);
        assert!(reader.eof());
    }

    #[test]
    fn test_garbage_between_frames() {
        let mut wire = vec![b'x', b'y'];
        wire.extend(encode_frame(SIM_MSG, b"payload"));
        let mut reader = FrameReader::new();
        let frames = reader.push(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, SIM_MSG);
    }
}
