//! Socket plumbing for the launcher and viewer peers
//!
//! The command socket connects out to the launcher: single-letter commands
//! (P/R/U/T) arrive in-band, larger payloads (run script, description,
//! viewer port) arrive framed between MSG_START and MSG_END sentinels. The
//! viewer socket streams rendered plot blocks the other way, one frame per
//! 100-tick block, and exchanges a final MSG_EOF handshake so buffered data
//! is never discarded. Losing the viewer is survivable (that stream just
//! goes quiet); losing the launcher ends the run like a terminate command.

use crate::error::{CliError, CliResult};
use respire_engine::error::EngineError;
use respire_engine::{Command, ControlLink, ControlPoll, PlotSink};
use respire_storage::framing::{self, Frame, FrameReader};
use respire_storage::wave::{BlockEncoder, PlotChannelInfo};
use respire_storage::wave::BLOCK_NUMBER_WRAP;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{info, warn};

/// How long connection attempts and payload waits keep retrying
const RETRY_LIMIT: u32 = 60;

/// Command-socket connection to the launcher
pub struct CommandLink {
    stream: Option<TcpStream>,
    frames: FrameReader,
    inbox: Vec<Frame>,
    pending: Vec<Command>,
}

impl CommandLink {
    /// Connect to the launcher's command port
    pub fn connect(host: &str, port: u16) -> CliResult<Self> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            CliError::connection(format!("cannot reach launcher at {}:{}: {}", host, port, e))
        })?;
        stream.set_nonblocking(true)?;
        info!("connected to launcher at {}:{}", host, port);
        Ok(Self {
            stream: Some(stream),
            frames: FrameReader::new(),
            inbox: Vec::new(),
            pending: Vec::new(),
        })
    }

    /// Pull everything currently readable off the socket.
    /// Returns true when the peer has gone away.
    fn pump(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    info!("launcher connection closed");
                    self.stream = None;
                    return true;
                }
                Ok(n) => {
                    for &b in &buf[..n] {
                        if self.frames.idle() {
                            if let Some(cmd) = Command::from_byte(b) {
                                self.pending.push(cmd);
                                continue;
                            }
                        }
                        self.inbox.extend(self.frames.push(&[b]));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("launcher socket error: {}", e);
                    self.stream = None;
                    return true;
                }
            }
        }
    }

    /// Take the first queued frame with the given message id
    pub fn take_frame(&mut self, id: u8) -> Option<Vec<u8>> {
        let pos = self.inbox.iter().position(|f| f.id == id)?;
        Some(self.inbox.remove(pos).payload)
    }

    /// Wait for the startup payloads the run needs: the viewer port (when
    /// streaming), the run script, and the description.
    pub fn get_essentials(
        &mut self,
        want_port: bool,
    ) -> CliResult<(Option<u16>, Vec<u8>, Vec<u8>)> {
        let mut port = None;
        let mut script = None;
        let mut description = None;
        for _ in 0..RETRY_LIMIT {
            let lost = self.pump();
            if port.is_none() {
                if let Some(payload) = self.take_frame(framing::PORT_MSG) {
                    let text = String::from_utf8_lossy(&payload);
                    port = text.trim().parse::<u16>().ok();
                    info!("viewer listens on port {:?}", port);
                }
            }
            if script.is_none() {
                script = self.take_frame(framing::SCRIPT_MSG);
                if let Some(s) = &script {
                    info!("received run script, {} bytes", s.len());
                }
            }
            if description.is_none() {
                description = self
                    .take_frame(framing::SIM_MSG)
                    .or_else(|| self.take_frame(framing::SND_MSG));
                if let Some(d) = &description {
                    info!("received description, {} bytes", d.len());
                }
            }
            if (!want_port || port.is_some()) && script.is_some() && description.is_some() {
                return Ok((port, script.unwrap(), description.unwrap()));
            }
            if lost {
                return Err(CliError::connection(
                    "launcher disconnected before sending the run inputs",
                ));
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        Err(CliError::connection("timed out waiting for the run inputs"))
    }

    fn send_text(&mut self, text: &str) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = stream.write_all(text.as_bytes()) {
                if e.kind() != ErrorKind::WouldBlock {
                    warn!("dropping launcher connection: {}", e);
                    self.stream = None;
                }
            }
        }
    }
}

impl ControlLink for CommandLink {
    fn poll(&mut self) -> ControlPoll {
        let disconnected = self.pump();
        ControlPoll {
            commands: std::mem::take(&mut self.pending),
            disconnected,
        }
    }

    fn send_progress(&mut self, seconds: f64) {
        let text = if seconds.fract() == 0.0 {
            format!("TIME\n{}\n", seconds as i64)
        } else {
            format!("TIME\n{:.2}\n", seconds)
        };
        self.send_text(&text);
    }

    fn recv_description(&mut self) -> respire_engine::Result<Option<Vec<u8>>> {
        for _ in 0..RETRY_LIMIT {
            let lost = self.pump();
            if let Some(payload) = self
                .take_frame(framing::SIM_MSG)
                .or_else(|| self.take_frame(framing::SND_MSG))
            {
                return Ok(Some(payload));
            }
            if lost {
                return Err(EngineError::PeerLost {
                    reason: "waiting for an updated description".into(),
                });
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        Ok(None)
    }
}

/// Viewer-socket block streamer
pub struct ViewerLink {
    stream: Option<TcpStream>,
    spawn: i32,
    block_number: u32,
    buffer: Vec<u8>,
}

impl ViewerLink {
    /// Connect to the viewer, retrying while it starts up
    pub fn connect(host: &str, port: u16, spawn: i32) -> CliResult<Self> {
        let mut last_err = None;
        for _ in 0..RETRY_LIMIT {
            match TcpStream::connect((host, port)) {
                Ok(stream) => {
                    info!("connected to viewer at {}:{}", host, port);
                    return Ok(Self {
                        stream: Some(stream),
                        spawn,
                        block_number: 0,
                        buffer: Vec::new(),
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        }
        Err(CliError::connection(format!(
            "could not connect to viewer at {}:{}: {}",
            host,
            port,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Blocking send of the whole buffer; viewer loss closes the stream
    /// and the run continues without it
    fn send_buffer(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            self.buffer.clear();
            return;
        };
        if let Err(e) = stream.write_all(&self.buffer) {
            warn!("connection to viewer lost: {}", e);
            self.stream = None;
        }
        self.buffer.clear();
    }
}

impl PlotSink for ViewerLink {
    fn begin_block(
        &mut self,
        nrecs: usize,
        step_ms: f64,
        channels: &[PlotChannelInfo],
    ) -> respire_engine::Result<()> {
        self.buffer.clear();
        self.buffer.push(framing::MSG_START);
        self.buffer
            .extend_from_slice(format!("{}\n{}\n", self.spawn, self.block_number).as_bytes());
        self.buffer
            .extend_from_slice(BlockEncoder::header(nrecs, step_ms, channels).as_bytes());
        Ok(())
    }

    fn rows(&mut self, values: &[(f64, i32)]) -> respire_engine::Result<()> {
        self.buffer
            .extend_from_slice(BlockEncoder::rows(values).as_bytes());
        Ok(())
    }

    fn end_block(&mut self) -> respire_engine::Result<()> {
        self.buffer.push(framing::MSG_END);
        self.send_buffer();
        self.block_number += 1;
        if self.block_number == BLOCK_NUMBER_WRAP {
            self.block_number = 0;
        }
        Ok(())
    }

    fn finish(&mut self) -> respire_engine::Result<()> {
        // closing handshake: send EOF, wait for the viewer to confirm it
        // has drained everything we sent
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if stream.write_all(&[framing::MSG_EOF]).is_ok() {
            let mut byte = [0u8; 1];
            match stream.read(&mut byte) {
                Ok(1) if byte[0] == framing::MSG_EOF => {}
                Ok(_) => info!("unexpected viewer reply to the EOF handshake"),
                Err(e) => warn!("viewer EOF handshake failed: {}", e),
            }
        }
        self.stream = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_command_link_decodes_inband_and_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut link = CommandLink::connect("127.0.0.1", addr.port()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        peer.write_all(b"P").unwrap();
        peer.write_all(&framing::encode_frame(framing::SCRIPT_MSG, b"hello"))
            .unwrap();
        peer.write_all(b"R").unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let poll = link.poll();
        assert_eq!(poll.commands, vec![Command::Pause, Command::Resume]);
        assert!(!poll.disconnected);
        assert_eq!(link.take_frame(framing::SCRIPT_MSG).unwrap(), b"hello");
    }

    #[test]
    fn test_command_link_detects_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut link = CommandLink::connect("127.0.0.1", addr.port()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));

        let poll = link.poll();
        assert!(poll.disconnected);
    }

    #[test]
    fn test_viewer_block_frame_layout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut link = ViewerLink::connect("127.0.0.1", addr.port(), 7).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let channels = vec![PlotChannelInfo {
            pop: 1,
            cell: 1,
            var: 1,
            typ: 0,
            label: "Vm".into(),
        }];
        link.begin_block(2, 0.5, &channels).unwrap();
        link.rows(&[(1.0, 0)]).unwrap();
        link.rows(&[(2.0, 1)]).unwrap();
        link.end_block().unwrap();

        let mut got = vec![0u8; 4096];
        let n = peer.read(&mut got).unwrap();
        let frame = &got[..n];
        assert_eq!(frame[0], framing::MSG_START);
        assert_eq!(*frame.last().unwrap(), framing::MSG_END);
        let body = String::from_utf8_lossy(&frame[1..n - 1]);
        let mut lines = body.lines();
        assert_eq!(lines.next().unwrap(), "7"); // spawn
        assert_eq!(lines.next().unwrap(), "0"); // block number
        assert!(body.contains("  1.00000000 0"));
        assert!(body.contains("  2.00000000 1"));
    }
}
