//! One local application stream attached to a hub

use super::mix_buffer::MixBuffer;
use super::Direction;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::format::PcmFormat;
use crate::transport::ClientStream;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Bytes discarded from the data handle per read when a client drops its stream
const DISCARD_CHUNK: usize = 4096;

/// Upper bound on bytes discarded by a single Drop
const DISCARD_LIMIT: usize = 32 * 1024;

/// Control bytes read per attempt
const CONTROL_CHUNK: usize = 64;

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Registered, stream format not known yet
    Init,
    /// Playback: buffering up to the client threshold
    Idle,
    Running,
    Paused,
    /// Playback: flushing what the client wrote before it asked to drain
    Draining,
    /// Playback: flushed, waiting for the remote device to play it out
    DrainWait,
    Finished,
}

/// Command received on a client control handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Drain,
    Drop,
    Pause,
    Resume,
}

impl ControlCommand {
    const NAMES: [(&'static [u8], ControlCommand); 4] = [
        (b"Drain", Self::Drain),
        (b"Drop", Self::Drop),
        (b"Pause", Self::Pause),
        (b"Resume", Self::Resume),
    ];

    /// Parse a command; only the exact ASCII names are accepted
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == bytes)
            .map(|(_, command)| *command)
    }

    /// Take the next command off the bytes read from a control handle
    ///
    /// The control handle is a byte stream, so commands may arrive back to
    /// back, split over several reads, or separated by whitespace. Returns
    /// `None` while the bytes left are the start of a command, and the
    /// offending bytes up to the next whitespace for anything else.
    fn take(pending: &mut Vec<u8>) -> Option<std::result::Result<Self, Vec<u8>>> {
        let skip = pending
            .iter()
            .take_while(|b| b.is_ascii_whitespace() || **b == 0)
            .count();
        pending.drain(..skip);
        if pending.is_empty() {
            return None;
        }

        for (name, command) in Self::NAMES {
            if pending.starts_with(name) {
                pending.drain(..name.len());
                return Some(Ok(command));
            }
        }
        if Self::NAMES
            .iter()
            .any(|(name, _)| name.starts_with(pending.as_slice()))
        {
            return None;
        }

        let end = pending
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(pending.len());
        Some(Err(pending.drain(..end).collect()))
    }
}

/// Readiness reported by a client's own I/O thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The data handle can be read (playback) or written (capture)
    Data,
    /// A command is waiting on the control handle
    Control,
    /// One of the handles was closed by the application
    Hangup,
}

const REPLY_OK: &[u8] = b"OK";
const REPLY_INVALID: &[u8] = b"Invalid";

pub(crate) struct ClientChannel {
    seq: u64,
    direction: Direction,
    state: ClientState,
    data: Box<dyn ClientStream>,
    control: Box<dyn ClientStream>,
    format: Option<PcmFormat>,
    frame_size: usize,
    /// Playback: frames read but not yet mixed. Capture: frames not yet delivered.
    buffer: Vec<u8>,
    capacity: usize,
    /// Mix position of the next frame (playback)
    position: u64,
    /// Distance to the read position, kept while paused
    lead: usize,
    drain_deadline: Option<Instant>,
    /// Data handle had nothing more to read on the last attempt
    pipe_empty: bool,
    /// Playback: stop reading the data handle
    reading: bool,
    drop_requested: bool,
    /// Control bytes not yet forming a whole command
    commands: Vec<u8>,
}

impl ClientChannel {
    pub fn new(
        seq: u64,
        direction: Direction,
        data: Box<dyn ClientStream>,
        control: Box<dyn ClientStream>,
    ) -> Self {
        Self {
            seq,
            direction,
            state: ClientState::Init,
            data,
            control,
            format: None,
            frame_size: 0,
            buffer: Vec::new(),
            capacity: 0,
            position: 0,
            lead: 0,
            drain_deadline: None,
            pipe_empty: false,
            reading: false,
            drop_requested: false,
            commands: Vec::new(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn format(&self) -> Option<PcmFormat> {
        self.format
    }

    pub fn is_finished(&self) -> bool {
        self.state == ClientState::Finished
    }

    /// Whether the client currently feeds (playback) or takes (capture) audio
    pub fn is_active(&self) -> bool {
        match self.direction {
            Direction::Playback => {
                matches!(self.state, ClientState::Running | ClientState::Draining)
            }
            Direction::Capture => self.state == ClientState::Running,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state == ClientState::Draining
    }

    pub fn drain_deadline(&self) -> Option<Instant> {
        self.drain_deadline
    }

    /// Bytes waiting in the client buffer
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consume a pending Drop request
    pub fn take_drop(&mut self) -> bool {
        std::mem::take(&mut self.drop_requested)
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            trace!("Client {}: {:?} -> {:?}", self.seq, self.state, state);
            self.state = state;
        }
    }

    /// Mark the client for removal
    pub fn finish(&mut self, reason: &str) {
        if self.state != ClientState::Finished {
            debug!("Client {} finished: {}", self.seq, reason);
            self.set_state(ClientState::Finished);
            self.buffer.clear();
            self.drain_deadline = None;
        }
    }

    /// Size the client buffer for the stream format and enter the first active state
    ///
    /// Playback clients buffer `client_threshold_periods` periods and start
    /// idle; capture clients hold up to `buffer_periods` periods and are
    /// running immediately.
    pub fn init(&mut self, format: &PcmFormat, period: usize, config: &HubConfig) -> Result<()> {
        let periods = match self.direction {
            Direction::Playback => config.client_threshold_periods,
            Direction::Capture => config.buffer_periods,
        };
        let capacity = format.frames_to_bytes(periods * period);

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(capacity).map_err(|e| {
            HubError::client_init(format!("unable to allocate client buffer: {}", e))
        })?;

        self.buffer = buffer;
        self.capacity = capacity;
        self.frame_size = format.frame_size();
        self.format = Some(*format);
        self.position = 0;
        self.lead = 0;
        self.drain_deadline = None;
        self.pipe_empty = false;

        match self.direction {
            Direction::Playback => {
                self.reading = true;
                self.set_state(ClientState::Idle);
            }
            Direction::Capture => self.set_state(ClientState::Running),
        }
        Ok(())
    }

    /// Read newly available bytes from the data handle (playback)
    ///
    /// An idle client starts running once its buffer is full; its mix
    /// position is then `start`. Returns true if any bytes were read.
    pub fn fetch(&mut self, start: u64) -> bool {
        if !self.reading
            || !matches!(
                self.state,
                ClientState::Idle | ClientState::Running | ClientState::Draining
            )
        {
            return false;
        }

        let mut progress = false;
        while self.buffer.len() < self.capacity {
            let filled = self.buffer.len();
            self.buffer.resize(self.capacity, 0);
            let result = self.data.read(&mut self.buffer[filled..]);
            match result {
                Ok(0) => {
                    self.buffer.truncate(filled);
                    self.finish("data handle closed");
                    return progress;
                }
                Ok(n) => {
                    self.buffer.truncate(filled + n);
                    self.pipe_empty = false;
                    progress = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.buffer.truncate(filled);
                    self.pipe_empty = true;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    self.buffer.truncate(filled);
                }
                Err(e) => {
                    self.buffer.truncate(filled);
                    self.finish(&format!("data read failed: {}", e));
                    return progress;
                }
            }
        }

        if self.state == ClientState::Idle && self.buffer.len() >= self.capacity {
            self.position = start;
            self.set_state(ClientState::Running);
        }

        progress
    }

    /// Add buffered whole frames to the mix (playback)
    ///
    /// Returns true if any frames were taken by the mix.
    pub fn mix_into(&mut self, mix: &mut MixBuffer) -> bool {
        if !matches!(self.state, ClientState::Running | ClientState::Draining)
            || self.buffer.is_empty()
        {
            return false;
        }

        let consumed = mix.mix_in(&self.buffer, &mut self.position);
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        consumed > 0
    }

    /// Move a draining client to the play-out wait once the mix consumed all its frames
    pub fn check_drain(&mut self, mix: &MixBuffer, now: Instant, timeout: Duration) {
        if self.state != ClientState::Draining {
            return;
        }
        if self.pipe_empty
            && self.buffer.len() < self.frame_size.max(1)
            && mix.delay_to(self.position) == 0
        {
            debug!("Client {} drained, waiting {:?} for play-out", self.seq, timeout);
            self.buffer.clear();
            self.drain_deadline = Some(now + timeout);
            self.set_state(ClientState::DrainWait);
        }
    }

    /// Complete a drain whose play-out time has elapsed
    pub fn check_timer(&mut self, now: Instant) {
        if self.state == ClientState::DrainWait
            && self.drain_deadline.map_or(false, |deadline| deadline <= now)
        {
            self.complete_drain();
        }
    }

    fn complete_drain(&mut self) {
        debug!("Client {} drain complete", self.seq);
        self.drain_deadline = None;
        self.buffer.clear();
        self.reading = true;
        self.set_state(ClientState::Idle);
        self.reply(REPLY_OK);
    }

    /// The mix ran dry while this client was running (playback)
    pub fn underrun(&mut self) {
        if self.state == ClientState::Running {
            debug!("Client {} underrun", self.seq);
            self.set_state(ClientState::Idle);
        }
    }

    /// Forget the mix position after the mix buffer was replaced (playback)
    ///
    /// A running client goes back to idle and starts again at the write
    /// position of the new mix once its buffer is full. Pause and drain keep
    /// going from the start of the new mix.
    pub fn rearm(&mut self) {
        if self.direction != Direction::Playback {
            return;
        }
        self.position = 0;
        if self.state == ClientState::Running {
            debug!("Client {} re-buffering for a new mix", self.seq);
            self.set_state(ClientState::Idle);
        }
    }

    /// Queue captured bytes for delivery (capture)
    ///
    /// Only whole frames are queued. Returns the number of bytes that did not
    /// fit in the client buffer and were dropped.
    pub fn enqueue(&mut self, data: &[u8]) -> usize {
        if self.state != ClientState::Running || self.frame_size == 0 {
            return 0;
        }
        let whole = data.len() - data.len() % self.frame_size;
        let space = self.capacity - self.buffer.len();
        let take = whole.min(space - space % self.frame_size);
        self.buffer.extend_from_slice(&data[..take]);
        whole - take
    }

    /// Write queued bytes to the data handle without blocking (capture)
    pub fn deliver(&mut self) {
        if self.state == ClientState::Finished {
            return;
        }
        while !self.buffer.is_empty() {
            match self.data.write(&self.buffer) {
                Ok(0) => {
                    self.finish("data handle closed");
                    return;
                }
                Ok(n) => {
                    self.buffer.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.finish(&format!("data write failed: {}", e));
                    return;
                }
            }
        }
    }

    /// Read and act on every command waiting on the control handle
    pub fn poll_control(&mut self, mix: Option<&MixBuffer>) {
        let mut chunk = [0u8; CONTROL_CHUNK];
        while self.state != ClientState::Finished {
            let len = match self.control.read(&mut chunk) {
                Ok(0) => {
                    self.finish("control handle closed");
                    return;
                }
                Ok(len) => len,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finish(&format!("control read failed: {}", e));
                    return;
                }
            };
            self.commands.extend_from_slice(&chunk[..len]);
            self.run_commands(mix);
        }
    }

    fn run_commands(&mut self, mix: Option<&MixBuffer>) {
        while self.state != ClientState::Finished {
            let Some(next) = ControlCommand::take(&mut self.commands) else {
                break;
            };

            // a well-behaved client blocks while draining, others get the
            // drain completed before their next command
            if matches!(self.state, ClientState::Draining | ClientState::DrainWait) {
                self.complete_drain();
            }

            match next {
                Ok(command) => self.handle_command(command, mix),
                Err(bytes) => {
                    warn!(
                        "Invalid PCM control command from client {}: {:?}",
                        self.seq,
                        String::from_utf8_lossy(&bytes)
                    );
                    self.reply(REPLY_INVALID);
                }
            }
        }
    }

    fn handle_command(&mut self, command: ControlCommand, mix: Option<&MixBuffer>) {
        debug!("{:?}: client {}", command, self.seq);
        match command {
            ControlCommand::Drain => match (self.direction, self.state) {
                (Direction::Playback, ClientState::Running) => {
                    self.set_state(ClientState::Draining);
                }
                // a short stream that never reached the client threshold
                (Direction::Playback, ClientState::Idle) if !self.buffer.is_empty() => {
                    if let Some(mix) = mix {
                        self.position = mix.write_position();
                    }
                    self.set_state(ClientState::Draining);
                }
                _ => self.reply(REPLY_OK),
            },
            ControlCommand::Drop => {
                if self.direction == Direction::Playback {
                    self.discard_pending();
                    self.drain_deadline = None;
                    if self.state != ClientState::Init {
                        self.set_state(ClientState::Idle);
                    }
                    self.drop_requested = true;
                }
                self.reply(REPLY_OK);
            }
            ControlCommand::Pause => {
                if self.direction == Direction::Playback {
                    self.lead = mix.map_or(0, |mix| mix.delay_to(self.position));
                    self.reading = false;
                }
                if self.state != ClientState::Init {
                    self.set_state(ClientState::Paused);
                }
                self.reply(REPLY_OK);
            }
            ControlCommand::Resume => {
                match (self.state, self.direction) {
                    (ClientState::Idle, Direction::Playback) => {
                        self.reading = true;
                        self.drop_requested = false;
                    }
                    (ClientState::Idle, Direction::Capture) => {
                        self.set_state(ClientState::Running);
                    }
                    (ClientState::Paused, Direction::Playback) => {
                        if let Some(mix) = mix {
                            self.position = mix.read_position() + self.lead as u64;
                        }
                        self.reading = true;
                        self.set_state(ClientState::Running);
                    }
                    (ClientState::Paused, Direction::Capture) => {
                        self.set_state(ClientState::Running);
                    }
                    _ => {}
                }
                self.reply(REPLY_OK);
            }
        }
    }

    /// Throw away buffered bytes and whatever is waiting on the data handle
    fn discard_pending(&mut self) {
        self.buffer.clear();
        let mut scratch = [0u8; DISCARD_CHUNK];
        let mut discarded = 0;
        while discarded < DISCARD_LIMIT {
            match self.data.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        trace!("Client {} discarded {} bytes", self.seq, discarded);
    }

    fn reply(&mut self, message: &[u8]) {
        if let Err(e) = self.control.write_all(message) {
            warn!("Client {} control response failed: {}", self.seq, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use std::os::unix::net::UnixStream;

    struct Peer {
        data: UnixStream,
        control: UnixStream,
    }

    fn client(direction: Direction) -> (ClientChannel, Peer) {
        let (data, data_peer) = UnixStream::pair().unwrap();
        let (control, control_peer) = UnixStream::pair().unwrap();
        data.set_nonblocking(true).unwrap();
        control.set_nonblocking(true).unwrap();
        let channel = ClientChannel::new(1, direction, Box::new(data), Box::new(control));
        (
            channel,
            Peer {
                data: data_peer,
                control: control_peer,
            },
        )
    }

    fn mono_s16() -> PcmFormat {
        PcmFormat::new(SampleFormat::S16Le, 1, 8000)
    }

    fn config() -> HubConfig {
        HubConfig {
            period_frames: Some(4),
            ..Default::default()
        }
    }

    fn reply(peer: &mut Peer) -> Vec<u8> {
        let mut buf = [0u8; 16];
        let n = peer.control.read(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlCommand::parse(b"Drain"), Some(ControlCommand::Drain));
        assert_eq!(ControlCommand::parse(b"Drop"), Some(ControlCommand::Drop));
        assert_eq!(ControlCommand::parse(b"Pause"), Some(ControlCommand::Pause));
        assert_eq!(ControlCommand::parse(b"Resume"), Some(ControlCommand::Resume));
        assert_eq!(ControlCommand::parse(b"Dra"), None);
        assert_eq!(ControlCommand::parse(b"Drain\n"), None);
    }

    #[test]
    fn test_take_commands_from_stream() {
        let mut pending = b"DropPause\nRewind Drain Res".to_vec();
        assert_eq!(ControlCommand::take(&mut pending), Some(Ok(ControlCommand::Drop)));
        assert_eq!(ControlCommand::take(&mut pending), Some(Ok(ControlCommand::Pause)));
        assert_eq!(ControlCommand::take(&mut pending), Some(Err(b"Rewind".to_vec())));
        assert_eq!(ControlCommand::take(&mut pending), Some(Ok(ControlCommand::Drain)));
        // the start of a command waits for the rest
        assert_eq!(ControlCommand::take(&mut pending), None);
        assert_eq!(pending, b"Res");
        pending.extend_from_slice(b"ume");
        assert_eq!(ControlCommand::take(&mut pending), Some(Ok(ControlCommand::Resume)));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_commands_sent_together_are_all_handled() {
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&mono_s16(), 4, &config()).unwrap();

        peer.control.write_all(b"Pause").unwrap();
        peer.control.write_all(b"Resume").unwrap();
        channel.poll_control(None);

        let mut replies = [0u8; 4];
        peer.control.read_exact(&mut replies).unwrap();
        assert_eq!(&replies, b"OKOK");
        assert_eq!(channel.state(), ClientState::Running);
    }

    #[test]
    fn test_command_split_over_reads() {
        let (mut channel, mut peer) = client(Direction::Capture);
        channel.init(&mono_s16(), 4, &config()).unwrap();

        peer.control.write_all(b"Pa").unwrap();
        channel.poll_control(None);
        assert_eq!(channel.state(), ClientState::Running);

        peer.control.write_all(b"use\n").unwrap();
        channel.poll_control(None);
        assert_eq!(channel.state(), ClientState::Paused);
        assert_eq!(reply(&mut peer), b"OK");
    }

    #[test]
    fn test_rearm_restarts_at_new_mix() {
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        peer.data.write_all(&[0u8; 16]).unwrap();
        channel.fetch(200);
        assert_eq!(channel.state(), ClientState::Running);
        assert_eq!(channel.position, 200);

        channel.rearm();
        assert_eq!(channel.state(), ClientState::Idle);
        assert_eq!(channel.position, 0);

        // the buffer is still full, so the client runs again right away
        channel.fetch(0);
        assert_eq!(channel.state(), ClientState::Running);
        assert_eq!(channel.position, 0);
    }

    #[test]
    fn test_playback_starts_when_buffer_full() {
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        assert_eq!(channel.state(), ClientState::Idle);

        // client threshold is 2 periods of 4 frames = 16 bytes
        peer.data.write_all(&[0u8; 10]).unwrap();
        assert!(channel.fetch(0));
        assert_eq!(channel.state(), ClientState::Idle);

        peer.data.write_all(&[0u8; 10]).unwrap();
        assert!(channel.fetch(42));
        assert_eq!(channel.state(), ClientState::Running);
        assert_eq!(channel.pending(), 16);
        assert!(channel.is_active());
    }

    #[test]
    fn test_mix_into_advances_position() {
        let format = mono_s16();
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&format, 4, &config()).unwrap();
        let mut mix = MixBuffer::new(&format, 64, 4, 16);

        peer.data.write_all(&[1u8; 16]).unwrap();
        channel.fetch(mix.write_position());
        assert!(channel.mix_into(&mut mix));
        assert_eq!(mix.available(), 8);
        assert_eq!(channel.pending(), 0);
        assert!(!channel.mix_into(&mut mix));
    }

    #[test]
    fn test_closed_data_handle_finishes() {
        let (mut channel, peer) = client(Direction::Playback);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        drop(peer);
        channel.fetch(0);
        assert!(channel.is_finished());
    }

    #[test]
    fn test_pause_and_resume() {
        let format = mono_s16();
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&format, 4, &config()).unwrap();
        let mut mix = MixBuffer::new(&format, 64, 4, 16);

        peer.data.write_all(&[0u8; 16]).unwrap();
        channel.fetch(0);
        channel.mix_into(&mut mix);

        peer.control.write_all(b"Pause").unwrap();
        channel.poll_control(Some(&mix));
        assert_eq!(channel.state(), ClientState::Paused);
        assert_eq!(reply(&mut peer), b"OK");
        assert!(!channel.is_active());

        let mut out = [0u8; 8];
        mix.read(&mut out, &[]);

        peer.control.write_all(b"Resume").unwrap();
        channel.poll_control(Some(&mix));
        assert_eq!(channel.state(), ClientState::Running);
        assert_eq!(reply(&mut peer), b"OK");
        // the lead of 8 frames over the read position is kept
        assert_eq!(channel.position, mix.read_position() + 8);
    }

    #[test]
    fn test_drop_discards_and_flags() {
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        peer.data.write_all(&[0u8; 40]).unwrap();
        channel.fetch(0);
        assert_eq!(channel.state(), ClientState::Running);

        peer.control.write_all(b"Drop").unwrap();
        channel.poll_control(None);
        assert_eq!(reply(&mut peer), b"OK");
        assert_eq!(channel.state(), ClientState::Idle);
        assert_eq!(channel.pending(), 0);
        assert!(channel.take_drop());
        assert!(!channel.take_drop());

        // the pipe was emptied too
        assert!(!channel.fetch(0));
    }

    #[test]
    fn test_drain_waits_for_mix_and_timer() {
        let format = mono_s16();
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&format, 4, &config()).unwrap();
        let mut mix = MixBuffer::new(&format, 64, 4, 16);

        peer.data.write_all(&[0u8; 16]).unwrap();
        channel.fetch(0);
        channel.mix_into(&mut mix);

        peer.control.write_all(b"Drain").unwrap();
        channel.poll_control(Some(&mix));
        assert_eq!(channel.state(), ClientState::Draining);
        assert!(channel.is_active());

        let now = Instant::now();
        let timeout = Duration::from_millis(300);
        channel.fetch(mix.write_position());
        channel.check_drain(&mix, now, timeout);
        assert_eq!(channel.state(), ClientState::Draining);

        let mut out = [0u8; 16];
        mix.read(&mut out, &[]);
        channel.check_drain(&mix, now, timeout);
        assert_eq!(channel.state(), ClientState::DrainWait);
        assert_eq!(channel.drain_deadline(), Some(now + timeout));

        channel.check_timer(now);
        assert_eq!(channel.state(), ClientState::DrainWait);
        channel.check_timer(now + timeout);
        assert_eq!(channel.state(), ClientState::Idle);
        assert_eq!(reply(&mut peer), b"OK");
    }

    #[test]
    fn test_drain_when_not_running_replies_at_once() {
        let (mut channel, mut peer) = client(Direction::Playback);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        peer.control.write_all(b"Drain").unwrap();
        channel.poll_control(None);
        assert_eq!(channel.state(), ClientState::Idle);
        assert_eq!(reply(&mut peer), b"OK");
    }

    #[test]
    fn test_invalid_command() {
        let (mut channel, mut peer) = client(Direction::Capture);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        peer.control.write_all(b"Rewind").unwrap();
        channel.poll_control(None);
        assert_eq!(reply(&mut peer), b"Invalid");
        assert_eq!(channel.state(), ClientState::Running);
    }

    #[test]
    fn test_closed_control_handle_finishes() {
        let (mut channel, peer) = client(Direction::Capture);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        drop(peer.control);
        channel.poll_control(None);
        assert!(channel.is_finished());
    }

    #[test]
    fn test_capture_overflow_is_dropped() {
        let config = HubConfig {
            period_frames: Some(4),
            buffer_periods: 2,
            ..Default::default()
        };
        let (mut channel, _peer) = client(Direction::Capture);
        channel.init(&mono_s16(), 4, &config).unwrap();
        assert_eq!(channel.state(), ClientState::Running);

        // capacity is 8 frames = 16 bytes; the trailing odd byte is not a frame
        assert_eq!(channel.enqueue(&[0u8; 12]), 0);
        assert_eq!(channel.enqueue(&[0u8; 9]), 4);
        assert_eq!(channel.pending(), 16);
    }

    #[test]
    fn test_capture_deliver_and_pause() {
        let (mut channel, mut peer) = client(Direction::Capture);
        channel.init(&mono_s16(), 4, &config()).unwrap();
        channel.enqueue(&[1, 0, 2, 0]);
        channel.deliver();
        assert_eq!(channel.pending(), 0);

        let mut got = [0u8; 4];
        peer.data.read_exact(&mut got).unwrap();
        assert_eq!(got, [1, 0, 2, 0]);

        peer.control.write_all(b"Pause").unwrap();
        channel.poll_control(None);
        assert_eq!(channel.state(), ClientState::Paused);
        assert_eq!(channel.enqueue(&[0u8; 4]), 0);
        assert_eq!(channel.pending(), 0);
    }
}
