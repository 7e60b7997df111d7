//! Boundary between the hub and the Bluetooth transport endpoint it serves

use crate::volume::Volume;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use tracing::trace;

/// Callbacks into the owning transport endpoint
///
/// The hub invokes these from its worker thread and from whichever thread
/// calls into the hub, so implementations must be cheap and must not call
/// back into the hub.
pub trait Transport: Send + Sync {
    /// First client connected: open the Bluetooth side of the stream
    fn request_open(&self);

    /// Last client disconnected: nobody is listening any more
    fn request_close(&self) {}

    /// No client is actively capturing: suspend Bluetooth I/O
    fn request_pause(&self);

    /// A client is active again: resume Bluetooth I/O
    fn request_resume(&self);

    /// The only client discarded its queued audio
    fn request_drop(&self) {}

    /// Release the transport after the hub reported end of stream
    fn release(&self);

    /// Wake the transport I/O thread (mixed frames ready, or hub finished)
    fn wake(&self) {}

    /// Volume applied to the mixed stream
    fn volume(&self) -> &Volume;
}

/// Notification emitted by [`SignalTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Open,
    Close,
    Pause,
    Resume,
    Drop,
    Release,
    Wake,
}

/// Transport that forwards every hub callback over a channel
///
/// Used by the command line driver, which runs the transport I/O loop
/// itself, and by tests that assert on the callbacks a hub makes.
pub struct SignalTransport {
    tx: Sender<TransportSignal>,
    volume: Volume,
}

impl SignalTransport {
    /// Create a transport and the receiving end of its signals
    pub fn new(channels: usize) -> (Self, Receiver<TransportSignal>) {
        let (tx, rx) = unbounded();
        (
            Self {
                tx,
                volume: Volume::new(channels),
            },
            rx,
        )
    }

    fn signal(&self, signal: TransportSignal) {
        trace!("Transport signal: {:?}", signal);
        // receiver may be gone during shutdown
        let _ = self.tx.send(signal);
    }
}

impl Transport for SignalTransport {
    fn request_open(&self) {
        self.signal(TransportSignal::Open);
    }

    fn request_close(&self) {
        self.signal(TransportSignal::Close);
    }

    fn request_pause(&self) {
        self.signal(TransportSignal::Pause);
    }

    fn request_resume(&self) {
        self.signal(TransportSignal::Resume);
    }

    fn request_drop(&self) {
        self.signal(TransportSignal::Drop);
    }

    fn release(&self) {
        self.signal(TransportSignal::Release);
    }

    fn wake(&self) {
        self.signal(TransportSignal::Wake);
    }

    fn volume(&self) -> &Volume {
        &self.volume
    }
}

/// A client data or control handle
///
/// The hub only performs non-blocking I/O on client handles; it switches
/// them to non-blocking mode when the client is added.
pub trait ClientStream: Read + Write + Send {
    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()>;
}

impl ClientStream for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

impl ClientStream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}
