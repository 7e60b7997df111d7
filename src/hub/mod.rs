//! Multi-client hub sharing one transport endpoint between many applications
//!
//! A playback hub mixes the streams of all its clients into one
//! [`MixBuffer`] that the transport I/O thread drains with [`Hub::pull`]. A
//! capture hub copies every buffer the transport hands to [`Hub::push`] to
//! each running client. Client I/O runs on a dedicated worker thread that is
//! started with the first client and stops with the last one.

mod client;
mod clients;
mod event_loop;
mod mix_buffer;

pub use client::{ClientEvent, ClientState, ControlCommand};
pub use clients::{ClientId, ClientSet};
pub use event_loop::{ClientNotifier, HubEvent};
pub use mix_buffer::MixBuffer;

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::format::PcmFormat;
use crate::transport::{ClientStream, Transport};
use client::{ClientChannel, ClientEvent as Event};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Direction of the audio flowing through a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Clients write audio that is mixed and sent to the remote device
    Playback,
    /// Audio from the remote device is copied to every client
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Playback => write!(f, "Playback"),
            Direction::Capture => write!(f, "Capture"),
        }
    }
}

/// Hub state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Waiting for a format, for clients, or for enough mixed audio
    Init,
    /// Audio is flowing
    Running,
    /// Capture only: no client is taking audio
    Paused,
    /// The last client left, or the worker stopped
    Finished,
}

/// Outcome of [`Hub::pull`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// Number of frames written to the output buffer
    Frames(usize),
    /// Nothing to play right now
    WouldBlock,
    /// The last client left; reported once
    EndOfStream,
}

struct HubCore {
    direction: Direction,
    config: HubConfig,
    transport: Arc<dyn Transport>,
    inner: Mutex<HubInner>,
    /// Signalled after every worker cycle and when the worker stops
    cycle_done: Condvar,
    events_tx: Sender<HubEvent>,
    events: Receiver<HubEvent>,
}

/// State shared by the worker, the transport thread and control callers
struct HubInner {
    state: HubState,
    format: Option<PcmFormat>,
    /// Period in frames, 0 until configured
    period: usize,
    clients: ClientSet<ClientChannel>,
    mix: Option<MixBuffer>,
    /// Completed worker cycles
    cycle: u64,
    worker_alive: bool,
    terminate: bool,
    destroyed: bool,
    end_reported: bool,
    released: bool,
    next_seq: u64,
}

impl HubInner {
    /// Earliest drain timer of any client
    fn next_deadline(&self) -> Option<Instant> {
        self.clients
            .iter()
            .filter_map(|(_, client)| client.drain_deadline())
            .min()
    }

    fn client_event(&mut self, id: ClientId, event: Event) {
        match self.clients.get_mut(id) {
            Some(client) => match event {
                Event::Hangup => client.finish("hung up"),
                Event::Data | Event::Control => {
                    trace!("Client {} {:?} ready", client.seq(), event);
                }
            },
            None => trace!("Ignoring {:?} for removed client {}", event, id),
        }
    }

    /// Report the end of stream once, then nothing more
    fn end_of_stream(&mut self) -> Option<Pull> {
        if self.state != HubState::Finished {
            return None;
        }
        if self.end_reported {
            Some(Pull::WouldBlock)
        } else {
            self.end_reported = true;
            Some(Pull::EndOfStream)
        }
    }

    fn leave_finished(&mut self) {
        if self.state == HubState::Finished {
            self.state = HubState::Init;
            self.end_reported = false;
            self.released = false;
        }
    }
}

/// Multi-client hub bound to one transport endpoint
pub struct Hub {
    core: Arc<HubCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Create a hub for a transport endpoint
    ///
    /// The hub stays idle until [`configure`](Self::configure) supplies the
    /// negotiated stream format; clients may be added before that.
    pub fn new(
        direction: Direction,
        config: HubConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let (events_tx, events) = bounded(config.event_queue_depth());

        debug!("Created {} hub (max {} clients)", direction, config.max_clients);
        Ok(Self {
            core: Arc::new(HubCore {
                direction,
                config,
                transport,
                inner: Mutex::new(HubInner {
                    state: HubState::Init,
                    format: None,
                    period: 0,
                    clients: ClientSet::new(),
                    mix: None,
                    cycle: 0,
                    worker_alive: false,
                    terminate: false,
                    destroyed: false,
                    end_reported: false,
                    released: false,
                    next_seq: 0,
                }),
                cycle_done: Condvar::new(),
                events_tx,
                events,
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn direction(&self) -> Direction {
        self.core.direction
    }

    pub fn config(&self) -> &HubConfig {
        &self.core.config
    }

    pub fn state(&self) -> HubState {
        self.core.inner.lock().state
    }

    pub fn format(&self) -> Option<PcmFormat> {
        self.core.inner.lock().format
    }

    pub fn client_count(&self) -> usize {
        self.core.inner.lock().clients.len()
    }

    /// Period length in frames, 0 until configured
    pub fn period_frames(&self) -> usize {
        self.core.inner.lock().period
    }

    /// Set the stream format negotiated by the transport
    ///
    /// Allocates the mix buffer and initializes the clients that were added
    /// before the format was known; a client that cannot be initialized is
    /// dropped.
    pub fn configure(&self, format: PcmFormat) -> Result<()> {
        format.validate()?;

        let mut worker = self.worker.lock();
        let mut inner = self.core.inner.lock();
        if inner.destroyed {
            return Err(HubError::Destroyed);
        }

        let config = &self.core.config;
        let period = config.period_frames(&format);
        inner.format = Some(format);
        inner.period = period;
        inner.mix = None;
        self.ensure_mix(&mut inner);
        inner.state = HubState::Init;
        inner.end_reported = false;
        inner.released = false;

        // the mix was replaced, so kept clients restart from its first frame
        let removed = inner.clients.retain(|_, client| {
            if client.format() == Some(format) {
                client.rearm();
                return true;
            }
            match client.init(&format, period, config) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Client {} initialization failed: {}", client.seq(), e);
                    false
                }
            }
        });
        for (id, client) in removed {
            debug!("Removed client {} ({})", client.seq(), id);
        }

        if self.core.direction == Direction::Capture
            && inner.clients.iter().any(|(_, client)| client.is_active())
        {
            inner.state = HubState::Running;
        }

        if !inner.clients.is_empty() {
            self.ensure_worker(&mut worker, &mut inner)?;
        }

        info!(
            "{} hub configured: {}, period {} frames",
            self.core.direction, format, period
        );
        drop(inner);
        self.wake();
        Ok(())
    }

    /// Attach a client given its data and control handles
    ///
    /// Both handles are switched to non-blocking mode and owned by the hub
    /// from then on.
    pub fn add_client<D, C>(&self, data: D, control: C) -> Result<ClientId>
    where
        D: ClientStream + 'static,
        C: ClientStream + 'static,
    {
        let mut worker = self.worker.lock();
        let mut inner = self.core.inner.lock();
        if inner.destroyed {
            return Err(HubError::Destroyed);
        }

        let max = self.core.config.max_clients;
        if inner.clients.len() >= max {
            return Err(HubError::CapacityExceeded { max });
        }

        data.set_nonblocking(true).map_err(HubError::ClientSetup)?;
        control.set_nonblocking(true).map_err(HubError::ClientSetup)?;

        inner.next_seq += 1;
        let mut client = ClientChannel::new(
            inner.next_seq,
            self.core.direction,
            Box::new(data),
            Box::new(control),
        );

        if let Some(format) = inner.format {
            client.init(&format, inner.period, &self.core.config)?;
            self.ensure_mix(&mut inner);
        }

        let seq = client.seq();
        let id = inner.clients.insert(client);
        inner.leave_finished();
        if self.core.direction == Direction::Capture
            && inner.state == HubState::Init
            && inner.clients.iter().any(|(_, client)| client.is_active())
        {
            inner.state = HubState::Running;
        }

        if let Err(e) = self.ensure_worker(&mut worker, &mut inner) {
            inner.clients.remove(id);
            return Err(e);
        }

        let count = inner.clients.len();
        if count == 1 {
            self.core.transport.request_open();
        }
        debug!("New client {} ({}), total clients now {}", seq, id, count);

        drop(inner);
        self.wake();
        Ok(id)
    }

    /// Detach a client
    ///
    /// Returns whether any client remains. Unknown ids are ignored.
    pub fn remove_client(&self, id: ClientId) -> bool {
        let mut inner = self.core.inner.lock();
        if let Some(client) = inner.clients.remove(id) {
            debug!(
                "Removed client {} ({}), total clients now {}",
                client.seq(),
                id,
                inner.clients.len()
            );
        }
        let remaining = !inner.clients.is_empty();
        drop(inner);
        self.wake();
        remaining
    }

    /// Notification handle for a client's own I/O thread
    pub fn notifier(&self, id: ClientId) -> ClientNotifier {
        ClientNotifier::new(id, self.core.events_tx.clone())
    }

    /// Hand captured audio to the clients (capture)
    ///
    /// Whole frames are queued for every running client; what does not fit
    /// in a slow client's buffer is dropped. Never blocks on client I/O.
    pub fn push(&self, data: &[u8]) {
        if self.core.direction != Direction::Capture {
            return;
        }

        let mut inner = self.core.inner.lock();
        if inner.state == HubState::Finished {
            if !inner.released {
                inner.released = true;
                self.core.transport.release();
            }
            return;
        }

        for (_, client) in inner.clients.iter_mut() {
            let dropped = client.enqueue(data);
            if dropped > 0 {
                warn!(
                    "Dropping PCM frames: client {} overrun ({} bytes)",
                    client.seq(),
                    dropped
                );
            }
        }

        drop(inner);
        self.wake();
    }

    /// Take mixed audio for the transport (playback)
    ///
    /// Waits for the worker to complete a refill cycle, then copies at most
    /// `out.len()` bytes of whole frames, scaled by the transport volume.
    pub fn pull(&self, out: &mut [u8]) -> Pull {
        if self.core.direction != Direction::Playback {
            return Pull::WouldBlock;
        }

        let mut inner = self.core.inner.lock();
        if let Some(pull) = inner.end_of_stream() {
            return pull;
        }

        if inner.worker_alive {
            let cycle = inner.cycle;
            self.wake();
            while inner.cycle == cycle && inner.worker_alive {
                self.core.cycle_done.wait(&mut inner);
            }
        }

        if let Some(pull) = inner.end_of_stream() {
            return pull;
        }
        if inner.state != HubState::Running {
            return Pull::WouldBlock;
        }

        let channels = inner.format.map_or(0, |format| format.channels as usize);
        let HubInner {
            state, clients, mix, ..
        } = &mut *inner;
        let Some(mix) = mix.as_mut() else {
            return Pull::WouldBlock;
        };

        if mix.is_empty() {
            // every running client failed to keep up
            debug!("Mix underrun");
            for (_, client) in clients.iter_mut() {
                client.underrun();
            }
            *state = HubState::Init;
            return Pull::WouldBlock;
        }

        let scales = self
            .core
            .transport
            .volume()
            .mix_scales(channels, self.core.config.native_volume);
        let frames = mix.read(out, &scales);
        trace!("Pulled {} frames, {} left", frames, mix.available());

        drop(inner);
        self.wake();
        Pull::Frames(frames)
    }

    /// Frames between a client write and the remote device (playback)
    pub fn delay_frames(&self) -> usize {
        let inner = self.core.inner.lock();
        match (self.core.direction, inner.mix.as_ref()) {
            (Direction::Playback, Some(mix)) => {
                mix.available() + self.core.config.client_threshold_periods * mix.period()
            }
            _ => 0,
        }
    }

    /// Frames the hub holds that have not reached their destination yet
    ///
    /// Playback: mixed frames not pulled by the transport. Capture: the
    /// largest number of frames still queued for any one client.
    pub fn backlog_frames(&self) -> usize {
        let inner = self.core.inner.lock();
        let Some(format) = inner.format else {
            return 0;
        };
        match self.core.direction {
            Direction::Playback => inner.mix.as_ref().map_or(0, |mix| mix.available()),
            Direction::Capture => inner
                .clients
                .iter()
                .map(|(_, client)| format.bytes_to_frames(client.pending()))
                .max()
                .unwrap_or(0),
        }
    }

    pub fn delay(&self) -> Duration {
        let frames = self.delay_frames();
        self.format()
            .map_or(Duration::ZERO, |format| format.frames_to_duration(frames))
    }

    /// Return to INIT: stop the worker and drop all clients
    pub fn reset(&self) {
        let mut worker = self.worker.lock();
        if self.core.inner.lock().destroyed {
            return;
        }
        self.stop_worker(&mut worker);

        let mut inner = self.core.inner.lock();
        let removed = inner.clients.clear();
        inner.mix = None;
        inner.state = HubState::Init;
        inner.end_reported = false;
        inner.released = false;
        info!(
            "{} hub reset, {} clients removed",
            self.core.direction,
            removed.len()
        );
    }

    /// Stop the worker and drop all clients for good
    ///
    /// Further clients are refused. Safe to call more than once.
    pub fn destroy(&self) {
        let mut worker = self.worker.lock();
        {
            let mut inner = self.core.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
        }
        self.stop_worker(&mut worker);

        let mut inner = self.core.inner.lock();
        inner.clients.clear();
        inner.mix = None;
        inner.state = HubState::Finished;
        info!("{} hub destroyed", self.core.direction);
    }

    fn wake(&self) {
        // a full queue already holds work for the worker
        let _ = self.core.events_tx.try_send(HubEvent::Wake);
    }

    fn ensure_mix(&self, inner: &mut HubInner) {
        if self.core.direction != Direction::Playback || inner.mix.is_some() {
            return;
        }
        if let Some(format) = inner.format {
            let config = &self.core.config;
            let period = inner.period;
            inner.mix = Some(MixBuffer::new(
                &format,
                config.buffer_periods * period,
                period,
                config.mix_threshold_periods * period,
            ));
        }
    }

    /// Start the worker unless it is running
    ///
    /// A worker that stopped after its last client left has released the
    /// lock for good, so it is joined here before its replacement starts.
    fn ensure_worker(
        &self,
        worker: &mut Option<JoinHandle<()>>,
        inner: &mut HubInner,
    ) -> Result<()> {
        if inner.worker_alive {
            return Ok(());
        }
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("{} worker thread panicked", self.core.direction);
            }
        }

        // events addressed to the previous worker
        while self.core.events.try_recv().is_ok() {}

        inner.terminate = false;
        inner.worker_alive = true;
        match event_loop::spawn(Arc::clone(&self.core)) {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Cannot create {} worker thread: {}", self.core.direction, e);
                inner.worker_alive = false;
                Err(HubError::Spawn(e))
            }
        }
    }

    fn stop_worker(&self, worker: &mut Option<JoinHandle<()>>) {
        let Some(handle) = worker.take() else {
            return;
        };
        self.core.inner.lock().terminate = true;
        let _ = self.core.events_tx.try_send(HubEvent::Terminate);
        if handle.join().is_err() {
            error!("{} worker thread panicked", self.core.direction);
        }
        self.core.inner.lock().worker_alive = false;
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.destroy();
    }
}
