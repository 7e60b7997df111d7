//! Hub worker thread: waits for events and runs mix/fan-out cycles

use super::client::{ClientChannel, ClientEvent};
use super::clients::{ClientId, ClientSet};
use super::mix_buffer::MixBuffer;
use super::{Direction, HubCore, HubInner, HubState};
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace};

/// Message on the hub event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEvent {
    /// New work: refill the mix or deliver captured frames
    Wake,
    /// Stop the worker
    Terminate,
    /// Readiness reported for one client
    Client { id: ClientId, event: ClientEvent },
}

/// Handle a client's I/O thread uses to signal the hub worker
///
/// The worker polls every client on each cycle, so notifications only make
/// it react sooner. They never block; a full queue already holds pending work.
#[derive(Clone)]
pub struct ClientNotifier {
    id: ClientId,
    tx: Sender<HubEvent>,
}

impl ClientNotifier {
    pub(super) fn new(id: ClientId, tx: Sender<HubEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The data handle is readable (playback) or writable (capture)
    pub fn data_ready(&self) {
        self.notify(ClientEvent::Data);
    }

    /// A command was written to the control handle
    pub fn control_ready(&self) {
        self.notify(ClientEvent::Control);
    }

    /// The application closed its end of a handle
    pub fn hangup(&self) {
        self.notify(ClientEvent::Hangup);
    }

    fn notify(&self, event: ClientEvent) {
        match self.tx.try_send(HubEvent::Client { id: self.id, event }) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                trace!("Hub gone, dropping {:?} for client {}", event, self.id);
            }
        }
    }
}

/// Why the worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Terminated,
    LastClient,
    Fault,
}

/// Start the worker thread of a hub
pub(super) fn spawn(core: Arc<HubCore>) -> io::Result<JoinHandle<()>> {
    let name = match core.direction {
        Direction::Playback => "pcmhub-mix",
        Direction::Capture => "pcmhub-snoop",
    };
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || worker_thread(core))
}

fn worker_thread(core: Arc<HubCore>) {
    info!("{} worker thread started", core.direction);
    let exit = run(&core);
    info!("{} worker thread stopped ({:?})", core.direction, exit);
}

fn run(core: &HubCore) -> Exit {
    // the core keeps a sender of its own, so the queue stays connected for
    // as long as the worker holds the core; a disconnect means the hub state
    // is broken and is handled as a fault
    loop {
        let deadline = core.inner.lock().next_deadline();
        let first = match deadline {
            Some(deadline) => match core.events.recv_deadline(deadline) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return fault(core),
            },
            None => match core.events.recv() {
                Ok(event) => Some(event),
                Err(_) => return fault(core),
            },
        };

        let mut inner = core.inner.lock();
        let mut terminate = inner.terminate;
        for event in first.into_iter().chain(core.events.try_iter()) {
            match event {
                HubEvent::Wake => {}
                HubEvent::Terminate => terminate = true,
                HubEvent::Client { id, event } => inner.client_event(id, event),
            }
        }

        if terminate {
            shut_down(core, &mut inner, Exit::Terminated);
            return Exit::Terminated;
        }

        if !cycle(core, &mut inner) {
            shut_down(core, &mut inner, Exit::LastClient);
            return Exit::LastClient;
        }
    }
}

fn fault(core: &HubCore) -> Exit {
    error!("{} hub event queue disconnected", core.direction);
    let mut inner = core.inner.lock();
    shut_down(core, &mut inner, Exit::Fault);
    Exit::Fault
}

/// Leave the hub finished and let everybody waiting on it know
fn shut_down(core: &HubCore, inner: &mut HubInner, exit: Exit) {
    inner.state = HubState::Finished;
    if let Some(mix) = inner.mix.as_mut() {
        mix.clear();
    }
    inner.worker_alive = false;
    if exit == Exit::LastClient {
        core.transport.request_close();
    }
    core.transport.wake();
    core.cycle_done.notify_all();
}

/// Run one cycle over all clients
///
/// Returns false once no client is left.
fn cycle(core: &HubCore, inner: &mut HubInner) -> bool {
    let now = Instant::now();

    for (_, client) in inner.clients.iter_mut() {
        client.poll_control(inner.mix.as_ref());
        client.check_timer(now);
    }

    match core.direction {
        Direction::Playback => {
            if let Some(mix) = inner.mix.as_mut() {
                refill(&mut inner.clients, mix);
                let timeout = core.config.drain_timeout();
                for (_, client) in inner.clients.iter_mut() {
                    client.check_drain(mix, now, timeout);
                }
            }
        }
        Direction::Capture => {
            for (_, client) in inner.clients.iter_mut() {
                client.deliver();
            }
        }
    }

    let removed = inner.clients.retain(|_, client| !client.is_finished());
    for (id, client) in removed {
        debug!(
            "Removed client {} ({}), total clients now {}",
            client.seq(),
            id,
            inner.clients.len()
        );
    }

    if inner.clients.is_empty() {
        return false;
    }

    match core.direction {
        Direction::Playback => update_playback(core, inner),
        Direction::Capture => update_capture(core, inner),
    }

    inner.cycle += 1;
    core.cycle_done.notify_all();
    true
}

/// Move client data into the mix until no client makes progress
///
/// Clients that start running within one round all begin at the same mix
/// position, so streams started together stay sample aligned.
fn refill(clients: &mut ClientSet<ClientChannel>, mix: &mut MixBuffer) {
    loop {
        let start = mix.write_position();
        let mut progress = false;
        for (_, client) in clients.iter_mut() {
            progress |= client.fetch(start);
        }
        for (_, client) in clients.iter_mut() {
            progress |= client.mix_into(mix);
        }
        if !progress {
            break;
        }
    }
    trace!("Mix refilled: {} frames available", mix.available());
}

fn update_playback(core: &HubCore, inner: &mut HubInner) {
    let Some(mix) = inner.mix.as_mut() else {
        return;
    };

    if inner.clients.len() == 1 {
        if let Some((_, client)) = inner.clients.iter_mut().next() {
            if client.take_drop() {
                debug!("Only client {} dropped its stream", client.seq());
                mix.clear();
                inner.state = HubState::Init;
                core.transport.request_drop();
                return;
            }
        }
    }

    let active = inner.clients.iter().any(|(_, client)| client.is_active());
    let draining = inner.clients.iter().any(|(_, client)| client.is_draining());

    match inner.state {
        HubState::Init => {
            if (active && mix.at_threshold()) || (draining && !mix.is_empty()) {
                debug!(
                    "Mix running with {} frames (threshold {})",
                    mix.available(),
                    mix.threshold()
                );
                inner.state = HubState::Running;
                core.transport.wake();
            }
        }
        HubState::Running => {
            // a drain plays out the tail below the threshold
            if !mix.at_threshold() && !draining {
                debug!("Mix below threshold, buffering");
                inner.state = HubState::Init;
            } else {
                core.transport.wake();
            }
        }
        _ => {}
    }
}

fn update_capture(core: &HubCore, inner: &mut HubInner) {
    let running = inner
        .clients
        .iter()
        .filter(|(_, client)| client.is_active())
        .count();

    match inner.state {
        HubState::Init if running > 0 => inner.state = HubState::Running,
        HubState::Running if running == 0 => {
            debug!("No active capture client, pausing");
            inner.state = HubState::Paused;
            core.transport.request_pause();
        }
        HubState::Paused if running > 0 => {
            debug!("Capture client active again, resuming");
            inner.state = HubState::Running;
            core.transport.request_resume();
        }
        _ => {}
    }
}
