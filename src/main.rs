//! pcmhub - multi-client PCM hub CLI

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use pcmhub::config::{Args, Command, HubConfig, Settings, StreamArgs};
use pcmhub::{ClientNotifier, Direction, Hub, HubState, Pull, SignalTransport, Transport};

/// Time allowed for capture clients to take their queued frames at the end
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let args = Args::parse();

    let settings = load_settings(&args)?;

    // Initialize logging
    init_logging(&args, &settings)?;

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Cannot install Ctrl+C handler: {}", e);
    }

    // Execute command
    match args.command {
        Command::Mix {
            inputs,
            output,
            stream,
        } => cmd_mix(&inputs, &output, &stream, settings.hub, &running),
        Command::Split {
            input,
            outputs,
            stream,
        } => cmd_split(&input, &outputs, &stream, settings.hub, &running),
    }
}

fn load_settings(args: &Args) -> Result<Settings> {
    match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Settings::load_default().context("Failed to load default settings"),
    }
}

fn init_logging(args: &Args, settings: &Settings) -> Result<()> {
    // command line flags win over the settings file
    let level = if args.verbose > 0 || args.quiet {
        args.log_level().to_string()
    } else {
        settings.log_level.clone()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = args.log.clone().or_else(|| {
        (!settings.log_file.is_empty()).then(|| PathBuf::from(&settings.log_file))
    });

    if let Some(log_file) = log_file {
        let file = File::create(&log_file)
            .with_context(|| format!("Failed to create log file {}", log_file.display()))?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

fn hub_config(mut config: HubConfig, stream: &StreamArgs) -> HubConfig {
    if stream.period_frames.is_some() {
        config.period_frames = stream.period_frames;
    }
    config
}

/// Mix raw PCM files, one playback client per file
fn cmd_mix(
    inputs: &[PathBuf],
    output: &Path,
    stream: &StreamArgs,
    config: HubConfig,
    running: &AtomicBool,
) -> Result<()> {
    let format = stream.pcm_format();
    let (transport, signals) = SignalTransport::new(format.channels as usize);
    let transport = Arc::new(transport);
    let hub = Hub::new(Direction::Playback, hub_config(config, stream), transport.clone())?;
    hub.configure(format)?;

    let period_frames = hub.period_frames();
    let period = format.frames_to_duration(period_frames);
    let chunk = format.frames_to_bytes(period_frames);
    info!("Mixing {} inputs as {}", inputs.len(), format);

    let mut clients = Vec::new();
    for path in inputs {
        let (data, data_peer) = UnixStream::pair()?;
        let (control, control_peer) = UnixStream::pair()?;
        let id = hub
            .add_client(data, control)
            .with_context(|| format!("Failed to add client for {}", path.display()))?;
        let notifier = hub.notifier(id);
        let path = path.clone();
        clients.push(thread::spawn(move || {
            playback_client(&path, data_peer, control_peer, notifier, chunk)
                .with_context(|| format!("Playback client for {} failed", path.display()))
        }));
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut out = BufWriter::new(file);
    let mut buf = vec![0u8; chunk];
    let mut frames_out = 0usize;

    loop {
        if !running.load(Ordering::SeqCst) {
            hub.destroy();
            break;
        }

        match hub.pull(&mut buf) {
            Pull::Frames(frames) => {
                out.write_all(&buf[..format.frames_to_bytes(frames)])?;
                frames_out += frames;
                if stream.realtime {
                    thread::sleep(period);
                }
            }
            Pull::WouldBlock => {
                if let Ok(signal) = signals.recv_timeout(period) {
                    trace!("Transport signal: {:?}", signal);
                }
            }
            Pull::EndOfStream => {
                info!("All clients finished");
                transport.release();
                break;
            }
        }
    }

    out.flush()?;
    join_clients(clients);
    println!(
        "Mixed {} frames ({:.2}s) into {}",
        frames_out,
        format.frames_to_duration(frames_out).as_secs_f64(),
        output.display()
    );
    Ok(())
}

/// Feed one file to the hub the way an application would, then drain
fn playback_client(
    path: &Path,
    mut data: UnixStream,
    mut control: UnixStream,
    notifier: ClientNotifier,
    chunk: usize,
) -> Result<usize> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; chunk];
    let mut written = 0;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        data.write_all(&buf[..n])?;
        notifier.data_ready();
        written += n;
    }

    control.write_all(b"Drain")?;
    notifier.control_ready();
    let mut reply = [0u8; 16];
    let n = control.read(&mut reply)?;
    debug!(
        "{}: drain reply {}",
        path.display(),
        String::from_utf8_lossy(&reply[..n])
    );

    drop(data);
    drop(control);
    notifier.hangup();
    Ok(written)
}

/// Copy one raw PCM file to several files, one capture client per file
fn cmd_split(
    input: &Path,
    outputs: &[PathBuf],
    stream: &StreamArgs,
    config: HubConfig,
    running: &AtomicBool,
) -> Result<()> {
    let format = stream.pcm_format();
    let (transport, signals) = SignalTransport::new(format.channels as usize);
    let buffer_periods = config.buffer_periods;
    let hub = Hub::new(Direction::Capture, hub_config(config, stream), Arc::new(transport))?;
    hub.configure(format)?;

    let period_frames = hub.period_frames();
    let period = format.frames_to_duration(period_frames);
    let poll = period / 4;
    // keep clear of the point where slow clients lose frames
    let high_water = buffer_periods * period_frames / 2;
    info!("Splitting {} to {} outputs", format, outputs.len());

    let mut clients = Vec::new();
    for path in outputs {
        let (data, data_peer) = UnixStream::pair()?;
        let (control, control_peer) = UnixStream::pair()?;
        let id = hub
            .add_client(data, control)
            .with_context(|| format!("Failed to add client for {}", path.display()))?;
        let notifier = hub.notifier(id);
        let path = path.clone();
        clients.push(thread::spawn(move || {
            capture_client(&path, data_peer, control_peer, notifier)
                .with_context(|| format!("Capture client for {} failed", path.display()))
        }));
    }

    let mut file =
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let mut buf = vec![0u8; format.frames_to_bytes(period_frames)];
    let mut frames_in = 0usize;

    while running.load(Ordering::SeqCst) {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        hub.push(&buf[..n]);
        frames_in += format.bytes_to_frames(n);

        for signal in signals.try_iter() {
            debug!("Transport signal: {:?}", signal);
        }
        if hub.state() == HubState::Finished {
            warn!("All capture clients left");
            break;
        }

        if stream.realtime {
            thread::sleep(period);
        } else {
            while hub.backlog_frames() > high_water && running.load(Ordering::SeqCst) {
                thread::sleep(poll);
            }
        }
    }

    let deadline = Instant::now() + FLUSH_TIMEOUT;
    while hub.backlog_frames() > 0 && Instant::now() < deadline {
        thread::sleep(poll);
    }
    if hub.backlog_frames() > 0 {
        warn!("Clients did not take all frames before shutdown");
    }

    hub.destroy();
    join_clients(clients);
    println!("Split {} frames to {} outputs", frames_in, outputs.len());
    Ok(())
}

/// Write everything the hub delivers to a file until the hub closes the stream
fn capture_client(
    path: &Path,
    mut data: UnixStream,
    control: UnixStream,
    notifier: ClientNotifier,
) -> Result<usize> {
    let mut file = BufWriter::new(File::create(path)?);
    let mut buf = vec![0u8; 4096];
    let mut received = 0;

    loop {
        let n = match data.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        file.write_all(&buf[..n])?;
        received += n;
        notifier.data_ready();
    }

    file.flush()?;
    drop(control);
    Ok(received)
}

/// Read until the buffer is full or the input ends
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn join_clients(clients: Vec<JoinHandle<Result<usize>>>) {
    for handle in clients {
        match handle.join() {
            Ok(Ok(bytes)) => debug!("Client moved {} bytes", bytes),
            Ok(Err(e)) => error!("{:#}", e),
            Err(_) => error!("Client thread panicked"),
        }
    }
}
