//! pcmhub - multi-client PCM hub
//!
//! Lets many local applications share the single audio stream of one
//! Bluetooth transport endpoint: playback clients are mixed into one stream,
//! captured audio is copied to every capture client.

pub mod config;
pub mod error;
pub mod format;
pub mod hub;
pub mod transport;
pub mod volume;

pub use error::{HubError, Result};
pub use format::{PcmFormat, SampleFormat};
pub use hub::{ClientId, ClientNotifier, Direction, Hub, HubState, Pull};
pub use transport::{ClientStream, SignalTransport, Transport, TransportSignal};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
