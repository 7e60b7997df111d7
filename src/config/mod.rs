//! Configuration: CLI arguments and the settings file

mod args;
mod hub;

pub use args::{Args, Command, FormatArg, StreamArgs};
pub use hub::{HubConfig, Settings};
