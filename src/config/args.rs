//! CLI argument parsing using clap

use crate::format::{PcmFormat, SampleFormat};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// pcmhub - multi-client PCM hub
///
/// Runs a hub end to end over raw PCM files: the command plays the role of
/// the Bluetooth transport thread and of every client application.
#[derive(Parser, Debug)]
#[command(name = "pcmhub")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Settings file (default: <config dir>/pcmhub/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mix several raw PCM files into one, each file acting as a playback client
    Mix {
        /// Input files, one client per file
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// File receiving the mixed stream
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Fan one raw PCM file out to several files, each acting as a capture client
    Split {
        /// File providing the captured stream
        #[arg(short, long)]
        input: PathBuf,

        /// Output files, one client per file
        #[arg(required = true)]
        outputs: Vec<PathBuf>,

        #[command(flatten)]
        stream: StreamArgs,
    },
}

/// Stream format options shared by all commands
#[derive(ClapArgs, Debug, Clone)]
pub struct StreamArgs {
    /// Sample format
    #[arg(short, long, value_enum, default_value = "s16le")]
    pub format: FormatArg,

    /// Number of channels
    #[arg(long, default_value = "2")]
    pub channels: u16,

    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000")]
    pub rate: u32,

    /// Period length in frames (overrides the settings file)
    #[arg(long)]
    pub period_frames: Option<usize>,

    /// Pace the transport in real time instead of running as fast as possible
    #[arg(long)]
    pub realtime: bool,
}

impl StreamArgs {
    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat::new(self.format.into(), self.channels, self.rate)
    }
}

/// Sample format names accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    U8,
    S16le,
    S24le,
    S32le,
}

impl From<FormatArg> for SampleFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::U8 => SampleFormat::U8,
            FormatArg::S16le => SampleFormat::S16Le,
            FormatArg::S24le => SampleFormat::S24Le,
            FormatArg::S32le => SampleFormat::S32Le,
        }
    }
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mix() {
        let args = Args::parse_from([
            "pcmhub", "-v", "mix", "-o", "out.raw", "a.raw", "b.raw", "--rate", "44100",
        ]);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
        match args.command {
            Command::Mix {
                inputs,
                output,
                stream,
            } => {
                assert_eq!(inputs.len(), 2);
                assert_eq!(output, PathBuf::from("out.raw"));
                assert_eq!(
                    stream.pcm_format(),
                    PcmFormat::new(SampleFormat::S16Le, 2, 44100)
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_split() {
        let args = Args::parse_from([
            "pcmhub", "-q", "split", "-i", "in.raw", "x.raw", "--format", "s24le",
        ]);
        assert_eq!(args.log_level(), tracing::Level::ERROR);
        match args.command {
            Command::Split { outputs, stream, .. } => {
                assert_eq!(outputs, vec![PathBuf::from("x.raw")]);
                assert_eq!(stream.format, FormatArg::S24le);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
