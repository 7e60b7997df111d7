//! PCM stream format shared between the transport and its clients

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample encodings accepted by the hub
///
/// All encodings are little-endian and interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8-bit, silence at 0x80
    U8,
    /// Signed 16-bit
    S16Le,
    /// Signed 24-bit stored in the low bytes of a 32-bit word
    S24Le,
    /// Signed 32-bit
    S32Le,
}

impl SampleFormat {
    /// Bytes occupied by one sample
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le | SampleFormat::S32Le => 4,
        }
    }

    /// Smallest representable sample value
    pub fn min_value(self) -> i64 {
        match self {
            SampleFormat::U8 => i8::MIN as i64,
            SampleFormat::S16Le => i16::MIN as i64,
            SampleFormat::S24Le => -0x80_0000,
            SampleFormat::S32Le => i32::MIN as i64,
        }
    }

    /// Largest representable sample value
    pub fn max_value(self) -> i64 {
        match self {
            SampleFormat::U8 => i8::MAX as i64,
            SampleFormat::S16Le => i16::MAX as i64,
            SampleFormat::S24Le => 0x7F_FFFF,
            SampleFormat::S32Le => i32::MAX as i64,
        }
    }

    /// Decode one sample into a signed value centered on zero
    #[inline]
    pub fn decode(self, bytes: &[u8]) -> i64 {
        match self {
            SampleFormat::U8 => bytes[0] as i64 - 0x80,
            SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            SampleFormat::S24Le => {
                let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                // sign-extend from bit 23, ignoring the padding byte
                (((raw << 8) as i32) >> 8) as i64
            }
            SampleFormat::S32Le => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
            }
        }
    }

    /// Encode a value, saturating to the representable range
    #[inline]
    pub fn encode(self, value: i64, out: &mut [u8]) {
        let value = value.clamp(self.min_value(), self.max_value());
        match self {
            SampleFormat::U8 => out[0] = (value + 0x80) as u8,
            SampleFormat::S16Le => out[..2].copy_from_slice(&(value as i16).to_le_bytes()),
            SampleFormat::S24Le => {
                let raw = (value as i32 as u32) & 0x00FF_FFFF;
                out[..4].copy_from_slice(&raw.to_le_bytes());
            }
            SampleFormat::S32Le => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleFormat::U8 => "U8",
            SampleFormat::S16Le => "S16_LE",
            SampleFormat::S24Le => "S24_4LE",
            SampleFormat::S32Le => "S32_LE",
        };
        f.write_str(name)
    }
}

/// Interleaved PCM stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmFormat {
    pub fn new(sample_format: SampleFormat, channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_format,
            channels,
            sample_rate,
        }
    }

    /// Reject formats the hub cannot carry
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(HubError::InvalidConfig("channel count must be > 0".into()));
        }
        if self.sample_rate == 0 {
            return Err(HubError::InvalidConfig("sample rate must be > 0".into()));
        }
        Ok(())
    }

    /// Bytes per frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.sample_format.bytes() * self.channels as usize
    }

    /// Number of frames covering the given milliseconds
    pub fn frames_for_ms(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize
    }

    /// Calculate number of whole frames in given bytes
    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        bytes / self.frame_size()
    }

    /// Calculate bytes for given number of frames
    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.frame_size()
    }

    /// Playback time of the given number of frames
    pub fn frames_to_duration(&self, frames: usize) -> Duration {
        Duration::from_micros(frames as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}ch {}Hz",
            self.sample_format, self.channels, self.sample_rate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_math() {
        let format = PcmFormat::new(SampleFormat::S16Le, 2, 48000);
        assert_eq!(format.frame_size(), 4);
        assert_eq!(format.frames_for_ms(20), 960);
        assert_eq!(format.bytes_to_frames(3842), 960);
        assert_eq!(format.frames_to_duration(480), Duration::from_millis(10));
    }

    #[test]
    fn test_s24_sign_extension() {
        let mut buf = [0u8; 4];
        SampleFormat::S24Le.encode(-2, &mut buf);
        assert_eq!(buf, [0xFE, 0xFF, 0xFF, 0x00]);
        assert_eq!(SampleFormat::S24Le.decode(&buf), -2);

        SampleFormat::S24Le.encode(10_000_000, &mut buf);
        assert_eq!(SampleFormat::S24Le.decode(&buf), 0x7F_FFFF);
    }

    #[test]
    fn test_u8_is_offset_binary() {
        assert_eq!(SampleFormat::U8.decode(&[0x80]), 0);
        let mut buf = [0u8; 1];
        SampleFormat::U8.encode(-300, &mut buf);
        assert_eq!(buf[0], 0);
        SampleFormat::U8.encode(5, &mut buf);
        assert_eq!(buf[0], 0x85);
    }

    #[test]
    fn test_validate() {
        assert!(PcmFormat::new(SampleFormat::S16Le, 0, 48000).validate().is_err());
        assert!(PcmFormat::new(SampleFormat::S16Le, 2, 0).validate().is_err());
        assert!(PcmFormat::new(SampleFormat::S32Le, 1, 16000).validate().is_ok());
    }
}
