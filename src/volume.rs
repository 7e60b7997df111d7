//! Per-channel volume state read by the hub when producing the mix

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Loudness of one channel
///
/// The level is stored in units of 0.01 dB (0 = unity gain, -600 = -6 dB),
/// with atomics so the control plane can update it while the transport
/// thread reads it.
pub struct ChannelVolume {
    level: AtomicI32,
    muted: AtomicBool,
}

impl ChannelVolume {
    /// Create with unity gain, unmuted
    pub fn new() -> Self {
        Self {
            level: AtomicI32::new(0),
            muted: AtomicBool::new(false),
        }
    }

    /// Get current level in 0.01 dB units
    pub fn level(&self) -> i32 {
        self.level.load(Ordering::Relaxed)
    }

    /// Set level in 0.01 dB units
    pub fn set_level(&self, level: i32) {
        self.level.store(level, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Linear scale factor: 0 when muted, otherwise 10^(level dB / 20)
    pub fn scale(&self) -> f64 {
        level_to_scale(self.level(), self.is_muted())
    }
}

impl Default for ChannelVolume {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a level in 0.01 dB units to a linear amplitude factor
#[inline]
pub fn level_to_scale(level: i32, muted: bool) -> f64 {
    if muted {
        0.0
    } else {
        10f64.powf((0.01 * level as f64) / 20.0)
    }
}

/// Volume of every channel of a transport stream
pub struct Volume {
    channels: Vec<ChannelVolume>,
    /// Apply the level in software; otherwise the remote device applies it
    soft_volume: AtomicBool,
}

impl Volume {
    /// Create unity-gain volume for the given channel count
    pub fn new(channels: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| ChannelVolume::new()).collect(),
            soft_volume: AtomicBool::new(true),
        }
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelVolume> {
        self.channels.get(index)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_soft_volume(&self) -> bool {
        self.soft_volume.load(Ordering::Relaxed)
    }

    pub fn set_soft_volume(&self, enabled: bool) {
        self.soft_volume.store(enabled, Ordering::Relaxed);
    }

    /// Set the same level on all channels
    pub fn set_level(&self, level: i32) {
        for channel in &self.channels {
            channel.set_level(level);
        }
    }

    /// Mute or unmute all channels
    pub fn set_muted(&self, muted: bool) {
        for channel in &self.channels {
            channel.set_muted(muted);
        }
    }

    /// Scale factors to apply to the mix, one per stream channel
    ///
    /// With software volume each channel gets its own level. In pass-through
    /// mode the remote device applies the level, so only mute is honored and
    /// otherwise the configured `native` attenuation is used. Channels the
    /// volume does not describe play at unity (or `native`).
    pub fn mix_scales(&self, stream_channels: usize, native: f64) -> Vec<f64> {
        let soft = self.is_soft_volume();
        (0..stream_channels)
            .map(|i| match self.channels.get(i) {
                Some(channel) if soft => channel.scale(),
                Some(channel) if channel.is_muted() => 0.0,
                Some(_) => native,
                None if soft => 1.0,
                None => native,
            })
            .collect()
    }
}
