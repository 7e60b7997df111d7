//! Ring buffer summing the contributions of playback clients

use crate::format::{PcmFormat, SampleFormat};

/// Fixed-capacity ring of summed frames
///
/// Positions are absolute frame counters that only ever grow; the ring slot
/// of a frame is its position modulo the capacity. Each playback client keeps
/// its own write position and adds its samples on top of whatever other
/// clients already put there. The transport reads from a single read
/// position, which zeroes the slots it consumes.
///
/// Samples are accumulated as `i64` whatever the stream format, so the sum
/// of any number of clients cannot overflow; saturation happens once, when a
/// frame is narrowed back to the stream format on read.
pub struct MixBuffer {
    format: SampleFormat,
    channels: usize,
    frame_size: usize,
    data: Box<[i64]>,
    /// Capacity in frames
    capacity: usize,
    /// Frames moved per transport period
    period: usize,
    /// Frames accumulated before playback starts, also the furthest any
    /// client may write ahead of the read position
    threshold: usize,
    /// Position of the next frame to read
    read_pos: u64,
    /// Position after the furthest frame written by any client
    end_pos: u64,
}

impl MixBuffer {
    /// Create a mix buffer
    ///
    /// `capacity`, `period` and `threshold` are in frames; the threshold is
    /// clamped below the capacity so that writers can never wrap onto
    /// unread frames.
    pub fn new(format: &PcmFormat, capacity: usize, period: usize, threshold: usize) -> Self {
        let channels = format.channels as usize;
        let capacity = capacity.max(2);
        Self {
            format: format.sample_format,
            channels,
            frame_size: format.frame_size(),
            data: vec![0i64; capacity * channels].into_boxed_slice(),
            capacity,
            period,
            threshold: threshold.clamp(1, capacity - 1),
            read_pos: 0,
            end_pos: 0,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Frames ready to be read
    pub fn available(&self) -> usize {
        (self.end_pos - self.read_pos) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end_pos == self.read_pos
    }

    /// True once enough frames are buffered to start (or keep) playing
    pub fn at_threshold(&self) -> bool {
        self.available() >= self.threshold
    }

    /// Position of the next frame to be read
    pub fn read_position(&self) -> u64 {
        self.read_pos
    }

    /// Position after the last summed frame
    pub fn write_position(&self) -> u64 {
        self.end_pos
    }

    /// Frames between the read position and `position`
    pub fn delay_to(&self, position: u64) -> usize {
        position.saturating_sub(self.read_pos) as usize
    }

    /// Add a client's samples into the mix at its position
    ///
    /// Only whole frames are taken. A position that fell behind the read
    /// position is moved up to it. Nothing is written more than `threshold`
    /// frames ahead of the read position, which keeps all clients closely
    /// aligned. Returns the number of bytes consumed; `position` is advanced
    /// past the frames added.
    pub fn mix_in(&mut self, data: &[u8], position: &mut u64) -> usize {
        if *position < self.read_pos {
            *position = self.read_pos;
        }

        let limit = self.read_pos + self.threshold as u64;
        if *position >= limit {
            return 0;
        }

        let frames = (data.len() / self.frame_size).min((limit - *position) as usize);
        let sample_bytes = self.format.bytes();

        for (i, frame) in data.chunks_exact(self.frame_size).take(frames).enumerate() {
            let slot = ((*position + i as u64) % self.capacity as u64) as usize * self.channels;
            for (acc, sample) in self.data[slot..slot + self.channels]
                .iter_mut()
                .zip(frame.chunks_exact(sample_bytes))
            {
                *acc = acc.saturating_add(self.format.decode(sample));
            }
        }

        *position += frames as u64;
        if *position > self.end_pos {
            self.end_pos = *position;
        }

        frames * self.frame_size
    }

    /// Read mixed frames, applying a scale factor per channel
    ///
    /// Reads as many whole frames as fit in `out` and are available. Scaled
    /// values are truncated toward zero and saturated to the stream format.
    /// Channels without a scale factor play at unity. Returns the number of
    /// frames read.
    pub fn read(&mut self, out: &mut [u8], scale: &[f64]) -> usize {
        let frames = (out.len() / self.frame_size).min(self.available());
        let sample_bytes = self.format.bytes();

        for (i, frame) in out.chunks_exact_mut(self.frame_size).take(frames).enumerate() {
            let slot = ((self.read_pos + i as u64) % self.capacity as u64) as usize * self.channels;
            for (ch, (acc, sample)) in self.data[slot..slot + self.channels]
                .iter_mut()
                .zip(frame.chunks_exact_mut(sample_bytes))
                .enumerate()
            {
                let factor = scale.get(ch).copied().unwrap_or(1.0);
                let value = if factor == 0.0 {
                    0
                } else if factor == 1.0 {
                    *acc
                } else {
                    (*acc as f64 * factor) as i64
                };
                self.format.encode(value, sample);
                *acc = 0;
            }
        }

        self.read_pos += frames as u64;
        frames
    }

    /// Discard all frames
    ///
    /// The read position jumps to the write position, so every client
    /// position is behind it and is realigned on the next `mix_in`.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.read_pos = self.end_pos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_s16() -> PcmFormat {
        PcmFormat::new(SampleFormat::S16Le, 2, 48000)
    }

    fn constant_s16(value: i16, frames: usize) -> Vec<u8> {
        (0..frames * 2).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn samples_s16(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_contributions_are_summed() {
        let mut mix = MixBuffer::new(&stereo_s16(), 1600, 100, 400);
        let mut a = 0;
        let mut b = 0;
        let mut c = 0;

        assert_eq!(mix.mix_in(&constant_s16(1000, 100), &mut a), 400);
        assert_eq!(mix.mix_in(&constant_s16(-300, 100), &mut b), 400);
        assert_eq!(mix.mix_in(&constant_s16(7, 50), &mut c), 200);
        assert_eq!(mix.available(), 100);

        let mut out = vec![0u8; 400];
        assert_eq!(mix.read(&mut out, &[1.0, 1.0]), 100);
        let samples = samples_s16(&out);
        assert!(samples[..100].iter().all(|&s| s == 707));
        assert!(samples[100..].iter().all(|&s| s == 700));
        assert!(mix.is_empty());
    }

    #[test]
    fn test_sum_saturates_on_read_only() {
        let mut mix = MixBuffer::new(&stereo_s16(), 64, 8, 16);
        let mut a = 0;
        let mut b = 0;
        let mut c = 0;
        mix.mix_in(&constant_s16(30000, 4), &mut a);
        mix.mix_in(&constant_s16(30000, 4), &mut b);
        mix.mix_in(&constant_s16(-30000, 4), &mut c);

        // the intermediate 60000 does not clip the final sum
        let mut out = vec![0u8; 16];
        mix.read(&mut out, &[1.0, 1.0]);
        assert!(samples_s16(&out).iter().all(|&s| s == 30000));

        let mut a = mix.write_position();
        let mut b = a;
        mix.mix_in(&constant_s16(30000, 4), &mut a);
        mix.mix_in(&constant_s16(30000, 4), &mut b);
        mix.read(&mut out, &[1.0, 1.0]);
        assert!(samples_s16(&out).iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn test_scale_is_per_channel() {
        let mut mix = MixBuffer::new(&stereo_s16(), 64, 8, 16);
        let mut pos = 0;
        mix.mix_in(&constant_s16(10000, 8), &mut pos);

        let scale = [0.5011872336272722, 0.0];
        let mut out = vec![0u8; 32];
        assert_eq!(mix.read(&mut out, &scale), 8);
        let samples = samples_s16(&out);
        for frame in samples.chunks_exact(2) {
            assert_eq!(frame[0], (10000.0 * scale[0]) as i16);
            assert_eq!(frame[1], 0);
        }
    }

    #[test]
    fn test_clients_cannot_run_ahead_of_threshold() {
        let mut mix = MixBuffer::new(&stereo_s16(), 64, 4, 8);
        let mut pos = 0;
        assert_eq!(mix.mix_in(&constant_s16(1, 12), &mut pos), 8 * 4);
        assert_eq!(pos, 8);
        assert!(mix.at_threshold());
        assert_eq!(mix.mix_in(&constant_s16(1, 4), &mut pos), 0);

        let mut out = vec![0u8; 16];
        mix.read(&mut out, &[]);
        assert_eq!(mix.available(), 4);
        assert!(!mix.at_threshold());
        assert_eq!(mix.mix_in(&constant_s16(1, 12), &mut pos), 4 * 4);
    }

    #[test]
    fn test_wraps_around_capacity() {
        let mut mix = MixBuffer::new(&stereo_s16(), 8, 4, 6);
        let mut pos = 0;
        let mut out = vec![0u8; 16];

        for round in 0..10i16 {
            assert_eq!(mix.mix_in(&constant_s16(round, 4), &mut pos), 16);
            assert_eq!(mix.read(&mut out, &[1.0, 1.0]), 4);
            assert!(samples_s16(&out).iter().all(|&s| s == round));
        }
        assert_eq!(mix.read_position(), 40);
    }

    #[test]
    fn test_lagging_client_is_realigned() {
        let mut mix = MixBuffer::new(&stereo_s16(), 32, 4, 8);
        let mut fast = 0;
        let mut slow = 0;
        mix.mix_in(&constant_s16(1, 8), &mut fast);
        let mut out = vec![0u8; 32 * 4];
        mix.read(&mut out, &[]);

        mix.mix_in(&constant_s16(2, 4), &mut slow);
        assert_eq!(slow, 12);
        assert_eq!(mix.delay_to(slow), 4);
    }

    #[test]
    fn test_clear_discards_content() {
        let mut mix = MixBuffer::new(&stereo_s16(), 32, 4, 8);
        let mut pos = 0;
        mix.mix_in(&constant_s16(5, 6), &mut pos);
        mix.clear();
        assert!(mix.is_empty());

        mix.mix_in(&constant_s16(3, 2), &mut pos);
        let mut out = vec![0u8; 8];
        assert_eq!(mix.read(&mut out, &[1.0, 1.0]), 2);
        assert!(samples_s16(&out).iter().all(|&s| s == 3));
    }

    #[test]
    fn test_u8_and_s24_accumulate() {
        let format = PcmFormat::new(SampleFormat::U8, 1, 8000);
        let mut mix = MixBuffer::new(&format, 16, 2, 4);
        let mut a = 0;
        let mut b = 0;
        mix.mix_in(&[0x90, 0x70], &mut a);
        mix.mix_in(&[0x90, 0x90], &mut b);
        let mut out = [0u8; 2];
        mix.read(&mut out, &[1.0]);
        assert_eq!(out, [0xA0, 0x80]);

        let format = PcmFormat::new(SampleFormat::S24Le, 1, 8000);
        let mut mix = MixBuffer::new(&format, 16, 2, 4);
        let mut a = 0;
        let mut b = 0;
        mix.mix_in(&0x0060_0000u32.to_le_bytes(), &mut a);
        mix.mix_in(&0x0060_0000u32.to_le_bytes(), &mut b);
        let mut out = [0u8; 4];
        mix.read(&mut out, &[1.0]);
        assert_eq!(u32::from_le_bytes(out), 0x007F_FFFF);
    }
}
