//! Pitch-preserving time stretch (Sonic algorithm).
//!
//! Speed changes work on whole pitch periods. The period of the incoming
//! signal is estimated with an average magnitude difference function (AMDF)
//! between 65 Hz and 400 Hz. To speed up, one period is dropped and the two
//! neighbours are cross-faded; to slow down, one period is repeated with a
//! cross-fade. Between those splices input is copied through unchanged so the
//! average ratio matches the requested speed.
//!
//! Samples are interleaved signed 16-bit PCM. A "frame" is one sample per
//! channel.

use speedplay_core::clamp_speed;
use tracing::trace;

/// Lowest pitch detected, in Hz.
const MIN_PITCH_HZ: u32 = 65;
/// Highest pitch detected, in Hz.
const MAX_PITCH_HZ: u32 = 400;
/// Pitch detection runs on input down-sampled to about this rate.
const AMDF_FREQ_HZ: u32 = 4000;

/// Streaming time-stretch transform.
pub struct TimeStretch {
    sample_rate: u32,
    channels: usize,
    speed: f32,
    pitch: f32,
    min_period: usize,
    max_period: usize,
    /// Frames needed in the input before one period can be processed.
    max_required: usize,
    input: Vec<i16>,
    output: Vec<i16>,
    /// Tempo-adjusted frames waiting for the rate (pitch) stage.
    pitch_buffer: Vec<i16>,
    down_sampled: Vec<i16>,
    remaining_input_to_copy: usize,
    prev_period: usize,
    prev_min_diff: u64,
    old_rate_position: usize,
    new_rate_position: usize,
}

impl TimeStretch {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let channels = usize::from(channels.max(1));
        let min_period = (sample_rate / MAX_PITCH_HZ).max(1) as usize;
        let max_period = ((sample_rate / MIN_PITCH_HZ) as usize).max(min_period);
        let max_required = 2 * max_period;

        Self {
            sample_rate,
            channels,
            speed: 1.0,
            pitch: 1.0,
            min_period,
            max_period,
            max_required,
            input: Vec::with_capacity(max_required * channels * 2),
            output: Vec::with_capacity(max_required * channels * 2),
            pitch_buffer: Vec::new(),
            down_sampled: Vec::with_capacity(max_required),
            remaining_input_to_copy: 0,
            prev_period: 0,
            prev_min_diff: 0,
            old_rate_position: 0,
            new_rate_position: 0,
        }
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    pub const fn speed(&self) -> f32 {
        self.speed
    }

    /// Set the tempo factor. Takes effect on the next `write`.
    pub fn set_speed(&mut self, speed: f32) {
        self.speed = clamp_speed(speed);
    }

    pub const fn pitch(&self) -> f32 {
        self.pitch
    }

    /// Set the pitch factor. 1.0 leaves the pitch untouched.
    pub fn set_pitch(&mut self, pitch: f32) {
        self.pitch = clamp_speed(pitch);
    }

    /// Feed interleaved PCM. A trailing partial frame is ignored.
    pub fn write(&mut self, samples: &[i16]) {
        let whole = samples.len() - samples.len() % self.channels;
        self.input.extend_from_slice(&samples[..whole]);
        self.process_input();
    }

    /// Frames ready to be read.
    pub fn available_frames(&self) -> usize {
        self.output.len() / self.channels
    }

    /// Interleaved samples ready to be read.
    pub fn available_samples(&self) -> usize {
        self.output.len()
    }

    /// Bytes ready to be read, counting 16-bit samples.
    pub fn available_bytes(&self) -> usize {
        self.output.len() * 2
    }

    /// Read processed samples into `out`, whole frames only.
    pub fn read(&mut self, out: &mut [i16]) -> usize {
        let count = out.len().min(self.output.len());
        let count = count - count % self.channels;
        out[..count].copy_from_slice(&self.output[..count]);
        self.output.drain(..count);
        count
    }

    /// Move every processed sample onto the end of `out`.
    pub fn read_all(&mut self, out: &mut Vec<i16>) -> usize {
        let count = self.output.len();
        out.append(&mut self.output);
        count
    }

    /// Process everything still buffered as if the stream ended here.
    ///
    /// The output grows by the stretched length of the buffered input and no
    /// more.
    pub fn flush(&mut self) {
        let remaining = self.input_frames();
        let pitch_frames = self.pitch_buffer.len() / self.channels;
        let tempo = self.speed / self.pitch;
        let expected = self.available_frames()
            + ((remaining as f32 / tempo + pitch_frames as f32) / self.pitch + 0.5) as usize;

        let padded = self.input.len() + 2 * self.max_required * self.channels;
        self.input.resize(padded, 0);
        self.process_input();

        if self.available_frames() > expected {
            self.output.truncate(expected * self.channels);
        }
        self.input.clear();
        self.pitch_buffer.clear();
        self.remaining_input_to_copy = 0;
        trace!("Stretch flushed: {} frames available", self.available_frames());
    }

    /// Drop all buffered input and output.
    pub fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
        self.pitch_buffer.clear();
        self.remaining_input_to_copy = 0;
        self.prev_period = 0;
        self.prev_min_diff = 0;
        self.old_rate_position = 0;
        self.new_rate_position = 0;
    }

    fn input_frames(&self) -> usize {
        self.input.len() / self.channels
    }

    fn process_input(&mut self) {
        let original_output = self.available_frames();
        let tempo = self.speed / self.pitch;

        if (0.99999..=1.00001).contains(&tempo) {
            self.output.append(&mut self.input);
        } else {
            self.change_speed(tempo);
        }

        if (self.pitch - 1.0).abs() > f32::EPSILON {
            self.adjust_rate(self.pitch, original_output);
        }
    }

    fn change_speed(&mut self, speed: f32) {
        let frames = self.input_frames();
        if frames < self.max_required {
            return;
        }

        let mut position = 0;
        loop {
            position += if self.remaining_input_to_copy > 0 {
                self.copy_input_to_output(position)
            } else {
                let period = self.find_pitch_period(position);
                if speed > 1.0 {
                    period + self.skip_pitch_period(position, speed, period)
                } else {
                    self.insert_pitch_period(position, speed, period)
                }
            };
            if position + self.max_required > frames {
                break;
            }
        }

        self.input.drain(..position * self.channels);
    }

    fn copy_input_to_output(&mut self, position: usize) -> usize {
        let frames = self.remaining_input_to_copy.min(self.max_required);
        let start = position * self.channels;
        self.output
            .extend_from_slice(&self.input[start..start + frames * self.channels]);
        self.remaining_input_to_copy -= frames;
        frames
    }

    /// Drop one period. Returns the number of frames written.
    fn skip_pitch_period(&mut self, position: usize, speed: f32, period: usize) -> usize {
        let new_frames = if speed >= 2.0 {
            (period as f32 / (speed - 1.0)) as usize
        } else {
            self.remaining_input_to_copy = (period as f32 * (2.0 - speed) / (speed - 1.0)) as usize;
            period
        }
        .max(1);

        self.overlap_add(new_frames, position, position + period);
        new_frames
    }

    /// Repeat one period. Returns the number of input frames consumed.
    fn insert_pitch_period(&mut self, position: usize, speed: f32, period: usize) -> usize {
        let new_frames = if speed < 0.5 {
            (period as f32 * speed / (1.0 - speed)) as usize
        } else {
            self.remaining_input_to_copy =
                (period as f32 * (2.0 * speed - 1.0) / (1.0 - speed)) as usize;
            period
        }
        .max(1);

        let start = position * self.channels;
        self.output
            .extend_from_slice(&self.input[start..start + period * self.channels]);
        self.overlap_add(new_frames, position + period, position);
        new_frames
    }

    /// Cross-fade `frames` frames, fading out the input at `ramp_down` while
    /// fading in the input at `ramp_up`, and append the result.
    fn overlap_add(&mut self, frames: usize, ramp_down: usize, ramp_up: usize) {
        let channels = self.channels;
        let total = frames as i64;
        self.output.reserve(frames * channels);
        for t in 0..frames {
            let weight = t as i64;
            for c in 0..channels {
                let down = i64::from(self.input[(ramp_down + t) * channels + c]);
                let up = i64::from(self.input[(ramp_up + t) * channels + c]);
                self.output
                    .push(((down * (total - weight) + up * weight) / total) as i16);
            }
        }
    }

    fn find_pitch_period(&mut self, position: usize) -> usize {
        let skip = if self.sample_rate > AMDF_FREQ_HZ {
            (self.sample_rate / AMDF_FREQ_HZ) as usize
        } else {
            1
        };

        self.down_sample(position, skip);
        let (mut period, mut min_diff, mut max_diff) = Self::period_in_range(
            &self.down_sampled,
            self.min_period / skip,
            self.max_period / skip,
        );

        if skip != 1 {
            period *= skip;
            let low = period.saturating_sub(skip << 2).max(self.min_period);
            let high = (period + (skip << 2)).min(self.max_period);
            self.down_sample(position, 1);
            (period, min_diff, max_diff) = Self::period_in_range(&self.down_sampled, low, high);
        }

        let chosen = if self.prev_period_better(min_diff, max_diff) {
            self.prev_period
        } else {
            period
        };
        self.prev_min_diff = min_diff;
        self.prev_period = period;
        chosen.max(1)
    }

    /// Whether the previous period is a safer choice than a poor new match.
    fn prev_period_better(&self, min_diff: u64, max_diff: u64) -> bool {
        if min_diff == 0 || self.prev_period == 0 {
            return false;
        }
        if max_diff > min_diff * 3 {
            return false;
        }
        if min_diff * 2 <= self.prev_min_diff * 3 {
            return false;
        }
        true
    }

    /// Mix channels to mono and average every `skip` frames.
    fn down_sample(&mut self, position: usize, skip: usize) {
        let per_value = self.channels * skip;
        let values = self.max_required / skip;
        let start = position * self.channels;
        self.down_sampled.clear();
        for chunk in self.input[start..start + values * per_value].chunks_exact(per_value) {
            let sum: i64 = chunk.iter().map(|&s| i64::from(s)).sum();
            self.down_sampled.push((sum / per_value as i64) as i16);
        }
    }

    /// AMDF search. Returns the best period and the normalised minimum and
    /// maximum differences seen.
    fn period_in_range(samples: &[i16], min_period: usize, max_period: usize) -> (usize, u64, u64) {
        let min_period = min_period.max(1);
        let max_period = max_period.max(min_period).min(samples.len() / 2);
        let mut best_period = 0usize;
        let mut worst_period = 255usize;
        let mut min_diff = 1u64;
        let mut max_diff = 0u64;

        for period in min_period..=max_period {
            let diff: u64 = samples[..period]
                .iter()
                .zip(&samples[period..2 * period])
                .map(|(&a, &b)| u64::from(a.abs_diff(b)))
                .sum();
            if diff * (best_period as u64) < min_diff * period as u64 {
                min_diff = diff;
                best_period = period;
            }
            if diff * (worst_period as u64) > max_diff * period as u64 {
                max_diff = diff;
                worst_period = period;
            }
        }

        if best_period == 0 {
            return (min_period, 0, 0);
        }
        (
            best_period,
            min_diff / best_period as u64,
            max_diff / worst_period as u64,
        )
    }

    /// Resample the frames produced since `original_output` by `rate` with
    /// linear interpolation.
    fn adjust_rate(&mut self, rate: f32, original_output: usize) {
        if self.available_frames() == original_output {
            return;
        }
        let channels = self.channels;
        let mut new_rate = (self.sample_rate as f32 / rate) as usize;
        let mut old_rate = self.sample_rate as usize;
        while new_rate > (1 << 14) || old_rate > (1 << 14) {
            new_rate >>= 1;
            old_rate >>= 1;
        }
        let (new_rate, old_rate) = (new_rate.max(1), old_rate.max(1));

        let fresh = self.output.split_off(original_output * channels);
        self.pitch_buffer.extend_from_slice(&fresh);
        let pitch_frames = self.pitch_buffer.len() / channels;

        let mut position = 0;
        while position + 1 < pitch_frames {
            while (self.old_rate_position + 1) * new_rate > self.new_rate_position * old_rate {
                let at = self.new_rate_position * old_rate;
                let left_at = self.old_rate_position * new_rate;
                let right_at = (self.old_rate_position + 1) * new_rate;
                let ratio = (right_at - at) as i64;
                let width = (right_at - left_at) as i64;
                for c in 0..channels {
                    let left = i64::from(self.pitch_buffer[position * channels + c]);
                    let right = i64::from(self.pitch_buffer[(position + 1) * channels + c]);
                    self.output
                        .push(((ratio * left + (width - ratio) * right) / width) as i16);
                }
                self.new_rate_position += 1;
            }
            self.old_rate_position += 1;
            if self.old_rate_position == old_rate {
                self.old_rate_position = 0;
                self.new_rate_position = 0;
            }
            position += 1;
        }

        self.pitch_buffer.drain(..position * channels);
    }
}
