//! Compressed sample extraction using symphonia.
//!
//! A [`MediaSource`] exposes exactly one elementary audio track: its format,
//! sequential compressed samples with timestamps, and seeking that snaps to
//! the nearest preceding sync point.

use std::fs::File;
use std::io::Cursor;

use speedplay_core::{DataSource, Error, Result, StreamFormat};
use symphonia::core::{
    codecs::{
        CodecParameters, CodecType, CODEC_TYPE_AAC, CODEC_TYPE_ALAC, CODEC_TYPE_FLAC,
        CODEC_TYPE_MP1, CODEC_TYPE_MP2, CODEC_TYPE_MP3, CODEC_TYPE_NULL, CODEC_TYPE_OPUS,
        CODEC_TYPE_VORBIS,
    },
    errors::{Error as SymphoniaError, SeekErrorKind},
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::{Time, TimeBase},
};
use tracing::{debug, info, warn};

/// Largest remote resource fetched into memory.
const MAX_REMOTE_BYTES: u64 = 512 * 1024 * 1024;

/// Metadata of one compressed sample returned by [`MediaSource::read_sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    /// Presentation time in microseconds.
    pub timestamp_us: u64,
    /// Duration in microseconds.
    pub duration_us: u64,
    /// Presentation time in track time-base units.
    pub ts: u64,
    /// Duration in track time-base units.
    pub dur: u64,
    /// Payload size in bytes.
    pub size: usize,
}

impl SampleInfo {
    /// Timestamp just past the end of this sample.
    pub const fn end_us(&self) -> u64 {
        self.timestamp_us + self.duration_us
    }
}

/// Format of the selected track as reported by the container.
///
/// Every key is optional here; [`TrackFormat::stream_format`] enforces that
/// the ones playback needs are present.
#[derive(Debug, Clone)]
pub struct TrackFormat {
    pub track_id: u32,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub mime: Option<String>,
    pub duration_us: Option<u64>,
    /// Decoder setup data, opaque to everything but the decoder.
    pub codec_params: CodecParameters,
}

impl TrackFormat {
    pub fn from_codec_params(track_id: u32, params: &CodecParameters) -> Self {
        let time_base = Self::time_base_of(params);
        let duration_us = params
            .n_frames
            .zip(time_base)
            .map(|(frames, tb)| ts_to_us(tb, frames));

        Self {
            track_id,
            sample_rate: params.sample_rate,
            channels: params.channels.map(|c| c.count() as u16),
            mime: mime_for_codec(params.codec),
            duration_us,
            codec_params: params.clone(),
        }
    }

    fn time_base_of(params: &CodecParameters) -> Option<TimeBase> {
        params
            .time_base
            .or_else(|| params.sample_rate.map(|rate| TimeBase::new(1, rate)))
    }

    /// Time base used by sample timestamps.
    pub fn time_base(&self) -> Option<TimeBase> {
        Self::time_base_of(&self.codec_params)
    }

    /// Convert a track timestamp to microseconds.
    pub fn ts_to_us(&self, ts: u64) -> u64 {
        self.time_base().map_or(ts, |tb| ts_to_us(tb, ts))
    }

    /// The required playback format, or a configuration error naming every
    /// missing key.
    pub fn stream_format(&self) -> Result<StreamFormat> {
        let mut missing = Vec::new();
        if self.sample_rate.is_none() {
            missing.push("sample rate");
        }
        if self.channels.is_none() {
            missing.push("channel count");
        }
        if self.mime.is_none() {
            missing.push("mime");
        }
        if self.duration_us.is_none() {
            missing.push("duration");
        }

        match (self.sample_rate, self.channels, &self.mime, self.duration_us) {
            (Some(sample_rate), Some(channels), Some(mime), Some(duration_us)) => Ok(
                StreamFormat::new(sample_rate, channels, mime.clone(), duration_us),
            ),
            _ => Err(Error::Configuration(format!(
                "Track {} is missing required format keys: {}",
                self.track_id,
                missing.join(", ")
            ))),
        }
    }
}

fn ts_to_us(time_base: TimeBase, ts: u64) -> u64 {
    let time = time_base.calc_time(ts);
    time.seconds * 1_000_000 + (time.frac * 1_000_000.0).round() as u64
}

/// MIME type for a symphonia codec.
pub fn mime_for_codec(codec: CodecType) -> Option<String> {
    let mime = match codec {
        CODEC_TYPE_NULL => return None,
        CODEC_TYPE_MP1 | CODEC_TYPE_MP2 | CODEC_TYPE_MP3 => "audio/mpeg",
        CODEC_TYPE_AAC => "audio/mp4a-latm",
        CODEC_TYPE_FLAC => "audio/flac",
        CODEC_TYPE_VORBIS => "audio/vorbis",
        CODEC_TYPE_OPUS => "audio/opus",
        CODEC_TYPE_ALAC => "audio/alac",
        other => {
            let descriptor = symphonia::default::get_codecs().get_codec(other)?;
            if descriptor.short_name.starts_with("pcm") {
                "audio/raw"
            } else {
                return Some(format!("audio/x-{}", descriptor.short_name));
            }
        }
    };
    Some(mime.to_string())
}

/// Demuxer over one audio track.
pub trait MediaSource: Send {
    /// Format of the selected track.
    fn track_format(&self) -> &TrackFormat;

    /// Copy the next compressed sample into `buf`.
    ///
    /// Returns `None` at end of stream.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleInfo>>;

    /// Timestamp of the sample most recently read or seeked to.
    fn position_us(&self) -> u64;

    /// Move the read cursor to the nearest sync point at or before
    /// `timestamp_us`. Returns the timestamp actually reached.
    fn seek(&mut self, timestamp_us: u64) -> Result<u64>;

    /// Close the source. Calling it again has no effect.
    fn release(&mut self);
}

/// [`MediaSource`] backed by a symphonia format reader.
pub struct SymphoniaSource {
    reader: Option<Box<dyn FormatReader>>,
    format: TrackFormat,
    position_us: u64,
    at_end: bool,
}

impl SymphoniaSource {
    /// Open a file path, a `file://` URI, or an `http(s)://` URI.
    pub fn open(source: &DataSource) -> Result<Self> {
        let mut hint = Hint::new();
        if let Some(ext) = source.extension() {
            hint.with_extension(&ext);
        }

        let media: Box<dyn symphonia::core::io::MediaSource> = match source {
            DataSource::Path(path) => {
                let file = File::open(path).map_err(|e| {
                    Error::Source(format!("Failed to open {}: {e}", path.display()))
                })?;
                Box::new(file)
            }
            DataSource::Uri(url) if matches!(url.scheme(), "http" | "https") => {
                let (data, mime_type) = fetch_url(url.as_str())?;
                if let Some(mime) = &mime_type {
                    hint.mime_type(mime);
                }
                Box::new(Cursor::new(data))
            }
            DataSource::Uri(url) => {
                return Err(Error::Source(format!(
                    "Unsupported URI scheme: {}",
                    url.scheme()
                )));
            }
        };

        let mss = MediaSourceStream::new(media, MediaSourceStreamOptions::default());
        let source = Self::from_stream(mss, &hint)?;
        info!("Opened source: {source}");
        Ok(source)
    }

    /// Probe an already opened stream.
    pub fn from_stream(mss: MediaSourceStream, hint: &Hint) -> Result<Self> {
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::Source(format!("Failed to probe format: {e}")))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Source("No audio tracks found".to_string()))?;
        let format = TrackFormat::from_codec_params(track.id, &track.codec_params);

        debug!(
            "Selected track {}: rate={:?}, channels={:?}, mime={:?}, duration_us={:?}",
            format.track_id, format.sample_rate, format.channels, format.mime, format.duration_us
        );

        Ok(Self {
            reader: Some(reader),
            format,
            position_us: 0,
            at_end: false,
        })
    }

    fn reader(&mut self) -> Result<&mut (dyn FormatReader + 'static)> {
        self.reader
            .as_deref_mut()
            .ok_or_else(|| Error::Source("Source already released".to_string()))
    }
}

impl std::fmt::Display for SymphoniaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "track {} ({})",
            self.format.track_id,
            self.format.mime.as_deref().unwrap_or("unknown")
        )
    }
}

impl MediaSource for SymphoniaSource {
    fn track_format(&self) -> &TrackFormat {
        &self.format
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleInfo>> {
        if self.at_end {
            return Ok(None);
        }
        let track_id = self.format.track_id;

        loop {
            let packet = match self.reader()?.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.at_end = true;
                    return Ok(None);
                }
                Err(e) => {
                    return Err(Error::Source(format!("Failed to read sample: {e}")));
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != track_id {
                continue;
            }

            buf.clear();
            buf.extend_from_slice(&packet.data);
            let info = SampleInfo {
                timestamp_us: self.format.ts_to_us(packet.ts),
                duration_us: self.format.ts_to_us(packet.dur),
                ts: packet.ts,
                dur: packet.dur,
                size: packet.data.len(),
            };
            self.position_us = info.timestamp_us;
            return Ok(Some(info));
        }
    }

    fn position_us(&self) -> u64 {
        self.position_us
    }

    fn seek(&mut self, timestamp_us: u64) -> Result<u64> {
        let track_id = self.format.track_id;
        let time = Time::new(
            timestamp_us / 1_000_000,
            (timestamp_us % 1_000_000) as f64 / 1_000_000.0,
        );

        let result = self.reader()?.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(track_id),
            },
        );

        match result {
            Ok(seeked) => {
                let actual = self.format.ts_to_us(seeked.actual_ts);
                debug!("Seeked to {} us (requested {} us)", actual, timestamp_us);
                self.position_us = actual;
                self.at_end = false;
                Ok(actual)
            }
            Err(SymphoniaError::SeekError(SeekErrorKind::OutOfRange)) => {
                let end = self.format.duration_us.unwrap_or(timestamp_us);
                warn!("Seek to {timestamp_us} us is past the end, clamping to {end} us");
                self.position_us = end;
                self.at_end = true;
                Ok(end)
            }
            Err(e) => Err(Error::Source(format!("Seek failed: {e}"))),
        }
    }

    fn release(&mut self) {
        if self.reader.take().is_some() {
            debug!("Source released");
        }
    }
}

/// Fetch a whole remote resource into memory.
fn fetch_url(url: &str) -> Result<(Vec<u8>, Option<String>)> {
    let mut body = ureq::get(url)
        .header("Accept", "audio/*, */*")
        .call()
        .map_err(|e| Error::Source(format!("HTTP request failed: {e}")))?
        .into_body();

    let mime_type = body.mime_type().map(String::from);
    let data = body
        .with_config()
        .limit(MAX_REMOTE_BYTES)
        .read_to_vec()
        .map_err(|e| Error::Source(format!("Failed to read response: {e}")))?;

    debug!("Fetched {} bytes, mime: {:?}", data.len(), mime_type);
    Ok((data, mime_type))
}
