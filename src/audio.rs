//! In-process waveform handling: decode, channel layout, resample,
//! peak normalisation and the canonical 16-bit PCM WAV writer.

use hound::{SampleFormat, WavSpec, WavWriter};
use rubato::{FftFixedIn, Resampler};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::{Result, ServiceError};

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Interleaved f32 samples with their layout
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

fn decode_error(message: impl Into<String>, detail: impl std::fmt::Display) -> ServiceError {
    ServiceError::audio("decode", message, Some(detail.to_string()))
}

fn open_format(path: &Path) -> Result<Box<dyn FormatReader>> {
    let file = File::open(path).map_err(|e| decode_error("Cannot open audio file", e))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| decode_error("Unrecognised audio container", e))?;
    Ok(probed.format)
}

impl Waveform {
    /// Decode every frame of the file's default audio track
    pub fn decode(path: &Path) -> Result<Self> {
        let mut format = open_format(path)?;
        let track = format
            .default_track()
            .ok_or_else(|| decode_error("No audio track found", path.display()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
        let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| decode_error("Unsupported audio codec", e))?;

        let mut samples: Vec<f32> = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(decode_error("Failed to read audio packet", e)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping corrupt audio frame: {}", e);
                    continue;
                }
                Err(e) => return Err(decode_error("Failed to decode audio", e)),
            };

            let spec = *decoded.spec();
            if decoded.frames() == 0 {
                continue;
            }
            sample_rate = spec.rate;
            channels = spec.channels.count();

            let mut buffer = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
            buffer.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buffer.samples());
        }

        if samples.is_empty() || sample_rate == 0 || channels == 0 {
            return Err(decode_error("No audio samples decoded", path.display()));
        }

        let waveform = Self {
            samples,
            sample_rate,
            channels: channels as u16,
        };
        debug!(
            "Decoded {} ({:.2}s, {}Hz, {} ch)",
            path.display(),
            waveform.duration(),
            waveform.sample_rate,
            waveform.channels
        );
        Ok(waveform)
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate.max(1) as f64
    }

    fn channel_planes(&self) -> Vec<Vec<f32>> {
        let channels = self.channels.max(1) as usize;
        let mut planes = vec![Vec::with_capacity(self.frames()); channels];
        for frame in self.samples.chunks_exact(channels) {
            for (plane, sample) in planes.iter_mut().zip(frame) {
                plane.push(*sample);
            }
        }
        planes
    }

    fn from_planes(planes: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        let channels = planes.len().max(1);
        let frames = planes.first().map(Vec::len).unwrap_or(0);
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            for plane in &planes {
                samples.push(plane[i]);
            }
        }
        Self {
            samples,
            sample_rate,
            channels: channels as u16,
        }
    }

    /// Downmix by averaging, or duplicate mono, to reach `channels`
    pub fn with_channels(self, channels: u16) -> Self {
        if channels == self.channels || channels == 0 {
            return self;
        }

        let source = self.channels.max(1) as usize;
        let mono: Vec<f32> = self
            .samples
            .chunks_exact(source)
            .map(|frame| frame.iter().sum::<f32>() / source as f32)
            .collect();

        let target = channels as usize;
        let samples = if target == 1 {
            mono
        } else {
            mono.iter().flat_map(|s| std::iter::repeat(*s).take(target)).collect()
        };

        Self {
            samples,
            sample_rate: self.sample_rate,
            channels,
        }
    }

    /// Resample every channel to `target_rate`
    pub fn resample(self, target_rate: u32) -> Result<Self> {
        if target_rate == self.sample_rate || self.samples.is_empty() {
            return Ok(self);
        }

        let planes = self.channel_planes();
        let frames_in = self.frames();
        let expected = (frames_in as f64 * target_rate as f64 / self.sample_rate as f64).round() as usize;

        let resample_error = |e: &dyn std::fmt::Display| {
            ServiceError::audio("resample", "Failed to resample audio", Some(e.to_string()))
        };

        let mut resampler = FftFixedIn::<f32>::new(
            self.sample_rate as usize,
            target_rate as usize,
            RESAMPLER_CHUNK_SIZE,
            1,
            planes.len(),
        )
        .map_err(|e| resample_error(&e))?;

        let delay = resampler.output_delay();
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); planes.len()];
        let mut position = 0;

        // Keep feeding (zero padded) chunks until the delayed tail is flushed
        while output[0].len() < delay + expected {
            let chunk_len = resampler.input_frames_next();
            let chunk: Vec<Vec<f32>> = planes
                .iter()
                .map(|plane| {
                    let end = (position + chunk_len).min(plane.len());
                    let mut chunk = plane.get(position..end).unwrap_or_default().to_vec();
                    chunk.resize(chunk_len, 0.0);
                    chunk
                })
                .collect();
            position += chunk_len;

            let processed = resampler.process(&chunk, None).map_err(|e| resample_error(&e))?;
            for (out, plane) in output.iter_mut().zip(processed) {
                out.extend_from_slice(&plane);
            }
        }

        let planes = output
            .into_iter()
            .map(|plane| plane[delay..delay + expected].to_vec())
            .collect();

        debug!("Resampled {}Hz -> {}Hz ({} -> {} frames)", self.sample_rate, target_rate, frames_in, expected);
        Ok(Self::from_planes(planes, target_rate))
    }

    /// Scale so the largest absolute sample is 1.0; silence is left alone
    pub fn peak_normalize(&mut self) {
        let peak = self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        if peak > f32::EPSILON && peak.is_finite() {
            let gain = 1.0 / peak;
            for sample in &mut self.samples {
                *sample *= gain;
            }
        }
    }

    /// Write as 16-bit PCM WAV
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        let save_error = |e: hound::Error| {
            ServiceError::audio("save", "Failed to write canonical waveform", Some(e.to_string()))
        };

        let spec = WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mut writer = WavWriter::create(path, spec).map_err(save_error)?;
        for sample in &self.samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer.write_sample(value).map_err(save_error)?;
        }
        writer.finalize().map_err(save_error)?;

        debug!("💾 Saved canonical waveform: {}", path.display());
        Ok(())
    }
}

/// Basic stream properties of an audio file
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamInfo {
    /// Seconds
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Stream properties recorded in the container, without decoding.
/// `duration` is `None` when the container carries no frame count (e.g. mp3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamHeader {
    pub duration: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

pub fn read_stream_header(path: &Path) -> Result<StreamHeader> {
    let format = open_format(path)?;
    let params = format
        .default_track()
        .map(|track| track.codec_params.clone())
        .ok_or_else(|| decode_error("No audio track found", path.display()))?;

    let sample_rate = params.sample_rate.filter(|&rate| rate > 0);
    let duration = match (params.n_frames, sample_rate) {
        (Some(frames), Some(rate)) if frames > 0 => Some(frames as f64 / rate as f64),
        _ => None,
    };
    Ok(StreamHeader {
        duration,
        sample_rate,
        channels: params.channels.map(|c| c.count() as u16),
    })
}

/// Stream properties from container metadata when available,
/// otherwise by decoding the whole track
pub fn read_stream_info(path: &Path) -> Result<StreamInfo> {
    if let Ok(header) = read_stream_header(path) {
        if let (Some(duration), Some(sample_rate)) = (header.duration, header.sample_rate) {
            return Ok(StreamInfo {
                duration,
                sample_rate,
                channels: header.channels.unwrap_or(1),
            });
        }
    }

    let waveform = Waveform::decode(path)?;
    Ok(StreamInfo {
        duration: waveform.duration(),
        sample_rate: waveform.sample_rate,
        channels: waveform.channels,
    })
}

pub fn read_duration(path: &Path) -> Result<f64> {
    Ok(read_stream_info(path)?.duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sine(rate: u32, seconds: f64, channels: u16) -> Waveform {
        let frames = (rate as f64 * seconds) as usize;
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for i in 0..frames {
            let value = 0.25 * (2.0 * std::f64::consts::PI * 440.0 * i as f64 / rate as f64).sin() as f32;
            for _ in 0..channels {
                samples.push(value);
            }
        }
        Waveform {
            samples,
            sample_rate: rate,
            channels,
        }
    }

    #[test]
    fn test_wav_roundtrip_through_decoder() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tone.wav");
        sine(16000, 0.5, 1).write_wav(&path).unwrap();

        let decoded = Waveform::decode(&path).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.frames(), 8000);
        assert!((read_duration(&path).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garbage.wav");
        std::fs::write(&path, b"definitely not a wave file").unwrap();

        let err = Waveform::decode(&path).unwrap_err();
        assert_eq!(err.step(), Some("decode"));
        assert!(read_duration(&path).is_err());
    }

    #[test]
    fn test_stream_header_reads_metadata_only() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stereo.wav");
        sine(22050, 2.0, 2).write_wav(&path).unwrap();

        let header = read_stream_header(&path).unwrap();
        assert_eq!(header.sample_rate, Some(22050));
        assert_eq!(header.channels, Some(2));
        assert!((header.duration.unwrap() - 2.0).abs() < 1e-6);

        let info = read_stream_info(&path).unwrap();
        assert_eq!(info.channels, 2);
        assert_eq!(Some(info.duration), header.duration);

        let garbage = temp_dir.path().join("garbage.mp3");
        std::fs::write(&garbage, b"no frames here").unwrap();
        assert!(read_stream_header(&garbage).is_err());
    }

    #[test]
    fn test_downmix_to_mono() {
        let stereo = Waveform {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 8000,
            channels: 2,
        };
        let mono = stereo.with_channels(1);
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_preserves_duration() {
        let resampled = sine(44100, 1.0, 2).resample(16000).unwrap();
        assert_eq!(resampled.sample_rate, 16000);
        assert_eq!(resampled.channels, 2);
        assert_eq!(resampled.frames(), 16000);
    }

    #[test]
    fn test_resample_same_rate_is_noop() {
        let original = sine(16000, 0.1, 1);
        assert_eq!(original.clone().resample(16000).unwrap(), original);
    }

    #[test]
    fn test_peak_normalize() {
        let mut waveform = sine(16000, 0.1, 1);
        waveform.peak_normalize();
        let peak = waveform.samples.iter().fold(0.0f32, |p, s| p.max(s.abs()));
        assert!((peak - 1.0).abs() < 1e-6);

        let mut silence = Waveform {
            samples: vec![0.0; 100],
            sample_rate: 16000,
            channels: 1,
        };
        silence.peak_normalize();
        assert!(silence.samples.iter().all(|s| *s == 0.0));
    }
}
