//! # Audio File Decoding
//!
//! Turns an uploaded or recorded audio file into the mono 16 kHz float PCM
//! stream the transcription model expects.
//!
//! ## Supported inputs:
//! - **WAV** (8/16/24-bit integer and 32-bit float payloads)
//! - **Raw PCM** (`.pcm`): headerless 16-bit little-endian mono at 16 kHz,
//!   the format the recording endpoint stores browser capture blobs in
//!
//! Multi-channel audio is downmixed by averaging and any sample rate is
//! linearly resampled to 16 kHz. Linear interpolation is crude next to a
//! windowed-sinc resampler but speech survives it fine.

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::Path;

/// Sample rate required by the transcription model.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decode an audio file into mono f32 samples at 16 kHz.
pub fn load_audio(path: &Path) -> Result<Vec<f32>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let samples = match extension.as_str() {
        "wav" => decode_wav(path)?,
        "pcm" => {
            let bytes = std::fs::read(path)?;
            let pcm = decode_raw_pcm(&bytes)?;
            (pcm_to_float(&pcm), 1, TARGET_SAMPLE_RATE)
        }
        other => {
            return Err(anyhow!(
                "Unsupported audio format '.{}' (expected .wav or .pcm)",
                other
            ))
        }
    };

    let (interleaved, channels, sample_rate) = samples;
    if interleaved.is_empty() {
        return Err(anyhow!("Audio file contains no samples"));
    }

    let mono = downmix(&interleaved, channels);
    Ok(resample_linear(&mono, sample_rate, TARGET_SAMPLE_RATE))
}

/// Decode a WAV file into interleaved f32 samples plus channel count and rate.
fn decode_wav(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut file = std::fs::File::open(path)?;
    let (header, data) = wav::read(&mut file)
        .map_err(|e| anyhow!("Failed to parse WAV file {}: {}", path.display(), e))?;

    let samples = match data {
        wav::BitDepth::Eight(bytes) => bytes
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(pcm) => pcm_to_float(&pcm),
        wav::BitDepth::TwentyFour(pcm) => pcm
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    Ok((
        samples,
        header.channel_count as usize,
        header.sampling_rate,
    ))
}

/// Parse a headerless 16-bit little-endian PCM blob.
///
/// Rejects odd-length payloads and blobs whose leading samples have no
/// dynamic range at all, which usually means a corrupt or silent capture.
pub fn decode_raw_pcm(data: &[u8]) -> Result<Vec<i16>> {
    if data.is_empty() {
        return Err(anyhow!("PCM payload is empty"));
    }

    if data.len() % 2 != 0 {
        return Err(anyhow!("PCM payload length must be even for 16-bit samples"));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    let probe = &samples[..samples.len().min(1000)];
    let min = probe.iter().copied().min().unwrap_or(0) as i32;
    let max = probe.iter().copied().max().unwrap_or(0) as i32;
    if probe.len() >= 1000 && max - min < 100 {
        return Err(anyhow!(
            "PCM payload has almost no dynamic range, capture looks corrupt or silent"
        ));
    }

    Ok(samples)
}

/// Convert 16-bit PCM samples to floats in [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Average interleaved channels down to mono.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampling.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }

    out
}
