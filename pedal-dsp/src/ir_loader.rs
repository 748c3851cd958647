use std::path::Path;

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader};

/// A decoded impulse response: mono samples at the file's native rate.
///
/// The caller is responsible for checking `sample_rate` against the engine's
/// negotiated rate; no resampling is performed here.
pub struct IrData {
    pub sample_rate: u32,
    pub mono: Vec<f32>,
}

/// Load an IR WAV file, downmix to mono and remove the DC offset.
///
/// Supports 16/24/32-bit integer and 32-bit float PCM. Multi-channel files
/// are downmixed by per-sample averaging. Fails on open/decode errors and on
/// zero-frame files.
pub fn load(path: &Path) -> Result<IrData> {
    let reader =
        WavReader::open(path).with_context(|| format!("failed to open IR {:?}", path))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels as usize;
    if channels == 0 {
        bail!("IR file has 0 channels");
    }

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let scale = match spec.bits_per_sample {
                16 => 1.0 / 32768.0,
                24 => 1.0 / 8_388_608.0,
                32 => 1.0 / 2_147_483_648.0,
                bits => bail!("unsupported IR bit depth: {}", bits),
            };
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .context("failed to decode IR samples")?
        }
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("failed to decode IR samples")?,
    };

    let frames = samples.len() / channels;
    if frames == 0 {
        bail!("IR file {:?} contains no frames", path);
    }

    let mut mono = if channels == 1 {
        samples
    } else {
        let inv_ch = 1.0 / channels as f32;
        (0..frames)
            .map(|i| {
                let start = i * channels;
                let sum: f32 = samples[start..start + channels].iter().sum();
                sum * inv_ch
            })
            .collect()
    };

    // Strip the arithmetic-mean DC offset; some IR captures carry a small one.
    let mean = mono.iter().sum::<f32>() / mono.len() as f32;
    for v in &mut mono {
        *v -= mean;
    }

    Ok(IrData { sample_rate, mono })
}
