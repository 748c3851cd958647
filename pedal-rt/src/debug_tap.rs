use std::path::PathBuf;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};

/// One preallocated capture of an RT signal, flushed to WAV on shutdown.
pub struct Tap {
    path: PathBuf,
    buf: Vec<f32>,
    pos: usize,
}

impl Tap {
    fn new(path: PathBuf, max_frames: usize) -> Self {
        Self {
            path,
            buf: vec![0.0; max_frames],
            pos: 0,
        }
    }

    /// Append samples until the capture window is full. RT-safe.
    pub fn push(&mut self, samples: &[f32]) {
        let n = samples.len().min(self.buf.len() - self.pos);
        if n > 0 {
            self.buf[self.pos..self.pos + n].copy_from_slice(&samples[..n]);
            self.pos += n;
        }
    }

    fn flush(&self, sample_rate: u32) -> Result<usize> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&self.path, spec)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        for &s in &self.buf[..self.pos] {
            let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
            writer.write_sample(v)?;
        }
        writer.finalize()?;
        Ok(self.pos)
    }
}

/// Optional taps on the chain's input and output, enabled by
/// `DUMP_NAM_IN_WAV` / `DUMP_NAM_OUT_WAV` with a `DUMP_SECONDS` window.
pub struct DebugTaps {
    pub input: Option<Tap>,
    pub output: Option<Tap>,
}

impl DebugTaps {
    pub fn from_env(sample_rate: u32) -> Self {
        let secs: u32 = std::env::var("DUMP_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let max_frames = (sample_rate as usize) * (secs as usize);

        let tap_from = |key: &str| {
            std::env::var(key).ok().filter(|p| !p.is_empty()).map(|p| {
                log::info!("tap: recording {} seconds to {}", secs, p);
                Tap::new(PathBuf::from(p), max_frames)
            })
        };

        Self {
            input: tap_from("DUMP_NAM_IN_WAV"),
            output: tap_from("DUMP_NAM_OUT_WAV"),
        }
    }

    pub fn active(&self) -> bool {
        self.input.is_some() || self.output.is_some()
    }

    pub fn push_input(&mut self, samples: &[f32]) {
        if let Some(tap) = &mut self.input {
            tap.push(samples);
        }
    }

    pub fn push_output(&mut self, samples: &[f32]) {
        if let Some(tap) = &mut self.output {
            tap.push(samples);
        }
    }

    /// Write collected audio to disk. Called once, after the RT loop exits.
    pub fn flush(&self, sample_rate: u32) {
        for tap in [&self.input, &self.output].into_iter().flatten() {
            match tap.flush(sample_rate) {
                Ok(frames) => log::info!(
                    "tap: wrote {} frames ({:.2}s) to {:?}",
                    frames,
                    frames as f64 / sample_rate as f64,
                    tap.path
                ),
                Err(e) => log::warn!("tap: flush to {:?} failed: {:#}", tap.path, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_captures_up_to_its_window_and_flushes() {
        let path = std::env::temp_dir().join("pedal_tap_test.wav");
        let mut tap = Tap::new(path.clone(), 100);

        tap.push(&[0.5f32; 60]);
        tap.push(&[-0.5f32; 60]); // only 40 fit
        assert_eq!(tap.pos, 100);
        tap.push(&[1.0; 10]); // window full, ignored
        assert_eq!(tap.pos, 100);

        let written = tap.flush(48000).unwrap();
        assert_eq!(written, 100);

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 100);
        assert!(samples[0] > 16000);
        assert!(samples[99] < -16000);

        let _ = std::fs::remove_file(&path);
    }
}
