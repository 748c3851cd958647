use std::sync::Arc;

use anyhow::{bail, Result};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

/// Uniformly-partitioned overlap-save FFT convolver with a fixed block size.
///
/// The IR is split into `parts` partitions of `block` samples. Each partition
/// spectrum `h[k]` is the real FFT of `[ir_part_k, 0..0]` (length `2*block`).
/// A ring of the last `parts` input-block spectra is kept; every call
/// accumulates `sum_k x[(write-k) mod parts] * h[k]`, inverse-transforms it
/// and emits the first half plus the previous call's second half.
///
/// `process()` is RT-safe: all buffers and FFT scratch are allocated in
/// `new()`.
pub struct FftConvolver {
    block: usize,
    fft_len: usize,
    bins: usize,
    parts: usize,
    write: usize,

    fwd: Arc<dyn RealToComplex<f32>>,
    inv: Arc<dyn ComplexToReal<f32>>,
    fwd_scratch: Vec<Complex<f32>>,
    inv_scratch: Vec<Complex<f32>>,

    h: Vec<Vec<Complex<f32>>>, // IR partition spectra
    x: Vec<Vec<Complex<f32>>>, // ring of input block spectra
    freq_acc: Vec<Complex<f32>>,
    time_in: Vec<f32>,
    time_out: Vec<f32>,
    overlap: Vec<f32>,
}

impl FftConvolver {
    /// Partition `ir` and precompute all spectra for the given block size.
    ///
    /// The block size must match every later `process()` call; it should be
    /// the engine's negotiated period for minimum latency.
    pub fn new(ir: &[f32], block: usize) -> Result<Self> {
        if block == 0 {
            bail!("convolver block size must be > 0");
        }
        if ir.is_empty() {
            bail!("convolver needs a non-empty impulse response");
        }

        let fft_len = 2 * block;
        let bins = fft_len / 2 + 1;
        let parts = ir.len().div_ceil(block);

        let mut planner = RealFftPlanner::<f32>::new();
        let fwd = planner.plan_fft_forward(fft_len);
        let inv = planner.plan_fft_inverse(fft_len);
        let fwd_scratch = fwd.make_scratch_vec();
        let inv_scratch = inv.make_scratch_vec();

        let mut conv = Self {
            block,
            fft_len,
            bins,
            parts,
            write: 0,
            fwd,
            inv,
            fwd_scratch,
            inv_scratch,
            h: Vec::with_capacity(parts),
            x: vec![vec![Complex::new(0.0, 0.0); bins]; parts],
            freq_acc: vec![Complex::new(0.0, 0.0); bins],
            time_in: vec![0.0; fft_len],
            time_out: vec![0.0; fft_len],
            overlap: vec![0.0; block],
        };

        // Precompute IR partition spectra: time = [ir_part (N), zeros (N)].
        for k in 0..parts {
            conv.time_in.fill(0.0);
            let start = k * block;
            let end = (start + block).min(ir.len());
            conv.time_in[..end - start].copy_from_slice(&ir[start..end]);

            let mut spectrum = vec![Complex::new(0.0, 0.0); bins];
            conv.fwd
                .process_with_scratch(&mut conv.time_in, &mut spectrum, &mut conv.fwd_scratch)?;
            conv.h.push(spectrum);
        }

        // The input spectrum ring must start clean; partitions were computed
        // through the shared time_in scratch above.
        conv.time_in.fill(0.0);

        Ok(conv)
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    pub fn partitions(&self) -> usize {
        self.parts
    }

    /// Convolve one block. `input.len()` and `output.len()` must equal the
    /// block size given to `new()`.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        if input.len() != self.block || output.len() != self.block {
            bail!(
                "convolver called with {} frames, expected {}",
                input.len(),
                self.block
            );
        }

        // New input block spectrum into the ring. Only the second half of
        // the FFT input needs clearing; the first half is overwritten.
        self.time_in[..self.block].copy_from_slice(input);
        self.time_in[self.block..].fill(0.0);
        self.fwd.process_with_scratch(
            &mut self.time_in,
            &mut self.x[self.write],
            &mut self.fwd_scratch,
        )?;

        // freq_acc = sum_k x[(write - k) mod parts] * h[k]
        self.freq_acc.fill(Complex::new(0.0, 0.0));
        for k in 0..self.parts {
            let idx = (self.write + self.parts - k) % self.parts;
            let xk = &self.x[idx];
            let hk = &self.h[k];
            for b in 0..self.bins {
                self.freq_acc[b] += xk[b] * hk[b];
            }
        }

        // DC and Nyquist bins of a real spectrum product are purely real;
        // clear rounding residue so the c2r transform accepts them.
        self.freq_acc[0].im = 0.0;
        self.freq_acc[self.bins - 1].im = 0.0;

        self.inv.process_with_scratch(
            &mut self.freq_acc,
            &mut self.time_out,
            &mut self.inv_scratch,
        )?;

        // The inverse transform is unnormalized; fold in 1/fft_len here.
        let norm = 1.0 / self.fft_len as f32;
        for i in 0..self.block {
            output[i] = self.time_out[i] * norm + self.overlap[i];
        }
        for i in 0..self.block {
            self.overlap[i] = self.time_out[i + self.block] * norm;
        }

        self.write = (self.write + 1) % self.parts;
        Ok(())
    }
}
