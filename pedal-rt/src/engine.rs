use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{bail, Context, Result};

use pedal_dsp::chain::{NodeTimingStat, ProcessContext};
use pedal_dsp::schema::ChainSpec;
use pedal_dsp::{RtParams, SignalChain};

use crate::config::{self, EngineConfig};
use crate::control;
use crate::debug_tap::DebugTaps;
use crate::retire::{RetireWorker, RETIRE_QUEUE_SIZE};
use crate::runtime::ChainRuntime;
use crate::trim_udp;

const STATS_INTERVAL: Duration = Duration::from_secs(2);

struct Negotiated {
    rate: u32,
    period: usize,
    periods: u32,
    buffer: usize,
}

fn setup_pcm(pcm: &PCM, label: &str, cfg: &EngineConfig, channels: u32) -> Result<Negotiated> {
    {
        let hwp = HwParams::any(pcm).context("hw_params_any failed")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S32LE)?;
        hwp.set_channels(channels)?;
        // Keep the device at the native rate; no plugin-layer resampling.
        let _ = hwp.set_rate_resample(false);
        hwp.set_rate(cfg.rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(cfg.period as Frames, ValueOr::Nearest)?;
        hwp.set_periods(cfg.periods, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let hwp = pcm.hw_params_current()?;
    let neg = Negotiated {
        rate: hwp.get_rate()?,
        period: hwp.get_period_size()? as usize,
        periods: hwp.get_periods()?,
        buffer: hwp.get_buffer_size()? as usize,
    };
    log::info!(
        "alsa: negotiated {} rate={} ch={} period={} periods={} buffer={}",
        label,
        neg.rate,
        channels,
        neg.period,
        neg.periods,
        neg.buffer
    );
    Ok(neg)
}

fn setup_sw(pcm: &PCM, dir: Direction, neg: &Negotiated) -> Result<()> {
    let swp = pcm.sw_params_current()?;
    // Wake once a full period is available.
    swp.set_avail_min(neg.period as Frames)?;
    let start = match dir {
        // Playback starts once the buffer is nearly full; capture after one
        // period.
        Direction::Playback => (neg.buffer - neg.period) as Frames,
        Direction::Capture => neg.period as Frames,
    };
    swp.set_start_threshold(start)?;
    pcm.sw_params(&swp)?;
    Ok(())
}

fn log_device_hints() {
    for (path, label) in [("/proc/asound/cards", "cards"), ("/proc/asound/pcm", "pcm")] {
        if let Ok(text) = std::fs::read_to_string(path) {
            log::info!("alsa: ---- {} ({}) ----\n{}", label, path, text.trim_end());
        }
    }
    log::info!("alsa: hint: try 'aplay -l' / 'arecord -l' to find hw:<card>,<device>");
}

/// Bring a stream back after an error. EPIPE (xrun) and ESTRPIPE (suspend)
/// get drop+prepare; everything else goes through the standard recover
/// routine, with a prepare chaser if the state still says XRUN/SUSPENDED.
fn recover_pcm(pcm: &PCM, label: &str, err: alsa::Error, verbose: bool) -> bool {
    let errno = err.errno();
    if errno == libc::EPIPE || errno == libc::ESTRPIPE {
        let _ = pcm.drop();
        if let Err(e) = pcm.prepare() {
            log::error!("alsa: {} prepare failed after xrun: {}", label, e);
            return false;
        }
        if verbose {
            log::warn!("alsa: {} recovered, state={:?}", label, pcm.state());
        }
        return true;
    }

    if let Err(e) = pcm.try_recover(err, true) {
        log::error!("alsa: {} recover failed: {}", label, e);
        return false;
    }
    match pcm.state() {
        State::XRun | State::Suspended => {
            if let Err(e) = pcm.prepare() {
                log::error!("alsa: {} prepare failed after recover: {}", label, e);
            } else if verbose {
                log::warn!("alsa: {} prepared after recover", label);
            }
        }
        _ => {}
    }
    true
}

/// i32 interleaved capture -> mono float in [-1, 1]. Returns the block peak.
fn downmix_to_mono(raw: &[i32], channels: usize, mono: &mut [f32]) -> f32 {
    const INV: f32 = 1.0 / 2_147_483_648.0;
    let mut peak = 0.0f32;
    if channels == 1 {
        for (m, &v) in mono.iter_mut().zip(raw) {
            let s = v as f32 * INV;
            *m = s;
            peak = peak.max(s.abs());
        }
    } else {
        for (i, m) in mono.iter_mut().enumerate() {
            let mut acc = 0.0f64;
            for c in 0..channels {
                acc += raw[i * channels + c] as f64 * INV as f64;
            }
            let s = (acc / channels as f64) as f32;
            *m = s;
            peak = peak.max(s.abs());
        }
    }
    peak
}

/// Gain, optional sanitize, clamp, i32 conversion, channel replication.
/// Returns (block peak, non-finite samples replaced).
fn write_playback_frames(
    dsp: &[f32],
    gain: f32,
    sanitize: bool,
    out: &mut [i32],
    channels: usize,
) -> (f32, u64) {
    let mut peak = 0.0f32;
    let mut non_finite = 0u64;
    for (i, &x) in dsp.iter().enumerate() {
        let mut s = x * gain;
        if sanitize && !s.is_finite() {
            s = 0.0;
            non_finite += 1;
        }
        peak = peak.max(s.abs());
        let v = (s.clamp(-1.0, 1.0) * 2_147_483_647.0).round() as i32;
        for c in 0..channels {
            out[i * channels + c] = v;
        }
    }
    (peak, non_finite)
}

fn apply_fade_out(buf: &mut [f32], ramp: usize) {
    let n = buf.len();
    if ramp == 0 || n == 0 {
        return;
    }
    let ramp = ramp.min(n);
    if ramp == 1 {
        buf[n - 1] = 0.0;
        return;
    }
    for i in 0..ramp {
        let t = i as f32 / (ramp - 1) as f32;
        buf[n - ramp + i] *= 1.0 - t;
    }
}

fn apply_fade_in(buf: &mut [f32], ramp: usize) {
    let n = buf.len();
    if ramp == 0 || n == 0 {
        return;
    }
    let ramp = ramp.min(n);
    if ramp == 1 {
        buf[0] = 0.0;
        return;
    }
    for i in 0..ramp {
        buf[i] *= i as f32 / (ramp - 1) as f32;
    }
}

#[derive(Clone, Copy, PartialEq)]
enum SwapRamp {
    Idle,
    FadeOut,
    FadeIn,
}

#[derive(Default)]
struct LoopStats {
    xruns_read: u64,
    xruns_write: u64,
    short_read: u64,
    short_write: u64,
    non_finite: u64,
    swaps: u64,
    retire_full: u64,
    chain_calls: u64,
    chain_sum_us: u64,
    chain_max_us: u64,
    chain_overruns: u64,
    peak_in: f32,
    peak_chain: f32,
    peak_out: f32,
}

struct CaptureSanity {
    frames_remaining: u64,
    frames_seen: u64,
    sum_sq: f64,
    peak: f32,
    threshold: f32,
    secs: u32,
    reported: bool,
}

impl CaptureSanity {
    fn new(rate: u32, cfg: &EngineConfig) -> Self {
        Self {
            frames_remaining: rate as u64 * cfg.capture_sanity_secs as u64,
            frames_seen: 0,
            sum_sq: 0.0,
            peak: 0.0,
            threshold: cfg.capture_silent_peak,
            secs: cfg.capture_sanity_secs,
            reported: false,
        }
    }

    fn observe(&mut self, block: &[f32]) {
        if self.frames_remaining == 0 {
            if !self.reported {
                self.report();
            }
            return;
        }
        let take = (self.frames_remaining as usize).min(block.len());
        for &s in &block[..take] {
            self.sum_sq += s as f64 * s as f64;
            self.peak = self.peak.max(s.abs());
        }
        self.frames_remaining -= take as u64;
        self.frames_seen += take as u64;
        if self.frames_remaining == 0 {
            self.report();
        }
    }

    fn report(&mut self) {
        self.reported = true;
        let rms = if self.frames_seen > 0 {
            (self.sum_sq / self.frames_seen as f64).sqrt()
        } else {
            0.0
        };
        log::info!(
            "alsa: capture_sanity secs={} frames={} peak={:.6e} rms={:.6e}",
            self.secs,
            self.frames_seen,
            self.peak,
            rms
        );
        if self.peak < self.threshold {
            log::warn!(
                "alsa: capture appears silent (peak<{:.1e}), check device routing",
                self.threshold
            );
        }
    }

    fn capture_ok(&self) -> bool {
        !self.reported || self.peak >= self.threshold
    }
}

/// Open the devices, negotiate the stream format, boot the chain runtime and
/// run the period loop until `running` clears. Returns an error only for
/// fatal setup failures (exit code 1); mid-run problems recover in place or
/// stop the loop cleanly.
pub fn run(
    cfg: &EngineConfig,
    params: Arc<RtParams>,
    boot_spec: Option<ChainSpec>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    log::info!(
        "alsa: devices capture='{}' playback='{}'",
        cfg.capture_device,
        cfg.playback_device
    );

    let cap = PCM::new(&cfg.capture_device, Direction::Capture, false)
        .map_err(|e| {
            log_device_hints();
            e
        })
        .with_context(|| format!("failed to open capture device '{}'", cfg.capture_device))?;
    let pb = PCM::new(&cfg.playback_device, Direction::Playback, false)
        .map_err(|e| {
            log_device_hints();
            e
        })
        .with_context(|| format!("failed to open playback device '{}'", cfg.playback_device))?;

    let neg_cap = setup_pcm(&cap, "capture", cfg, cfg.capture_channels)
        .context("capture setup failed")?;
    setup_sw(&cap, Direction::Capture, &neg_cap).context("capture sw_params failed")?;
    let neg_pb = setup_pcm(&pb, "playback", cfg, cfg.playback_channels)
        .context("playback setup failed")?;
    setup_sw(&pb, Direction::Playback, &neg_pb).context("playback sw_params failed")?;

    if neg_cap.rate != neg_pb.rate {
        bail!(
            "capture/playback rate mismatch (cap={} pb={})",
            neg_cap.rate,
            neg_pb.rate
        );
    }
    if neg_cap.period != neg_pb.period {
        bail!(
            "capture/playback period mismatch (cap={} pb={})",
            neg_cap.period,
            neg_pb.period
        );
    }
    if neg_cap.periods != neg_pb.periods {
        bail!(
            "capture/playback periods mismatch (cap={} pb={})",
            neg_cap.periods,
            neg_pb.periods
        );
    }
    let rate = neg_cap.rate;
    let period = neg_cap.period;

    // Keep the streams in sync when the hardware supports it; fail open.
    if cfg.disable_link {
        log::info!("alsa: link disabled via DISABLE_LINK");
    } else if let Err(e) = cap.link(&pb) {
        log::warn!("alsa: snd_pcm_link failed, running unlinked: {}", e);
    } else {
        log::info!("alsa: capture and playback linked");
    }

    cap.prepare().context("capture prepare failed")?;
    pb.prepare().context("playback prepare failed")?;

    // The chain runtime exists only after negotiation: every build needs the
    // final rate and period.
    let ctx = ProcessContext {
        sample_rate: rate,
        max_block_frames: period,
        params: Arc::clone(&params),
    };
    let runtime = Arc::new(ChainRuntime::new(
        ctx.clone(),
        Arc::clone(&running),
        cfg.config_path.clone(),
        cfg.socket_path.clone(),
    ));

    let (chain, spec) = config::build_boot_chain(boot_spec, &ctx, &params);
    runtime.set_last_spec(spec);
    let mut active: Option<Box<SignalChain>> = Some(chain);

    let (mut retire_tx, retire_rx) = rtrb::RingBuffer::new(RETIRE_QUEUE_SIZE);
    let retire_worker = RetireWorker::spawn(retire_rx);
    let control_thread = control::spawn(Arc::clone(&runtime));
    let trim_thread = trim_udp::spawn(Arc::clone(&params), Arc::clone(&running));
    let mut taps = DebugTaps::from_env(rate);

    let cap_ch = cfg.capture_channels as usize;
    let pb_ch = cfg.playback_channels as usize;
    let mut in_i32 = vec![0i32; period * cap_ch];
    let mut out_i32 = vec![0i32; period * pb_ch];
    let mut in_mono = vec![0.0f32; period];
    let mut dsp_out = vec![0.0f32; period];

    let io_cap = cap.io_i32().context("capture io handle")?;
    let io_pb = pb.io_i32().context("playback io handle")?;

    // Prime playback with silence so the first periods don't underrun.
    // Default is one buffer less one period; PRIME_FRAMES overrides.
    let default_prime = period * (neg_pb.periods.max(2) as usize - 1);
    let prime_target = cfg
        .prime_frames
        .map(|v| v as usize)
        .unwrap_or(default_prime)
        .min(neg_pb.buffer);
    let mut primed = 0usize;
    while primed < prime_target {
        let chunk = (prime_target - primed).min(period);
        match io_pb.writei(&out_i32[..chunk * pb_ch]) {
            Ok(n) => primed += n,
            Err(e) => {
                if pb.try_recover(e, true).is_err() {
                    break;
                }
            }
        }
    }
    log::info!("alsa: primed {} frames of silence", primed);

    let deadline_us = period as f64 * 1_000_000.0 / rate as f64;
    let deadline_us_int = deadline_us.round() as u64;
    let ramp = cfg.swap_ramp_samples as usize;

    let mut stats = LoopStats::default();
    let mut sanity = CaptureSanity::new(rate, cfg);
    let mut last_report = Instant::now();

    // Chains displaced while the retire ring was full wait here; capacity is
    // fixed up front so the steady state never allocates.
    let mut deferred_retire: Vec<Box<SignalChain>> = Vec::with_capacity(8);
    let mut deferred_swap: Option<Box<SignalChain>> = None;
    let mut swap_state = SwapRamp::Idle;
    let mut swap_next: Option<Box<SignalChain>> = None;

    log::info!(
        "engine running: rate={} period={} deadline={:.1}us xfade={}",
        rate,
        period,
        deadline_us,
        ramp
    );

    while running.load(Ordering::Relaxed) {
        let verbose = params.verbose_xruns.load(Ordering::Relaxed);

        // Retry chains we could not hand to the retire thread earlier.
        while let Some(old) = deferred_retire.pop() {
            match retire_tx.push(old) {
                Ok(()) => {}
                Err(rtrb::PushError::Full(old)) => {
                    stats.retire_full += 1;
                    deferred_retire.push(old);
                    break;
                }
            }
        }

        // Read exactly one period, looping on short reads.
        let mut filled = 0usize;
        while filled < period && running.load(Ordering::Relaxed) {
            match io_cap.readi(&mut in_i32[filled * cap_ch..]) {
                Ok(0) => continue,
                Ok(n) => filled += n,
                Err(e) => {
                    stats.xruns_read += 1;
                    if verbose {
                        log::warn!("alsa: capture read error: {}", e);
                    }
                    if !recover_pcm(&cap, "capture", e, verbose) {
                        log::error!("alsa: capture unrecoverable, stopping");
                        running.store(false, Ordering::Relaxed);
                    }
                }
            }
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }
        if filled != period {
            stats.short_read += 1;
            continue;
        }

        let peak_in = downmix_to_mono(&in_i32, cap_ch, &mut in_mono);
        stats.peak_in = stats.peak_in.max(peak_in);
        sanity.observe(&in_mono);
        if taps.active() {
            taps.push_input(&in_mono);
        }

        let passthrough = params.passthrough.load(Ordering::Relaxed);

        // Period-boundary swap. The control thread has already coalesced
        // rapid publishes in the slot; here a held-back swap competes with
        // anything newer and the loser goes to the retire queue.
        let mut pending = runtime.pending.take();
        if let Some(held) = deferred_swap.take() {
            match pending {
                Some(_) => deferred_retire.push(held),
                None => pending = Some(held),
            }
        }

        if let Some(next) = pending {
            let retire_has_space =
                deferred_retire.is_empty() && retire_tx.slots() > 0;
            if active.is_some() && !retire_has_space {
                // Swapping now would strand the old chain on this thread.
                deferred_swap = Some(next);
            } else if !passthrough && ramp > 0 && active.is_some() {
                if let Some(displaced) = swap_next.replace(next) {
                    // Superseded mid-ramp; never destroyed on this thread.
                    deferred_retire.push(displaced);
                }
                if swap_state == SwapRamp::Idle {
                    swap_state = SwapRamp::FadeOut;
                }
            } else {
                let old = active.replace(next);
                stats.swaps += 1;
                if let Some(old) = old {
                    match retire_tx.push(old) {
                        Ok(()) => {}
                        Err(rtrb::PushError::Full(old)) => {
                            stats.retire_full += 1;
                            deferred_retire.push(old);
                        }
                    }
                }
            }
        }

        // Run the chain (or pass the DI through).
        let want_timing = params.log_timing.load(Ordering::Relaxed);
        match (&mut active, passthrough) {
            (Some(chain), false) => {
                let t0 = if want_timing { Some(Instant::now()) } else { None };
                chain.process(&in_mono, &mut dsp_out);
                if let Some(t0) = t0 {
                    let us = t0.elapsed().as_micros() as u64;
                    stats.chain_calls += 1;
                    stats.chain_sum_us += us;
                    stats.chain_max_us = stats.chain_max_us.max(us);
                    if deadline_us_int > 0 && us > deadline_us_int {
                        stats.chain_overruns += 1;
                    }
                }
            }
            _ => dsp_out.copy_from_slice(&in_mono),
        }

        // Two-period swap ramp: fade this block out on the old chain, swap,
        // fade the next block in on the new one. The two chains never
        // process the same frames.
        if !passthrough && ramp > 0 {
            match swap_state {
                SwapRamp::FadeOut => {
                    apply_fade_out(&mut dsp_out, ramp);
                    if let Some(next) = swap_next.take() {
                        if !deferred_retire.is_empty() || retire_tx.slots() == 0 {
                            deferred_swap = Some(next);
                            swap_state = SwapRamp::Idle;
                        } else {
                            let old = active.replace(next);
                            stats.swaps += 1;
                            if let Some(old) = old {
                                match retire_tx.push(old) {
                                    Ok(()) => {}
                                    Err(rtrb::PushError::Full(old)) => {
                                        stats.retire_full += 1;
                                        deferred_retire.push(old);
                                    }
                                }
                            }
                            swap_state = SwapRamp::FadeIn;
                        }
                    } else {
                        swap_state = SwapRamp::Idle;
                    }
                }
                SwapRamp::FadeIn => {
                    apply_fade_in(&mut dsp_out, ramp);
                    swap_state = SwapRamp::Idle;
                }
                SwapRamp::Idle => {}
            }
        }

        let peak_chain = dsp_out.iter().fold(0.0f32, |p, v| p.max(v.abs()));
        stats.peak_chain = stats.peak_chain.max(peak_chain);
        if taps.active() {
            taps.push_output(&dsp_out);
        }

        let gain = params.output_gain_lin.load(Ordering::Relaxed);
        let sanitize = params.sanitize_output.load(Ordering::Relaxed);
        let (peak_out, non_finite) =
            write_playback_frames(&dsp_out, gain, sanitize, &mut out_i32, pb_ch);
        stats.peak_out = stats.peak_out.max(peak_out);
        stats.non_finite += non_finite;

        // Write exactly one period, looping on short writes.
        let mut written = 0usize;
        while written < period && running.load(Ordering::Relaxed) {
            match io_pb.writei(&out_i32[written * pb_ch..]) {
                Ok(0) => continue,
                Ok(n) => written += n,
                Err(e) => {
                    stats.xruns_write += 1;
                    if verbose {
                        log::warn!("alsa: playback write error: {}", e);
                    }
                    if !recover_pcm(&pb, "playback", e, verbose) {
                        log::error!("alsa: playback unrecoverable, stopping");
                        running.store(false, Ordering::Relaxed);
                    }
                }
            }
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }
        if written != period {
            stats.short_write += 1;
        }

        if last_report.elapsed() >= STATS_INTERVAL {
            report_stats(
                &mut stats,
                &params,
                active.as_mut(),
                period,
                deadline_us,
                cfg,
                &sanity,
            );
            last_report = Instant::now();
        }
    }

    running.store(false, Ordering::Relaxed);

    // Drop the device handles' IO borrows before teardown of the PCMs.
    drop(io_cap);
    drop(io_pb);

    let _ = control_thread.join();
    let _ = trim_thread.join();

    // The loop is no longer realtime; anything still deferred can be
    // dropped right here. The worker then drains whatever is queued.
    deferred_retire.clear();
    retire_worker.stop();

    taps.flush(rate);
    log::info!("engine stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn report_stats(
    stats: &mut LoopStats,
    params: &RtParams,
    active: Option<&mut Box<SignalChain>>,
    period: usize,
    deadline_us: f64,
    cfg: &EngineConfig,
    sanity: &CaptureSanity,
) {
    let log_stats = params.log_stats.load(Ordering::Relaxed);
    let noteworthy = stats.xruns_read
        + stats.xruns_write
        + stats.short_read
        + stats.short_write
        + stats.non_finite
        > 0;

    if log_stats || noteworthy {
        if params.log_timing.load(Ordering::Relaxed) {
            let avg = if stats.chain_calls > 0 {
                stats.chain_sum_us as f64 / stats.chain_calls as f64
            } else {
                0.0
            };
            let max_pct = if deadline_us > 0.0 {
                stats.chain_max_us as f64 * 100.0 / deadline_us
            } else {
                0.0
            };
            log::info!(
                "alsa: xruns(read={} write={}) short(read={} write={}) nonFinite={} swaps={} nframes={} \
                 peakIn={:.3} peakChain={:.3} peakOut={:.3} chain_us_avg={:.1} chain_us_max={} \
                 deadline_us={:.1} chain_max_pct={:.1} chain_overruns={} retireQ_full={}",
                stats.xruns_read,
                stats.xruns_write,
                stats.short_read,
                stats.short_write,
                stats.non_finite,
                stats.swaps,
                period,
                stats.peak_in,
                stats.peak_chain,
                stats.peak_out,
                avg,
                stats.chain_max_us,
                deadline_us,
                max_pct,
                stats.chain_overruns,
                stats.retire_full
            );

            if cfg.baseline {
                let ok_xruns = stats.xruns_read == 0 && stats.xruns_write == 0;
                let ok_overruns = stats.chain_overruns == 0;
                let ok_max = cfg.baseline_chain_us_max == 0
                    || stats.chain_max_us < cfg.baseline_chain_us_max;
                let ok_capture = sanity.capture_ok();
                log::info!(
                    "alsa: baseline_check ok={} xruns_ok={} overruns_ok={} chain_us_max_ok={} \
                     capture_ok={} (chain_us_max={} thresh={})",
                    ok_xruns && ok_overruns && ok_max && ok_capture,
                    ok_xruns,
                    ok_overruns,
                    ok_max,
                    ok_capture,
                    stats.chain_max_us,
                    cfg.baseline_chain_us_max
                );
            }

            if let Some(chain) = active {
                if chain.node_timing_enabled() {
                    let mut node_stats = [NodeTimingStat::default(); 16];
                    let n = chain.snapshot_node_timing(&mut node_stats, true);
                    if n > 0 {
                        let mut line = String::from("alsa: node_us_max");
                        for s in &node_stats[..n] {
                            line.push_str(&format!(" {}={}", s.node_type, s.max_us));
                        }
                        log::info!("{}", line);
                    }
                }
            }
        } else {
            log::info!(
                "alsa: xruns(read={} write={}) short(read={} write={}) nonFinite={} swaps={} \
                 nframes={} peakIn={:.3} peakChain={:.3} peakOut={:.3}",
                stats.xruns_read,
                stats.xruns_write,
                stats.short_read,
                stats.short_write,
                stats.non_finite,
                stats.swaps,
                period,
                stats.peak_in,
                stats.peak_chain,
                stats.peak_out
            );
        }
    }

    stats.swaps = 0;
    stats.chain_calls = 0;
    stats.chain_sum_us = 0;
    stats.chain_max_us = 0;
    stats.chain_overruns = 0;
    stats.peak_in = 0.0;
    stats.peak_chain = 0.0;
    stats.peak_out = 0.0;
}
