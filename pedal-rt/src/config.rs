use std::path::PathBuf;

use pedal_dsp::schema::{self, ChainSpec, NodeSpec};
use pedal_dsp::RtParams;
use serde_json::json;

pub const DEFAULT_CONFIG_PATH: &str = "/opt/pedal/config/chain.json";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/pedal-dsp.sock";

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_u32_allow_zero(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse::<f32>().ok())
}

/// Boolean knob: unset uses the default, "0" is off, anything else is on.
fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v != "0",
        Err(_) => default,
    }
}

fn env_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

/// Engine configuration resolved from the environment at startup.
pub struct EngineConfig {
    pub capture_device: String,
    pub playback_device: String,
    pub rate: u32,
    pub period: usize,
    pub periods: u32,
    pub capture_channels: u32,
    pub playback_channels: u32,

    pub enable_rt: bool,
    pub rt_priority: i32,
    pub denormals_off: bool,
    pub enforce_release: bool,

    pub prime_frames: Option<u32>,
    pub disable_link: bool,

    pub chain_xfade: bool,
    pub swap_ramp_samples: u32,

    pub baseline: bool,
    pub baseline_chain_us_max: u64,
    pub capture_sanity_secs: u32,
    pub capture_silent_peak: f32,

    pub config_path: PathBuf,
    pub socket_path: PathBuf,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let device = std::env::var("DEVICE").unwrap_or_else(|_| "hw:0,0".into());
        let capture_device = std::env::var("CAPTURE_DEVICE").unwrap_or_else(|_| device.clone());
        let playback_device = std::env::var("PLAYBACK_DEVICE").unwrap_or_else(|_| device.clone());

        let shared_channels = env_u32("CHANNELS", 0);
        let capture_channels = env_u32(
            "CAPTURE_CHANNELS",
            if shared_channels > 0 { shared_channels } else { 1 },
        );
        let playback_channels = env_u32(
            "PLAYBACK_CHANNELS",
            if shared_channels > 0 { shared_channels } else { 2 },
        );

        let chain_xfade = env_set("CHAIN_XFADE");

        Self {
            capture_device,
            playback_device,
            rate: env_u32("RATE", 48000).max(8000),
            period: env_u32("PERIOD", 128).max(16) as usize,
            periods: env_u32("PERIODS", 3).max(2),
            capture_channels,
            playback_channels,
            enable_rt: env_flag("ENABLE_RT", true),
            rt_priority: env_u32("RT_PRIORITY", 80) as i32,
            denormals_off: env_flag("DENORMALS_OFF", true),
            enforce_release: env_flag("ENFORCE_RELEASE", true),
            prime_frames: if env_set("PRIME_FRAMES") {
                Some(env_u32_allow_zero("PRIME_FRAMES", 0))
            } else {
                None
            },
            disable_link: env_set("DISABLE_LINK"),
            chain_xfade,
            swap_ramp_samples: if chain_xfade {
                env_u32_allow_zero("SWAP_RAMP_SAMPLES", 32)
            } else {
                0
            },
            baseline: env_set("BASELINE"),
            baseline_chain_us_max: env_u32_allow_zero("BASELINE_CHAIN_US_MAX", 2000) as u64,
            capture_sanity_secs: env_u32("CAPTURE_SANITY_SECS", 2),
            capture_silent_peak: env_f32("CAPTURE_SILENT_PEAK").unwrap_or(1.0e-5),
            config_path: std::env::var("CHAIN_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
            socket_path: std::env::var("DSP_CONTROL_SOCK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH)),
        }
    }
}

/// Apply boot-time environment overrides to the shared realtime cells.
pub fn apply_env_overrides(params: &RtParams) {
    use std::sync::atomic::Ordering;

    if let Some(v) = env_f32("INPUT_TRIM_DB") {
        params.set_input_trim_db(v);
    }
    if let Some(v) = env_f32("OUTPUT_GAIN_DB") {
        params.set_output_gain_db(v);
    }
    params
        .passthrough
        .store(env_flag("PASSTHROUGH", false), Ordering::Relaxed);
    params
        .bypass_nam
        .store(env_flag("BYPASS_NAM", false), Ordering::Relaxed);
    params
        .bypass_ir
        .store(env_flag("BYPASS_IR", false), Ordering::Relaxed);
    params
        .sanitize_output
        .store(env_flag("SANITIZE_OUTPUT", false), Ordering::Relaxed);
    params
        .verbose_xruns
        .store(env_flag("VERBOSE_XRUN", false), Ordering::Relaxed);
    params
        .log_stats
        .store(env_flag("LOG_STATS", false), Ordering::Relaxed);
    params
        .log_timing
        .store(env_flag("LOG_TIMING", false), Ordering::Relaxed);
}

/// Load and validate the boot chain config. Any failure logs and returns
/// `None`; the engine then starts with the built-in default chain.
pub fn load_boot_spec(path: &std::path::Path) -> Option<ChainSpec> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            log::warn!("config: could not open {:?} (using defaults): {}", path, e);
            return None;
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("config: invalid JSON in {:?}: {}", path, e);
            return None;
        }
    };
    let spec = match schema::parse_chain_value(&value) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("config: invalid chain in {:?}: {:#}", path, e);
            return None;
        }
    };
    match schema::validate(spec) {
        Ok(s) => {
            log::info!("config: loaded chain from {:?} ({} nodes)", path, s.chain.len());
            Some(s)
        }
        Err(e) => {
            log::warn!("config: chain in {:?} failed validation: {:#}", path, e);
            None
        }
    }
}

/// The built-in chain used when no valid config exists: input → amp → cab →
/// output, with the amp and cab falling back to bypass when their assets are
/// missing.
pub fn default_chain_spec(sample_rate: u32) -> ChainSpec {
    let mut input = NodeSpec::new("input", "input", "utility");
    input.params.insert("inputTrimDb".into(), json!(0.0));

    let mut amp = NodeSpec::new("amp1", "nam_model", "amp");
    amp.params.insert("preGainDb".into(), json!(-12.0));
    amp.params.insert("postGainDb".into(), json!(0.0));
    amp.params.insert("levelDb".into(), json!(0.0));

    let mut cab = NodeSpec::new("cab1", "ir_convolver", "cab");
    cab.params.insert("levelDb".into(), json!(0.0));
    cab.params.insert("targetDb".into(), json!(-6.0));

    let mut output = NodeSpec::new("output", "output", "utility");
    output.params.insert("levelDb".into(), json!(0.0));

    ChainSpec {
        version: 1,
        sample_rate,
        chain: vec![input, amp, cab, output],
    }
}

/// Fold the process-wide bypass toggles into a spec before building it.
pub fn apply_bypass_flags(spec: &mut ChainSpec, params: &RtParams) {
    use std::sync::atomic::Ordering;
    let passthrough = params.passthrough.load(Ordering::Relaxed);
    let bypass_nam = params.bypass_nam.load(Ordering::Relaxed);
    let bypass_ir = params.bypass_ir.load(Ordering::Relaxed);

    for n in &mut spec.chain {
        match n.node_type.as_str() {
            "nam_model" if passthrough || bypass_nam => n.enabled = false,
            "ir_convolver" if passthrough || bypass_ir => n.enabled = false,
            _ => {}
        }
    }
}

/// Assemble the boot chain with the fallback ladder: the configured spec,
/// then the default chain with amp/cab bypassed, then an empty passthrough
/// chain. Returns the chain plus the spec it was built from.
pub fn build_boot_chain(
    boot: Option<ChainSpec>,
    ctx: &pedal_dsp::chain::ProcessContext,
    params: &RtParams,
) -> (Box<pedal_dsp::SignalChain>, ChainSpec) {
    let mut spec = boot.unwrap_or_else(|| default_chain_spec(ctx.sample_rate));
    spec.sample_rate = ctx.sample_rate;
    apply_bypass_flags(&mut spec, params);
    inject_env_trim(&mut spec, params);

    let spec = match schema::validate(spec) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("chain: boot chain invalid after normalization: {:#}", e);
            let mut fb = default_chain_spec(ctx.sample_rate);
            apply_bypass_flags(&mut fb, params);
            fb
        }
    };

    match pedal_dsp::build_chain(&spec, ctx) {
        Ok(built) => {
            for w in &built.warnings {
                log::warn!("chain: {}", w);
            }
            (Box::new(built.chain), spec)
        }
        Err(e) => {
            log::error!("chain: failed to build boot chain: {:#}", e);
            let mut fb = default_chain_spec(ctx.sample_rate);
            for n in &mut fb.chain {
                if n.node_type == "nam_model" || n.node_type == "ir_convolver" {
                    n.enabled = false;
                }
            }
            match pedal_dsp::build_chain(&fb, ctx) {
                Ok(built) => (Box::new(built.chain), fb),
                Err(e2) => {
                    log::error!(
                        "chain: fallback chain failed too, running passthrough: {:#}",
                        e2
                    );
                    let empty = ChainSpec {
                        version: 1,
                        sample_rate: ctx.sample_rate,
                        chain: Vec::new(),
                    };
                    let built = pedal_dsp::build_chain(&empty, ctx)
                        .expect("empty chain cannot fail to build");
                    (Box::new(built.chain), empty)
                }
            }
        }
    }
}

/// Propagate an `INPUT_TRIM_DB` override into the boot spec's input node so
/// it survives `get_chain` and persistence round-trips.
pub fn inject_env_trim(spec: &mut ChainSpec, params: &RtParams) {
    use std::sync::atomic::Ordering;
    if !env_set("INPUT_TRIM_DB") {
        return;
    }
    let v = params.input_trim_db.load(Ordering::Relaxed).clamp(-24.0, 24.0);
    if let Some(input) = spec.chain.iter_mut().find(|n| n.node_type == "input") {
        input.params.insert("inputTrimDb".into(), json!(v));
    }
}
