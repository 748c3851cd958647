use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::chain::ProcessContext;
use crate::fft_convolver::FftConvolver;
use crate::ir_loader;
use crate::nam;
use crate::params::{db_to_lin, RtParams};
use crate::schema::NodeSpec;

/// One element of the signal chain.
///
/// `process` runs on the audio thread: no allocation, no locks, no I/O, no
/// panics. Disabled nodes copy input to output verbatim.
pub trait Node: Send {
    fn id(&self) -> &str;
    fn node_type(&self) -> &'static str;
    fn process(&mut self, input: &[f32], output: &mut [f32]);
}

impl std::fmt::Debug for dyn Node + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("node_type", &self.node_type())
            .finish()
    }
}

#[derive(Debug)]
pub struct BuiltNode {
    pub node: Box<dyn Node>,
    pub warning: Option<String>,
}

/// Parameters every node understands, pre-resolved so `process()` stays free
/// of `powf`.
#[derive(Clone, Copy)]
struct StdParams {
    enabled: bool,
    level_lin: f32,
    wet: f32,
    dry: f32,
}

fn parse_std(spec: &NodeSpec) -> StdParams {
    let enabled = spec.bool_param("enabled").unwrap_or(spec.enabled);

    let mut level_db = 0.0f32;
    if let Some(v) = spec.num_param("levelDb") {
        level_db = v as f32;
    }
    if let Some(v) = spec.num_param("outputGainDb") {
        // Older configs used outputGainDb for the same knob.
        level_db = v as f32;
    }
    let level_db = level_db.clamp(-48.0, 24.0);
    let mix = spec.num_param("mix").unwrap_or(1.0).clamp(0.0, 1.0) as f32;

    StdParams {
        enabled,
        level_lin: db_to_lin(level_db),
        wet: mix,
        dry: 1.0 - mix,
    }
}

#[inline]
fn softclip_cubic(x: f32) -> f32 {
    let x = x.clamp(-1.0, 1.0);
    x - x * x * x * (1.0 / 3.0)
}

// ---------------------------------------------------------------------------
// Node variants
// ---------------------------------------------------------------------------

/// Stands in for a bypassed nam_model / ir_convolver so the chain layout is
/// preserved even when an asset is missing.
struct PassthroughNode {
    id: String,
    label: &'static str,
    std: StdParams,
}

impl Node for PassthroughNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn node_type(&self) -> &'static str {
        self.label
    }
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        if !self.std.enabled {
            output.copy_from_slice(input);
            return;
        }
        let (level, wet, dry) = (self.std.level_lin, self.std.wet, self.std.dry);
        for (o, &x) in output.iter_mut().zip(input) {
            *o = x * dry + x * level * wet;
        }
    }
}

/// First chain element: applies the shared realtime trim, read once per block.
struct InputNode {
    id: String,
    std: StdParams,
    params: Arc<RtParams>,
}

impl Node for InputNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn node_type(&self) -> &'static str {
        "input"
    }
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        if !self.std.enabled {
            output.copy_from_slice(input);
            return;
        }
        let trim = self.params.input_trim_lin.load(Ordering::Relaxed);
        let (level, wet, dry) = (self.std.level_lin, self.std.wet, self.std.dry);
        for (o, &x) in output.iter_mut().zip(input) {
            *o = x * dry + x * trim * level * wet;
        }
    }
}

/// Final gain/mix stage. No trim.
struct OutputNode {
    id: String,
    std: StdParams,
}

impl Node for OutputNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn node_type(&self) -> &'static str {
        "output"
    }
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        if !self.std.enabled {
            output.copy_from_slice(input);
            return;
        }
        let (level, wet, dry) = (self.std.level_lin, self.std.wet, self.std.dry);
        for (o, &x) in output.iter_mut().zip(input) {
            *o = x * dry + x * level * wet;
        }
    }
}

/// Cubic soft clipper with a one-pole tone blend.
struct OverdriveNode {
    id: String,
    std: StdParams,
    pre: f32,
    smooth_coeff: f32,
    tone: f32,
    tone_inv: f32,
    post_lin: f32,
    z1: f32,
}

impl OverdriveNode {
    fn build(id: &str, std: StdParams, drive: f32, tone: f32) -> Self {
        let drive = drive.clamp(0.0, 1.0);
        let tone = tone.clamp(0.0, 1.0);
        Self {
            id: id.to_string(),
            std,
            pre: 1.0 + drive * 20.0,
            smooth_coeff: 0.02 + (1.0 - tone) * 0.2,
            tone,
            tone_inv: 1.0 - tone,
            post_lin: std.level_lin,
            z1: 0.0,
        }
    }
}

impl Node for OverdriveNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn node_type(&self) -> &'static str {
        "overdrive"
    }
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        if !self.std.enabled {
            output.copy_from_slice(input);
            return;
        }
        let (wet_g, dry_g) = (self.std.wet, self.std.dry);
        let mut z = self.z1;
        for (o, &x) in output.iter_mut().zip(input) {
            let y = softclip_cubic(x * self.pre);
            z += self.smooth_coeff * (y - z);
            let wet = (z * self.tone_inv + y * self.tone) * self.post_lin;
            *o = x * dry_g + wet * wet_g;
        }
        self.z1 = z;
    }
}

/// Neural amp model stage: pre gain, limiter, optional softclip, model, post
/// gain, wet/dry.
struct NamModelNode {
    id: String,
    std: StdParams,
    model: Box<dyn nam::NamModel>,
    max_frames: usize,
    in_buf: Vec<f32>,
    out_buf: Vec<f32>,
    pre_lin: f32,
    post_lin: f32,
    limit: f32,
    softclip: bool,
    softclip_tanh: bool,
}

impl Node for NamModelNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn node_type(&self) -> &'static str {
        "nam_model"
    }
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        if !self.std.enabled {
            output.copy_from_slice(input);
            return;
        }
        let frames = input.len().min(self.max_frames);
        let (pre, post, lim) = (self.pre_lin, self.post_lin, self.limit);
        let (wet_g, dry_g) = (self.std.wet, self.std.dry);

        for i in 0..frames {
            let x = (input[i] * pre).clamp(-lim, lim);
            self.in_buf[i] = if !self.softclip {
                x
            } else if self.softclip_tanh {
                x.tanh()
            } else {
                softclip_cubic(x)
            };
        }

        self.model
            .process(&self.in_buf[..frames], &mut self.out_buf[..frames]);

        for i in 0..frames {
            output[i] = input[i] * dry_g + self.out_buf[i] * post * wet_g;
        }
        // Tail passthrough if the caller ever hands us more than we sized for.
        for i in frames..input.len() {
            output[i] = input[i];
        }
    }
}

/// Cabinet stage: partitioned FFT convolution against a loaded IR.
struct IrConvolverNode {
    id: String,
    std: StdParams,
    conv: FftConvolver,
    wet_buf: Vec<f32>,
    max_frames: usize,
}

impl Node for IrConvolverNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn node_type(&self) -> &'static str {
        "ir_convolver"
    }
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        if !self.std.enabled {
            output.copy_from_slice(input);
            return;
        }
        let frames = input.len().min(self.max_frames);
        if self
            .conv
            .process(&input[..frames], &mut self.wet_buf[..frames])
            .is_err()
        {
            // Block size mismatch; fall back to dry for this block.
            self.wet_buf[..frames].copy_from_slice(&input[..frames]);
        }

        let (level, wet_g, dry_g) = (self.std.level_lin, self.std.wet, self.std.dry);
        for i in 0..frames {
            output[i] = input[i] * dry_g + self.wet_buf[i] * level * wet_g;
        }
        for i in frames..input.len() {
            output[i] = input[i];
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

fn bypassed(id: &str, label: &'static str, spec: &NodeSpec) -> Box<dyn Node> {
    let mut std = parse_std(spec);
    std.enabled = false;
    Box::new(PassthroughNode {
        id: id.to_string(),
        label,
        std,
    })
}

fn shape_ir(spec: &NodeSpec, ctx: &ProcessContext, ir: &mut Vec<f32>) -> Option<String> {
    let gain_db = spec.num_param("gainDb").unwrap_or(0.0).clamp(-24.0, 24.0) as f32;
    let gain_lin = db_to_lin(gain_db);
    if gain_lin != 1.0 {
        for v in ir.iter_mut() {
            *v *= gain_lin;
        }
    }

    if let Some(target_db) = spec.num_param("targetDb") {
        let target = db_to_lin(target_db.clamp(-24.0, 0.0) as f32);
        let peak = ir.iter().fold(0.0f32, |p, v| p.max(v.abs()));
        if peak > 0.0 {
            let norm = target / peak;
            for v in ir.iter_mut() {
                *v *= norm;
            }
        }
    }

    // Truncation cap: node params first, then the process-wide env knob.
    let mut max_samples = spec
        .num_param("maxSamples")
        .filter(|&v| v > 0.0)
        .map(|v| v.round() as usize)
        .unwrap_or(0);
    if max_samples == 0 {
        if let Some(ms) = spec.num_param("maxMs").filter(|&v| v > 0.0) {
            max_samples = (ms / 1000.0 * ctx.sample_rate as f64).round() as usize;
        }
    }
    if max_samples == 0 {
        if let Ok(v) = std::env::var("IR_MAX_SAMPLES") {
            max_samples = v.parse().unwrap_or(0);
        }
    }

    if max_samples > 0 && ir.len() > max_samples {
        // Raised-cosine tail so the cut does not ring.
        let taper = 128usize.min(max_samples);
        if taper > 1 {
            let start = max_samples - taper;
            for i in 0..taper {
                let t = i as f32 / (taper - 1) as f32;
                ir[start + i] *= 0.5 * (1.0 + (std::f32::consts::PI * t).cos());
            }
        }
        let old_len = ir.len();
        ir.truncate(max_samples);
        return Some(format!(
            "IR trimmed from {} to {} samples",
            old_len, max_samples
        ));
    }
    None
}

/// Build one RT-safe node from its spec. Heavy work (model and IR loading)
/// happens here, off the audio thread.
pub fn build_node(spec: &NodeSpec, ctx: &ProcessContext) -> Result<BuiltNode> {
    match spec.node_type.as_str() {
        "input" => {
            let std = parse_std(spec);
            let trim_db = spec
                .num_param("inputTrimDb")
                .unwrap_or(0.0)
                .clamp(-24.0, 24.0) as f32;
            // Seed the realtime store so boot config / UI values take effect;
            // runtime controls keep updating the same cells afterwards.
            ctx.params.set_input_trim_db(trim_db);
            Ok(BuiltNode {
                node: Box::new(InputNode {
                    id: spec.id.clone(),
                    std,
                    params: Arc::clone(&ctx.params),
                }),
                warning: None,
            })
        }

        "output" => Ok(BuiltNode {
            node: Box::new(OutputNode {
                id: spec.id.clone(),
                std: parse_std(spec),
            }),
            warning: None,
        }),

        "overdrive" => {
            let drive = spec.num_param("drive").unwrap_or(0.6) as f32;
            let tone = spec.num_param("tone").unwrap_or(0.5) as f32;
            Ok(BuiltNode {
                node: Box::new(OverdriveNode::build(&spec.id, parse_std(spec), drive, tone)),
                warning: None,
            })
        }

        "nam_model" => {
            if !spec.enabled {
                return Ok(BuiltNode {
                    node: bypassed(&spec.id, "nam_model", spec),
                    warning: None,
                });
            }
            let asset = match &spec.asset {
                Some(a) if !a.path.is_empty() => a,
                _ => {
                    // Boot safety: run the chain even without the model file.
                    return Ok(BuiltNode {
                        node: bypassed(&spec.id, "nam_model", spec),
                        warning: Some("nam_model missing asset.path (bypassing)".into()),
                    });
                }
            };

            let mut model = nam::load_file(std::path::Path::new(&asset.path))
                .context("Failed to load NAM model")?;
            // Build-time prepare: the runtime sizes itself for the engine's
            // rate and period and prewarms before the first audio block.
            model.reset(ctx.sample_rate, ctx.max_block_frames);

            let mut warning = None;
            let model_rate = model.expected_sample_rate();
            if model_rate != 0 && model_rate != ctx.sample_rate {
                warning = Some(format!(
                    "NAM expected sampleRate={} but engine is {}",
                    model_rate, ctx.sample_rate
                ));
            }

            let std = parse_std(spec);
            let pre_gain_db = spec.num_param("preGainDb").unwrap_or(-12.0) as f32;
            let post_gain_db = spec.num_param("postGainDb").unwrap_or(0.0) as f32;
            let limit = spec.num_param("inLimit").unwrap_or(0.90).clamp(0.05, 1.0) as f32;
            let softclip = spec.bool_param("softclip").unwrap_or(true);
            let softclip_tanh = spec.bool_param("softclipTanh").unwrap_or(false);
            let use_input_level = spec.bool_param("useInputLevel").unwrap_or(true);

            // Calibrate toward the model's recorded operating level. The
            // 12.2 dBu reference is the conventional interface level of a
            // 0 dBFS sine on this hardware.
            let mut level_scale = 1.0f32;
            if use_input_level {
                if let Some(model_dbu) = model.input_level_dbu() {
                    level_scale = db_to_lin(12.2 - model_dbu);
                }
            }

            Ok(BuiltNode {
                node: Box::new(NamModelNode {
                    id: spec.id.clone(),
                    std,
                    model,
                    max_frames: ctx.max_block_frames,
                    in_buf: vec![0.0; ctx.max_block_frames],
                    out_buf: vec![0.0; ctx.max_block_frames],
                    pre_lin: db_to_lin(pre_gain_db) * level_scale,
                    post_lin: db_to_lin(post_gain_db) * std.level_lin,
                    limit,
                    softclip,
                    softclip_tanh,
                }),
                warning,
            })
        }

        "ir_convolver" => {
            if !spec.enabled {
                return Ok(BuiltNode {
                    node: bypassed(&spec.id, "ir_convolver", spec),
                    warning: None,
                });
            }
            let asset = match &spec.asset {
                Some(a) if !a.path.is_empty() => a,
                _ => {
                    return Ok(BuiltNode {
                        node: bypassed(&spec.id, "ir_convolver", spec),
                        warning: Some("ir_convolver missing asset.path (bypassing)".into()),
                    });
                }
            };

            let mut ir = ir_loader::load(std::path::Path::new(&asset.path))
                .context("Failed to load IR")?;
            if ir.sample_rate != ctx.sample_rate {
                bail!(
                    "IR sample-rate mismatch (IR={} engine={})",
                    ir.sample_rate,
                    ctx.sample_rate
                );
            }

            let warning = shape_ir(spec, ctx, &mut ir.mono);
            let conv = FftConvolver::new(&ir.mono, ctx.max_block_frames)
                .context("IR convolver init failed")?;

            Ok(BuiltNode {
                node: Box::new(IrConvolverNode {
                    id: spec.id.clone(),
                    std: parse_std(spec),
                    conv,
                    wet_buf: vec![0.0; ctx.max_block_frames],
                    max_frames: ctx.max_block_frames,
                }),
                warning,
            })
        }

        other => bail!("Unknown node type: {}", other),
    }
}

/// Static node-type manifest served by `list_types`: categories, asset
/// requirements and parameter ranges for each buildable type.
pub fn node_type_manifest() -> Value {
    json!({
        "version": 1,
        "types": [
            {
                "type": "overdrive",
                "category": "fx",
                "params": [
                    {"key": "enabled", "type": "bool", "default": true},
                    {"key": "mix", "type": "float", "min": 0.0, "max": 1.0, "default": 1.0},
                    {"key": "levelDb", "type": "float", "min": -48.0, "max": 24.0, "default": 0.0},
                    {"key": "drive", "type": "float", "min": 0.0, "max": 1.0, "default": 0.6},
                    {"key": "tone", "type": "float", "min": 0.0, "max": 1.0, "default": 0.5}
                ]
            },
            {
                "type": "nam_model",
                "category": "amp",
                "asset": {"required": true, "kind": "nam_model"},
                "params": [
                    {"key": "enabled", "type": "bool", "default": true},
                    {"key": "mix", "type": "float", "min": 0.0, "max": 1.0, "default": 1.0},
                    {"key": "levelDb", "type": "float", "min": -48.0, "max": 24.0, "default": 0.0},
                    {"key": "preGainDb", "type": "float", "min": -24.0, "max": 24.0, "default": -12.0},
                    {"key": "postGainDb", "type": "float", "min": -24.0, "max": 24.0, "default": 0.0},
                    {"key": "inLimit", "type": "float", "min": 0.05, "max": 1.0, "default": 0.90},
                    {"key": "softclip", "type": "bool", "default": true},
                    {"key": "softclipTanh", "type": "bool", "default": false},
                    {"key": "useInputLevel", "type": "bool", "default": true}
                ]
            },
            {
                "type": "ir_convolver",
                "category": "cab",
                "asset": {"required": true, "kind": "ir_wav"},
                "params": [
                    {"key": "enabled", "type": "bool", "default": true},
                    {"key": "mix", "type": "float", "min": 0.0, "max": 1.0, "default": 1.0},
                    {"key": "levelDb", "type": "float", "min": -48.0, "max": 24.0, "default": 0.0},
                    {"key": "gainDb", "type": "float", "min": -24.0, "max": 24.0, "default": 0.0},
                    {"key": "targetDb", "type": "float", "min": -24.0, "max": 0.0, "default": -6.0},
                    {"key": "maxSamples", "type": "float", "min": 0.0, "max": 192000.0, "default": 0.0},
                    {"key": "maxMs", "type": "float", "min": 0.0, "max": 500.0, "default": 0.0}
                ]
            },
            {"type": "input", "category": "utility"},
            {"type": "output", "category": "utility"}
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use serde_json::Map;

    fn ctx() -> ProcessContext {
        ProcessContext {
            sample_rate: 48000,
            max_block_frames: 64,
            params: Arc::new(RtParams::new()),
        }
    }

    fn spec_with(node_type: &str, params: Value) -> NodeSpec {
        let mut spec = NodeSpec::new("n1", node_type, "");
        spec.params = params.as_object().cloned().unwrap_or_else(Map::new);
        spec
    }

    fn write_ir_wav(path: &std::path::Path, sample_rate: u32, samples: &[f32]) {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut w = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn disabled_node_copies_verbatim() {
        let mut spec = spec_with("output", json!({"levelDb": -12.0}));
        spec.enabled = false;
        let mut built = build_node(&spec, &ctx()).unwrap();
        let input = [0.1f32, -0.2, 0.3, -0.4];
        let mut out = [0.0f32; 4];
        built.node.process(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn params_enabled_overrides_field() {
        let mut spec = spec_with("output", json!({"enabled": false, "levelDb": 12.0}));
        spec.enabled = true;
        let mut built = build_node(&spec, &ctx()).unwrap();
        let input = [0.5f32; 4];
        let mut out = [0.0f32; 4];
        built.node.process(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn input_node_follows_the_trim_atomic() {
        let ctx = ctx();
        let spec = spec_with("input", json!({"inputTrimDb": 0.0}));
        let mut built = build_node(&spec, &ctx).unwrap();

        let input = [0.5f32; 8];
        let mut out = [0.0f32; 8];
        built.node.process(&input, &mut out);
        assert!((out[0] - 0.5).abs() < 1e-6);

        ctx.params.set_input_trim_db(-20.0);
        built.node.process(&input, &mut out);
        assert!((out[0] - 0.05).abs() < 1e-4);
    }

    #[test]
    fn input_node_seeds_trim_from_spec() {
        let ctx = ctx();
        let spec = spec_with("input", json!({"inputTrimDb": 6.0}));
        let _ = build_node(&spec, &ctx).unwrap();
        assert!((ctx.params.input_trim_db.load(Ordering::Relaxed) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn overdrive_is_bounded_and_decays_on_silence() {
        let spec = spec_with("overdrive", json!({"drive": 1.0, "tone": 0.5}));
        let mut built = build_node(&spec, &ctx()).unwrap();

        let loud = [1.0f32; 64];
        let mut out = [0.0f32; 64];
        built.node.process(&loud, &mut out);
        // Cubic softclip maxes out at 2/3 before level/mix.
        assert!(out.iter().all(|v| v.abs() <= 0.67));

        for _ in 0..64 {
            built.node.process(&[0.0; 64], &mut out);
        }
        assert!(out.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn nam_missing_asset_bypasses_with_warning() {
        let spec = spec_with("nam_model", json!({}));
        let mut built = build_node(&spec, &ctx()).unwrap();
        assert!(built.warning.as_deref().unwrap().contains("missing asset"));
        assert_eq!(built.node.node_type(), "nam_model");

        let input = [0.3f32; 16];
        let mut out = [0.0f32; 16];
        built.node.process(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn nam_build_is_a_hard_error_without_the_runtime() {
        // An enabled amp with an asset must fail the whole build when the
        // external runtime is unavailable, not silently bypass.
        let mut spec = spec_with("nam_model", json!({}));
        spec.asset = Some(crate::schema::AssetRef {
            path: "/opt/pedal/models/some.nam".into(),
        });
        let err = build_node(&spec, &ctx()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to load NAM model"));
    }

    #[test]
    #[ignore = "requires the external NAM runtime and a profile in NAM_TEST_PROFILE"]
    fn nam_node_builds_against_the_external_runtime() {
        let profile = match std::env::var("NAM_TEST_PROFILE") {
            Ok(p) => p,
            Err(_) => return,
        };
        let mut spec = spec_with("nam_model", json!({"preGainDb": 0.0}));
        spec.asset = Some(crate::schema::AssetRef { path: profile });
        let mut built = build_node(&spec, &ctx()).unwrap();

        let input = [0.25f32; 64];
        let mut out = [0.0f32; 64];
        built.node.process(&input, &mut out);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn ir_sample_rate_mismatch_is_a_hard_error() {
        let path = std::env::temp_dir().join("pedal_ir_441.wav");
        write_ir_wav(&path, 44100, &[1.0, 0.5, 0.25, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let mut spec = spec_with("ir_convolver", json!({}));
        spec.asset = Some(crate::schema::AssetRef {
            path: path.to_string_lossy().into_owned(),
        });
        let err = build_node(&spec, &ctx()).unwrap_err();
        assert!(format!("{err:#}").contains("sample-rate mismatch"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ir_truncation_warns_and_builds() {
        let path = std::env::temp_dir().join("pedal_ir_long.wav");
        let mut samples = vec![0.0f32; 4000];
        samples[0] = 1.0;
        write_ir_wav(&path, 48000, &samples);

        let mut spec = spec_with("ir_convolver", json!({"maxSamples": 512.0}));
        spec.asset = Some(crate::schema::AssetRef {
            path: path.to_string_lossy().into_owned(),
        });
        let mut built = build_node(&spec, &ctx()).unwrap();
        assert!(built
            .warning
            .as_deref()
            .unwrap()
            .contains("trimmed from 4000 to 512"));

        let input = [0.5f32; 64];
        let mut out = [0.0f32; 64];
        built.node.process(&input, &mut out);
        assert!(out.iter().all(|v| v.is_finite()));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let spec = spec_with("fuzzbox", json!({}));
        let err = build_node(&spec, &ctx()).unwrap_err();
        assert_eq!(err.to_string(), "Unknown node type: fuzzbox");
    }

    #[test]
    fn manifest_lists_the_nam_parameter_set() {
        let manifest = node_type_manifest();
        let types = manifest["types"].as_array().unwrap();
        let nam = types
            .iter()
            .find(|t| t["type"] == "nam_model")
            .expect("nam_model entry");
        let keys: Vec<&str> = nam["params"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["key"].as_str().unwrap())
            .collect();
        for expected in [
            "enabled",
            "mix",
            "levelDb",
            "preGainDb",
            "postGainDb",
            "inLimit",
            "softclip",
            "softclipTanh",
            "useInputLevel",
        ] {
            assert!(keys.contains(&expected), "missing key {expected}");
        }
    }
}
