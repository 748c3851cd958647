use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hound::{SampleFormat, WavSpec, WavWriter};
use pedal_dsp::chain::ProcessContext;
use pedal_dsp::params::RtParams;
use pedal_dsp::schema::{parse_chain_value, validate};
use pedal_dsp::{build_chain, SignalChain};
use serde_json::json;

const SAMPLE_RATE: u32 = 48000;
const BLOCK: usize = 128;

fn unique_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after unix epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("pedal_chain_smoke_{nanos}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A short decaying-noise IR, loud enough to survive normalization.
fn write_ir(path: &Path) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let mut x = 0x2545_f491u32;
    for i in 0..1024u32 {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        let noise = (x as f32 / u32::MAX as f32) * 2.0 - 1.0;
        let decay = (-(i as f32) / 200.0).exp();
        writer.write_sample(noise * decay).unwrap();
    }
    writer.finalize().unwrap();
}

fn chain_spec_value(dir: &Path, amp_asset: Option<&str>) -> serde_json::Value {
    let ir_path = dir.join("cab.wav");
    write_ir(&ir_path);

    // Without the external runtime the amp stage runs bypassed; the rest of
    // the chain (trim, overdrive, convolver, output) is fully live.
    let amp = match amp_asset {
        Some(path) => json!({
            "id": "amp1", "type": "nam_model", "category": "amp", "enabled": true,
            "params": {"preGainDb": -6.0, "postGainDb": 0.0},
            "asset": {"path": path}
        }),
        None => json!({
            "id": "amp1", "type": "nam_model", "category": "amp", "enabled": false,
            "params": {}
        }),
    };

    json!({
        "version": 1,
        "sampleRate": SAMPLE_RATE,
        "chain": [
            {"id": "input", "type": "input", "category": "utility", "enabled": true,
             "params": {"inputTrimDb": 0.0}},
            {"id": "od1", "type": "overdrive", "category": "fx", "enabled": true,
             "params": {"drive": 0.4, "tone": 0.5}},
            amp,
            {"id": "cab1", "type": "ir_convolver", "category": "cab", "enabled": true,
             "params": {"targetDb": -6.0},
             "asset": {"path": ir_path.to_string_lossy()}},
            {"id": "output", "type": "output", "category": "utility", "enabled": true,
             "params": {"levelDb": 0.0}}
        ]
    })
}

fn build_smoke_chain(dir: &Path, params: Arc<RtParams>, amp_asset: Option<&str>) -> SignalChain {
    let spec = validate(parse_chain_value(&chain_spec_value(dir, amp_asset)).unwrap()).unwrap();
    let ctx = ProcessContext {
        sample_rate: SAMPLE_RATE,
        max_block_frames: BLOCK,
        params,
    };
    let built = build_chain(&spec, &ctx).unwrap();
    assert!(built.warnings.is_empty(), "warnings: {:?}", built.warnings);
    built.chain
}

fn sine_block(phase: &mut f32, freq: f32, out: &mut [f32]) {
    let inc = 2.0 * std::f32::consts::PI * freq / SAMPLE_RATE as f32;
    for s in out.iter_mut() {
        *s = phase.sin() * 0.1;
        *phase += inc;
        if *phase > 2.0 * std::f32::consts::PI {
            *phase -= 2.0 * std::f32::consts::PI;
        }
    }
}

#[test]
fn full_chain_processes_a_guitar_like_signal() {
    let dir = unique_dir();
    let mut chain = build_smoke_chain(&dir, Arc::new(RtParams::new()), None);

    let mut input = [0.0f32; BLOCK];
    let mut output = [0.0f32; BLOCK];
    let mut phase = 0.0f32;
    let mut energy = 0.0f32;

    for _ in 0..32 {
        sine_block(&mut phase, 220.0, &mut input);
        chain.process(&input, &mut output);
        for &y in &output {
            assert!(y.is_finite(), "non-finite sample in chain output");
            energy += y * y;
        }
    }
    assert!(energy > 0.0, "chain output should carry signal energy");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn full_chain_decays_after_input_stops() {
    let dir = unique_dir();
    let mut chain = build_smoke_chain(&dir, Arc::new(RtParams::new()), None);

    let mut input = [0.0f32; BLOCK];
    let mut output = [0.0f32; BLOCK];
    let mut phase = 0.0f32;
    for _ in 0..16 {
        sine_block(&mut phase, 220.0, &mut input);
        chain.process(&input, &mut output);
    }

    // The stateful stages (smoother, IR tail) need time to ring out; a
    // second of silence is far beyond the IR length and the smoother decay.
    let silence = [0.0f32; BLOCK];
    for _ in 0..(SAMPLE_RATE as usize / BLOCK) {
        chain.process(&silence, &mut output);
    }
    let peak = output.iter().fold(0.0f32, |p, v| p.max(v.abs()));
    assert!(peak < 1e-4, "residual peak after silence: {peak}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn rebuilding_the_same_spec_reproduces_the_output() {
    let dir = unique_dir();
    let params = Arc::new(RtParams::new());
    let mut first = build_smoke_chain(&dir, Arc::clone(&params), None);
    let mut second = build_smoke_chain(&dir, params, None);

    let mut input = [0.0f32; BLOCK];
    let mut out_a = [0.0f32; BLOCK];
    let mut out_b = [0.0f32; BLOCK];
    let mut phase = 0.0f32;

    for _ in 0..8 {
        sine_block(&mut phase, 330.0, &mut input);
        first.process(&input, &mut out_a);
        second.process(&input, &mut out_b);
        for i in 0..BLOCK {
            assert!(
                (out_a[i] - out_b[i]).abs() < 1e-6,
                "chains diverged at sample {i}: {} vs {}",
                out_a[i],
                out_b[i]
            );
        }
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
#[ignore = "requires the external NAM runtime and a profile in NAM_TEST_PROFILE"]
fn full_rig_runs_with_the_external_amp_model() {
    let profile = match std::env::var("NAM_TEST_PROFILE") {
        Ok(p) => p,
        Err(_) => return,
    };

    let dir = unique_dir();
    let mut chain = build_smoke_chain(&dir, Arc::new(RtParams::new()), Some(&profile));

    let mut input = [0.0f32; BLOCK];
    let mut output = [0.0f32; BLOCK];
    let mut phase = 0.0f32;
    let mut energy = 0.0f32;
    for _ in 0..32 {
        sine_block(&mut phase, 220.0, &mut input);
        chain.process(&input, &mut output);
        for &y in &output {
            assert!(y.is_finite(), "non-finite sample in chain output");
            energy += y * y;
        }
    }
    assert!(energy > 0.0, "amp rig output should carry signal energy");

    let _ = std::fs::remove_dir_all(&dir);
}
