use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::nodes::{build_node, Node};
use crate::params::RtParams;
use crate::schema::ChainSpec;

/// Build-time parameters handed to every node factory.
#[derive(Clone)]
pub struct ProcessContext {
    pub sample_rate: u32,
    pub max_block_frames: usize,
    /// Shared realtime parameter cells (input trim etc.). New chains built
    /// for the same engine share the same cells, so runtime controls survive
    /// chain swaps.
    pub params: Arc<RtParams>,
}

/// Per-node-type timing snapshot entry.
#[derive(Clone, Copy, Default)]
pub struct NodeTimingStat {
    pub node_type: &'static str,
    pub calls: u64,
    pub sum_us: u64,
    pub max_us: u64,
}

#[derive(Default, Clone, Copy, Debug)]
struct TimingBucket {
    calls: u64,
    sum_us: u64,
    max_us: u64,
}

/// An executable ordered chain plus its ping-pong scratch buffers.
///
/// Built once off the audio thread; `process` is the only method meant to be
/// called from it. A chain is singly owned: it moves from the builder to the
/// pending slot, to the audio thread, and finally into the retire queue.
#[derive(Debug)]
pub struct SignalChain {
    spec: ChainSpec,
    nodes: Vec<Box<dyn Node>>,
    sample_rate: u32,
    max_block_frames: usize,
    buf_a: Vec<f32>,
    buf_b: Vec<f32>,
    timing_enabled: bool,
    timing_types: Vec<&'static str>,
    timing_buckets: Vec<TimingBucket>,
    node_to_bucket: Vec<usize>,
}

impl SignalChain {
    fn new(spec: ChainSpec, nodes: Vec<Box<dyn Node>>, ctx: &ProcessContext) -> Self {
        let timing_enabled = std::env::var("NODE_TIMING")
            .map(|v| v != "0")
            .unwrap_or(false);

        // Precompute node -> bucket indices so the audio thread only does
        // array lookups.
        let mut timing_types: Vec<&'static str> = Vec::new();
        let mut node_to_bucket = Vec::new();
        if timing_enabled {
            for node in &nodes {
                let t = node.node_type();
                let idx = match timing_types.iter().position(|&x| x == t) {
                    Some(i) => i,
                    None => {
                        timing_types.push(t);
                        timing_types.len() - 1
                    }
                };
                node_to_bucket.push(idx);
            }
        }
        let timing_buckets = vec![TimingBucket::default(); timing_types.len()];

        Self {
            spec,
            nodes,
            sample_rate: ctx.sample_rate,
            max_block_frames: ctx.max_block_frames,
            buf_a: vec![0.0; ctx.max_block_frames],
            buf_b: vec![0.0; ctx.max_block_frames],
            timing_enabled,
            timing_types,
            timing_buckets,
            node_to_bucket,
        }
    }

    pub fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn max_block_frames(&self) -> usize {
        self.max_block_frames
    }

    pub fn node_timing_enabled(&self) -> bool {
        self.timing_enabled
    }

    /// Run the chain for one block. RT-safe.
    ///
    /// Writes exactly `input.len()` samples. Frames beyond the chain's
    /// `max_block_frames` pass through verbatim; with a well-behaved device
    /// loop that branch is unreachable.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), output.len());
        let n = input.len().min(output.len());
        let frames = n.min(self.max_block_frames);

        if self.nodes.is_empty() {
            output[..n].copy_from_slice(&input[..n]);
            return;
        }

        let timing = self.timing_enabled;

        // Node 0: input -> A, then A -> B and swap for each later node so A
        // always holds the newest data.
        for i in 0..self.nodes.len() {
            let t0 = if timing { Some(Instant::now()) } else { None };
            {
                let Self {
                    nodes,
                    buf_a,
                    buf_b,
                    ..
                } = self;
                if i == 0 {
                    nodes[0].process(&input[..frames], &mut buf_a[..frames]);
                } else {
                    nodes[i].process(&buf_a[..frames], &mut buf_b[..frames]);
                }
            }
            if i > 0 {
                std::mem::swap(&mut self.buf_a, &mut self.buf_b);
            }
            if let Some(t0) = t0 {
                let us = t0.elapsed().as_micros() as u64;
                let bucket = &mut self.timing_buckets[self.node_to_bucket[i]];
                bucket.calls += 1;
                bucket.sum_us += us;
                bucket.max_us = bucket.max_us.max(us);
            }
        }

        output[..frames].copy_from_slice(&self.buf_a[..frames]);
        if frames < n {
            output[frames..n].copy_from_slice(&input[frames..n]);
        }
    }

    /// Copy timing buckets into `out`, optionally clearing the counters.
    /// Returns the number of entries written. RT-safe (no allocation).
    pub fn snapshot_node_timing(&mut self, out: &mut [NodeTimingStat], reset: bool) -> usize {
        if !self.timing_enabled || out.is_empty() {
            return 0;
        }
        let n = out.len().min(self.timing_buckets.len());
        for i in 0..n {
            out[i] = NodeTimingStat {
                node_type: self.timing_types[i],
                calls: self.timing_buckets[i].calls,
                sum_us: self.timing_buckets[i].sum_us,
                max_us: self.timing_buckets[i].max_us,
            };
            if reset {
                self.timing_buckets[i] = TimingBucket::default();
            }
        }
        n
    }
}

#[derive(Debug)]
pub struct BuiltChain {
    pub chain: SignalChain,
    pub warnings: Vec<String>,
}

/// Build a full chain from a validated spec. Heavy work allowed; runs on the
/// control thread (or at boot), never on the audio thread.
pub fn build_chain(spec: &ChainSpec, ctx: &ProcessContext) -> Result<BuiltChain> {
    let mut nodes = Vec::with_capacity(spec.chain.len());
    let mut warnings = Vec::new();

    for ns in &spec.chain {
        let built = build_node(ns, ctx).map_err(|e| {
            anyhow!(
                "Failed to build node '{}' ({}): {:#}",
                ns.id,
                ns.node_type,
                e
            )
        })?;
        if let Some(w) = built.warning {
            warnings.push(w);
        }
        nodes.push(built.node);
    }

    Ok(BuiltChain {
        chain: SignalChain::new(spec.clone(), nodes, ctx),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_chain_value, validate};
    use serde_json::json;

    fn ctx(max_block: usize) -> ProcessContext {
        ProcessContext {
            sample_rate: 48000,
            max_block_frames: max_block,
            params: Arc::new(RtParams::new()),
        }
    }

    fn bypassed_chain_spec(output_level_db: f64) -> ChainSpec {
        let v = json!({
            "version": 1,
            "sampleRate": 48000,
            "chain": [
                {"id": "in", "type": "input", "enabled": true, "params": {}},
                {"id": "amp", "type": "nam_model", "enabled": false, "params": {}},
                {"id": "cab", "type": "ir_convolver", "enabled": false, "params": {}},
                {"id": "out", "type": "output", "enabled": true,
                 "params": {"levelDb": output_level_db}}
            ]
        });
        validate(parse_chain_value(&v).unwrap()).unwrap()
    }

    #[test]
    fn writes_exactly_n_samples() {
        let ctx = ctx(32);
        let mut built = build_chain(&bypassed_chain_spec(0.0), &ctx).unwrap();

        let input: Vec<f32> = (0..32).map(|i| i as f32 / 32.0).collect();
        let mut out = vec![9.9f32; 32];
        built.chain.process(&input, &mut out);
        for i in 0..32 {
            assert!((out[i] - input[i]).abs() < 1e-6, "sample {i}");
        }
    }

    #[test]
    fn ping_pongs_through_even_and_odd_node_counts() {
        // 4 nodes (even) and 5 nodes (odd, extra overdrive at mix 0) must
        // both land the final data in the output buffer.
        let ctx = ctx(16);
        let mut even = build_chain(&bypassed_chain_spec(0.0), &ctx).unwrap();

        let v = json!({
            "version": 1,
            "chain": [
                {"id": "in", "type": "input", "enabled": true, "params": {}},
                {"id": "od", "type": "overdrive", "enabled": true, "params": {"mix": 0.0}},
                {"id": "amp", "type": "nam_model", "enabled": false, "params": {}},
                {"id": "cab", "type": "ir_convolver", "enabled": false, "params": {}},
                {"id": "out", "type": "output", "enabled": true, "params": {}}
            ]
        });
        let spec = validate(parse_chain_value(&v).unwrap()).unwrap();
        let mut odd = build_chain(&spec, &ctx).unwrap();

        let input = [0.5f32; 16];
        let mut out_even = [0.0f32; 16];
        let mut out_odd = [0.0f32; 16];
        even.chain.process(&input, &mut out_even);
        odd.chain.process(&input, &mut out_odd);
        for i in 0..16 {
            assert!((out_even[i] - 0.5).abs() < 1e-6);
            assert!((out_odd[i] - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn oversized_blocks_pass_the_tail_through() {
        let ctx = ctx(8);
        // -20 dB on the output node distinguishes processed from passthrough.
        let mut built = build_chain(&bypassed_chain_spec(-20.0), &ctx).unwrap();

        let input = [1.0f32; 12];
        let mut out = [0.0f32; 12];
        built.chain.process(&input, &mut out);
        for i in 0..8 {
            assert!((out[i] - 0.1).abs() < 1e-4, "processed sample {i}: {}", out[i]);
        }
        for i in 8..12 {
            assert!((out[i] - 1.0).abs() < 1e-6, "tail sample {i}: {}", out[i]);
        }
    }

    #[test]
    fn zero_input_yields_zero_output() {
        let ctx = ctx(64);
        let mut built = build_chain(&bypassed_chain_spec(0.0), &ctx).unwrap();
        let mut out = [1.0f32; 64];
        for _ in 0..4 {
            built.chain.process(&[0.0; 64], &mut out);
        }
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_chain_is_passthrough() {
        let ctx = ctx(16);
        let built = build_chain(
            &ChainSpec {
                version: 1,
                sample_rate: 48000,
                chain: Vec::new(),
            },
            &ctx,
        )
        .unwrap();
        let mut chain = built.chain;
        let input = [0.25f32; 16];
        let mut out = [0.0f32; 16];
        chain.process(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn build_error_names_the_node() {
        let v = json!({
            "version": 1,
            "chain": [
                {"id": "in", "type": "input"},
                {"id": "mystery", "type": "warp_core"},
                {"id": "out", "type": "output"}
            ]
        });
        let spec = parse_chain_value(&v).unwrap();
        let err = build_chain(&spec, &ctx(16)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'mystery'"), "{msg}");
        assert!(msg.contains("warp_core"), "{msg}");
    }

    #[test]
    fn node_timing_snapshots_when_enabled() {
        std::env::set_var("NODE_TIMING", "1");
        let ctx = ctx(32);
        let mut built = build_chain(&bypassed_chain_spec(0.0), &ctx).unwrap();
        std::env::remove_var("NODE_TIMING");

        assert!(built.chain.node_timing_enabled());
        let mut out = [0.0f32; 32];
        built.chain.process(&[0.1; 32], &mut out);

        let mut stats = [NodeTimingStat::default(); 16];
        let n = built.chain.snapshot_node_timing(&mut stats, true);
        assert!(n >= 3); // input, nam_model, ir_convolver, output
        assert!(stats[..n].iter().all(|s| s.calls >= 1));

        // Reset clears the counters.
        let n2 = built.chain.snapshot_node_timing(&mut stats, false);
        assert_eq!(n, n2);
        assert!(stats[..n2].iter().all(|s| s.calls == 0));
    }
}
