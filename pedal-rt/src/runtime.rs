use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use pedal_dsp::chain::ProcessContext;
use pedal_dsp::schema::ChainSpec;
use pedal_dsp::SignalChain;

/// Lock-free single-slot mailbox for a boxed chain.
///
/// The control thread publishes with release ordering, the audio thread
/// consumes with acquire; both are a single pointer exchange. A publish that
/// lands before the previous chain was consumed hands the superseded chain
/// back to the publisher, which drops it off the audio thread.
pub struct ChainSlot {
    ptr: AtomicPtr<SignalChain>,
}

// SAFETY: the slot only ever transfers exclusive ownership of the boxed
// chain between threads; the pointer itself is managed with acquire/release
// exchanges.
unsafe impl Send for ChainSlot {}
unsafe impl Sync for ChainSlot {}

impl ChainSlot {
    pub fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Publish a chain. Returns the chain it displaced, if the consumer had
    /// not taken the previous one yet.
    pub fn publish(&self, chain: Box<SignalChain>) -> Option<Box<SignalChain>> {
        let raw = Box::into_raw(chain);
        let old = self.ptr.swap(raw, Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            // SAFETY: `old` came from Box::into_raw in a previous publish
            // and no other thread can observe it after the swap.
            Some(unsafe { Box::from_raw(old) })
        }
    }

    /// Take the published chain, leaving the slot empty.
    pub fn take(&self) -> Option<Box<SignalChain>> {
        let old = self.ptr.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            // SAFETY: see publish().
            Some(unsafe { Box::from_raw(old) })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for ChainSlot {
    fn drop(&mut self) {
        let _ = self.take();
    }
}

impl Default for ChainSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state between the audio thread and the control plane.
pub struct ChainRuntime {
    /// Next chain, published by the control thread and consumed by the audio
    /// thread at a period boundary.
    pub pending: ChainSlot,
    /// Last accepted spec; what `get_chain` returns and what gets persisted.
    /// Written at boot and by `set_chain`, never touched by the audio thread.
    pub last_spec: Mutex<Option<ChainSpec>>,
    /// Build context (negotiated rate, period, shared param cells) for new
    /// chains.
    pub ctx: ProcessContext,
    pub running: Arc<AtomicBool>,
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
}

impl ChainRuntime {
    pub fn new(
        ctx: ProcessContext,
        running: Arc<AtomicBool>,
        config_path: PathBuf,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            pending: ChainSlot::new(),
            last_spec: Mutex::new(None),
            ctx,
            running,
            config_path,
            socket_path,
        }
    }

    pub fn set_last_spec(&self, spec: ChainSpec) {
        *self.last_spec.lock().expect("last_spec poisoned") = Some(spec);
    }

    pub fn last_spec(&self) -> Option<ChainSpec> {
        self.last_spec.lock().expect("last_spec poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedal_dsp::params::RtParams;
    use pedal_dsp::schema::{parse_chain_value, validate};
    use pedal_dsp::{build_chain, chain::ProcessContext};
    use serde_json::json;

    fn test_chain(level_db: f64) -> Box<SignalChain> {
        let ctx = ProcessContext {
            sample_rate: 48000,
            max_block_frames: 16,
            params: Arc::new(RtParams::new()),
        };
        let v = json!({
            "version": 1,
            "chain": [
                {"id": "in", "type": "input", "params": {}},
                {"id": "amp", "type": "nam_model", "enabled": false, "params": {}},
                {"id": "cab", "type": "ir_convolver", "enabled": false, "params": {}},
                {"id": "out", "type": "output", "params": {"levelDb": level_db}}
            ]
        });
        let spec = validate(parse_chain_value(&v).unwrap()).unwrap();
        Box::new(build_chain(&spec, &ctx).unwrap().chain)
    }

    #[test]
    fn publish_then_take() {
        let slot = ChainSlot::new();
        assert!(slot.is_empty());
        assert!(slot.take().is_none());

        assert!(slot.publish(test_chain(0.0)).is_none());
        assert!(!slot.is_empty());
        assert!(slot.take().is_some());
        assert!(slot.is_empty());
    }

    #[test]
    fn rapid_publishes_coalesce_to_latest() {
        let slot = ChainSlot::new();
        assert!(slot.publish(test_chain(-6.0)).is_none());
        // Second publish displaces the first; the publisher gets it back to
        // drop off the audio thread.
        let displaced = slot.publish(test_chain(-12.0));
        assert!(displaced.is_some());
        assert_eq!(
            displaced.unwrap().spec().chain[3].num_param("levelDb"),
            Some(-6.0)
        );

        let latest = slot.take().unwrap();
        assert_eq!(latest.spec().chain[3].num_param("levelDb"), Some(-12.0));
        assert!(slot.take().is_none());
    }

    #[test]
    fn drop_releases_unconsumed_chain() {
        let slot = ChainSlot::new();
        slot.publish(test_chain(0.0));
        drop(slot); // must not leak
    }
}
