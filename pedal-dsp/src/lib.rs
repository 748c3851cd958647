//! DSP core for the pedal engine: the swappable signal chain, the
//! partitioned FFT convolver for cabinet IRs, the boundary to the external
//! NAM amp-model runtime and the chain schema spoken by the control
//! protocol.
//!
//! Everything in this crate is device-independent. The realtime rule is:
//! constructors and builders may allocate and do I/O, `process()` never does.

pub mod chain;
pub mod fft_convolver;
pub mod ir_loader;
pub mod nam;
pub mod nodes;
pub mod params;
pub mod schema;

pub use chain::{build_chain, BuiltChain, ProcessContext, SignalChain};
pub use fft_convolver::FftConvolver;
pub use params::{db_to_lin, RtParams};
pub use schema::{parse_chain_value, validate, ChainSpec, NodeSpec};
