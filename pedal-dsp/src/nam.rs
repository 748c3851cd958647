//! Boundary to the external NAM (Neural Amp Modeler) inference library.
//!
//! Amp-model inference is not implemented here. Profiles are executed by the
//! vendor runtime, loaded once as a shared library (`libnamcore.so` by
//! default, `NAM_LIBRARY` overrides) exposing a small C surface. This module
//! owns only the handle plumbing; a loaded model is a black-box block
//! processor behind [`NamModel`].

use std::ffi::{c_char, c_double, c_float, c_int, c_void, CString};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use libloading::Library;

/// Opaque amp model.
///
/// `reset` and `process` delegate straight into the external runtime and are
/// RT-safe once the model is built; loading happens off the audio thread.
pub trait NamModel: Send {
    /// Process a block. `input` and `output` must have the same length.
    fn process(&mut self, input: &[f32], output: &mut [f32]);

    /// Prepare the model for streaming at the engine's negotiated rate and
    /// block size. Called once at build time, before any `process`.
    fn reset(&mut self, sample_rate: u32, max_block_frames: usize);

    /// The sample rate the profile was trained at (typically 48000).
    fn expected_sample_rate(&self) -> u32;

    /// Calibration level recorded in the profile, if any: the dBu value a
    /// 0 dBFS sine corresponds to at the model input.
    fn input_level_dbu(&self) -> Option<f32>;
}

impl std::fmt::Debug for dyn NamModel + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamModel")
            .field("expected_sample_rate", &self.expected_sample_rate())
            .field("input_level_dbu", &self.input_level_dbu())
            .finish()
    }
}

pub const DEFAULT_LIBRARY: &str = "libnamcore.so";

// C surface of the vendor runtime.
type CreateFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type ResetFn = unsafe extern "C" fn(*mut c_void, c_double, c_int);
type ProcessFn = unsafe extern "C" fn(*mut c_void, *const c_float, *mut c_float, c_int);
type ExpectedRateFn = unsafe extern "C" fn(*mut c_void) -> c_double;
type HasInputLevelFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type InputLevelFn = unsafe extern "C" fn(*mut c_void) -> c_double;

/// The loaded vendor library plus its resolved entry points. The fn pointers
/// are copied out once; `_library` keeps the mapping alive for them.
struct NamRuntime {
    create: CreateFn,
    destroy: DestroyFn,
    reset: ResetFn,
    process: ProcessFn,
    expected_rate: ExpectedRateFn,
    has_input_level: HasInputLevelFn,
    input_level: InputLevelFn,
    _library: Library,
}

// SAFETY: the runtime holds only plain fn pointers and the library mapping;
// the vendor API is safe to call from any thread with distinct handles.
unsafe impl Send for NamRuntime {}
unsafe impl Sync for NamRuntime {}

impl NamRuntime {
    fn load() -> Result<Self> {
        let name =
            std::env::var("NAM_LIBRARY").unwrap_or_else(|_| DEFAULT_LIBRARY.to_string());
        // SAFETY: loading runs the library's initializers; chain builds are
        // the only callers and run on the control thread.
        let library = unsafe { Library::new(&name) }
            .with_context(|| format!("failed to load NAM runtime '{}'", name))?;

        // SAFETY: each symbol is resolved against its documented signature.
        unsafe {
            Ok(Self {
                create: *library.get(b"nam_model_create\0")?,
                destroy: *library.get(b"nam_model_destroy\0")?,
                reset: *library.get(b"nam_model_reset\0")?,
                process: *library.get(b"nam_model_process\0")?,
                expected_rate: *library.get(b"nam_model_expected_sample_rate\0")?,
                has_input_level: *library.get(b"nam_model_has_input_level\0")?,
                input_level: *library.get(b"nam_model_input_level\0")?,
                _library: library,
            })
        }
    }
}

static RUNTIME: OnceLock<std::result::Result<Arc<NamRuntime>, String>> = OnceLock::new();

/// The runtime is loaded at most once per process; a load failure is cached
/// so every later build fails with the same message instead of re-probing.
fn runtime() -> Result<Arc<NamRuntime>> {
    match RUNTIME.get_or_init(|| NamRuntime::load().map(Arc::new).map_err(|e| format!("{e:#}"))) {
        Ok(rt) => Ok(Arc::clone(rt)),
        Err(msg) => bail!("{}", msg),
    }
}

/// One model handle owned by this wrapper; all calls delegate to the runtime.
struct ExternalModel {
    runtime: Arc<NamRuntime>,
    handle: *mut c_void,
    expected_rate: u32,
    input_level_dbu: Option<f32>,
}

// SAFETY: the handle is owned exclusively by this wrapper and only ever used
// from one thread at a time (it moves with the node that owns it).
unsafe impl Send for ExternalModel {}

impl Drop for ExternalModel {
    fn drop(&mut self) {
        // SAFETY: the handle came from create and is dropped exactly once.
        unsafe { (self.runtime.destroy)(self.handle) }
    }
}

impl NamModel for ExternalModel {
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), output.len());
        let n = input.len().min(output.len());
        // SAFETY: the handle is live and both buffers hold at least n floats.
        unsafe {
            (self.runtime.process)(self.handle, input.as_ptr(), output.as_mut_ptr(), n as c_int)
        }
    }

    fn reset(&mut self, sample_rate: u32, max_block_frames: usize) {
        // SAFETY: the handle is live; the runtime sizes its internal buffers
        // for max_block_frames here.
        unsafe {
            (self.runtime.reset)(
                self.handle,
                sample_rate as c_double,
                max_block_frames as c_int,
            )
        }
    }

    fn expected_sample_rate(&self) -> u32 {
        self.expected_rate
    }

    fn input_level_dbu(&self) -> Option<f32> {
        self.input_level_dbu
    }
}

/// Load a `.nam` profile through the external runtime and return it as an
/// opaque block processor.
pub fn load_file(path: &Path) -> Result<Box<dyn NamModel>> {
    let runtime = runtime()?;
    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .context("profile path contains a NUL byte")?;

    // SAFETY: c_path outlives the call; the runtime copies what it keeps.
    let handle = unsafe { (runtime.create)(c_path.as_ptr()) };
    if handle.is_null() {
        bail!("NAM runtime could not load profile {:?}", path);
    }

    // SAFETY: the handle is live; these are read-only metadata queries.
    let (expected_rate, input_level_dbu) = unsafe {
        let rate = (runtime.expected_rate)(handle);
        let rate = if rate > 0.0 { rate.round() as u32 } else { 0 };
        let level = if (runtime.has_input_level)(handle) != 0 {
            Some((runtime.input_level)(handle) as f32)
        } else {
            None
        };
        (rate, level)
    };

    log::info!(
        "nam: loaded profile {:?} (expected rate {})",
        path,
        expected_rate
    );

    Ok(Box::new(ExternalModel {
        runtime,
        handle,
        expected_rate,
        input_level_dbu,
    }))
}
