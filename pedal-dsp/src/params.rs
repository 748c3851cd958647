use std::sync::atomic::{AtomicBool, Ordering};

use atomic_float::AtomicF32;

#[inline]
pub fn db_to_lin(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Process-wide realtime parameter cells.
///
/// One instance lives for the whole process, shared by the audio thread
/// (reader), the control/UDP threads and boot-time configuration (writers).
/// All cells are scalar atomics; relaxed ordering is sufficient because each
/// cell is independent and read at most once per block.
pub struct RtParams {
    pub input_trim_db: AtomicF32,
    pub input_trim_lin: AtomicF32,
    pub output_gain_db: AtomicF32,
    pub output_gain_lin: AtomicF32,
    pub passthrough: AtomicBool,
    pub bypass_nam: AtomicBool,
    pub bypass_ir: AtomicBool,
    pub sanitize_output: AtomicBool,
    pub verbose_xruns: AtomicBool,
    pub log_stats: AtomicBool,
    pub log_timing: AtomicBool,
}

impl RtParams {
    pub fn new() -> Self {
        Self {
            input_trim_db: AtomicF32::new(0.0),
            input_trim_lin: AtomicF32::new(1.0),
            output_gain_db: AtomicF32::new(0.0),
            output_gain_lin: AtomicF32::new(1.0),
            passthrough: AtomicBool::new(false),
            bypass_nam: AtomicBool::new(false),
            bypass_ir: AtomicBool::new(false),
            sanitize_output: AtomicBool::new(false),
            verbose_xruns: AtomicBool::new(false),
            log_stats: AtomicBool::new(false),
            log_timing: AtomicBool::new(false),
        }
    }

    /// Store trim in dB and its cached linear factor. Clamped to ±24 dB.
    pub fn set_input_trim_db(&self, db: f32) {
        let db = db.clamp(-24.0, 24.0);
        self.input_trim_db.store(db, Ordering::Relaxed);
        self.input_trim_lin.store(db_to_lin(db), Ordering::Relaxed);
    }

    /// Store output gain in dB and its cached linear factor. Clamped to ±24 dB.
    pub fn set_output_gain_db(&self, db: f32) {
        let db = db.clamp(-24.0, 24.0);
        self.output_gain_db.store(db, Ordering::Relaxed);
        self.output_gain_lin.store(db_to_lin(db), Ordering::Relaxed);
    }
}

impl Default for RtParams {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_updates_both_cells() {
        let p = RtParams::new();
        p.set_input_trim_db(6.0);
        assert!((p.input_trim_db.load(Ordering::Relaxed) - 6.0).abs() < 1e-6);
        let lin = p.input_trim_lin.load(Ordering::Relaxed);
        assert!((lin - db_to_lin(6.0)).abs() < 1e-6);
    }

    #[test]
    fn trim_clamps_to_range() {
        let p = RtParams::new();
        p.set_input_trim_db(99.0);
        assert!((p.input_trim_db.load(Ordering::Relaxed) - 24.0).abs() < 1e-6);
        p.set_input_trim_db(-99.0);
        assert!((p.input_trim_db.load(Ordering::Relaxed) + 24.0).abs() < 1e-6);
    }

    #[test]
    fn db_to_lin_reference_points() {
        assert!((db_to_lin(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_lin(20.0) - 10.0).abs() < 1e-5);
        assert!((db_to_lin(-20.0) - 0.1).abs() < 1e-6);
    }
}
