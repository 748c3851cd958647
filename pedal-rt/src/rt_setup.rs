use crate::config::EngineConfig;

fn last_os_error() -> String {
    std::io::Error::last_os_error().to_string()
}

/// Lock memory and request SCHED_FIFO for the calling (audio) thread.
/// Both steps are best-effort: failures log a warning and the engine keeps
/// running at normal priority.
pub fn enable_realtime(cfg: &EngineConfig) {
    if !cfg.enable_rt {
        log::info!("rt: realtime scheduling disabled via ENABLE_RT=0");
        return;
    }

    // Page faults in the audio loop blow the deadline; pin everything now.
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        log::warn!("rt: mlockall failed (continuing): {}", last_os_error());
    } else {
        log::info!("rt: mlockall ok");
    }

    let param = libc::sched_param {
        sched_priority: cfg.rt_priority,
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        log::warn!(
            "rt: SCHED_FIFO prio={} failed (continuing): {}",
            cfg.rt_priority,
            last_os_error()
        );
    } else {
        log::info!("rt: requested realtime (SCHED_FIFO prio={})", cfg.rt_priority);
    }

    log_sched_state();
}

fn log_sched_state() {
    let policy = unsafe { libc::sched_getscheduler(0) };
    let name = match policy {
        libc::SCHED_OTHER => "SCHED_OTHER",
        libc::SCHED_FIFO => "SCHED_FIFO",
        libc::SCHED_RR => "SCHED_RR",
        _ => "unknown",
    };
    let mut param = libc::sched_param { sched_priority: 0 };
    unsafe {
        libc::sched_getparam(0, &mut param);
    }
    log::info!("rt: thread sched policy={} prio={}", name, param.sched_priority);
}

/// Flush denormals to zero on the audio thread. Subnormal tails out of the
/// convolver and the overdrive smoother otherwise hit the FPU slow path.
pub fn flush_denormals(cfg: &EngineConfig) {
    if !cfg.denormals_off {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        // MXCSR: FTZ is bit 15, DAZ is bit 6.
        #[allow(deprecated)]
        unsafe {
            use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
            _mm_setcsr(_mm_getcsr() | 0x8040);
        }
        log::info!("rt: denormals flushed to zero");
    }

    #[cfg(target_arch = "aarch64")]
    {
        // FPCR: FZ is bit 24.
        unsafe {
            let mut fpcr: u64;
            core::arch::asm!("mrs {}, fpcr", out(reg) fpcr);
            fpcr |= 1 << 24;
            core::arch::asm!("msr fpcr, {}", in(reg) fpcr);
        }
        log::info!("rt: denormals flushed to zero");
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    log::info!("rt: denormal flush not supported on this target");
}
