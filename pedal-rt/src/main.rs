mod config;
mod control;
mod debug_tap;
mod engine;
mod persist;
mod retire;
mod rt_setup;
mod runtime;
mod trim_udp;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use pedal_dsp::RtParams;

use crate::config::EngineConfig;

static RUNNING_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(flag) = RUNNING_FLAG.get() {
        flag.store(false, Ordering::Relaxed);
    }
}

fn install_signal_handlers(running: Arc<AtomicBool>) {
    let _ = RUNNING_FLAG.set(running);
    let handler: extern "C" fn(libc::c_int) = on_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as usize as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as usize as libc::sighandler_t);
    }
}

fn log_build_banner() {
    log::info!(
        "pedal-rt {} ({} build, {})",
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
        std::env::consts::ARCH
    );
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log_build_banner();

    let cfg = EngineConfig::from_env();

    // Debug builds cannot hold the period deadline; refuse to pretend.
    if cfg!(debug_assertions) && cfg.enforce_release {
        log::error!("refusing to run a non-release build (set ENFORCE_RELEASE=0 to override)");
        return ExitCode::from(2);
    }

    rt_setup::enable_realtime(&cfg);
    rt_setup::flush_denormals(&cfg);

    let params = Arc::new(RtParams::new());
    let boot_spec = config::load_boot_spec(&cfg.config_path);
    config::apply_env_overrides(&params);

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handlers(Arc::clone(&running));

    match engine::run(&cfg, params, boot_spec, running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {:#}", e);
            ExitCode::from(1)
        }
    }
}
