use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pedal_dsp::RtParams;

const TRIM_PORT: u16 = 9000;
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// Start the trivial UDP trim listener: one ASCII line per datagram,
/// `TRIM_DB <value>` updates the shared trim cells.
pub fn spawn(params: Arc<RtParams>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("pedal-trim-udp".into())
        .spawn(move || serve(params, running))
        .expect("failed to spawn trim UDP thread")
}

fn serve(params: Arc<RtParams>, running: Arc<AtomicBool>) {
    let sock = match UdpSocket::bind(("127.0.0.1", TRIM_PORT)) {
        Ok(s) => s,
        Err(e) => {
            log::error!("trim: failed to bind udp 127.0.0.1:{}: {}", TRIM_PORT, e);
            return;
        }
    };
    if let Err(e) = sock.set_read_timeout(Some(RECV_TIMEOUT)) {
        log::warn!("trim: failed to set recv timeout: {}", e);
    }
    log::info!("trim: udp 127.0.0.1:{} (send: TRIM_DB <value>)", TRIM_PORT);

    let mut buf = [0u8; 256];
    while running.load(Ordering::Relaxed) {
        match sock.recv_from(&mut buf) {
            Ok((n, _)) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                match parse_trim_line(&text) {
                    Some(db) => {
                        params.set_input_trim_db(db);
                        log::info!(
                            "trim set to {:.1} dB",
                            params.input_trim_db.load(Ordering::Relaxed)
                        );
                    }
                    None => log::info!("trim: unknown datagram: {}", text.trim()),
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue
            }
            Err(e) => {
                log::warn!("trim: recv failed: {}", e);
            }
        }
    }
}

fn parse_trim_line(line: &str) -> Option<f32> {
    line.trim().strip_prefix("TRIM_DB")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_lines() {
        assert_eq!(parse_trim_line("TRIM_DB 6.5"), Some(6.5));
        assert_eq!(parse_trim_line("TRIM_DB -12\n"), Some(-12.0));
        assert_eq!(parse_trim_line("  TRIM_DB 0 "), Some(0.0));
    }

    #[test]
    fn rejects_other_messages() {
        assert_eq!(parse_trim_line("GAIN_DB 3"), None);
        assert_eq!(parse_trim_line("TRIM_DB"), None);
        assert_eq!(parse_trim_line("TRIM_DB much"), None);
        assert_eq!(parse_trim_line(""), None);
    }

    #[test]
    fn out_of_range_values_clamp_through_the_store() {
        let params = RtParams::new();
        params.set_input_trim_db(parse_trim_line("TRIM_DB 99").unwrap());
        assert!((params.input_trim_db.load(Ordering::Relaxed) - 24.0).abs() < 1e-6);
    }
}
