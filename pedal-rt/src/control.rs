use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pedal_dsp::{build_chain, nodes, schema};
use serde_json::{json, Value};

use crate::persist;
use crate::runtime::ChainRuntime;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;
const ACCEPT_POLL_MS: i32 = 200;
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the control server thread. One connection at a time, one
/// newline-terminated JSON request per connection, one JSON response back.
pub fn spawn(runtime: Arc<ChainRuntime>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("pedal-control".into())
        .spawn(move || serve(runtime))
        .expect("failed to spawn control thread")
}

fn serve(runtime: Arc<ChainRuntime>) {
    let path = runtime.socket_path.clone();
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(e) => {
            log::error!("control: bind({:?}) failed: {}", path, e);
            return;
        }
    };
    // The UI backend may run as a different user.
    let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666));
    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("control: set_nonblocking failed: {}", e);
        return;
    }
    log::info!("control: unix socket {:?}", path);

    while runtime.running.load(Ordering::Relaxed) {
        // Short poll so shutdown is prompt.
        if !wait_readable(listener.as_raw_fd(), ACCEPT_POLL_MS) {
            continue;
        }
        match listener.accept() {
            Ok((stream, _)) => handle_client(&runtime, stream),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue
            }
            Err(e) => {
                log::error!("control: accept failed: {}", e);
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&path);
}

fn wait_readable(fd: i32, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let r = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    r > 0 && (pfd.revents & libc::POLLIN) != 0
}

fn handle_client(runtime: &ChainRuntime, mut stream: UnixStream) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT));

    let line = match read_request_line(&mut stream) {
        Some(line) => line,
        None => return,
    };

    let response = match serde_json::from_str::<Value>(&line) {
        Ok(req) => handle_request(runtime, &req),
        Err(e) => error_response(&format!("parse error: {}", e)),
    };

    let mut out = response.to_string();
    out.push('\n');
    let _ = stream.write_all(out.as_bytes());
}

/// Read up to the first newline, capped at 1 MiB.
fn read_request_line(stream: &mut UnixStream) -> Option<String> {
    let mut line = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if line.len() >= MAX_REQUEST_BYTES {
            return None;
        }
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(pos) = chunk[..n].iter().position(|&b| b == b'\n') {
                    line.extend_from_slice(&chunk[..pos]);
                    break;
                }
                line.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return None,
        }
    }
    if line.is_empty() {
        None
    } else {
        String::from_utf8(line).ok()
    }
}

fn error_response(message: &str) -> Value {
    json!({"ok": false, "error": message})
}

pub(crate) fn handle_request(runtime: &ChainRuntime, req: &Value) -> Value {
    if !req.is_object() {
        return error_response("request must be an object");
    }
    let cmd = match req.get("cmd").and_then(|c| c.as_str()) {
        Some(c) => c,
        None => return error_response("missing string cmd"),
    };

    match cmd {
        "list_types" => json!({"ok": true, "types": nodes::node_type_manifest()}),

        "get_chain" => match runtime.last_spec() {
            Some(spec) => json!({"ok": true, "chain": schema::to_json(&spec)}),
            None => error_response("no active chain"),
        },

        "set_chain" => set_chain(runtime, req),

        _ => error_response("unknown cmd"),
    }
}

fn set_chain(runtime: &ChainRuntime, req: &Value) -> Value {
    let chain_value = match req.get("chain") {
        Some(v) => v,
        None => return error_response("missing chain"),
    };

    let mut spec = match schema::parse_chain_value(chain_value) {
        Ok(s) => s,
        Err(e) => return error_response(&e.to_string()),
    };

    // The engine's negotiated rate wins over the spec's advisory value.
    spec.sample_rate = runtime.ctx.sample_rate;

    let spec = match schema::validate(spec) {
        Ok(s) => s,
        Err(e) => return error_response(&e.to_string()),
    };

    let built = match build_chain(&spec, &runtime.ctx) {
        Ok(b) => b,
        Err(e) => return error_response(&e.to_string()),
    };

    // Persist first: if the disk write fails the client sees the error and
    // the running chain is untouched.
    if let Err(e) = persist::write(&runtime.config_path, &spec) {
        return error_response(&format!("persist failed: {:#}", e));
    }

    runtime.set_last_spec(spec);
    if let Some(superseded) = runtime.pending.publish(Box::new(built.chain)) {
        // A prior set_chain the audio thread never consumed; drop it here,
        // off the realtime path.
        drop(superseded);
    }

    let mut resp = json!({"ok": true});
    if !built.warnings.is_empty() {
        resp["warning"] = json!(built.warnings.join("\n"));
    }
    resp
}
