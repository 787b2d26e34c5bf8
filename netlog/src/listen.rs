//! Local listening-port registry for client/server direction inference.
//!
//! Scans `/proc/net/tcp` and `/proc/net/tcp6` for sockets in LISTEN state.
//! A connection whose local port is in the registry was accepted by this
//! host; one whose local port is ephemeral was initiated by it. The registry
//! is rescanned on the gather cycle so new listeners are picked up without
//! restarting capture.

use std::{
    collections::HashSet,
    fs::File,
    io::{BufRead, BufReader},
    sync::RwLock,
};

use tracing::debug;

/// Socket state value for TCP_LISTEN in /proc/net/tcp.
const TCP_LISTEN: u8 = 0x0a;

#[derive(Debug, Default)]
pub struct ListeningPortRegistry {
    ports: RwLock<HashSet<u16>>,
    proc_net_base: String,
}

impl ListeningPortRegistry {
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(HashSet::new()),
            proc_net_base: "/proc/net".to_owned(),
        }
    }

    #[cfg(test)]
    fn with_base(base: &str) -> Self {
        Self {
            ports: RwLock::new(HashSet::new()),
            proc_net_base: base.to_owned(),
        }
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.ports.read().expect("lock poisoned").contains(&port)
    }

    /// Rescan and replace the port set. A missing tcp6 file (IPv6 disabled)
    /// is not an error.
    pub fn refresh(&self) -> Result<usize, std::io::Error> {
        let mut ports = HashSet::new();
        for file in ["tcp", "tcp6"] {
            let path = format!("{}/{}", self.proc_net_base, file);
            scan_proc_net(&path, &mut ports)?;
        }
        let count = ports.len();
        *self.ports.write().expect("lock poisoned") = ports;
        debug!(event.name = "listen.refresh", ports = count);
        Ok(count)
    }
}

fn scan_proc_net(path: &str, ports: &mut HashSet<u16>) -> Result<(), std::io::Error> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let reader = BufReader::new(file);
    for (idx, line) in reader.lines().enumerate() {
        if idx == 0 {
            continue;
        }
        if let Some(port) = parse_tcp_line(&line?) {
            ports.insert(port);
        }
    }
    Ok(())
}

/// Port from one /proc/net/tcp line when the socket is in LISTEN state.
///
/// Format: `sl local_address rem_address st ...` with the port as the hex
/// suffix of local_address.
fn parse_tcp_line(line: &str) -> Option<u16> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let state = u8::from_str_radix(parts[3], 16).ok()?;
    if state != TCP_LISTEN {
        return None;
    }
    let port_hex = parts[1].split(':').nth(1)?;
    u16::from_str_radix(port_hex, 16).ok()
}
