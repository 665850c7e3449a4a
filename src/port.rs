//! # Port — Listening Port Discovery and Port File
//!
//! The desktop shell that spawns this service does not know in advance which
//! port it will end up on. The service probes its configured port, walks
//! forward when the port is taken, and publishes the winner in a small file
//! under the OS temp directory so the shell (and the frontend dev server) can
//! discover it.
//!
//! The port file holds the decimal port number and nothing else. It is written
//! atomically (temp file + rename) and removed on graceful shutdown.

use anyhow::{bail, Context, Result};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Returns true if `port` can be bound on all interfaces right now.
///
/// The probe listener is dropped immediately, so there is an inherent race
/// with other processes; the real bind happens later in `server::run`.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).is_ok()
}

/// Walk forward from `start` for up to `max_attempts` ports and return the
/// first one that binds.
pub fn find_available_port(start: u16, max_attempts: u16) -> Result<u16> {
    for offset in 0..max_attempts {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if is_port_available(port) {
            if offset > 0 {
                info!(configured = start, chosen = port, "configured port busy, moved forward");
            }
            return Ok(port);
        }
        debug!(port, "port busy");
    }
    bail!(
        "no available port found after {} attempts starting from port {}",
        max_attempts,
        start
    )
}

/// Resolve the port to bind, honouring the auto-discovery switch.
///
/// With discovery disabled the configured port must be free; otherwise the
/// service refuses to start.
pub fn choose_port(configured: u16, auto_discovery: bool, max_attempts: u16) -> Result<u16> {
    if auto_discovery {
        find_available_port(configured, max_attempts)
    } else if is_port_available(configured) {
        Ok(configured)
    } else {
        bail!(
            "port {} is already in use and automatic port discovery is disabled",
            configured
        )
    }
}

/// Full path of the port file inside the OS temp directory.
pub fn port_file_path(file_name: &str) -> PathBuf {
    std::env::temp_dir().join(file_name)
}

/// Write `port` to `path` atomically.
pub fn write_port_file(path: &Path, port: u16) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, port.to_string())
        .with_context(|| format!("failed to write port file {}", tmp.display()))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to rename port file to {}", path.display()));
    }
    Ok(())
}

/// Read a port number back from `path`, validating its range.
pub fn read_port_file(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read port file {}", path.display()))?;
    let port: u32 = content
        .trim()
        .parse()
        .with_context(|| format!("invalid port number in {}", path.display()))?;
    if !(1..=65535).contains(&port) {
        bail!("port number out of valid range (1-65535): {}", port);
    }
    Ok(port as u16)
}

/// Owns the published port file and deletes it on drop.
///
/// Held by `server::run` for the lifetime of the listener so the file
/// disappears on graceful shutdown (SIGINT/SIGTERM) as well as on an error
/// return.
pub struct PortFile {
    path: PathBuf,
}

impl PortFile {
    pub fn publish(file_name: &str, port: u16) -> Result<Self> {
        let path = port_file_path(file_name);
        write_port_file(&path, port)?;
        info!(path = %path.display(), port, "port file written");
        Ok(PortFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PortFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "port file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove port file"),
        }
    }
}
