//! Datagram drivers.
//!
//! Wire format: every value is an IEEE-754 double, little-endian.
//!
//! | Datagram | Layout |
//! |---|---|
//! | force command | `f64` (8 bytes) |
//! | position frame | `x: f64, y: f64, z: f64` (24 bytes) |

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use reachlab_types::{LabError, Vec3};
use tracing::{debug, info};

use crate::actuator::ForceActuator;
use crate::sensor::KinematicSource;

pub const FORCE_DATAGRAM_LEN: usize = 8;
pub const POSITION_DATAGRAM_LEN: usize = 24;

pub fn encode_force(force: f64) -> [u8; FORCE_DATAGRAM_LEN] {
    force.to_le_bytes()
}

pub fn decode_force(buf: &[u8]) -> Option<f64> {
    let bytes: [u8; FORCE_DATAGRAM_LEN] = buf.try_into().ok()?;
    Some(f64::from_le_bytes(bytes))
}

pub fn encode_position(position: Vec3) -> [u8; POSITION_DATAGRAM_LEN] {
    let mut out = [0u8; POSITION_DATAGRAM_LEN];
    for (chunk, value) in out.chunks_exact_mut(8).zip(position.to_array()) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode a 24-byte position frame. Any other length is rejected.
pub fn decode_position(buf: &[u8]) -> Option<Vec3> {
    if buf.len() != POSITION_DATAGRAM_LEN {
        return None;
    }
    let mut values = [0.0f64; 3];
    for (value, chunk) in values.iter_mut().zip(buf.chunks_exact(8)) {
        let bytes: [u8; 8] = chunk.try_into().ok()?;
        *value = f64::from_le_bytes(bytes);
    }
    Some(Vec3::new(values[0], values[1], values[2]))
}

fn io_fault(component: &str, err: std::io::Error) -> LabError {
    LabError::Actuator {
        component: component.to_string(),
        details: err.to_string(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Force actuator
// ────────────────────────────────────────────────────────────────────────────

/// Sends one 8-byte force datagram per command to the motor controller.
pub struct UdpForceActuator {
    id: String,
    socket: UdpSocket,
    target: SocketAddr,
    last: f64,
}

impl UdpForceActuator {
    /// Bind an ephemeral local port and address datagrams to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Actuator`] when the socket cannot be bound.
    pub fn connect(id: impl Into<String>, target: SocketAddr) -> Result<Self, LabError> {
        let id = id.into();
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).map_err(|e| io_fault(&id, e))?;
        socket.set_nonblocking(true).map_err(|e| io_fault(&id, e))?;
        info!(actuator = %id, %target, "force actuator ready");
        Ok(Self {
            id,
            socket,
            target,
            last: 0.0,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl ForceActuator for UdpForceActuator {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&mut self, force: f64) -> Result<(), LabError> {
        match self.socket.send_to(&encode_force(force), self.target) {
            Ok(_) => {}
            // Best effort: a full send buffer drops this command, the next
            // iteration refreshes it.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!(actuator = %self.id, "send buffer full, command dropped");
            }
            Err(e) => return Err(io_fault(&self.id, e)),
        }
        self.last = force;
        Ok(())
    }

    fn last_command(&self) -> f64 {
        self.last
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Position relay
// ────────────────────────────────────────────────────────────────────────────

/// Reads 24-byte position datagrams from a motion-capture relay.
///
/// The socket is non-blocking; each poll drains everything queued and keeps
/// the newest frame. Timestamps are seconds since the source was bound.
pub struct UdpPositionSource {
    socket: UdpSocket,
    epoch: Instant,
    buf: [u8; 64],
}

impl UdpPositionSource {
    /// # Errors
    ///
    /// Returns [`LabError::Sensor`] when the socket cannot be bound.
    pub fn bind(addr: SocketAddr) -> Result<Self, LabError> {
        let socket = UdpSocket::bind(addr)
            .map_err(|e| LabError::Sensor(format!("bind {addr}: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| LabError::Sensor(e.to_string()))?;
        info!(%addr, "position relay listening");
        Ok(Self {
            socket,
            epoch: Instant::now(),
            buf: [0u8; 64],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LabError> {
        self.socket
            .local_addr()
            .map_err(|e| LabError::Sensor(e.to_string()))
    }
}

impl KinematicSource for UdpPositionSource {
    fn id(&self) -> &str {
        "udp_position"
    }

    fn poll(&mut self) -> Result<Option<(Vec3, f64)>, LabError> {
        let mut newest = None;
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((n, src)) => match decode_position(&self.buf[..n]) {
                    Some(p) => newest = Some(p),
                    None => debug!(%src, len = n, "ignoring malformed position datagram"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(LabError::Sensor(e.to_string())),
            }
        }
        Ok(newest.map(|p| (p, self.epoch.elapsed().as_secs_f64())))
    }
}
