use crate::device::{AxisAddress, Connection, Transport};
use crate::error::StretchError;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Max speed applied before homing, in mm/s.
pub const DEFAULT_SPEED_MM_S: f64 = 10.0;

const PRIMARY_AXIS: u8 = 1;

struct Bound {
    port: String,
    conn: Arc<dyn Connection>,
    target: AxisAddress,
}

/// The single serial link to one motion controller axis.
///
/// Every operation takes `&self` so a stop can be issued from one thread
/// while a run worker is issuing moves from another. Commands run outside
/// the internal lock; the connection serializes request/reply pairs itself.
pub struct DeviceLink {
    transport: Arc<dyn Transport>,
    bound: Mutex<Option<Bound>>,
}

impl DeviceLink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            bound: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Bound>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bound(&self) -> Result<(Arc<dyn Connection>, AxisAddress), StretchError> {
        self.lock()
            .as_ref()
            .map(|b| (Arc::clone(&b.conn), b.target))
            .ok_or(StretchError::NotConnected)
    }

    pub fn connected(&self) -> bool {
        self.lock().is_some()
    }

    pub fn port(&self) -> Option<String> {
        self.lock().as_ref().map(|b| b.port.clone())
    }

    /// Opens `port`, runs discovery and binds to axis 1 of the first device.
    pub fn connect(&self, port: &str) -> Result<(), StretchError> {
        if let Some(existing) = self.port() {
            return Err(StretchError::AlreadyConnected { port: existing });
        }

        let conn: Arc<dyn Connection> = Arc::from(self.transport.open(port)?);
        let devices = match conn.detect_devices() {
            Ok(devices) => devices,
            Err(e) => {
                let _ = conn.close();
                return Err(StretchError::DeviceDiscovery {
                    port: port.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let Some(&device) = devices.first() else {
            let _ = conn.close();
            return Err(StretchError::DeviceDiscovery {
                port: port.to_string(),
                reason: "no devices answered".to_string(),
            });
        };

        let target = AxisAddress::new(device, PRIMARY_AXIS);
        let mut bound = self.lock();
        if let Some(existing) = bound.as_ref() {
            let port = existing.port.clone();
            drop(bound);
            let _ = conn.close();
            return Err(StretchError::AlreadyConnected { port });
        }
        *bound = Some(Bound {
            port: port.to_string(),
            conn,
            target,
        });
        info!("connected to {} (device {}, {} found)", port, target, devices.len());
        Ok(())
    }

    /// Releases the connection. The link ends up disconnected even if the
    /// transport fails to close cleanly.
    pub fn disconnect(&self) -> Result<(), StretchError> {
        let bound = self.lock().take().ok_or(StretchError::NotConnected)?;
        if let Err(e) = bound.conn.close() {
            warn!("closing {} failed: {}", bound.port, e);
        }
        info!("disconnected from {}", bound.port);
        Ok(())
    }

    pub fn home(&self) -> Result<(), StretchError> {
        let (conn, target) = self.bound()?;
        conn.set_max_speed(target, DEFAULT_SPEED_MM_S)?;
        conn.home(target)?;
        debug!("homing {}", target);
        Ok(())
    }

    /// Non-blocking halt; safe mid-move.
    pub fn stop(&self) -> Result<(), StretchError> {
        let (conn, target) = self.bound()?;
        conn.stop(target)?;
        Ok(())
    }

    pub fn set_max_speed(&self, mm_per_s: f64) -> Result<(), StretchError> {
        let (conn, target) = self.bound()?;
        conn.set_max_speed(target, mm_per_s)?;
        Ok(())
    }

    pub fn move_absolute(&self, length_mm: f64, speed_mm_s: f64) -> Result<(), StretchError> {
        let (conn, target) = self.bound()?;
        conn.set_max_speed(target, speed_mm_s)?;
        conn.move_absolute(target, length_mm)?;
        Ok(())
    }

    pub fn move_relative(&self, length_mm: f64, speed_mm_s: f64) -> Result<(), StretchError> {
        let (conn, target) = self.bound()?;
        conn.set_max_speed(target, speed_mm_s)?;
        conn.move_relative(target, length_mm)?;
        Ok(())
    }

    /// Moves to `length_mm` at whatever max speed is already set.
    pub(crate) fn move_absolute_at_current_speed(&self, length_mm: f64) -> Result<(), StretchError> {
        let (conn, target) = self.bound()?;
        conn.move_absolute(target, length_mm)?;
        Ok(())
    }

    pub fn position(&self) -> Result<f64, StretchError> {
        let (conn, target) = self.bound()?;
        Ok(conn.position(target)?)
    }

    pub fn is_busy(&self) -> Result<bool, StretchError> {
        let (conn, target) = self.bound()?;
        Ok(conn.is_busy(target)?)
    }
}
