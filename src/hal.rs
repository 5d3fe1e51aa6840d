//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for i2c bus access.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using an in-memory bus).
//!
//! design philosophy:
//!     - "Compile Anywhere": the node builds on any host; `--features hardware`
//!       swaps in the rppal provider.
//!     - all calls are blocking; callers run them on blocking workers.
//!
//! relationships:
//!     - used by: scanner.rs (probe + chip identification), sensors/linear.rs
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use crate::error::SensorError;
use parking_lot::Mutex;
use std::collections::HashMap;

pub trait BusProvider: Send + Sync {
    /// bus numbers available for scanning
    fn buses(&self) -> Vec<u8>;

    /// true when a device acknowledges at `addr`
    fn probe(&self, bus: u8, addr: u8) -> Result<bool, SensorError>;

    /// write `register`, then read `len` bytes back
    fn read_register(&self, bus: u8, addr: u8, register: u8, len: usize) -> Result<Vec<u8>, SensorError>;
}

// ==============================================================================================
// MOCK IMPLEMENTATION (development hosts and tests)
// ==============================================================================================

/// In-memory bus: devices are register maps keyed by (bus, address).
#[derive(Default)]
pub struct MockBus {
    buses: Vec<u8>,
    devices: Mutex<HashMap<(u8, u8), HashMap<u8, Vec<u8>>>>,
}

impl MockBus {
    pub fn new(buses: Vec<u8>) -> Self {
        tracing::info!("using mock i2c bus (no hardware access)");
        Self { buses, devices: Mutex::new(HashMap::new()) }
    }

    /// attach a device exposing `registers`
    pub fn attach(&self, bus: u8, addr: u8, registers: HashMap<u8, Vec<u8>>) {
        self.devices.lock().insert((bus, addr), registers);
    }

    pub fn detach(&self, bus: u8, addr: u8) {
        self.devices.lock().remove(&(bus, addr));
    }
}

impl BusProvider for MockBus {
    fn buses(&self) -> Vec<u8> {
        self.buses.clone()
    }

    fn probe(&self, bus: u8, addr: u8) -> Result<bool, SensorError> {
        Ok(self.devices.lock().contains_key(&(bus, addr)))
    }

    fn read_register(&self, bus: u8, addr: u8, register: u8, len: usize) -> Result<Vec<u8>, SensorError> {
        let devices = self.devices.lock();
        let device = devices
            .get(&(bus, addr))
            .ok_or_else(|| SensorError::Bus(format!("no device at {}:0x{:02X}", bus, addr)))?;
        let mut bytes = device.get(&register).cloned().unwrap_or_default();
        bytes.resize(len, 0);
        tracing::trace!(bus, addr = %format!("0x{:02X}", addr), register, ?bytes, "mock i2c read");
        Ok(bytes)
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================

#[cfg(feature = "hardware")]
pub struct PiBus {
    buses: Vec<u8>,
}

#[cfg(feature = "hardware")]
impl PiBus {
    pub fn new(buses: Vec<u8>) -> Self {
        tracing::info!(?buses, "using rppal i2c bus");
        Self { buses }
    }

    fn open(&self, bus: u8, addr: u8) -> Result<rppal::i2c::I2c, SensorError> {
        let mut i2c = rppal::i2c::I2c::with_bus(bus).map_err(|e| SensorError::Bus(e.to_string()))?;
        i2c.set_slave_address(addr as u16).map_err(|e| SensorError::Bus(e.to_string()))?;
        Ok(i2c)
    }
}

#[cfg(feature = "hardware")]
impl BusProvider for PiBus {
    fn buses(&self) -> Vec<u8> {
        self.buses.clone()
    }

    fn probe(&self, bus: u8, addr: u8) -> Result<bool, SensorError> {
        let i2c = self.open(bus, addr)?;
        let mut buf = [0u8; 1];
        // a NACK surfaces as an io error; that only means "nothing here"
        Ok(i2c.read(&mut buf).is_ok())
    }

    fn read_register(&self, bus: u8, addr: u8, register: u8, len: usize) -> Result<Vec<u8>, SensorError> {
        let i2c = self.open(bus, addr)?;
        let mut buf = vec![0u8; len];
        i2c.write_read(&[register], &mut buf)
            .map_err(|e| SensorError::Bus(format!("{}:0x{:02X} reg 0x{:02X}: {}", bus, addr, register, e)))?;
        Ok(buf)
    }
}
