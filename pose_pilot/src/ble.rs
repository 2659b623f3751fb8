//! BLE transport to the hub.
//!
//! Hubs expose one of a few UART-like GATT services depending on their
//! firmware.  Each is described by a [`UartProfile`]; connecting probes
//! them in order and keeps the first one whose service and write
//! characteristic resolve.
//!
//! Writes are split into small packets with a short gap between them.  A
//! whole command block is written under one lock, so packets of two
//! blocks never interleave, and the call returns only once every packet
//! is out.  Writing while disconnected is not an error: it is logged and
//! returns `false`.
//!
//! The platform side sits behind [`GattBackend`]; see
//! [`crate::bluez`] for the Linux implementation.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// Profiles
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UartProfile {
    pub name:    &'static str,
    pub service: &'static str,
    pub write:   &'static str,
    pub notify:  &'static str,
    /// Byte put in front of every packet, counted in the packet size.
    pub prefix:  Option<u8>,
    /// Sent once after discovery.
    pub init:    &'static [u8],
}

/// Nordic UART service, used by the MicroPython REPL firmwares.
pub const NORDIC_UART: UartProfile = UartProfile {
    name:    "Nordic UART",
    service: "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
    write:   "6e400002-b5a3-f393-e0a9-e50e24dcca9e",
    notify:  "6e400003-b5a3-f393-e0a9-e50e24dcca9e",
    prefix:  None,
    // Ctrl-C: break out of any running program to the REPL prompt
    init:    &[0x03],
};

/// Pybricks command/event characteristic; stdin writes carry command 0x06.
pub const PYBRICKS: UartProfile = UartProfile {
    name:    "Pybricks",
    service: "c5f50001-8280-46da-89f4-6d8051e4aeef",
    write:   "c5f50002-8280-46da-89f4-6d8051e4aeef",
    notify:  "c5f50002-8280-46da-89f4-6d8051e4aeef",
    prefix:  Some(0x06),
    init:    &[],
};

/// HM-10 style serial bridge.
pub const HM10: UartProfile = UartProfile {
    name:    "HM-10 serial",
    service: "0000ffe0-0000-1000-8000-00805f9b34fb",
    write:   "0000ffe1-0000-1000-8000-00805f9b34fb",
    notify:  "0000ffe1-0000-1000-8000-00805f9b34fb",
    prefix:  None,
    init:    &[0x03],
};

pub const PROFILES: [UartProfile; 3] = [NORDIC_UART, PYBRICKS, HM10];

pub const CHUNK_SIZE: usize    = 20;
pub const CHUNK_GAP: Duration  = Duration::from_millis(10);

/// Split `bytes` into packets of at most `chunk_size` bytes, prefix
/// included.  Order is preserved; nothing is dropped or repeated.
pub fn chunk_packets(bytes: &[u8], chunk_size: usize, prefix: Option<u8>) -> Vec<Vec<u8>> {
    let payload = chunk_size.saturating_sub(prefix.is_some() as usize).max(1);
    bytes
        .chunks(payload)
        .map(|c| prefix.into_iter().chain(c.iter().copied()).collect())
        .collect()
}

// ════════════════════════════════════════════════════════════════════════════
// Errors / state / backend seam
// ════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth is not available: {0}")]
    Unsupported(String),

    #[error("device selection cancelled")]
    Cancelled,

    #[error("GATT connection failed: {0}")]
    GattConnect(String),

    #[error("no compatible UART service on the device")]
    NoCompatibleService,

    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    RequestingDevice,
    ConnectingGatt,
    DiscoveringServices,
    Initializing,
    Connected,
    /// The hub dropped the connection.
    Disconnected,
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name:    String,
    pub address: String,
    /// Backend-specific handle (D-Bus object path for BlueZ).
    pub id:      String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected,
}

pub trait GattBackend: Send {
    /// Err(`Unsupported`) when there is no usable adapter.
    fn check_available(&mut self) -> Result<(), BleError>;

    /// Pick a device advertising one of `profiles`' services.
    fn request_device(&mut self, profiles: &[UartProfile]) -> Result<DeviceInfo, BleError>;

    /// Connect and return a stream of link events for this connection.
    fn connect(&mut self, device: &DeviceInfo) -> Result<Receiver<LinkEvent>, BleError>;

    /// The write characteristic handle, if the device implements `profile`.
    fn resolve(&mut self, device: &DeviceInfo, profile: &UartProfile) -> Result<Option<String>, BleError>;

    fn start_notify(&mut self, device: &DeviceInfo, profile: &UartProfile) -> Result<(), BleError>;

    fn write(&mut self, characteristic: &str, bytes: &[u8]) -> Result<(), BleError>;

    fn disconnect(&mut self, device: &DeviceInfo);
}

// ════════════════════════════════════════════════════════════════════════════
// BleTransport
// ════════════════════════════════════════════════════════════════════════════

struct Session {
    device:     DeviceInfo,
    profile:    UartProfile,
    write_char: String,
    generation: u64,
}

struct Link {
    backend:    Box<dyn GattBackend>,
    session:    Option<Session>,
    generation: u64,
}

#[derive(Clone)]
pub struct BleTransport {
    link:       Arc<Mutex<Link>>,
    state:      Arc<RwLock<LinkState>>,
    profiles:   Vec<UartProfile>,
    chunk_size: usize,
    chunk_gap:  Duration,
}

impl BleTransport {
    pub fn new(backend: Box<dyn GattBackend>) -> Self {
        BleTransport {
            link:       Arc::new(Mutex::new(Link { backend, session: None, generation: 0 })),
            state:      Arc::new(RwLock::new(LinkState::Idle)),
            profiles:   PROFILES.to_vec(),
            chunk_size: CHUNK_SIZE,
            chunk_gap:  CHUNK_GAP,
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<UartProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_gap: Duration) -> Self {
        self.chunk_size = chunk_size.max(2);
        self.chunk_gap  = chunk_gap;
        self
    }

    pub fn state(&self) -> LinkState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_state(&self, state: LinkState) {
        log::debug!(target: "ble", "state -> {:?}", state);
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Name of the profile in use, while connected.
    pub fn profile_name(&self) -> Option<&'static str> {
        self.lock().session.as_ref().map(|s| s.profile.name)
    }

    fn fail(&self, e: BleError) -> BleError {
        log::error!(target: "ble", "{}", e);
        self.set_state(LinkState::Error(e.to_string()));
        e
    }

    /// Pick a device, connect, find a profile and initialise it.
    ///
    /// Cancelling device selection returns to `Idle` and yields
    /// `Err(Cancelled)`; every other failure leaves the link in `Error`.
    pub fn connect(&self) -> Result<DeviceInfo, BleError> {
        let mut link = self.lock();
        if let Some(session) = &link.session {
            if self.is_connected() {
                return Ok(session.device.clone());
            }
        }

        self.set_state(LinkState::RequestingDevice);
        if let Err(e) = link.backend.check_available() {
            return Err(self.fail(e));
        }
        let device = match link.backend.request_device(&self.profiles) {
            Ok(d) => d,
            Err(BleError::Cancelled) => {
                log::info!(target: "ble", "device selection cancelled");
                self.set_state(LinkState::Idle);
                return Err(BleError::Cancelled);
            }
            Err(e) => return Err(self.fail(e)),
        };
        log::info!(target: "ble", "connecting to {} ({})", device.name, device.address);

        self.set_state(LinkState::ConnectingGatt);
        let events = match link.backend.connect(&device) {
            Ok(rx) => rx,
            Err(e) => return Err(self.fail(e)),
        };

        self.set_state(LinkState::DiscoveringServices);
        let mut found = None;
        for profile in &self.profiles {
            match link.backend.resolve(&device, profile) {
                Ok(Some(ch)) => {
                    found = Some((*profile, ch));
                    break;
                }
                Ok(None) => log::debug!(target: "ble", "{} not present", profile.name),
                Err(e)   => log::debug!(target: "ble", "{} probe failed: {}", profile.name, e),
            }
        }
        let Some((profile, write_char)) = found else {
            link.backend.disconnect(&device);
            return Err(self.fail(BleError::NoCompatibleService));
        };
        log::info!(target: "ble", "using {} profile", profile.name);

        self.set_state(LinkState::Initializing);
        if let Err(e) = link.backend.start_notify(&device, &profile) {
            log::warn!(target: "ble", "notifications unavailable: {}", e);
        }
        for packet in chunk_packets(profile.init, self.chunk_size, profile.prefix) {
            if let Err(e) = link.backend.write(&write_char, &packet) {
                link.backend.disconnect(&device);
                return Err(self.fail(e));
            }
        }

        link.generation += 1;
        let generation = link.generation;
        link.session = Some(Session { device: device.clone(), profile, write_char, generation });
        drop(link);
        self.set_state(LinkState::Connected);
        self.watch(events, generation);
        Ok(device)
    }

    /// Follow the backend's events for one connection.
    fn watch(&self, events: Receiver<LinkEvent>, generation: u64) {
        let this = self.clone();
        thread::spawn(move || {
            for event in events {
                match event {
                    LinkEvent::Disconnected => {
                        this.on_disconnected(generation);
                        return;
                    }
                }
            }
        });
    }

    fn on_disconnected(&self, generation: u64) {
        // state first: in-flight writes check it between packets
        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            if *state == LinkState::Connected {
                *state = LinkState::Disconnected;
            }
        }
        let mut link = self.lock();
        if link.session.as_ref().map_or(false, |s| s.generation == generation) {
            if let Some(s) = link.session.take() {
                log::warn!(target: "ble", "{} disconnected", s.device.name);
            }
        }
    }

    /// Write one logical block.  Returns `false` (and logs) if the link is
    /// down or a packet fails; never interleaves with another block.
    pub fn write_block(&self, bytes: &[u8]) -> bool {
        let mut link = self.lock();
        let Some(session) = link.session.as_ref() else {
            log::warn!(target: "ble", "write of {} bytes dropped: not connected", bytes.len());
            return false;
        };
        let write_char = session.write_char.clone();
        let packets = chunk_packets(bytes, self.chunk_size, session.profile.prefix);

        for (i, packet) in packets.iter().enumerate() {
            if i > 0 {
                thread::sleep(self.chunk_gap);
            }
            if !self.is_connected() {
                log::warn!(target: "ble", "link lost after {} of {} packets", i, packets.len());
                return false;
            }
            if let Err(e) = link.backend.write(&write_char, packet) {
                log::warn!(target: "ble", "{}", e);
                return false;
            }
        }
        log::trace!(target: "ble", "wrote {} bytes in {} packets", bytes.len(), packets.len());
        true
    }

    /// User-initiated disconnect; back to `Idle`.
    pub fn disconnect(&self) {
        let mut link = self.lock();
        if let Some(session) = link.session.take() {
            link.backend.disconnect(&session.device);
            log::info!(target: "ble", "disconnected from {}", session.device.name);
        }
        drop(link);
        self.set_state(LinkState::Idle);
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════
