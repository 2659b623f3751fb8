//! BlueZ implementation of [`GattBackend`], over the D-Bus system bus.
//!
//! Device selection is a timed scan: the adapter is powered, discovery
//! runs for `scan_secs`, and the first device advertising one of the
//! profile services (or the configured address) is used.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use dbus::arg::{prop_cast, PropMap, RefArg, Variant};
use dbus::blocking::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::blocking::Connection;

use crate::ble::{BleError, DeviceInfo, GattBackend, LinkEvent, UartProfile};
use crate::config::BleConfig;

const BUS:            &str = "org.bluez";
const ADAPTER_IFACE:  &str = "org.bluez.Adapter1";
const DEVICE_IFACE:   &str = "org.bluez.Device1";
const SERVICE_IFACE:  &str = "org.bluez.GattService1";
const CHAR_IFACE:     &str = "org.bluez.GattCharacteristic1";

const CALL_TIMEOUT:    Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type ManagedObjects = HashMap<dbus::Path<'static>, HashMap<String, PropMap>>;

pub struct BluezBackend {
    adapter: String,
    device:  Option<String>,
    scan:    Duration,
    conn:    Option<Connection>,
    watcher: Option<Arc<AtomicBool>>,
}

impl BluezBackend {
    pub fn new(cfg: &BleConfig) -> Self {
        BluezBackend {
            adapter: format!("/org/bluez/{}", cfg.adapter),
            device:  cfg.device.clone(),
            scan:    Duration::from_secs(cfg.scan_secs),
            conn:    None,
            watcher: None,
        }
    }

    fn conn(&mut self) -> Result<&Connection, BleError> {
        if self.conn.is_none() {
            let conn = Connection::new_system()
                .map_err(|e| BleError::Unsupported(format!("system bus: {}", e)))?;
            self.conn = Some(conn);
        }
        self.conn.as_ref().ok_or_else(|| BleError::Unsupported("system bus".into()))
    }

    fn objects(&mut self) -> Result<ManagedObjects, BleError> {
        let conn = self.conn()?;
        conn.with_proxy(BUS, "/", CALL_TIMEOUT)
            .get_managed_objects()
            .map_err(|e| BleError::GattConnect(e.to_string()))
    }

    /// Object path of the characteristic `char_uuid` inside the service
    /// `service_uuid` of `device`.
    fn find_characteristic(
        &mut self,
        device: &DeviceInfo,
        service_uuid: &str,
        char_uuid: &str,
    ) -> Result<Option<String>, BleError> {
        let objects = self.objects()?;
        let uuid_of = |props: &PropMap| prop_cast::<String>(props, "UUID").map(|u| u.to_lowercase());

        let service = objects.iter().find_map(|(path, ifaces)| {
            let props = ifaces.get(SERVICE_IFACE)?;
            (path.starts_with(&device.id) && uuid_of(props).as_deref() == Some(service_uuid))
                .then(|| path.to_string())
        });
        let Some(service) = service else { return Ok(None) };

        let prefix = format!("{}/", service);
        Ok(objects.iter().find_map(|(path, ifaces)| {
            let props = ifaces.get(CHAR_IFACE)?;
            (path.starts_with(&prefix) && uuid_of(props).as_deref() == Some(char_uuid))
                .then(|| path.to_string())
        }))
    }

    fn stop_watcher(&mut self) {
        if let Some(stop) = self.watcher.take() {
            stop.store(true, Ordering::Relaxed);
        }
    }
}

impl GattBackend for BluezBackend {
    fn check_available(&mut self) -> Result<(), BleError> {
        let adapter = self.adapter.clone();
        let conn = self.conn()?;
        let proxy = conn.with_proxy(BUS, &adapter, CALL_TIMEOUT);
        let powered: bool = proxy.get(ADAPTER_IFACE, "Powered")
            .map_err(|e| BleError::Unsupported(format!("{}: {}", adapter, e)))?;
        if !powered {
            proxy.set(ADAPTER_IFACE, "Powered", true)
                .map_err(|e| BleError::Unsupported(format!("could not power {}: {}", adapter, e)))?;
            log::info!(target: "bluez", "adapter powered on");
        }
        Ok(())
    }

    fn request_device(&mut self, profiles: &[UartProfile]) -> Result<DeviceInfo, BleError> {
        let adapter = self.adapter.clone();
        let scan = self.scan;
        {
            let conn = self.conn()?;
            let proxy = conn.with_proxy(BUS, &adapter, CALL_TIMEOUT);
            let mut filter = PropMap::new();
            filter.insert("Transport".into(), Variant(Box::new("le".to_string())));
            if let Err(e) = proxy.method_call::<(), _, _, _>(ADAPTER_IFACE, "SetDiscoveryFilter", (filter,)) {
                log::debug!(target: "bluez", "discovery filter: {}", e);
            }
            proxy.method_call::<(), _, _, _>(ADAPTER_IFACE, "StartDiscovery", ())
                .map_err(|e| BleError::Unsupported(format!("discovery: {}", e)))?;
            log::info!(target: "bluez", "scanning for {}s", scan.as_secs());
            thread::sleep(scan);
            if let Err(e) = proxy.method_call::<(), _, _, _>(ADAPTER_IFACE, "StopDiscovery", ()) {
                log::debug!(target: "bluez", "stop discovery: {}", e);
            }
        }

        let wanted = self.device.as_ref().map(|a| a.to_uppercase());
        let services: Vec<&str> = profiles.iter().map(|p| p.service).collect();
        let mut candidates: Vec<DeviceInfo> = self.objects()?
            .iter()
            .filter(|(path, _)| path.starts_with(&adapter))
            .filter_map(|(path, ifaces)| {
                let props = ifaces.get(DEVICE_IFACE)?;
                let address = prop_cast::<String>(props, "Address")?.to_uppercase();
                let name = prop_cast::<String>(props, "Name").cloned().unwrap_or_else(|| address.clone());
                let advertises = props.get("UUIDs")
                    .and_then(|v| v.0.as_iter())
                    .map_or(false, |mut uuids| {
                        uuids.any(|u| u.as_str().map_or(false, |u| services.contains(&u.to_lowercase().as_str())))
                    });
                let matches = match &wanted {
                    Some(w) => *w == address,
                    None    => advertises,
                };
                matches.then(|| DeviceInfo { name, address, id: path.to_string() })
            })
            .collect();
        candidates.sort_by(|a, b| a.address.cmp(&b.address));

        match (candidates.into_iter().next(), wanted) {
            (Some(device), _) => Ok(device),
            (None, Some(addr)) => Err(BleError::GattConnect(format!("device {} not found", addr))),
            (None, None) => {
                log::info!(target: "bluez", "no hub found during scan");
                Err(BleError::Cancelled)
            }
        }
    }

    fn connect(&mut self, device: &DeviceInfo) -> Result<Receiver<LinkEvent>, BleError> {
        self.stop_watcher();
        {
            let conn = self.conn()?;
            let proxy = conn.with_proxy(BUS, &device.id, CONNECT_TIMEOUT);
            proxy.method_call::<(), _, _, _>(DEVICE_IFACE, "Connect", ())
                .map_err(|e| BleError::GattConnect(e.to_string()))?;

            let deadline = Instant::now() + CONNECT_TIMEOUT;
            loop {
                let resolved: bool = proxy.get(DEVICE_IFACE, "ServicesResolved").unwrap_or(false);
                if resolved {
                    break;
                }
                if Instant::now() > deadline {
                    return Err(BleError::GattConnect("services never resolved".into()));
                }
                thread::sleep(Duration::from_millis(100));
            }
        }

        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        self.watcher = Some(Arc::clone(&stop));
        let path = device.id.clone();

        thread::spawn(move || {
            use dbus::blocking::stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged as PC;
            use dbus::message::SignalArgs;

            let conn = match Connection::new_system() {
                Ok(c) => c,
                Err(e) => {
                    log::warn!(target: "bluez", "disconnect watcher unavailable: {}", e);
                    return;
                }
            };
            let lost = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&lost);
            let rule = PC::match_rule(None, None);
            let added = conn.add_match(rule, move |pc: PC, _, msg| {
                if msg.path().map(|p| p.to_string()) != Some(path.clone()) || pc.interface_name != DEVICE_IFACE {
                    return true;
                }
                if pc.changed_properties.get("Connected").and_then(|v| v.0.as_u64()) == Some(0) {
                    flag.store(true, Ordering::Relaxed);
                }
                true
            });
            if let Err(e) = added {
                log::warn!(target: "bluez", "disconnect watcher unavailable: {}", e);
                return;
            }

            while !stop.load(Ordering::Relaxed) {
                if let Err(e) = conn.process(Duration::from_millis(500)) {
                    log::warn!(target: "bluez", "watcher: {}", e);
                    break;
                }
                if lost.load(Ordering::Relaxed) {
                    let _ = tx.send(LinkEvent::Disconnected);
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn resolve(&mut self, device: &DeviceInfo, profile: &UartProfile) -> Result<Option<String>, BleError> {
        self.find_characteristic(device, profile.service, profile.write)
    }

    fn start_notify(&mut self, device: &DeviceInfo, profile: &UartProfile) -> Result<(), BleError> {
        let Some(path) = self.find_characteristic(device, profile.service, profile.notify)? else {
            return Ok(());
        };
        let conn = self.conn()?;
        conn.with_proxy(BUS, &path, CALL_TIMEOUT)
            .method_call::<(), _, _, _>(CHAR_IFACE, "StartNotify", ())
            .map_err(|e| BleError::GattConnect(e.to_string()))
    }

    fn write(&mut self, characteristic: &str, bytes: &[u8]) -> Result<(), BleError> {
        let conn = self.conn()?;
        conn.with_proxy(BUS, characteristic, CALL_TIMEOUT)
            .method_call::<(), _, _, _>(CHAR_IFACE, "WriteValue", (bytes.to_vec(), PropMap::new()))
            .map_err(|e| BleError::Write(e.to_string()))
    }

    fn disconnect(&mut self, device: &DeviceInfo) {
        self.stop_watcher();
        let Ok(conn) = self.conn() else { return };
        let result = conn.with_proxy(BUS, &device.id, CALL_TIMEOUT)
            .method_call::<(), _, _, _>(DEVICE_IFACE, "Disconnect", ());
        if let Err(e) = result {
            log::warn!(target: "bluez", "disconnect: {}", e);
        }
    }
}
