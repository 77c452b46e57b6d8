//! Bluetooth LE transport
//!
//! Scans for the drum peripheral, connects, and subscribes to the telemetry
//! characteristic. Each notification payload is one binary frame.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral as BlePeripheral};
use futures::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

use super::{DEFAULT_CHARACTERISTIC, Inbound, Link, Peripheral, Transport};
use crate::{Result, TelemetryError};

const SCAN_POLL: Duration = Duration::from_millis(250);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn ble_error(reason: impl Into<String>, e: btleplug::Error) -> TelemetryError {
    TelemetryError::connection_failed_with_source(reason, Box::new(e))
}

/// Stops an adapter scan on every exit path.
///
/// [`ScanGuard::stop`] awaits the stop; a dropped guard (the supervisor's
/// discovery timeout abandoned the scan) stops it on a spawned task.
struct ScanGuard {
    adapter: Option<Adapter>,
}

impl ScanGuard {
    async fn start(adapter: &Adapter) -> Result<Self> {
        adapter.start_scan(ScanFilter::default()).await.map_err(|e| ble_error("Cannot start scan", e))?;
        Ok(Self { adapter: Some(adapter.clone()) })
    }

    async fn stop(mut self) {
        if let Some(adapter) = self.adapter.take() {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Cannot stop scan: {e}");
            }
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let Some(adapter) = self.adapter.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    warn!("Cannot stop abandoned scan: {e}");
                }
            });
        }
    }
}

/// Transport over the host's first Bluetooth adapter
pub struct BleTransport {
    characteristic: String,
    adapter: Option<Adapter>,
    seen: HashMap<String, BlePeripheral>,
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CHARACTERISTIC)
    }
}

impl BleTransport {
    pub fn new(characteristic: impl Into<String>) -> Self {
        Self { characteristic: characteristic.into().to_lowercase(), adapter: None, seen: HashMap::new() }
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await.map_err(|e| ble_error("Bluetooth unavailable", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ble_error("Cannot list Bluetooth adapters", e))?
            .into_iter()
            .next()
            .ok_or_else(|| TelemetryError::connection_failed("No Bluetooth adapter found"))?;
        info!("Using Bluetooth adapter {:?}", adapter.adapter_info().await.ok());
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn scan_once(&mut self, adapter: &Adapter) -> Result<()> {
        let peripherals =
            adapter.peripherals().await.map_err(|e| ble_error("Cannot list peripherals", e))?;
        for peripheral in peripherals {
            self.seen.insert(peripheral.address().to_string(), peripheral);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for BleTransport {
    type Link = BleLink;

    /// Scan until a peripheral advertises `name`; the supervisor bounds the wait.
    async fn discover(&mut self, name: &str) -> Result<Option<Peripheral>> {
        let adapter = self.adapter().await?;
        let scan = ScanGuard::start(&adapter).await?;

        loop {
            let peripherals =
                adapter.peripherals().await.map_err(|e| ble_error("Cannot list peripherals", e))?;
            for peripheral in peripherals {
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                if properties.local_name.as_deref() == Some(name) {
                    let address = peripheral.address().to_string();
                    info!("Found {name} at {address}");
                    scan.stop().await;
                    self.seen.insert(address.clone(), peripheral);
                    return Ok(Some(Peripheral { address, name: properties.local_name }));
                }
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    }

    async fn connect(&mut self, peripheral: &Peripheral) -> Result<BleLink> {
        // an address target skips discovery, so the adapter may not know it yet
        if !self.seen.contains_key(&peripheral.address) {
            let adapter = self.adapter().await?;
            let scan = ScanGuard::start(&adapter).await?;
            tokio::time::sleep(SCAN_POLL * 4).await;
            self.scan_once(&adapter).await?;
            scan.stop().await;
        }
        let device = self.seen.get(&peripheral.address).cloned().ok_or_else(|| {
            TelemetryError::connection_failed(format!("Unknown peripheral {}", peripheral.address))
        })?;

        device.connect().await.map_err(|e| ble_error(format!("Cannot connect to {}", peripheral.address), e))?;
        device.discover_services().await.map_err(|e| ble_error("Service discovery failed", e))?;
        info!("Connected to {}", peripheral.address);

        Ok(BleLink { device, characteristic: self.characteristic.clone(), notifications: None })
    }
}

/// A connected peripheral
pub struct BleLink {
    device: BlePeripheral,
    characteristic: String,
    notifications: Option<Notifications>,
}

impl BleLink {
    fn telemetry_characteristic(&self) -> Option<Characteristic> {
        self.device
            .characteristics()
            .into_iter()
            .find(|c| c.uuid.to_string() == self.characteristic)
    }
}

#[async_trait::async_trait]
impl Link for BleLink {
    async fn subscribe(&mut self) -> Result<()> {
        let characteristic = self.telemetry_characteristic().ok_or_else(|| {
            TelemetryError::unexpected(format!(
                "Characteristic {} not offered by peripheral",
                self.characteristic
            ))
        })?;
        let notifications =
            self.device.notifications().await.map_err(|e| ble_error("Cannot open notifications", e))?;
        self.device.subscribe(&characteristic).await.map_err(|e| ble_error("Cannot subscribe", e))?;
        self.notifications = Some(notifications);
        debug!("Subscribed to {}", self.characteristic);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Inbound> {
        let notifications = self
            .notifications
            .as_mut()
            .ok_or_else(|| TelemetryError::unexpected("next_frame called before subscribe"))?;

        loop {
            match notifications.next().await {
                Some(n) if n.uuid.to_string() == self.characteristic => {
                    trace!("Notification of {} bytes", n.value.len());
                    return Ok(Inbound::Frame(n.value));
                }
                Some(n) => trace!("Ignoring notification from {}", n.uuid),
                None => return Ok(Inbound::Disconnected),
            }
        }
    }

    async fn is_connected(&mut self) -> bool {
        self.device.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.notifications = None;
        if let Err(e) = self.device.disconnect().await {
            warn!("Disconnect failed: {e}");
            return Err(ble_error("Disconnect failed", e));
        }
        Ok(())
    }
}
