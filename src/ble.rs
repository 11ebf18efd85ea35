use crate::error::LinkError;
use crate::link::Link;
use bluebus::{DeviceProxy, GattCharacteristic1Proxy};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zbus::Connection;

pub const SRNE_WRITE_CHAR_UUID: &str = "53300001-0023-4bd4-bbd5-a6920e4c5653";
pub const SRNE_NOTIFY_CHAR_UUID: &str = "53300005-0023-4bd4-bbd5-a6920e4c5653";

const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

/// BlueZ GATT link to an inverter's BLE bridge.
pub struct BleLink {
    device_path: String,
    connection: Option<Connection>,
    write_char_path: Option<String>,
    listener: Option<JoinHandle<()>>,
}

impl BleLink {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            connection: None,
            write_char_path: None,
            listener: None,
        }
    }

    pub fn by_address(mac_address: &str, adapter: &str) -> Self {
        let mac_formatted = mac_address.replace(':', "_").to_uppercase();
        Self::new(format!("/org/bluez/{adapter}/dev_{mac_formatted}"))
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    async fn wait_for_services(device: &DeviceProxy<'_>) -> Result<(), LinkError> {
        for _ in 0..50 {
            if device.services_resolved().await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(LinkError::Io(std::io::Error::other(
            "Timeout waiting for services to resolve",
        )))
    }

    async fn find_characteristics(
        connection: &Connection,
        device_path: &str,
    ) -> Result<(String, String), LinkError> {
        let mut write_path = None;
        let mut notify_path = None;

        for service_idx in 0..16 {
            for char_idx in 0..32 {
                let path = format!("{device_path}/service{service_idx:04x}/char{char_idx:04x}");

                let Some(proxy) = GattCharacteristic1Proxy::builder(connection)
                    .path(path.as_str())
                    .ok()
                    .map(zbus::proxy::Builder::build)
                else {
                    continue;
                };
                let Ok(proxy) = proxy.await else {
                    continue;
                };
                let Ok(uuid) = proxy.uuid().await else {
                    continue;
                };

                match uuid.to_lowercase().as_str() {
                    SRNE_WRITE_CHAR_UUID => write_path = Some(path),
                    SRNE_NOTIFY_CHAR_UUID => notify_path = Some(path),
                    _ => {}
                }

                if let (Some(w), Some(n)) = (&write_path, &notify_path) {
                    return Ok((w.clone(), n.clone()));
                }
            }
        }

        Err(LinkError::Io(std::io::Error::other(
            "inverter GATT characteristics not found",
        )))
    }

    /// Forward `Value` property changes of the notify characteristic.
    async fn listen(
        connection: Connection,
        notify_path: String,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), LinkError> {
        let mut characteristic = GattCharacteristic1Proxy::builder(&connection)
            .path(notify_path.as_str())?
            .build()
            .await?;
        let properties = zbus::fdo::PropertiesProxy::builder(&connection)
            .destination("org.bluez")?
            .path(notify_path.as_str())?
            .build()
            .await?;
        let mut changes = properties.receive_properties_changed().await?;
        characteristic.start_notify().await?;
        tracing::debug!("Subscribed to notifications on {}", notify_path);

        while let Some(signal) = changes.next().await {
            let Ok(args) = signal.args() else {
                continue;
            };
            if args.interface_name().as_str() != GATT_CHARACTERISTIC_INTERFACE {
                continue;
            }
            let Some(value) = args.changed_properties().get("Value") else {
                continue;
            };
            let Some(data) = value
                .try_clone()
                .ok()
                .and_then(|v| Vec::<u8>::try_from(v).ok())
                .filter(|d| !d.is_empty())
            else {
                continue;
            };
            tracing::trace!("Notification: {:02X?}", data);
            if tx.send(data).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

impl Link for BleLink {
    async fn open(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        let connection = Connection::system().await?;

        let device = DeviceProxy::builder(&connection)
            .path(self.device_path.as_str())?
            .build()
            .await?;

        if !device.connected().await? {
            tracing::info!("Connecting to {}", self.device_path);
            device.connect().await?;
            Self::wait_for_services(&device).await?;
        }

        let (write_char_path, notify_char_path) =
            Self::find_characteristics(&connection, &self.device_path).await?;

        let (tx, notify_rx) = mpsc::channel(16);
        let listener_connection = connection.clone();
        self.listener = Some(tokio::spawn(async move {
            if let Err(e) = Self::listen(listener_connection, notify_char_path, tx).await {
                tracing::warn!("Notification listener stopped: {}", e);
            }
        }));

        // The bridge drops writes issued before the subscription settles.
        tokio::time::sleep(Duration::from_millis(100)).await;

        self.connection = Some(connection);
        self.write_char_path = Some(write_char_path);
        Ok(notify_rx)
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let (Some(connection), Some(path)) = (&self.connection, &self.write_char_path) else {
            return Err(LinkError::Closed);
        };
        let mut write_char = GattCharacteristic1Proxy::builder(connection)
            .path(path.as_str())?
            .build()
            .await?;
        write_char.write_value(frame.to_vec(), HashMap::new()).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.write_char_path = None;
        let Some(connection) = self.connection.take() else {
            return;
        };
        let device = DeviceProxy::builder(&connection)
            .path(self.device_path.as_str())
            .ok()
            .map(zbus::proxy::Builder::build);
        if let Some(device) = device
            && let Ok(device) = device.await
            && let Err(e) = device.disconnect().await
        {
            tracing::debug!("Disconnect from {} failed: {}", self.device_path, e);
        }
    }
}

pub async fn discover_devices(name_prefix: &str) -> Vec<bluebus::DeviceInfo> {
    bluebus::list_devices()
        .await
        .into_iter()
        .filter(|d| d.name.as_ref().is_some_and(|n| n.starts_with(name_prefix)))
        .collect()
}
