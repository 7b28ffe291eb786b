use chrono::Utc;

use crate::rest::{ConnectionStatus, Device};
use crate::wire::DeviceStatus;

pub const DEVICE_TYPE: &str = "PENKO-1020";

const STATUSES: [DeviceStatus; 10] = [
    DeviceStatus::Active,
    DeviceStatus::Active,
    DeviceStatus::Active,
    DeviceStatus::Active,
    DeviceStatus::Active,
    DeviceStatus::Active,
    DeviceStatus::Idle,
    DeviceStatus::Idle,
    DeviceStatus::Error,
    DeviceStatus::Maintenance,
];

const CONNECTIONS: [ConnectionStatus; 10] = [
    ConnectionStatus::Connected,
    ConnectionStatus::Connected,
    ConnectionStatus::Connected,
    ConnectionStatus::Connected,
    ConnectionStatus::Connected,
    ConnectionStatus::Connected,
    ConnectionStatus::Connected,
    ConnectionStatus::Connected,
    ConnectionStatus::Disconnected,
    ConnectionStatus::Error,
];

const STATUS_PERCENTAGES: [u8; 10] = [95, 92, 88, 97, 93, 89, 68, 72, 15, 0];

const LOCATIONS: [&str; 10] = [
    "Warehouse A",
    "Warehouse A",
    "Warehouse B",
    "Warehouse B",
    "Warehouse C",
    "Production Line 1",
    "Production Line 1",
    "Production Line 2",
    "Storage Facility",
    "Quality Control",
];

/// Simulated fleet of `size` scales, `PENKO-1020-001` upwards
///
/// Fleets larger than ten repeat the status/location table.
pub fn fleet(size: usize) -> Vec<Device> {
    let now = Utc::now();
    (0..size)
        .map(|index| {
            let slot = index % STATUSES.len();
            Device {
                id: format!("{}-{:03}", DEVICE_TYPE, index + 1),
                name: format!("Scale A{}", index + 1),
                device_type: DEVICE_TYPE.to_string(),
                location: Some(LOCATIONS[slot].to_string()),
                status: STATUSES[slot],
                last_update: now,
                connection_status: CONNECTIONS[slot],
                status_percentage: Some(STATUS_PERCENTAGES[slot]),
            }
        })
        .collect()
}

pub fn find_device<'a>(devices: &'a [Device], id: &str) -> Option<&'a Device> {
    devices.iter().find(|device| device.id == id)
}
