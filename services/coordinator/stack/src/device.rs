//! Device table with bijective short/IEEE address translation

use crate::link_quality::LinkQualityWindow;
use std::collections::HashMap;
use zb_wire::MacCapabilities;

/// End device timeouts by index: 10 s, then 2^n minutes
pub const END_DEVICE_TIMEOUT_MAX_INDEX: u8 = 14;

/// Timeout in milliseconds for a timeout index
pub fn end_device_timeout_ms(index: u8) -> Option<u64> {
    match index {
        0 => Some(10_000),
        1..=END_DEVICE_TIMEOUT_MAX_INDEX => Some((1u64 << index) * 60_000),
        _ => None,
    }
}

/// Negotiated end device timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndDeviceTimeout {
    /// Requested index
    pub index: u8,
    /// Device configuration byte
    pub configuration: u8,
    /// Timeout length
    pub timeout_ms: u64,
    /// Last keepalive from the device
    pub last_keepalive_ms: u64,
}

/// Known device
#[derive(Debug, Clone)]
pub struct Device {
    /// IEEE address
    pub address64: u64,
    /// Short address
    pub address16: u16,
    /// MAC capabilities
    pub capabilities: MacCapabilities,
    /// Completed key verification
    pub authorized: bool,
    /// Directly reachable
    pub neighbor: bool,
    /// Parent router for devices joined through one
    pub parent16: Option<u16>,
    /// Last network key sequence delivered
    pub last_key_sequence: Option<u8>,
    /// Recent receptions
    pub link_quality: LinkQualityWindow,
    /// Last accepted NWK security frame counter
    pub incoming_frame_counter: Option<u32>,
    /// End device keepalive contract
    pub end_device_timeout: Option<EndDeviceTimeout>,
    /// Consecutive link status periods without hearing from this neighbor
    pub missed_link_status: u8,
}

impl Device {
    /// New entry with no history
    pub fn new(address64: u64, address16: u16, capabilities: MacCapabilities) -> Self {
        Self {
            address64,
            address16,
            capabilities,
            authorized: false,
            neighbor: false,
            parent16: None,
            last_key_sequence: None,
            link_quality: LinkQualityWindow::default(),
            incoming_frame_counter: None,
            end_device_timeout: None,
            missed_link_status: 0,
        }
    }

    /// Whether frames to this device must wait for a poll
    pub fn is_sleepy_child(&self) -> bool {
        self.neighbor && !self.capabilities.rx_on_when_idle()
    }
}

/// Devices keyed by IEEE address plus the reverse short address map
#[derive(Debug, Default)]
pub(crate) struct DeviceTable {
    by_address64: HashMap<u64, Device>,
    by_address16: HashMap<u16, u64>,
}

impl DeviceTable {
    pub(crate) fn get(&self, address64: u64) -> Option<&Device> {
        self.by_address64.get(&address64)
    }

    pub(crate) fn get_mut(&mut self, address64: u64) -> Option<&mut Device> {
        self.by_address64.get_mut(&address64)
    }

    pub(crate) fn address64_of(&self, address16: u16) -> Option<u64> {
        self.by_address16.get(&address16).copied()
    }

    pub(crate) fn get_by_address16(&self, address16: u16) -> Option<&Device> {
        self.address64_of(address16).and_then(|a| self.by_address64.get(&a))
    }

    pub(crate) fn get_by_address16_mut(&mut self, address16: u16) -> Option<&mut Device> {
        let address64 = self.address64_of(address16)?;
        self.by_address64.get_mut(&address64)
    }

    pub(crate) fn is_address16_used(&self, address16: u16) -> bool {
        self.by_address16.contains_key(&address16)
    }

    /// Insert or replace; the caller guarantees `device.address16` is free or already its own
    pub(crate) fn insert(&mut self, device: Device) {
        if let Some(previous) = self.by_address64.get(&device.address64) {
            if previous.address16 != device.address16 {
                self.by_address16.remove(&previous.address16);
            }
        }
        self.by_address16.insert(device.address16, device.address64);
        self.by_address64.insert(device.address64, device);
    }

    /// Move a device to a new short address
    pub(crate) fn readdress(&mut self, address64: u64, address16: u16) -> Option<u16> {
        let device = self.by_address64.get_mut(&address64)?;
        let old = device.address16;
        device.address16 = address16;
        self.by_address16.remove(&old);
        self.by_address16.insert(address16, address64);
        Some(old)
    }

    pub(crate) fn remove(&mut self, address64: u64) -> Option<Device> {
        let device = self.by_address64.remove(&address64)?;
        if self.by_address16.get(&device.address16) == Some(&address64) {
            self.by_address16.remove(&device.address16);
        }
        Some(device)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Device> {
        self.by_address64.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.by_address64.values_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_address64.len()
    }

    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        self.by_address64.len() == self.by_address16.len()
            && self
                .by_address64
                .values()
                .all(|d| self.by_address16.get(&d.address16) == Some(&d.address64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_table() {
        assert_eq!(end_device_timeout_ms(0), Some(10_000));
        assert_eq!(end_device_timeout_ms(1), Some(120_000));
        assert_eq!(end_device_timeout_ms(14), Some(16_384 * 60_000));
        assert_eq!(end_device_timeout_ms(15), None);
    }

    #[test]
    fn test_table_stays_bijective() {
        let mut table = DeviceTable::default();
        table.insert(Device::new(0xa, 0x1111, MacCapabilities::empty()));
        table.insert(Device::new(0xb, 0x2222, MacCapabilities::empty()));

        table.readdress(0xa, 0x3333);
        assert_eq!(table.address64_of(0x3333), Some(0xa));
        assert!(!table.is_address16_used(0x1111));

        let mut moved = table.get(0xb).unwrap().clone();
        moved.address16 = 0x4444;
        table.insert(moved);
        assert!(!table.is_address16_used(0x2222));
        assert!(table.is_consistent());

        table.remove(0xa);
        assert_eq!(table.len(), 1);
        assert!(table.is_consistent());
    }
}
