//! Capability record accumulated while interrogating a device.

use std::fmt;

use serde::Serialize;

/// One address range reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupportedFeatureMap {
    pub memory_read: bool,
    pub memory_write: bool,
    pub datalog_acquire: bool,
    pub user_command: bool,
}

/// Everything the info poller learns about a device. Every field starts
/// unset and is filled in by one interrogation step; a poll is complete only
/// when [`DeviceInfo::all_ready`] holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceInfo {
    pub protocol_major: Option<u8>,
    pub protocol_minor: Option<u8>,
    pub max_tx_data_size: Option<u16>,
    pub max_rx_data_size: Option<u16>,
    pub max_bitrate_bps: Option<u32>,
    pub rx_timeout_us: Option<u32>,
    pub heartbeat_timeout_us: Option<u32>,
    pub address_size_bits: Option<u16>,
    pub supported_feature_map: Option<SupportedFeatureMap>,
    pub forbidden_memory_regions: Option<Vec<MemoryRegion>>,
    pub readonly_memory_regions: Option<Vec<MemoryRegion>>,
}

impl DeviceInfo {
    pub fn clear(&mut self) {
        *self = DeviceInfo::default();
    }

    pub fn all_ready(&self) -> bool {
        self.protocol_major.is_some()
            && self.protocol_minor.is_some()
            && self.max_tx_data_size.is_some()
            && self.max_rx_data_size.is_some()
            && self.max_bitrate_bps.is_some()
            && self.rx_timeout_us.is_some()
            && self.heartbeat_timeout_us.is_some()
            && self.address_size_bits.is_some()
            && self.supported_feature_map.is_some()
            && self.forbidden_memory_regions.is_some()
            && self.readonly_memory_regions.is_some()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(value: &Option<T>) -> String {
            match value {
                Some(v) => v.to_string(),
                None => "?".to_string(),
            }
        }
        write!(
            f,
            "protocol=V{}.{} tx={} rx={} bitrate={}bps rx_timeout={}us heartbeat_timeout={}us \
             address_size={}bits features={:?} forbidden_regions={} readonly_regions={}",
            opt(&self.protocol_major),
            opt(&self.protocol_minor),
            opt(&self.max_tx_data_size),
            opt(&self.max_rx_data_size),
            opt(&self.max_bitrate_bps),
            opt(&self.rx_timeout_us),
            opt(&self.heartbeat_timeout_us),
            opt(&self.address_size_bits),
            self.supported_feature_map,
            self.forbidden_memory_regions.as_ref().map_or(0, Vec::len),
            self.readonly_memory_regions.as_ref().map_or(0, Vec::len),
        )
    }
}
