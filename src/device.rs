//! Devices and the registry the slave dispatcher routes through
//!
//! A [`Device`] pairs a unit id with an optional process image. The
//! [`DeviceRegistry`] keeps devices in insertion order; routing picks the
//! first device whose unit id matches, so a duplicate unit id later in the
//! list is shadowed.
//!
//! Registries are usually assembled by the bootstrap layer from a
//! [`RegistryConfig`]:
//!
//! ```rust
//! use procimg_modbus::device::{DeviceRegistry, RegistryConfig};
//!
//! let config = RegistryConfig::from_yaml_str(
//!     r#"
//! devices:
//!   - unit_id: 15
//!     process_image:
//!       coils: 16
//!       holding_registers: 10
//! "#,
//! ).unwrap();
//!
//! let registry = DeviceRegistry::from_config(&config);
//! let image = registry.find_by_unit_id(15).and_then(|d| d.process_image()).unwrap();
//! assert_eq!(image.get_stats().unwrap().holding_registers_count, 10);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ModbusError, ModbusResult};
use crate::process_image::ProcessImage;
use crate::protocol::UnitId;

/// Role of a device on the bus
///
/// Informational only; routing looks at the unit id and the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Master,
    #[default]
    Slave,
}

/// A unit id with the process image it answers from
#[derive(Debug, Clone)]
pub struct Device {
    unit_id: UnitId,
    role: DeviceRole,
    process_image: Option<Arc<ProcessImage>>,
}

impl Device {
    /// Device without a process image
    pub fn new(unit_id: UnitId, role: DeviceRole) -> Self {
        Self {
            unit_id,
            role,
            process_image: None,
        }
    }

    /// Slave device serving `process_image`
    pub fn slave(unit_id: UnitId, process_image: Arc<ProcessImage>) -> Self {
        Self::new(unit_id, DeviceRole::Slave).with_process_image(process_image)
    }

    pub fn with_process_image(mut self, process_image: Arc<ProcessImage>) -> Self {
        self.process_image = Some(process_image);
        self
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == DeviceRole::Master
    }

    pub fn process_image(&self) -> Option<&Arc<ProcessImage>> {
        self.process_image.as_ref()
    }

    /// Check if a request for `unit_id` is addressed to this device
    pub fn handles(&self, unit_id: UnitId) -> bool {
        self.unit_id == unit_id
    }
}

/// Ordered collection of devices
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device; earlier devices win on duplicate unit ids
    pub fn add(&mut self, device: Device) {
        self.devices.push(device);
    }

    /// Builder form of [`DeviceRegistry::add`]
    pub fn with_device(mut self, device: Device) -> Self {
        self.add(device);
        self
    }

    /// First device registered for `unit_id`
    pub fn find_by_unit_id(&self, unit_id: UnitId) -> Option<&Device> {
        self.devices.iter().find(|d| d.handles(unit_id))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Build a registry with one fresh process image per configured device
    pub fn from_config(config: &RegistryConfig) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|device| {
                let mut built = Device::new(device.unit_id, device.role);
                if let Some(image) = &device.process_image {
                    built = built.with_process_image(Arc::new(image.build()));
                }
                built
            })
            .collect();
        Self { devices }
    }
}

impl FromIterator<Device> for DeviceRegistry {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        Self {
            devices: iter.into_iter().collect(),
        }
    }
}

/// Table sizes and optional initial values of a process image
///
/// An initial value list longer than its table size grows the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessImageConfig {
    pub discrete_inputs: usize,
    pub coils: usize,
    pub input_registers: usize,
    pub holding_registers: usize,
    pub discrete_input_values: Vec<bool>,
    pub coil_values: Vec<bool>,
    pub input_register_values: Vec<u16>,
    pub holding_register_values: Vec<u16>,
}

impl ProcessImageConfig {
    /// Build a zeroed image with the initial values applied
    pub fn build(&self) -> ProcessImage {
        ProcessImage::builder()
            .digital_input_values(&padded(&self.discrete_input_values, self.discrete_inputs))
            .coil_values(&padded(&self.coil_values, self.coils))
            .input_register_values(&padded(&self.input_register_values, self.input_registers))
            .holding_register_values(&padded(&self.holding_register_values, self.holding_registers))
            .build()
    }
}

fn padded<T: Copy + Default>(values: &[T], size: usize) -> Vec<T> {
    let mut table = values.to_vec();
    if table.len() < size {
        table.resize(size, T::default());
    }
    table
}

/// One configured device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub unit_id: UnitId,
    #[serde(default)]
    pub role: DeviceRole,
    #[serde(default)]
    pub process_image: Option<ProcessImageConfig>,
}

/// Device registry configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl RegistryConfig {
    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject slave entries that could never answer a request
    pub fn validate(&self) -> ModbusResult<()> {
        for device in &self.devices {
            if device.role == DeviceRole::Slave && device.process_image.is_none() {
                return Err(ModbusError::configuration(format!(
                    "Slave device {} has no process image",
                    device.unit_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins() {
        let first = Arc::new(ProcessImage::new(0, 0, 0, 1));
        let second = Arc::new(ProcessImage::new(0, 0, 0, 2));
        let other = Arc::new(ProcessImage::new(0, 0, 0, 3));

        let registry: DeviceRegistry = vec![
            Device::slave(15, first.clone()),
            Device::slave(15, second),
            Device::slave(7, other.clone()),
        ]
        .into_iter()
        .collect();

        let found = registry.find_by_unit_id(15).and_then(Device::process_image).unwrap();
        assert!(Arc::ptr_eq(found, &first));
        let found = registry.find_by_unit_id(7).and_then(Device::process_image).unwrap();
        assert!(Arc::ptr_eq(found, &other));
        assert!(registry.find_by_unit_id(1).is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_device_without_image() {
        let registry = DeviceRegistry::new().with_device(Device::new(3, DeviceRole::Master));
        let device = registry.find_by_unit_id(3).unwrap();
        assert!(device.is_master());
        assert!(device.process_image().is_none());
    }

    #[test]
    fn test_config_from_json() {
        let config = RegistryConfig::from_json_str(
            r#"{
                "devices": [
                    {"unit_id": 1, "process_image": {"coils": 4, "coil_values": [true], "holding_register_values": [7, 8]}},
                    {"unit_id": 2, "role": "master"}
                ]
            }"#,
        )
        .unwrap();
        let registry = DeviceRegistry::from_config(&config);

        let image = registry.find_by_unit_id(1).and_then(Device::process_image).unwrap();
        assert_eq!(image.get_coils(0, 4).unwrap(), vec![true, false, false, false]);
        assert_eq!(image.get_holding_registers(0, 2).unwrap(), vec![7, 8]);
        assert!(image.get_holding_registers(0, 3).is_err());
        assert_eq!(registry.find_by_unit_id(2).unwrap().role(), DeviceRole::Master);
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(
            RegistryConfig::from_json_str(r#"{"devices": [{"unit_id": 1}]}"#),
            Err(ModbusError::Configuration { .. })
        ));
        assert!(matches!(
            RegistryConfig::from_yaml_str("devices: [{unit_id: 300}]"),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[test]
    fn test_process_image_config_sizes() {
        let image = ProcessImageConfig {
            discrete_inputs: 2,
            input_register_values: vec![1, 2, 3],
            input_registers: 1,
            ..Default::default()
        }
        .build();

        let stats = image.get_stats().unwrap();
        assert_eq!(stats.discrete_inputs_count, 2);
        assert_eq!(stats.input_registers_count, 3);
        assert_eq!(stats.coils_count, 0);
    }
}
