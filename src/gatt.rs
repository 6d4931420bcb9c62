//! Declarative layout of the FTMS GATT service.
//!
//! The characteristic order is fixed: some head units discover
//! characteristics by position and break if it changes.

use uuid::Uuid;

use crate::protocol::{
    self, CCCD_UUID, CONTROL_POINT_UUID, FEATURE_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    MACHINE_STATUS_UUID, POWER_RANGE, POWER_RANGE_UUID, RESISTANCE_RANGE, RESISTANCE_RANGE_UUID,
};
use crate::Capability;

/// BLE characteristic properties used by this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl Properties {
    pub const READ: Self = Self { read: true, write: false, notify: false, indicate: false };
    pub const NOTIFY: Self = Self { read: false, write: false, notify: true, indicate: false };
    pub const WRITE_INDICATE: Self = Self { read: false, write: true, notify: false, indicate: true };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorData {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

impl DescriptorData {
    /// Client Characteristic Configuration, notifications and indications off.
    pub fn client_config() -> Self {
        Self {
            uuid: CCCD_UUID,
            value: vec![0x00, 0x00],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicData {
    pub uuid: Uuid,
    pub properties: Properties,
    /// Static value for read-only characteristics
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<DescriptorData>,
}

impl CharacteristicData {
    fn new(uuid: Uuid, properties: Properties, value: Option<Vec<u8>>) -> Self {
        Self {
            uuid,
            properties,
            value,
            descriptors: vec![DescriptorData::client_config()],
        }
    }
}

/// The FTMS primary service as registered with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicData>,
}

impl ServiceDescriptor {
    pub fn build(capability: Capability) -> Self {
        let mut characteristics = vec![
            CharacteristicData::new(INDOOR_BIKE_DATA_UUID, Properties::NOTIFY, None),
            CharacteristicData::new(CONTROL_POINT_UUID, Properties::WRITE_INDICATE, None),
            CharacteristicData::new(
                FEATURE_UUID,
                Properties::READ,
                Some(protocol::encode_feature(capability).to_vec()),
            ),
            CharacteristicData::new(MACHINE_STATUS_UUID, Properties::NOTIFY, None),
        ];

        if capability.controllable {
            let (min, max, step) = POWER_RANGE;
            characteristics.push(CharacteristicData::new(
                POWER_RANGE_UUID,
                Properties::READ,
                Some(protocol::encode_range(min, max, step).to_vec()),
            ));
            let (min, max, step) = RESISTANCE_RANGE;
            characteristics.push(CharacteristicData::new(
                RESISTANCE_RANGE_UUID,
                Properties::READ,
                Some(protocol::encode_range(min, max, step).to_vec()),
            ));
        }

        Self {
            uuid: FTMS_SERVICE_UUID,
            characteristics,
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicData> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}
