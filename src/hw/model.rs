use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use uuid::Uuid;

use crate::model::normalise_address;

/// One advertisement sighting, before any vendor is resolved.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct Advertisement {
    address: String,
    local_name: Option<String>,
    rssi: Option<i16>,
    service_uuids: Vec<Uuid>,
    manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl Advertisement {
    /// Creates an advertisement record. The address is normalised to uppercase.
    #[must_use]
    pub fn new(address: &str, local_name: Option<String>) -> Self {
        Self {
            address: normalise_address(address),
            local_name,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    #[must_use]
    pub fn with_service_uuids(mut self, service_uuids: Vec<Uuid>) -> Self {
        self.service_uuids = service_uuids;
        self
    }

    #[must_use]
    pub fn with_manufacturer_data(mut self, company_id: u16, payload: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, payload);
        self
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    #[must_use]
    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }

    #[must_use]
    pub fn manufacturer_data(&self) -> &BTreeMap<u16, Vec<u8>> {
        &self.manufacturer_data
    }

    /// Returns the manufacturer payload for one company identifier.
    #[must_use]
    pub fn manufacturer_payload(&self, company_id: u16) -> Option<&[u8]> {
        self.manufacturer_data.get(&company_id).map(Vec::as_slice)
    }
}

/// A characteristic description discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    uuid: Uuid,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    #[must_use]
    pub fn new(uuid: Uuid, properties: Vec<String>) -> Self {
        Self { uuid, properties }
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns property labels for this characteristic.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }
}

/// A GATT service with discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceInfo {
    uuid: Uuid,
    primary: bool,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    #[must_use]
    pub fn new(uuid: Uuid, primary: bool, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid,
            primary,
            characteristics,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }

    /// Looks up a characteristic by exact UUID.
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
    }
}

/// Looks up a service by exact UUID.
#[must_use]
pub fn find_service(services: &[ServiceInfo], uuid: Uuid) -> Option<&ServiceInfo> {
    services.iter().find(|service| service.uuid == uuid)
}

/// Returns whether the discovered tree holds `characteristic` inside `service`.
#[must_use]
pub fn has_characteristic(services: &[ServiceInfo], service: Uuid, characteristic: Uuid) -> bool {
    find_service(services, service)
        .and_then(|found| found.characteristic(characteristic))
        .is_some()
}

/// Renders discovered service UUIDs for error diagnostics.
pub(crate) fn describe_services(services: &[ServiceInfo]) -> String {
    services
        .iter()
        .map(|service| service.uuid.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders the characteristics of one service for error diagnostics.
pub(crate) fn describe_characteristics(service: &ServiceInfo) -> String {
    let mut rendered = String::new();
    for (index, characteristic) in service.characteristics.iter().enumerate() {
        if index > 0 {
            rendered.push_str(", ");
        }
        let _ = write!(
            rendered,
            "{} ({})",
            characteristic.uuid,
            characteristic.properties.join("|")
        );
    }
    rendered
}

/// GATT write acknowledgement mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
pub enum WriteMode {
    #[display("with_response")]
    WithResponse,
    #[display("without_response")]
    WithoutResponse,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tree() -> Vec<ServiceInfo> {
        vec![ServiceInfo::new(
            Uuid::from_u128(0x180A_0000_1000_8000_0080_5F9B_34FB),
            true,
            vec![CharacteristicInfo::new(
                Uuid::from_u128(0x2A26_0000_1000_8000_0080_5F9B_34FB),
                vec!["read".to_string()],
            )],
        )]
    }

    #[test]
    fn has_characteristic_requires_exact_service_and_characteristic() {
        let services = tree();
        let service = services[0].uuid();
        let characteristic = services[0].characteristics()[0].uuid();

        assert_eq!(
            true,
            has_characteristic(&services, service, characteristic)
        );
        assert_eq!(
            false,
            has_characteristic(&services, characteristic, characteristic)
        );
    }

    #[test]
    fn diagnostics_list_characteristics_with_properties() {
        let services = tree();
        assert_eq!(
            "00002a26-0000-1000-8000-00805f9b34fb (read)",
            describe_characteristics(&services[0])
        );
    }

    #[test]
    fn advertisement_normalises_address() {
        let advertisement = Advertisement::new("aa:bb:cc:dd:ee:ff", None);
        assert_eq!("AA:BB:CC:DD:EE:FF", advertisement.address());
    }
}
