//! GATT attribute model: services, characteristics, descriptors and the
//! per-peripheral attribute cache

use std::fmt;

use bitflags::bitflags;
use uuid::Uuid;

use crate::types::{CharacteristicId, DescriptorId};
use crate::uuids;

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

bitflags! {
    /// Characteristic property bits as advertised by the peripheral
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u16 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const WRITE = 1 << 3;
        const NOTIFY = 1 << 4;
        const INDICATE = 1 << 5;
        const AUTHENTICATED_SIGNED_WRITES = 1 << 6;
        const EXTENDED_PROPERTIES = 1 << 7;
        const NOTIFY_ENCRYPTION_REQUIRED = 1 << 8;
        const INDICATE_ENCRYPTION_REQUIRED = 1 << 9;
    }
}

impl CharacteristicProperties {
    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn can_notify(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CharacteristicProperties, &str); 10] = [
            (CharacteristicProperties::BROADCAST, "Broadcast"),
            (CharacteristicProperties::READ, "Read"),
            (CharacteristicProperties::WRITE_WITHOUT_RESPONSE, "WriteWithoutResponse"),
            (CharacteristicProperties::WRITE, "Write"),
            (CharacteristicProperties::NOTIFY, "Notify"),
            (CharacteristicProperties::INDICATE, "Indicate"),
            (CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES, "AuthenticatedSignedWrites"),
            (CharacteristicProperties::EXTENDED_PROPERTIES, "ExtendedProperties"),
            (CharacteristicProperties::NOTIFY_ENCRYPTION_REQUIRED, "NotifyEncryptionRequired"),
            (CharacteristicProperties::INDICATE_ENCRYPTION_REQUIRED, "IndicateEncryptionRequired"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

// ----------------------------------------------------------------------------
// Attribute Nodes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Service,
    Characteristic,
    Descriptor,
}

/// Common view over every node of the attribute tree
pub trait Attribute {
    fn uuid(&self) -> Uuid;
    fn kind(&self) -> AttributeKind;

    fn value(&self) -> Option<&[u8]> {
        None
    }

    fn common_name(&self) -> Option<&'static str> {
        uuids::common_name(&self.uuid())
    }

    /// Common name when known, short or full UUID otherwise
    fn display_name(&self) -> String {
        match self.common_name() {
            Some(name) => name.to_string(),
            None => uuids::short_string(&self.uuid()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub included_services: Vec<Service>,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            is_primary: true,
            included_services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        Self {
            is_primary: false,
            ..Self::new(uuid)
        }
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn with_included_service(mut self, service: Service) -> Self {
        self.included_services.push(service);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }

    /// Copy of this node without its children
    pub fn shallow(&self) -> Self {
        Self {
            uuid: self.uuid,
            is_primary: self.is_primary,
            included_services: Vec::new(),
            characteristics: Vec::new(),
        }
    }
}

impl Attribute for Service {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> AttributeKind {
        AttributeKind::Service
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Option<Vec<u8>>,
    pub is_notifying: bool,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(service: Uuid, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            service,
            uuid,
            properties,
            value: None,
            is_notifying: false,
            descriptors: Vec::new(),
        }
    }

    pub fn id(&self) -> CharacteristicId {
        CharacteristicId::new(self.service, self.uuid)
    }

    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(Descriptor::new(self.id(), uuid));
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }

    pub fn shallow(&self) -> Self {
        Self {
            descriptors: Vec::new(),
            ..self.clone()
        }
    }
}

impl Attribute for Characteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> AttributeKind {
        AttributeKind::Characteristic
    }

    fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub uuid: Uuid,
    pub value: Option<Vec<u8>>,
}

impl Descriptor {
    pub fn new(characteristic: CharacteristicId, uuid: Uuid) -> Self {
        Self {
            service: characteristic.service,
            characteristic: characteristic.characteristic,
            uuid,
            value: None,
        }
    }

    pub fn id(&self) -> DescriptorId {
        DescriptorId {
            service: self.service,
            characteristic: self.characteristic,
            descriptor: self.uuid,
        }
    }
}

impl Attribute for Descriptor {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> AttributeKind {
        AttributeKind::Descriptor
    }

    fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

// ----------------------------------------------------------------------------
// Attribute Cache
// ----------------------------------------------------------------------------

/// Last known attribute tree of one connected peripheral.
///
/// Each discovery result replaces the matching level wholesale; the whole tree
/// is discarded when the link ends.
#[derive(Debug, Default, Clone)]
pub struct GattTree {
    services: Vec<Service>,
}

impl GattTree {
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }

    pub fn replace_services(&mut self, services: &[Service]) {
        self.services = services.to_vec();
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    pub fn replace_included_services(&mut self, service: &Uuid, included: &[Service]) -> bool {
        match self.service_mut(service) {
            Some(node) => {
                node.included_services = included.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn replace_characteristics(
        &mut self,
        service: &Uuid,
        characteristics: &[Characteristic],
    ) -> bool {
        match self.service_mut(service) {
            Some(node) => {
                node.characteristics = characteristics.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn replace_descriptors(&mut self, id: &CharacteristicId, descriptors: &[Descriptor]) -> bool {
        match self.characteristic_mut(id) {
            Some(node) => {
                node.descriptors = descriptors.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn characteristic(&self, id: &CharacteristicId) -> Option<&Characteristic> {
        self.service(&id.service)?.characteristic(&id.characteristic)
    }

    /// Record a new value and return the updated node, creating a detached
    /// node when the characteristic has not been discovered.
    pub fn update_characteristic_value(&mut self, id: &CharacteristicId, value: Vec<u8>) -> Characteristic {
        match self.characteristic_mut(id) {
            Some(node) => {
                node.value = Some(value);
                node.clone()
            }
            None => Characteristic::new(id.service, id.characteristic, CharacteristicProperties::empty())
                .with_value(value),
        }
    }

    pub fn update_notifying(&mut self, id: &CharacteristicId, notifying: bool) -> Characteristic {
        match self.characteristic_mut(id) {
            Some(node) => {
                node.is_notifying = notifying;
                node.clone()
            }
            None => {
                let mut node = Characteristic::new(id.service, id.characteristic, CharacteristicProperties::empty());
                node.is_notifying = notifying;
                node
            }
        }
    }

    pub fn characteristic_snapshot(&self, id: &CharacteristicId) -> Characteristic {
        self.characteristic(id).cloned().unwrap_or_else(|| {
            Characteristic::new(id.service, id.characteristic, CharacteristicProperties::empty())
        })
    }

    pub fn update_descriptor_value(&mut self, id: &DescriptorId, value: Option<Vec<u8>>) -> Descriptor {
        let existing = self
            .characteristic_mut(&id.characteristic_id())
            .and_then(|c| c.descriptors.iter_mut().find(|d| d.uuid == id.descriptor));

        match existing {
            Some(node) => {
                if value.is_some() {
                    node.value = value;
                }
                node.clone()
            }
            None => Descriptor {
                value,
                ..Descriptor::new(id.characteristic_id(), id.descriptor)
            },
        }
    }

    fn service_mut(&mut self, uuid: &Uuid) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.uuid == *uuid)
    }

    fn characteristic_mut(&mut self, id: &CharacteristicId) -> Option<&mut Characteristic> {
        self.service_mut(&id.service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == id.characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuids::{characteristics, descriptors, services};

    fn battery_tree() -> GattTree {
        let mut tree = GattTree::default();
        tree.replace_services(&[Service::new(services::BATTERY)]);
        tree.replace_characteristics(
            &services::BATTERY,
            &[Characteristic::new(
                services::BATTERY,
                characteristics::BATTERY_LEVEL,
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )],
        );
        tree
    }

    #[test]
    fn test_properties_display() {
        let props = CharacteristicProperties::READ
            | CharacteristicProperties::WRITE
            | CharacteristicProperties::NOTIFY;
        assert_eq!(props.to_string(), "Read, Write, Notify");
        assert!(props.can_notify());
        assert_eq!(CharacteristicProperties::empty().to_string(), "");
    }

    #[test]
    fn test_value_update_is_recorded() {
        let mut tree = battery_tree();
        let id = CharacteristicId::new(services::BATTERY, characteristics::BATTERY_LEVEL);

        let updated = tree.update_characteristic_value(&id, vec![87]);
        assert_eq!(updated.value, Some(vec![87]));
        assert_eq!(tree.characteristic(&id).and_then(|c| c.value.clone()), Some(vec![87]));
    }

    #[test]
    fn test_rediscovery_replaces_level() {
        let mut tree = battery_tree();
        let id = CharacteristicId::new(services::BATTERY, characteristics::BATTERY_LEVEL);
        tree.replace_descriptors(
            &id,
            &[Descriptor::new(id, descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)],
        );
        assert_eq!(tree.characteristic(&id).map(|c| c.descriptors.len()), Some(1));

        tree.replace_services(&[Service::new(services::BATTERY)]);
        assert!(tree.characteristic(&id).is_none());
        assert_eq!(tree.services().len(), 1);
    }

    #[test]
    fn test_unknown_characteristic_yields_detached_node() {
        let mut tree = GattTree::default();
        let id = CharacteristicId::new(services::HEART_RATE, characteristics::HEART_RATE_MEASUREMENT);

        let node = tree.update_characteristic_value(&id, vec![0, 72]);
        assert_eq!(node.id(), id);
        assert!(tree.is_empty());
        assert_eq!(node.display_name(), "Heart Rate Measurement");
    }
}
