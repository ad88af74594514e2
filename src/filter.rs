//! Port filters for the request-port flow.
//!
//! Standard predicates (USB vendor/product id, Bluetooth service class id)
//! plus extended predicates on id, name, and transport kind. A port matches
//! a filter when every present predicate matches; a port matches a filter
//! set when any one filter matches.

use serde::{Deserialize, Serialize};

use crate::descriptor::{PortDescriptor, TransportKind};
use crate::error::{BridgeError, Result};

/// One match predicate set. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_vendor_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_product_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bluetooth_service_class_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
}

impl PortFilter {
    /// Enforce the standard filter-validity rules.
    pub fn validate(&self) -> Result<()> {
        let empty = self.usb_vendor_id.is_none()
            && self.usb_product_id.is_none()
            && self.bluetooth_service_class_id.is_none()
            && self.id.is_none()
            && self.name.is_none()
            && self.transport.is_none();
        if empty {
            return Err(BridgeError::Validation(
                "empty filter matches nothing and is rejected".to_string(),
            ));
        }
        if self.usb_product_id.is_some() && self.usb_vendor_id.is_none() {
            return Err(BridgeError::Validation(
                "usbProductId requires usbVendorId".to_string(),
            ));
        }
        if self.bluetooth_service_class_id.is_some()
            && (self.usb_vendor_id.is_some() || self.usb_product_id.is_some())
        {
            return Err(BridgeError::Validation(
                "bluetoothServiceClassId cannot be combined with USB ids".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a port satisfies every present predicate.
    pub fn matches(&self, port: &PortDescriptor) -> bool {
        if let Some(vid) = self.usb_vendor_id {
            if port.usb.as_ref().and_then(|u| u.vid) != Some(vid) {
                return false;
            }
        }
        if let Some(pid) = self.usb_product_id {
            if port.usb.as_ref().and_then(|u| u.pid) != Some(pid) {
                return false;
            }
        }
        if let Some(class_id) = &self.bluetooth_service_class_id {
            // No service discovery available; the address stands in for
            // the service class id.
            let address = port.bluetooth.as_ref().and_then(|b| b.address.as_deref());
            if address != Some(class_id.as_str()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if &port.id != id {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &port.name != name {
                return false;
            }
        }
        if let Some(transport) = self.transport {
            if port.transport != transport {
                return false;
            }
        }
        true
    }
}

/// Options accompanying a request-port call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default)]
    pub filters: Vec<PortFilter>,
}

/// Validate every filter in the set before any I/O.
pub fn validate_filters(filters: &[PortFilter]) -> Result<()> {
    for filter in filters {
        filter.validate()?;
    }
    Ok(())
}

/// An empty filter set matches every port.
pub fn matches_any(filters: &[PortFilter], port: &PortDescriptor) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BluetoothInfo, UsbInfo};

    fn usb_port(vid: u16, pid: u16) -> PortDescriptor {
        let mut port = PortDescriptor::new("ttyUSB0", "ttyUSB0", TransportKind::Usb);
        port.usb = Some(UsbInfo {
            vid: Some(vid),
            pid: Some(pid),
            ..Default::default()
        });
        port
    }

    #[test]
    fn test_empty_filter_rejected() {
        assert!(PortFilter::default().validate().is_err());
    }

    #[test]
    fn test_product_id_requires_vendor_id() {
        let filter = PortFilter {
            usb_product_id: Some(0x5740),
            ..Default::default()
        };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_bluetooth_cannot_combine_with_usb() {
        let filter = PortFilter {
            bluetooth_service_class_id: Some("00:11:22:33:44:55".to_string()),
            usb_vendor_id: Some(0x0483),
            ..Default::default()
        };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_vendor_and_product_match() {
        let filter = PortFilter {
            usb_vendor_id: Some(0x0483),
            usb_product_id: Some(0x5740),
            ..Default::default()
        };
        filter.validate().unwrap();
        assert!(filter.matches(&usb_port(0x0483, 0x5740)));
        assert!(!filter.matches(&usb_port(0x0483, 0x5741)));
        assert!(!filter.matches(&PortDescriptor::new(
            "ttyS0",
            "ttyS0",
            TransportKind::Native
        )));
    }

    #[test]
    fn test_bluetooth_matches_address() {
        let mut port = PortDescriptor::new("rfcomm0", "rfcomm0", TransportKind::Bluetooth);
        port.bluetooth = Some(BluetoothInfo {
            address: Some("00:11:22:33:44:55".to_string()),
        });
        let filter = PortFilter {
            bluetooth_service_class_id: Some("00:11:22:33:44:55".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&port));
    }

    #[test]
    fn test_extended_predicates() {
        let port = PortDescriptor::new("ttyS0", "Console", TransportKind::Native);
        let by_name = PortFilter {
            name: Some("Console".to_string()),
            ..Default::default()
        };
        assert!(by_name.matches(&port));

        let by_transport = PortFilter {
            transport: Some(TransportKind::Usb),
            ..Default::default()
        };
        assert!(!by_transport.matches(&port));
    }

    #[test]
    fn test_empty_set_matches_all() {
        assert!(matches_any(&[], &usb_port(1, 2)));
    }

    #[test]
    fn test_any_filter_in_set_suffices() {
        let filters = vec![
            PortFilter {
                usb_vendor_id: Some(0xffff),
                ..Default::default()
            },
            PortFilter {
                id: Some("ttyUSB0".to_string()),
                ..Default::default()
            },
        ];
        assert!(matches_any(&filters, &usb_port(1, 2)));
    }

    #[test]
    fn test_filter_deserializes_camel_case() {
        let filter: PortFilter =
            serde_json::from_str(r#"{"usbVendorId":1155,"usbProductId":22336}"#).unwrap();
        assert_eq!(filter.usb_vendor_id, Some(1155));
        assert_eq!(filter.usb_product_id, Some(22336));
        filter.validate().unwrap();
    }
}
