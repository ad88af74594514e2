//! Port descriptors as reported by the companion process.
//!
//! Descriptors are constructed fresh on every enumeration call and never
//! persisted; only the authorization relationship (see [`crate::auth`])
//! survives across sessions.

use serde::{Deserialize, Serialize};

/// How the physical port is attached on the companion side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Native,
    Usb,
    Bluetooth,
}

/// Opaque identifying fields of a USB-attached port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

/// Opaque identifying fields of a Bluetooth-attached port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BluetoothInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// One enumerated serial port.
///
/// `id` is stable across sessions; `auth_key` is only populated once the
/// origin holds a grant, and `is_paired` is derived per enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb: Option<UsbInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bluetooth: Option<BluetoothInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub is_paired: bool,
}

/// Identifying info exposed to callers of an opened port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub usb_vendor_id: Option<u16>,
    pub usb_product_id: Option<u16>,
}

impl PortDescriptor {
    /// Create a minimal descriptor (mostly useful in tests).
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            transport,
            usb: None,
            bluetooth: None,
            auth_key: None,
            is_paired: false,
        }
    }

    /// USB vendor/product ids, populated only for USB transports.
    pub fn info(&self) -> PortInfo {
        if self.transport != TransportKind::Usb {
            return PortInfo::default();
        }
        PortInfo {
            usb_vendor_id: self.usb.as_ref().and_then(|u| u.vid),
            usb_product_id: self.usb.as_ref().and_then(|u| u.pid),
        }
    }
}
