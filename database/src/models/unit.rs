use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use standctl_core::{Allocatable, UnitKind, UnitStatus};

/// A leasable unit: a device under test or a control pin
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Unit {
    pub id: String,
    #[sqlx(rename = "kind")]
    #[serde(rename = "kind")]
    pub kind_str: String,
    pub unit_type: String,
    pub capacity_group: Option<String>,
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    pub reservation_id: Option<String>,

    // Device bindings
    pub host: Option<String>,
    pub ssh_port: Option<i64>,
    pub serial_port: Option<String>,
    pub image: Option<String>,

    // Pin output number
    pub pin_number: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    /// Get kind as enum
    pub fn kind(&self) -> Option<UnitKind> {
        UnitKind::from_str(&self.kind_str)
    }

    /// Get status as enum
    pub fn status(&self) -> Option<UnitStatus> {
        UnitStatus::from_str(&self.status_str)
    }

    pub fn is_device(&self) -> bool {
        self.kind() == Some(UnitKind::Device)
    }

    pub fn is_leased(&self) -> bool {
        self.status() == Some(UnitStatus::Leased)
    }

    /// SSH port, if the device has a shell binding
    pub fn shell_port(&self) -> Option<u16> {
        self.host.as_ref()?;
        self.ssh_port.and_then(|p| u16::try_from(p).ok()).or(Some(22))
    }
}

impl Allocatable for Unit {
    fn unit_id(&self) -> &str {
        &self.id
    }

    fn unit_type(&self) -> &str {
        &self.unit_type
    }

    fn capacity_group(&self) -> Option<&str> {
        self.capacity_group.as_deref()
    }
}

/// Capacity group with its current usage
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CapacityGroup {
    pub id: String,
    pub capacity: i64,
    /// Registered pins
    pub members: i64,
    /// Pins currently leased
    pub leased: i64,
}

impl CapacityGroup {
    /// Lease slots left
    pub fn headroom(&self) -> u32 {
        u32::try_from((self.capacity - self.leased).max(0)).unwrap_or(0)
    }
}

/// Filter for unit listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnitFilter {
    pub kind: Option<UnitKind>,
    pub unit_type: Option<String>,
    pub status: Option<UnitStatus>,
    pub group: Option<String>,
}

impl UnitFilter {
    pub fn matches(&self, unit: &Unit) -> bool {
        self.kind.map_or(true, |k| unit.kind() == Some(k))
            && self.unit_type.as_ref().map_or(true, |t| &unit.unit_type == t)
            && self.status.map_or(true, |s| unit.status() == Some(s))
            && self
                .group
                .as_ref()
                .map_or(true, |g| unit.capacity_group.as_ref() == Some(g))
    }
}

/// Capacity group declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: String,
    pub capacity: u32,
}

/// Device declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub unit_type: String,
    pub host: Option<String>,
    pub ssh_port: Option<u16>,
    pub serial_port: Option<String>,
    /// Image kind installed on the device (`dev`, `release`)
    pub image: Option<String>,
}

/// Control pin declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSpec {
    pub id: String,
    /// Pin role, e.g. `power` or `boot`
    pub unit_type: String,
    pub group: String,
    pub number: Option<u32>,
}

/// Unit to register
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSpec {
    Device(DeviceSpec),
    Pin(PinSpec),
}

/// Stand inventory as declared in configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub groups: Vec<GroupSpec>,
    pub devices: Vec<DeviceSpec>,
    pub pins: Vec<PinSpec>,
}

impl Inventory {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.devices.is_empty() && self.pins.is_empty()
    }
}
