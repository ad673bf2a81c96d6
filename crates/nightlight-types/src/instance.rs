// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Instance record and the device aggregate it owns.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BusType, MacAddr};

/// Firmware a guest boots with.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BootType {
    #[default]
    Bios,
    Uefi,
}

/// Power state of a domain as last observed from the hypervisor.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Paused,
    Crashed,
    #[default]
    Unknown,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InitializationStatus {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Failed,
}

fn default_nic_model() -> String {
    "virtio".to_owned()
}

fn default_connected() -> bool {
    true
}

/// A guest network interface. `mac_address` stays empty until the builder
/// allocates one.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default = "default_nic_model")]
    pub model: String,
    #[serde(default)]
    pub boot_order: u32,
    #[serde(default = "default_connected")]
    pub connected: bool,
    #[serde(rename = "bridgeName")]
    pub bridge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<MacAddr>,
}

/// A guest disk backed by a qcow2 image in the instance directory.
///
/// `target` and `path` are filled by the provisioner; a caller may pre-set
/// `target` to pin a device name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageDisk {
    #[serde(rename = "busType")]
    pub bus: String,
    #[serde(rename = "sizeGB")]
    pub size_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_id: Option<String>,
    /// An image to copy byte-for-byte instead of creating an empty one.
    /// The copy is made whether or not `clone` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub existing_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub clone: bool,
    #[serde(default)]
    pub boot_order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub path: Option<Utf8PathBuf>,
}

impl StorageDisk {
    /// Parses the free-form bus name into a supported [`BusType`].
    pub fn bus_type(&self) -> Result<BusType, strum::ParseError> {
        self.bus.parse()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cdrom {
    #[schemars(with = "String")]
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub boot_order: u32,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FloppyDisk {
    #[schemars(with = "String")]
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub boot_order: u32,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

/// Identifies one device within a [`Devices`] aggregate by kind and index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceRef {
    Nic(usize),
    Disk(usize),
    Cdrom(usize),
    Floppy(usize),
}

impl std::fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRef::Nic(i) => write!(f, "nic[{i}]"),
            DeviceRef::Disk(i) => write!(f, "disk[{i}]"),
            DeviceRef::Cdrom(i) => write!(f, "cdrom[{i}]"),
            DeviceRef::Floppy(i) => write!(f, "floppy[{i}]"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BootOrderError {
    #[error("boot order {order} claimed by both {first} and {second}")]
    Duplicate { order: u32, first: DeviceRef, second: DeviceRef },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub storage_disks: Vec<StorageDisk>,
    #[serde(default)]
    pub cdroms: Vec<Cdrom>,
    #[serde(default)]
    pub floppy_disks: Vec<FloppyDisk>,
}

impl Devices {
    /// Yields every device with a non-zero boot order.
    pub fn boot_devices(&self) -> impl Iterator<Item = (u32, DeviceRef)> + '_ {
        let nics = self
            .network_interfaces
            .iter()
            .enumerate()
            .map(|(i, n)| (n.boot_order, DeviceRef::Nic(i)));
        let disks = self
            .storage_disks
            .iter()
            .enumerate()
            .map(|(i, d)| (d.boot_order, DeviceRef::Disk(i)));
        let cdroms = self
            .cdroms
            .iter()
            .enumerate()
            .map(|(i, c)| (c.boot_order, DeviceRef::Cdrom(i)));
        let floppies = self
            .floppy_disks
            .iter()
            .enumerate()
            .map(|(i, f)| (f.boot_order, DeviceRef::Floppy(i)));

        nics.chain(disks)
            .chain(cdroms)
            .chain(floppies)
            .filter(|(order, _)| *order != 0)
    }

    /// Checks that no two devices, of any kind, claim the same non-zero boot
    /// order.
    pub fn validate_boot_order(&self) -> Result<(), BootOrderError> {
        let mut seen: BTreeMap<u32, DeviceRef> = BTreeMap::new();
        for (order, dev) in self.boot_devices() {
            if let Some(first) = seen.insert(order, dev) {
                return Err(BootOrderError::Duplicate {
                    order,
                    first,
                    second: dev,
                });
            }
        }
        Ok(())
    }

    /// The device with the lowest non-zero boot order, if any device is
    /// bootable at all.
    pub fn primary_boot_device(&self) -> Option<DeviceRef> {
        self.boot_devices().min_by_key(|(order, _)| *order).map(|(_, d)| d)
    }
}

/// A virtual machine as stored by the record store and returned to the API
/// layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub boot_type: BootType,
    pub cpu_cores: u32,
    pub cpu_sockets: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    #[serde(default)]
    pub devices: Devices,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub initialization_status: InitializationStatus,
    pub datastore_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_mac_address: Option<MacAddr>,
    #[serde(
        default,
        rename = "primaryIPAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_ip_address: Option<Ipv4Addr>,
    #[serde(
        default,
        rename = "metadataIPAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata_ip_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kickstart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// Total virtual CPUs presented to the guest.
    pub fn vcpus(&self) -> u32 {
        self.cpu_sockets.max(1).saturating_mul(self.cpu_cores.max(1))
    }
}
