// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host configuration for the Nightlight control plane.
//!
//! Every section and key has a default, so an empty file (or no file at all)
//! yields a configuration suitable for a stock libvirt + Open vSwitch host.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use camino::Utf8PathBuf;
use nightlight_types::{Datastore, DatastoreKind, MacAddr};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub hypervisor: Hypervisor,
    pub domain: Domain,
    pub storage: Storage,
    pub metadata: Metadata,
    pub switch: Switch,
}

/// How the management daemon is reached and how long lifecycle waits last.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Hypervisor {
    pub socket_path: Utf8PathBuf,
    pub uri: String,
    pub connect_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Hypervisor {
    /// `uri` with the daemon socket made explicit, unless the URI already
    /// names one.
    pub fn connect_uri(&self) -> String {
        if self.uri.contains("socket=") {
            return self.uri.clone();
        }
        let sep = if self.uri.contains('?') { '&' } else { '?' };
        format!("{}{sep}socket={}", self.uri, self.socket_path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for Hypervisor {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/libvirt/libvirt-sock".into(),
            uri: "qemu:///system".to_owned(),
            connect_timeout_secs: 10,
            shutdown_timeout_secs: 120,
        }
    }
}

/// How MAC addresses are handed out to a guest's interfaces.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MacPolicy {
    #[default]
    PerInterface,
    /// One address allocated per guest and shared by all of its interfaces.
    SharedPerVm,
}

/// Bus that CD-ROM drives are attached through.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CdromBus {
    #[default]
    Ide,
    /// Required for machine types without an IDE controller, such as q35.
    Sata,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Domain {
    pub uefi_loader: Utf8PathBuf,
    pub machine: String,
    pub arch: String,
    pub mac_policy: MacPolicy,
    pub cdrom_bus: CdromBus,
    /// Write each rendered definition next to the instance's disks.
    pub write_debug_xml: bool,
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            uefi_loader: "/usr/share/qemu/edk2-x86_64-code.fd".into(),
            machine: "pc-q35-6.2".to_owned(),
            arch: "x86_64".to_owned(),
            mac_policy: MacPolicy::default(),
            cdrom_bus: CdromBus::default(),
            write_debug_xml: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Storage {
    pub qemu_img: Utf8PathBuf,
    /// Directory under which each datastore is mounted or created.
    pub volumes_root: Utf8PathBuf,
}

impl Storage {
    /// The host-local datastore `id`, rooted at `<volumes_root>/<id>`.
    pub fn local_datastore(&self, id: &str) -> Datastore {
        Datastore {
            id: id.to_owned(),
            name: id.to_owned(),
            kind: DatastoreKind::Local,
            path: None,
            local_path: self.volumes_root.join(id),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            qemu_img: "qemu-img".into(),
            volumes_root: "/opt/nightlight/volumes".into(),
        }
    }
}

/// The metadata responder's network identity.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Metadata {
    pub bridge: String,
    /// Name shared by the switch port, the link and the namespace.
    pub port: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            bridge: "nightlight".to_owned(),
            port: "mddefaultvpc".to_owned(),
            mac: MacAddr::new([0x32, 0x6b, 0xce, 0x89, 0x41, 0x42]),
            ip: Ipv4Addr::new(169, 254, 169, 254),
            prefix_len: 24,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Switch {
    pub ovs_vsctl: Utf8PathBuf,
    pub ovs_ofctl: Utf8PathBuf,
    /// Table that NAT'd metadata requests continue in after conntrack.
    pub ct_table: u8,
}

impl Default for Switch {
    fn default() -> Self {
        Self {
            ovs_vsctl: "ovs-vsctl".into(),
            ovs_ofctl: "ovs-ofctl".into(),
            ct_table: 1,
        }
    }
}

/// Errors which may be returned when parsing the host configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
