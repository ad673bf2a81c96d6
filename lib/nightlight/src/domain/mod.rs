// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed hypervisor domain definitions.
//!
//! A [`Domain`] is assembled by the [`builder`] from an instance record and
//! rendered to the hypervisor's XML format only at the edge, when it is
//! handed to [`crate::hypervisor::Hypervisor::define`].

use camino::Utf8PathBuf;
use nightlight_types::MacAddr;
use uuid::Uuid;

pub mod builder;
mod xml;

pub use builder::{build_domain, BuildError, BuildReport, DomainBuilder};

use xml::XmlWriter;

pub const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Firmware {
    Bios,
    Uefi { loader: Utf8PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Os {
    pub arch: String,
    pub machine: String,
    pub firmware: Firmware,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    pub sockets: u32,
    pub cores: u32,
}

impl Topology {
    pub fn vcpus(&self) -> u32 {
        self.sockets.saturating_mul(self.cores)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
    Floppy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disk {
    pub device: DiskDevice,
    /// Absent for an empty removable drive.
    pub source: Option<Utf8PathBuf>,
    pub target: String,
    pub bus: String,
    pub boot_order: u32,
}

impl Disk {
    pub fn readonly(&self) -> bool {
        self.device == DiskDevice::Cdrom
    }

    fn write(&self, w: &mut XmlWriter) {
        let device = self.device.to_string();
        w.open("disk", &[("type", "file"), ("device", device.as_str())]);
        match self.device {
            DiskDevice::Disk => w.empty(
                "driver",
                &[("name", "qemu"), ("type", "qcow2"), ("discard", "unmap")],
            ),
            DiskDevice::Cdrom | DiskDevice::Floppy => {
                w.empty("driver", &[("name", "qemu"), ("type", "raw")])
            }
        }
        if let Some(source) = &self.source {
            w.empty("source", &[("file", source.as_str())]);
        }
        w.empty(
            "target",
            &[("dev", self.target.as_str()), ("bus", self.bus.as_str())],
        );
        if self.boot_order > 0 {
            let order = self.boot_order.to_string();
            w.empty("boot", &[("order", order.as_str())]);
        }
        if self.readonly() {
            w.empty("readonly", &[]);
        }
        w.close();
    }

    /// The device definition on its own, as used for hot-attach.
    pub fn to_xml(&self) -> String {
        let mut w = XmlWriter::new();
        self.write(&mut w);
        w.finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub mac: MacAddr,
    pub bridge: String,
    pub model: String,
    pub boot_order: u32,
    pub link_up: bool,
}

impl Interface {
    fn write(&self, w: &mut XmlWriter) {
        w.open("interface", &[("type", "bridge")]);
        w.empty("mac", &[("address", self.mac.to_string().as_str())]);
        w.empty("source", &[("bridge", self.bridge.as_str())]);
        w.empty("virtualport", &[("type", "openvswitch")]);
        w.empty("model", &[("type", self.model.as_str())]);
        if self.boot_order > 0 {
            let order = self.boot_order.to_string();
            w.empty("boot", &[("order", order.as_str())]);
        }
        if !self.link_up {
            w.empty("link", &[("state", "down")]);
        }
        w.close();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Controller {
    pub kind: String,
    pub index: u32,
}

/// VNC console. Without a fixed port the hypervisor picks one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Graphics {
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub uuid: Uuid,
    pub title: String,
    pub description: String,
    pub memory_mib: u64,
    pub topology: Topology,
    pub os: Os,
    pub disks: Vec<Disk>,
    pub controllers: Vec<Controller>,
    pub interfaces: Vec<Interface>,
    pub graphics: Graphics,
}

impl Domain {
    pub fn to_xml(&self) -> String {
        let mut w = XmlWriter::new();
        let uuid = self.uuid.to_string();

        w.open("domain", &[("type", "kvm")]);
        w.text("name", &[], &self.name);
        w.text("uuid", &[], &uuid);
        if !self.title.is_empty() {
            w.text("title", &[], &self.title);
        }
        if !self.description.is_empty() {
            w.text("description", &[], &self.description);
        }
        w.text("memory", &[("unit", "MiB")], &self.memory_mib.to_string());
        w.text(
            "vcpu",
            &[("placement", "static")],
            &self.topology.vcpus().to_string(),
        );

        w.open("sysinfo", &[("type", "smbios")]);
        w.open("system", &[]);
        w.text("entry", &[("name", "uuid")], &uuid);
        w.text("entry", &[("name", "serial")], &uuid);
        w.close();
        w.close();

        self.write_os(&mut w);

        w.open("features", &[]);
        w.empty("acpi", &[]);
        w.empty("apic", &[]);
        w.empty("pae", &[]);
        w.close();

        w.open("cpu", &[]);
        w.empty(
            "topology",
            &[
                ("sockets", self.topology.sockets.to_string().as_str()),
                ("dies", "1"),
                ("cores", self.topology.cores.to_string().as_str()),
                ("threads", "1"),
            ],
        );
        w.close();

        w.open("devices", &[]);
        for disk in &self.disks {
            disk.write(&mut w);
        }
        for ctl in &self.controllers {
            let index = ctl.index.to_string();
            w.empty(
                "controller",
                &[("type", ctl.kind.as_str()), ("index", index.as_str())],
            );
        }
        for iface in &self.interfaces {
            iface.write(&mut w);
        }
        self.write_console(&mut w);
        w.close();

        w.finish()
    }

    fn write_os(&self, w: &mut XmlWriter) {
        match &self.os.firmware {
            Firmware::Bios => w.open("os", &[]),
            Firmware::Uefi { .. } => w.open("os", &[("firmware", "efi")]),
        }
        w.text(
            "type",
            &[
                ("arch", self.os.arch.as_str()),
                ("machine", self.os.machine.as_str()),
            ],
            "hvm",
        );
        if let Firmware::Uefi { loader } = &self.os.firmware {
            w.text(
                "loader",
                &[("readonly", "yes"), ("secure", "no"), ("type", "pflash")],
                loader.as_str(),
            );
        }
        w.empty("smbios", &[("mode", "sysinfo")]);
        w.close();
    }

    fn write_console(&self, w: &mut XmlWriter) {
        w.open("serial", &[("type", "pty")]);
        w.open("target", &[("type", "isa-serial"), ("port", "0")]);
        w.empty("model", &[("name", "isa-serial")]);
        w.close();
        w.close();

        w.open("console", &[("type", "pty")]);
        w.empty("target", &[("type", "serial"), ("port", "0")]);
        w.close();

        w.open("channel", &[("type", "unix")]);
        w.empty("target", &[("type", "virtio"), ("name", GUEST_AGENT_CHANNEL)]);
        w.close();

        let port = self.graphics.port.map(|p| p.to_string());
        match &port {
            Some(port) => w.open(
                "graphics",
                &[("type", "vnc"), ("port", port.as_str()), ("autoport", "no")],
            ),
            None => w.open(
                "graphics",
                &[("type", "vnc"), ("port", "-1"), ("autoport", "yes")],
            ),
        }
        w.empty("listen", &[("type", "address"), ("address", "0.0.0.0")]);
        w.close();
    }
}
