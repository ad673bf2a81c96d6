// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A builder for domain definitions.

use std::collections::BTreeMap;

use camino::Utf8Path;
use nightlight_config::{CdromBus, MacPolicy};
use nightlight_types::{
    BootOrderError, BootType, BusType, Cdrom, DeviceRef, FloppyDisk, Instance,
    MacAddr, NetworkInterface, StorageDisk,
};
use slog::{info, warn, Logger};
use thiserror::Error;
use uuid::Uuid;

use crate::alloc::{self, AllocError, DiskTargetAllocator};
use crate::outcome::DeviceOutcome;

use super::{
    Controller, Disk, DiskDevice, Domain, Firmware, Graphics, Interface, Os,
    Topology,
};

/// Errors that stop a domain definition from being built at all. Problems
/// with individual devices are reported as [`DeviceOutcome`]s instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    BootOrder(#[from] BootOrderError),

    #[error("failed to allocate MAC address")]
    Mac(#[source] AllocError),
}

/// The result of [`build_domain`].
#[derive(Debug)]
pub struct BuildReport {
    pub domain: Domain,
    /// MAC of the first network interface, if the guest has one.
    pub primary_mac: Option<MacAddr>,
    /// The input instance with allocated MACs and identity filled in.
    pub instance: Instance,
    pub outcomes: Vec<DeviceOutcome>,
}

pub struct DomainBuilder<'a> {
    cfg: &'a nightlight_config::Domain,
    domain: Domain,
    targets: DiskTargetAllocator,
    /// Preset disk targets that could not be claimed, by disk index.
    rejected: BTreeMap<usize, AllocError>,
    shared_mac: Option<MacAddr>,
    outcomes: Vec<DeviceOutcome>,
}

impl<'a> DomainBuilder<'a> {
    pub fn new(
        cfg: &'a nightlight_config::Domain,
        instance: &Instance,
        uuid: Uuid,
    ) -> Self {
        let firmware = match instance.boot_type {
            BootType::Bios => Firmware::Bios,
            BootType::Uefi => {
                Firmware::Uefi { loader: cfg.uefi_loader.clone() }
            }
        };

        let domain = Domain {
            name: instance.id.clone(),
            uuid,
            title: instance.name.clone(),
            description: instance.description.clone(),
            memory_mib: instance.memory_mb,
            topology: Topology {
                sockets: instance.cpu_sockets.max(1),
                cores: instance.cpu_cores.max(1),
            },
            os: Os {
                arch: cfg.arch.clone(),
                machine: cfg.machine.clone(),
                firmware,
            },
            disks: Vec::new(),
            controllers: Vec::new(),
            interfaces: Vec::new(),
            graphics: Graphics { port: instance.vnc_port },
        };

        Self {
            cfg,
            domain,
            targets: DiskTargetAllocator::new(),
            rejected: BTreeMap::new(),
            shared_mac: None,
            outcomes: Vec::new(),
        }
    }

    /// Claims disk targets that were fixed before the build so they are not
    /// handed out again. A disk whose target is taken or not a name on its
    /// bus is skipped when it is added.
    pub fn reserve_targets(&mut self, disks: &[StorageDisk]) {
        for (i, disk) in disks.iter().enumerate() {
            let (Some(target), Ok(bus)) =
                (disk.target.as_deref(), disk.bus_type())
            else {
                continue;
            };
            if let Err(e) = self.targets.claim(bus, target) {
                self.rejected.insert(i, e);
            }
        }
    }

    fn mac_for(
        &mut self,
        nic: &NetworkInterface,
    ) -> Result<MacAddr, AllocError> {
        if let Some(mac) = nic.mac_address {
            return Ok(mac);
        }
        match self.cfg.mac_policy {
            MacPolicy::PerInterface => alloc::generate_mac_address(),
            MacPolicy::SharedPerVm => match self.shared_mac {
                Some(mac) => Ok(mac),
                None => {
                    let mac = alloc::generate_mac_address()?;
                    self.shared_mac = Some(mac);
                    Ok(mac)
                }
            },
        }
    }

    /// Adds a NIC, returning the MAC address it was given.
    pub fn add_nic(
        &mut self,
        index: usize,
        nic: &NetworkInterface,
    ) -> Result<MacAddr, AllocError> {
        let mac = self.mac_for(nic)?;
        self.domain.interfaces.push(Interface {
            mac,
            bridge: nic.bridge.clone(),
            model: nic.model.clone(),
            boot_order: nic.boot_order,
            link_up: nic.connected,
        });
        self.outcomes.push(DeviceOutcome::attached(DeviceRef::Nic(index)));
        Ok(mac)
    }

    fn ensure_sata_controller(&mut self) {
        if !self.domain.controllers.iter().any(|c| c.kind == "sata") {
            self.domain
                .controllers
                .push(Controller { kind: "sata".to_owned(), index: 0 });
        }
    }

    /// Adds a storage disk. Disks without a backing path or on an
    /// unsupported bus are skipped and reported.
    pub fn add_disk(&mut self, index: usize, disk: &StorageDisk) {
        let dev = DeviceRef::Disk(index);
        let Some(path) = &disk.path else {
            self.outcomes.push(DeviceOutcome::skipped(dev, "no backing path"));
            return;
        };
        let bus = match disk.bus_type() {
            Ok(bus) => bus,
            Err(_) => {
                self.outcomes.push(DeviceOutcome::skipped(
                    dev,
                    format!("unsupported bus type {:?}", disk.bus),
                ));
                return;
            }
        };
        if let Some(e) = self.rejected.remove(&index) {
            self.outcomes.push(DeviceOutcome::skipped(dev, e.to_string()));
            return;
        }
        let target = match &disk.target {
            Some(target) => target.clone(),
            None => match self.targets.next_disk(bus) {
                Ok(target) => target.to_owned(),
                Err(e) => {
                    self.outcomes
                        .push(DeviceOutcome::skipped(dev, e.to_string()));
                    return;
                }
            },
        };
        if bus == BusType::Sata {
            self.ensure_sata_controller();
        }

        self.domain.disks.push(Disk {
            device: DiskDevice::Disk,
            source: Some(path.clone()),
            target,
            bus: bus.to_string(),
            boot_order: disk.boot_order,
        });
        self.outcomes.push(DeviceOutcome::attached(dev));
    }

    /// Allocates the target for a CD-ROM drive on the configured bus.
    pub fn cdrom_target(
        &mut self,
    ) -> Result<(&'static str, &'static str), AllocError> {
        cdrom_target(&mut self.targets, self.cfg.cdrom_bus)
    }

    pub fn add_cdrom(&mut self, index: usize, cd: &Cdrom) {
        let dev = DeviceRef::Cdrom(index);
        let (target, bus) = match self.cdrom_target() {
            Ok(t) => t,
            Err(e) => {
                self.outcomes.push(DeviceOutcome::skipped(dev, e.to_string()));
                return;
            }
        };
        if bus == "sata" {
            self.ensure_sata_controller();
        }
        self.domain.disks.push(Disk {
            device: DiskDevice::Cdrom,
            source: cd.connected.then(|| cd.path.clone()),
            target: target.to_owned(),
            bus: bus.to_owned(),
            boot_order: cd.boot_order,
        });
        self.outcomes.push(DeviceOutcome::attached(dev));
    }

    pub fn add_floppy(&mut self, index: usize, fd: &FloppyDisk) {
        let dev = DeviceRef::Floppy(index);
        let target = match self.targets.next_floppy() {
            Ok(t) => t,
            Err(e) => {
                self.outcomes.push(DeviceOutcome::skipped(dev, e.to_string()));
                return;
            }
        };
        self.domain.disks.push(Disk {
            device: DiskDevice::Floppy,
            source: fd.connected.then(|| fd.path.clone()),
            target: target.to_owned(),
            bus: "fdc".to_owned(),
            boot_order: fd.boot_order,
        });
        self.outcomes.push(DeviceOutcome::attached(dev));
    }

    pub fn finish(self) -> (Domain, Vec<DeviceOutcome>) {
        (self.domain, self.outcomes)
    }
}

/// The (target, bus) for the next CD-ROM drive on `bus`.
pub fn cdrom_target(
    targets: &mut DiskTargetAllocator,
    bus: CdromBus,
) -> Result<(&'static str, &'static str), AllocError> {
    match bus {
        CdromBus::Ide => Ok((targets.next_ide()?, "ide")),
        CdromBus::Sata => Ok((targets.next_disk(BusType::Sata)?, "sata")),
    }
}

/// Writes `<dir>/<id>.xml`. Failure is logged and otherwise ignored.
pub fn write_debug_xml(log: &Logger, dir: &Utf8Path, id: &str, xml: &str) {
    let path = dir.join(format!("{id}.xml"));
    match std::fs::write(&path, xml) {
        Ok(()) => info!(log, "wrote domain definition"; "path" => %path),
        Err(e) => warn!(log, "failed to write domain definition";
            "path" => %path,
            "error" => %e),
    }
}

/// Builds the domain definition for `instance`.
///
/// Storage disks are expected to already carry their backing path (and
/// usually their target). When `debug_dir` is given and enabled in the
/// configuration, the rendered definition is also written there.
pub fn build_domain(
    cfg: &nightlight_config::Domain,
    instance: &Instance,
    debug_dir: Option<&Utf8Path>,
    log: &Logger,
) -> Result<BuildReport, BuildError> {
    instance.devices.validate_boot_order()?;

    let uuid = alloc::generate_instance_uuid();
    let mut builder = DomainBuilder::new(cfg, instance, uuid);
    let mut filled = instance.clone();

    builder.reserve_targets(&instance.devices.storage_disks);
    for (i, nic) in instance.devices.network_interfaces.iter().enumerate() {
        let mac = builder.add_nic(i, nic).map_err(BuildError::Mac)?;
        filled.devices.network_interfaces[i].mac_address = Some(mac);
    }
    for (i, disk) in instance.devices.storage_disks.iter().enumerate() {
        builder.add_disk(i, disk);
    }
    for (i, cd) in instance.devices.cdroms.iter().enumerate() {
        builder.add_cdrom(i, cd);
    }
    for (i, fd) in instance.devices.floppy_disks.iter().enumerate() {
        builder.add_floppy(i, fd);
    }

    let (domain, outcomes) = builder.finish();
    let primary_mac = domain.interfaces.first().map(|i| i.mac);
    filled.primary_mac_address = primary_mac;

    if let (Some(dir), true) = (debug_dir, cfg.write_debug_xml) {
        write_debug_xml(log, dir, &instance.id, &domain.to_xml());
    }

    info!(log, "built domain definition";
        "instance" => &instance.id,
        "uuid" => %uuid,
        "disks" => domain.disks.len(),
        "interfaces" => domain.interfaces.len());

    Ok(BuildReport { domain, primary_mac, instance: filled, outcomes })
}
