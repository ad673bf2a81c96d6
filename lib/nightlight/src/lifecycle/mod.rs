// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The instance manager: the entry point the API layer calls to provision,
//! control, and tear down guests.
//!
//! Every instance the manager has seen is represented by an entity holding a
//! request gate. Operations on one instance take that entity's lock for
//! their whole duration, so two requests against the same instance never
//! interleave, while requests against different instances proceed
//! independently. Before a request is admitted the gate is brought up to
//! date with the power state the hypervisor reports, which lets a manager
//! pick up instances it did not create itself.
//!
//! Destroyed instances keep their entity as a tombstone so that late
//! requests are denied rather than reaching the hypervisor. Only the most
//! recent tombstones are kept.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use camino::{Utf8Path, Utf8PathBuf};
use nightlight_types::{
    Datastore, DeviceRef, InitializationStatus, Instance, MacAddr, PowerState,
};
use ovs::{Attachment, SwitchControl};
use slog::{debug, error, info, o, warn, Logger};

use crate::alloc::DiskTargetAllocator;
use crate::disk::{self, ImageTool};
use crate::domain::{self, builder::cdrom_target, Disk, DiskDevice};
use crate::hypervisor::{
    destroy_gracefully, Hypervisor, HypervisorError, ShutdownWait,
};
use crate::outcome::{merge_outcomes, ProvisionReport};
use crate::{keys, network, Error};

mod gate;

pub use gate::{
    InstanceStateChange, LifecycleRequest, RequestDeniedReason,
    RequestDisposition, RequestGate,
};

/// Tombstones kept before the oldest is forgotten.
const MAX_TOMBSTONES: usize = 1024;

struct InstanceEntity {
    gate: RequestGate,

    /// Switch ports whose metadata rules were installed at create time.
    vm_ports: Vec<u16>,
}

impl InstanceEntity {
    fn new(log: &Logger) -> Self {
        Self { gate: RequestGate::new(log.clone()), vm_ports: Vec::new() }
    }
}

type EntityRef = Arc<Mutex<InstanceEntity>>;

#[derive(Default)]
struct EntityTable {
    entities: BTreeMap<String, EntityRef>,
    /// Destroyed entities, oldest first.
    tombstones: VecDeque<(String, Weak<Mutex<InstanceEntity>>)>,
}

impl EntityTable {
    /// Removes `id` if its entry is still `entity`.
    fn remove_if_current(&mut self, id: &str, entity: &EntityRef) {
        if self.entities.get(id).is_some_and(|e| Arc::ptr_eq(e, entity)) {
            self.entities.remove(id);
        }
    }

    fn bury(&mut self, id: &str, entity: &EntityRef) {
        self.tombstones.push_back((id.to_owned(), Arc::downgrade(entity)));
        while self.tombstones.len() > MAX_TOMBSTONES {
            let Some((old_id, old)) = self.tombstones.pop_front() else {
                break;
            };
            // A tombstone replaced by a new instance is no longer ours.
            if let Some(old) = old.upgrade() {
                self.remove_if_current(&old_id, &old);
            }
        }
    }
}

pub struct InstanceManager {
    hv: Arc<dyn Hypervisor>,
    switch: Arc<dyn SwitchControl>,
    images: Arc<dyn ImageTool>,
    cfg: Arc<nightlight_config::Config>,
    entities: Mutex<EntityTable>,
    log: Logger,
}

impl InstanceManager {
    pub fn new(
        hv: Arc<dyn Hypervisor>,
        switch: Arc<dyn SwitchControl>,
        images: Arc<dyn ImageTool>,
        cfg: Arc<nightlight_config::Config>,
        log: Logger,
    ) -> Self {
        Self {
            hv,
            switch,
            images,
            cfg,
            entities: Mutex::new(EntityTable::default()),
            log,
        }
    }

    fn entity(&self, id: &str) -> EntityRef {
        let mut table = self.entities.lock().unwrap();
        table
            .entities
            .entry(id.to_owned())
            .or_insert_with(|| {
                Arc::new(Mutex::new(InstanceEntity::new(&self.log)))
            })
            .clone()
    }

    /// Returns the entity for a new instance, replacing a tombstone left by
    /// an earlier instance with the same id.
    ///
    /// The table lock is never held while waiting on an entity, so a long
    /// request against one instance does not stall lookups of the others.
    fn fresh_entity(&self, id: &str) -> EntityRef {
        let existing = self.entity(id);
        if !existing.lock().unwrap().gate.is_destroyed() {
            return existing;
        }

        let mut table = self.entities.lock().unwrap();
        match table.entities.get(id) {
            Some(current) if !Arc::ptr_eq(current, &existing) => {
                current.clone()
            }
            _ => {
                let entity =
                    Arc::new(Mutex::new(InstanceEntity::new(&self.log)));
                table.entities.insert(id.to_owned(), entity.clone());
                entity
            }
        }
    }

    /// Drops the entity of an id the hypervisor has never heard of.
    fn forget(&self, id: &str, entity: &EntityRef) {
        self.entities.lock().unwrap().remove_if_current(id, entity);
    }

    /// Syncs the gate with the hypervisor, then asks it about `req`.
    fn admit(
        &self,
        entity: &mut InstanceEntity,
        id: &str,
        req: LifecycleRequest,
    ) -> Result<RequestDisposition, Error> {
        if !entity.gate.is_destroyed() {
            let state = self.hv.power_state(id)?;
            entity.gate.observe(state);
        }
        Ok(entity.gate.admit(req)?)
    }

    /// Rebuilds the gate from the domain's actual state after a request
    /// that was admitted could not be carried out.
    fn resync(&self, entity: &mut InstanceEntity, id: &str) {
        if entity.gate.is_destroyed() {
            return;
        }
        entity.gate = RequestGate::new(self.log.clone());
        match self.hv.power_state(id) {
            Ok(state) => entity.gate.observe(state),
            Err(e) => warn!(self.log, "could not re-read power state";
                "instance" => id,
                "error" => %e),
        }
    }

    /// Runs `op` if the gate admits `req`. An ignored request succeeds
    /// without running it.
    fn gated<T: Default>(
        &self,
        id: &str,
        req: LifecycleRequest,
        op: impl FnOnce(&mut InstanceEntity) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let entity_ref = self.entity(id);
        let mut entity = entity_ref.lock().unwrap();
        let disposition = match self.admit(&mut entity, id, req) {
            Ok(d) => d,
            Err(e @ Error::NotFound(_)) => {
                drop(entity);
                self.forget(id, &entity_ref);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if disposition == RequestDisposition::Ignore {
            debug!(self.log, "request ignored"; "instance" => id,
                "request" => %req);
            return Ok(T::default());
        }
        let res = op(&mut *entity);
        if let Err(e) = &res {
            warn!(self.log, "lifecycle request failed";
                "instance" => id,
                "request" => %req,
                "error" => %e);
            self.resync(&mut entity, id);
        }
        res
    }

    /// Provisions and boots `instance`.
    ///
    /// Boot order conflicts, failure to create the instance directory, or
    /// the hypervisor refusing to define or start the domain fail the whole
    /// request. Problems confined to one device are reported in the
    /// returned outcomes instead.
    pub fn create_instance(
        &self,
        instance: &Instance,
        datastore: &Datastore,
    ) -> Result<ProvisionReport, Error> {
        let id = instance.id.as_str();
        let log = self.log.new(o!("instance" => id.to_owned()));
        let entity = self.fresh_entity(id);
        let mut entity = entity.lock().unwrap();

        if self.hv.lookup(id)?.is_some() {
            return Err(Error::AlreadyExists(id.to_owned()));
        }
        instance.devices.validate_boot_order()?;

        let dir = datastore.instance_dir(id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::fs(format!("failed to create instance directory {dir}"), e)
        })?;

        let mut provisioned = instance.clone();
        let mut targets = DiskTargetAllocator::new();
        let mut outcomes = disk::provision_disks(
            self.images.as_ref(),
            &log,
            &dir,
            id,
            &mut provisioned.devices.storage_disks,
            &mut targets,
        )?;

        let build = domain::build_domain(
            &self.cfg.domain,
            &provisioned,
            Some(&dir),
            &log,
        )?;
        merge_outcomes(&mut outcomes, build.outcomes);

        self.hv.define(&build.domain.to_xml())?;
        entity.gate = RequestGate::new(log.clone());
        entity.gate.admit(LifecycleRequest::Start)?;
        if let Err(e) = self.hv.start(id) {
            error!(log, "domain defined but failed to start"; "error" => %e);
            self.resync(&mut entity, id);
            return Err(e.into());
        }

        let mut report = ProvisionReport::new(build.instance, outcomes);
        entity.vm_ports = self.attach_networking(&log, &mut report);
        report.instance.power_state = PowerState::On;
        report.instance.initialization_status = InitializationStatus::Ready;

        info!(log, "instance created"; "devices" => report.summary());
        Ok(report)
    }

    /// Installs metadata rules for every interface on the metadata bridge,
    /// returning the switch ports that received them.
    fn attach_networking(
        &self,
        log: &Logger,
        report: &mut ProvisionReport,
    ) -> Vec<u16> {
        let md = &self.cfg.metadata;
        let endpoint = network::metadata_endpoint(&self.cfg);

        let nics: Vec<(DeviceRef, String, Option<MacAddr>)> = report
            .instance
            .devices
            .network_interfaces
            .iter()
            .enumerate()
            .map(|(i, n)| (DeviceRef::Nic(i), n.bridge.clone(), n.mac_address))
            .collect();

        let mut metadata_port = None;
        let mut vm_ports = Vec::new();
        for (dev, bridge, mac) in nics {
            let attached = report
                .outcomes
                .iter()
                .any(|o| o.device == dev && o.is_attached());
            let Some(mac) = mac.filter(|_| attached) else {
                continue;
            };
            if bridge != md.bridge {
                debug!(log, "no metadata service on bridge";
                    "nic" => %dev,
                    "bridge" => &bridge);
                continue;
            }

            let md_port = match metadata_port {
                Some(p) => p,
                None => match self.switch.ofport_by_name(&md.port) {
                    Ok(p) => *metadata_port.insert(p),
                    Err(e) => {
                        report.record_failure(
                            dev,
                            format!("metadata port unavailable: {e}"),
                        );
                        continue;
                    }
                },
            };

            let vm_port = match self.switch.ofport_by_attached_mac(mac) {
                Ok(Some(p)) => p,
                Ok(None) => {
                    report.record_failure(
                        dev,
                        format!("no switch port for {mac}"),
                    );
                    continue;
                }
                Err(e) => {
                    report.record_failure(dev, e.to_string());
                    continue;
                }
            };

            let att =
                Attachment { vm_mac: mac, vm_port, metadata_port: md_port };
            match ovs::install_metadata_flows(
                self.switch.as_ref(),
                log,
                &md.bridge,
                &endpoint,
                &att,
            ) {
                Ok(()) => vm_ports.push(vm_port),
                Err(e) => report.record_failure(
                    dev,
                    format!("failed to install metadata flows: {e}"),
                ),
            }
        }
        vm_ports
    }

    /// Switch ports of the guest's interfaces on the metadata bridge, found
    /// by MAC. Only meaningful while the guest is still running.
    fn lookup_vm_ports(&self, instance: &Instance) -> Vec<u16> {
        let md = &self.cfg.metadata;
        instance
            .devices
            .network_interfaces
            .iter()
            .filter(|n| n.bridge == md.bridge)
            .filter_map(|n| n.mac_address)
            .filter_map(|mac| {
                self.switch.ofport_by_attached_mac(mac).unwrap_or_else(|e| {
                    warn!(self.log, "switch port lookup failed";
                        "mac" => %mac,
                        "error" => %e);
                    None
                })
            })
            .collect()
    }

    /// Tears down `instance`: stops and undefines the domain, removes its
    /// metadata rules and deletes its directory. Deleting an instance that
    /// is already being or has been destroyed succeeds without doing
    /// anything.
    pub fn delete_instance(
        &self,
        instance: &Instance,
        datastore: &Datastore,
    ) -> Result<(), Error> {
        let id = instance.id.as_str();
        let entity_ref = self.entity(id);
        let mut entity = entity_ref.lock().unwrap();

        if self.admit(&mut entity, id, LifecycleRequest::Destroy)?
            == RequestDisposition::Ignore
        {
            return Ok(());
        }

        let mut ports = std::mem::take(&mut entity.vm_ports);
        if ports.is_empty() {
            ports = self.lookup_vm_ports(instance);
        }

        let wait = ShutdownWait::new(self.cfg.hypervisor.shutdown_timeout());
        let res = destroy_gracefully(self.hv.as_ref(), &self.log, id, wait)
            .and_then(|()| self.hv.undefine(id));
        if let Err(e) = res {
            error!(self.log, "failed to destroy domain";
                "instance" => id,
                "error" => %e);
            entity.vm_ports = ports;
            self.resync(&mut entity, id);
            return Err(e.into());
        }

        for port in ports {
            if let Err(e) = ovs::remove_metadata_flows(
                self.switch.as_ref(),
                &self.log,
                &self.cfg.metadata.bridge,
                port,
            ) {
                warn!(self.log, "failed to remove metadata flows";
                    "instance" => id,
                    "vm_port" => port,
                    "error" => %e);
            }
        }

        entity
            .gate
            .notify_instance_state_change(InstanceStateChange::Destroyed);
        self.entities.lock().unwrap().bury(id, &entity_ref);

        let dir = datastore.instance_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::fs(format!("failed to remove {dir}"), e));
            }
        }
        info!(self.log, "instance deleted"; "instance" => id);
        Ok(())
    }

    pub fn start(&self, id: &str) -> Result<(), Error> {
        self.gated(id, LifecycleRequest::Start, |_| Ok(self.hv.start(id)?))
    }

    /// Asks the guest to power off. Returns once the request is delivered.
    pub fn shutdown(&self, id: &str) -> Result<(), Error> {
        self.gated(id, LifecycleRequest::Shutdown, |_| {
            Ok(self.hv.shutdown(id)?)
        })
    }

    pub fn reboot(&self, id: &str) -> Result<(), Error> {
        self.gated(id, LifecycleRequest::Reboot, |_| Ok(self.hv.reboot(id)?))
    }

    pub fn reset(&self, id: &str) -> Result<(), Error> {
        self.gated(id, LifecycleRequest::Reset, |_| Ok(self.hv.reset(id)?))
    }

    /// Types `text` on the guest's keyboard. Characters with no key are
    /// skipped and returned.
    pub fn send_text(
        &self,
        id: &str,
        text: &str,
    ) -> Result<Vec<char>, Error> {
        self.gated(id, LifecycleRequest::Console, |_| {
            let translation = keys::translate(text);
            for stroke in &translation.strokes {
                self.hv.send_keys(id, &stroke.chord())?;
            }
            if !translation.unknown.is_empty() {
                warn!(self.log, "skipped characters without a key";
                    "instance" => id,
                    "chars" => ?translation.unknown);
            }
            Ok(translation.unknown)
        })
    }

    /// Sends raw USB HID usage codes, pressed together.
    pub fn send_raw_keys(
        &self,
        id: &str,
        codes: &[u32],
    ) -> Result<(), Error> {
        if codes.is_empty() {
            return Ok(());
        }
        self.gated(id, LifecycleRequest::Console, |_| {
            Ok(self.hv.send_keys(id, codes)?)
        })
    }

    /// Hot-plugs a CD-ROM drive backed by `path` into a running guest and
    /// returns its device name.
    ///
    /// The name is the first free one on the configured bus, given the
    /// drives in the domain's live definition.
    pub fn attach_cdrom(
        &self,
        id: &str,
        path: &Utf8Path,
    ) -> Result<String, Error> {
        self.gated(id, LifecycleRequest::Console, |_| {
            let mut targets = DiskTargetAllocator::new();
            for used in self.hv.disk_targets(id)? {
                targets.reserve(&used);
            }
            let (target, bus) =
                cdrom_target(&mut targets, self.cfg.domain.cdrom_bus)?;
            let drive = Disk {
                device: DiskDevice::Cdrom,
                source: Some(Utf8PathBuf::from(path)),
                target: target.to_owned(),
                bus: bus.to_owned(),
                boot_order: 0,
            };
            self.hv.attach_device(id, &drive.to_xml())?;
            info!(self.log, "attached cdrom";
                "instance" => id,
                "target" => target,
                "path" => %path);
            Ok(drive.target)
        })
    }

    /// The guest's current power state.
    pub fn power_state(&self, id: &str) -> Result<PowerState, Error> {
        let entity_ref = self.entity(id);
        let mut entity = entity_ref.lock().unwrap();
        if entity.gate.is_destroyed() {
            return Err(Error::NotFound(id.to_owned()));
        }
        match self.hv.power_state(id) {
            Ok(state) => {
                entity.gate.observe(state);
                Ok(state)
            }
            Err(HypervisorError::NotFound(_)) => {
                drop(entity);
                self.forget(id, &entity_ref);
                Err(Error::NotFound(id.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::outcome::DeviceStatus;
    use crate::test_support::{
        FakeHypervisor, RecordingImages, RecordingSwitch,
    };
    use nightlight_types::{
        BootType, Cdrom, DatastoreKind, Devices, NetworkInterface,
        StorageDisk,
    };
    use std::time::Duration;

    struct Harness {
        hv: Arc<FakeHypervisor>,
        switch: Arc<RecordingSwitch>,
        images: Arc<RecordingImages>,
        mgr: InstanceManager,
        datastore: Datastore,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::default());
        let switch = Arc::new(RecordingSwitch::default());
        let images = Arc::new(RecordingImages::default());
        let mut cfg = nightlight_config::Config::default();
        cfg.domain.write_debug_xml = true;
        let mgr = InstanceManager::new(
            hv.clone(),
            switch.clone(),
            images.clone(),
            Arc::new(cfg),
            Logger::root(slog::Discard, o!()),
        );
        let datastore = Datastore {
            id: "ds-local".to_owned(),
            name: "local".to_owned(),
            kind: DatastoreKind::Local,
            path: None,
            local_path: Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
                .unwrap(),
        };
        Harness { hv, switch, images, mgr, datastore, _dir: dir }
    }

    fn instance() -> Instance {
        Instance {
            id: "i-0123456789".to_owned(),
            name: "web".to_owned(),
            cpu_cores: 2,
            cpu_sockets: 1,
            memory_mb: 2048,
            datastore_id: "ds-local".to_owned(),
            devices: Devices {
                network_interfaces: vec![NetworkInterface {
                    model: "virtio".to_owned(),
                    boot_order: 0,
                    connected: true,
                    bridge: "nightlight".to_owned(),
                    mac_address: Some("52:54:00:aa:bb:cc".parse().unwrap()),
                }],
                storage_disks: vec![StorageDisk {
                    bus: "virtio".to_owned(),
                    size_gb: 20,
                    boot_order: 1,
                    ..Default::default()
                }],
                cdroms: vec![],
                floppy_disks: vec![],
            },
            ..Default::default()
        }
    }

    fn mac() -> MacAddr {
        "52:54:00:aa:bb:cc".parse().unwrap()
    }

    #[test]
    fn create_defines_and_starts_once() {
        let h = harness();
        h.switch.set_port_for_name("mddefaultvpc", 1);
        h.switch.set_port_for_mac(mac(), 7);

        let report =
            h.mgr.create_instance(&instance(), &h.datastore).unwrap();
        assert_eq!(h.hv.count("define"), 1);
        assert_eq!(h.hv.count("start"), 1);
        assert_eq!(report.summary(), "2 of 2 devices attached");
        assert_eq!(report.instance.power_state, PowerState::On);

        let disk = &report.instance.devices.storage_disks[0];
        assert_eq!(disk.target.as_deref(), Some("vda"));
        let expected = h.datastore.instance_dir("i-0123456789");
        assert_eq!(
            disk.path.as_deref(),
            Some(expected.join("i-0123456789_disk_vda.qcow2").as_path())
        );
        assert_eq!(h.images.created.lock().unwrap().len(), 1);
        assert!(expected.join("i-0123456789.xml").exists());

        let flows = h
            .switch
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("add-flow nightlight"))
            .count();
        assert_eq!(flows, 4);
    }

    #[test]
    fn missing_switch_port_is_a_nic_failure() {
        let h = harness();
        h.switch.set_port_for_name("mddefaultvpc", 1);

        let report =
            h.mgr.create_instance(&instance(), &h.datastore).unwrap();
        assert_eq!(report.summary(), "1 of 2 devices attached");
        let nic = report
            .outcomes
            .iter()
            .find(|o| o.device == DeviceRef::Nic(0))
            .unwrap();
        assert!(matches!(nic.status, DeviceStatus::Failed { .. }));
        assert_eq!(h.hv.count("start"), 1);
    }

    #[test]
    fn flow_failure_is_a_nic_failure() {
        let h = harness();
        h.switch.set_port_for_name("mddefaultvpc", 1);
        h.switch.set_port_for_mac(mac(), 7);
        h.switch.fail_flows();

        let mut inst = instance();
        inst.devices.storage_disks[0].existing_path =
            Some("/images/base.qcow2".into());
        let report = h.mgr.create_instance(&inst, &h.datastore).unwrap();
        assert_eq!(report.summary(), "1 of 2 devices attached");

        let copied = h.images.copied.lock().unwrap().clone();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].0, "/images/base.qcow2");
        assert!(h.images.created.lock().unwrap().is_empty());
    }

    #[test]
    fn create_rejects_defined_instance() {
        let h = harness();
        h.hv.set_state("i-0123456789", PowerState::Off);
        let err =
            h.mgr.create_instance(&instance(), &h.datastore).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(h.hv.count("define"), 0);
    }

    #[test]
    fn boot_order_conflict_is_fatal() {
        let h = harness();
        let mut inst = instance();
        inst.devices.network_interfaces[0].boot_order = 1;
        let err = h.mgr.create_instance(&inst, &h.datastore).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
        assert!(h.hv.calls().is_empty());
        assert!(h.images.created.lock().unwrap().is_empty());
    }

    #[test]
    fn start_failure_is_returned() {
        let h = harness();
        h.hv.fail_start();
        let err =
            h.mgr.create_instance(&instance(), &h.datastore).unwrap_err();
        assert!(matches!(err, Error::ExternalDaemonRejected { .. }));

        // The gate follows the domain, which never came up.
        let err = h.mgr.reboot("i-0123456789").unwrap_err();
        assert!(matches!(
            err,
            Error::RequestDenied(RequestDeniedReason::NotRunning)
        ));
    }

    #[test]
    fn delete_shuts_down_then_cleans_up() {
        let h = harness();
        h.switch.set_port_for_name("mddefaultvpc", 1);
        h.switch.set_port_for_mac(mac(), 7);
        let inst = h.mgr.create_instance(&instance(), &h.datastore).unwrap();

        h.mgr.delete_instance(&inst.instance, &h.datastore).unwrap();
        let calls = h.hv.calls();
        let tail: Vec<&str> =
            calls.iter().skip(2).map(String::as_str).collect();
        assert_eq!(
            tail,
            [
                "shutdown i-0123456789",
                "destroy i-0123456789",
                "undefine i-0123456789"
            ]
        );
        let del = format!(
            "del-flows nightlight {:#x}",
            ovs::attachment_cookie(7)
        );
        assert!(h.switch.calls().contains(&del));
        assert!(!h.datastore.instance_dir("i-0123456789").exists());

        // Repeats are ignored; everything else is denied.
        h.mgr.delete_instance(&inst.instance, &h.datastore).unwrap();
        assert_eq!(h.hv.count("destroy"), 1);
        let err = h.mgr.reboot("i-0123456789").unwrap_err();
        assert!(matches!(
            err,
            Error::RequestDenied(RequestDeniedReason::Destroyed)
        ));
    }

    #[test]
    fn delete_of_stopped_instance_skips_shutdown() {
        let h = harness();
        let inst = h.mgr.create_instance(&instance(), &h.datastore).unwrap();
        h.hv.set_state("i-0123456789", PowerState::Off);

        h.mgr.delete_instance(&inst.instance, &h.datastore).unwrap();
        assert_eq!(h.hv.count("shutdown"), 0);
        assert_eq!(h.hv.count("destroy"), 1);
    }

    #[test]
    fn lifecycle_requests_follow_observed_state() {
        let h = harness();
        h.mgr.create_instance(&instance(), &h.datastore).unwrap();
        let id = "i-0123456789";

        // Already running.
        h.mgr.start(id).unwrap();
        assert_eq!(h.hv.count("start"), 1);

        h.mgr.reboot(id).unwrap();
        h.mgr.reset(id).unwrap();
        h.mgr.shutdown(id).unwrap();
        assert_eq!(h.mgr.power_state(id).unwrap(), PowerState::Off);

        let err = h.mgr.send_raw_keys(id, &[0x28]).unwrap_err();
        assert!(matches!(
            err,
            Error::RequestDenied(RequestDeniedReason::NotRunning)
        ));
        h.mgr.start(id).unwrap();
        assert_eq!(h.hv.count("start"), 2);
    }

    #[test]
    fn unknown_instance_is_not_found() {
        let h = harness();
        let err = h.mgr.start("i-missing").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = h.mgr.power_state("i-missing").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn text_becomes_key_chords() {
        let h = harness();
        h.mgr.create_instance(&instance(), &h.datastore).unwrap();

        let unknown = h.mgr.send_text("i-0123456789", "Hi\u{e9}").unwrap();
        assert_eq!(unknown, ['\u{e9}']);
        let keys = h.hv.keys.lock().unwrap().clone();
        assert_eq!(keys, vec![vec![keys::KEY_LEFT_SHIFT, 0x0b], vec![0x0c]]);
    }

    #[test]
    fn cdrom_hot_attach_avoids_used_names() {
        let h = harness();
        let mut inst = instance();
        inst.devices.cdroms.push(Cdrom {
            path: "/images/install.iso".into(),
            boot_order: 2,
            connected: true,
        });
        let report = h.mgr.create_instance(&inst, &h.datastore).unwrap();
        assert!(report
            .outcomes
            .iter()
            .any(|o| o.device == DeviceRef::Cdrom(0) && o.is_attached()));

        let target = h
            .mgr
            .attach_cdrom("i-0123456789", Utf8Path::new("/images/tools.iso"))
            .unwrap();
        assert_eq!(target, "hdb");
        let xml = h.hv.attached_xml.lock().unwrap()[0].clone();
        assert!(xml.contains("/images/tools.iso"));
        assert!(xml.contains("dev='hdb'"));
    }

    #[test]
    fn cdrom_names_come_from_the_live_domain() {
        let h = harness();
        let mut inst = instance();
        inst.devices.cdroms.push(Cdrom {
            path: "/images/install.iso".into(),
            boot_order: 2,
            connected: true,
        });
        h.mgr.create_instance(&inst, &h.datastore).unwrap();

        // A manager that did not create the guest.
        let other = InstanceManager::new(
            h.hv.clone(),
            h.switch.clone(),
            h.images.clone(),
            Arc::new(nightlight_config::Config::default()),
            Logger::root(slog::Discard, o!()),
        );
        let id = "i-0123456789";
        let first =
            other.attach_cdrom(id, Utf8Path::new("/images/a.iso")).unwrap();
        let second =
            other.attach_cdrom(id, Utf8Path::new("/images/b.iso")).unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("hdb", "hdc"));
    }

    #[test]
    fn uefi_guest_with_one_disk_and_nic() {
        let h = harness();
        let inst = Instance {
            id: "i-uefi012345".to_owned(),
            name: "uefi".to_owned(),
            cpu_cores: 1,
            cpu_sockets: 1,
            memory_mb: 1024,
            datastore_id: "ds-local".to_owned(),
            boot_type: BootType::Uefi,
            devices: Devices {
                network_interfaces: vec![NetworkInterface {
                    model: "virtio".to_owned(),
                    boot_order: 0,
                    connected: true,
                    bridge: "br0".to_owned(),
                    mac_address: None,
                }],
                storage_disks: vec![StorageDisk {
                    bus: "virtio".to_owned(),
                    size_gb: 10,
                    boot_order: 1,
                    ..Default::default()
                }],
                cdroms: vec![],
                floppy_disks: vec![],
            },
            ..Default::default()
        };

        let report = h.mgr.create_instance(&inst, &h.datastore).unwrap();
        assert_eq!(h.hv.count("define"), 1);
        assert_eq!(h.hv.count("start"), 1);
        assert_eq!(report.summary(), "2 of 2 devices attached");

        let defined = h.hv.defined_xml.lock().unwrap().clone();
        assert_eq!(defined.len(), 1);
        let xml = &defined[0];
        assert!(xml.contains("<os firmware='efi'>"));
        assert!(xml.contains(
            "<loader readonly='yes' secure='no' type='pflash'>\
             /usr/share/qemu/edk2-x86_64-code.fd</loader>"
        ));
        assert_eq!(xml.matches("device='disk'").count(), 1);
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));

        let mac = report.instance.primary_mac_address.unwrap();
        assert_eq!(
            report.instance.devices.network_interfaces[0].mac_address,
            Some(mac)
        );
        assert!(xml.contains(&format!("<mac address='{mac}'/>")));
        assert!(xml.contains("<source bridge='br0'/>"));

        let created = h.images.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert!(created[0].0.ends_with("i-uefi012345_disk_vda.qcow2"));
        assert_eq!(created[0].1, 10);
        assert!(h.switch.calls().is_empty());
    }

    #[test]
    fn pinned_disk_targets_stay_unique() {
        let h = harness();
        h.switch.set_port_for_name("mddefaultvpc", 1);
        h.switch.set_port_for_mac(mac(), 7);
        let mut inst = instance();
        let pinned = |target: &str, size_gb| StorageDisk {
            bus: "virtio".to_owned(),
            size_gb,
            target: Some(target.to_owned()),
            ..Default::default()
        };
        inst.devices.storage_disks = vec![
            pinned("vda", 20),
            pinned("vda", 5),
            pinned("../../escape", 1),
        ];

        let report = h.mgr.create_instance(&inst, &h.datastore).unwrap();
        assert_eq!(report.summary(), "2 of 4 devices attached");

        let created = h.images.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert!(created[0].0.ends_with("_disk_vda.qcow2"));
        assert_eq!(created[0].1, 20);

        let xml = h.hv.defined_xml.lock().unwrap()[0].clone();
        assert_eq!(xml.matches("dev='vda'").count(), 1);
        assert!(!xml.contains("escape"));
    }

    #[test]
    fn busy_instance_does_not_stall_others() {
        let h = harness();
        h.mgr.create_instance(&instance(), &h.datastore).unwrap();
        h.hv.set_state("i-other", PowerState::On);

        let held = h.mgr.entity("i-0123456789");
        let guard = held.lock().unwrap();
        std::thread::scope(|s| {
            let mgr = &h.mgr;
            let datastore = &h.datastore;
            s.spawn(move || {
                let _ = mgr.create_instance(&instance(), datastore);
            });
            std::thread::sleep(Duration::from_millis(50));

            let (tx, rx) = std::sync::mpsc::channel();
            s.spawn(move || {
                let _ = tx.send(mgr.power_state("i-other"));
            });
            let res = rx.recv_timeout(Duration::from_secs(5));
            drop(guard);
            let state = res.expect("lookup of another instance blocked");
            assert_eq!(state.unwrap(), PowerState::On);
        });
    }

    #[test]
    fn unknown_ids_are_not_remembered() {
        let h = harness();
        h.mgr.start("i-missing").unwrap_err();
        h.mgr.power_state("i-missing").unwrap_err();
        let table = h.mgr.entities.lock().unwrap();
        assert!(!table.entities.contains_key("i-missing"));
    }

    #[test]
    fn oldest_tombstones_are_forgotten() {
        let log = Logger::root(slog::Discard, o!());
        let entity = || -> EntityRef {
            Arc::new(Mutex::new(InstanceEntity::new(&log)))
        };
        let mut table = EntityTable::default();

        let first = entity();
        table.entities.insert("i-0".to_owned(), first.clone());
        table.bury("i-0", &first);
        let reused = entity();
        table.entities.insert("i-0".to_owned(), reused.clone());

        let old = entity();
        table.entities.insert("i-1".to_owned(), old.clone());
        table.bury("i-1", &old);

        for i in 2..=MAX_TOMBSTONES {
            let id = format!("i-{i}");
            let e = entity();
            table.entities.insert(id.clone(), e.clone());
            table.bury(&id, &e);
        }
        assert_eq!(table.tombstones.len(), MAX_TOMBSTONES);
        // The reused id outlives its tombstone; i-1 is still within the cap.
        assert!(Arc::ptr_eq(&table.entities["i-0"], &reused));
        assert!(table.entities.contains_key("i-1"));

        let e = entity();
        table.entities.insert("i-last".to_owned(), e.clone());
        table.bury("i-last", &e);
        assert!(!table.entities.contains_key("i-1"));
        assert_eq!(table.entities.len(), MAX_TOMBSTONES + 1);
    }
}
