// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the host daemons, shared by the unit tests.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use camino::Utf8Path;
use netns::{NamespaceOps, NetnsError, NsHandle};
use nightlight_types::{MacAddr, PowerState};
use ovs::{Flow, InterfaceOptions, OvsError, SwitchControl};
use uuid::Uuid;

use crate::disk::{DiskError, ImageTool};
use crate::hypervisor::{disk_targets_in, Hypervisor, HypervisorError};

/// Records every switch command as a short string, e.g. `add-br br0`.
#[derive(Default)]
pub struct RecordingSwitch {
    calls: Mutex<Vec<String>>,
    ports_by_mac: Mutex<BTreeMap<MacAddr, u16>>,
    ports_by_name: Mutex<BTreeMap<String, u16>>,
    fail_add_flow: Mutex<bool>,
}

impl RecordingSwitch {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_port_for_mac(&self, mac: MacAddr, port: u16) {
        self.ports_by_mac.lock().unwrap().insert(mac, port);
    }

    pub fn set_port_for_name(&self, name: &str, port: u16) {
        self.ports_by_name.lock().unwrap().insert(name.to_owned(), port);
    }

    pub fn fail_flows(&self) {
        *self.fail_add_flow.lock().unwrap() = true;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl SwitchControl for RecordingSwitch {
    fn add_bridge(&self, bridge: &str) -> Result<(), OvsError> {
        self.record(format!("add-br {bridge}"));
        Ok(())
    }

    fn del_bridge(&self, bridge: &str) -> Result<(), OvsError> {
        self.record(format!("del-br {bridge}"));
        Ok(())
    }

    fn add_port(&self, bridge: &str, port: &str) -> Result<(), OvsError> {
        self.record(format!("add-port {bridge} {port}"));
        Ok(())
    }

    fn set_interface(
        &self,
        iface: &str,
        opts: &InterfaceOptions,
    ) -> Result<(), OvsError> {
        let args = opts.to_args().join(" ");
        self.record(format!("set Interface {iface} {args}"));
        Ok(())
    }

    fn ofport_by_name(&self, iface: &str) -> Result<u16, OvsError> {
        self.ports_by_name
            .lock()
            .unwrap()
            .get(iface)
            .copied()
            .ok_or_else(|| OvsError::NoPort(iface.to_owned()))
    }

    fn ofport_by_attached_mac(
        &self,
        mac: MacAddr,
    ) -> Result<Option<u16>, OvsError> {
        Ok(self.ports_by_mac.lock().unwrap().get(&mac).copied())
    }

    fn add_flow(&self, bridge: &str, flow: &Flow) -> Result<(), OvsError> {
        if *self.fail_add_flow.lock().unwrap() {
            return Err(OvsError::Command {
                cmd: "ovs-ofctl".to_owned(),
                args: format!("add-flow {bridge}"),
                stderr: "bridge does not exist".to_owned(),
            });
        }
        self.record(format!("add-flow {bridge} {flow}"));
        Ok(())
    }

    fn del_flows(&self, bridge: &str, cookie: u64) -> Result<(), OvsError> {
        self.record(format!("del-flows {bridge} {cookie:#x}"));
        Ok(())
    }
}

/// A hypervisor whose domains live in a map. Guests power off as soon as
/// they are asked to shut down.
#[derive(Default)]
pub struct FakeHypervisor {
    pub calls: Mutex<Vec<String>>,
    domains: Mutex<BTreeMap<String, PowerState>>,
    disks: Mutex<BTreeMap<String, Vec<String>>>,
    pub defined_xml: Mutex<Vec<String>>,
    pub attached_xml: Mutex<Vec<String>>,
    pub keys: Mutex<Vec<Vec<u32>>>,
    fail_start: Mutex<bool>,
}

impl FakeHypervisor {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn fail_start(&self) {
        *self.fail_start.lock().unwrap() = true;
    }

    /// Changes a guest's state behind the control plane's back.
    pub fn set_state(&self, name: &str, state: PowerState) {
        self.domains.lock().unwrap().insert(name.to_owned(), state);
    }

    fn record(&self, op: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{op} {name}"));
    }

    fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut PowerState) -> T,
    ) -> Result<T, HypervisorError> {
        let mut domains = self.domains.lock().unwrap();
        let state = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(name.to_owned()))?;
        Ok(f(state))
    }
}

fn xml_name(xml: &str) -> Option<&str> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")? + start;
    Some(&xml[start..end])
}

impl Hypervisor for FakeHypervisor {
    fn define(&self, xml: &str) -> Result<(), HypervisorError> {
        let name = xml_name(xml).ok_or(HypervisorError::Rejected {
            op: "define",
            detail: "missing name".to_owned(),
        })?;
        self.record("define", name);
        self.defined_xml.lock().unwrap().push(xml.to_owned());
        self.domains.lock().unwrap().insert(name.to_owned(), PowerState::Off);
        self.disks
            .lock()
            .unwrap()
            .insert(name.to_owned(), disk_targets_in(xml));
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("start", name);
        if *self.fail_start.lock().unwrap() {
            return Err(HypervisorError::Rejected {
                op: "start",
                detail: "no space left on device".to_owned(),
            });
        }
        self.with_domain(name, |s| *s = PowerState::On)
    }

    fn shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("shutdown", name);
        self.with_domain(name, |s| *s = PowerState::Off)
    }

    fn reboot(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("reboot", name);
        self.with_domain(name, |_| ())
    }

    fn reset(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("reset", name);
        self.with_domain(name, |_| ())
    }

    fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("destroy", name);
        self.with_domain(name, |s| *s = PowerState::Off)
    }

    fn undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("undefine", name);
        self.domains
            .lock()
            .unwrap()
            .remove(name)
            .map(drop)
            .ok_or_else(|| HypervisorError::NotFound(name.to_owned()))
    }

    fn attach_device(
        &self,
        name: &str,
        xml: &str,
    ) -> Result<(), HypervisorError> {
        self.record("attach-device", name);
        self.with_domain(name, |_| ())?;
        self.attached_xml.lock().unwrap().push(xml.to_owned());
        self.disks
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_default()
            .extend(disk_targets_in(xml));
        Ok(())
    }

    fn send_keys(
        &self,
        name: &str,
        codes: &[u32],
    ) -> Result<(), HypervisorError> {
        self.record("send-key", name);
        self.with_domain(name, |_| ())?;
        self.keys.lock().unwrap().push(codes.to_vec());
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Option<Uuid>, HypervisorError> {
        let uuid = Uuid::from_u128(0xec20_0000_0000_4000_8000_0000_0000_0001);
        Ok(self.domains.lock().unwrap().contains_key(name).then_some(uuid))
    }

    fn power_state(&self, name: &str) -> Result<PowerState, HypervisorError> {
        self.with_domain(name, |s| *s)
    }

    fn disk_targets(
        &self,
        name: &str,
    ) -> Result<Vec<String>, HypervisorError> {
        self.with_domain(name, |_| ())?;
        Ok(self.disks.lock().unwrap().get(name).cloned().unwrap_or_default())
    }
}

/// Image tool that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingImages {
    pub created: Mutex<Vec<(String, u64)>>,
    pub copied: Mutex<Vec<(String, String)>>,
}

impl ImageTool for RecordingImages {
    fn create_qcow2(
        &self,
        path: &Utf8Path,
        size_gb: u64,
    ) -> Result<(), DiskError> {
        self.created.lock().unwrap().push((path.to_string(), size_gb));
        Ok(())
    }

    fn clone_image(
        &self,
        src: &Utf8Path,
        dst: &Utf8Path,
    ) -> Result<(), DiskError> {
        self.copied.lock().unwrap().push((src.to_string(), dst.to_string()));
        Ok(())
    }
}

/// Namespace operations on a platform without network namespaces.
pub struct NoNamespaces;

impl NamespaceOps for NoNamespaces {
    fn exists(&self, _name: &str) -> Result<bool, NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn current(&self) -> Result<NsHandle, NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn create(&self, _name: &str) -> Result<NsHandle, NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn enter(&self, _ns: &NsHandle) -> Result<(), NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn move_link(&self, _link: &str, _ns: &NsHandle) -> Result<(), NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn set_link_mac(
        &self,
        _link: &str,
        _mac: MacAddr,
    ) -> Result<(), NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn add_link_addr(
        &self,
        _link: &str,
        _ip: Ipv4Addr,
        _prefix_len: u8,
    ) -> Result<(), NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn set_link_up(&self, _link: &str) -> Result<(), NetnsError> {
        Err(NetnsError::Unsupported)
    }
    fn add_default_route(&self, _link: &str) -> Result<(), NetnsError> {
        Err(NetnsError::Unsupported)
    }
}

/// Namespace operations that succeed, tracking which namespaces exist.
#[derive(Default)]
pub struct MemoryNamespaces {
    pub created: Mutex<Vec<String>>,
}

impl NamespaceOps for MemoryNamespaces {
    fn exists(&self, name: &str) -> Result<bool, NetnsError> {
        Ok(self.created.lock().unwrap().iter().any(|n| n == name))
    }
    fn current(&self) -> Result<NsHandle, NetnsError> {
        Ok(NsHandle::detached("host"))
    }
    fn create(&self, name: &str) -> Result<NsHandle, NetnsError> {
        self.created.lock().unwrap().push(name.to_owned());
        Ok(NsHandle::detached(name))
    }
    fn enter(&self, _ns: &NsHandle) -> Result<(), NetnsError> {
        Ok(())
    }
    fn move_link(&self, _link: &str, _ns: &NsHandle) -> Result<(), NetnsError> {
        Ok(())
    }
    fn set_link_mac(
        &self,
        _link: &str,
        _mac: MacAddr,
    ) -> Result<(), NetnsError> {
        Ok(())
    }
    fn add_link_addr(
        &self,
        _link: &str,
        _ip: Ipv4Addr,
        _prefix_len: u8,
    ) -> Result<(), NetnsError> {
        Ok(())
    }
    fn set_link_up(&self, _link: &str) -> Result<(), NetnsError> {
        Ok(())
    }
    fn add_default_route(&self, _link: &str) -> Result<(), NetnsError> {
        Ok(())
    }
}
