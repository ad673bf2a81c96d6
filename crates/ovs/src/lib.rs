// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control of the host's Open vSwitch integration bridge.
//!
//! Bridge, port and interface configuration goes through `ovs-vsctl`; flow
//! programming goes through `ovs-ofctl`. Both sit behind [`SwitchControl`] so
//! that the flow layout can be exercised without a running switch.

use std::collections::BTreeMap;

use nightlight_types::MacAddr;
use thiserror::Error;

mod client;
pub mod flow;
mod metadata;

pub use client::OvsClient;
pub use flow::{Action, Flow, Match};
pub use metadata::{
    attachment_cookie, install_default_flow, install_metadata_flows,
    metadata_flows, nat_address, remove_metadata_flows, Attachment,
    MetadataEndpoint, COOKIE_BASE,
};

#[derive(Debug, Error)]
pub enum OvsError {
    #[error("failed to run {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} {args} failed: {stderr}")]
    Command { cmd: String, args: String, stderr: String },

    #[error("unexpected output from {cmd}: {output:?}")]
    Parse { cmd: String, output: String },

    #[error("interface {0} has no switch port")]
    NoPort(String),
}

/// Columns set on an `Interface` row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceOptions {
    /// Interface type, e.g. `internal`.
    pub kind: Option<String>,
    pub external_ids: BTreeMap<String, String>,
}

impl InterfaceOptions {
    /// Options for a switch-internal port bound to a logical interface.
    pub fn internal(iface_id: &str, mac: MacAddr) -> Self {
        let mut external_ids = BTreeMap::new();
        external_ids.insert("iface-id".to_owned(), iface_id.to_owned());
        external_ids.insert("attached-mac".to_owned(), mac.to_string());
        Self { kind: Some("internal".to_owned()), external_ids }
    }

    /// The `column=value` arguments to `ovs-vsctl set Interface`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kind) = &self.kind {
            args.push(format!("type={kind}"));
        }
        for (key, value) in &self.external_ids {
            args.push(format!("external_ids:{key}=\"{value}\""));
        }
        args
    }
}

/// Operations on the virtual switch.
#[cfg_attr(test, mockall::automock)]
pub trait SwitchControl: Send + Sync {
    /// Creates `bridge`; an existing bridge is not an error.
    fn add_bridge(&self, bridge: &str) -> Result<(), OvsError>;

    /// Deletes `bridge`; a missing bridge is not an error.
    fn del_bridge(&self, bridge: &str) -> Result<(), OvsError>;

    fn add_port(&self, bridge: &str, port: &str) -> Result<(), OvsError>;

    fn set_interface(
        &self,
        iface: &str,
        opts: &InterfaceOptions,
    ) -> Result<(), OvsError>;

    /// The OpenFlow port number assigned to an interface.
    fn ofport_by_name(&self, iface: &str) -> Result<u16, OvsError>;

    /// The OpenFlow port number of the interface whose `attached-mac`
    /// external id is `mac`, if one is attached.
    fn ofport_by_attached_mac(
        &self,
        mac: MacAddr,
    ) -> Result<Option<u16>, OvsError>;

    fn add_flow(&self, bridge: &str, flow: &Flow) -> Result<(), OvsError>;

    /// Removes every flow on `bridge` tagged with exactly `cookie`.
    fn del_flows(&self, bridge: &str, cookie: u64) -> Result<(), OvsError>;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn internal_interface_args() {
        let mac = MacAddr::from_str("32:6b:ce:89:41:42").unwrap();
        let opts = InterfaceOptions::internal("mddefaultvpc", mac);
        assert_eq!(
            opts.to_args(),
            vec![
                "type=internal".to_owned(),
                "external_ids:attached-mac=\"32:6b:ce:89:41:42\"".to_owned(),
                "external_ids:iface-id=\"mddefaultvpc\"".to_owned(),
            ]
        );
    }
}
