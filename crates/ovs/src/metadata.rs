// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow layout that proxies a guest's metadata requests into the metadata
//! namespace.
//!
//! Each guest attachment gets four rules. Two answer ARP on behalf of the
//! other side: the guest sees the metadata address at the metadata MAC, and
//! the metadata responder sees the guest at a synthesized NAT address. The
//! other two carry HTTP requests from the guest through conntrack SNAT and
//! steer replies back to the guest's port. Everything else falls to the
//! priority-0 `normal` rule.

use std::net::Ipv4Addr;

use nightlight_types::MacAddr;
use slog::{info, warn, Logger};

use crate::flow::{
    ip_value, Action, Field, Flow, Match, ARP_REPLY, ARP_REQUEST,
};
use crate::{OvsError, SwitchControl};

/// High bits shared by every attachment cookie ("nlmd").
pub const COOKIE_BASE: u64 = 0x6e6c_6d64_0000_0000;

const PRIO_DEFAULT: u16 = 0;
const PRIO_GUEST_ARP: u16 = 100;
const PRIO_METADATA_ARP: u16 = 110;
const PRIO_GUEST_REQUEST: u16 = 120;
const PRIO_METADATA_REPLY: u16 = 130;

const HTTP_PORT: u16 = 80;

/// The address a guest's metadata traffic is source-NATed to, derived from
/// its switch port: `100.127.<port high byte>.<port low byte>`.
///
/// Replies are demultiplexed back to the guest by this address alone, so the
/// mapping must stay injective over the port space.
pub fn nat_address(port: u16) -> Ipv4Addr {
    let [hi, lo] = port.to_be_bytes();
    Ipv4Addr::new(100, 127, hi, lo)
}

/// Cookie tagging every rule installed for the guest on `vm_port`.
pub fn attachment_cookie(vm_port: u16) -> u64 {
    COOKIE_BASE | u64::from(vm_port)
}

/// Identity of the metadata responder as seen on the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetadataEndpoint {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    /// Table in which NAT'd requests continue.
    pub ct_table: u8,
}

impl Default for MetadataEndpoint {
    fn default() -> Self {
        Self {
            mac: MacAddr::new([0x32, 0x6b, 0xce, 0x89, 0x41, 0x42]),
            ip: Ipv4Addr::new(169, 254, 169, 254),
            ct_table: 1,
        }
    }
}

/// One guest interface plugged into the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub vm_mac: MacAddr,
    pub vm_port: u16,
    pub metadata_port: u16,
}

/// Actions turning an ARP request into a reply claiming `mac`/`ip`, sent
/// back out the ingress port.
fn arp_responder(mac: MacAddr, ip: Ipv4Addr) -> Vec<Action> {
    vec![
        Action::Move { src: Field::EthSrc, dst: Field::EthDst },
        Action::ModDlSrc(mac),
        Action::Load { value: u64::from(ARP_REPLY), dst: Field::ArpOp },
        Action::Move { src: Field::ArpSha, dst: Field::ArpTha },
        Action::Move { src: Field::ArpSpa, dst: Field::ArpTpa },
        Action::Load { value: mac.to_u64(), dst: Field::ArpSha },
        Action::Load { value: ip_value(ip), dst: Field::ArpSpa },
        Action::InPort,
    ]
}

/// The four metadata rules for one attachment, lowest priority first.
pub fn metadata_flows(md: &MetadataEndpoint, att: &Attachment) -> Vec<Flow> {
    let cookie = attachment_cookie(att.vm_port);
    let nat = nat_address(att.vm_port);

    let mut guest_arp = Flow::new(PRIO_GUEST_ARP)
        .cookie(cookie)
        .matching(Match::InPort(att.vm_port))
        .matching(Match::Arp)
        .matching(Match::DlSrc(att.vm_mac))
        .matching(Match::ArpOp(ARP_REQUEST))
        .matching(Match::ArpTpa(md.ip));
    guest_arp.actions = arp_responder(md.mac, md.ip);

    let mut metadata_arp = Flow::new(PRIO_METADATA_ARP)
        .cookie(cookie)
        .matching(Match::InPort(att.metadata_port))
        .matching(Match::Arp)
        .matching(Match::ArpOp(ARP_REQUEST))
        .matching(Match::ArpTpa(nat));
    metadata_arp.actions = arp_responder(att.vm_mac, nat);

    let guest_request = Flow::new(PRIO_GUEST_REQUEST)
        .cookie(cookie)
        .matching(Match::InPort(att.vm_port))
        .matching(Match::Tcp)
        .matching(Match::DlSrc(att.vm_mac))
        .matching(Match::NwDst(md.ip))
        .matching(Match::TpDst(HTTP_PORT))
        .action(Action::CtCommit {
            zone: att.vm_port,
            snat: Some(nat),
            table: Some(md.ct_table),
        });

    let metadata_reply = Flow::new(PRIO_METADATA_REPLY)
        .cookie(cookie)
        .matching(Match::InPort(att.metadata_port))
        .matching(Match::Tcp)
        .matching(Match::DlDst(att.vm_mac))
        .matching(Match::NwSrc(md.ip))
        .matching(Match::NwDst(nat))
        .matching(Match::TpSrc(HTTP_PORT))
        .action(Action::ModNwSrc(md.ip))
        .action(Action::ModDlDst(att.vm_mac))
        .action(Action::Output(att.vm_port));

    vec![guest_arp, metadata_arp, guest_request, metadata_reply]
}

/// Installs the catch-all rule that keeps `bridge` forwarding as a plain L2
/// switch.
pub fn install_default_flow(
    switch: &dyn SwitchControl,
    log: &Logger,
    bridge: &str,
) -> Result<(), OvsError> {
    let flow = Flow::new(PRIO_DEFAULT).action(Action::Normal);
    switch.add_flow(bridge, &flow)?;
    info!(log, "installed default flow"; "bridge" => bridge);
    Ok(())
}

/// Installs the metadata rules for one attachment.
///
/// If any rule fails, rules already installed for the attachment are removed
/// again before the error is returned.
pub fn install_metadata_flows(
    switch: &dyn SwitchControl,
    log: &Logger,
    bridge: &str,
    md: &MetadataEndpoint,
    att: &Attachment,
) -> Result<(), OvsError> {
    for flow in metadata_flows(md, att) {
        if let Err(e) = switch.add_flow(bridge, &flow) {
            warn!(log, "metadata flow install failed";
                "bridge" => bridge,
                "priority" => flow.priority,
                "error" => %e);
            if let Err(cleanup) = switch.del_flows(bridge, flow.cookie) {
                warn!(log, "failed to remove partial metadata flows";
                    "error" => %cleanup);
            }
            return Err(e);
        }
    }

    info!(log, "installed metadata flows";
        "bridge" => bridge,
        "vm_mac" => %att.vm_mac,
        "vm_port" => att.vm_port,
        "nat" => %nat_address(att.vm_port));
    Ok(())
}

/// Removes every rule installed for the guest on `vm_port`.
pub fn remove_metadata_flows(
    switch: &dyn SwitchControl,
    log: &Logger,
    bridge: &str,
    vm_port: u16,
) -> Result<(), OvsError> {
    switch.del_flows(bridge, attachment_cookie(vm_port))?;
    info!(log, "removed metadata flows";
        "bridge" => bridge,
        "vm_port" => vm_port);
    Ok(())
}
