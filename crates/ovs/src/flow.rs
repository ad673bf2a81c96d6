// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OpenFlow rules in the textual form accepted by `ovs-ofctl add-flow`.

use std::fmt::{self, Display};
use std::net::Ipv4Addr;

use nightlight_types::MacAddr;

/// ARP opcodes as carried in `arp_op`.
pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// Nicira extensible match fields used as `move`/`load` operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Field {
    #[strum(serialize = "NXM_OF_ETH_SRC")]
    EthSrc,
    #[strum(serialize = "NXM_OF_ETH_DST")]
    EthDst,
    #[strum(serialize = "NXM_OF_ARP_OP")]
    ArpOp,
    #[strum(serialize = "NXM_NX_ARP_SHA")]
    ArpSha,
    #[strum(serialize = "NXM_NX_ARP_THA")]
    ArpTha,
    #[strum(serialize = "NXM_OF_ARP_SPA")]
    ArpSpa,
    #[strum(serialize = "NXM_OF_ARP_TPA")]
    ArpTpa,
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.into();
        write!(f, "{name}[]")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Match {
    InPort(u16),
    Arp,
    Tcp,
    DlSrc(MacAddr),
    DlDst(MacAddr),
    ArpOp(u16),
    ArpSpa(Ipv4Addr),
    ArpTpa(Ipv4Addr),
    NwSrc(Ipv4Addr),
    NwDst(Ipv4Addr),
    TpSrc(u16),
    TpDst(u16),
}

impl Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::InPort(p) => write!(f, "in_port={p}"),
            Match::Arp => write!(f, "arp"),
            Match::Tcp => write!(f, "tcp"),
            Match::DlSrc(m) => write!(f, "dl_src={m}"),
            Match::DlDst(m) => write!(f, "dl_dst={m}"),
            Match::ArpOp(op) => write!(f, "arp_op={op}"),
            Match::ArpSpa(a) => write!(f, "arp_spa={a}"),
            Match::ArpTpa(a) => write!(f, "arp_tpa={a}"),
            Match::NwSrc(a) => write!(f, "nw_src={a}"),
            Match::NwDst(a) => write!(f, "nw_dst={a}"),
            Match::TpSrc(p) => write!(f, "tp_src={p}"),
            Match::TpDst(p) => write!(f, "tp_dst={p}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Ordinary L2 learning switch behaviour.
    Normal,
    /// Send back out the port the packet arrived on.
    InPort,
    Output(u16),
    Move { src: Field, dst: Field },
    Load { value: u64, dst: Field },
    ModDlSrc(MacAddr),
    ModDlDst(MacAddr),
    ModNwSrc(Ipv4Addr),
    /// Commit the connection in `zone`, optionally source-NATing it, and
    /// continue in `table`.
    CtCommit { zone: u16, snat: Option<Ipv4Addr>, table: Option<u8> },
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Normal => write!(f, "normal"),
            Action::InPort => write!(f, "in_port"),
            Action::Output(p) => write!(f, "output:{p}"),
            Action::Move { src, dst } => write!(f, "move:{src}->{dst}"),
            Action::Load { value, dst } => write!(f, "load:{value:#x}->{dst}"),
            Action::ModDlSrc(m) => write!(f, "mod_dl_src:{m}"),
            Action::ModDlDst(m) => write!(f, "mod_dl_dst:{m}"),
            Action::ModNwSrc(a) => write!(f, "mod_nw_src:{a}"),
            Action::CtCommit { zone, snat, table } => {
                write!(f, "ct(commit,zone={zone}")?;
                if let Some(addr) = snat {
                    write!(f, ",nat(src={addr})")?;
                }
                if let Some(t) = table {
                    write!(f, ",table={t}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A single flow table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flow {
    pub table: u8,
    pub priority: u16,
    pub cookie: u64,
    pub matches: Vec<Match>,
    pub actions: Vec<Action>,
}

impl Flow {
    pub fn new(priority: u16) -> Self {
        Self {
            table: 0,
            priority,
            cookie: 0,
            matches: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn matching(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    pub fn action(mut self, a: Action) -> Self {
        self.actions.push(a);
        self
    }
}

impl Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={},priority={}", self.table, self.priority)?;
        if self.cookie != 0 {
            write!(f, ",cookie={:#x}", self.cookie)?;
        }
        for m in &self.matches {
            write!(f, ",{m}")?;
        }
        write!(f, ",actions=")?;
        if self.actions.is_empty() {
            return write!(f, "drop");
        }
        for (i, a) in self.actions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{a}")?;
        }
        Ok(())
    }
}

/// Loadable immediate for an IPv4 address.
pub fn ip_value(addr: Ipv4Addr) -> u64 {
    u64::from(u32::from(addr))
}
