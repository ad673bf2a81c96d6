// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named network namespaces for host-side service endpoints.
//!
//! Switching network namespace changes the calling thread's view of the
//! network, so every switch happens on the dedicated [`NamespaceWorker`]
//! thread. A namespace is created once and then left alone: if one with the
//! requested name exists, its configuration is not compared against the
//! request.

use std::fs::File;
use std::net::Ipv4Addr;

use nightlight_types::MacAddr;
use slog::{info, warn, Logger};
use thiserror::Error;

mod sys;
mod worker;

pub use sys::HostNamespaces;
pub use worker::NamespaceWorker;

/// Longest interface name the kernel accepts.
const IFNAMSIZ: usize = 16;

#[derive(Debug, Error)]
pub enum NetnsError {
    #[error("network namespaces are not supported on this platform")]
    Unsupported,

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("invalid namespace name {0:?}")]
    InvalidName(String),

    #[error("namespace worker is not running")]
    WorkerGone,
}

/// An open reference to a network namespace.
#[derive(Debug)]
pub struct NsHandle {
    file: Option<File>,
    label: String,
}

impl NsHandle {
    pub(crate) fn from_file(file: File, label: impl Into<String>) -> Self {
        Self { file: Some(file), label: label.into() }
    }

    /// A handle with no backing descriptor, for use with fake
    /// [`NamespaceOps`] implementations.
    pub fn detached(label: impl Into<String>) -> Self {
        Self { file: None, label: label.into() }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

/// The namespace and link primitives [`ensure_namespace`] is built from.
///
/// Link operations act on whatever namespace the calling thread is in.
#[cfg_attr(test, mockall::automock)]
pub trait NamespaceOps: Send {
    fn exists(&self, name: &str) -> Result<bool, NetnsError>;

    /// A handle to the calling thread's current namespace.
    fn current(&self) -> Result<NsHandle, NetnsError>;

    /// Creates and pins the named namespace. The calling thread is left
    /// inside it.
    fn create(&self, name: &str) -> Result<NsHandle, NetnsError>;

    fn enter(&self, ns: &NsHandle) -> Result<(), NetnsError>;

    fn move_link(&self, link: &str, ns: &NsHandle) -> Result<(), NetnsError>;

    fn set_link_mac(&self, link: &str, mac: MacAddr) -> Result<(), NetnsError>;

    fn add_link_addr(
        &self,
        link: &str,
        ip: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), NetnsError>;

    fn set_link_up(&self, link: &str) -> Result<(), NetnsError>;

    /// Adds a default route out `link` with no gateway.
    fn add_default_route(&self, link: &str) -> Result<(), NetnsError>;
}

/// A namespace holding a single link of the same name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceRequest {
    pub name: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl NamespaceRequest {
    pub fn new(name: impl Into<String>, mac: MacAddr, ip: Ipv4Addr) -> Self {
        Self { name: name.into(), mac, ip, prefix_len: 24 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

fn validate_name(name: &str) -> Result<(), NetnsError> {
    let ok = !name.is_empty()
        && name.len() < IFNAMSIZ
        && name != "."
        && name != ".."
        && !name.contains(['/', '\0'])
        && !name.chars().any(char::is_whitespace);
    if ok {
        Ok(())
    } else {
        Err(NetnsError::InvalidName(name.to_owned()))
    }
}

/// Re-enters the original namespace when dropped.
struct RestoreOnDrop<'a> {
    ops: &'a dyn NamespaceOps,
    orig: &'a NsHandle,
    log: &'a Logger,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ops.enter(self.orig) {
            warn!(self.log, "failed to restore original namespace";
                "error" => %e);
        }
    }
}

/// Creates the namespace described by `req` unless one of that name exists.
///
/// The calling thread's namespace is restored on every path out of this
/// function. Callers must not share the thread with other work while this
/// runs; [`NamespaceWorker::ensure`] provides that.
pub fn ensure_namespace(
    ops: &dyn NamespaceOps,
    log: &Logger,
    req: &NamespaceRequest,
) -> Result<EnsureOutcome, NetnsError> {
    validate_name(&req.name)?;

    if ops.exists(&req.name)? {
        info!(log, "namespace already exists"; "name" => &req.name);
        return Ok(EnsureOutcome::AlreadyExists);
    }

    let orig = ops.current()?;
    let _restore = RestoreOnDrop { ops, orig: &orig, log };

    let ns = ops.create(&req.name)?;

    // The link lives in the original namespace until moved.
    ops.enter(&orig)?;
    ops.move_link(&req.name, &ns)?;
    ops.enter(&ns)?;

    ops.set_link_mac(&req.name, req.mac)?;
    ops.add_link_addr(&req.name, req.ip, req.prefix_len)?;
    ops.set_link_up(&req.name)?;
    ops.add_default_route(&req.name)?;

    info!(log, "created namespace";
        "name" => &req.name,
        "mac" => %req.mac,
        "ip" => %req.ip);
    Ok(EnsureOutcome::Created)
}
