// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host control plane for Nightlight guests: provisions disk images, renders
//! domain definitions, drives the hypervisor, and programs the virtual
//! switch so each guest can reach the metadata service.

#![allow(clippy::style)]

pub mod alloc;
pub mod disk;
pub mod domain;
pub mod error;
pub mod hypervisor;
pub mod keys;
pub mod lifecycle;
pub mod network;
pub mod outcome;

#[cfg(test)]
mod test_support;

pub use error::Error;
pub use lifecycle::{InstanceManager, LifecycleRequest, RequestDeniedReason};
pub use outcome::{DeviceOutcome, DeviceStatus, ProvisionReport};

/// Version string reported by the command line tool.
pub fn version() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}
