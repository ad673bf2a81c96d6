// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the hypervisor management daemon.

use std::time::Duration;

use nightlight_types::PowerState;
use slog::{info, warn, Logger};
use thiserror::Error;
use uuid::Uuid;

mod libvirt;

pub use libvirt::LibvirtClient;

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("hypervisor daemon at {uri} is unreachable: {detail}")]
    Unreachable { uri: String, detail: String },

    #[error("hypervisor rejected {op}: {detail}")]
    Rejected { op: &'static str, detail: String },

    #[error("domain {0} not found")]
    NotFound(String),

    #[error("domain {name} did not power off within {waited:?}")]
    ShutdownTimeout { name: String, waited: Duration },
}

/// Operations on domains known to the hypervisor. Domains are addressed by
/// name.
#[cfg_attr(test, mockall::automock)]
pub trait Hypervisor: Send + Sync {
    /// Registers a persistent domain from its XML definition.
    fn define(&self, xml: &str) -> Result<(), HypervisorError>;

    fn start(&self, name: &str) -> Result<(), HypervisorError>;

    /// Asks the guest to power off. Returns once the request is delivered.
    fn shutdown(&self, name: &str) -> Result<(), HypervisorError>;

    fn reboot(&self, name: &str) -> Result<(), HypervisorError>;

    fn reset(&self, name: &str) -> Result<(), HypervisorError>;

    /// Forcibly powers the domain off.
    fn destroy(&self, name: &str) -> Result<(), HypervisorError>;

    /// Removes the domain's definition, including firmware variable stores.
    fn undefine(&self, name: &str) -> Result<(), HypervisorError>;

    fn attach_device(
        &self,
        name: &str,
        xml: &str,
    ) -> Result<(), HypervisorError>;

    /// Sends USB HID usage codes, pressed together as one chord.
    fn send_keys(
        &self,
        name: &str,
        codes: &[u32],
    ) -> Result<(), HypervisorError>;

    /// The UUID of a defined domain, or `None` if no such domain exists.
    fn lookup(&self, name: &str) -> Result<Option<Uuid>, HypervisorError>;

    fn power_state(&self, name: &str) -> Result<PowerState, HypervisorError>;

    /// Device names of every disk, CD-ROM and floppy drive in the live
    /// definition of the domain.
    fn disk_targets(
        &self,
        name: &str,
    ) -> Result<Vec<String>, HypervisorError>;
}

/// Reads `dev` from the `<target>` of each `<disk>` in a domain definition.
pub fn disk_targets_in(xml: &str) -> Vec<String> {
    xml.split("<disk ")
        .skip(1)
        .filter_map(|disk| {
            let disk = disk.split("</disk>").next()?;
            let target = &disk[disk.find("<target ")?..];
            let target = &target[..target.find('>')?];
            attr(target, "dev")
        })
        .map(str::to_owned)
        .collect()
}

fn attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    ['\'', '"'].into_iter().find_map(|q| {
        let key = format!(" {name}={q}");
        let start = tag.find(&key)? + key.len();
        let len = tag[start..].find(q)?;
        Some(&tag[start..start + len])
    })
}

/// How long [`destroy_gracefully`] waits for a guest to power itself off.
#[derive(Clone, Copy, Debug)]
pub struct ShutdownWait {
    pub timeout: Duration,
    pub initial_interval: Duration,
}

impl ShutdownWait {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, initial_interval: Duration::from_millis(500) }
    }
}

fn wait_for_power_off(
    hv: &dyn Hypervisor,
    name: &str,
    wait: ShutdownWait,
) -> Result<(), HypervisorError> {
    let poll = || -> Result<(), backoff::Error<HypervisorError>> {
        match hv.power_state(name).map_err(backoff::Error::Permanent)? {
            PowerState::Off => Ok(()),
            _ => Err(backoff::Error::transient(
                HypervisorError::ShutdownTimeout {
                    name: name.to_owned(),
                    waited: wait.timeout,
                },
            )),
        }
    };

    let backoff = backoff::ExponentialBackoff {
        initial_interval: wait.initial_interval,
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(wait.timeout),
        ..Default::default()
    };
    backoff::retry(backoff, poll).map_err(|e| match e {
        backoff::Error::Permanent(e) => e,
        backoff::Error::Transient { err, .. } => err,
    })
}

/// Stops a domain, letting a running guest shut down cleanly before it is
/// destroyed.
///
/// A running guest is asked to shut down and given `wait.timeout` to power
/// off; a guest that is already off is destroyed directly. If its state
/// cannot be read the domain is destroyed anyway.
pub fn destroy_gracefully(
    hv: &dyn Hypervisor,
    log: &Logger,
    name: &str,
    wait: ShutdownWait,
) -> Result<(), HypervisorError> {
    match hv.power_state(name) {
        Ok(PowerState::On) => {
            info!(log, "shutting down domain"; "domain" => name);
            match hv.shutdown(name) {
                Ok(()) => {
                    if let Err(e) = wait_for_power_off(hv, name, wait) {
                        warn!(log, "guest did not power off, destroying";
                            "domain" => name,
                            "error" => %e);
                    }
                }
                Err(e) => {
                    warn!(log, "shutdown request failed, destroying";
                        "domain" => name,
                        "error" => %e);
                }
            }
        }
        Ok(state) => {
            info!(log, "domain not running"; "domain" => name,
                "state" => %state);
        }
        Err(HypervisorError::NotFound(_)) => {
            return Err(HypervisorError::NotFound(name.to_owned()));
        }
        Err(e) => {
            warn!(log, "could not read power state, destroying";
                "domain" => name,
                "error" => %e);
        }
    }

    match hv.destroy(name) {
        Ok(()) => {}
        // The daemon refuses to destroy a domain that is already off.
        Err(e) => match hv.power_state(name) {
            Ok(PowerState::Off) => {}
            _ => return Err(e),
        },
    }
    info!(log, "domain destroyed"; "domain" => name);
    Ok(())
}
