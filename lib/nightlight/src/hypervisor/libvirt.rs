// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use nightlight_types::PowerState;
use slog::{debug, info, warn, Logger};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::sys;

use super::{disk_targets_in, Hypervisor, HypervisorError};

/// A [`Hypervisor`] speaking the libvirt RPC protocol over the daemon's
/// unix socket.
///
/// One connection is opened by [`LibvirtClient::connect`] and shared by
/// every operation for the life of the client.
pub struct LibvirtClient {
    conn: Connect,
    uri: String,
    log: Logger,
}

impl LibvirtClient {
    /// Opens the connection, retrying for up to the configured connect
    /// timeout while the daemon is not yet accepting connections.
    pub fn connect(
        cfg: &nightlight_config::Hypervisor,
        log: Logger,
    ) -> Result<Self, HypervisorError> {
        // Errors are surfaced through results; keep libvirt off stderr.
        virt::error::clear_error_callback();

        let uri = cfg.connect_uri();
        let dial = || -> Result<Connect, backoff::Error<HypervisorError>> {
            Connect::open(Some(uri.as_str())).map_err(|e| {
                debug!(log, "hypervisor connection failed";
                    "uri" => &uri,
                    "error" => %e);
                backoff::Error::transient(HypervisorError::Unreachable {
                    uri: uri.clone(),
                    detail: e.to_string(),
                })
            })
        };
        let backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Some(cfg.connect_timeout()),
            ..Default::default()
        };
        let conn = backoff::retry(backoff, dial).map_err(|e| match e {
            backoff::Error::Permanent(e) => e,
            backoff::Error::Transient { err, .. } => err,
        })?;

        info!(log, "connected to hypervisor"; "uri" => &uri);
        Ok(Self { conn, uri, log })
    }

    /// Verifies the connection is still usable.
    pub fn health_check(&self) -> Result<(), HypervisorError> {
        match self.conn.is_alive() {
            Ok(true) => Ok(()),
            Ok(false) => Err(HypervisorError::Unreachable {
                uri: self.uri.clone(),
                detail: "connection is no longer alive".to_owned(),
            }),
            Err(e) => Err(self.classify("keepalive", "", e)),
        }
    }

    fn classify(
        &self,
        op: &'static str,
        name: &str,
        e: virt::error::Error,
    ) -> HypervisorError {
        classify(&self.uri, op, name, e.code(), e.to_string())
    }

    fn domain(
        &self,
        op: &'static str,
        name: &str,
    ) -> Result<Domain, HypervisorError> {
        Domain::lookup_by_name(&self.conn, name)
            .map_err(|e| self.classify(op, name, e))
    }
}

impl Drop for LibvirtClient {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            warn!(self.log, "failed to close hypervisor connection";
                "error" => %e);
        }
    }
}

fn classify(
    uri: &str,
    op: &'static str,
    name: &str,
    code: ErrorNumber,
    detail: String,
) -> HypervisorError {
    match code {
        ErrorNumber::NoDomain => HypervisorError::NotFound(name.to_owned()),
        ErrorNumber::NoConnect | ErrorNumber::InvalidConn => {
            HypervisorError::Unreachable { uri: uri.to_owned(), detail }
        }
        _ => HypervisorError::Rejected { op, detail },
    }
}

fn power_state_from(state: sys::virDomainState) -> PowerState {
    match state {
        sys::VIR_DOMAIN_RUNNING
        | sys::VIR_DOMAIN_BLOCKED
        | sys::VIR_DOMAIN_SHUTDOWN => PowerState::On,
        sys::VIR_DOMAIN_SHUTOFF => PowerState::Off,
        sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_PMSUSPENDED => {
            PowerState::Paused
        }
        sys::VIR_DOMAIN_CRASHED => PowerState::Crashed,
        _ => PowerState::Unknown,
    }
}

impl Hypervisor for LibvirtClient {
    fn define(&self, xml: &str) -> Result<(), HypervisorError> {
        let dom = Domain::define_xml(&self.conn, xml)
            .map_err(|e| self.classify("define", "", e))?;
        if let Ok(name) = dom.get_name() {
            debug!(self.log, "defined domain"; "domain" => name);
        }
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain("start", name)?
            .create()
            .map_err(|e| self.classify("start", name, e))?;
        Ok(())
    }

    fn shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain("shutdown", name)?
            .shutdown()
            .map_err(|e| self.classify("shutdown", name, e))?;
        Ok(())
    }

    fn reboot(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain("reboot", name)?
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(|e| self.classify("reboot", name, e))?;
        Ok(())
    }

    fn reset(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain("reset", name)?
            .reset()
            .map_err(|e| self.classify("reset", name, e))?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain("destroy", name)?
            .destroy()
            .map_err(|e| self.classify("destroy", name, e))?;
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain("undefine", name)?
            .undefine_flags(
                sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE
                    | sys::VIR_DOMAIN_UNDEFINE_NVRAM,
            )
            .map_err(|e| self.classify("undefine", name, e))?;
        Ok(())
    }

    fn attach_device(
        &self,
        name: &str,
        xml: &str,
    ) -> Result<(), HypervisorError> {
        self.domain("attach-device", name)?
            .attach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_CURRENT as u32)
            .map_err(|e| self.classify("attach-device", name, e))?;
        Ok(())
    }

    fn send_keys(
        &self,
        name: &str,
        codes: &[u32],
    ) -> Result<(), HypervisorError> {
        let mut codes = codes.to_vec();
        self.domain("send-key", name)?
            .send_key(
                sys::VIR_KEYCODE_SET_USB as u32,
                0,
                codes.as_mut_ptr(),
                codes.len() as i32,
                0,
            )
            .map_err(|e| self.classify("send-key", name, e))?;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Option<Uuid>, HypervisorError> {
        let dom = match self.domain("lookup", name) {
            Ok(dom) => dom,
            Err(HypervisorError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let uuid = dom
            .get_uuid_string()
            .map_err(|e| self.classify("lookup", name, e))?;
        Uuid::parse_str(&uuid).map(Some).map_err(|_| {
            HypervisorError::Rejected {
                op: "lookup",
                detail: format!("unparseable uuid {uuid:?}"),
            }
        })
    }

    fn power_state(&self, name: &str) -> Result<PowerState, HypervisorError> {
        let (state, _reason) = self
            .domain("domstate", name)?
            .get_state()
            .map_err(|e| self.classify("domstate", name, e))?;
        Ok(power_state_from(state))
    }

    fn disk_targets(
        &self,
        name: &str,
    ) -> Result<Vec<String>, HypervisorError> {
        let xml = self
            .domain("dumpxml", name)?
            .get_xml_desc(0)
            .map_err(|e| self.classify("dumpxml", name, e))?;
        Ok(disk_targets_in(&xml))
    }
}
