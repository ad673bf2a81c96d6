// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use nightlight_types::MacAddr;
use slog::{debug, Logger};

use crate::{Flow, InterfaceOptions, OvsError, SwitchControl};

/// [`SwitchControl`] backed by the `ovs-vsctl` and `ovs-ofctl` utilities.
pub struct OvsClient {
    vsctl: Utf8PathBuf,
    ofctl: Utf8PathBuf,
    log: Logger,
}

impl OvsClient {
    pub fn new(
        vsctl: impl Into<Utf8PathBuf>,
        ofctl: impl Into<Utf8PathBuf>,
        log: Logger,
    ) -> Self {
        Self { vsctl: vsctl.into(), ofctl: ofctl.into(), log }
    }

    fn vsctl(&self, args: &[String]) -> Result<String, OvsError> {
        run(&self.log, &self.vsctl, args)
    }

    fn ofctl(&self, args: &[String]) -> Result<String, OvsError> {
        run(&self.log, &self.ofctl, args)
    }
}

fn run(
    log: &Logger,
    program: &Utf8Path,
    args: &[String],
) -> Result<String, OvsError> {
    debug!(log, "running switch command"; "cmd" => %program, "args" => ?args);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| OvsError::Spawn {
            cmd: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(OvsError::Command {
            cmd: program.to_string(),
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses an `ofport` column value. Unassigned ports read back as `-1` or
/// an empty set.
fn parse_ofport(raw: &str) -> Option<u16> {
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<i32>().ok())
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

impl SwitchControl for OvsClient {
    fn add_bridge(&self, bridge: &str) -> Result<(), OvsError> {
        self.vsctl(&owned(&["--may-exist", "add-br", bridge]))?;
        Ok(())
    }

    fn del_bridge(&self, bridge: &str) -> Result<(), OvsError> {
        self.vsctl(&owned(&["--if-exists", "del-br", bridge]))?;
        Ok(())
    }

    fn add_port(&self, bridge: &str, port: &str) -> Result<(), OvsError> {
        self.vsctl(&owned(&["--may-exist", "add-port", bridge, port]))?;
        Ok(())
    }

    fn set_interface(
        &self,
        iface: &str,
        opts: &InterfaceOptions,
    ) -> Result<(), OvsError> {
        let cols = opts.to_args();
        if cols.is_empty() {
            return Ok(());
        }
        let mut args = owned(&["set", "Interface", iface]);
        args.extend(cols);
        self.vsctl(&args)?;
        Ok(())
    }

    fn ofport_by_name(&self, iface: &str) -> Result<u16, OvsError> {
        let out = self.vsctl(&owned(&["get", "Interface", iface, "ofport"]))?;
        parse_ofport(&out).ok_or_else(|| OvsError::NoPort(iface.to_owned()))
    }

    fn ofport_by_attached_mac(
        &self,
        mac: MacAddr,
    ) -> Result<Option<u16>, OvsError> {
        let out = self.vsctl(&[
            "--bare".to_owned(),
            "--columns=ofport".to_owned(),
            "find".to_owned(),
            "Interface".to_owned(),
            format!("external_ids:attached-mac=\"{mac}\""),
        ])?;
        Ok(parse_ofport(&out))
    }

    fn add_flow(&self, bridge: &str, flow: &Flow) -> Result<(), OvsError> {
        self.ofctl(&[
            "add-flow".to_owned(),
            bridge.to_owned(),
            flow.to_string(),
        ])?;
        Ok(())
    }

    fn del_flows(&self, bridge: &str, cookie: u64) -> Result<(), OvsError> {
        self.ofctl(&[
            "del-flows".to_owned(),
            bridge.to_owned(),
            format!("cookie={cookie:#x}/-1"),
        ])?;
        Ok(())
    }
}
