// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use nightlight_types::MacAddr;
use slog::Logger;

use crate::{NamespaceOps, NetnsError, NsHandle};

/// [`NamespaceOps`] for the running host: namespaces pinned under
/// `/var/run/netns` (where `ip netns` looks for them) and links configured
/// with `ip`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub struct HostNamespaces {
    ip: Utf8PathBuf,
    run_dir: Utf8PathBuf,
    log: Logger,
}

impl HostNamespaces {
    pub fn new(log: Logger) -> Self {
        Self { ip: "ip".into(), run_dir: "/var/run/netns".into(), log }
    }

    pub fn with_ip_command(mut self, ip: impl Into<Utf8PathBuf>) -> Self {
        self.ip = ip.into();
        self
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::fs::{self, File};
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;
    use std::process::{Command, Stdio};

    use slog::debug;

    use super::*;

    const THREAD_NS: &str = "/proc/thread-self/ns/net";

    fn os_err(op: &'static str) -> NetnsError {
        NetnsError::Os { op, source: std::io::Error::last_os_error() }
    }

    fn cstr(path: &camino::Utf8Path) -> Result<CString, NetnsError> {
        CString::new(path.as_os_str().as_bytes()).map_err(|e| NetnsError::Os {
            op: "path conversion",
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })
    }

    impl HostNamespaces {
        // Spawned from the calling thread, so `ip` runs in that thread's
        // namespace.
        fn ip(&self, args: &[String]) -> Result<(), NetnsError> {
            debug!(self.log, "running ip"; "args" => ?args);
            let output = Command::new(&self.ip)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .map_err(|source| NetnsError::Os { op: "spawn ip", source })?;
            if !output.status.success() {
                return Err(NetnsError::Command {
                    cmd: format!("{} {}", self.ip, args.join(" ")),
                    stderr: String::from_utf8_lossy(&output.stderr)
                        .trim()
                        .to_owned(),
                });
            }
            Ok(())
        }

        fn pin(&self, target: &camino::Utf8Path) -> Result<(), NetnsError> {
            let src = CString::new(THREAD_NS).map_err(|e| NetnsError::Os {
                op: "path conversion",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    e,
                ),
            })?;
            let dst = cstr(target)?;
            // SAFETY: both paths are valid NUL-terminated strings and the
            // remaining arguments are permitted to be null for MS_BIND.
            let res = unsafe {
                libc::mount(
                    src.as_ptr(),
                    dst.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND,
                    std::ptr::null(),
                )
            };
            if res != 0 {
                return Err(os_err("bind mount namespace"));
            }
            Ok(())
        }
    }

    impl NamespaceOps for HostNamespaces {
        fn exists(&self, name: &str) -> Result<bool, NetnsError> {
            Ok(self.run_dir.join(name).exists())
        }

        fn current(&self) -> Result<NsHandle, NetnsError> {
            let file = File::open(THREAD_NS)
                .map_err(|source| NetnsError::Os { op: "open", source })?;
            Ok(NsHandle::from_file(file, "current"))
        }

        fn create(&self, name: &str) -> Result<NsHandle, NetnsError> {
            fs::create_dir_all(&self.run_dir).map_err(|source| {
                NetnsError::Os { op: "create netns directory", source }
            })?;
            let path = self.run_dir.join(name);
            File::create(&path)
                .map_err(|source| NetnsError::Os { op: "create", source })?;

            // SAFETY: unshare(2) with only CLONE_NEWNET touches nothing but
            // the calling thread's namespace membership.
            if unsafe { libc::unshare(libc::CLONE_NEWNET) } != 0 {
                let err = os_err("unshare");
                let _ = fs::remove_file(&path);
                return Err(err);
            }

            if let Err(e) = self.pin(&path) {
                let _ = fs::remove_file(&path);
                return Err(e);
            }

            let file = File::open(&path)
                .map_err(|source| NetnsError::Os { op: "open", source })?;
            Ok(NsHandle::from_file(file, name))
        }

        fn enter(&self, ns: &NsHandle) -> Result<(), NetnsError> {
            let file = ns.file().ok_or(NetnsError::Unsupported)?;
            // SAFETY: the descriptor is owned by `ns` and stays open for the
            // duration of the call.
            if unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) }
                != 0
            {
                return Err(os_err("setns"));
            }
            Ok(())
        }

        fn move_link(
            &self,
            link: &str,
            ns: &NsHandle,
        ) -> Result<(), NetnsError> {
            self.ip(&[
                "link".to_owned(),
                "set".to_owned(),
                "dev".to_owned(),
                link.to_owned(),
                "netns".to_owned(),
                ns.label().to_owned(),
            ])
        }

        fn set_link_mac(
            &self,
            link: &str,
            mac: MacAddr,
        ) -> Result<(), NetnsError> {
            self.ip(&[
                "link".to_owned(),
                "set".to_owned(),
                "dev".to_owned(),
                link.to_owned(),
                "address".to_owned(),
                mac.to_string(),
            ])
        }

        fn add_link_addr(
            &self,
            link: &str,
            ip: Ipv4Addr,
            prefix_len: u8,
        ) -> Result<(), NetnsError> {
            self.ip(&[
                "addr".to_owned(),
                "add".to_owned(),
                format!("{ip}/{prefix_len}"),
                "dev".to_owned(),
                link.to_owned(),
            ])
        }

        fn set_link_up(&self, link: &str) -> Result<(), NetnsError> {
            self.ip(&[
                "link".to_owned(),
                "set".to_owned(),
                "dev".to_owned(),
                link.to_owned(),
                "up".to_owned(),
            ])
        }

        fn add_default_route(&self, link: &str) -> Result<(), NetnsError> {
            self.ip(&[
                "route".to_owned(),
                "add".to_owned(),
                "default".to_owned(),
                "dev".to_owned(),
                link.to_owned(),
            ])
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod compat {
    #![allow(unused)]

    use super::*;

    impl NamespaceOps for HostNamespaces {
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
        fn move_link(
            &self,
            _link: &str,
            _ns: &NsHandle,
        ) -> Result<(), NetnsError> {
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
}
