// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use netns::NetnsError;
use nightlight_types::BootOrderError;
use ovs::OvsError;
use thiserror::Error;

use crate::alloc::AllocError;
use crate::disk::DiskError;
use crate::domain::BuildError;
use crate::hypervisor::HypervisorError;
use crate::lifecycle::RequestDeniedReason;

/// Errors returned by control-plane operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("allocation exhausted: {0}")]
    AllocationExhausted(String),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("external daemon unreachable: {0}")]
    ExternalDaemonUnreachable(String),

    #[error("{daemon} rejected {op}: {detail}")]
    ExternalDaemonRejected {
        daemon: &'static str,
        op: String,
        detail: String,
    },

    #[error("{context}: {source}")]
    FilesystemFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request denied: {0}")]
    RequestDenied(#[from] RequestDeniedReason),

    #[error("instance {0} not found")]
    NotFound(String),

    #[error("instance {0} is already defined")]
    AlreadyExists(String),
}

impl Error {
    pub(crate) fn fs(
        context: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FilesystemFailure { context: context.into(), source }
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::UnsupportedBus(_)
            | AllocError::NotInPool { .. }
            | AllocError::InUse(_) => {
                Error::UnsupportedConfiguration(e.to_string())
            }
            AllocError::Exhausted { .. } | AllocError::Entropy(_) => {
                Error::AllocationExhausted(e.to_string())
            }
        }
    }
}

impl From<BootOrderError> for Error {
    fn from(e: BootOrderError) -> Self {
        Error::UnsupportedConfiguration(e.to_string())
    }
}

impl From<BuildError> for Error {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::BootOrder(e) => e.into(),
            BuildError::Mac(e) => e.into(),
        }
    }
}

impl From<HypervisorError> for Error {
    fn from(e: HypervisorError) -> Self {
        match e {
            HypervisorError::Unreachable { .. } => {
                Error::ExternalDaemonUnreachable(e.to_string())
            }
            HypervisorError::Rejected { op, detail } => {
                Error::ExternalDaemonRejected {
                    daemon: "hypervisor",
                    op: op.to_owned(),
                    detail,
                }
            }
            HypervisorError::NotFound(name) => Error::NotFound(name),
            HypervisorError::ShutdownTimeout { .. } => {
                Error::ExternalDaemonRejected {
                    daemon: "hypervisor",
                    op: "shutdown".to_owned(),
                    detail: e.to_string(),
                }
            }
        }
    }
}

impl From<OvsError> for Error {
    fn from(e: OvsError) -> Self {
        match e {
            OvsError::Spawn { .. } => {
                Error::ExternalDaemonUnreachable(e.to_string())
            }
            OvsError::Command { cmd, args, stderr } => {
                Error::ExternalDaemonRejected {
                    daemon: "virtual switch",
                    op: format!("{cmd} {args}"),
                    detail: stderr,
                }
            }
            OvsError::Parse { .. } | OvsError::NoPort(_) => {
                Error::ExternalDaemonRejected {
                    daemon: "virtual switch",
                    op: "query".to_owned(),
                    detail: e.to_string(),
                }
            }
        }
    }
}

impl From<NetnsError> for Error {
    fn from(e: NetnsError) -> Self {
        match e {
            NetnsError::Unsupported | NetnsError::InvalidName(_) => {
                Error::UnsupportedConfiguration(e.to_string())
            }
            NetnsError::Os { op, source } => {
                Error::fs(format!("namespace {op} failed"), source)
            }
            NetnsError::Command { cmd, stderr } => {
                Error::ExternalDaemonRejected {
                    daemon: "ip",
                    op: cmd,
                    detail: stderr,
                }
            }
            NetnsError::WorkerGone => {
                Error::ExternalDaemonUnreachable(e.to_string())
            }
        }
    }
}

impl From<DiskError> for Error {
    fn from(e: DiskError) -> Self {
        match e {
            DiskError::Spawn { .. } => {
                Error::ExternalDaemonUnreachable(e.to_string())
            }
            DiskError::Command { cmd, stderr } => {
                Error::ExternalDaemonRejected {
                    daemon: "qemu-img",
                    op: cmd,
                    detail: stderr,
                }
            }
            DiskError::Copy { src, dst, source } => {
                Error::fs(format!("failed to copy {src} to {dst}"), source)
            }
        }
    }
}
