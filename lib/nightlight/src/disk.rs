// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backing image creation for storage disks.

use std::collections::BTreeMap;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use nightlight_types::{DeviceRef, StorageDisk};
use slog::{error, info, warn, Logger};
use thiserror::Error;

use crate::alloc::DiskTargetAllocator;
use crate::outcome::DeviceOutcome;
use crate::Error;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("failed to run {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("failed to copy {src} to {dst}: {source}")]
    Copy {
        src: Utf8PathBuf,
        dst: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Creates and copies disk image files.
#[cfg_attr(test, mockall::automock)]
pub trait ImageTool: Send + Sync {
    /// Creates a thin-provisioned qcow2 image of `size_gb` gigabytes.
    fn create_qcow2(
        &self,
        path: &Utf8Path,
        size_gb: u64,
    ) -> Result<(), DiskError>;

    /// Copies `src` byte-for-byte to `dst`.
    fn clone_image(
        &self,
        src: &Utf8Path,
        dst: &Utf8Path,
    ) -> Result<(), DiskError>;
}

/// [`ImageTool`] backed by `qemu-img`.
pub struct QemuImg {
    binary: Utf8PathBuf,
    log: Logger,
}

impl QemuImg {
    pub fn new(binary: impl Into<Utf8PathBuf>, log: Logger) -> Self {
        Self { binary: binary.into(), log }
    }
}

impl ImageTool for QemuImg {
    fn create_qcow2(
        &self,
        path: &Utf8Path,
        size_gb: u64,
    ) -> Result<(), DiskError> {
        let size = format!("{size_gb}G");
        let output = Command::new(&self.binary)
            .args(["create", "-f", "qcow2", path.as_str(), size.as_str()])
            .stdin(Stdio::null())
            .output()
            .map_err(|source| DiskError::Spawn {
                cmd: self.binary.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(DiskError::Command {
                cmd: format!("{} create {path}", self.binary),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_owned(),
            });
        }
        info!(self.log, "created disk image";
            "path" => %path,
            "size" => size);
        Ok(())
    }

    fn clone_image(
        &self,
        src: &Utf8Path,
        dst: &Utf8Path,
    ) -> Result<(), DiskError> {
        let bytes = std::fs::copy(src, dst).map_err(|source| {
            DiskError::Copy { src: src.to_owned(), dst: dst.to_owned(), source }
        })?;
        info!(self.log, "copied disk image";
            "src" => %src,
            "dst" => %dst,
            "bytes" => bytes);
        Ok(())
    }
}

/// `<dir>/<id>_disk_<target>.qcow2`
pub fn disk_image_path(
    dir: &Utf8Path,
    instance_id: &str,
    target: &str,
) -> Utf8PathBuf {
    dir.join(format!("{instance_id}_disk_{target}.qcow2"))
}

/// Creates the backing image of every disk in `disks`, filling in each
/// provisioned disk's `target` and `path`.
///
/// A disk with an `existing_path` is copied from it, and a failed copy aborts
/// provisioning. Any other per-disk problem, such as an unsupported bus, a
/// preset target that is taken or not a name on its bus, an exhausted target
/// pool or an image tool failure, leaves that disk without a path and is
/// reported in the returned outcomes.
pub fn provision_disks(
    tool: &dyn ImageTool,
    log: &Logger,
    dir: &Utf8Path,
    instance_id: &str,
    disks: &mut [StorageDisk],
    targets: &mut DiskTargetAllocator,
) -> Result<Vec<DeviceOutcome>, Error> {
    // Preset targets are claimed first so allocation steps around them.
    let mut rejected = BTreeMap::new();
    for (i, disk) in disks.iter().enumerate() {
        let (Some(target), Ok(bus)) = (disk.target.as_deref(), disk.bus_type())
        else {
            continue;
        };
        if let Err(e) = targets.claim(bus, target) {
            rejected.insert(i, e);
        }
    }

    let mut outcomes = Vec::with_capacity(disks.len());
    for (i, disk) in disks.iter_mut().enumerate() {
        let dev = DeviceRef::Disk(i);
        let bus = match disk.bus_type() {
            Ok(bus) => bus,
            Err(_) => {
                warn!(log, "skipping disk with unsupported bus";
                    "disk" => %dev,
                    "bus" => &disk.bus);
                outcomes.push(DeviceOutcome::skipped(
                    dev,
                    format!("unsupported bus type {:?}", disk.bus),
                ));
                continue;
            }
        };
        if let Some(e) = rejected.remove(&i) {
            warn!(log, "skipping disk with unusable target";
                "disk" => %dev,
                "error" => %e);
            outcomes.push(DeviceOutcome::skipped(dev, e.to_string()));
            continue;
        }

        let target = match &disk.target {
            Some(t) => t.clone(),
            None => match targets.next_disk(bus) {
                Ok(t) => t.to_owned(),
                Err(e) => {
                    warn!(log, "no device name left for disk";
                        "disk" => %dev,
                        "error" => %e);
                    outcomes.push(DeviceOutcome::skipped(dev, e.to_string()));
                    continue;
                }
            },
        };

        let path = disk_image_path(dir, instance_id, &target);
        disk.target = Some(target);

        if let Some(src) = &disk.existing_path {
            if let Err(e) = tool.clone_image(src, &path) {
                error!(log, "failed to copy existing image";
                    "disk" => %dev,
                    "error" => %e);
                return Err(e.into());
            }
        } else if let Err(e) = tool.create_qcow2(&path, disk.size_gb) {
            warn!(log, "failed to create disk image";
                "disk" => %dev,
                "error" => %e);
            outcomes.push(DeviceOutcome::failed(dev, e.to_string()));
            continue;
        }

        disk.path = Some(path);
        outcomes.push(DeviceOutcome::attached(dev));
    }
    Ok(outcomes)
}
