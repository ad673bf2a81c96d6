// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device results of provisioning an instance.

use nightlight_types::{DeviceRef, Instance};
use serde::{Serialize, Serializer};

fn serialize_device<S>(dev: &DeviceRef, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(dev)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeviceStatus {
    Attached,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceOutcome {
    #[serde(serialize_with = "serialize_device")]
    pub device: DeviceRef,
    #[serde(flatten)]
    pub status: DeviceStatus,
}

impl DeviceOutcome {
    pub fn attached(device: DeviceRef) -> Self {
        Self { device, status: DeviceStatus::Attached }
    }

    pub fn skipped(device: DeviceRef, reason: impl Into<String>) -> Self {
        Self { device, status: DeviceStatus::Skipped { reason: reason.into() } }
    }

    pub fn failed(device: DeviceRef, reason: impl Into<String>) -> Self {
        Self { device, status: DeviceStatus::Failed { reason: reason.into() } }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.status, DeviceStatus::Attached)
    }
}

/// What `create_instance` hands back: the instance as provisioned and one
/// outcome for every device it asked for.
#[derive(Clone, Debug, Serialize)]
pub struct ProvisionReport {
    pub instance: Instance,
    pub outcomes: Vec<DeviceOutcome>,
}

impl ProvisionReport {
    pub fn new(instance: Instance, mut outcomes: Vec<DeviceOutcome>) -> Self {
        outcomes.sort_by_key(|o| o.device);
        Self { instance, outcomes }
    }

    pub fn requested(&self) -> usize {
        self.outcomes.len()
    }

    pub fn attached(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_attached()).count()
    }

    /// e.g. "3 of 4 devices attached"
    pub fn summary(&self) -> String {
        format!("{} of {} devices attached", self.attached(), self.requested())
    }

    /// Marks `device` failed after the fact. A device that already failed
    /// or was skipped keeps its first reason.
    pub fn record_failure(
        &mut self,
        device: DeviceRef,
        reason: impl Into<String>,
    ) {
        match self.outcomes.iter_mut().find(|o| o.device == device) {
            Some(o) if o.is_attached() => {
                o.status = DeviceStatus::Failed { reason: reason.into() };
            }
            Some(_) => {}
            None => self.outcomes.push(DeviceOutcome::failed(device, reason)),
        }
    }
}

/// Folds `update` into `outcomes`. An earlier skip or failure for the same
/// device is kept.
pub(crate) fn merge_outcomes(
    outcomes: &mut Vec<DeviceOutcome>,
    update: Vec<DeviceOutcome>,
) {
    for new in update {
        match outcomes.iter_mut().find(|o| o.device == new.device) {
            Some(old) if old.is_attached() => *old = new,
            Some(_) => {}
            None => outcomes.push(new),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn report() -> ProvisionReport {
        ProvisionReport::new(
            Instance::default(),
            vec![
                DeviceOutcome::attached(DeviceRef::Nic(0)),
                DeviceOutcome::skipped(DeviceRef::Disk(1), "no backing path"),
                DeviceOutcome::attached(DeviceRef::Disk(0)),
            ],
        )
    }

    #[test]
    fn summary_counts_attached() {
        let r = report();
        assert_eq!(r.summary(), "2 of 3 devices attached");
        assert_eq!(r.outcomes[0].device, DeviceRef::Nic(0));
        assert_eq!(r.outcomes[1].device, DeviceRef::Disk(0));
    }

    #[test]
    fn late_failure_replaces_attached_only() {
        let mut r = report();
        r.record_failure(DeviceRef::Nic(0), "no switch port");
        r.record_failure(DeviceRef::Disk(1), "ignored");
        assert_eq!(
            r.outcomes[0].status,
            DeviceStatus::Failed { reason: "no switch port".to_owned() }
        );
        assert_eq!(
            r.outcomes[2].status,
            DeviceStatus::Skipped { reason: "no backing path".to_owned() }
        );
        assert_eq!(r.summary(), "1 of 3 devices attached");
    }

    #[test]
    fn merge_keeps_first_failure() {
        let mut outcomes =
            vec![DeviceOutcome::failed(DeviceRef::Disk(0), "qemu-img failed")];
        merge_outcomes(
            &mut outcomes,
            vec![
                DeviceOutcome::attached(DeviceRef::Disk(0)),
                DeviceOutcome::attached(DeviceRef::Cdrom(0)),
            ],
        );
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].is_attached());
        assert!(outcomes[1].is_attached());
    }

    #[test]
    fn outcome_json_shape() {
        let v = serde_json::to_value(DeviceOutcome::skipped(
            DeviceRef::Disk(2),
            "unsupported bus",
        ))
        .unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "device": "disk[2]",
                "status": "skipped",
                "reason": "unsupported bus",
            })
        );
    }
}
