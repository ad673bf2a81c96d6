// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifier, MAC address and device-name allocation.

use std::collections::BTreeSet;

use nightlight_types::{BusType, MacAddr};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use thiserror::Error;
use uuid::Uuid;

/// Locally administered OUI shared by every generated guest MAC.
const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// Reserved by the switch for its own ports.
const MAC_RESERVED_OCTET: u8 = 0xfe;
const MAC_RESERVED_REMAP: u8 = 0xee;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_SUFFIX_LEN: usize = 10;

pub const VIRTIO_POOL: [&str; 10] =
    ["vda", "vdb", "vdc", "vdd", "vde", "vdf", "vdg", "vdh", "vdi", "vdj"];
pub const SATA_POOL: [&str; 10] =
    ["sda", "sdb", "sdc", "sdd", "sde", "sdf", "sdg", "sdh", "sdi", "sdj"];
pub const IDE_POOL: [&str; 4] = ["hda", "hdb", "hdc", "hdd"];
pub const FLOPPY_POOL: [&str; 2] = ["fda", "fdb"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("all {limit} {bus} device names are in use")]
    Exhausted { bus: &'static str, limit: usize },

    #[error("unsupported bus type {0:?}")]
    UnsupportedBus(String),

    #[error("{target:?} is not a {bus} device name")]
    NotInPool { target: String, bus: &'static str },

    #[error("device name {0} is already in use")]
    InUse(String),

    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// A random v4 UUID whose first three hex digits read `ec2`, marking it as
/// an instance identity.
pub fn generate_instance_uuid() -> Uuid {
    let mut bytes = *Uuid::new_v4().as_bytes();
    bytes[0] = 0xec;
    bytes[1] = 0x20 | (bytes[1] & 0x0f);
    Uuid::from_bytes(bytes)
}

/// `<prefix>-` followed by ten random characters from `[a-z0-9]`.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect();
    format!("{prefix}-{suffix}")
}

pub fn generate_instance_id() -> String {
    generate_id("i")
}

/// Draws a guest MAC address from the OS entropy source.
pub fn generate_mac_address() -> Result<MacAddr, AllocError> {
    let mut buf = [0u8; 3];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| AllocError::Entropy(e.to_string()))?;
    Ok(mac_from_entropy(buf))
}

fn mac_from_entropy(buf: [u8; 3]) -> MacAddr {
    // Locally administered, unicast.
    let mut first = (buf[0] | 0x02) & 0xfe;
    if first == MAC_RESERVED_OCTET {
        first = MAC_RESERVED_REMAP;
    }
    let [a, b, c] = MAC_PREFIX;
    MacAddr::new([a, b, c, first, buf[1], buf[2]])
}

fn pool_for(bus: BusType) -> (&'static str, &'static [&'static str]) {
    match bus {
        BusType::Virtio => ("virtio", &VIRTIO_POOL),
        BusType::Sata => ("sata", &SATA_POOL),
    }
}

/// Returns the device name for the next disk on `bus`, given how many disks
/// of each bus have already been named.
pub fn assign_disk_target(
    bus: &str,
    used_virtio: usize,
    used_sata: usize,
) -> Result<&'static str, AllocError> {
    let bus: BusType = bus
        .parse()
        .map_err(|_| AllocError::UnsupportedBus(bus.to_owned()))?;
    let used = match bus {
        BusType::Virtio => used_virtio,
        BusType::Sata => used_sata,
    };
    let (name, pool) = pool_for(bus);
    pool.get(used)
        .copied()
        .ok_or(AllocError::Exhausted { bus: name, limit: pool.len() })
}

/// Hands out device names for one guest, never repeating a name.
///
/// Names fixed ahead of time are recorded with [`reserve`](Self::reserve)
/// and skipped when allocating.
#[derive(Clone, Debug, Default)]
pub struct DiskTargetAllocator {
    used: BTreeSet<String>,
}

impl DiskTargetAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `target` as taken. Returns false if it already was.
    pub fn reserve(&mut self, target: &str) -> bool {
        self.used.insert(target.to_owned())
    }

    /// Claims a caller-chosen `target` for a disk on `bus`. The name must
    /// come from that bus's pool and must not be taken.
    pub fn claim(
        &mut self,
        bus: BusType,
        target: &str,
    ) -> Result<(), AllocError> {
        let (name, pool) = pool_for(bus);
        if !pool.contains(&target) {
            return Err(AllocError::NotInPool {
                target: target.to_owned(),
                bus: name,
            });
        }
        if !self.reserve(target) {
            return Err(AllocError::InUse(target.to_owned()));
        }
        Ok(())
    }

    pub fn is_used(&self, target: &str) -> bool {
        self.used.contains(target)
    }

    fn take(
        &mut self,
        bus: &'static str,
        pool: &[&'static str],
    ) -> Result<&'static str, AllocError> {
        let name = pool
            .iter()
            .find(|n| !self.used.contains(**n))
            .copied()
            .ok_or(AllocError::Exhausted { bus, limit: pool.len() })?;
        self.used.insert(name.to_owned());
        Ok(name)
    }

    pub fn next_disk(
        &mut self,
        bus: BusType,
    ) -> Result<&'static str, AllocError> {
        let (name, pool) = pool_for(bus);
        self.take(name, pool)
    }

    pub fn next_ide(&mut self) -> Result<&'static str, AllocError> {
        self.take("ide", &IDE_POOL)
    }

    pub fn next_floppy(&mut self) -> Result<&'static str, AllocError> {
        self.take("floppy", &FLOPPY_POOL)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn instance_uuid_prefix() {
        for _ in 0..32 {
            let id = generate_instance_uuid();
            assert!(id.to_string().starts_with("ec2"), "{id}");
            assert_eq!(id.get_version_num(), 4);
        }
    }

    #[test]
    fn id_shape() {
        let id = generate_instance_id();
        let (prefix, suffix) = id.split_once('-').unwrap();
        assert_eq!(prefix, "i");
        assert_eq!(suffix.len(), 10);
        assert!(suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));

        assert!(generate_id("subnet").starts_with("subnet-"));
    }

    #[test]
    fn reserved_octet_is_remapped() {
        // 0xfd | 0x02 & 0xfe == 0xfe
        let mac = mac_from_entropy([0xfd, 0x01, 0x02]);
        assert_eq!(mac.to_string(), "52:54:00:ee:01:02");

        let mac = mac_from_entropy([0x01, 0xaa, 0xbb]);
        assert_eq!(mac.to_string(), "52:54:00:02:aa:bb");
    }

    proptest! {
        #[test]
        fn generated_mac_bits(buf in any::<[u8; 3]>()) {
            let octets = mac_from_entropy(buf).octets();
            prop_assert_eq!(&octets[..3], &MAC_PREFIX[..]);
            prop_assert_eq!(octets[3] & 0x02, 0x02);
            prop_assert_eq!(octets[3] & 0x01, 0x00);
            prop_assert_ne!(octets[3], MAC_RESERVED_OCTET);
        }

        #[test]
        fn targets_are_unique_until_exhausted(
            buses in proptest::collection::vec(any::<bool>(), 0..=20)
        ) {
            let mut virtio = 0;
            let mut sata = 0;
            let mut seen = BTreeSet::new();
            for is_virtio in buses {
                let bus = if is_virtio { "virtio" } else { "sata" };
                let res = assign_disk_target(bus, virtio, sata);
                let count = if is_virtio { &mut virtio } else { &mut sata };
                if *count < 10 {
                    let name = res.unwrap();
                    prop_assert!(seen.insert(name));
                    *count += 1;
                } else {
                    let is_exhausted =
                        matches!(res, Err(AllocError::Exhausted { .. }));
                    prop_assert!(is_exhausted);
                }
            }
        }
    }

    #[test]
    fn eleventh_disk_is_exhausted() {
        assert_eq!(assign_disk_target("virtio", 9, 0), Ok("vdj"));
        assert_eq!(
            assign_disk_target("virtio", 10, 0),
            Err(AllocError::Exhausted { bus: "virtio", limit: 10 })
        );
        assert_eq!(assign_disk_target("sata", 10, 2), Ok("sdc"));
    }

    #[test]
    fn unsupported_bus() {
        assert_eq!(
            assign_disk_target("scsi", 0, 0),
            Err(AllocError::UnsupportedBus("scsi".to_owned()))
        );
    }

    #[test]
    fn allocator_skips_reserved() {
        let mut alloc = DiskTargetAllocator::new();
        assert!(alloc.reserve("vda"));
        assert!(!alloc.reserve("vda"));
        assert_eq!(alloc.next_disk(BusType::Virtio), Ok("vdb"));
        assert_eq!(alloc.next_disk(BusType::Sata), Ok("sda"));
        assert_eq!(alloc.next_ide(), Ok("hda"));
        assert_eq!(alloc.next_floppy(), Ok("fda"));
        assert_eq!(alloc.next_floppy(), Ok("fdb"));
        assert_eq!(
            alloc.next_floppy(),
            Err(AllocError::Exhausted { bus: "floppy", limit: 2 })
        );
        assert!(alloc.is_used("sda"));
    }

    #[test]
    fn pinned_targets_must_be_free_pool_names() {
        let mut alloc = DiskTargetAllocator::new();
        assert_eq!(alloc.claim(BusType::Virtio, "vdc"), Ok(()));
        assert_eq!(
            alloc.claim(BusType::Virtio, "vdc"),
            Err(AllocError::InUse("vdc".to_owned()))
        );
        assert_eq!(
            alloc.claim(BusType::Sata, "vda"),
            Err(AllocError::NotInPool {
                target: "vda".to_owned(),
                bus: "sata"
            })
        );
        assert!(matches!(
            alloc.claim(BusType::Virtio, "../../escape"),
            Err(AllocError::NotInPool { .. })
        ));
        assert!(!alloc.is_used("../../escape"));
        assert_eq!(alloc.next_disk(BusType::Virtio), Ok("vda"));
        assert_eq!(alloc.next_disk(BusType::Virtio), Ok("vdb"));
        assert_eq!(alloc.next_disk(BusType::Virtio), Ok("vdd"));
    }
}
