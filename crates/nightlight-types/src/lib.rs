// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the Nightlight crates.
//!
//! The records defined here are the wire form exchanged with the record store
//! and the API layer, so their JSON field names are part of the contract. The
//! control-plane crates (switch, namespace, hypervisor, orchestrator) all
//! depend on this crate rather than on each other for these definitions.

use std::fmt::Display;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

mod datastore;
mod instance;

pub use datastore::{Datastore, DatastoreKind};
pub use instance::*;

const ETHERADDRL: usize = 6;

/// Errors produced while parsing a textual MAC address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacParseError {
    #[error("expected 6 octets in MAC address {0:?}")]
    WrongLength(String),

    #[error("invalid octet {octet:?} in MAC address {addr:?}")]
    BadOctet { addr: String, octet: String },
}

/// An Ethernet MAC address. Supports conversion from a string formatted as six
/// colon-separated hex octets, e.g. "52:54:00:0a:1b:2c".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MacAddr([u8; ETHERADDRL]);

impl MacAddr {
    pub const fn new(octets: [u8; ETHERADDRL]) -> Self {
        Self(octets)
    }

    #[inline]
    pub fn octets(&self) -> [u8; ETHERADDRL] {
        self.0
    }

    /// Returns the address packed into the low 48 bits of a `u64`, the form
    /// switch actions use when loading an address into a header field.
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    /// True if the locally-administered bit of the first octet is set.
    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// True if the group bit of the first octet is clear.
    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != ETHERADDRL {
            return Err(MacParseError::WrongLength(s.to_owned()));
        }

        let mut octets = [0u8; ETHERADDRL];
        for (slot, field) in octets.iter_mut().zip(fields) {
            if field.is_empty() || field.len() > 2 {
                return Err(MacParseError::BadOctet {
                    addr: s.to_owned(),
                    octet: field.to_owned(),
                });
            }
            *slot = u8::from_str_radix(field, 16).map_err(|_| {
                MacParseError::BadOctet {
                    addr: s.to_owned(),
                    octet: field.to_owned(),
                }
            })?;
        }
        Ok(Self(octets))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

impl JsonSchema for MacAddr {
    fn schema_name() -> String {
        "MacAddr".to_owned()
    }

    fn json_schema(
        _gen: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        use schemars::schema::{InstanceType, SchemaObject, StringValidation};

        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            string: Some(Box::new(StringValidation {
                pattern: Some("^([0-9a-f]{2}:){5}[0-9a-f]{2}$".to_owned()),
                ..Default::default()
            })),
            ..Default::default()
        }
        .into()
    }
}

/// The storage buses a disk may be attached through.
///
/// Disks carry their bus as a free-form string on the wire so that requests
/// naming an unknown bus survive deserialization and can be reported; this
/// type is the parsed, supported subset.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum BusType {
    Virtio,
    Sata,
}
