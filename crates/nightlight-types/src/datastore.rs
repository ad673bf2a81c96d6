// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::{Utf8Path, Utf8PathBuf};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DatastoreKind {
    Local,
    /// A remote share mounted beneath the volumes root.
    #[serde(alias = "nfs")]
    NetworkShare,
}

/// A storage root holding instance directories and disk images.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Datastore {
    pub id: String,
    pub name: String,
    pub kind: DatastoreKind,
    /// Share source (`host:/export`) for network shares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[schemars(with = "String")]
    pub local_path: Utf8PathBuf,
}

impl Datastore {
    pub fn root(&self) -> &Utf8Path {
        &self.local_path
    }

    /// Working directory for one instance: `<local_path>/<instance id>`.
    pub fn instance_dir(&self, instance_id: &str) -> Utf8PathBuf {
        self.local_path.join(instance_id)
    }
}
