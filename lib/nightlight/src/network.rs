// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side virtual network plumbing: the metadata responder's network and
//! the bridges backing subnets.

use netns::{EnsureOutcome, NamespaceRequest, NamespaceWorker};
use ovs::{InterfaceOptions, MetadataEndpoint, SwitchControl};
use slog::{info, Logger};

use crate::Error;

/// The metadata endpoint described by the host configuration.
pub fn metadata_endpoint(
    cfg: &nightlight_config::Config,
) -> MetadataEndpoint {
    MetadataEndpoint {
        mac: cfg.metadata.mac,
        ip: cfg.metadata.ip,
        ct_table: cfg.switch.ct_table,
    }
}

/// Brings up the metadata responder's network.
///
/// The metadata port is added to the bridge as an internal interface, moved
/// into its own namespace with the metadata address, and the bridge's
/// catch-all forwarding rule is installed. Each step tolerates having been
/// done before, so this may run on every start.
pub fn setup_metadata_network(
    switch: &dyn SwitchControl,
    worker: &NamespaceWorker,
    cfg: &nightlight_config::Config,
    log: &Logger,
) -> Result<EnsureOutcome, Error> {
    let md = &cfg.metadata;

    switch.add_bridge(&md.bridge)?;
    switch.add_port(&md.bridge, &md.port)?;
    let opts = InterfaceOptions::internal(&md.port, md.mac);
    switch.set_interface(&md.port, &opts)?;

    let mut req = NamespaceRequest::new(md.port.clone(), md.mac, md.ip);
    req.prefix_len = md.prefix_len;
    let outcome = worker.ensure(req)?;

    ovs::install_default_flow(switch, log, &md.bridge)?;

    info!(log, "metadata network ready";
        "bridge" => &md.bridge,
        "port" => &md.port,
        "ip" => %md.ip,
        "namespace" => ?outcome);
    Ok(outcome)
}

/// Kernel limit on interface names, including the terminating nul.
const IFNAMSIZ: usize = 16;

/// Name of the bridge backing subnet `subnet_id`.
pub fn subnet_bridge_name(subnet_id: &str) -> Result<String, Error> {
    let suffix = subnet_id.trim_start_matches("subnet-");
    let name = format!("sub{suffix}");
    let ok = !suffix.is_empty()
        && name.len() < IFNAMSIZ
        && !name.contains(['/', '\0'])
        && !name.chars().any(char::is_whitespace);
    if !ok {
        return Err(Error::UnsupportedConfiguration(format!(
            "subnet id {subnet_id:?} does not yield a valid bridge name"
        )));
    }
    Ok(name)
}

pub fn create_subnet_bridge(
    switch: &dyn SwitchControl,
    log: &Logger,
    subnet_id: &str,
) -> Result<String, Error> {
    let bridge = subnet_bridge_name(subnet_id)?;
    switch.add_bridge(&bridge)?;
    ovs::install_default_flow(switch, log, &bridge)?;
    info!(log, "created subnet bridge"; "subnet" => subnet_id,
        "bridge" => &bridge);
    Ok(bridge)
}

pub fn delete_subnet_bridge(
    switch: &dyn SwitchControl,
    log: &Logger,
    subnet_id: &str,
) -> Result<(), Error> {
    let bridge = subnet_bridge_name(subnet_id)?;
    switch.del_bridge(&bridge)?;
    info!(log, "deleted subnet bridge"; "subnet" => subnet_id,
        "bridge" => &bridge);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{MemoryNamespaces, NoNamespaces, RecordingSwitch};

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn bridge_names() {
        assert_eq!(
            subnet_bridge_name("subnet-abc123defg").unwrap(),
            "subabc123defg"
        );
        assert_eq!(subnet_bridge_name("x1").unwrap(), "subx1");
        // 15 bytes is the longest name the kernel accepts.
        assert_eq!(
            subnet_bridge_name("subnet-abcdefghijkl").unwrap(),
            "subabcdefghijkl"
        );
    }

    #[test]
    fn unusable_bridge_names_are_rejected() {
        for id in
            ["subnet-abcdefghijklm", "subnet-", "subnet-a b", "subnet-a/b"]
        {
            let err = subnet_bridge_name(id).unwrap_err();
            assert!(
                matches!(err, Error::UnsupportedConfiguration(_)),
                "{id}"
            );
        }

        let switch = RecordingSwitch::default();
        create_subnet_bridge(&switch, &logger(), "subnet-0123456789abc")
            .unwrap_err();
        assert!(switch.calls().is_empty());
    }

    #[test]
    fn subnet_bridge_lifecycle() {
        let switch = RecordingSwitch::default();
        let bridge =
            create_subnet_bridge(&switch, &logger(), "subnet-0a1b2c3d4e")
                .unwrap();
        assert_eq!(bridge, "sub0a1b2c3d4e");
        delete_subnet_bridge(&switch, &logger(), "subnet-0a1b2c3d4e").unwrap();

        let calls = switch.calls();
        assert_eq!(calls[0], "add-br sub0a1b2c3d4e");
        assert_eq!(
            calls[1],
            "add-flow sub0a1b2c3d4e table=0,priority=0,actions=normal"
        );
        assert_eq!(calls[2], "del-br sub0a1b2c3d4e");
    }

    #[test]
    fn namespace_failure_stops_bring_up() {
        let switch = RecordingSwitch::default();
        let worker =
            NamespaceWorker::spawn(Box::new(NoNamespaces), logger()).unwrap();

        let cfg = nightlight_config::Config::default();
        let err = setup_metadata_network(&switch, &worker, &cfg, &logger())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));

        let calls = switch.calls();
        assert_eq!(calls[0], "add-br nightlight");
        assert_eq!(calls[1], "add-port nightlight mddefaultvpc");
        assert!(calls[2]
            .starts_with("set Interface mddefaultvpc type=internal"));
        assert!(!calls.iter().any(|c| c.starts_with("add-flow")));
    }

    #[test]
    fn bring_up_is_repeatable() {
        let switch = RecordingSwitch::default();
        let worker = NamespaceWorker::spawn(
            Box::new(MemoryNamespaces::default()),
            logger(),
        )
        .unwrap();
        let cfg = nightlight_config::Config::default();

        let first =
            setup_metadata_network(&switch, &worker, &cfg, &logger()).unwrap();
        let second =
            setup_metadata_network(&switch, &worker, &cfg, &logger()).unwrap();
        assert_eq!(first, EnsureOutcome::Created);
        assert_eq!(second, EnsureOutcome::AlreadyExists);
        assert_eq!(
            switch.calls().last().map(String::as_str),
            Some("add-flow nightlight table=0,priority=0,actions=normal")
        );
    }
}
