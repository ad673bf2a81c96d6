// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use netns::{HostNamespaces, NamespaceWorker};
use nightlight::disk::QemuImg;
use nightlight::hypervisor::LibvirtClient;
use nightlight::{network, InstanceManager};
use nightlight_config::Config;
use nightlight_types::{Datastore, Instance};
use ovs::OvsClient;
use serde::de::DeserializeOwned;
use slog::{info, o, warn, Logger};

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Provisions and controls Nightlight guests on this host
struct Args {
    /// Host configuration file. Defaults apply when omitted.
    #[clap(long, short, env = "NIGHTLIGHT_CONFIG", action)]
    config: Option<Utf8PathBuf>,

    /// Logging level
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provisions and boots the instance described by a JSON record, and
    /// prints the provisioned record.
    Create {
        #[clap(action)]
        instance: Utf8PathBuf,

        /// Datastore record. Defaults to the local datastore named by the
        /// instance.
        #[clap(long, action)]
        datastore: Option<Utf8PathBuf>,
    },

    /// Destroys an instance and removes its files. Takes the record printed
    /// by `create`.
    Delete {
        #[clap(action)]
        instance: Utf8PathBuf,

        #[clap(long, action)]
        datastore: Option<Utf8PathBuf>,
    },

    Start {
        id: String,
    },

    /// Asks the guest to power off.
    Shutdown {
        id: String,
    },

    Reboot {
        id: String,
    },

    Reset {
        id: String,
    },

    /// Types text on the guest's keyboard.
    SendKeys {
        id: String,

        text: String,

        /// Treat TEXT as hex USB HID usage codes to press together, e.g.
        /// "e0 e2 4c".
        #[clap(long, action)]
        raw: bool,
    },

    /// Hot-plugs a CD-ROM image into a running guest.
    AttachCdrom {
        id: String,

        #[clap(action)]
        path: Utf8PathBuf,
    },

    /// Prints the guest's power state.
    State {
        id: String,
    },

    /// Brings up the metadata responder's bridge, port and namespace.
    SetupMetadata,

    CreateSubnet {
        subnet_id: String,
    },

    DeleteSubnet {
        subnet_id: String,
    },

    /// Prints the JSON schema of the instance record.
    Schema,
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("nightlight-standalone", std::io::stderr())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), o!())
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {path}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value)
        .context("failed to serialize output")?;
    println!("{out}");
    Ok(())
}

fn datastore_for(
    cfg: &Config,
    instance: &Instance,
    path: Option<&Utf8Path>,
) -> anyhow::Result<Datastore> {
    match path {
        Some(p) => read_json(p),
        None => Ok(cfg.storage.local_datastore(&instance.datastore_id)),
    }
}

/// Parses whitespace-separated hex key codes, with or without `0x`.
fn parse_key_codes(text: &str) -> anyhow::Result<Vec<u32>> {
    text.split_whitespace()
        .map(|tok| {
            let digits = tok.trim_start_matches("0x");
            u32::from_str_radix(digits, 16)
                .map_err(|_| anyhow!("invalid key code {tok:?}"))
        })
        .collect()
}

fn switch(cfg: &Config, log: &Logger) -> OvsClient {
    OvsClient::new(
        cfg.switch.ovs_vsctl.clone(),
        cfg.switch.ovs_ofctl.clone(),
        log.new(o!("component" => "switch")),
    )
}

fn instance_manager(
    cfg: Arc<Config>,
    log: &Logger,
) -> anyhow::Result<InstanceManager> {
    let hv = LibvirtClient::connect(
        &cfg.hypervisor,
        log.new(o!("component" => "hypervisor")),
    )
    .context("failed to connect to hypervisor")?;
    let images = QemuImg::new(
        cfg.storage.qemu_img.clone(),
        log.new(o!("component" => "images")),
    );
    Ok(InstanceManager::new(
        Arc::new(hv),
        Arc::new(switch(&cfg, log)),
        Arc::new(images),
        cfg,
        log.clone(),
    ))
}

fn run(cmd: Command, cfg: Arc<Config>, log: &Logger) -> anyhow::Result<()> {
    match cmd {
        Command::Schema => {
            let schema = schemars::schema_for!(Instance);
            print_json(&schema)
        }
        Command::SetupMetadata => {
            let worker = NamespaceWorker::spawn(
                Box::new(HostNamespaces::new(log.clone())),
                log.new(o!("component" => "netns")),
            )
            .context("failed to start namespace worker")?;
            let outcome = network::setup_metadata_network(
                &switch(&cfg, log),
                &worker,
                &cfg,
                log,
            )?;
            info!(log, "metadata network ready"; "namespace" => ?outcome);
            Ok(())
        }
        Command::CreateSubnet { subnet_id } => {
            let bridge = network::create_subnet_bridge(
                &switch(&cfg, log),
                log,
                &subnet_id,
            )?;
            println!("{bridge}");
            Ok(())
        }
        Command::DeleteSubnet { subnet_id } => {
            network::delete_subnet_bridge(&switch(&cfg, log), log, &subnet_id)?;
            Ok(())
        }
        Command::Create { instance, datastore } => {
            let instance: Instance = read_json(&instance)?;
            let datastore =
                datastore_for(&cfg, &instance, datastore.as_deref())?;
            let mgr = instance_manager(cfg, log)?;
            let report = mgr
                .create_instance(&instance, &datastore)
                .with_context(|| format!("failed to create {}", instance.id))?;
            for o in report.outcomes.iter().filter(|o| !o.is_attached()) {
                warn!(log, "device not attached";
                    "device" => %o.device,
                    "status" => ?o.status);
            }
            info!(log, "{}", report.summary());
            print_json(&report)
        }
        Command::Delete { instance, datastore } => {
            let instance: Instance = read_json(&instance)?;
            let datastore =
                datastore_for(&cfg, &instance, datastore.as_deref())?;
            let mgr = instance_manager(cfg, log)?;
            mgr.delete_instance(&instance, &datastore)
                .with_context(|| format!("failed to delete {}", instance.id))?;
            Ok(())
        }
        Command::Start { id } => Ok(instance_manager(cfg, log)?.start(&id)?),
        Command::Shutdown { id } => {
            Ok(instance_manager(cfg, log)?.shutdown(&id)?)
        }
        Command::Reboot { id } => Ok(instance_manager(cfg, log)?.reboot(&id)?),
        Command::Reset { id } => Ok(instance_manager(cfg, log)?.reset(&id)?),
        Command::SendKeys { id, text, raw } => {
            let mgr = instance_manager(cfg, log)?;
            if raw {
                mgr.send_raw_keys(&id, &parse_key_codes(&text)?)?;
            } else {
                let skipped = mgr.send_text(&id, &text)?;
                if !skipped.is_empty() {
                    let skipped: String = skipped.into_iter().collect();
                    eprintln!("skipped characters with no key: {skipped:?}");
                }
            }
            Ok(())
        }
        Command::AttachCdrom { id, path } => {
            let target = instance_manager(cfg, log)?.attach_cdrom(&id, &path)?;
            println!("{target}");
            Ok(())
        }
        Command::State { id } => {
            let state = instance_manager(cfg, log)?.power_state(&id)?;
            println!("{state}");
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let Args { config, log_level, cmd } = Args::parse();
    let log = build_logger(log_level);

    let cfg = match &config {
        Some(path) => nightlight_config::parse(path)
            .with_context(|| format!("failed to read config {path}"))?,
        None => Config::default(),
    };
    info!(log, "starting"; "version" => nightlight::version());

    run(cmd, Arc::new(cfg), &log)
}
