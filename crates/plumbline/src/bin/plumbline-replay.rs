//! plumbline-replay
//!
//! Replays a registry snapshot through an in-process remote and prints the
//! objects a watch spec matches, one JSON object per line.
//!
//! Snapshot format:
//!
//! ```json
//! [{"id": 5, "interface": "PipeWire:Interface:Node", "version": 3,
//!   "properties": {"media.class": "Audio/Sink"}, "params": [[3, {"rate": 48000}]]}]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use plumbconf::PlumbConfig;
use plumbline::{
    telemetry, Constraint, Core, Features, LoopbackRemote, ObjectManager, ObjectType, Properties,
    TypeRegistry,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Registry snapshot to replay (JSON array of objects)
    snapshot: PathBuf,

    /// Watch spec (JSON); defaults to every node
    #[arg(short, long)]
    watch: Option<PathBuf>,

    /// Config file overriding ./plumbline.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SnapshotObject {
    id: u32,
    interface: String,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    params: Vec<(u32, serde_json::Value)>,
}

fn default_version() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct WatchSpec {
    #[serde(rename = "type")]
    object_type: String,
    #[serde(default)]
    constraints: Vec<Constraint>,
    #[serde(default)]
    features: Vec<String>,
}

impl Default for WatchSpec {
    fn default() -> Self {
        Self {
            object_type: ObjectType::Node.to_string(),
            constraints: Vec::new(),
            features: Vec::new(),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PlumbConfig::load_from(cli.config.as_deref())?;
    telemetry::init(&config.infra.telemetry)?;
    info!(
        "plumbline-replay {} as {}, standing in for remote {}",
        env!("CARGO_PKG_VERSION"),
        config.infra.remote.app_name,
        config.infra.remote.name
    );

    let snapshot: Vec<SnapshotObject> = read_json(&cli.snapshot)?;
    let watch: WatchSpec = match &cli.watch {
        Some(path) => read_json(path)?,
        None => WatchSpec::default(),
    };
    let object_type: ObjectType = match watch.object_type.parse() {
        Ok(t) => t,
        Err(e) => bail!("bad watch type: {e}"),
    };

    let remote = LoopbackRemote::new();
    let core = Core::with_config(remote.clone(), TypeRegistry::with_defaults(), &config.session);
    for object in snapshot {
        debug!("replaying {} ({})", object.id, object.interface);
        remote.announce_at(object.id, &object.interface, object.version, object.properties);
        for (param_id, value) in object.params {
            remote.add_param(object.id, param_id, value);
        }
    }
    core.run_until_idle();

    let manager = ObjectManager::new();
    manager.add_interest(
        object_type,
        watch.constraints,
        Features::from_names(&watch.features),
    );
    core.install_object_manager(&manager);
    let processed = core.run_until_idle();
    debug!("settled after {} events", processed);

    for object in manager.iterate() {
        let line = match object.as_proxy() {
            Some(proxy) => json!({
                "id": proxy.bound_id(),
                "type": proxy.object_type().to_string(),
                "features": format!("{:?}", proxy.active_features()),
                "global": proxy.global_properties(),
                "info": proxy.info(),
                "params": proxy.params(),
            }),
            None => json!({
                "type": object.object_type().to_string(),
                "properties": object.properties(),
            }),
        };
        println!("{line}");
    }
    info!("{} of {} globals matched", manager.n_objects(), core.globals().len());
    Ok(())
}
