#![forbid(unsafe_code)]

//! `bepd` entrypoint.
//!
//! This binary is a thin composition root, not part of the library: it
//! reads a handful of environment variables, wires a `Storage` backend and
//! a `Model` together, and drains the introducer dial-request channel by
//! logging it. TLS listener bootstrap, certificate loading, and peer
//! address discovery stay out of scope here too — see the crate's own doc
//! comment and §1 of the design notes. A real deployment accepts a mutual
//! TLS stream and hands it, plus the accepted `PeerCertSource`, to
//! `networking::listener::accept_peer` and `spawn_session`.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use bepd::config::BepConfig;
use bepd::core::identity::{device_id_from_cert, format_device_id};
use bepd::model::{LocalIdentity, Model};
use bepd::monitoring::Metrics;
use bepd::storage::{MemoryStorage, SledStorage, Storage};

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_config() -> BepConfig {
    let mut cfg = match std::env::var("BEP_CONFIG_FILE") {
        Ok(path) => BepConfig::load(Path::new(&path)).unwrap_or_else(|e| {
            warn!(error = %e, path, "failed to load config file, falling back to defaults");
            BepConfig::default()
        }),
        Err(_) => BepConfig::default(),
    };
    cfg.client_name = env("BEP_CLIENT_NAME", &cfg.client_name);
    cfg.listen_addr = env("BEP_LISTEN_ADDR", &cfg.listen_addr);
    cfg.data_dir = env("BEP_DATA_DIR", &cfg.data_dir.to_string_lossy()).into();
    cfg
}

/// Stand-in for the bootstrap layer's TLS identity. A real deployment
/// derives this endpoint's device id from its configured certificate via
/// `device_id_from_cert`; lacking one here (loading a certificate is out
/// of scope for this crate), this derives a stable id from the client
/// name and data directory instead, just so the demo has something
/// consistent to log and reject self-connections against.
fn placeholder_local_identity(cfg: &BepConfig) -> LocalIdentity {
    let seed = format!("{}:{}", cfg.client_name, cfg.data_dir.display());
    LocalIdentity {
        device_id: device_id_from_cert(seed.as_bytes()),
        client_name: cfg.client_name.clone(),
        client_version: cfg.client_version.clone(),
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let cfg = load_config();
    let metrics = Arc::new(Metrics::new().expect("metrics registration failed"));

    let storage: Arc<dyn Storage> = match SledStorage::open(&cfg.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, data_dir = %cfg.data_dir.display(), "failed to open sled store, falling back to in-memory storage");
            Arc::new(MemoryStorage::new())
        }
    };

    let identity = placeholder_local_identity(&cfg);
    let (model, mut dial_rx) = Model::<tokio::net::TcpStream>::new(identity.clone(), storage);
    let model = Arc::new(model);

    info!(
        device = %format_device_id(&identity.device_id),
        listen_addr = %cfg.listen_addr,
        data_dir = %cfg.data_dir.display(),
        "bepd starting"
    );

    // Dialing a newly introduced device is out of scope (peer addresses
    // are assumed supplied elsewhere); this drains the channel and logs
    // what a discovery collaborator would act on.
    let dial_task = tokio::spawn(async move {
        while let Some(device_id) = dial_rx.recv().await {
            info!(
                device = %format_device_id(&device_id),
                "introducer announced an unknown device; dialing is out of scope here"
            );
        }
    });

    metrics.sessions_active.set(model.session_count().await as i64);

    warn!(
        "no TLS listener is wired up in this composition root; accept a mutual-TLS stream \
         and hand it to networking::listener::accept_peer to start serving peers"
    );

    let _ = dial_task.await;
}
