use tracing::{error, info};

use clap::{values_t, App, Arg};

use zfx_mesh::crypto::LocalIdentity;
use zfx_mesh::server::{self, Node, Settings};
use zfx_mesh::Result;

use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_level(false)
        .with_target(false)
        .without_time()
        .compact()
        .with_max_level(tracing::Level::INFO)
        .init();

    let matches = App::new("zfx-mesh")
        .version("0.1")
        .author("zero.fx labs ltd.")
        .about("Runs a zfx mesh node")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("CONFIG_FILE")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listener-ip")
                .short("a")
                .long("listener-ip")
                .value_name("LISTENER_IP")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bootstrap-ip")
                .short("b")
                .long("bootstrap-ip")
                .value_name("BOOTSTRAP_IP")
                .multiple(true),
        )
        .arg(
            Arg::with_name("keypair")
                .short("k")
                .long("keypair")
                .value_name("KEYPAIR")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("shared-key")
                .short("s")
                .long("shared-key")
                .value_name("ID:KEY")
                .multiple(true),
        )
        .get_matches();

    let mut settings = Settings::new(matches.value_of("config").map(Path::new))?;
    if let Some(listener_ip) = matches.value_of("listener-ip") {
        settings.listener_ip = listener_ip.to_string();
    }
    if matches.is_present("bootstrap-ip") {
        settings.bootstrap_peers =
            values_t!(matches.values_of("bootstrap-ip"), String).unwrap_or_else(|e| e.exit());
    }
    if let Some(keypair) = matches.value_of("keypair") {
        settings.keypair = Some(keypair.to_string());
    }
    if matches.is_present("shared-key") {
        settings.shared_keys =
            values_t!(matches.values_of("shared-key"), String).unwrap_or_else(|e| e.exit());
    }

    let identity = match &settings.keypair {
        Some(keypair_hex) => LocalIdentity::from_hex(keypair_hex)?,
        None => {
            let path: PathBuf = server::default_keypair_path()?;
            server::load_or_generate_identity(&path)?
        }
    };

    let keys = settings.key_store()?;

    let sys = actix::System::new();
    let node = sys.block_on(Node::start(settings, identity, Arc::new(keys)))?;
    info!("node {} listening on {}", node.id(), node.address());

    sys.block_on(async move {
        let sig = if cfg!(unix) {
            use futures::future::FutureExt;
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(mut sigint), Ok(mut sigterm)) => futures::select! {
                    _ = sigint.recv().fuse() => "SIGINT",
                    _ = sigterm.recv().fuse() => "SIGTERM"
                },
                _ => {
                    error!("could not install signal handlers");
                    "error"
                }
            }
        } else {
            let _ = tokio::signal::ctrl_c().await;
            "Ctrl+C"
        };
        info!("Got {}, stopping...", sig);

        node.shutdown().await;
        actix::System::current().stop();
    });
    sys.run()?;

    Ok(())
}
