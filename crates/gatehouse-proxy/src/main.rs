//! Gateway binary.
//!
//! | Variable           | Default        | Meaning                          |
//! |--------------------|----------------|----------------------------------|
//! | `GATEHOUSE_CONFIG` | `gateway.yaml` | path to the YAML config file     |
//! | `GATEHOUSE_LISTEN` | from config    | override for the listen address  |
//! | `RUST_LOG`         | `info`         | tracing filter                   |

use gatehouse_proxy::server::GatewayServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gatehouse_proxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path =
        std::env::var("GATEHOUSE_CONFIG").unwrap_or_else(|_| "gateway.yaml".to_string());
    let mut server = match GatewayServer::from_file(&config_path) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("gatehouse: {config_path}: {err}");
            std::process::exit(1);
        }
    };
    if let Ok(listen) = std::env::var("GATEHOUSE_LISTEN") {
        server = server.with_listen(listen);
    }

    if let Err(err) = server.run().await {
        eprintln!("gatehouse: {err}");
        std::process::exit(1);
    }
}
