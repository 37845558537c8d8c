//! Mapping service: UDP frame ingestion, rule-driven mapping, admin API.
//!
//! # Environment variables
//! | Var                           | Default                          |
//! |-------------------------------|----------------------------------|
//! | `MAPPING_BROKER_ADDR`         | `0.0.0.0:7100`                   |
//! | `MAPPING_ADMIN_ADDR`          | `0.0.0.0:8090`                   |
//! | `MAPPING_PUBLISH_ADDR`        | unset → outbound not published   |
//! | `MAPPING_STORE_DIR`           | `./mapping-store`                |
//! | `MAPPING_TENANT`              | `t100`                           |
//! | `MAPPING_WORKERS`             | `4`                              |
//! | `MAPPING_QUEUE_SIZE`          | `1024`                           |
//! | `MAPPING_FLAT_FILE_DELIMITER` | `,`                              |
//! | `PLATFORM_URL`                | unset → in-memory fake platform  |
//! | `PLATFORM_TOKEN`              | optional                         |

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use mapping_service::admin::{self, AppState};
use mapping_service::builtin::StaticExtensionSource;
use mapping_service::codec;
use mapping_service::config::ServiceConfig;
use mapping_service::dispatcher::{self, Dispatcher, InboundMessage};
use mapping_service::extension::ExtensionRegistry;
use mapping_service::mapping_registry::MappingRegistry;
use mapping_service::platform::{FakeTargetPlatform, HttpTargetPlatform, TargetPlatform};
use mapping_service::processor::ProcessorSet;
use mapping_service::publisher::UdpPublisher;
use mapping_service::status::MappingStatusTracker;
use mapping_service::store::FileMappingStore;

const MAX_PACKET_SIZE: usize = 65_507;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mapping_service=info".parse()?),
        )
        .json()
        .init();

    let config = ServiceConfig::from_env()?;
    let tenant = config.tenant.clone();

    let platform: Arc<dyn TargetPlatform> = match &config.platform_url {
        Some(url) => {
            info!(url = %url, "Using HttpTargetPlatform");
            Arc::new(HttpTargetPlatform::new(url, config.platform_token.clone()))
        }
        None => {
            info!("No PLATFORM_URL; using FakeTargetPlatform");
            Arc::new(FakeTargetPlatform::new())
        }
    };

    let store = Arc::new(FileMappingStore::new(&config.store_dir));
    let registry = Arc::new(MappingRegistry::new(store));
    let snapshot = registry
        .load(&tenant)
        .await
        .with_context(|| format!("Failed to load mappings from {}", config.store_dir.display()))?;

    let extensions = Arc::new(ExtensionRegistry::new(Arc::new(StaticExtensionSource::builtin())));
    extensions
        .reload(&tenant, snapshot.configuration.external_extension_enabled)
        .await?;

    let status = Arc::new(MappingStatusTracker::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        ProcessorSet::new(&config.flat_file_delimiter, Arc::clone(&extensions)),
        platform,
        Arc::clone(&status),
    ));

    let (tx, rx) = mpsc::channel::<InboundMessage>(config.queue_size);
    dispatcher::spawn_workers(Arc::clone(&dispatcher), rx, config.workers);
    info!(workers = config.workers, "dispatch workers started");

    let publisher = match config.publish_addr {
        Some(addr) => {
            let publisher = UdpPublisher::bind(addr).await?;
            info!(addr = %publisher.target(), "publishing outbound frames");
            Some(Arc::new(publisher))
        }
        None => None,
    };

    let app = admin::router(Arc::new(AppState {
        tenant: tenant.clone(),
        registry,
        extensions,
        status,
        dispatcher,
        publisher,
    }));
    let listener = tokio::net::TcpListener::bind(config.admin_addr).await?;
    info!(addr = %config.admin_addr, "admin API listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "admin API stopped");
        }
    });

    let socket = UdpSocket::bind(config.broker_addr).await?;
    info!(addr = %config.broker_addr, "UDP listener bound");

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "UDP recv_from error");
                continue;
            }
        };

        match codec::decode(&buf[..len]) {
            Ok(frame) => {
                let message = InboundMessage {
                    tenant: tenant.clone(),
                    topic: frame.topic,
                    payload: frame.payload,
                };
                if let Err(e) = tx.try_send(message) {
                    warn!(peer = %peer, error = %e, "dispatch queue full, dropping message");
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "frame decode error");
            }
        }
    }
}
