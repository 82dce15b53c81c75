mod admission;
mod config;
mod crd;
mod error;
mod handlers;
mod health;
mod metrics;
mod mutator;
mod resolver;
mod store;
mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;
use clap::Parser;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use kube::{Client, CustomResourceExt};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "cmstate-injector",
    about = "Mutating admission webhook linking Pods to their CMState"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        default_value = "/etc/cmstate-injector/config.yaml",
        env = "CMSTATE_CONFIG"
    )]
    config: String,

    /// Print the CMTemplate and CMState CRDs as YAML and exit
    #[arg(long)]
    crd: bool,
}

fn print_crds() -> Result<(), serde_yaml::Error> {
    let template = serde_yaml::to_string(&crd::CMTemplate::crd())?;
    let state = serde_yaml::to_string(&crd::CMState::crd())?;
    print!("---\n{template}---\n{state}");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_webhook_server(
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    router: Router,
    ready: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    ready.store(true, Ordering::Relaxed);

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("webhook server shutting down");
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }
}

async fn run_health_server(listener: TcpListener, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
}

fn exit_with(message: String) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.crd {
        if let Err(e) = print_crds() {
            exit_with(format!("Failed to render CRDs: {e}"));
        }
        return;
    }

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let config = config::InjectorConfig::load(&cli.config)
        .unwrap_or_else(|e| exit_with(format!("Failed to load config from {}: {e}", cli.config)));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        webhook_path = %config.webhook_path,
        store_timeout_ms = config.store_timeout_ms,
        "cmstate-injector starting"
    );

    let tls_config = tls::load_tls_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| exit_with(format!("Failed to load TLS config: {e}")));
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let listen_addr: SocketAddr = config.listen_addr.parse().unwrap_or_else(|e| {
        exit_with(format!("Invalid listen_addr '{}': {e}", config.listen_addr))
    });
    let metrics_addr: SocketAddr = config.metrics_addr.parse().unwrap_or_else(|e| {
        exit_with(format!("Invalid metrics_addr '{}': {e}", config.metrics_addr))
    });

    let client = Client::try_default()
        .await
        .unwrap_or_else(|e| exit_with(format!("Failed to create Kubernetes client: {e}")));
    let store = store::KubeStore::new(client, config.store_timeout());

    let mut registry = Registry::default();
    let injector_metrics = metrics::InjectorMetrics::new(&mut registry);
    let registry = Arc::new(registry);

    let app_state = Arc::new(handlers::AppState {
        store: Arc::new(store),
        metrics: injector_metrics,
    });

    let webhook_router = Router::new()
        .route(&config.webhook_path, post(handlers::handle_mutate))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(app_state);

    let ready = Arc::new(AtomicBool::new(false));
    let health_router = health::router(Arc::new(health::HealthState {
        registry,
        ready: ready.clone(),
    }));

    let listener = TcpListener::bind(listen_addr)
        .await
        .unwrap_or_else(|e| exit_with(format!("Failed to bind HTTPS on {listen_addr}: {e}")));
    info!(%listen_addr, "HTTPS webhook server listening");

    let health_listener = TcpListener::bind(metrics_addr)
        .await
        .unwrap_or_else(|e| exit_with(format!("Failed to bind HTTP on {metrics_addr}: {e}")));
    info!(%metrics_addr, "HTTP metrics/health server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_webhook_server(listener, tls_acceptor, webhook_router, ready, shutdown_rx.clone()),
        run_health_server(health_listener, health_router, shutdown_rx),
    );

    info!("cmstate-injector shut down gracefully");
}
