//! Sample server binary.
//!
//! Wires the RPC runtime and the vector index together behind a CLI:
//! listens on the configured endpoints, binds an echo service, the file
//! transfer service, the rendezvous service, and (when codebooks are
//! supplied) the vector search service.

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};
use vector_rpc::cli::Args;
use vector_rpc::filetransfer::{FileTransferOptions, FileTransferService};
use vector_rpc::filter::tls::server_config_from_pem_with_client_auth;
use vector_rpc::ivf::index_ivfpq::PqParams;
use vector_rpc::ivf::service::{VectorSearchService, VECTOR_SEARCH_SERVICE};
use vector_rpc::ivf::{IndexIvfPq, IndexStatus, IvfParams};
use vector_rpc::{Endpoint, RemoteException, RpcServer, ServerConfig, ServiceFn};

mod logging;
use logging::ColorizedFormatter;

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if args.threads > 0 {
        builder.worker_threads(args.threads);
    } else {
        builder.worker_threads(num_cpus::get());
    }
    let runtime = builder.build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    // Configure logging level based on verbosity flags.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed diagnostics go to a rolling file (or stderr); the guard
    // must stay alive for the duration of the program.
    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("vector_rpc.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "vector_rpc.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, colorized user-facing output on stdout unless --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    info!("Starting vector-rpc server v{}", vector_rpc::VERSION);
    if args.log_file.as_deref() != Some("stderr") {
        let today = chrono::Local::now().format("%Y-%m-%d");
        let base = args.log_file.as_deref().unwrap_or("vector_rpc.log");
        info!("Diagnostics logged to {base}.{today}");
    }

    // A machine-readable echo of the effective configuration, for scripts
    // that wrap the server.
    #[derive(serde::Serialize)]
    struct EffectiveConfig<'a> {
        version: &'a str,
        listen: &'a [String],
        threads: usize,
        tls: bool,
        proxy_endpoints: bool,
        file_transfer: bool,
        vector_index: bool,
    }
    let summary = EffectiveConfig {
        version: vector_rpc::VERSION,
        listen: &args.listen,
        threads: args.threads,
        tls: args.cert.is_some(),
        proxy_endpoints: args.enable_proxy_endpoints,
        file_transfer: args.upload_dir.is_some() && args.download_dir.is_some(),
        vector_index: args.index_path.is_some() && args.db_path.is_some(),
    };
    info!("Configuration: {}", serde_json::to_string(&summary)?);

    let mut config = ServerConfig {
        enable_proxy_endpoints: args.enable_proxy_endpoints,
        ..ServerConfig::default()
    };
    for listen in &args.listen {
        let endpoint = Endpoint::parse(listen)
            .map_err(|e| anyhow::anyhow!("bad --listen {listen}: {e}"))?;
        config.endpoints.push(endpoint);
    }
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        let cert_pem = std::fs::read(cert).with_context(|| format!("read {}", cert.display()))?;
        let key_pem = std::fs::read(key).with_context(|| format!("read {}", key.display()))?;
        let ca_pem = match &args.ca {
            Some(ca) => {
                Some(std::fs::read(ca).with_context(|| format!("read {}", ca.display()))?)
            }
            None => None,
        };
        config.tls = Some(server_config_from_pem_with_client_auth(
            &cert_pem,
            &key_pem,
            ca_pem.as_deref(),
        )?);
        info!(
            "TLS enabled{}",
            if ca_pem.is_some() {
                " with client certificate verification"
            } else {
                ""
            }
        );
    }
    if let Some(secret) = &args.auth_secret {
        config.auth_secret = Some(secret.clone().into_bytes());
    }

    let server = RpcServer::new(config);

    // A small echo binding doubles as the liveness check.
    server.bind(
        "Echo",
        ServiceFn(|_session, method_id, params: Vec<u8>| async move {
            match method_id {
                1 => Ok(params),
                other => Err(RemoteException::new(1, format!("unknown method {other}"))),
            }
        }),
    );

    if let (Some(upload_dir), Some(download_dir)) = (&args.upload_dir, &args.download_dir) {
        let service = FileTransferService::new(FileTransferOptions {
            upload_dir: upload_dir.clone(),
            download_dir: download_dir.clone(),
            server_bps: args.server_bps,
            quota: None,
        });
        server.bind(vector_rpc::defaults::FILE_TRANSFER_SERVICE, service);
        info!(
            "File transfer service bound (uploads: {}, downloads: {})",
            upload_dir.display(),
            download_dir.display()
        );
    }

    if let (Some(index_path), Some(db_path)) = (&args.index_path, &args.db_path) {
        let mut index = IndexIvfPq::new(
            IvfParams {
                n: args.index_n,
                d: args.index_d,
                l: args.index_l,
                kc: args.index_kc,
            },
            PqParams {
                mp: args.index_mp,
                kp: args.index_kp,
            },
            index_path.clone(),
            db_path.clone(),
            "served-index",
            IndexStatus::Local,
        )?;
        index.load_index().context("load index codebooks")?;
        index.load_segments_all().context("load index segments")?;
        info!(
            "Vector search service bound ({} vectors, {} clusters)",
            index.ntotal(),
            args.index_kc
        );
        server.bind(
            VECTOR_SEARCH_SERVICE,
            VectorSearchService::new(Arc::new(RwLock::new(index))),
        );
    }

    server.start().await.map_err(|e| {
        error!("failed to start: {e}");
        anyhow::anyhow!("{e}")
    })?;
    for (i, listen) in args.listen.iter().enumerate() {
        if let Some(addr) = server.bound_addr(i) {
            info!("Listening on {addr} ({listen})");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop();
    Ok(())
}
