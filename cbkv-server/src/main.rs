//! # Mock Node Binary
//!
//! Usage: `cbkv-server [--listen ADDR]` (default `127.0.0.1:11210`).
//! Log verbosity follows `RUST_LOG`.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cbkv_server::{serve, Store};

const DEFAULT_LISTEN: &str = "127.0.0.1:11210";

fn listen_addr() -> Result<String> {
    let mut args = env::args().skip(1);
    let mut listen = DEFAULT_LISTEN.to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => listen = args.next().context("--listen needs an address")?,
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(listen)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = listen_addr()?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    serve(listener, Arc::new(Store::new()), shutdown).await?;
    Ok(())
}
