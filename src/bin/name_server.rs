//! Central name registry process.

use anyhow::Context;
use clap::Parser;
use hyper_runtime::NameServer;
use tracing::info;

#[derive(Parser)]
#[command(name = "name_server", about = "Central name registry for hyper agents")]
struct Args {
    /// Host to listen on.
    host: String,
    /// Port to listen on.
    port: u16,
    /// Log registrations and resolutions as they happen.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let directive = if args.verbose {
        "hyper_runtime=debug"
    } else {
        "hyper_runtime=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    let addr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("resolving {}:{}", args.host, args.port))?
        .next()
        .with_context(|| format!("{}:{} has no address", args.host, args.port))?;

    let server = NameServer::bind(addr).await.context("binding name server")?;
    info!(addr = %server.local_addr(), "name server listening");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await;
    Ok(())
}
