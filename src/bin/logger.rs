//! System logger: registers as `logger`, collects `log_msg` frames from
//! every agent, reorders them by date inside a small window and prints them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use hyper_runtime::logcollect::{LogEntry, ReorderBuffer};
use hyper_runtime::ping::{DEFAULT_PING_PERIOD, PingTask};
use hyper_runtime::{AgentName, Dispatcher, Message, NameClient, ReplyHandle, Server};
use tracing::{debug, error, info};

/// How long a message is held back so stragglers can be ordered before it.
const REORDER_WINDOW: Duration = Duration::from_millis(200);
/// Flush cadence.
const FLUSH_PERIOD: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "logger", about = "Collects and orders log messages from agents")]
struct Args {
    /// Name server address.
    #[arg(long, default_value = "localhost:4242")]
    nameserver: String,
}

struct LogDispatcher {
    buffer: Arc<Mutex<ReorderBuffer>>,
}

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, msg: Message, _reply: &ReplyHandle) {
        match msg {
            Message::LogMsg { date, src, msg } => {
                self.buffer
                    .lock()
                    .expect("log buffer poisoned")
                    .push(LogEntry { date, src, msg });
            }
            Message::InformDeathAgent { name } => {
                debug!(%name, "agent death reported");
            }
            other => debug!(kind = other.kind(), "ignoring frame"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hyper_runtime=info".parse()?),
        )
        .init();

    let (host, port) = args
        .nameserver
        .rsplit_once(':')
        .context("nameserver must be host:port")?;
    let addr = tokio::net::lookup_host((host, port.parse::<u16>()?))
        .await?
        .next()
        .with_context(|| format!("{} has no address", args.nameserver))?;

    let client = Arc::new(NameClient::new(addr));
    let name = AgentName::literal("logger");
    let assigned = match client.register(&name, vec![]).await {
        Ok(assigned) => assigned,
        Err(e) => {
            error!(error = %e, "failed to register with the name server");
            std::process::exit(1);
        }
    };

    let buffer = Arc::new(Mutex::new(ReorderBuffer::new(REORDER_WINDOW)));
    let dispatcher = Arc::new(LogDispatcher {
        buffer: buffer.clone(),
    });
    let server = match Server::bind(assigned, dispatcher.clone()).await {
        Ok(server) => server,
        Err(_) => {
            let server = Server::bind(SocketAddr::new(assigned.ip(), 0), dispatcher)
                .await
                .context("binding logger server")?;
            client.register(&name, vec![server.local_addr()]).await?;
            server
        }
    };
    let ping = PingTask::spawn(client, name.to_string(), DEFAULT_PING_PERIOD);
    info!(addr = %server.local_addr(), "logger collecting");

    let mut flush = tokio::time::interval(FLUSH_PERIOD);
    loop {
        tokio::select! {
            _ = flush.tick() => {
                let ready = buffer
                    .lock()
                    .expect("log buffer poisoned")
                    .drain_ready(Utc::now());
                for entry in ready {
                    println!("{}", entry.render());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for entry in buffer.lock().expect("log buffer poisoned").drain_all() {
        println!("{}", entry.render());
    }
    ping.stop().await;
    server.stop().await;
    Ok(())
}
