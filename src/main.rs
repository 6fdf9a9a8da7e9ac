use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use serde_json::json;

use tether_cluster::{DistributedRegistry, InMemoryBus, InMemoryStore, MessageBus};
use tether_core::{HubConfig, NodeId};
use tether_server::{arg, done, reply, ClientRegistry, Hub, HubContext, HubServer, Injector, MethodTable};
use tether_telemetry::{init_telemetry, TelemetryConfig};

/// Chat-room demo server for the tether messaging framework.
#[derive(Parser)]
#[command(name = "tether")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9090)]
    port: u16,
    /// Expected seconds between client heartbeat pulses.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    /// Missed heartbeat intervals tolerated before reaping.
    #[arg(long, default_value_t = 3)]
    heartbeat_tolerance: u32,
    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
    /// Route sends through the distributed registry (in-memory bus and
    /// store; swap in production collaborators to span real nodes).
    #[arg(long)]
    cluster: bool,
}

struct ChatHub;

#[async_trait]
impl Hub for ChatHub {
    fn methods(self: Arc<Self>) -> MethodTable {
        let mut table = MethodTable::new();
        table.method("Echo", 1, |_ctx, args| async move {
            let text: String = arg(&args, 0)?;
            reply(text)
        });
        table.method("Join", 1, |ctx: HubContext, args| async move {
            let room: String = arg(&args, 0)?;
            ctx.join_group(&room).await;
            ctx.group(&room)
                .await
                .send("UserJoined", vec![json!(room), json!(ctx.connection_id().to_string())])
                .await
                .ok();
            reply(room)
        });
        table.method("Leave", 1, |ctx: HubContext, args| async move {
            let room: String = arg(&args, 0)?;
            ctx.leave_group(&room).await;
            done()
        });
        table.method("Send", 2, |ctx: HubContext, args| async move {
            let room: String = arg(&args, 0)?;
            let text: String = arg(&args, 1)?;
            ctx.group(&room)
                .await
                .send(
                    "Message",
                    vec![
                        json!(room),
                        json!(ctx.connection_id().to_string()),
                        json!(text),
                        json!(Utc::now().to_rfc3339()),
                    ],
                )
                .await
                .ok();
            done()
        });
        table
    }

    async fn on_connected(&self, ctx: &HubContext) {
        tracing::info!(conn_id = %ctx.connection_id(), "chat client connected");
    }

    async fn on_disconnected(&self, ctx: &HubContext) {
        tracing::info!(conn_id = %ctx.connection_id(), "chat client left");
        ctx.others()
            .await
            .send("UserLeft", vec![json!(ctx.connection_id().to_string())])
            .await
            .ok();
    }

    fn on_invocation_error(&self, id: &tether_core::ConnectionId, method: &str, error: &tether_core::HubError) {
        tracing::warn!(conn_id = %id, method, kind = error.error_kind(), "call failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_telemetry(&TelemetryConfig {
        json: args.json_logs,
        ..Default::default()
    });

    let config = HubConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        heartbeat_tolerance: args.heartbeat_tolerance,
        ..Default::default()
    };

    let mut builder = HubServer::builder()
        .port(args.port)
        .config(config)
        .route("/chat", |_: &Injector| -> anyhow::Result<Arc<dyn Hub>> {
            Ok(Arc::new(ChatHub))
        });

    if args.cluster {
        let node = NodeId::new();
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStore::new());
        let registry = DistributedRegistry::new(node.clone(), ClientRegistry::new(), bus, store);
        registry.start();
        tracing::info!(node = %node, "distributed registry enabled");
        builder = builder.registry(Arc::new(registry));
    }

    let server = builder.start().await?;
    tracing::info!(port = server.port, "tether chat server ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown();
    Ok(())
}
