//! Acceptor/supervisor: binds upgraded websockets to hubs and runs them.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use tether_core::{ConnectionId, HubConfig, JsonFormatter, MessageFormatter};

use crate::connection::{ConnectionActor, ConnectionCore, ConnectionHandle, ConnectionLifecycle, ConnectionState};
use crate::hub::{Hub, HubContext};
use crate::registry::{ClientRegistry, Registry};
use crate::watchdog::spawn_watchdog;

/// Best-effort dependency provider handed to hub factories. Unresolvable
/// types yield `None`; factories decide how to degrade.
#[derive(Default)]
pub struct Injector {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }
}

/// Constructs a hub for one accepted connection.
pub trait HubFactory: Send + Sync {
    fn create(&self, injector: &Injector) -> anyhow::Result<Arc<dyn Hub>>;
}

impl<F> HubFactory for F
where
    F: Fn(&Injector) -> anyhow::Result<Arc<dyn Hub>> + Send + Sync,
{
    fn create(&self, injector: &Injector) -> anyhow::Result<Arc<dyn Hub>> {
        self(injector)
    }
}

type FatalHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Builder for a hub server: routes, tunables, formatter, dependencies,
/// and (optionally) a distributed registry.
pub struct HubServer {
    port: u16,
    config: HubConfig,
    formatter: Arc<dyn MessageFormatter>,
    routes: HashMap<String, Arc<dyn HubFactory>>,
    injector: Injector,
    registry: Option<Arc<dyn Registry>>,
    on_fatal: Option<FatalHook>,
}

impl Default for HubServer {
    fn default() -> Self {
        Self {
            port: 0,
            config: HubConfig::default(),
            formatter: Arc::new(JsonFormatter),
            routes: HashMap::new(),
            injector: Injector::new(),
            registry: None,
            on_fatal: None,
        }
    }
}

impl HubServer {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Port to bind; 0 picks an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap the default JSON codec for another wire format.
    pub fn formatter(mut self, formatter: Arc<dyn MessageFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Register a hub factory under a websocket path.
    pub fn route(mut self, path: &str, factory: impl HubFactory + 'static) -> Self {
        self.routes.insert(path.to_owned(), Arc::new(factory));
        self
    }

    /// Make a value resolvable through the [`Injector`].
    pub fn inject<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.injector.provide(value);
        self
    }

    /// Replace the default process-local registry, e.g. with the
    /// distributed decorator.
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Hook invoked for failures that escape a connection's lifecycle.
    pub fn on_fatal(mut self, hook: impl Fn(&anyhow::Error) + Send + Sync + 'static) -> Self {
        self.on_fatal = Some(Arc::new(hook));
        self
    }

    /// Bind and start serving. Returns a handle owning the listener task.
    pub async fn start(self) -> Result<ServerHandle, std::io::Error> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ClientRegistry::new()));
        let shutdown = CancellationToken::new();

        let state = AppState {
            registry,
            config: self.config,
            formatter: self.formatter,
            injector: Arc::new(self.injector),
            shutdown: shutdown.clone(),
            on_fatal: self.on_fatal,
        };

        let router = build_router(state, &self.routes);
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        info!(port = local_addr.port(), "hub server started");

        let serve_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                .await
                .ok();
        });

        Ok(ServerHandle {
            port: local_addr.port(),
            shutdown,
            _server: server,
        })
    }
}

/// Handle returned by `start()`. Keeps the listener task alive and fans
/// shutdown out to every live connection.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    _server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting and cancel every connection's token; each actor then
    /// runs its own disposal path.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<dyn Registry>,
    config: HubConfig,
    formatter: Arc<dyn MessageFormatter>,
    injector: Arc<Injector>,
    shutdown: CancellationToken,
    on_fatal: Option<FatalHook>,
}

fn build_router(state: AppState, routes: &HashMap<String, Arc<dyn HubFactory>>) -> Router {
    let mut router = Router::new().route("/health", get(health_handler));
    for (path, factory) in routes {
        let factory = Arc::clone(factory);
        router = router.route(
            path,
            get(move |ws: WebSocketUpgrade, State(state): State<AppState>| {
                let factory = Arc::clone(&factory);
                async move {
                    ws.max_message_size(state.config.max_frame_bytes)
                        .on_upgrade(move |socket| handle_socket(socket, state, factory))
                }
            }),
        );
    }
    router.with_state(state).layer(CorsLayer::permissive())
}

/// Bind one upgraded socket to a freshly constructed hub and run its actor
/// loop. Nothing escapes to the acceptor's caller: construction failures go
/// to the fatal hook and the socket is simply dropped.
async fn handle_socket(socket: WebSocket, state: AppState, factory: Arc<dyn HubFactory>) {
    let hub = match factory.create(&state.injector) {
        Ok(hub) => hub,
        Err(e) => {
            error!(error = %e, "hub construction failed");
            if let Some(hook) = &state.on_fatal {
                hook(&e);
            }
            return;
        }
    };
    let methods = Arc::new(Arc::clone(&hub).methods());

    let id = ConnectionId::new();
    let cancel = state.shutdown.child_token();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.max_send_queue);
    let core = Arc::new(ConnectionCore::new(id.clone(), outbound_tx.clone(), cancel));

    let handle = Arc::new(ConnectionHandle::new(
        id.clone(),
        outbound_tx,
        Arc::clone(&state.formatter),
    ));
    state.registry.add(id.clone(), handle).await;
    core.set_state(ConnectionState::Open);
    info!(conn_id = %id, "client connected");

    let ctx = HubContext::new(id, Arc::clone(&state.registry));
    hub.on_connected(&ctx).await;

    let lifecycle = Arc::new(ConnectionLifecycle {
        core,
        registry: Arc::clone(&state.registry),
        hub,
        ctx,
    });
    let watchdog = spawn_watchdog(Arc::clone(&lifecycle), &state.config);

    let actor = ConnectionActor {
        lifecycle,
        methods,
        formatter: state.formatter,
    };
    actor.run(socket, outbound_rx).await;
    let _ = watchdog.await;
}

/// Liveness endpoint: connection count and status.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.registry.count().await;
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": connections,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::MethodTable;
    use async_trait::async_trait;

    struct NoopHub;

    #[async_trait]
    impl Hub for NoopHub {
        fn methods(self: Arc<Self>) -> MethodTable {
            MethodTable::new()
        }
    }

    #[test]
    fn injector_resolves_provided_values() {
        let mut injector = Injector::new();
        injector.provide(String::from("db-handle"));
        injector.provide(42u32);

        assert_eq!(injector.get::<String>().as_deref(), Some(&"db-handle".to_owned()));
        assert_eq!(injector.get::<u32>().as_deref(), Some(&42));
        assert!(injector.get::<u64>().is_none());
    }

    #[test]
    fn factory_can_degrade_on_missing_dependency() {
        let factory = |injector: &Injector| -> anyhow::Result<Arc<dyn Hub>> {
            // Missing dependency is not fatal per the permissive policy.
            let _maybe = injector.get::<String>();
            Ok(Arc::new(NoopHub))
        };
        let hub = factory.create(&Injector::new());
        assert!(hub.is_ok());
    }

    #[tokio::test]
    async fn server_starts_on_ephemeral_port_and_serves_health() {
        let handle = HubServer::builder()
            .route("/hub", |_: &Injector| -> anyhow::Result<Arc<dyn Hub>> {
                Ok(Arc::new(NoopHub))
            })
            .start()
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);

        handle.shutdown();
    }
}
