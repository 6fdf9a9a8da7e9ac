pub mod connection;
pub mod hub;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod watchdog;

pub use connection::{ConnectionHandle, ConnectionState};
pub use hub::{arg, done, reply, Hub, HubContext, MethodTable};
pub use proxy::{null_proxy, ClientProxy, NullClientProxy, SendError};
pub use registry::{ClientRegistry, Registry};
pub use server::{HubServer, Injector, ServerHandle};
