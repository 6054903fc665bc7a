pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod translate;

pub use config::{BridgeConfig, UpstreamConfig};
pub use error::{BridgeError, Result};
pub use gateway::{HttpGateway, UpstreamGateway};
pub use logging::DiagnosticsLog;
pub use server::{build_router, AppState};
