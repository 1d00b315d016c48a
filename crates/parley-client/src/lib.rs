//! Parley client: gateway adapters for the call core and the `parley` CLI.

pub mod demo;
pub mod records;
pub mod session;
pub mod signaling;

pub use demo::{run_demo, DemoOptions, DemoPeers, DemoReport};
pub use records::{GatewayPresence, RemoteCallStore};
pub use session::{wait_for_view, GatewaySession};
pub use signaling::{ws_url, GatewayChannel, UNDELIVERABLE_REASON};
