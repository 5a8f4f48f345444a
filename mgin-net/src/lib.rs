// The network-facing half of mgin: the single-writer `Engine` actor
// (§3.7, §5), the command dispatch table every request runs through
// (§4.1-§4.16), and the WebSocket session that carries requests in from
// the wire (§4.14).

pub mod commands;
pub mod engine;
pub mod session;

pub use engine::{spawn_engine, BlockchainState, Engine, EngineHandle};
pub use session::handle_connection;
