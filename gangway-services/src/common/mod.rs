//! Shared traffic-plane primitives: one-shot wake-all signals, the
//! per-connection context, and the panic guard.
mod cancel;
mod context;
mod panic;

pub use cancel::{Signal, Waiter};
pub use context::{client_ip, ConnContext, PeerAddr};
pub use panic::CatchPanicHandler;
