//! Process lifecycle.
//!
//! ```text
//! SIGTERM/SIGINT → Shutdown::trigger → accept loop stops
//!     → in-flight connections drain (bounded) → RPC clients close → exit
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{shutdown_on_signal, wait_for_signal};
