//! Protocol recognition and hand-off on a shared port.
//!
//! # Data Flow
//! ```text
//! accepted stream
//!     → dispatcher.rs (reads under the first-packet deadline)
//!     → sniffer.rs (capped buffer, PROXY header stripping)
//!     → recognizer.rs (rules in priority order → Verdict)
//!     → handler.rs (ProtocolHandler chosen by descriptor)
//!         ├─ HTTP hand-off (crate::http)
//!         ├─ NRPC server (crate::rpc::server)
//!         └─ forward.rs (raw TCP relay)
//! ```
//!
//! # Design Decisions
//! - Recognition is total: the byte ceiling turns "need more" into "no match"
//! - The dispatcher never decodes payloads; handlers receive the raw stream
//!   with the sniffed prefix replayed

pub mod descriptor;
pub mod dispatcher;
pub mod forward;
pub mod handler;
pub mod proxy_header;
pub mod recognizer;
pub mod sniffer;

pub use descriptor::ProtocolDescriptor;
pub use dispatcher::{DispatchSettings, ProtocolDispatcher};
pub use forward::ForwardHandler;
pub use handler::{AsyncIo, BoxedIo, ConnectionInfo, ProtocolError, ProtocolHandler};
pub use recognizer::{Recognition, RecognitionRule, RecognizerSet, Verdict};
pub use sniffer::{RejectReason, SniffState, Sniffer};
