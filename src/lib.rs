//! coterm - multi-client, multi-session terminal sharing.
//!
//! Spawns interactive AI coding assistants (or arbitrary commands) under
//! pseudoterminals and multiplexes them to browser clients over two
//! transports: a duplex WebSocket and a long-poll JSON pair. A shadow
//! terminal mirrors every byte so late joiners are caught up with a
//! snapshot of the current screen instead of a replay.

pub mod assistant;
pub mod poll;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod session;
pub mod term;
pub mod upload;
pub mod ws;

pub use assistant::{AssistantCatalog, AssistantConfig};
pub use protocol::{ServerMessage, TermSize};
pub use pty::PtyProcess;
pub use server::run_server;
pub use session::{Session, SessionRegistry};
pub use term::VirtualTerminal;
