//! Cross-partition forwarding of control operations
//!
//! A node asked to cancel, pause, resume, restart or patch an execution it
//! does not own publishes an [`InterlinkEvent`]. Every node consumes every
//! event; only the owner applies it, once per fingerprint inside the
//! suppression window.

pub mod event;
pub mod flagger;
pub mod handler;
pub mod postgres;
pub mod transport;


pub use event::{Fingerprinter, InterlinkEvent, InterlinkEventKind, Sha256Fingerprinter};
pub use flagger::{EventFlagger, MessageFlagger};
pub use handler::{HandleOutcome, InterlinkMessageHandler, InterlinkStats, InterlinkStatsSnapshot};
pub use postgres::PgInterlink;
pub use transport::{InMemoryInterlink, InterlinkTransport};
