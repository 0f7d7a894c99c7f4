pub mod address;
pub mod bounce;
pub mod composer;
pub mod config;
pub mod contacts;
pub mod dispatch;
pub mod gate;
pub mod ledger;
pub mod statistics;
pub mod transport;

pub use bounce::{BounceError, BounceSet, BounceSource, ImapBounceSource};
pub use composer::{MessageComposer, OutreachEmail};
pub use config::Config;
pub use contacts::{load_contacts, Contact};
pub use dispatch::{run, RunContext, RunOptions, RunSettings, RunSummary, StopReason};
pub use gate::{Clock, LocalClock, SendWindow, WarmupSchedule};
pub use ledger::{FailureReason, SendLedger};
pub use statistics::LedgerStats;
pub use transport::{SmtpTransport, Transport, TransportError};
