//! Ratchetmix key-exchange protocol.
//!
//! Carries rekey triggers and confirms between partners over an abstract
//! [`Transport`], and runs the background [`NegotiationDriver`] that keeps
//! every partner's send sessions fresh.
//!
//! # Protocol
//!
//! ```text
//! Sender                                   Receiver
//!   │  Confirmed session crosses threshold    │
//!   │  create successor (Sending)             │
//!   │── KeyExchangeTrigger(source, pubkey) ──►│  create receive session
//!   │  Sent                                   │  (chained from source)
//!   │◄────────── KeyExchangeConfirm(id) ──────│
//!   │  Confirmed                              │
//! ```
//!
//! Both control messages travel end-to-end encrypted under existing session
//! keys. Triggers use reserved rekey keys so a drained pool can still be
//! replaced.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod driver;
pub mod error;
pub mod handler;
pub mod messages;
pub mod system_env;
pub mod transport;
pub mod trigger;

pub use driver::{DriverConfig, NegotiationDriver, NegotiationHandle};
pub use error::{ExchangeError, TransportError};
pub use handler::{handle_confirm, handle_trigger};
pub use messages::{open, seal, send_message};
pub use system_env::SystemEnv;
pub use transport::{
    Body, CriticalMessages, Envelope, GarbledMessages, ReceivedMessage, RoundId, SendReport,
    Transport,
};
pub use trigger::negotiate;
