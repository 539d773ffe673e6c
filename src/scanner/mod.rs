//! Stateless SYN probing.
//!
//! The sending flow builds probes whose sequence number and source port carry
//! a keyed cookie; the receiving flow recomputes that cookie from each
//! response's source address. Transports are pluggable so the engine can run
//! over raw sockets, a dry-run logger, or the in-memory mock.

pub mod cookie;
pub mod probe;
pub mod rate;
pub mod raw_socket;
pub mod receiver;
pub mod sender;
pub mod transport;

pub use cookie::{Cookie, Validator};
pub use probe::{ProbeBuilder, ProbeProfile};
pub use rate::RateLimiter;
pub use raw_socket::RawSocketTransport;
pub use receiver::{CreditMap, Receiver, Verdict};
pub use sender::{SendOutcome, Sender};
pub use transport::{DryRunTransport, MockNetwork, PacketCapture, ProbeTransmit, Transport};
