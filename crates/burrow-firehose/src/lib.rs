//! Real-time repository event stream for burrow.
//!
//! Repository mutations are published on an in-process [`EventBus`] that
//! stamps each event with a monotonic sequence number. Each subscriber
//! connection runs a [`FirehoseSession`] that frames events as DAG-CBOR
//! header plus payload pairs and writes them to a [`FrameSink`].

pub mod bus;
pub mod error;
pub mod event;
pub mod frame;
pub mod session;

pub use bus::{EventBus, EventFilter, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use error::FirehoseError;
pub use event::{
    AccountEvent, CommitEvent, ErrorEvent, EventBody, EventKind, FirehoseEvent, HandleEvent, IdentityEvent,
    InfoEvent, MigrateEvent, OpAction, RepoOp, TombstoneEvent,
};
pub use frame::{decode_frame, encode_frame, FrameHeader, OP_ERROR, OP_MESSAGE};
pub use session::{CloseReason, FirehoseSession, FrameSink, SessionState};
