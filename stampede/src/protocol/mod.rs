//! Session strategies scenarios use to talk to the system under test.
//!
//! - [`http`]: stateless request/response, one [`crate::metric::RequestRecord`]
//!   per call.
//! - [`duplex`]: a long-lived text-frame session with a hard timeout, over any
//!   [`duplex::Connector`]; [`ws`] provides the WebSocket one and [`stomp`]
//!   builds the frames.
pub mod duplex;
pub mod http;
pub mod stomp;
pub mod ws;

pub use duplex::{
    CloseReason, Connector, DuplexPlan, DuplexState, FrameTransport, SessionOutcome,
    TransportError, run_session,
};
pub use http::{ExpectedStatuses, Http, RequestSpec, Response};
pub use stomp::Frame;
pub use ws::{WsConnector, WsTransport};
