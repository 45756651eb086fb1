//! Client side of the document Q&A service: the HTTP API, the stream decoder
//! and the chat session reducer.

pub mod service;
pub mod session;
pub mod sse;
pub mod stream;

pub use service::ServiceClient;
pub use session::{ChatSession, Notice, TurnFold, TurnId, TurnOutcome, TurnUpdate};
