use ballotdesk_core::{effects::Request, ids::MutationId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Outbound half of a network effect. `send` only issues the request; the
/// outcome comes back later through `Engine::settle` with the same ticket.
pub trait Transport {
    fn send(&mut self, ticket: MutationId, request: &Request) -> Result<(), TransportError>;
}
