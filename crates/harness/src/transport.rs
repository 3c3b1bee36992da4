use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ballotdesk_core::{effects::Request, ids::MutationId};
use ballotdesk_engine::{Transport, TransportError};

#[derive(Debug, Default)]
struct Wire {
    queue: VecDeque<(MutationId, Request)>,
    log: Vec<Request>,
    fail_next_send: Option<TransportError>,
}

/// Transport that parks every request until the test delivers it. Clones
/// share one wire, so the test keeps a handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    wire: Rc<RefCell<Wire>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests sent but not yet delivered.
    pub fn pending(&self) -> usize {
        self.wire.borrow().queue.len()
    }

    pub fn take_next(&self) -> Option<(MutationId, Request)> {
        self.wire.borrow_mut().queue.pop_front()
    }

    pub fn take(&self, ticket: MutationId) -> Option<Request> {
        let mut wire = self.wire.borrow_mut();
        let index = wire.queue.iter().position(|(t, _)| *t == ticket)?;
        wire.queue.remove(index).map(|(_, request)| request)
    }

    /// Every request accepted so far, in send order.
    pub fn log(&self) -> Vec<Request> {
        self.wire.borrow().log.clone()
    }

    pub fn clear_log(&self) {
        self.wire.borrow_mut().log.clear();
    }

    /// Make the next `send` fail synchronously with `error`.
    pub fn fail_next_send(&self, error: TransportError) {
        self.wire.borrow_mut().fail_next_send = Some(error);
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, ticket: MutationId, request: &Request) -> Result<(), TransportError> {
        let mut wire = self.wire.borrow_mut();
        if let Some(error) = wire.fail_next_send.take() {
            return Err(error);
        }
        wire.log.push(request.clone());
        wire.queue.push_back((ticket, request.clone()));
        Ok(())
    }
}
