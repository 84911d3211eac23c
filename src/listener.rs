use std::sync::Arc;

use crate::endpoint::EndpointId;
use crate::session::Session;

/// Observer of dispatcher lifecycle events.
///
/// Listeners form a stack: events are delivered to the most recently
/// pushed listener only, which decides whether to forward to its
/// predecessor through the [`Prev`] handle. Every default method body
/// forwards, so a listener only overrides the events it cares about.
pub trait DispatchListener<S: Session> {
    fn on_error(&mut self, prev: Prev<'_, S>, code: i64) {
        prev.on_error(code)
    }

    fn on_session_ready(&mut self, prev: Prev<'_, S>, session: &Arc<S>) {
        prev.on_session_ready(session)
    }

    fn on_server_busy(&mut self, prev: Prev<'_, S>, busy: bool) {
        prev.on_server_busy(busy)
    }

    fn on_endpoint_done(&mut self, prev: Prev<'_, S>, endpoint: EndpointId) {
        prev.on_endpoint_done(endpoint)
    }

    fn on_destroy(&mut self, prev: Prev<'_, S>) {
        prev.on_destroy()
    }
}

/// Handle to the listeners pushed before the current one. Consuming an
/// event method delivers it to the nearest predecessor, if any.
pub struct Prev<'a, S: Session>(&'a mut [Entry<S>]);

impl<S: Session> Prev<'_, S> {
    pub fn on_error(self, code: i64) {
        if let Some((top, rest)) = self.0.split_last_mut() {
            top.listener.on_error(Prev(rest), code);
        }
    }

    pub fn on_session_ready(self, session: &Arc<S>) {
        if let Some((top, rest)) = self.0.split_last_mut() {
            top.listener.on_session_ready(Prev(rest), session);
        }
    }

    pub fn on_server_busy(self, busy: bool) {
        if let Some((top, rest)) = self.0.split_last_mut() {
            top.listener.on_server_busy(Prev(rest), busy);
        }
    }

    pub fn on_endpoint_done(self, endpoint: EndpointId) {
        if let Some((top, rest)) = self.0.split_last_mut() {
            top.listener.on_endpoint_done(Prev(rest), endpoint);
        }
    }

    pub fn on_destroy(self) {
        if let Some((top, rest)) = self.0.split_last_mut() {
            top.listener.on_destroy(Prev(rest));
        }
    }
}

/// Handle for removing a pushed listener again
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

struct Entry<S: Session> {
    id: ListenerId,
    listener: Box<dyn DispatchListener<S>>,
}

pub(crate) struct ListenerChain<S: Session> {
    stack: Vec<Entry<S>>,
    next_id: u64,
}

impl<S: Session> ListenerChain<S> {
    pub(crate) fn new() -> Self {
        Self {
            stack: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn push(&mut self, listener: Box<dyn DispatchListener<S>>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.stack.push(Entry { id, listener });
        id
    }

    /// Unlinks a listener. Removing one that was never pushed is a logic
    /// error in the host.
    pub(crate) fn remove(&mut self, id: ListenerId) {
        let at = self
            .stack
            .iter()
            .position(|entry| entry.id == id)
            .expect("listener is not in the chain");
        self.stack.remove(at);
    }

    pub(crate) fn on_error(&mut self, code: i64) {
        Prev(&mut self.stack).on_error(code)
    }

    pub(crate) fn on_session_ready(&mut self, session: &Arc<S>) {
        Prev(&mut self.stack).on_session_ready(session)
    }

    pub(crate) fn on_server_busy(&mut self, busy: bool) {
        Prev(&mut self.stack).on_server_busy(busy)
    }

    pub(crate) fn on_endpoint_done(&mut self, endpoint: EndpointId) {
        Prev(&mut self.stack).on_endpoint_done(endpoint)
    }

    pub(crate) fn on_destroy(&mut self) {
        Prev(&mut self.stack).on_destroy()
    }
}
