//! Duplex channel between a client and the signaling relay.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use futures::{channel::mpsc, Stream};
use tracing::{debug, warn};

use crate::{
    error::SignalingUnavailable,
    proto::{ClientMessage, EventKind, ServerMessage},
};

type Subscribers =
    HashMap<EventKind, Vec<(u64, mpsc::UnboundedSender<ServerMessage>)>>;

struct InnerLink {
    outbound: RefCell<Option<mpsc::UnboundedSender<ClientMessage>>>,
    subscribers: RefCell<Subscribers>,
    next_subscription: Cell<u64>,
}

/// Client side of the relay connection.
///
/// Outbound messages go to the receiver returned by [`SignalingLink::new`]
/// (the transport); inbound messages are handed to [`SignalingLink::deliver`]
/// and fanned out to live [`Subscription`]s.
#[derive(Clone)]
pub struct SignalingLink(Rc<InnerLink>);

impl SignalingLink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded();
        let link = Self(Rc::new(InnerLink {
            outbound: RefCell::new(Some(tx)),
            subscribers: RefCell::new(HashMap::new()),
            next_subscription: Cell::new(0),
        }));
        (link, rx)
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), SignalingUnavailable> {
        let outbound = self.0.outbound.borrow();
        let tx = outbound.as_ref().ok_or(SignalingUnavailable)?;
        debug!(event = ?msg, "signaling send");
        tx.unbounded_send(msg).map_err(|_| SignalingUnavailable)
    }

    pub fn subscribe(&self, event: EventKind) -> Subscription {
        self.subscribe_many(&[event])
    }

    /// Subscribes to several kinds at once. Messages are yielded in the
    /// order they were delivered, whatever their kind.
    pub fn subscribe_many(&self, events: &[EventKind]) -> Subscription {
        let id = self.0.next_subscription.get();
        self.0.next_subscription.set(id + 1);

        let (tx, rx) = mpsc::unbounded();
        let mut subscribers = self.0.subscribers.borrow_mut();
        for event in events {
            subscribers.entry(*event).or_default().push((id, tx.clone()));
        }

        Subscription {
            id,
            events: events.to_vec(),
            rx,
            link: Rc::downgrade(&self.0),
        }
    }

    /// Dispatches an inbound message to every subscriber of its kind.
    pub fn deliver(&self, msg: ServerMessage) {
        let kind = msg.kind();
        let mut subscribers = self.0.subscribers.borrow_mut();
        match subscribers.get_mut(&kind) {
            Some(handlers) if !handlers.is_empty() => {
                handlers.retain(|(_, tx)| !tx.is_closed());
                for (_, tx) in handlers.iter() {
                    let _ = tx.unbounded_send(msg.clone());
                }
            }
            _ => debug!(%kind, "no subscribers, message dropped"),
        }
    }

    /// Drops the transport. Sends fail until [`SignalingLink::reconnect`].
    pub fn disconnect(&self) {
        if self.0.outbound.borrow_mut().take().is_some() {
            warn!("signaling link disconnected");
        }
    }

    /// Installs a fresh transport, returning its outbound side.
    pub fn reconnect(&self) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded();
        *self.0.outbound.borrow_mut() = Some(tx);
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.0
            .outbound
            .borrow()
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    pub fn subscribers_count(&self, event: EventKind) -> usize {
        self.0
            .subscribers
            .borrow()
            .get(&event)
            .map_or(0, Vec::len)
    }
}

/// Inbound messages of the subscribed [`EventKind`]s. Dropping it
/// unsubscribes.
pub struct Subscription {
    id: u64,
    events: Vec<EventKind>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    link: Weak<InnerLink>,
}

impl Subscription {
    pub fn events(&self) -> &[EventKind] {
        &self.events
    }

    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = ServerMessage;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(link) = self.link.upgrade() {
            let mut subscribers = link.subscribers.borrow_mut();
            for event in &self.events {
                if let Some(handlers) = subscribers.get_mut(event) {
                    handlers.retain(|(id, _)| *id != self.id);
                }
            }
        }
    }
}
