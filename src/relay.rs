//! In-process signaling relay.
//!
//! Forwards `to`-addressed client messages to their addressee, renaming
//! them to their peer-scoped form, and announces room membership. Every
//! message crosses the relay as JSON text, the same way it would cross a
//! socket.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
};

use futures::{channel::mpsc, StreamExt as _};
use tracing::{debug, warn};

use crate::{
    proto::{ClientMessage, ParticipantId, ServerMessage},
    signaling::SignalingLink,
    utils::{spawn_abortable, TaskHandle},
};

struct Client {
    link: SignalingLink,
    room: Option<String>,
    _pump: TaskHandle,
}

#[derive(Default)]
struct InnerRelay {
    clients: RefCell<HashMap<ParticipantId, Client>>,
    next_id: Cell<u64>,
    history: RefCell<Vec<(ParticipantId, ClientMessage)>>,

    /// Omit the joiner's id from `room:join` acks.
    anonymous_acks: bool,
}

#[derive(Clone, Default)]
pub struct LocalRelay(Rc<InnerRelay>);

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay acking joins with `{displayName, room}` only, so clients never
    /// learn their own id.
    pub fn with_anonymous_acks() -> Self {
        Self(Rc::new(InnerRelay {
            anonymous_acks: true,
            ..InnerRelay::default()
        }))
    }

    /// Registers a new client, returning its session id and link.
    pub fn connect(&self) -> (ParticipantId, SignalingLink) {
        let n = self.0.next_id.get() + 1;
        self.0.next_id.set(n);
        let id = ParticipantId(format!("peer-{}", n));

        let (link, outbound) = SignalingLink::new();
        let pump = self.pump(id.clone(), outbound);
        self.0.clients.borrow_mut().insert(
            id.clone(),
            Client {
                link: link.clone(),
                room: None,
                _pump: pump,
            },
        );
        debug!(%id, "client connected");

        (id, link)
    }

    /// Re-attaches a client whose link was disconnected.
    pub fn reconnect(&self, id: &ParticipantId) -> bool {
        let link = match self.0.clients.borrow().get(id) {
            Some(client) => client.link.clone(),
            None => return false,
        };
        let pump = self.pump(id.clone(), link.reconnect());
        if let Some(client) = self.0.clients.borrow_mut().get_mut(id) {
            client._pump = pump;
        }
        true
    }

    /// Every message received from clients, in arrival order.
    pub fn history(&self) -> Vec<(ParticipantId, ClientMessage)> {
        self.0.history.borrow().clone()
    }

    pub fn sent_by(&self, id: &ParticipantId) -> Vec<ClientMessage> {
        self.0
            .history
            .borrow()
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    fn pump(
        &self,
        id: ParticipantId,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    ) -> TaskHandle {
        let weak: Weak<InnerRelay> = Rc::downgrade(&self.0);
        spawn_abortable(async move {
            while let Some(msg) = outbound.next().await {
                match weak.upgrade() {
                    Some(inner) => Self(inner).route(&id, msg),
                    None => break,
                }
            }
        })
    }

    fn route(&self, from: &ParticipantId, msg: ClientMessage) {
        let msg = match msg
            .to_json()
            .and_then(|json| serde_json::from_str::<ClientMessage>(&json))
        {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%from, %e, "undecodable message dropped");
                return;
            }
        };
        self.0.history.borrow_mut().push((from.clone(), msg.clone()));

        match msg {
            ClientMessage::JoinRoom { display_name, room } => {
                let members: Vec<SignalingLink> = self
                    .0
                    .clients
                    .borrow()
                    .iter()
                    .filter(|(id, c)| {
                        *id != from && c.room.as_deref() == Some(room.as_str())
                    })
                    .map(|(_, c)| c.link.clone())
                    .collect();
                for link in members {
                    Self::forward(
                        &link,
                        ServerMessage::UserJoined {
                            display_name: display_name.clone(),
                            id: from.clone(),
                        },
                    );
                }
                if let Some(c) = self.0.clients.borrow_mut().get_mut(from) {
                    c.room = Some(room.clone());
                }
                self.deliver(
                    from,
                    ServerMessage::RoomJoined {
                        display_name,
                        room,
                        id: if self.0.anonymous_acks {
                            None
                        } else {
                            Some(from.clone())
                        },
                    },
                );
            }
            ClientMessage::CallUser { to, offer } => self.deliver(
                &to,
                ServerMessage::IncomingCall {
                    from: from.clone(),
                    offer,
                },
            ),
            ClientMessage::CallAccepted { to, ans } => self.deliver(
                &to,
                ServerMessage::CallAccepted {
                    from: from.clone(),
                    ans,
                },
            ),
            ClientMessage::NegotiationNeeded { offer, to } => self.deliver(
                &to,
                ServerMessage::NegotiationNeeded {
                    from: from.clone(),
                    offer,
                },
            ),
            ClientMessage::NegotiationDone { to, ans } => {
                self.deliver(&to, ServerMessage::NegotiationFinal { ans })
            }
        }
    }

    fn deliver(&self, to: &ParticipantId, msg: ServerMessage) {
        let link = self.0.clients.borrow().get(to).map(|c| c.link.clone());
        match link {
            Some(link) => Self::forward(&link, msg),
            None => warn!(%to, "unknown recipient, message dropped"),
        }
    }

    fn forward(link: &SignalingLink, msg: ServerMessage) {
        match serde_json::to_string(&msg)
            .and_then(|json| ServerMessage::from_json(&json))
        {
            Ok(msg) => link.deliver(msg),
            Err(e) => warn!(%e, "unencodable message dropped"),
        }
    }
}
