//! Request handling for one client connection.
//!
//! [`RequestHandler::handle`] takes one decoded request and the connection's
//! [`Session`] and produces exactly one response. Each request that touches
//! storage runs in its own transaction; any failure rolls it back by dropping
//! the transaction before the response is built.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use mq_core::domain::{validate_content, validate_name, DomainError, Priority};
use mq_core::protocol::{
    ProtocolMessage, QueueModification, RetrieveMessageRequest, ReturnedMessage,
    SendMessageRequest, StatusCode,
};
use mq_core::ClientId;

use crate::application::events::{EventSink, ServerEvent};
use crate::application::storage::{NewMessage, Storage, StorageError};

const NOT_CONNECTED: &str = "Client must be connected before attempting any other action.";
const UNEXPECTED_TYPE: &str = "Unexpected message type received.";

/// The client a session is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClient {
    pub id: ClientId,
    pub username: String,
}

/// Protocol state of one connection, independent of its socket.
#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    client: Option<SessionClient>,
    disconnect_requested: bool,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            client: None,
            disconnect_requested: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn client(&self) -> Option<&SessionClient> {
        self.client.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.client.is_some()
    }

    /// True once a disconnect request succeeded; no further requests are read.
    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested
    }
}

/// Applies the broker's request rules against a [`Storage`] backend.
pub struct RequestHandler {
    storage: Arc<dyn Storage>,
    events: Arc<dyn EventSink>,
}

impl RequestHandler {
    pub fn new(storage: Arc<dyn Storage>, events: Arc<dyn EventSink>) -> Self {
        Self { storage, events }
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Handles one request and returns the single response to send back.
    pub fn handle(&self, session: &mut Session, request: ProtocolMessage) -> ProtocolMessage {
        let kind = request.message_type();
        let response = match session.client.clone() {
            None => match request {
                ProtocolMessage::ConnectionRequest(req) if req.is_connect => self
                    .connect(session, req.username)
                    .unwrap_or_else(|err| self.storage_failure(session.peer, err)),
                _ => ProtocolMessage::response(StatusCode::Exception, NOT_CONNECTED),
            },
            Some(client) => self.dispatch(session, &client, request),
        };

        self.events.emit(&ServerEvent::RequestCompleted {
            peer: session.peer,
            request: kind,
            status: status_of(&response),
        });
        response
    }

    /// Marks the session's client offline when its connection goes away
    /// without a disconnect request.
    pub fn release(&self, session: &mut Session) {
        let Some(client) = session.client.take() else {
            return;
        };
        let result = self.storage.begin().and_then(|mut tx| {
            tx.set_client_online(client.id, false)?;
            tx.commit()
        });
        match result {
            Ok(()) => self.events.emit(&ServerEvent::ClientDisconnected {
                peer: session.peer,
                username: client.username,
            }),
            Err(err) => self.events.emit(&ServerEvent::StorageFailure {
                peer: session.peer,
                error: err.to_string(),
            }),
        }
    }

    fn dispatch(
        &self,
        session: &mut Session,
        client: &SessionClient,
        request: ProtocolMessage,
    ) -> ProtocolMessage {
        let outcome = match request {
            ProtocolMessage::ConnectionRequest(req) if req.is_connect => {
                Ok(ProtocolMessage::response(StatusCode::Success, ""))
            }
            ProtocolMessage::ConnectionRequest(_) => self.disconnect(session, client),
            ProtocolMessage::QueueModification(req) => self.modify_queue(req),
            ProtocolMessage::SendMessage(req) => self.send_message(client, req),
            ProtocolMessage::RetrieveMessage(req) => self.retrieve_message(client, req),
            ProtocolMessage::RetrieveQueues => self.retrieve_queues(client),
            other => {
                self.events.emit(&ServerEvent::UnexpectedRequest {
                    peer: session.peer,
                    request: other.message_type(),
                });
                return ProtocolMessage::response(StatusCode::Exception, UNEXPECTED_TYPE);
            }
        };
        outcome.unwrap_or_else(|err| self.storage_failure(session.peer, err))
    }

    // ── Connection requests ───────────────────────────────────────────────────

    fn connect(&self, session: &mut Session, username: String) -> Result<ProtocolMessage, StorageError> {
        if let Err(err) = validate_name(&username, "username") {
            return Ok(rejected(err));
        }

        let mut tx = self.storage.begin()?;
        let id = match tx.find_client_by_username(&username)? {
            Some(existing) if existing.online => {
                return Ok(ProtocolMessage::response(
                    StatusCode::UserOnline,
                    format!("user {username} is already online"),
                ));
            }
            Some(existing) => {
                tx.set_client_online(existing.id, true)?;
                existing.id
            }
            None => tx.create_client(&username, true)?,
        };
        tx.commit()?;

        self.events.emit(&ServerEvent::ClientConnected {
            peer: session.peer,
            username: username.clone(),
        });
        session.client = Some(SessionClient { id, username });
        Ok(ProtocolMessage::response(StatusCode::Success, ""))
    }

    fn disconnect(
        &self,
        session: &mut Session,
        client: &SessionClient,
    ) -> Result<ProtocolMessage, StorageError> {
        let mut tx = self.storage.begin()?;
        tx.set_client_online(client.id, false)?;
        tx.commit()?;

        session.client = None;
        session.disconnect_requested = true;
        self.events.emit(&ServerEvent::ClientDisconnected {
            peer: session.peer,
            username: client.username.clone(),
        });
        Ok(ProtocolMessage::response(StatusCode::Success, ""))
    }

    // ── Queue and message requests ────────────────────────────────────────────

    fn modify_queue(&self, req: QueueModification) -> Result<ProtocolMessage, StorageError> {
        if let Err(err) = validate_name(&req.queue_name, "queue name") {
            return Ok(rejected(err));
        }

        let mut tx = self.storage.begin()?;
        if req.is_delete {
            tx.delete_queue(&req.queue_name)?;
        } else {
            tx.create_queue(&req.queue_name)?;
        }
        tx.commit()?;
        Ok(ProtocolMessage::response(StatusCode::Success, ""))
    }

    fn send_message(
        &self,
        client: &SessionClient,
        req: SendMessageRequest,
    ) -> Result<ProtocolMessage, StorageError> {
        let message = match validate_send(client.id, req) {
            Ok(message) => message,
            Err(err) => return Ok(rejected(err)),
        };

        let mut tx = self.storage.begin()?;
        tx.create_message(&message)?;
        tx.commit()?;
        Ok(ProtocolMessage::response(StatusCode::Success, ""))
    }

    fn retrieve_message(
        &self,
        client: &SessionClient,
        req: RetrieveMessageRequest,
    ) -> Result<ProtocolMessage, StorageError> {
        let mut tx = self.storage.begin()?;
        let Some(found) = tx.retrieve_top_message(client.id, req.filter, &req.value, req.order)? else {
            return Ok(ProtocolMessage::response(
                StatusCode::NoMessage,
                "no message matches the request",
            ));
        };
        if req.pop {
            tx.delete_message_from_queue(found.id, &found.queue)?;
        }
        tx.commit()?;

        Ok(ProtocolMessage::ReturnedMessage(ReturnedMessage {
            id: found.id,
            context: found.context,
            priority: found.priority,
            content: found.content,
            sender: found.sender,
            receiver: found.receiver,
            queue: found.queue,
        }))
    }

    fn retrieve_queues(&self, client: &SessionClient) -> Result<ProtocolMessage, StorageError> {
        let mut tx = self.storage.begin()?;
        let queues = tx.queues_with_pending_messages_for(client.id)?;
        tx.commit()?;

        if queues.is_empty() {
            Ok(ProtocolMessage::response(
                StatusCode::NoQueue,
                format!("no queue holds messages for {}", client.username),
            ))
        } else {
            Ok(ProtocolMessage::ReturnedQueues(queues))
        }
    }

    fn storage_failure(&self, peer: SocketAddr, err: StorageError) -> ProtocolMessage {
        let status = match &err {
            StorageError::QueueExists(_) => StatusCode::QueueExists,
            StorageError::QueueNotFound(_) => StatusCode::QueueNotExists,
            StorageError::QueueNotEmpty(_) => StatusCode::QueueNotEmpty,
            StorageError::ClientNotFound(_) => StatusCode::NoClient,
            StorageError::PoolTimeout(_) | StorageError::Backend(_) => {
                self.events.emit(&ServerEvent::StorageFailure {
                    peer,
                    error: err.to_string(),
                });
                StatusCode::Exception
            }
        };
        ProtocolMessage::response(status, err.to_string())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn validate_send(sender: ClientId, req: SendMessageRequest) -> Result<NewMessage, DomainError> {
    let priority = Priority::new(req.priority)?;
    validate_content(&req.content)?;

    let mut seen = HashSet::new();
    let queues: Vec<String> = req
        .queues
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect();
    if queues.is_empty() {
        return Err(DomainError::NoQueues);
    }
    for name in &queues {
        validate_name(name, "queue name")?;
    }

    Ok(NewMessage {
        sender,
        receiver: req.receiver,
        queues,
        context: req.context,
        priority,
        content: req.content,
    })
}

fn rejected(err: DomainError) -> ProtocolMessage {
    ProtocolMessage::response(StatusCode::Exception, err.to_string())
}

fn status_of(response: &ProtocolMessage) -> StatusCode {
    match response {
        ProtocolMessage::RequestResponse(r) => r.status,
        _ => StatusCode::Success,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
