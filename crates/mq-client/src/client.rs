//! TCP connection to the broker and the typed request methods on top of it.

use mq_core::protocol::{
    decode_body, decode_header, encode_frame, ConnectionRequest, ProtocolMessage,
    QueueModification, RetrieveMessageRequest, ReturnedMessage, SendMessageRequest, StatusCode,
    HEADER_SIZE,
};
use mq_core::{Context, FilterType, OrderBy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::error::ClientError;

/// A message to publish. Built with chained setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    content: String,
    queues: Vec<String>,
    priority: u8,
    context: Context,
    receiver: Option<String>,
}

impl OutgoingMessage {
    /// A broadcast message with priority 5 and no context.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            queues: Vec::new(),
            priority: 5,
            context: Context::None,
            receiver: None,
        }
    }

    pub fn to_queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    /// Raw priority. The broker rejects values outside 1..=10.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Addresses the message to one client instead of broadcasting it.
    pub fn receiver(mut self, username: impl Into<String>) -> Self {
        self.receiver = Some(username.into());
        self
    }

    fn to_request(&self) -> ProtocolMessage {
        ProtocolMessage::SendMessage(SendMessageRequest {
            priority: self.priority,
            context: self.context,
            queues: self.queues.clone(),
            content: self.content.clone(),
            receiver: self.receiver.clone(),
        })
    }
}

/// Which message a retrieve call looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    filter: FilterType,
    value: String,
    order: OrderBy,
}

impl Selector {
    /// Messages in `queue`, highest priority first.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            filter: FilterType::Queue,
            value: queue.into(),
            order: OrderBy::Priority,
        }
    }

    /// Messages sent by `username` in any queue, highest priority first.
    pub fn sender(username: impl Into<String>) -> Self {
        Self {
            filter: FilterType::Sender,
            value: username.into(),
            order: OrderBy::Priority,
        }
    }

    pub fn ordered_by(mut self, order: OrderBy) -> Self {
        self.order = order;
        self
    }

    fn to_request(&self, pop: bool) -> ProtocolMessage {
        ProtocolMessage::RetrieveMessage(RetrieveMessageRequest {
            filter: self.filter,
            order: self.order,
            pop,
            value: self.value.clone(),
        })
    }
}

/// An authenticated session with the broker.
pub struct BrokerClient {
    stream: TcpStream,
    username: String,
}

impl BrokerClient {
    /// Opens a connection and authenticates as `username`.
    ///
    /// # Errors
    ///
    /// [`ClientError::ServerFull`] when the broker is saturated,
    /// [`ClientError::UserOnline`] when the username already has a session,
    /// or a transport error.
    pub async fn connect(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        username: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let label = format!("{addr:?}");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::ConnectFailed {
                addr: label,
                source,
            })?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream,
            username: username.into(),
        };
        let request = ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: true,
            username: client.username.clone(),
        });
        let response = client.request(&request).await?;
        expect_success(response)?;
        debug!("connected to broker as {}", client.username);
        Ok(client)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// # Errors
    ///
    /// [`ClientError::QueueExists`] if the name is taken.
    pub async fn create_queue(&mut self, name: &str) -> Result<(), ClientError> {
        let response = self.request(&queue_modification(name, false)).await?;
        expect_success(response)
    }

    /// # Errors
    ///
    /// [`ClientError::QueueNotFound`] or [`ClientError::QueueNotEmpty`].
    pub async fn delete_queue(&mut self, name: &str) -> Result<(), ClientError> {
        let response = self.request(&queue_modification(name, true)).await?;
        expect_success(response)
    }

    /// Publishes `message` into every queue it names, or none at all.
    ///
    /// # Errors
    ///
    /// [`ClientError::QueueNotFound`] if any queue is unknown,
    /// [`ClientError::ClientNotFound`] if the receiver is unknown, or
    /// [`ClientError::Server`] for validation failures.
    pub async fn send_message(&mut self, message: &OutgoingMessage) -> Result<(), ClientError> {
        let response = self.request(&message.to_request()).await?;
        expect_success(response)
    }

    /// Returns the top message without removing it.
    pub async fn peek_message(
        &mut self,
        selector: &Selector,
    ) -> Result<Option<ReturnedMessage>, ClientError> {
        self.retrieve(selector, false).await
    }

    /// Returns the top message and removes it from the queue it was found in.
    pub async fn pop_message(
        &mut self,
        selector: &Selector,
    ) -> Result<Option<ReturnedMessage>, ClientError> {
        self.retrieve(selector, true).await
    }

    /// Names of the queues holding messages addressed to this client.
    pub async fn queues_with_messages(&mut self) -> Result<Vec<String>, ClientError> {
        match self.request(&ProtocolMessage::RetrieveQueues).await? {
            ProtocolMessage::ReturnedQueues(names) => Ok(names),
            ProtocolMessage::RequestResponse(r) if r.status == StatusCode::NoQueue => Ok(Vec::new()),
            other => Err(unexpected(other)),
        }
    }

    /// Ends the session. The broker closes the socket after replying.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        let request = ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: false,
            username: String::new(),
        });
        let response = self.request(&request).await?;
        expect_success(response)?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Sends any request and returns the raw response frame.
    pub async fn request(&mut self, message: &ProtocolMessage) -> Result<ProtocolMessage, ClientError> {
        let frame = encode_frame(message)?;
        self.stream.write_all(&frame).await?;
        let response = self.read_frame().await?;
        debug!(
            request = ?message.message_type(),
            response = ?response.message_type(),
            "round trip complete"
        );
        Ok(response)
    }

    async fn retrieve(
        &mut self,
        selector: &Selector,
        pop: bool,
    ) -> Result<Option<ReturnedMessage>, ClientError> {
        match self.request(&selector.to_request(pop)).await? {
            ProtocolMessage::ReturnedMessage(message) => Ok(Some(message)),
            ProtocolMessage::RequestResponse(r) if r.status == StatusCode::NoMessage => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn read_frame(&mut self) -> Result<ProtocolMessage, ClientError> {
        let mut header = [0u8; HEADER_SIZE];
        read_exact(&mut self.stream, &mut header).await?;
        let body_len = decode_header(&header)?;
        let mut body = vec![0u8; body_len];
        read_exact(&mut self.stream, &mut body).await?;
        Ok(decode_body(&body)?)
    }
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ClientError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ClientError::Closed),
        Err(e) => Err(e.into()),
    }
}

fn queue_modification(name: &str, is_delete: bool) -> ProtocolMessage {
    ProtocolMessage::QueueModification(QueueModification {
        is_delete,
        queue_name: name.to_string(),
    })
}

fn expect_success(response: ProtocolMessage) -> Result<(), ClientError> {
    match response {
        ProtocolMessage::RequestResponse(r) if r.status == StatusCode::Success => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// Turns an error status into its typed error, anything else into
/// [`ClientError::UnexpectedResponse`].
fn unexpected(response: ProtocolMessage) -> ClientError {
    match response {
        ProtocolMessage::RequestResponse(r) => ClientError::from_status(r.status, r.description),
        other => ClientError::UnexpectedResponse(other.message_type()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
