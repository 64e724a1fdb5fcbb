//! Client side of the hub wire protocol.

use std::marker::PhantomData;
use tokio::net::{TcpStream, ToSocketAddrs};

use super::protocol::{Request, Response};
use crate::codec::Codec;
use crate::error::{HubError, Result};
use crate::frame::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::types::Event;

/// Publishing connection to a broker hub.
pub struct HubClient {
    stream: TcpStream,
    codec: Codec,
    max_frame_size: usize,
}

impl HubClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            codec: Codec::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    /// Encode events with `codec`; must match the server's hub config.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Publish `event` and wait for the broker to accept it.
    ///
    /// The ack only means the broker took the event; delivery happens later.
    pub async fn publish<E: Event>(&mut self, event: &E) -> Result<()> {
        let request = Request::Publish {
            event_type: E::event_type().to_string(),
            payload: self.codec.encode(event)?,
        };
        frame::write_async(&mut self.stream, &request).await?;

        match frame::read_async::<_, Response>(&mut self.stream, self.max_frame_size).await? {
            Some(Response::Ack) => Ok(()),
            Some(Response::Error { message }) => Err(HubError::PublishRejected(message)),
            Some(Response::Event { .. }) => Err(HubError::Transport(
                "unexpected event frame on publish connection".to_string(),
            )),
            None => Err(HubError::Transport("connection closed before ack".to_string())),
        }
    }

    /// Open a subscriber stream for `subscriber_id` on the hub for `E`.
    pub async fn subscribe<E: Event, A: ToSocketAddrs>(
        addr: A,
        subscriber_id: impl Into<String>,
    ) -> Result<RemoteSubscription<E>> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let request = Request::Subscribe {
            event_type: E::event_type().to_string(),
            subscriber_id: subscriber_id.into(),
        };
        frame::write_async(&mut stream, &request).await?;

        Ok(RemoteSubscription {
            stream,
            codec: Codec::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            _marker: PhantomData,
        })
    }
}

/// Event stream received from a hub server. Dropping it disconnects.
pub struct RemoteSubscription<E: Event> {
    stream: TcpStream,
    codec: Codec,
    max_frame_size: usize,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Event> RemoteSubscription<E> {
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Next event, or `None` when the server ends the stream.
    pub async fn next(&mut self) -> Option<Result<E>> {
        loop {
            let response = match frame::read_async::<_, Response>(&mut self.stream, self.max_frame_size).await {
                Ok(Some(response)) => response,
                Ok(None) => return None,
                Err(e) => return Some(Err(e.into())),
            };

            match response {
                Response::Event { payload } => return Some(self.codec.decode(&payload)),
                Response::Error { message } => return Some(Err(HubError::Transport(message))),
                Response::Ack => continue,
            }
        }
    }
}
