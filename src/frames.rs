use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_std::prelude::*;
use async_std::stream::Stream;
use async_std::task::ready;
use tide_websockets::Message;

use crate::types::UserId;
use crate::protocol::{decode_request, Request};
use crate::error::FrameError;

pin_project_lite::pin_project! {
    /// Decodes client requests out of a stream of websocket frames.
    #[derive(Debug)]
    pub(crate) struct RequestStream<S> {
        #[pin]
        frames: S,
    }
}

impl<S> RequestStream<S> {
    pub(crate) fn new(frames: S) -> Self {
        RequestStream { frames }
    }
}

impl<S, E> Stream for RequestStream<S>
    where S: Stream<Item = Result<Message, E>>, E: Display
{
    type Item = Result<Request, FrameError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            let msg = match ready!(this.frames.as_mut().poll_next(cx)) {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Poll::Ready(Some(Err(FrameError::Transport(e.to_string())))),
                None => return Poll::Ready(None),
            };

            let decoded = match msg {
                Message::Text(text) => decode_request(&text),
                Message::Binary(bytes) => serde_json::from_slice(&bytes),
                Message::Close(_) => return Poll::Ready(None),
                // Pings and pongs are answered by the websocket layer.
                _ => continue,
            };
            return Poll::Ready(Some(decoded.map_err(FrameError::from)));
        }
    }
}

/**
 * The first text frame on a new connection names the user. Whoever issued the token has already
 * vouched for it, so it's used as the user id as-is. None if the connection closed first.
 */
pub(crate) async fn read_user<S, E>(frames: &mut S) -> Result<Option<UserId>, FrameError>
    where S: Stream<Item = Result<Message, E>> + Unpin, E: Display
{
    while let Some(msg) = frames.next().await {
        match msg.map_err(|e| FrameError::Transport(e.to_string()))? {
            Message::Text(token) => {
                let token = token.trim();
                return Ok(if token.is_empty() { None } else { Some(token.to_string()) });
            },
            Message::Close(_) => return Ok(None),
            _ => {},
        }
    }
    Ok(None)
}
