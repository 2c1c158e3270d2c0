//! A communication channel used to send/receive messages to/from another party.
//!
//! The engine itself never opens connections. It talks to its two ring neighbours through
//! whatever implements [`Channel`]; [`SimpleChannel`] is an in-memory implementation for tests
//! and simulations.

use std::{fmt, future::Future, time::Duration};

use thiserror::Error;
use tokio::{
    sync::mpsc::{Receiver, Sender, channel, error::SendError},
    time::timeout,
};
use tracing::trace;

/// Errors related to sending / receiving messages.
#[derive(Debug, Error)]
#[error("channel error during {phase}: {reason:?}")]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The message could not be received over the channel.
    RecvError(String),
    /// The message could not be sent over the channel.
    SendError(String),
    /// The message was received, but is not of the expected length.
    InvalidLength {
        /// The number of bytes the protocol expected.
        expected: usize,
        /// The number of bytes that arrived.
        actual: usize,
    },
}

/// A communication channel used to send/receive messages to/from another party.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index (must be between `0..participants`).
    fn send_bytes_to(
        &mut self,
        party: usize,
        msg: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::SendError>>;

    /// Awaits a message from the party with the given index (must be between `0..participants`).
    fn recv_bytes_from(
        &mut self,
        party: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>>;
}

/// Sends `msg` to `party`, attaching `phase` to any error.
pub(crate) async fn send_to(
    channel: &mut impl Channel,
    party: usize,
    phase: &str,
    msg: Vec<u8>,
) -> Result<(), Error> {
    channel.send_bytes_to(party, msg).await.map_err(|e| Error {
        phase: phase.to_string(),
        reason: ErrorKind::SendError(format!("{e:?}")),
    })
}

/// Receives exactly `len` bytes from `party`, attaching `phase` to any error.
pub(crate) async fn recv_from(
    channel: &mut impl Channel,
    party: usize,
    phase: &str,
    len: usize,
) -> Result<Vec<u8>, Error> {
    let msg = channel.recv_bytes_from(party).await.map_err(|e| Error {
        phase: phase.to_string(),
        reason: ErrorKind::RecvError(format!("{e:?}")),
    })?;
    if msg.len() != len {
        return Err(Error {
            phase: phase.to_string(),
            reason: ErrorKind::InvalidLength {
                expected: len,
                actual: msg.len(),
            },
        });
    }
    Ok(msg)
}

/// A simple in-memory channel using [`Sender`] and [`Receiver`].
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Receiver<Vec<u8>>>>,
    bytes_sent: usize,
}

impl SimpleChannel {
    /// How long a receive waits before giving up on a silent peer.
    pub const RECV_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels: Vec<SimpleChannel> = (0..parties)
            .map(|_| SimpleChannel {
                s: (0..parties).map(|_| None).collect(),
                r: (0..parties).map(|_| None).collect(),
                bytes_sent: 0,
            })
            .collect();
        for a in 0..parties {
            for b in (a + 1)..parties {
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                let (send_b_to_a, recv_b_to_a) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].s[a] = Some(send_b_to_a);
                channels[a].r[b] = Some(recv_b_to_a);
                channels[b].r[a] = Some(recv_a_to_b);
            }
        }
        channels
    }

    /// Total number of payload bytes sent through this channel.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }
}

/// The error raised by `send` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncSendError {
    /// There is no connection to the given party.
    NoSuchParty(usize),
    /// The receiving side has been dropped.
    Closed(SendError<Vec<u8>>),
}

/// The error raised by `recv` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncRecvError {
    /// There is no connection to the given party.
    NoSuchParty(usize),
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
}

impl Channel for SimpleChannel {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&mut self, p: usize, msg: Vec<u8>) -> Result<(), AsyncSendError> {
        let sender = self
            .s
            .get(p)
            .and_then(Option::as_ref)
            .ok_or(AsyncSendError::NoSuchParty(p))?;
        trace!(to = p, bytes = msg.len(), "sending message");
        let len = msg.len();
        sender.send(msg).await.map_err(AsyncSendError::Closed)?;
        self.bytes_sent += len;
        Ok(())
    }

    async fn recv_bytes_from(&mut self, p: usize) -> Result<Vec<u8>, AsyncRecvError> {
        let receiver = self
            .r
            .get_mut(p)
            .and_then(Option::as_mut)
            .ok_or(AsyncRecvError::NoSuchParty(p))?;
        match timeout(Self::RECV_TIMEOUT, receiver.recv()).await {
            Ok(Some(bytes)) => {
                trace!(from = p, bytes = bytes.len(), "received message");
                Ok(bytes)
            }
            Ok(None) => Err(AsyncRecvError::Closed),
            Err(_) => Err(AsyncRecvError::TimeoutElapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_order() -> Result<(), Error> {
        let mut parties = SimpleChannel::channels(3);
        let mut c = parties.pop().unwrap();
        let _b = parties.pop().unwrap();
        let mut a = parties.pop().unwrap();
        send_to(&mut a, 2, "first", vec![1, 2, 3]).await?;
        send_to(&mut a, 2, "second", vec![]).await?;
        assert_eq!(recv_from(&mut c, 0, "first", 3).await?, vec![1, 2, 3]);
        assert_eq!(recv_from(&mut c, 0, "second", 0).await?, Vec::<u8>::new());
        assert_eq!(a.bytes_sent(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_length_is_reported() {
        let mut parties = SimpleChannel::channels(2);
        let mut b = parties.pop().unwrap();
        let mut a = parties.pop().unwrap();
        send_to(&mut a, 1, "msg", vec![0; 4]).await.unwrap();
        let err = recv_from(&mut b, 0, "msg", 8).await.unwrap_err();
        assert!(matches!(
            err.reason,
            ErrorKind::InvalidLength {
                expected: 8,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn unknown_party_is_an_error() {
        let mut parties = SimpleChannel::channels(2);
        let mut a = parties.remove(0);
        assert!(matches!(
            a.send_bytes_to(5, vec![]).await,
            Err(AsyncSendError::NoSuchParty(5))
        ));
        assert!(matches!(
            a.recv_bytes_from(0).await,
            Err(AsyncRecvError::NoSuchParty(0))
        ));
    }
}
