//! Serialized, bidirectional signal exchange over one WebSocket.
//!
//! Writes go through an async mutex so that handshake replies and ICE
//! candidates emitted from engine callbacks never interleave on the wire.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures::channel::mpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Signal;

type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

pub struct SignalingChannel {
    writer: Mutex<Option<FrameSink>>,
    reader: Mutex<Option<FrameStream>>,
    closed: AtomicBool,
}

impl SignalingChannel {
    /// Builds a channel from any text sink/stream pair.
    pub fn from_parts<W, R>(sink: W, stream: R) -> Self
    where
        W: Sink<String, Error = Error> + Send + 'static,
        R: Stream<Item = Result<String>> + Send + 'static,
    {
        Self {
            writer: Mutex::new(Some(Box::pin(sink))),
            reader: Mutex::new(Some(Box::pin(stream))),
            closed: AtomicBool::new(false),
        }
    }

    /// Wraps an upgraded axum WebSocket. Only text frames carry signals;
    /// a binary frame is treated as malformed input.
    pub fn from_websocket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(Error::websocket)
            .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text))));
        let stream = stream.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(_)) => {
                    Some(Err(Error::protocol("binary frames are not supported")))
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Close(_)) => None,
                Err(err) => Some(Err(Error::websocket(err))),
            })
        });
        Self::from_parts(sink, stream)
    }

    /// Two in-memory channels wired back to back.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded::<String>();
        let (b_tx, b_rx) = mpsc::unbounded::<String>();
        let a = Self::from_parts(a_tx.sink_map_err(|_| Error::ChannelClosed), b_rx.map(Ok));
        let b = Self::from_parts(b_tx.sink_map_err(|_| Error::ChannelClosed), a_rx.map(Ok));
        (a, b)
    }

    /// Serializes and writes one signal. Concurrent callers are serialized.
    pub async fn send(&self, signal: &Signal) -> Result<()> {
        let text = serde_json::to_string(signal)?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink.send(text).await,
            None => Err(Error::ChannelClosed),
        }
    }

    /// Waits for the next signal. Fails on malformed JSON, on a transport
    /// error, or once the remote end has closed.
    pub async fn receive(&self) -> Result<Signal> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        match stream.next().await {
            Some(Ok(text)) => Ok(serde_json::from_str(&text)?),
            Some(Err(err)) => Err(err),
            None => Err(Error::ChannelClosed),
        }
    }

    /// Releases the connection. Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(err) = sink.close().await {
                debug!("signaling close: {}", err);
            }
        }
        // A reader parked in `receive` keeps its stream until it wakes up.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IceCandidate, SignalEvent};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (a, b) = SignalingChannel::pair();
        a.send(&Signal::offer_request()).await.unwrap();
        let got = b.receive().await.unwrap();
        assert_eq!(got, Signal::offer_request());
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (a, b) = SignalingChannel::pair();
        let a = Arc::new(a);
        let mut tasks = Vec::new();
        for i in 0..16u16 {
            let a = a.clone();
            tasks.push(tokio::spawn(async move {
                let candidate = IceCandidate {
                    candidate: format!("candidate:{i} 1 udp 1 10.0.0.1 {i} typ host"),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                };
                a.send(&Signal::ice(&candidate).unwrap()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        for _ in 0..16 {
            let signal = b.receive().await.unwrap();
            assert_eq!(signal.event, SignalEvent::Ice);
            assert!(signal.decode().is_ok());
        }
    }

    #[tokio::test]
    async fn test_malformed_input_fails_receive() {
        let (tx, rx) = mpsc::unbounded::<String>();
        let channel = SignalingChannel::from_parts(
            futures::sink::drain::<String>().sink_map_err(|_| Error::ChannelClosed),
            rx.map(Ok),
        );
        tx.unbounded_send("not json".to_string()).unwrap();
        assert!(matches!(
            channel.receive().await,
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_close_ends_receive() {
        let (a, b) = SignalingChannel::pair();
        a.close().await;
        assert!(matches!(b.receive().await, Err(Error::ChannelClosed)));
        assert!(matches!(
            a.send(&Signal::offer_request()).await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = SignalingChannel::pair();
        a.close().await;
        a.close().await;
        assert!(a.is_closed());
        assert!(matches!(a.receive().await, Err(Error::ChannelClosed)));
    }
}
