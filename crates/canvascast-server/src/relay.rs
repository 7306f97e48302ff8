//! Whiteboard relay: one normalizer task that owns the outbound track.
//!
//! Producer readers push raw packets into a bounded queue. The normalizer
//! drains it in arrival order, rewrites sequence numbers and timestamps
//! into a steady monotonic stream, and writes the result to the shared
//! outbound track, which the engine replicates to every subscribed peer.
//!
//! Timestamp smoothing: each packet advances the outbound clock by the
//! inbound delta of its own source. Once the warm-up is over, a delta larger
//! than the running average of all previous deltas is clamped to that
//! average.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canvascast_common::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::engine::{MediaPacket, MediaSink, PeerLink};
use crate::keyframe::KeyframeRefresher;

/// Packets forwarded before the smoothing clamp applies.
pub const WARMUP_PACKETS: u64 = 10;

pub const DEFAULT_RELAY_QUEUE: usize = 256;

/// Sequence and timestamp rewriting state. Mutated only by the normalizer.
#[derive(Debug, Default)]
pub struct TimestampNormalizer {
    /// Last unmodified inbound timestamp, per source.
    last_in: HashMap<u32, u32>,
    elapsed: u64,
    forwarded: u64,
    next_sequence: u16,
}

impl TimestampNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites `packet` in place and returns the delta applied to the
    /// outbound clock.
    pub fn normalize(&mut self, packet: &mut MediaPacket) -> u32 {
        let ssrc = packet.header.ssrc;
        let inbound = packet.header.timestamp;

        let mut delta = match self.last_in.insert(ssrc, inbound) {
            None => 0,
            Some(previous) => {
                let step = inbound.wrapping_sub(previous);
                // Reordered packets look like a huge forward step.
                if step > u32::MAX / 2 {
                    0
                } else {
                    step
                }
            }
        };

        if self.forwarded >= WARMUP_PACKETS {
            let average = self.elapsed / self.forwarded;
            if u64::from(delta) > average {
                delta = average as u32;
            }
        }

        self.elapsed += u64::from(delta);
        self.forwarded += 1;

        packet.header.sequence_number = self.next_sequence;
        packet.header.timestamp = self.elapsed as u32;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        delta
    }

    /// Forgets a source so that it restarts with a zero delta if it returns.
    pub fn end_source(&mut self, ssrc: u32) {
        self.last_in.remove(&ssrc);
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    #[cfg(test)]
    pub(crate) fn seeded(elapsed: u64, forwarded: u64, last_in: &[(u32, u32)]) -> Self {
        Self {
            last_in: last_in.iter().copied().collect(),
            elapsed,
            forwarded,
            next_sequence: forwarded as u16,
        }
    }
}

/// A raw packet together with the connection that delivered it.
pub struct InboundPacket {
    pub packet: MediaPacket,
    pub producer: Arc<dyn PeerLink>,
}

enum RelayInput {
    Packet(InboundPacket),
    SourceEnded(u32),
}

#[derive(Debug, Default)]
pub struct RelayStats {
    packets_forwarded: AtomicU64,
    keyframe_requests: AtomicU64,
}

impl RelayStats {
    pub fn packets_forwarded(&self) -> u64 {
        self.packets_forwarded.load(Ordering::Relaxed)
    }

    pub fn keyframe_requests(&self) -> u64 {
        self.keyframe_requests.load(Ordering::Relaxed)
    }
}

/// Handle for feeding the normalizer. Cheap to clone.
#[derive(Clone)]
pub struct WhiteboardRelay {
    tx: mpsc::Sender<RelayInput>,
    stats: Arc<RelayStats>,
}

impl WhiteboardRelay {
    /// Starts the normalizer task. It runs until every handle is dropped.
    pub fn spawn(
        sink: Arc<dyn MediaSink>,
        keyframes: KeyframeRefresher,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(RelayStats::default());
        let handle = tokio::spawn(run_normalizer(rx, sink, keyframes, stats.clone()));
        (Self { tx, stats }, handle)
    }

    /// Queues one inbound packet. Waits while the queue is full.
    pub async fn submit(&self, packet: InboundPacket) -> Result<()> {
        self.tx
            .send(RelayInput::Packet(packet))
            .await
            .map_err(|_| Error::RelayClosed)
    }

    /// Tells the normalizer that a source's reader has stopped.
    pub async fn end_source(&self, ssrc: u32) {
        if self.tx.send(RelayInput::SourceEnded(ssrc)).await.is_err() {
            debug!(ssrc, "relay closed before source end");
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }
}

async fn run_normalizer(
    mut rx: mpsc::Receiver<RelayInput>,
    sink: Arc<dyn MediaSink>,
    mut keyframes: KeyframeRefresher,
    stats: Arc<RelayStats>,
) {
    let mut normalizer = TimestampNormalizer::new();
    info!("whiteboard relay started");

    while let Some(input) = rx.recv().await {
        match input {
            RelayInput::Packet(InboundPacket {
                mut packet,
                producer,
            }) => {
                let ssrc = packet.header.ssrc;
                if keyframes.on_packet(Instant::now(), &producer, ssrc) {
                    stats.keyframe_requests.fetch_add(1, Ordering::Relaxed);
                }

                let delta = normalizer.normalize(&mut packet);
                trace!(
                    ssrc,
                    delta,
                    seq = packet.header.sequence_number,
                    ts = packet.header.timestamp,
                    "forwarding packet"
                );

                stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                // Per-viewer delivery failures surface through each
                // viewer's own connection state.
                if let Err(err) = sink.write_packet(&packet).await {
                    debug!(ssrc, "outbound write failed: {}", err);
                }
            }
            RelayInput::SourceEnded(ssrc) => {
                debug!(ssrc, "inbound source ended");
                normalizer.end_source(ssrc);
            }
        }
    }

    info!(
        forwarded = normalizer.forwarded(),
        "whiteboard relay stopped"
    );
}
