//! Per-session RTP relay
//!
//! One pump per session reads datagram-framed RTP units from the session's
//! local receive socket and forwards each well-formed unit, unmodified and
//! in arrival order, into the session's outbound track. Malformed units are
//! dropped; a rejected forward ends the relay; cancellation unblocks a
//! pending read and ends it gracefully.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::Unmarshal;

use crate::{Error, Result};

/// Maximum size of one datagram-framed media unit
const MAX_UNIT_SIZE: usize = 1500;

/// Outbound destination for relayed RTP units
///
/// The production implementation writes into the session's WebRTC track;
/// tests substitute a recording sink.
#[async_trait]
pub trait RtpSink: Send + Sync {
    /// Forward one parsed unit; an error stops the relay for good
    async fn forward(&self, packet: &Packet) -> Result<()>;
}

/// [`RtpSink`] backed by a local WebRTC track
pub struct TrackSink {
    track: Arc<TrackLocalStaticRTP>,
}

impl TrackSink {
    pub fn new(track: Arc<TrackLocalStaticRTP>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl RtpSink for TrackSink {
    async fn forward(&self, packet: &Packet) -> Result<()> {
        self.track
            .write_rtp(packet)
            .await
            .map_err(|e| Error::MediaTrackError(format!("track rejected unit: {}", e)))?;
        Ok(())
    }
}

/// The per-session packet pump
///
/// Owns the receive socket exclusively; the socket closes when the pump
/// exits and the port lease the coordinator parks alongside it is released.
pub struct PacketPump {
    socket: UdpSocket,
    sink: Arc<dyn RtpSink>,
    cancel: CancellationToken,
}

impl PacketPump {
    pub fn new(socket: UdpSocket, sink: Arc<dyn RtpSink>, cancel: CancellationToken) -> Self {
        Self {
            socket,
            sink,
            cancel,
        }
    }

    /// Run the relay loop until cancellation, socket failure, or a rejected
    /// forward
    ///
    /// Units are handled strictly one at a time: read, parse, forward.
    /// Returns the number of units forwarded.
    pub async fn run(self) -> u64 {
        let mut buf = vec![0u8; MAX_UNIT_SIZE];
        let mut forwarded: u64 = 0;

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(forwarded, "relay stopped");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, _)) => n,
                    Err(e) => {
                        // A read error after cancellation is the expected
                        // teardown path, anything else is unexpected.
                        if self.cancel.is_cancelled() {
                            debug!(forwarded, "relay stopped during read");
                        } else {
                            error!(error = %e, forwarded, "relay read failed");
                        }
                        break;
                    }
                },
            };

            let mut raw = &buf[..n];
            let packet = match Packet::unmarshal(&mut raw) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(len = n, error = %e, "dropping malformed media unit");
                    continue;
                }
            };

            if let Err(e) = self.sink.forward(&packet).await {
                warn!(error = %e, forwarded, "outbound track rejected unit, stopping relay");
                break;
            }
            forwarded += 1;
        }

        forwarded
    }
}
