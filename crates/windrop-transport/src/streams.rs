//! Framing pumps between QUIC streams and [`ProtocolStream`]
//!
//! The engine and hub speak whole frames; QUIC speaks bytes. Two pump
//! tasks per stream translate: outbound frames gain a u32-LE length
//! prefix, inbound bytes are reassembled with [`split_frame`]. Dropping
//! the application side stops the pumps, which closes the QUIC stream.

use iroh::endpoint::{RecvStream, SendStream};
use tracing::debug;

use windrop_core::{ProtocolStream, split_frame};

const READ_CHUNK: usize = 8 * 1024;
const STREAM_BUFFER: usize = 64;

/// Wrap a QUIC bi-stream into a frame-oriented [`ProtocolStream`].
pub(crate) fn frame_stream(mut send: SendStream, mut recv: RecvStream) -> ProtocolStream {
    let (app_side, pump_side) = ProtocolStream::pair(STREAM_BUFFER);
    let (pump_tx, mut pump_rx) = pump_side.split();

    // Outbound: application frames onto the wire.
    tokio::spawn(async move {
        while let Some(frame) = pump_rx.recv().await {
            let mut wire = Vec::with_capacity(4 + frame.len());
            wire.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            wire.extend_from_slice(&frame);
            if send.write_all(&wire).await.is_err() {
                break;
            }
        }
        let _ = send.finish();
    });

    // Inbound: wire bytes back into frames.
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match recv.read(&mut chunk).await {
                Ok(Some(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    loop {
                        match split_frame(&mut buf) {
                            Ok(Some(body)) => {
                                if pump_tx.send(body).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!(error = %e, "closing stream on oversized frame");
                                return;
                            }
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "stream read ended");
                    return;
                }
            }
        }
    });

    app_side
}
