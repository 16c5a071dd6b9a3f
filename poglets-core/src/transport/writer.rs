//! Single writer task per session
//!
//! Every producer (driver, stream writers) enqueues frames on one bounded
//! channel. This task is the only one touching the sink, so frames reach
//! the wire whole and in enqueue order.

use super::FrameSink;
use crate::stream::ActivityClock;
use bytes::BytesMut;
use poglets_protocol::codec::TunnelCodec;
use poglets_protocol::Frame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_BATCH_FRAMES: usize = 32;
const MAX_BATCH_BYTES: usize = 256 * 1024;

pub(crate) async fn run_frame_writer(
    mut frames: mpsc::Receiver<Frame>,
    mut sink: Box<dyn FrameSink>,
    outbound: Arc<ActivityClock>,
    cancel: CancellationToken,
) {
    let codec = TunnelCodec::new();
    let mut buffer = BytesMut::with_capacity(MAX_BATCH_BYTES);

    loop {
        let first = tokio::select! {
            biased;
            frame = frames.recv() => frame,
            () = cancel.cancelled() => None,
        };
        let Some(first) = first else {
            break;
        };

        encode_batch(&codec, first, &mut frames, &mut buffer);
        if buffer.is_empty() {
            continue;
        }
        if let Err(e) = sink.send_batch(buffer.split().freeze()).await {
            warn!("Control connection write failed: {e}");
            cancel.cancel();
            return;
        }
        outbound.touch();
    }

    // Flush whatever the driver queued on its way out (GoAway, Error).
    while let Ok(frame) = frames.try_recv() {
        encode_batch(&codec, frame, &mut frames, &mut buffer);
        if buffer.is_empty() {
            continue;
        }
        if sink.send_batch(buffer.split().freeze()).await.is_err() {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("Control connection close: {e}");
    }
}

/// Encode `first` plus whatever else is already queued, up to the batch limits.
fn encode_batch(
    codec: &TunnelCodec,
    first: Frame,
    frames: &mut mpsc::Receiver<Frame>,
    buffer: &mut BytesMut,
) {
    let mut next = Some(first);
    let mut count = 0;
    while let Some(frame) = next.take() {
        if let Err(e) = codec.encode_frame(&frame, buffer) {
            warn!("Dropping unencodable {:?} frame: {e}", frame.kind());
        }
        count += 1;
        if count < MAX_BATCH_FRAMES && buffer.len() < MAX_BATCH_BYTES {
            next = frames.try_recv().ok();
        }
    }
}
