#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use poglets_protocol::codec::TunnelCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Both decoders must reject garbage without panicking.
    let _ = poglets_protocol::decode(data);

    let mut codec = TunnelCodec::with_max_frame_size(1024 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
