#![no_main]

use bytes::BytesMut;
use control_channel::core::codec::FrameCodec;
use control_channel::utils::crypto::Cipher;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Decode a hostile byte stream, with and without a cipher
    let Ok(cipher) = Cipher::new(b"0123456789abcdef") else {
        return;
    };
    for cipher in [None, Some(cipher)] {
        let mut codec = FrameCodec::with_max_frame_size(cipher, 64 * 1024);
        let mut buf = BytesMut::from(data);
        while let Ok(Some(_)) = codec.decode(&mut buf) {}
    }
});
