#![no_main]

use bytes::BytesMut;
use control_channel::core::legacy::{FieldCipher, LegacyCodec};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = LegacyCodec::with_max_message_size(16 * 1024);
    let mut buf = BytesMut::from(data);
    let Ok(fields) = FieldCipher::new("00112233445566778899aabbccddeeff") else {
        return;
    };
    while let Ok(Some(mut msg)) = codec.decode(&mut buf) {
        let _ = fields.open(&mut msg);
    }
});
