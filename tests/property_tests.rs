//! Property-based tests using proptest
//!
//! Cipher and frame invariants over randomly generated keys and payloads, plus
//! the decoder's behaviour on arbitrary input.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use control_channel::core::codec::{
    open_frame, read_frame, seal_frame, write_frame, FrameCodec, LENGTH_PREFIX,
};
use control_channel::core::legacy::{FieldCipher, LegacyCodec, LegacyMessage};
use control_channel::error::ChannelError;
use control_channel::store::CommandQueue;
use control_channel::utils::crypto::{Cipher, IV_SIZE, KEY_SIZE};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), KEY_SIZE..=KEY_SIZE)
}

// Property: decrypt(encrypt(m, k), k) == m
proptest! {
    #[test]
    fn prop_cipher_roundtrip(
        key in key_strategy(),
        plaintext in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let cipher = Cipher::new(&key).unwrap();
        let sealed = cipher.encrypt(&plaintext).unwrap();
        prop_assert_eq!(sealed.len(), plaintext.len() + IV_SIZE);
        prop_assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
    }
}

// Property: anything shorter than one IV fails instead of yielding plaintext
proptest! {
    #[test]
    fn prop_short_ciphertext_rejected(
        key in key_strategy(),
        body in prop::collection::vec(any::<u8>(), 0..IV_SIZE),
    ) {
        let cipher = Cipher::new(&key).unwrap();
        prop_assert!(matches!(cipher.decrypt(&body), Err(ChannelError::Crypto(_))));
    }
}

// Property: no integrity protection; a flipped bit changes the plaintext
// but decryption still "succeeds"
proptest! {
    #[test]
    fn prop_bit_flip_goes_undetected(
        key in key_strategy(),
        plaintext in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
    ) {
        let cipher = Cipher::new(&key).unwrap();
        let mut sealed = cipher.encrypt(&plaintext).unwrap();
        let at = IV_SIZE + index.index(plaintext.len());
        sealed[at] ^= 0x01;
        let opened = cipher.decrypt(&sealed).unwrap();
        prop_assert_eq!(opened.len(), plaintext.len());
        prop_assert_ne!(opened, plaintext);
    }
}

// Property: the frame codec returns exactly what was encoded, with and without a cipher
proptest! {
    #[test]
    fn prop_frame_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..8192),
        encrypt in any::<bool>(),
    ) {
        let cipher = encrypt.then(|| Cipher::new(b"0123456789abcdef").unwrap());
        let mut codec = FrameCodec::new(cipher);
        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded, payload);
        prop_assert!(buf.is_empty());
    }
}

// Property: a frame delivered in arbitrary pieces decodes once, and only when complete
proptest! {
    #[test]
    fn prop_frame_split_anywhere(
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        split in any::<prop::sample::Index>(),
    ) {
        let mut codec = FrameCodec::new(Some(Cipher::new(b"0123456789abcdef").unwrap()));
        let mut wire = BytesMut::new();
        codec.encode(payload.clone(), &mut wire).unwrap();
        let cut = split.index(wire.len());

        let mut buf = BytesMut::from(&wire[..cut]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[cut..]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(payload));
    }
}

// Property: a sealed body is IV plus payload length and opens back to the payload
proptest! {
    #[test]
    fn prop_sealed_body_length(payload in prop::collection::vec(any::<u8>(), 0..1024)) {
        let cipher = Cipher::new(b"0123456789abcdef").unwrap();
        let body = seal_frame(Some(&cipher), &payload).unwrap();
        prop_assert_eq!(body.len(), payload.len() + IV_SIZE);
        prop_assert_eq!(open_frame(Some(&cipher), &body).unwrap(), payload);
    }
}

// Property: the async helpers and the codec speak the same format
proptest! {
    #[test]
    fn prop_write_frame_read_by_codec(payload in prop::collection::vec(any::<u8>(), 0..1024)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let cipher = Cipher::new(b"0123456789abcdef").unwrap();
        let mut wire = Vec::new();
        rt.block_on(write_frame(&mut wire, Some(&cipher), &payload, 1 << 20)).unwrap();

        let declared = u32::from_be_bytes(wire[..LENGTH_PREFIX].try_into().unwrap()) as usize;
        prop_assert_eq!(declared, wire.len() - LENGTH_PREFIX);

        let mut codec = FrameCodec::new(Some(cipher.clone()));
        let mut buf = BytesMut::from(&wire[..]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(payload.clone()));

        let mut reader = &wire[..];
        let read = rt.block_on(read_frame(&mut reader, Some(&cipher), 1 << 20)).unwrap();
        prop_assert_eq!(read, payload);
    }
}

// Property: the frame decoder never panics on arbitrary bytes
proptest! {
    #[test]
    fn prop_frame_decoder_total(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut codec = FrameCodec::with_max_frame_size(
            Some(Cipher::new(b"0123456789abcdef").unwrap()),
            1024,
        );
        let mut buf = BytesMut::from(&data[..]);
        let _ = codec.decode(&mut buf);
    }
}

// Property: legacy per-field encryption restores content and key
proptest! {
    #[test]
    fn prop_legacy_field_roundtrip(content in "\\PC{0,200}", key in "[0-9a-f]{32}") {
        let fields = FieldCipher::new(&key).unwrap();
        let mut msg = LegacyMessage::auth("c1", &key);
        msg.content = content.clone();
        let original = msg.clone();

        fields.seal(&mut msg).unwrap();
        if !content.is_empty() {
            prop_assert_ne!(&msg.content, &original.content);
        }
        fields.open(&mut msg).unwrap();
        prop_assert_eq!(msg, original);
    }
}

// Property: the legacy decoder never panics on arbitrary bytes
proptest! {
    #[test]
    fn prop_legacy_decoder_total(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut codec = LegacyCodec::with_max_message_size(1024);
        let mut buf = BytesMut::from(&data[..]);
        let _ = codec.decode(&mut buf);
    }
}

// Property: only the last enqueued command survives
proptest! {
    #[test]
    fn prop_last_write_wins(commands in prop::collection::vec("[A-Z]{1,8}", 1..20)) {
        let queue = CommandQueue::new();
        for command in &commands {
            queue.enqueue("id", command.clone());
        }
        prop_assert_eq!(queue.take("id"), commands.last().cloned());
        prop_assert_eq!(queue.take("id"), None);
    }
}
