#![no_main]

use control_channel::protocol::message::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Anything that parses must serialize and parse back to the same value
    if let Ok(envelope) = Envelope::from_bytes(data) {
        if let Ok(bytes) = envelope.to_bytes() {
            assert_eq!(Envelope::from_bytes(&bytes).ok(), Some(envelope));
        }
    }
});
