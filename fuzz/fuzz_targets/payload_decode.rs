//! Fuzz target for `Payload::decode`.
//!
//! Arbitrary bytes under an arbitrary wire type must decode or return an
//! error, never panic. Anything that decodes must re-encode to bytes that
//! decode to the same payload.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ratchetmix_proto::{MessageType, Payload};

fuzz_target!(|input: (u16, &[u8])| {
    let (code, data) = input;
    let Ok(message_type) = MessageType::try_from(code) else {
        return;
    };

    if let Ok(payload) = Payload::decode(message_type, data) {
        let encoded = payload.encode().expect("decoded payload must re-encode");
        let again = Payload::decode(message_type, &encoded).expect("re-encoded payload must decode");
        assert_eq!(payload, again);
    }
});
