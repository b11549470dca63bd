//! # Core Wire Components
//!
//! Byte-level framing for both wire modes.
//!
//! ## Components
//! - **Codec**: length-prefixed, whole-message encrypted frames
//! - **Legacy**: stream-delimited JSON with per-field encryption
//!
//! ## Wire Format
//! ```text
//! framed: [Length(4, BE)] [IV(16)] [Ciphertext(N)]
//! legacy: {"type":"HELLO","content":"...","key":"...","clientID":"..."}{...}
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB by default, checked before allocation
//! - No integrity protection on either mode; JSON parsing rejects most corruption

pub mod codec;
pub mod legacy;
