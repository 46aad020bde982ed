//! Session and approval token minting.
//!
//! Tokens are 32 bytes of OS-sourced entropy, base64url-encoded without
//! padding (43 characters); session ids are v4 UUIDs. Both are opaque to
//! clients and compared only through the store's timing-uniform checks.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

/// Bytes of entropy behind each minted token.
const TOKEN_ENTROPY_BYTES: usize = 32;

/// Mints a fresh opaque secret token.
#[must_use]
pub fn mint_token() -> String {
    let mut raw = [0_u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Mints a fresh session identifier.
#[must_use]
pub fn mint_session_id() -> String {
    Uuid::new_v4().to_string()
}
