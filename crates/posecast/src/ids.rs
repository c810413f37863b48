//! Process-lifetime identifiers.

use posecast_common::types::unix_millis;
use rand::Rng;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random lowercase base-36 token of `len` characters.
#[must_use]
pub fn base36_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect()
}

/// Device id sent in `device_register`: `ar-device-<token>-<unix ms>`.
#[must_use]
pub fn device_id() -> String {
    format!("ar-device-{}-{}", base36_token(9), unix_millis())
}

/// Signaling session id shown to the operator: `main-ar-device-<token>`.
#[must_use]
pub fn peer_session_id() -> String {
    format!("main-ar-device-{}", base36_token(9))
}
