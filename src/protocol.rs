// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RFB protocol constants used by the session coordinator.
//!
//! The per-connection wire machinery (handshake, security, message
//! encode/decode) lives behind the [`Connection`](crate::Connection) trait
//! and is not part of this crate. The coordinator still speaks a small
//! amount of protocol itself: the terse RFB 3.3 banner used to turn away
//! blacklisted peers, the ExtendedDesktopSize result codes it returns to
//! resize requesters, and the keyboard LED masks it fans out to clients.

use bytes::{BufMut, BytesMut};

/// The RFB protocol version used for the blacklist reject banner.
///
/// Version 3.3 is deliberate: it is the oldest dialect every client
/// understands, and it lets the server report a security failure in the
/// fewest possible bytes. The string must be exactly 12 bytes including
/// the newline.
pub const PROTOCOL_VERSION_3_3: &str = "RFB 003.003\n";

/// Security word: the connection has failed.
pub const SECURITY_RESULT_FAILED: u32 = 0;

/// Reason string sent to blacklisted peers.
pub const REJECT_REASON_BLACKLISTED: &str = "Too many security failures";

/// Largest framebuffer dimension the coordinator will accept, in pixels.
///
/// Applies to both width and height; resize requests beyond this are
/// rejected before the desktop backend is consulted.
pub const MAX_FRAMEBUFFER_DIMENSION: u32 = 16384;

// Keyboard LED masks (fanned out to clients via the LED-state
// pseudo-encoding).

/// Scroll Lock is lit.
pub const LED_SCROLL_LOCK: u32 = 1 << 0;

/// Num Lock is lit.
pub const LED_NUM_LOCK: u32 = 1 << 1;

/// Caps Lock is lit.
pub const LED_CAPS_LOCK: u32 = 1 << 2;

/// Sentinel: the LED state has never been reported.
///
/// Outside the range of any real mask combination, so the first real
/// state always differs from it and is always broadcast.
pub const LED_UNKNOWN: u32 = 1 << 31;

/// Builds the wire bytes of the RFB 3.3 reject banner.
///
/// Layout: 12-byte version string, a big-endian `u32` security word of 0
/// (failure), a big-endian `u32` reason length, then the reason bytes.
/// This is the shortest possible way to tell a client it is not welcome.
#[must_use]
pub fn reject_banner(reason: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(12 + 4 + 4 + reason.len());
    buf.put_slice(PROTOCOL_VERSION_3_3.as_bytes());
    buf.put_u32(SECURITY_RESULT_FAILED);
    buf.put_u32(reason.len() as u32);
    buf.put_slice(reason.as_bytes());
    buf
}
