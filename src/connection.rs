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


//! The per-client protocol driver contract.
//!
//! The coordinator does not speak the per-connection RFB state machine
//! itself; it drives one [`Connection`] per client through this trait.
//! Fallible methods follow close-on-error semantics: when one returns an
//! error during a fan-out, the coordinator closes that client and carries
//! on with the rest, so one bad client cannot stop a broadcast.
//!
//! Connections must never block: writes that cannot complete are queued
//! internally and drained when the embedder reports the socket writable.

use crate::error::Result;
use crate::geometry::{Point, Region};
use crate::server::VncServer;
use crate::socket::SocketRef;
use std::ops::BitOr;

/// Identity of a client within its coordinator, stable for the client's
/// lifetime and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub(crate) u64);

/// What a client is allowed to do, as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRights(u16);

impl AccessRights {
    /// May see the framebuffer.
    pub const VIEW: AccessRights = AccessRights(1 << 0);
    /// May inject key events.
    pub const KEY_EVENTS: AccessRights = AccessRights(1 << 1);
    /// May inject pointer events.
    pub const PTR_EVENTS: AccessRights = AccessRights(1 << 2);
    /// May exchange clipboard content.
    pub const CUT_TEXT: AccessRights = AccessRights(1 << 3);
    /// May request framebuffer resizes.
    pub const SET_DESKTOP_SIZE: AccessRights = AccessRights(1 << 4);
    /// May demand exclusive (non-shared) access.
    pub const NON_SHARED: AccessRights = AccessRights(1 << 5);
    /// Skips the connection-approval query.
    pub const NO_QUERY: AccessRights = AccessRights(1 << 6);

    /// No rights at all.
    pub const NONE: AccessRights = AccessRights(0);
    /// The rights of an ordinary interactive client.
    pub const DEFAULT: AccessRights = AccessRights(
        Self::VIEW.0
            | Self::KEY_EVENTS.0
            | Self::PTR_EVENTS.0
            | Self::CUT_TEXT.0
            | Self::SET_DESKTOP_SIZE.0
            | Self::NON_SHARED.0,
    );
    /// Every right, including query bypass.
    pub const FULL: AccessRights = AccessRights(Self::DEFAULT.0 | Self::NO_QUERY.0);

    /// True if every right in `other` is present in `self`.
    #[must_use]
    pub fn contains(&self, other: AccessRights) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessRights {
    type Output = AccessRights;

    fn bitor(self, rhs: AccessRights) -> AccessRights {
        AccessRights(self.0 | rhs.0)
    }
}

/// Why a client is being told the screen layout changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutReason {
    /// The server (or its desktop backend) changed the layout.
    Server,
    /// Another client successfully requested a resize.
    OtherClient,
}

/// Outcome of a desktop resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeResult {
    /// The layout was applied.
    Success,
    /// Resizing is administratively disabled or out of bounds.
    Prohibited,
    /// The backend lacked resources to apply the layout.
    OutOfResources,
    /// The requested layout is not valid.
    Invalid,
    /// An I/O error occurred applying the layout.
    IoError,
}

/// A per-client RFB protocol driver.
///
/// Implemented outside this crate; the coordinator only relies on the
/// behavior documented here. Methods taking a `server` parameter may call
/// back into the coordinator re-entrantly (the coordinator hands the
/// connection out of its client table for the duration of the call).
pub trait Connection {
    /// Starts the protocol handshake. Called once, immediately after the
    /// connection is admitted.
    fn init(&mut self, server: &mut VncServer) -> Result<()>;

    /// Reads and processes whatever input is available on the socket.
    /// Called when the embedder reports the socket readable.
    fn process_messages(&mut self, server: &mut VncServer) -> Result<()>;

    /// Drains queued output. Called when the embedder reports the socket
    /// writable.
    fn flush_socket(&mut self, server: &mut VncServer) -> Result<()>;

    /// Shuts the underlying socket down with a reason. The connection
    /// object stays alive until the embedder reports the closure and the
    /// coordinator removes it.
    fn close(&mut self, reason: &str);

    /// True once the client has passed authentication.
    fn authenticated(&self) -> bool;

    /// True if the client holds all the given rights.
    fn access_check(&self, rights: AccessRights) -> bool;

    /// Delivers the verdict on a pending connection query.
    fn approve_connection(&mut self, accept: bool, reason: Option<&str>) -> Result<()>;

    /// The framebuffer was replaced. The client re-announces dimensions
    /// with its next update.
    fn pixel_buffer_change(&mut self);

    /// The screen layout changed without the framebuffer being replaced.
    fn screen_layout_change(&mut self, reason: LayoutReason) -> Result<()>;

    /// The cursor shape changed and may need retransmitting.
    fn set_cursor(&mut self) -> Result<()>;

    /// The server-side rendered cursor is stale (shape, position or the
    /// pixels under it changed).
    fn rendered_cursor_change(&mut self);

    /// The pointer moved for a reason other than this client's own input.
    fn cursor_position_change(&mut self);

    /// The keyboard LED state changed.
    fn set_led_state(&mut self, state: u32) -> Result<()>;

    /// Ring the client's bell.
    fn bell(&mut self) -> Result<()>;

    /// The session name changed.
    fn set_desktop_name(&mut self, name: &str) -> Result<()>;

    /// The server's clipboard became available or unavailable.
    fn announce_clipboard(&mut self, available: bool) -> Result<()>;

    /// Clipboard content this client previously requested.
    fn send_clipboard_data(&mut self, data: &str) -> Result<()>;

    /// Ask this client (the clipboard owner) to send its content.
    fn request_clipboard(&mut self) -> Result<()>;

    /// Queues a copy operation for the client's next update.
    fn add_copied(&mut self, dest: &Region, delta: Point);

    /// Queues changed pixels for the client's next update.
    fn add_changed(&mut self, region: &Region);

    /// Writes a framebuffer update if the client is ready for one.
    fn write_framebuffer_update(&mut self, server: &mut VncServer) -> Result<()>;

    /// True if this client needs the cursor composited into its updates.
    fn needs_rendered_cursor(&self) -> bool;

    /// True if this client asks the server to run the pixel comparer.
    fn comparer_state(&self) -> bool;
}

/// Creates [`Connection`]s for newly admitted sockets.
pub trait ConnectionFactory {
    /// Builds the protocol driver for a new client. Failure rejects the
    /// socket (it is shut down and left for the embedder to reap).
    fn create(
        &mut self,
        id: ClientId,
        sock: SocketRef,
        outgoing: bool,
        rights: AccessRights,
    ) -> Result<Box<dyn Connection>>;
}
