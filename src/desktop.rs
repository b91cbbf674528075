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


//! The desktop backend contract.
//!
//! The backend owns the real display: it captures pixels, injects input,
//! talks to the system clipboard, and decides when the hosting process
//! should exit. The coordinator drives it through this trait and receives
//! pixels and damage reports back through the [`VncServer`] methods.
//!
//! Calls that may need to reach back into the coordinator synchronously
//! receive `server`; in particular [`DesktopBackend::start`] must call
//! [`VncServer::set_pixel_buffer`] before returning, and
//! [`DesktopBackend::set_screen_layout`] is expected to call
//! [`VncServer::set_screen_layout`] once the mode change takes effect.

use crate::connection::ResizeResult;
use crate::geometry::Point;
use crate::screens::ScreenSet;
use crate::server::VncServer;
use crate::socket::SocketRef;

/// The pixel-capture and input-injection backend of a session.
pub trait DesktopBackend {
    /// One-shot wiring, called from the coordinator's constructor.
    fn init(&mut self, server: &mut VncServer);

    /// Begins capture. Must install a pixel buffer on `server` before
    /// returning.
    fn start(&mut self, server: &mut VncServer);

    /// Ceases capture. The pixel buffer may be withdrawn afterwards.
    fn stop(&mut self, server: &mut VncServer);

    /// Asks the hosting process to exit. Invoked by the coordinator's
    /// idle/connect/disconnect timers.
    fn terminate(&mut self);

    /// Injects a pointer state change at `pos`.
    fn pointer_event(&mut self, server: &mut VncServer, pos: Point, button_mask: u16);

    /// Injects a key press or release.
    fn key_event(&mut self, server: &mut VncServer, keysym: u32, keycode: u32, down: bool);

    /// A client wants the server clipboard; the backend should fetch it
    /// and call [`VncServer::send_clipboard_data`].
    fn handle_clipboard_request(&mut self, server: &mut VncServer);

    /// A client announced (or withdrew) clipboard content.
    fn handle_clipboard_announce(&mut self, server: &mut VncServer, available: bool);

    /// Clipboard content arrived from the owning client.
    fn handle_clipboard_data(&mut self, server: &mut VncServer, data: &str);

    /// Attempts to reconfigure the display to the given size and layout.
    /// On success the backend must have installed the new layout on the
    /// coordinator (via [`VncServer::set_pixel_buffer`] or
    /// [`VncServer::set_screen_layout`]) before returning.
    fn set_screen_layout(
        &mut self,
        server: &mut VncServer,
        width: i32,
        height: i32,
        layout: &ScreenSet,
    ) -> ResizeResult;

    /// A connection needs out-of-band approval. The backend must
    /// eventually call [`VncServer::approve_connection`] for `sock`.
    fn query_connection(&mut self, server: &mut VncServer, sock: &SocketRef, user_name: &str);

    /// The frame counter advanced. Called once per frame tick.
    fn frame_tick(&mut self, server: &mut VncServer, msc: u64);
}
