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


//! The single-threaded session coordinator.
//!
//! [`VncServer`] multiplexes one shared desktop session across any number
//! of client connections. It owns no threads and never blocks: the
//! embedding I/O loop polls the sockets from
//! [`get_sockets`](VncServer::get_sockets), sleeps at most
//! [`next_timeout`](VncServer::next_timeout) /
//! [`ms_to_next_update`](VncServer::ms_to_next_update), and calls back in
//! on readiness ([`process_socket_read_event`](VncServer::process_socket_read_event),
//! [`process_socket_write_event`](VncServer::process_socket_write_event))
//! and timer expiry ([`process_timeouts`](VncServer::process_timeouts)).
//!
//! # How sockets get closed
//!
//! The embedder owns every socket, because it is the one blocking on
//! them. When the coordinator wants a client gone it only asks the
//! connection to `close`, which shuts the socket down; the embedder
//! notices the closure on its next poll and calls
//! [`remove_socket`](VncServer::remove_socket), which is where the
//! connection object is actually destroyed. Blacklisted peers never get a
//! connection object at all, so their sockets are parked on a separate
//! closing list to keep them visible to `get_sockets` until the embedder
//! reaps them.

use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::blacklist::Blacklist;
use crate::comparer::ComparingTracker;
use crate::config::{CompareMode, ServerConfig};
use crate::connection::{
    AccessRights, ClientId, Connection, ConnectionFactory, LayoutReason, ResizeResult,
};
use crate::cursor::{Cursor, RenderedCursor};
use crate::desktop::DesktopBackend;
use crate::error::{Result, VncError};
use crate::framebuffer::PixelBufferRef;
use crate::geometry::{Point, Rect, Region};
use crate::keymap::KeyRemapper;
use crate::protocol::{self, LED_UNKNOWN, MAX_FRAMEBUFFER_DIMENSION};
use crate::screens::{Screen, ScreenSet};
use crate::socket::{same_socket, SocketRef};
use crate::timer::{Clock, SystemClock, TimerSet, TimerToken};

/// How long one client may keep the pointer grab against other clients.
const POINTER_GRAB_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame-clock period while the desktop is stopped. Keeps the frame
/// counter advancing for waiters without burning CPU.
const IDLE_FRAME_INTERVAL_MS: u64 = 1000;

struct ClientEntry {
    id: ClientId,
    sock: SocketRef,
    /// Taken out of the slot while a re-entrant call into the connection
    /// is running; the entry itself stays so identity checks keep working.
    conn: Option<Box<dyn Connection>>,
}

/// A per-client delivery that arrived while the client's connection was
/// out of its slot (i.e. the client itself was mid-call); replayed as
/// soon as the connection is back.
enum DeferredCall {
    Approve { accept: bool, reason: Option<String> },
    ClipboardData(String),
}

/// The session coordinator.
///
/// One instance per shared session. All methods run on the embedder's
/// thread and return promptly; socket writes that cannot complete are
/// queued inside the affected connection.
pub struct VncServer {
    name: String,
    config: ServerConfig,
    clock: Rc<dyn Clock>,

    desktop: Option<Box<dyn DesktopBackend>>,
    factory: Box<dyn ConnectionFactory>,
    desktop_started: bool,

    block_counter: u32,
    pb: Option<PixelBufferRef>,
    comparer: Option<ComparingTracker>,
    screen_layout: ScreenSet,

    clients: Vec<ClientEntry>,
    closing_sockets: Vec<SocketRef>,
    next_client_id: u64,

    pointer_client: Option<ClientId>,
    pointer_client_time: Option<Instant>,
    clipboard_client: Option<ClientId>,
    clipboard_requestors: Vec<ClientId>,
    deferred: Vec<(ClientId, DeferredCall)>,

    cursor: Cursor,
    cursor_pos: Point,
    rendered_cursor: RenderedCursor,
    rendered_cursor_invalid: bool,

    led_state: u32,
    key_remapper: KeyRemapper,
    blacklist: Blacklist,

    timers: TimerSet,
    frame_timer: TimerToken,
    idle_timer: TimerToken,
    disconnect_timer: TimerToken,
    connect_timer: TimerToken,

    msc: u64,
    queued_msc: u64,

    shut_down: bool,
}

impl VncServer {
    /// Creates a coordinator on the system clock.
    ///
    /// `desktop` is wired immediately (its `init` runs before this
    /// returns); `factory` builds the protocol driver for each admitted
    /// socket.
    #[must_use]
    pub fn new(
        name: &str,
        desktop: Box<dyn DesktopBackend>,
        factory: Box<dyn ConnectionFactory>,
        config: ServerConfig,
    ) -> Self {
        Self::with_clock(name, desktop, factory, config, Rc::new(SystemClock))
    }

    /// Creates a coordinator reading time from `clock`.
    #[must_use]
    pub fn with_clock(
        name: &str,
        desktop: Box<dyn DesktopBackend>,
        factory: Box<dyn ConnectionFactory>,
        config: ServerConfig,
        clock: Rc<dyn Clock>,
    ) -> Self {
        log::debug!("Creating single-threaded server {name}");

        let mut timers = TimerSet::new(Rc::clone(&clock));
        let frame_timer = timers.register();
        let idle_timer = timers.register();
        let disconnect_timer = timers.register();
        let connect_timer = timers.register();

        let key_remapper = KeyRemapper::from_spec(&config.remap_keys);
        let blacklist = Blacklist::new(
            Rc::clone(&clock),
            config.blacklist_threshold,
            config.blacklist_timeout,
        );

        let mut server = Self {
            name: name.to_string(),
            clock,
            desktop: Some(desktop),
            factory,
            desktop_started: false,
            block_counter: 0,
            pb: None,
            comparer: None,
            screen_layout: ScreenSet::new(),
            clients: Vec::new(),
            closing_sockets: Vec::new(),
            next_client_id: 0,
            pointer_client: None,
            pointer_client_time: None,
            clipboard_client: None,
            clipboard_requestors: Vec::new(),
            deferred: Vec::new(),
            cursor: Cursor::empty(),
            cursor_pos: Point::default(),
            rendered_cursor: RenderedCursor::default(),
            rendered_cursor_invalid: false,
            led_state: LED_UNKNOWN,
            key_remapper,
            blacklist,
            timers,
            frame_timer,
            idle_timer,
            disconnect_timer,
            connect_timer,
            msc: 0,
            queued_msc: 0,
            shut_down: false,
            config,
        };

        server.with_desktop(|desktop, server| desktop.init(server));

        if server.config.max_idle_time > 0 {
            let ms = secs_to_ms(server.config.max_idle_time);
            server.timers.start(server.idle_timer, ms);
        }
        if server.config.max_disconnection_time > 0 {
            let ms = secs_to_ms(server.config.max_disconnection_time);
            server.timers.start(server.disconnect_timer, ms);
        }

        server
    }

    /// The session name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of connections currently owned (live or pending close).
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ------------------------------------------------------------------
    // Embedder contract: sockets and timers
    // ------------------------------------------------------------------

    /// Admits a new socket.
    ///
    /// Blacklisted peers are turned away with a terse RFB 3.3 failure
    /// banner and parked on the closing list; everyone else gets a
    /// connection object whose handshake starts immediately.
    pub fn add_socket(&mut self, sock: SocketRef, outgoing: bool, rights: AccessRights) {
        let address = sock.peer_address();
        if self.blacklist.is_blackmarked(&address) {
            log::error!(target: "connections", "Blacklisted: {address}");
            let banner = protocol::reject_banner(protocol::REJECT_REASON_BLACKLISTED);
            if let Err(e) = write_fully(&sock, &banner) {
                log::debug!(target: "connections", "Reject banner write failed: {e}");
            }
            sock.shutdown();
            self.closing_sockets.push(sock);
            return;
        }

        log::info!(target: "connections", "Accepted: {}", sock.peer_endpoint());

        // Adjust the exit timers
        if self.config.max_connection_time > 0 && self.clients.is_empty() {
            let ms = secs_to_ms(self.config.max_connection_time);
            self.timers.start(self.connect_timer, ms);
        }
        self.timers.stop(self.disconnect_timer);

        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        match self.factory.create(id, Rc::clone(&sock), outgoing, rights) {
            Ok(conn) => {
                self.clients.insert(
                    0,
                    ClientEntry {
                        id,
                        sock,
                        conn: Some(conn),
                    },
                );
                if let Some(Err(e)) = self.with_client(id, |conn, server| conn.init(server)) {
                    log::error!(target: "connections", "Error accepting client: {e}");
                    if let Some(idx) = self.find_client_by_id(id) {
                        let entry = self.clients.remove(idx);
                        entry.sock.shutdown();
                        self.closing_sockets.push(entry.sock);
                    }
                }
            }
            Err(e) => {
                log::error!(target: "connections", "Error accepting client: {e}");
                sock.shutdown();
                self.closing_sockets.push(sock);
            }
        }
    }

    /// Releases everything associated with `sock`.
    ///
    /// Called by the embedder once it has observed the socket closed.
    /// Unknown sockets are ignored, so reaping a closing-list entry and a
    /// never-admitted socket both work.
    pub fn remove_socket(&mut self, sock: &SocketRef) {
        let Some(idx) = self.find_client_by_sock(sock) else {
            self.closing_sockets.retain(|s| !same_socket(s, sock));
            return;
        };
        let id = self.clients[idx].id;

        // Release the mouse buttons the client had pressed
        if self.pointer_client == Some(id) {
            let pos = self.cursor_pos;
            self.with_desktop(|desktop, server| desktop.pointer_event(server, pos, 0));
            self.pointer_client = None;
        }
        if self.clipboard_client == Some(id) {
            self.handle_clipboard_announce(id, false);
        }
        self.clipboard_requestors.retain(|&r| r != id);
        self.deferred.retain(|(cid, _)| *cid != id);

        if let Some(idx) = self.find_client_by_id(id) {
            let entry = self.clients.remove(idx);
            log::info!(target: "connections", "Closed: {}", entry.sock.peer_endpoint());
        }

        // The desktop is only needed while someone authenticated is
        // watching
        if self.auth_client_count() == 0 {
            self.stop_desktop();
        }
        if let Some(comparer) = &self.comparer {
            comparer.log_stats();
        }

        // Adjust the exit timers
        self.timers.stop(self.connect_timer);
        if self.config.max_disconnection_time > 0 && self.clients.is_empty() {
            let ms = secs_to_ms(self.config.max_disconnection_time);
            self.timers.start(self.disconnect_timer, ms);
        }
    }

    /// Lets the matching connection consume pending input.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidArgument`] if `sock` is not a live
    /// client's socket.
    pub fn process_socket_read_event(&mut self, sock: &SocketRef) -> Result<()> {
        let id = self
            .find_client_by_sock(sock)
            .map(|idx| self.clients[idx].id)
            .ok_or_else(|| VncError::InvalidArgument("unknown socket".into()))?;
        if let Some(Err(e)) = self.with_client(id, |conn, server| conn.process_messages(server)) {
            self.close_client(id, &e.to_string());
        }
        Ok(())
    }

    /// Lets the matching connection drain queued output.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidArgument`] if `sock` is not a live
    /// client's socket.
    pub fn process_socket_write_event(&mut self, sock: &SocketRef) -> Result<()> {
        let id = self
            .find_client_by_sock(sock)
            .map(|idx| self.clients[idx].id)
            .ok_or_else(|| VncError::InvalidArgument("unknown socket".into()))?;
        if let Some(Err(e)) = self.with_client(id, |conn, server| conn.flush_socket(server)) {
            self.close_client(id, &e.to_string());
        }
        Ok(())
    }

    /// Snapshot of every socket the embedder must poll: live clients
    /// first (most recent first), then sockets awaiting reap.
    #[must_use]
    pub fn get_sockets(&self) -> Vec<SocketRef> {
        self.clients
            .iter()
            .map(|entry| Rc::clone(&entry.sock))
            .chain(self.closing_sockets.iter().map(Rc::clone))
            .collect()
    }

    /// Delivers the verdict on a connection the backend was asked to
    /// approve. Unknown sockets are ignored (the client may already be
    /// gone).
    pub fn approve_connection(&mut self, sock: &SocketRef, accept: bool, reason: Option<&str>) {
        if let Some(idx) = self.find_client_by_sock(sock) {
            let id = self.clients[idx].id;
            if self.clients[idx].conn.is_some() {
                self.call_client_or_close(id, |conn| conn.approve_connection(accept, reason));
            } else {
                // The verdict arrived while the client itself is
                // mid-call; deliver once its connection is back.
                self.deferred.push((
                    id,
                    DeferredCall::Approve {
                        accept,
                        reason: reason.map(String::from),
                    },
                ));
            }
        }
    }

    /// Dispatches every timer whose deadline has passed.
    pub fn process_timeouts(&mut self) {
        for token in self.timers.take_expired() {
            self.handle_timeout(token);
        }
    }

    /// Time until the earliest armed timer, if any. The embedder should
    /// not sleep longer than this.
    #[must_use]
    pub fn next_timeout(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Sleep hint for the embedder's selector: milliseconds until the
    /// next frame-clock step.
    #[must_use]
    pub fn ms_to_next_update(&self) -> u64 {
        if self.timers.is_started(self.frame_timer) {
            self.timers.remaining_ms(self.frame_timer)
        } else {
            self.config.frame_interval_ms() / 2
        }
    }

    /// Handles the expiry of one timer.
    pub fn handle_timeout(&mut self, token: TimerToken) {
        if token == self.frame_timer {
            self.frame_tick();
        } else if token == self.idle_timer {
            log::info!("MaxIdleTime reached, exiting");
            self.with_desktop(|desktop, _| desktop.terminate());
        } else if token == self.disconnect_timer {
            log::info!("MaxDisconnectionTime reached, exiting");
            self.with_desktop(|desktop, _| desktop.terminate());
        } else if token == self.connect_timer {
            log::info!("MaxConnectionTime reached, exiting");
            self.with_desktop(|desktop, _| desktop.terminate());
        }
    }

    /// Closes every client with the given reason. Their sockets stay
    /// pollable until the embedder reaps them.
    pub fn close_clients(&mut self, reason: &str) {
        self.close_clients_except(reason, None);
    }

    /// Shuts the session down: closes all clients, stops the frame clock
    /// and the desktop. Also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::debug!("Shutting down server {}", self.name);

        self.close_clients("Server shutdown");
        self.stop_frame_clock();
        self.clients.clear();
        // Only stop the desktop once the clients are gone
        self.stop_desktop();
        if let Some(comparer) = &self.comparer {
            comparer.log_stats();
        }
    }

    // ------------------------------------------------------------------
    // Desktop-facing contract: framebuffer and layout
    // ------------------------------------------------------------------

    /// Replaces the framebuffer, preserving as much of the current
    /// screen layout as still fits; screens pushed fully outside the new
    /// framebuffer are dropped, and a single full-screen layout is
    /// synthesized if none survive.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidState`] when the buffer is withdrawn
    /// (`None`) while the desktop is started.
    pub fn set_pixel_buffer(&mut self, pb: Option<PixelBufferRef>) -> Result<()> {
        let Some(pb) = pb else {
            return self.set_pixel_buffer_with_layout(None, ScreenSet::new());
        };

        let (width, height) = {
            let pb = pb.borrow();
            (pb.width(), pb.height())
        };

        // Check that the screen layout is still valid
        let mut layout = self.screen_layout.clone();
        if !layout.validate(width, height) {
            let fb_rect = Rect::from_xywh(0, 0, width, height);
            let mut kept = ScreenSet::new();
            for screen in layout.iter() {
                let dims = screen.dimensions.intersect(&fb_rect);
                if dims.is_empty() {
                    log::info!(
                        "Removing screen {} as it is completely outside the new framebuffer",
                        screen.id
                    );
                } else {
                    kept.add_screen(Screen {
                        dimensions: dims,
                        ..*screen
                    });
                }
            }
            layout = kept;
        }

        // Make sure that we have at least one screen
        if layout.num_screens() == 0 {
            layout.add_screen(Screen::new(0, 0, 0, width, height, 0));
        }

        self.set_pixel_buffer_with_layout(Some(pb), layout)
    }

    /// Replaces the framebuffer and the screen layout together.
    ///
    /// Everything tracking the old buffer's content is reset: a fresh
    /// comparer is installed, the whole framebuffer is marked changed,
    /// and every client re-announces dimensions on its next update.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidArgument`] if the layout does not fit
    /// the buffer, and [`VncError::InvalidState`] when the buffer is
    /// withdrawn while the desktop is started. State is unchanged on
    /// error.
    pub fn set_pixel_buffer_with_layout(
        &mut self,
        pb: Option<PixelBufferRef>,
        layout: ScreenSet,
    ) -> Result<()> {
        let Some(pb) = pb else {
            if self.desktop_started {
                return Err(VncError::InvalidState(
                    "pixel buffer withdrawn while the desktop is started".into(),
                ));
            }
            if let Some(comparer) = &self.comparer {
                comparer.log_stats();
            }
            self.pb = None;
            self.comparer = None;
            self.screen_layout = ScreenSet::new();
            return Ok(());
        };

        let (width, height) = {
            let pb = pb.borrow();
            (pb.width(), pb.height())
        };
        if !layout.validate(width, height) {
            return Err(VncError::InvalidArgument("invalid screen layout".into()));
        }

        if let Some(comparer) = &self.comparer {
            comparer.log_stats();
        }

        self.pb = Some(pb);
        self.screen_layout = layout;

        // Assume the framebuffer contents wasn't saved and reset
        // everything that tracks its contents
        self.comparer = Some(ComparingTracker::new(width, height));
        self.rendered_cursor_invalid = true;
        self.add_changed(&Region::from_rect(Rect::from_xywh(0, 0, width, height)));

        // The new pixel buffer means an ExtendedDesktopSize needs to be
        // sent anyway, so there is no separate layout notification.
        for entry in &mut self.clients {
            if let Some(conn) = entry.conn.as_mut() {
                conn.pixel_buffer_change();
            }
        }

        Ok(())
    }

    /// Replaces the screen layout without touching the framebuffer and
    /// notifies every client.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidState`] without a framebuffer, and
    /// [`VncError::InvalidArgument`] if the layout does not fit it.
    pub fn set_screen_layout(&mut self, layout: ScreenSet) -> Result<()> {
        let Some(pb) = &self.pb else {
            return Err(VncError::InvalidState(
                "new screen layout without a pixel buffer".into(),
            ));
        };
        let (width, height) = {
            let pb = pb.borrow();
            (pb.width(), pb.height())
        };
        if !layout.validate(width, height) {
            return Err(VncError::InvalidArgument("invalid screen layout".into()));
        }

        self.screen_layout = layout;
        self.broadcast(|conn| conn.screen_layout_change(LayoutReason::Server));
        Ok(())
    }

    /// The current screen layout.
    #[must_use]
    pub fn screen_layout(&self) -> &ScreenSet {
        &self.screen_layout
    }

    // ------------------------------------------------------------------
    // Desktop-facing contract: damage, cursor, LEDs, misc
    // ------------------------------------------------------------------

    /// Reports changed pixels. No-op without a framebuffer.
    pub fn add_changed(&mut self, region: &Region) {
        let Some(comparer) = &mut self.comparer else {
            return;
        };
        comparer.add_changed(region);
        self.start_frame_clock();
    }

    /// Reports pixels copied (scrolled) within the framebuffer. No-op
    /// without a framebuffer.
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        let Some(comparer) = &mut self.comparer else {
            return;
        };
        comparer.add_copied(dest, delta);
        self.start_frame_clock();
    }

    /// Replaces the cursor shape. Transparent borders are cropped off
    /// before anything is sent.
    pub fn set_cursor(&mut self, width: i32, height: i32, hotspot: Point, data: &[u8]) {
        let mut cursor = Cursor::new(width, height, hotspot, data);
        cursor.crop();
        self.cursor = cursor;

        self.rendered_cursor_invalid = true;

        for entry in &mut self.clients {
            if let Some(conn) = entry.conn.as_mut() {
                conn.rendered_cursor_change();
                if let Err(e) = conn.set_cursor() {
                    close_entry(entry, &e);
                }
            }
        }
    }

    /// Moves the cursor. `warped` means the movement did not come from a
    /// client's own pointer, so clients are told about the new position
    /// too.
    pub fn set_cursor_pos(&mut self, pos: Point, warped: bool) {
        if self.cursor_pos == pos {
            return;
        }
        self.cursor_pos = pos;
        self.rendered_cursor_invalid = true;
        for entry in &mut self.clients {
            if let Some(conn) = entry.conn.as_mut() {
                conn.rendered_cursor_change();
                if warped {
                    conn.cursor_position_change();
                }
            }
        }
    }

    /// Updates the keyboard LED state; broadcast only on change.
    pub fn set_led_state(&mut self, state: u32) {
        if state == self.led_state {
            return;
        }
        self.led_state = state;
        self.broadcast(|conn| conn.set_led_state(state));
    }

    /// Rings every client's bell.
    pub fn bell(&mut self) {
        self.broadcast(|conn| conn.bell());
    }

    /// Renames the session and tells every client.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        let name = self.name.clone();
        self.broadcast(|conn| conn.set_desktop_name(&name));
    }

    /// Suspends update emission. Nestable; the frame clock stays stopped
    /// until the matching [`unblock_updates`](VncServer::unblock_updates).
    pub fn block_updates(&mut self) {
        self.block_counter += 1;
        self.stop_frame_clock();
    }

    /// Ends one nesting level of update suspension, restarting the frame
    /// clock if work is pending.
    pub fn unblock_updates(&mut self) {
        if self.block_counter == 0 {
            log::error!("unblock_updates without a matching block_updates");
            return;
        }
        self.block_counter -= 1;
        if self.block_counter == 0 {
            self.start_frame_clock();
        }
    }

    /// The current frame counter.
    #[must_use]
    pub fn get_msc(&self) -> u64 {
        self.msc
    }

    /// Keeps the frame clock running at least until the frame counter
    /// reaches `target`, even with no pixel changes to emit.
    pub fn queue_msc(&mut self, target: u64) {
        if target > self.queued_msc {
            self.queued_msc = target;
        }
        self.start_frame_clock();
    }

    /// Records an authentication failure for `address`. Called by the
    /// per-client security machinery; enough failures get the address
    /// turned away at [`add_socket`](VncServer::add_socket).
    pub fn blackmark(&mut self, address: &str) {
        self.blacklist.blackmark(address);
    }

    // ------------------------------------------------------------------
    // Desktop-facing contract: clipboard
    // ------------------------------------------------------------------

    /// Asks the clipboard-owning client for its content, if any.
    pub fn request_clipboard(&mut self) {
        if !self.config.accept_cut_text {
            return;
        }
        let Some(owner) = self.clipboard_client else {
            log::debug!("Got request for client clipboard but no client currently owns it");
            return;
        };
        self.call_client_or_close(owner, |conn| conn.request_clipboard());
    }

    /// Tells every client whether the server clipboard has content.
    /// Outstanding client requests are forgotten either way.
    pub fn announce_clipboard(&mut self, available: bool) {
        self.clipboard_requestors.clear();

        if !self.config.send_cut_text {
            return;
        }
        self.broadcast(|conn| conn.announce_clipboard(available));
    }

    /// Delivers server clipboard content to every client that asked for
    /// it since the last delivery.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidArgument`] if `data` contains a
    /// carriage return; the protocol requires bare line feeds.
    pub fn send_clipboard_data(&mut self, data: &str) -> Result<()> {
        if !self.config.send_cut_text {
            return Ok(());
        }
        if data.contains('\r') {
            return Err(VncError::InvalidArgument(
                "carriage return in clipboard data".into(),
            ));
        }
        let requestors = std::mem::take(&mut self.clipboard_requestors);
        for id in requestors {
            let Some(idx) = self.find_client_by_id(id) else {
                continue;
            };
            if self.clients[idx].conn.is_some() {
                self.call_client_or_close(id, |conn| conn.send_clipboard_data(data));
            } else {
                self.deferred
                    .push((id, DeferredCall::ClipboardData(data.to_string())));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection-facing contract
    // ------------------------------------------------------------------

    /// Runs the admission policy for a client that just authenticated.
    ///
    /// Clears the peer's blacklist record, makes sure the desktop is
    /// running, and either settles the approval directly or hands it to
    /// the backend's out-of-band query.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Configuration`] if the desktop backend fails
    /// to install a pixel buffer on start, and
    /// [`VncError::InvalidArgument`] for an unknown client.
    pub fn query_connection(&mut self, client: ClientId, user_name: &str) -> Result<()> {
        let Some(idx) = self.find_client_by_id(client) else {
            return Err(VncError::InvalidArgument("unknown client".into()));
        };
        let sock = Rc::clone(&self.clients[idx].sock);

        // Authentication succeeded - clear from blacklist
        self.blacklist.clear_blackmark(&sock.peer_address());

        // The client will start requiring resources now
        self.start_desktop()?;

        // Special case to provide a more useful error message
        if self.config.never_shared
            && !self.config.disconnect_clients
            && self.auth_client_count() > 0
        {
            self.approve_connection(&sock, false, Some("The server is already in use"));
            return Ok(());
        }

        // Are we configured to do queries?
        if !self.config.query_connect && !sock.requires_query() {
            self.approve_connection(&sock, true, None);
            return Ok(());
        }

        // Does the client have the right to bypass the query?
        if self.client_access_check(client, AccessRights::NO_QUERY) {
            self.approve_connection(&sock, true, None);
            return Ok(());
        }

        self.with_desktop(|desktop, server| desktop.query_connection(server, &sock, user_name));
        Ok(())
    }

    /// Applies the sharing policy once a client has sent its init
    /// message. A non-shared client either evicts everyone else or is
    /// itself refused, depending on configuration and rights.
    pub fn client_ready(&mut self, client: ClientId, shared: bool) {
        if shared {
            return;
        }
        if self.config.disconnect_clients
            && self.client_access_check(client, AccessRights::NON_SHARED)
        {
            log::debug!("Non-shared connection - closing clients");
            let except = self
                .find_client_by_id(client)
                .map(|idx| Rc::clone(&self.clients[idx].sock));
            self.close_clients_except("Non-shared connection requested", except.as_ref());
        } else if self.auth_client_count() > 1 {
            self.close_client(client, "Server is already in use");
        }
    }

    /// Forwards a client's pointer event to the desktop, arbitrating the
    /// grab: while one client holds buttons down, other clients' events
    /// are dropped for up to ten seconds so concurrent drags cannot
    /// fight.
    pub fn pointer_event(&mut self, client: ClientId, pos: Point, button_mask: u16) {
        if !self.config.accept_pointer_events {
            return;
        }
        if self.config.max_idle_time > 0 {
            let ms = secs_to_ms(self.config.max_idle_time);
            self.timers.start(self.idle_timer, ms);
        }

        let now = self.clock.now();
        if let (Some(owner), Some(grabbed_at)) = (self.pointer_client, self.pointer_client_time) {
            if owner != client && now.duration_since(grabbed_at) < POINTER_GRAB_TIMEOUT {
                return;
            }
        }

        self.pointer_client_time = Some(now);
        self.pointer_client = if button_mask != 0 { Some(client) } else { None };

        self.with_desktop(|desktop, server| desktop.pointer_event(server, pos, button_mask));
    }

    /// Forwards a key event to the desktop, remapping the keysym if the
    /// configuration asks for it.
    pub fn key_event(&mut self, keysym: u32, keycode: u32, down: bool) {
        if !self.config.accept_key_events {
            return;
        }
        if self.config.max_idle_time > 0 {
            let ms = secs_to_ms(self.config.max_idle_time);
            self.timers.start(self.idle_timer, ms);
        }

        let keysym = {
            let remapped = self.key_remapper.remap(keysym);
            if remapped != keysym {
                log::debug!("Key remapped to 0x{remapped:x}");
            }
            remapped
        };

        self.with_desktop(|desktop, server| desktop.key_event(server, keysym, keycode, down));
    }

    /// A client asked for the server clipboard; the desktop is asked to
    /// fetch it when the request list goes from empty to non-empty.
    pub fn handle_clipboard_request(&mut self, client: ClientId) {
        self.clipboard_requestors.push(client);
        if self.clipboard_requestors.len() == 1 {
            self.with_desktop(|desktop, server| desktop.handle_clipboard_request(server));
        }
    }

    /// A client announced (or withdrew) clipboard content. Announcement
    /// transfers clipboard ownership to that client; withdrawal only
    /// matters from the current owner.
    pub fn handle_clipboard_announce(&mut self, client: ClientId, available: bool) {
        if available {
            if !self.config.accept_cut_text {
                return;
            }
            self.clipboard_client = Some(client);
        } else {
            if self.clipboard_client != Some(client) {
                return;
            }
            self.clipboard_client = None;
        }
        self.with_desktop(|desktop, server| desktop.handle_clipboard_announce(server, available));
    }

    /// Clipboard content from a client; dropped unless it is the current
    /// clipboard owner.
    pub fn handle_clipboard_data(&mut self, client: ClientId, data: &str) {
        if !self.config.accept_cut_text {
            return;
        }
        if self.clipboard_client != Some(client) {
            log::debug!("Ignoring unexpected clipboard data");
            return;
        }
        self.with_desktop(|desktop, server| desktop.handle_clipboard_data(server, data));
    }

    /// A client asked to resize the desktop.
    ///
    /// On success every other client is told the layout changed; the
    /// requester learns through its own protocol reply.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidState`] if the backend reported
    /// success but did not install the requested layout.
    pub fn set_desktop_size(
        &mut self,
        requester: ClientId,
        width: i32,
        height: i32,
        layout: ScreenSet,
    ) -> Result<ResizeResult> {
        if !self.config.accept_set_desktop_size {
            log::debug!("Rejecting unauthorized framebuffer resize request");
            return Ok(ResizeResult::Prohibited);
        }

        // Bigger framebuffers than this cannot be handled, so don't let
        // a client configure one
        let max = MAX_FRAMEBUFFER_DIMENSION as i32;
        if width > max || height > max {
            log::error!("Rejecting too large framebuffer resize request");
            return Ok(ResizeResult::Prohibited);
        }

        // Don't bother the desktop with an invalid configuration
        if !layout.validate(width, height) {
            log::error!("Invalid screen layout requested by client");
            return Ok(ResizeResult::Invalid);
        }

        let result = self.with_desktop(|desktop, server| {
            desktop.set_screen_layout(server, width, height, &layout)
        });
        if result != ResizeResult::Success {
            return Ok(result);
        }

        // Sanity check
        if self.screen_layout != layout {
            return Err(VncError::InvalidState(
                "desktop configured a different screen layout than requested".into(),
            ));
        }

        // Notify other clients
        for entry in &mut self.clients {
            if entry.id == requester {
                continue;
            }
            if let Some(conn) = entry.conn.as_mut() {
                if let Err(e) = conn.screen_layout_change(LayoutReason::OtherClient) {
                    close_entry(entry, &e);
                }
            }
        }

        Ok(ResizeResult::Success)
    }

    /// The region a client must not read from the framebuffer yet:
    /// everything with pending updates, or the whole framebuffer while
    /// updates are blocked.
    #[must_use]
    pub fn get_pending_region(&self) -> Region {
        let Some(pb) = &self.pb else {
            return Region::new();
        };
        // The framebuffer cannot be safely accessed at all while blocked
        if self.block_counter > 0 {
            return Region::from_rect(pb.borrow().rect());
        }
        let Some(comparer) = &self.comparer else {
            return Region::new();
        };
        if comparer.is_empty() {
            return Region::new();
        }
        let ui = comparer.get_update_info(&pb.borrow().rect());
        ui.changed.union_with(&ui.copied)
    }

    /// The cursor composited over the framebuffer, recomputed if stale.
    /// `None` without a framebuffer.
    pub fn get_rendered_cursor(&mut self) -> Option<&RenderedCursor> {
        let pb = self.pb.as_ref()?;
        if self.rendered_cursor_invalid {
            self.rendered_cursor
                .update(&*pb.borrow(), &self.cursor, self.cursor_pos);
            self.rendered_cursor_invalid = false;
        }
        Some(&self.rendered_cursor)
    }

    /// Whether the pixel comparer is (or would be) running, under the
    /// configured policy.
    #[must_use]
    pub fn get_comparer_state(&self) -> bool {
        match self.config.compare_fb {
            CompareMode::Off => false,
            CompareMode::On => true,
            CompareMode::PerClient => self
                .clients
                .iter()
                .filter_map(|entry| entry.conn.as_deref())
                .any(Connection::comparer_state),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn find_client_by_sock(&self, sock: &SocketRef) -> Option<usize> {
        self.clients
            .iter()
            .position(|entry| same_socket(&entry.sock, sock))
    }

    fn find_client_by_id(&self, id: ClientId) -> Option<usize> {
        self.clients.iter().position(|entry| entry.id == id)
    }

    /// Takes the connection out of its slot for the duration of a
    /// re-entrant call, then puts it back (unless the client was removed
    /// in the meantime). Returns `None` for unknown or already-taken
    /// clients.
    fn with_client<R>(
        &mut self,
        id: ClientId,
        f: impl FnOnce(&mut dyn Connection, &mut VncServer) -> R,
    ) -> Option<R> {
        let idx = self.find_client_by_id(id)?;
        let mut conn = self.clients[idx].conn.take()?;
        let result = f(conn.as_mut(), self);
        if let Some(idx) = self.find_client_by_id(id) {
            self.clients[idx].conn = Some(conn);
            self.drain_deferred(id);
        }
        Some(result)
    }

    /// Replays deliveries that arrived while the client was out of its
    /// slot.
    fn drain_deferred(&mut self, id: ClientId) {
        let mut i = 0;
        while i < self.deferred.len() {
            if self.deferred[i].0 != id {
                i += 1;
                continue;
            }
            let (_, call) = self.deferred.remove(i);
            match call {
                DeferredCall::Approve { accept, reason } => {
                    self.call_client_or_close(id, |conn| {
                        conn.approve_connection(accept, reason.as_deref())
                    });
                }
                DeferredCall::ClipboardData(text) => {
                    self.call_client_or_close(id, |conn| conn.send_clipboard_data(&text));
                }
            }
        }
    }

    /// Runs a fallible operation against one client, closing it on
    /// failure.
    fn call_client_or_close(
        &mut self,
        id: ClientId,
        f: impl FnOnce(&mut dyn Connection) -> Result<()>,
    ) {
        let Some(idx) = self.find_client_by_id(id) else {
            return;
        };
        let entry = &mut self.clients[idx];
        if let Some(conn) = entry.conn.as_mut() {
            if let Err(e) = f(conn.as_mut()) {
                close_entry(entry, &e);
            }
        }
    }

    /// Fans a fallible operation out to every client, closing the ones
    /// that fail. One bad client cannot stop the broadcast.
    fn broadcast(&mut self, mut f: impl FnMut(&mut dyn Connection) -> Result<()>) {
        for entry in &mut self.clients {
            if let Some(conn) = entry.conn.as_mut() {
                if let Err(e) = f(conn.as_mut()) {
                    close_entry(entry, &e);
                }
            }
        }
    }

    fn close_client(&mut self, id: ClientId, reason: &str) {
        if let Some(idx) = self.find_client_by_id(id) {
            if let Some(conn) = self.clients[idx].conn.as_mut() {
                conn.close(reason);
            }
        }
    }

    fn close_clients_except(&mut self, reason: &str, except: Option<&SocketRef>) {
        for entry in &mut self.clients {
            if except.is_some_and(|sock| same_socket(&entry.sock, sock)) {
                continue;
            }
            if let Some(conn) = entry.conn.as_mut() {
                conn.close(reason);
            }
        }
    }

    fn client_access_check(&self, id: ClientId, rights: AccessRights) -> bool {
        self.find_client_by_id(id)
            .and_then(|idx| self.clients[idx].conn.as_deref())
            .is_some_and(|conn| conn.access_check(rights))
    }

    fn auth_client_count(&self) -> usize {
        self.clients
            .iter()
            .filter_map(|entry| entry.conn.as_deref())
            .filter(|conn| conn.authenticated())
            .count()
    }

    fn need_rendered_cursor(&self) -> bool {
        self.clients
            .iter()
            .filter_map(|entry| entry.conn.as_deref())
            .any(Connection::needs_rendered_cursor)
    }

    fn with_desktop<R>(
        &mut self,
        f: impl FnOnce(&mut dyn DesktopBackend, &mut VncServer) -> R,
    ) -> R {
        let mut desktop = self
            .desktop
            .take()
            .expect("desktop backend call re-entered");
        let result = f(desktop.as_mut(), self);
        self.desktop = Some(desktop);
        result
    }

    fn start_desktop(&mut self) -> Result<()> {
        if self.desktop_started {
            return Ok(());
        }
        log::debug!("Starting desktop");
        self.with_desktop(|desktop, server| desktop.start(server));
        if self.pb.is_none() {
            return Err(VncError::Configuration(
                "desktop backend did not install a pixel buffer on start".into(),
            ));
        }
        self.desktop_started = true;

        // The tracker might have accumulated changes whilst we were
        // stopped, so flush those out
        if self.comparer.as_ref().is_some_and(|c| !c.is_empty()) {
            self.write_update();
        }

        // If the frame clock is running it is running slowly; kick it to
        // full speed
        if self.timers.is_started(self.frame_timer) {
            self.stop_frame_clock();
            self.start_frame_clock();
        }
        Ok(())
    }

    fn stop_desktop(&mut self) {
        if self.desktop_started {
            log::debug!("Stopping desktop");
            self.desktop_started = false;
            self.with_desktop(|desktop, server| desktop.stop(server));
        }
    }

    fn pending_work(&self) -> bool {
        self.desktop_started && self.comparer.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn start_frame_clock(&mut self) {
        if self.timers.is_started(self.frame_timer) {
            return;
        }
        if self.block_counter > 0 {
            return;
        }
        // Anyone actually interested in frames?
        if !self.pending_work() && self.queued_msc <= self.msc {
            return;
        }

        // Run very slowly when there is no desktop to emit from; the
        // clock is only advancing the frame counter for waiters
        if !self.desktop_started {
            self.timers.start(self.frame_timer, IDLE_FRAME_INTERVAL_MS);
            return;
        }

        // The first tick is half a frame: a very unstable update rate
        // results from being perfectly in sync with the application's
        // own update cadence
        self.timers
            .start(self.frame_timer, self.config.frame_interval_ms() / 2);
    }

    fn stop_frame_clock(&mut self) {
        self.timers.stop(self.frame_timer);
    }

    fn frame_tick(&mut self) {
        // We keep running until nothing is pending and nobody is
        // waiting for the counter to advance
        if !self.pending_work() && self.queued_msc <= self.msc {
            return;
        }

        let interval = if self.desktop_started {
            self.config.frame_interval_ms()
        } else {
            IDLE_FRAME_INTERVAL_MS
        };
        self.timers.repeat(self.frame_timer, interval);

        if self.pending_work() {
            self.write_update();
        }

        // A frame produced for pending work counts as implicitly queued
        self.queued_msc = self.queued_msc.max(self.msc);
        self.msc += 1;
        let msc = self.msc;
        self.with_desktop(|desktop, server| desktop.frame_tick(server, msc));
    }

    /// Drains the comparer and fans the resulting delta out to every
    /// client: refreshes the pixels behind the update, lets the comparer
    /// suppress no-op damage, then drives each client's update write.
    fn write_update(&mut self) {
        debug_assert!(self.block_counter == 0);
        debug_assert!(self.desktop_started);

        let Some(pb) = self.pb.clone() else {
            return;
        };
        let fb_rect = pb.borrow().rect();
        let Some(comparer) = self.comparer.as_ref() else {
            return;
        };

        let mut ui = comparer.get_update_info(&fb_rect);
        let to_check = ui.changed.union_with(&ui.copied);

        if self.need_rendered_cursor() {
            let cursor_rect = Rect::from_xywh(0, 0, self.cursor.width(), self.cursor.height())
                .translate(self.cursor_pos.subtract(self.cursor.hotspot()))
                .intersect(&fb_rect);
            if !to_check.intersect_rect(&cursor_rect).is_empty() {
                self.rendered_cursor_invalid = true;
            }
        }

        pb.borrow_mut().grab_region(&to_check);

        let compare = self.get_comparer_state();
        let Some(comparer) = self.comparer.as_mut() else {
            return;
        };
        if compare {
            comparer.enable();
        } else {
            comparer.disable();
        }

        let shrunk = comparer.compare(&*pb.borrow());
        if shrunk {
            ui = comparer.get_update_info(&fb_rect);
        }

        comparer.clear();

        for id in self.client_ids() {
            let result = self.with_client(id, |conn, server| {
                conn.add_copied(&ui.copied, ui.copy_delta);
                conn.add_changed(&ui.changed);
                conn.write_framebuffer_update(server)
            });
            if let Some(Err(e)) = result {
                self.close_client(id, &e.to_string());
            }
        }
    }

    fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| entry.id).collect()
    }
}

impl Drop for VncServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn secs_to_ms(secs: u32) -> u64 {
    u64::from(secs) * 1000
}

/// Best-effort blocking-free full write; short writes are retried
/// immediately since the reject banner is tiny.
fn write_fully(sock: &SocketRef, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        let n = sock.try_write(data)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
    }
    Ok(())
}

fn close_entry(entry: &mut ClientEntry, error: &VncError) {
    log::info!(
        target: "connections",
        "Closing {}: {error}",
        entry.sock.peer_endpoint()
    );
    if let Some(conn) = entry.conn.as_mut() {
        conn.close(&error.to_string());
    }
}
