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


//! # vncmux
//!
//! A single-threaded session coordinator for RFB (VNC) servers.
//!
//! This library is the piece of a VNC server that sits between the
//! socket-owning I/O loop, the per-client protocol drivers and the
//! pixel-capturing desktop backend: it admits and tears down client
//! connections, arbitrates the shared per-session resources (pointer
//! grab, clipboard ownership, cursor, keyboard LEDs, screen layout), and
//! runs the frame clock that turns raw damage reports into de-duplicated
//! framebuffer updates fanned out to every client.
//!
//! It deliberately does *not* implement the per-connection wire protocol,
//! pixel capture, input injection, or socket I/O; those arrive through
//! the [`Connection`], [`DesktopBackend`] and [`Socket`] traits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Embedding I/O loop               │
//! │                                         │
//! │  • Owns and polls all sockets           │
//! │  • Sleeps until the next timer          │
//! │  • Reaps closed sockets                 │
//! └──────────────────┬──────────────────────┘
//!                    │ add/remove socket, read/write
//!                    │ readiness, timer expiry
//!                    ▼
//! ┌─────────────────────────────────────────┐
//! │        VncServer (coordinator)          │
//! │                                         │
//! │  • Client admission and teardown        │
//! │  • Frame clock and update differencing  │
//! │  • Pointer / clipboard arbitration      │
//! └───────┬─────────────────────┬───────────┘
//!         │ updates, events     │ input, damage,
//!         ▼                     ▼ clipboard
//! ┌───────────────┐    ┌─────────────────────┐
//! │ Connection ×N │    │  DesktopBackend     │
//! │ (protocol     │    │  (capture, input    │
//! │  drivers)     │    │   injection)        │
//! └───────────────┘    └─────────────────────┘
//! ```
//!
//! ## Scheduling model
//!
//! Everything is single-threaded and cooperative. No coordinator method
//! blocks; the embedder drives the whole session by polling the sockets
//! from [`VncServer::get_sockets`] with a timeout no longer than
//! [`VncServer::next_timeout`], then reporting readiness and letting
//! [`VncServer::process_timeouts`] dispatch expired timers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blacklist;
pub mod comparer;
pub mod config;
pub mod cursor;
pub mod error;
pub mod framebuffer;
pub mod geometry;
pub mod keymap;
pub mod protocol;
pub mod screens;
pub mod server;
pub mod timer;
pub mod tracker;

mod connection;
mod desktop;
mod socket;

// Re-exports
pub use blacklist::Blacklist;
pub use comparer::ComparingTracker;
pub use config::{CompareMode, ServerConfig};
pub use connection::{
    AccessRights, ClientId, Connection, ConnectionFactory, LayoutReason, ResizeResult,
};
pub use cursor::{Cursor, RenderedCursor};
pub use desktop::DesktopBackend;
pub use error::{Result, VncError};
pub use framebuffer::{MemoryPixelBuffer, PixelBuffer, PixelBufferRef};
pub use geometry::{Point, Rect, Region};
pub use keymap::KeyRemapper;
pub use screens::{Screen, ScreenSet};
pub use server::VncServer;
pub use socket::{same_socket, Socket, SocketRef};
pub use timer::{Clock, ManualClock, SystemClock, TimerSet, TimerToken};
pub use tracker::{UpdateInfo, UpdateTracker};
