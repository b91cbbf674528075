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


//! Accumulation of pending framebuffer updates.
//!
//! The desktop backend reports two kinds of damage: regions whose pixels
//! have changed, and regions whose content was copied (scrolled) from
//! elsewhere in the framebuffer. [`UpdateTracker`] consolidates both into
//! a single update set that clients can apply as one copy operation
//! followed by fresh pixel data.

use crate::geometry::{Point, Region};

/// A consolidated set of pending updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateInfo {
    /// Pixels that must be re-read from the framebuffer.
    pub changed: Region,
    /// Pixels whose content can be copied from elsewhere on screen.
    pub copied: Region,
    /// Translation from copy source to `copied` destination.
    pub copy_delta: Point,
}

impl UpdateInfo {
    /// True if there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }
}

/// Accumulates changed and copied regions between update emissions.
///
/// Only one copy operation is tracked at a time; copies that cannot be
/// merged with it degrade to changed regions, which is always correct
/// (the pixels get re-sent instead of client-side copied).
#[derive(Debug, Default)]
pub struct UpdateTracker {
    changed: Region,
    copied: Region,
    copy_delta: Point,
}

impl UpdateTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no damage has been reported since the last [`clear`].
    ///
    /// [`clear`]: UpdateTracker::clear
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }

    /// Marks a region as changed.
    pub fn add_changed(&mut self, region: &Region) {
        self.changed.union(region);
    }

    /// Marks `dest` as copied from `dest` translated by `-delta`.
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        if dest.is_empty() {
            return;
        }

        // Parts whose source is already dirty can't be copied on the
        // client: the source pixels it holds are stale.
        let src = dest.translate(delta.negate());
        let dirty_src = src
            .intersect(&self.changed)
            .union_with(&src.intersect(&self.copied));
        let dirty_dest = dirty_src.translate(delta);
        let mut clean_dest = dest.clone();
        clean_dest.subtract(&dirty_dest);

        // Cleanly copied-over damage is superseded; stale-source parts
        // must be re-sent instead.
        self.changed.subtract(&clean_dest);
        self.copied.subtract(&clean_dest);
        self.copied.subtract(&dirty_dest);
        self.changed.union(&dirty_dest);

        if clean_dest.is_empty() {
            return;
        }

        if self.copied.is_empty() {
            self.copied = clean_dest;
            self.copy_delta = delta;
        } else if self.copy_delta == delta {
            self.copied.union(&clean_dest);
        } else {
            // A second, differently-directed copy; re-send those pixels.
            self.changed.union(&clean_dest);
        }
    }

    /// Emits the consolidated update set, clipped to `clip`.
    ///
    /// Changed takes precedence where the two overlap, so the returned
    /// regions are disjoint.
    pub fn get_update_info(&self, clip: &crate::geometry::Rect) -> UpdateInfo {
        let changed = self.changed.intersect_rect(clip);
        let mut copied = self.copied.intersect_rect(clip);
        copied.subtract(&changed);
        UpdateInfo {
            changed,
            copied,
            copy_delta: self.copy_delta,
        }
    }

    /// Forgets all pending damage.
    pub fn clear(&mut self) {
        self.changed.clear();
        self.copied.clear();
        self.copy_delta = Point::default();
    }

    pub(crate) fn changed_region(&self) -> &Region {
        &self.changed
    }

    pub(crate) fn copied_region(&self) -> &Region {
        &self.copied
    }

    pub(crate) fn copy_delta(&self) -> Point {
        self.copy_delta
    }

    pub(crate) fn replace_changed(&mut self, changed: Region) {
        self.changed = changed;
    }
}
