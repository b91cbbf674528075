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


//! Pixel-comparing update filter.
//!
//! Applications frequently repaint regions without actually changing
//! them. [`ComparingTracker`] wraps the plain [`UpdateTracker`] and, just
//! before emission, compares the reported regions against a retained
//! snapshot of the framebuffer, narrowing the update set to the pixels
//! that really differ. The win is bandwidth; the cost is the snapshot
//! copy and the compare passes.

use crate::framebuffer::{PixelBuffer, BYTES_PER_PIXEL};
use crate::geometry::{Point, Rect, Region};
use crate::tracker::{UpdateInfo, UpdateTracker};

/// Rows per comparison band. Differences are narrowed to the changed
/// column span within each band.
const BAND_HEIGHT: i32 = 16;

/// An [`UpdateTracker`] that suppresses byte-identical regions.
pub struct ComparingTracker {
    tracker: UpdateTracker,
    width: i32,
    height: i32,
    snapshot: Vec<u8>,
    enabled: bool,
    first_compare: bool,
    pixels_in: u64,
    pixels_out: u64,
}

impl ComparingTracker {
    /// Creates a tracker for a framebuffer of the given dimensions.
    ///
    /// The first [`compare`](ComparingTracker::compare) call only seeds
    /// the snapshot; suppression starts with the second.
    #[must_use]
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            tracker: UpdateTracker::new(),
            width,
            height,
            snapshot: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            enabled: true,
            first_compare: true,
            pixels_in: 0,
            pixels_out: 0,
        }
    }

    /// True if no damage is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Marks a region as changed.
    pub fn add_changed(&mut self, region: &Region) {
        self.tracker.add_changed(region);
    }

    /// Marks `dest` as copied from `dest` translated by `-delta`.
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        self.tracker.add_copied(dest, delta);
    }

    /// Emits the consolidated update set, clipped to `clip`.
    pub fn get_update_info(&self, clip: &Rect) -> UpdateInfo {
        self.tracker.get_update_info(clip)
    }

    /// Forgets all pending damage.
    pub fn clear(&mut self) {
        self.tracker.clear();
    }

    /// Turns comparison on.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Turns comparison off. The snapshot goes stale, so the next enabled
    /// compare reseeds it instead of filtering.
    pub fn disable(&mut self) {
        if self.enabled {
            self.enabled = false;
            self.first_compare = true;
        }
    }

    /// Compares pending changed regions against the snapshot, narrowing
    /// them to the pixels that actually differ.
    ///
    /// Returns true if the pending update set shrank, in which case the
    /// caller should re-fetch it. `pb` must be the framebuffer this
    /// tracker was created for.
    pub fn compare(&mut self, pb: &dyn PixelBuffer) -> bool {
        if !self.enabled {
            self.first_compare = true;
            return false;
        }

        if self.first_compare {
            self.snapshot.copy_from_slice(pb.data());
            self.first_compare = false;
            return false;
        }

        let fb_rect = Rect::from_xywh(0, 0, self.width, self.height);

        // Replay pending copies inside the snapshot so the comparison
        // baseline matches what clients will have after the copy.
        let delta = self.tracker.copy_delta();
        let copied = self.tracker.copied_region().intersect_rect(&fb_rect);
        for dest in copied.iter() {
            self.replay_copy(dest, delta);
        }

        let changed = self.tracker.changed_region().intersect_rect(&fb_rect);
        let mut narrowed = Region::new();
        for rect in changed.iter() {
            self.compare_rect(rect, pb.data(), &mut narrowed);
        }

        self.pixels_in += changed.area();
        self.pixels_out += narrowed.area();

        if narrowed == changed {
            return false;
        }
        self.tracker.replace_changed(narrowed);
        true
    }

    /// Logs cumulative suppression efficiency.
    pub fn log_stats(&self) {
        if self.pixels_in == 0 {
            return;
        }
        let culled = self.pixels_in - self.pixels_out;
        log::debug!(
            "comparer: {} pixels in, {} pixels out ({:.1}% culled)",
            self.pixels_in,
            self.pixels_out,
            culled as f64 * 100.0 / self.pixels_in as f64
        );
    }

    fn row_range(&self, x1: i32, x2: i32, y: i32) -> std::ops::Range<usize> {
        let start = (y as usize * self.width as usize + x1 as usize) * BYTES_PER_PIXEL;
        let end = (y as usize * self.width as usize + x2 as usize) * BYTES_PER_PIXEL;
        start..end
    }

    /// Applies one copy rectangle to the snapshot.
    fn replay_copy(&mut self, dest: &Rect, delta: Point) {
        let src = dest.translate(delta.negate());
        let fb_rect = Rect::from_xywh(0, 0, self.width, self.height);
        if !src.enclosed_by(&fb_rect) {
            return;
        }
        // Source and destination may overlap; stage the source bytes.
        let mut staged = Vec::with_capacity(dest.area() as usize * BYTES_PER_PIXEL);
        for y in src.y1..src.y2 {
            staged.extend_from_slice(&self.snapshot[self.row_range(src.x1, src.x2, y)]);
        }
        let row_bytes = dest.width() as usize * BYTES_PER_PIXEL;
        for (i, y) in (dest.y1..dest.y2).enumerate() {
            let range = self.row_range(dest.x1, dest.x2, y);
            self.snapshot[range].copy_from_slice(&staged[i * row_bytes..(i + 1) * row_bytes]);
        }
    }

    /// Compares one rectangle band by band, adding the differing spans to
    /// `out` and refreshing the snapshot underneath.
    fn compare_rect(&mut self, rect: &Rect, current: &[u8], out: &mut Region) {
        let mut band_y1 = rect.y1;
        while band_y1 < rect.y2 {
            let band_y2 = (band_y1 + BAND_HEIGHT).min(rect.y2);

            let mut min_col = rect.x2;
            let mut max_col = rect.x1;
            for y in band_y1..band_y2 {
                let range = self.row_range(rect.x1, rect.x2, y);
                let old = &self.snapshot[range.clone()];
                let new = &current[range];
                let Some(first) = old.iter().zip(new).position(|(a, b)| a != b) else {
                    continue;
                };
                let Some(last) = old.iter().zip(new).rposition(|(a, b)| a != b) else {
                    continue;
                };
                min_col = min_col.min(rect.x1 + (first / BYTES_PER_PIXEL) as i32);
                max_col = max_col.max(rect.x1 + (last / BYTES_PER_PIXEL) as i32);
            }

            if min_col <= max_col {
                out.add_rect(Rect::new(min_col, band_y1, max_col + 1, band_y2));
                for y in band_y1..band_y2 {
                    let range = self.row_range(rect.x1, rect.x2, y);
                    self.snapshot[range.clone()].copy_from_slice(&current[range]);
                }
            }

            band_y1 = band_y2;
        }
    }
}
