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


//! Cursor shape and server-side cursor rendering.
//!
//! Clients that support a cursor pseudo-encoding draw the pointer
//! themselves; for the rest the coordinator composites the cursor into
//! the framebuffer data it sends ([`RenderedCursor`]).

use crate::framebuffer::{PixelBuffer, BYTES_PER_PIXEL};
use crate::geometry::{Point, Rect};

/// A cursor shape: RGBA pixels plus a hotspot.
///
/// Unlike the framebuffer, the alpha channel is meaningful here; byte 3
/// of each pixel is coverage, with 0 fully transparent.
#[derive(Debug, Clone)]
pub struct Cursor {
    width: i32,
    height: i32,
    hotspot: Point,
    data: Vec<u8>,
}

impl Cursor {
    /// Creates a cursor from RGBA pixel data.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not `width * height * 4` bytes.
    #[must_use]
    pub fn new(width: i32, height: i32, hotspot: Point, data: &[u8]) -> Self {
        assert_eq!(
            data.len(),
            width as usize * height as usize * BYTES_PER_PIXEL,
            "cursor data does not match dimensions"
        );
        Self {
            width,
            height,
            hotspot,
            data: data.to_vec(),
        }
    }

    /// The empty (invisible) cursor.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, 0, Point::default(), &[])
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Hotspot position within the shape.
    #[must_use]
    pub fn hotspot(&self) -> Point {
        self.hotspot
    }

    /// RGBA pixel data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True if every pixel is fully transparent (or the shape is 0x0).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn alpha_at(&self, x: i32, y: i32) -> u8 {
        self.data[(y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL + 3]
    }

    /// Trims fully transparent borders, moving the hotspot along.
    ///
    /// A fully transparent cursor crops to 0x0.
    pub fn crop(&mut self) {
        let mut x1 = self.width;
        let mut y1 = self.height;
        let mut x2 = 0;
        let mut y2 = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.alpha_at(x, y) != 0 {
                    x1 = x1.min(x);
                    y1 = y1.min(y);
                    x2 = x2.max(x + 1);
                    y2 = y2.max(y + 1);
                }
            }
        }

        if x2 <= x1 {
            *self = Self::empty();
            return;
        }
        if x1 == 0 && y1 == 0 && x2 == self.width && y2 == self.height {
            return;
        }

        let new_width = x2 - x1;
        let new_height = y2 - y1;
        let mut data = Vec::with_capacity((new_width * new_height) as usize * BYTES_PER_PIXEL);
        for y in y1..y2 {
            let start = (y as usize * self.width as usize + x1 as usize) * BYTES_PER_PIXEL;
            let end = (y as usize * self.width as usize + x2 as usize) * BYTES_PER_PIXEL;
            data.extend_from_slice(&self.data[start..end]);
        }
        self.width = new_width;
        self.height = new_height;
        self.hotspot = self.hotspot.subtract(Point::new(x1, y1));
        self.data = data;
    }
}

/// The cursor composited onto the framebuffer content beneath it.
///
/// Holds the blended pixels for the (clipped) cursor rectangle; updated
/// lazily by the coordinator when the cursor or the pixels under it move.
#[derive(Debug, Default)]
pub struct RenderedCursor {
    rect: Rect,
    data: Vec<u8>,
}

impl RenderedCursor {
    /// The framebuffer rectangle the composite covers. Empty when the
    /// cursor is off-screen or invisible.
    #[must_use]
    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Blended RGBA pixels for [`rect`](RenderedCursor::rect).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Recomputes the composite for `cursor` at `pos` (hotspot-anchored)
    /// over `pb`.
    pub fn update(&mut self, pb: &dyn PixelBuffer, cursor: &Cursor, pos: Point) {
        let origin = pos.subtract(cursor.hotspot());
        self.rect = Rect::from_xywh(origin.x, origin.y, cursor.width(), cursor.height())
            .intersect(&pb.rect());
        self.data.clear();
        if self.rect.is_empty() {
            self.rect = Rect::default();
            return;
        }

        let fb = pb.data();
        let fb_width = pb.width() as usize;
        for y in self.rect.y1..self.rect.y2 {
            for x in self.rect.x1..self.rect.x2 {
                let fb_off = (y as usize * fb_width + x as usize) * BYTES_PER_PIXEL;
                let cx = (x - origin.x) as usize;
                let cy = (y - origin.y) as usize;
                let cur_off = (cy * cursor.width() as usize + cx) * BYTES_PER_PIXEL;
                let cur = &cursor.data()[cur_off..cur_off + 4];
                let alpha = u32::from(cur[3]);
                for c in 0..3 {
                    let blended = (u32::from(cur[c]) * alpha
                        + u32::from(fb[fb_off + c]) * (255 - alpha))
                        / 255;
                    self.data.push(blended as u8);
                }
                self.data.push(fb[fb_off + 3]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::MemoryPixelBuffer;

    /// A 4x4 cursor with an opaque white 2x2 core at (1,1).
    fn bordered_cursor() -> Cursor {
        let mut data = vec![0u8; 4 * 4 * 4];
        for y in 1..3 {
            for x in 1..3 {
                let off = (y * 4 + x) * 4;
                data[off..off + 4].copy_from_slice(&[255, 255, 255, 255]);
            }
        }
        Cursor::new(4, 4, Point::new(2, 2), &data)
    }

    #[test]
    fn test_crop_trims_transparent_border() {
        let mut cursor = bordered_cursor();
        cursor.crop();
        assert_eq!((cursor.width(), cursor.height()), (2, 2));
        assert_eq!(cursor.hotspot(), Point::new(1, 1));
        assert!(cursor.data().iter().all(|&b| b == 255));
    }

    #[test]
    fn test_crop_of_opaque_cursor_is_identity() {
        let data = vec![255u8; 2 * 2 * 4];
        let mut cursor = Cursor::new(2, 2, Point::new(0, 0), &data);
        cursor.crop();
        assert_eq!((cursor.width(), cursor.height()), (2, 2));
    }

    #[test]
    fn test_crop_of_transparent_cursor_is_empty() {
        let data = vec![0u8; 3 * 3 * 4];
        let mut cursor = Cursor::new(3, 3, Point::new(1, 1), &data);
        cursor.crop();
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_rendered_cursor_blends_opaque_pixels() {
        let mut fb = MemoryPixelBuffer::new(8, 8);
        fb.fill_rect(&Rect::from_xywh(0, 0, 8, 8), [10, 20, 30, 0]);
        let mut cursor = bordered_cursor();
        cursor.crop();

        let mut rendered = RenderedCursor::default();
        rendered.update(&fb, &cursor, Point::new(4, 4));
        // Hotspot (1,1) anchored at (4,4) puts the 2x2 core at (3,3).
        assert_eq!(rendered.rect(), Rect::from_xywh(3, 3, 2, 2));
        assert_eq!(&rendered.data()[..3], &[255, 255, 255]);
    }

    #[test]
    fn test_rendered_cursor_clips_at_edges() {
        let fb = MemoryPixelBuffer::new(8, 8);
        let mut cursor = bordered_cursor();
        cursor.crop();

        let mut rendered = RenderedCursor::default();
        rendered.update(&fb, &cursor, Point::new(0, 0));
        // Core origin would be (-1,-1); clipped to one visible pixel.
        assert_eq!(rendered.rect(), Rect::from_xywh(0, 0, 1, 1));
        assert_eq!(rendered.data().len(), 4);
    }

    #[test]
    fn test_rendered_cursor_off_screen_is_empty() {
        let fb = MemoryPixelBuffer::new(8, 8);
        let mut cursor = bordered_cursor();
        cursor.crop();

        let mut rendered = RenderedCursor::default();
        rendered.update(&fb, &cursor, Point::new(100, 100));
        assert!(rendered.rect().is_empty());
        assert!(rendered.data().is_empty());
    }

    #[test]
    fn test_transparent_pixels_show_framebuffer() {
        let mut fb = MemoryPixelBuffer::new(8, 8);
        fb.fill_rect(&Rect::from_xywh(0, 0, 8, 8), [10, 20, 30, 0]);
        let cursor = bordered_cursor(); // uncropped: transparent border

        let mut rendered = RenderedCursor::default();
        rendered.update(&fb, &cursor, Point::new(2, 2));
        // Top-left pixel of the 4x4 shape is transparent.
        assert_eq!(&rendered.data()[..3], &[10, 20, 30]);
    }
}
