//! Screen layout: the set of monitors making up the virtual desktop.

use crate::geometry::Rect;

/// One screen (monitor) within the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    /// Stable identifier chosen by the layout's author.
    pub id: u32,
    /// The screen's extent, in framebuffer coordinates.
    pub dimensions: Rect,
    /// Opaque per-screen flags carried through to clients.
    pub flags: u32,
}

impl Screen {
    /// Creates a screen from position and size.
    #[must_use]
    pub fn new(id: u32, x: i32, y: i32, w: i32, h: i32, flags: u32) -> Self {
        Self {
            id,
            dimensions: Rect::from_xywh(x, y, w, h),
            flags,
        }
    }
}

/// An ordered set of screens describing a possibly-multi-monitor layout.
///
/// A layout is only meaningful relative to a framebuffer: every screen
/// must fit inside it and at least one screen must exist. Use
/// [`ScreenSet::validate`] to check both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenSet {
    screens: Vec<Screen>,
}

impl ScreenSet {
    /// Creates an empty layout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of screens in the layout.
    #[must_use]
    pub fn num_screens(&self) -> usize {
        self.screens.len()
    }

    /// True if the layout has no screens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    /// Appends a screen to the layout.
    pub fn add_screen(&mut self, screen: Screen) {
        self.screens.push(screen);
    }

    /// Removes the screen with the given id, if present.
    pub fn remove_screen(&mut self, id: u32) {
        self.screens.retain(|s| s.id != id);
    }

    /// Iterates the screens in layout order.
    pub fn iter(&self) -> impl Iterator<Item = &Screen> {
        self.screens.iter()
    }

    /// Checks the layout against a framebuffer of the given size.
    ///
    /// A valid layout has at least one screen, unique screen ids, and
    /// every screen non-empty and fully inside the framebuffer.
    #[must_use]
    pub fn validate(&self, fb_width: i32, fb_height: i32) -> bool {
        if self.screens.is_empty() {
            return false;
        }
        let fb_rect = Rect::from_xywh(0, 0, fb_width, fb_height);
        for (i, screen) in self.screens.iter().enumerate() {
            if screen.dimensions.is_empty() {
                return false;
            }
            if !screen.dimensions.enclosed_by(&fb_rect) {
                return false;
            }
            if self.screens[..i].iter().any(|s| s.id == screen.id) {
                return false;
            }
        }
        true
    }
}
