//! Tablet → screen coordinate mapping.
//!
//! The client sends coordinates normalized to its own panel. Depending
//! on the fit mode, the streamed picture covers only a sub-rectangle of
//! the panel (letterbox) or the panel shows only a sub-rectangle of the
//! screen (fill); this transform inverts that mapping and yields screen
//! pixel coordinates, clamping anything that lands in the black bars to
//! the nearest edge pixel.

/// How the screen image is fitted onto the tablet panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// Preserve aspect ratio, black bars on the short side.
    #[default]
    Letterbox,
    /// Preserve aspect ratio, crop the long side.
    Fill,
    /// Distort to cover the whole panel.
    Stretch,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordTransform {
    screen_width: u32,
    screen_height: u32,
    rotate90: bool,
    scale_x: f32,
    scale_y: f32,
    offset_x: f32,
    offset_y: f32,
}

impl CoordTransform {
    pub fn new(
        screen_width: u32,
        screen_height: u32,
        tablet_width: u32,
        tablet_height: u32,
        mode: FitMode,
        rotate90: bool,
    ) -> Self {
        let screen_aspect = screen_width as f32 / screen_height as f32;
        let tablet_aspect = if rotate90 {
            tablet_height as f32 / tablet_width as f32
        } else {
            tablet_width as f32 / tablet_height as f32
        };

        let (scale_x, scale_y, offset_x, offset_y) = match mode {
            FitMode::Letterbox => {
                if tablet_aspect > screen_aspect {
                    // Tablet is wider: bars left and right.
                    let sx = screen_aspect / tablet_aspect;
                    (sx, 1.0, (1.0 - sx) / 2.0, 0.0)
                } else {
                    // Tablet is taller: bars top and bottom.
                    let sy = tablet_aspect / screen_aspect;
                    (1.0, sy, 0.0, (1.0 - sy) / 2.0)
                }
            }
            FitMode::Fill => {
                if tablet_aspect > screen_aspect {
                    let sy = tablet_aspect / screen_aspect;
                    (1.0, sy, 0.0, (1.0 - sy) / 2.0)
                } else {
                    let sx = screen_aspect / tablet_aspect;
                    (sx, 1.0, (1.0 - sx) / 2.0, 0.0)
                }
            }
            FitMode::Stretch => (1.0, 1.0, 0.0, 0.0),
        };

        Self { screen_width, screen_height, rotate90, scale_x, scale_y, offset_x, offset_y }
    }

    /// Map normalized tablet coordinates into screen pixels.
    pub fn transform(&self, tx: f32, ty: f32) -> (i32, i32) {
        let (tx, ty) = if self.rotate90 { (ty, 1.0 - tx) } else { (tx, ty) };

        let x = ((tx - self.offset_x) / self.scale_x).clamp(0.0, 1.0);
        let y = ((ty - self.offset_y) / self.scale_y).clamp(0.0, 1.0);

        let sx = ((x * self.screen_width as f32) as i32).min(self.screen_width as i32 - 1);
        let sy = ((y * self.screen_height as f32) as i32).min(self.screen_height as i32 - 1);
        (sx, sy)
    }

    /// The fraction of the tablet panel covered by the picture, for
    /// diagnostics.
    pub fn visible_area(&self) -> (f32, f32, f32, f32) {
        (self.offset_x, self.offset_y, self.scale_x, self.scale_y)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_aspect_is_identity() {
        let t = CoordTransform::new(1920, 1080, 1920, 1080, FitMode::Letterbox, false);
        assert_eq!(t.transform(0.0, 0.0), (0, 0));
        assert_eq!(t.transform(0.5, 0.5), (960, 540));
        assert_eq!(t.transform(1.0, 1.0), (1919, 1079));
    }

    #[test]
    fn letterbox_covers_expected_fraction() {
        // 16:9 screen on a portrait 1080×2340 panel: the picture spans
        // the full width and tablet_aspect / screen_aspect of the height.
        let t = CoordTransform::new(1920, 1080, 1080, 2340, FitMode::Letterbox, false);
        let (ox, oy, sx, sy) = t.visible_area();

        let screen_aspect = 1920.0 / 1080.0_f32;
        let tablet_aspect = 1080.0 / 2340.0_f32;
        assert!((sx - 1.0).abs() < 1e-6);
        assert!((sy - tablet_aspect / screen_aspect).abs() < 1e-6);
        assert!(ox.abs() < 1e-6);
        assert!((oy - (1.0 - sy) / 2.0).abs() < 1e-6);

        // Center of the visible band maps to the screen center.
        assert_eq!(t.transform(0.5, 0.5), (960, 540));
    }

    #[test]
    fn points_in_the_bars_clamp_to_edges() {
        let t = CoordTransform::new(1920, 1080, 1080, 2340, FitMode::Letterbox, false);
        // Above the visible band: clamps to the top edge.
        assert_eq!(t.transform(0.5, 0.0).1, 0);
        // Below it: clamps to the bottom edge.
        assert_eq!(t.transform(0.5, 1.0).1, 1079);
        // Horizontal axis is fully covered, so x still varies.
        assert_eq!(t.transform(0.0, 0.0).0, 0);
        assert_eq!(t.transform(1.0, 0.0).0, 1919);
    }

    #[test]
    fn stretch_ignores_aspect() {
        let t = CoordTransform::new(1920, 1080, 1000, 1000, FitMode::Stretch, false);
        assert_eq!(t.transform(0.25, 0.75), (480, 810));
    }

    #[test]
    fn fill_crops_the_long_side() {
        // Wider tablet on a 16:9 screen in FILL: the screen's vertical
        // extent is cropped, so scale_y > 1 and ty=0 maps inside the
        // screen rather than to the top edge.
        let t = CoordTransform::new(1920, 1080, 2340, 1080, FitMode::Fill, false);
        let (_, oy, _, sy) = t.visible_area();
        assert!(sy > 1.0);
        assert!(oy < 0.0);
        let (_, y) = t.transform(0.5, 0.0);
        assert!(y > 0);
    }

    #[test]
    fn rotate90_swaps_axes() {
        let t = CoordTransform::new(1920, 1080, 1080, 1920, FitMode::Letterbox, true);
        // With rotation the portrait panel maps edge-to-edge: the
        // panel's y axis runs along the screen's x axis.
        let (x0, _) = t.transform(0.0, 0.0);
        let (x1, _) = t.transform(0.0, 1.0);
        assert_eq!(x0, 0);
        assert_eq!(x1, 1919);
        // And the panel's x axis runs down the screen (inverted).
        let (_, y0) = t.transform(0.0, 0.0);
        let (_, y1) = t.transform(1.0, 0.0);
        assert_eq!(y0, 1079);
        assert_eq!(y1, 0);
    }
}
