//! Rectangle overlays drawn in place on NV21 frames

use serde::{Deserialize, Serialize};

use crate::video::format::PixelFormat;
use crate::video::frame::Image;

/// Overlay slots available through `draw_rect`
pub const MAX_RECTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// BT.601 analog coefficients, truncated toward zero
    pub fn to_yuv(&self) -> (u8, u8, u8) {
        let (r, g, b) = (self.r as f64, self.g as f64, self.b as f64);
        let y = (0.299 * r + 0.587 * g + 0.114 * b) as i32;
        let u = (-0.14713 * r - 0.28886 * g + 0.436 * b) as i32 + 128;
        let v = (0.615 * r - 0.51499 * g - 0.10001 * b) as i32 + 128;
        (clamp_u8(y), clamp_u8(u), clamp_u8(v))
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// One named rectangle slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RectOverlay {
    pub id: usize,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub color: Color,
    /// Border width; negative fills the rectangle
    pub thickness: i32,
    pub visible: bool,
}

impl RectOverlay {
    /// Draw onto `image`; non-NV21 images are left untouched
    pub fn draw(&self, image: &mut Image) {
        if !self.visible || image.format() != PixelFormat::Nv21 {
            return;
        }
        let (width, height) = (image.width() as i32, image.height() as i32);
        let yuv = self.color.to_yuv();
        draw_rectangle(image.data_mut(), width, height, self, yuv);
    }
}

/// Draw every visible overlay in slot order
pub fn draw_overlays(image: &mut Image, rects: &[RectOverlay]) {
    for rect in rects.iter().filter(|r| r.visible) {
        rect.draw(image);
    }
}

fn even_down(v: i32) -> i32 {
    if v % 2 == 0 {
        v
    } else {
        v - 1
    }
}

fn draw_rectangle(data: &mut [u8], width: i32, height: i32, rect: &RectOverlay, yuv: (u8, u8, u8)) {
    let mut x = even_down(rect.x).max(0);
    if x >= width {
        x = width - 2;
    }
    let mut y = even_down(rect.y).max(0);
    if y >= height {
        y = height - 2;
    }
    // clamp before adding so caller-supplied extents cannot overflow
    let w = even_down(rect.w).min(width - x).max(0);
    let h = even_down(rect.h).min(height - y).max(0);

    if rect.thickness < 0 {
        fill_rect(data, width, height, x, y, w, h, yuv);
        return;
    }

    let thickness = rect.thickness.min(width.max(height));
    let t = if thickness % 2 == 0 { thickness } else { thickness + 1 };
    // upper, lower
    fill_rect(data, width, height, x, y, w, t, yuv);
    fill_rect(data, width, height, x, (y + h - t).max(0), w, t, yuv);
    // left, right
    let side_y = if y + t < height { y + t } else { height - t };
    let right_x = if x + w - t < width { x + w - t } else { width - t };
    fill_rect(data, width, height, x, side_y, t, h - 2 * t, yuv);
    fill_rect(data, width, height, right_x, side_y, t, h - 2 * t, yuv);
}

/// Luma per pixel, chroma per 2x2 block stored V then U
#[allow(clippy::too_many_arguments)]
fn fill_rect(data: &mut [u8], width: i32, height: i32, x: i32, y: i32, w: i32, h: i32, yuv: (u8, u8, u8)) {
    let (luma, u, v) = yuv;
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = x.saturating_add(w).min(width);
    let y1 = y.saturating_add(h).min(height);
    if x0 >= x1 || y0 >= y1 {
        return;
    }
    let (width, height) = (width as usize, height as usize);
    let (x0, x1, y0, y1) = (x0 as usize, x1 as usize, y0 as usize, y1 as usize);

    for row in y0..y1 {
        let start = row * width;
        if let Some(line) = data.get_mut(start + x0..start + x1) {
            line.fill(luma);
        }
    }
    let chroma = width * height;
    for row in (y0..y1).step_by(2) {
        for col in (x0..x1).step_by(2) {
            let idx = chroma + (row / 2) * width + col;
            if idx + 1 < data.len() {
                data[idx] = v;
                data[idx + 1] = u;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    const W: usize = 16;
    const H: usize = 8;

    fn frame() -> Image {
        Image::zeroed(Resolution::new(W as u32, H as u32), PixelFormat::Nv21)
    }

    fn luma(img: &Image, x: usize, y: usize) -> u8 {
        img.data()[y * W + x]
    }

    /// (V, U) of the 2x2 block containing (x, y)
    fn chroma(img: &Image, x: usize, y: usize) -> (u8, u8) {
        let idx = W * H + (y / 2) * W + (x & !1);
        (img.data()[idx], img.data()[idx + 1])
    }

    fn rect(x: i32, y: i32, w: i32, h: i32, thickness: i32) -> RectOverlay {
        RectOverlay {
            id: 0,
            x,
            y,
            w,
            h,
            color: Color::BLUE,
            thickness,
            visible: true,
        }
    }

    #[test]
    fn test_color_conversion() {
        assert_eq!(Color::BLACK.to_yuv(), (0, 128, 128));
        assert_eq!(Color::BLUE.to_yuv(), (29, 239, 103));
        // V saturates instead of wrapping
        assert_eq!(Color::RED.to_yuv().2, 255);
    }

    #[test]
    fn test_filled_rect() {
        let mut img = frame();
        rect(3, 2, 5, 4, -1).draw(&mut img);
        // x snaps to 2, w to 4
        assert_eq!(luma(&img, 2, 2), 29);
        assert_eq!(luma(&img, 5, 5), 29);
        assert_eq!(luma(&img, 6, 2), 0);
        assert_eq!(luma(&img, 1, 2), 0);
        assert_eq!(luma(&img, 2, 6), 0);
        assert_eq!(chroma(&img, 2, 2), (103, 239));
        assert_eq!(chroma(&img, 4, 4), (103, 239));
        assert_eq!(chroma(&img, 6, 2), (0, 0));
    }

    #[test]
    fn test_outline_leaves_center() {
        let mut img = frame();
        rect(0, 0, 8, 8, 1).draw(&mut img);
        // thickness 1 rounds up to 2
        assert_eq!(luma(&img, 0, 0), 29);
        assert_eq!(luma(&img, 1, 4), 29);
        assert_eq!(luma(&img, 7, 4), 29);
        assert_eq!(luma(&img, 4, 7), 29);
        assert_eq!(luma(&img, 4, 4), 0);
        assert_eq!(luma(&img, 2, 2), 0);
    }

    #[test]
    fn test_clamped_to_frame() {
        let mut img = frame();
        rect(12, 6, 40, 40, -1).draw(&mut img);
        assert_eq!(luma(&img, 15, 7), 29);
        assert_eq!(luma(&img, 11, 7), 0);
        assert_eq!(img.data().len(), W * H * 3 / 2);

        let mut img = frame();
        rect(-6, -6, 4, 4, -1).draw(&mut img);
        assert_eq!(luma(&img, 0, 0), 29);
        assert_eq!(luma(&img, 4, 4), 0);
    }

    #[test]
    fn test_extreme_extents_do_not_overflow() {
        let mut img = frame();
        rect(4, 0, i32::MAX, i32::MAX, -1).draw(&mut img);
        assert_eq!(luma(&img, 3, 0), 0);
        assert_eq!(luma(&img, 4, 0), 29);
        assert_eq!(luma(&img, 15, 7), 29);

        // a border thicker than the frame covers the whole rectangle
        let mut img = frame();
        rect(0, 0, 8, 8, i32::MAX).draw(&mut img);
        assert_eq!(luma(&img, 4, 4), 29);
        assert_eq!(luma(&img, 8, 4), 0);

        let mut img = frame();
        rect(i32::MIN, i32::MIN + 1, i32::MIN, 4, i32::MIN).draw(&mut img);
        assert!(img.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_hidden_and_non_nv21_ignored() {
        let mut img = frame();
        let mut hidden = rect(0, 0, 4, 4, -1);
        hidden.visible = false;
        draw_overlays(&mut img, &[hidden]);
        assert!(img.data().iter().all(|b| *b == 0));

        let mut gray = Image::zeroed(Resolution::new(W as u32, H as u32), PixelFormat::Grayscale);
        rect(0, 0, 4, 4, -1).draw(&mut gray);
        assert!(gray.data().iter().all(|b| *b == 0));
    }
}
