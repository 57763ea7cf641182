use image::{Rgba, RgbaImage};

/// Alpha above which a pixel counts as solid.
pub const ALPHA_THRESHOLD: u8 = 127;

/// Per-pixel collision grid derived from an image's opaque pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; (width * height) as usize],
        }
    }

    pub fn filled(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![true; (width * height) as usize],
        }
    }

    pub fn from_image(img: &RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        let bits = img.pixels().map(|p| p.0[3] > ALPHA_THRESHOLD).collect();
        Self {
            width,
            height,
            bits,
        }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut bits = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                bits.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            bits,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    /// Out-of-bounds queries read as unset.
    pub fn at(&self, x: i32, y: i32) -> bool {
        self.in_bounds(x, y) && self.bits[(y as u32 * self.width + x as u32) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            self.bits[(y * self.width + x) as usize] = value;
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Rows of `self` intersecting `other` placed at `offset`, as x/y ranges in
    /// `self` coordinates.
    fn overlap_window(&self, other: &Mask, offset: (i32, i32)) -> Option<(i32, i32, i32, i32)> {
        let (dx, dy) = offset;
        let x0 = dx.max(0);
        let y0 = dy.max(0);
        let x1 = (dx + other.width as i32).min(self.width as i32);
        let y1 = (dy + other.height as i32).min(self.height as i32);
        (x0 < x1 && y0 < y1).then_some((x0, y0, x1, y1))
    }

    /// First pixel (scanning rows top to bottom, then left to right) set in
    /// both masks when `other` is shifted by `offset`. The returned point is in
    /// `self` coordinates, so its y is the minimum overlapping row.
    pub fn overlap(&self, other: &Mask, offset: (i32, i32)) -> Option<(u32, u32)> {
        let (x0, y0, x1, y1) = self.overlap_window(other, offset)?;
        let (dx, dy) = offset;
        for y in y0..y1 {
            for x in x0..x1 {
                if self.at(x, y) && other.at(x - dx, y - dy) {
                    return Some((x as u32, y as u32));
                }
            }
        }
        None
    }

    pub fn overlap_count(&self, other: &Mask, offset: (i32, i32)) -> usize {
        let Some((x0, y0, x1, y1)) = self.overlap_window(other, offset) else {
            return 0;
        };
        let (dx, dy) = offset;
        let mut count = 0;
        for y in y0..y1 {
            for x in x0..x1 {
                if self.at(x, y) && other.at(x - dx, y - dy) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Mask with a `margin`-pixel band cleared along every edge.
    pub fn shrunk(&self, margin: u32) -> Mask {
        Mask::from_fn(self.width, self.height, |x, y| {
            x >= margin
                && y >= margin
                && x + margin < self.width
                && y + margin < self.height
                && self.at(x as i32, y as i32)
        })
    }
}

/// Rotate `img` counter-clockwise (as displayed) by `degrees`, growing the
/// canvas to hold the whole rotated sprite. Nearest-neighbour sampling keeps
/// the result deterministic for a given angle.
pub fn rotate_image(img: &RgbaImage, degrees: f32) -> RgbaImage {
    let deg = degrees.rem_euclid(360.0);
    if deg == 0.0 {
        return img.clone();
    }
    let (w, h) = (img.width() as f32, img.height() as f32);
    let (s, c) = deg.to_radians().sin_cos();
    let new_w = (w * c.abs() + h * s.abs()).ceil().max(1.0) as u32;
    let new_h = (w * s.abs() + h * c.abs()).ceil().max(1.0) as u32;

    let mut out = RgbaImage::from_pixel(new_w, new_h, Rgba([0, 0, 0, 0]));
    let (cx_out, cy_out) = (new_w as f32 / 2.0, new_h as f32 / 2.0);
    let (cx_in, cy_in) = (w / 2.0, h / 2.0);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let px_rel = x as f32 + 0.5 - cx_out;
        let py_rel = y as f32 + 0.5 - cy_out;
        let sx = (px_rel * c - py_rel * s + cx_in).floor();
        let sy = (px_rel * s + py_rel * c + cy_in).floor();
        if sx >= 0.0 && sy >= 0.0 && sx < w && sy < h {
            *px = *img.get_pixel(sx as u32, sy as u32);
        }
    }
    out
}
