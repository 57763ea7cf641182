use anyhow::Result;
use glam::{IVec2, Vec2};
use image::RgbaImage;
use minifb::{KeyRepeat, Window, WindowOptions};

use crate::app::{App, FrameInput};
use crate::audio::{AudioOutput, CuePlayer};
use crate::driver::{HeldKeys, Key};
use crate::race::RaceController;
use crate::track::TrackAssets;

const RAY_COLOR: u32 = 0x00_ff_e0_40;
const OBSTACLE_FILL: u32 = 0x00_c0_40_30;

const KEY_MAP: [(minifb::Key, Key); 16] = [
    (minifb::Key::W, Key::W),
    (minifb::Key::A, Key::A),
    (minifb::Key::S, Key::S),
    (minifb::Key::D, Key::D),
    (minifb::Key::Up, Key::Up),
    (minifb::Key::Down, Key::Down),
    (minifb::Key::Left, Key::Left),
    (minifb::Key::Right, Key::Right),
    (minifb::Key::Space, Key::Space),
    (minifb::Key::Escape, Key::Escape),
    (minifb::Key::Enter, Key::Enter),
    (minifb::Key::P, Key::P),
    (minifb::Key::R, Key::R),
    (minifb::Key::Key1, Key::Num1),
    (minifb::Key::Key2, Key::Num2),
    (minifb::Key::Key3, Key::Num3),
];

// =============================================================================
// Software Compositing
// =============================================================================

/// 0RGB framebuffer the size of the track.
pub struct Canvas {
    width: usize,
    height: usize,
    pixels: Vec<u32>,
}

impl Canvas {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> u32 {
        self.pixels[y * self.width + x]
    }

    /// Copy an image ignoring alpha, darkened by `shade` in [0, 1].
    pub fn fill_from(&mut self, img: &RgbaImage, shade: f32) {
        for (x, y, px) in img.enumerate_pixels() {
            if (x as usize) < self.width && (y as usize) < self.height {
                let [r, g, b, _] = px.0;
                let scale = |c: u8| (c as f32 * shade) as u32;
                self.pixels[y as usize * self.width + x as usize] =
                    (scale(r) << 16) | (scale(g) << 8) | scale(b);
            }
        }
    }

    /// Alpha-blend an image with its top-left corner at `at`.
    pub fn blend(&mut self, img: &RgbaImage, at: IVec2) {
        for (x, y, px) in img.enumerate_pixels() {
            let [r, g, b, a] = px.0;
            if a == 0 {
                continue;
            }
            let (cx, cy) = (at.x + x as i32, at.y + y as i32);
            let Some(idx) = self.index(cx, cy) else {
                continue;
            };
            let dst = self.pixels[idx];
            let mix = |src: u8, shift: u32| {
                let d = (dst >> shift) & 0xff;
                (src as u32 * a as u32 + d * (255 - a as u32)) / 255
            };
            self.pixels[idx] = (mix(r, 16) << 16) | (mix(g, 8) << 8) | mix(b, 0);
        }
    }

    pub fn fill_rect(&mut self, at: IVec2, size: (u32, u32), color: u32) {
        for y in 0..size.1 as i32 {
            for x in 0..size.0 as i32 {
                if let Some(idx) = self.index(at.x + x, at.y + y) {
                    self.pixels[idx] = color;
                }
            }
        }
    }

    /// Bresenham line, clipped to the canvas.
    pub fn line(&mut self, from: Vec2, to: Vec2, color: u32) {
        let (mut x0, mut y0) = (from.x.round() as i32, from.y.round() as i32);
        let (x1, y1) = (to.x.round() as i32, to.y.round() as i32);
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            if let Some(idx) = self.index(x0, y0) {
                self.pixels[idx] = color;
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            None
        } else {
            Some(y as usize * self.width + x as usize)
        }
    }
}

/// Draw a race: track, finish line, live obstacles, cars, then rays.
pub fn draw_race(canvas: &mut Canvas, race: &RaceController, show_rays: bool) {
    let track = race.track();
    canvas.fill_from(track.image(), 1.0);
    canvas.blend(track.finish_image(), track.finish_position());

    let field = race.obstacles();
    for obstacle in field.obstacles().iter().filter(|o| o.alive()) {
        match field.sprite() {
            Some(sprite) => canvas.blend(sprite, obstacle.position()),
            None => canvas.fill_rect(obstacle.position(), obstacle.size(), OBSTACLE_FILL),
        }
    }

    for racer in race.racers() {
        let car = racer.car();
        canvas.blend(car.body_image(), car.top_left());
        if show_rays && !racer.terminated() {
            for &hit in racer.rays().hit_points() {
                canvas.line(car.position(), hit, RAY_COLOR);
            }
        }
    }
}

// =============================================================================
// Window Frontend
// =============================================================================

pub struct Frontend {
    window: Window,
    canvas: Canvas,
    backdrop: RgbaImage,
    sound: Option<CuePlayer>,
    show_rays: bool,
}

impl Frontend {
    pub fn new(assets: &TrackAssets, fps: u32, sound: bool, show_rays: bool) -> Result<Self> {
        let (width, height) = assets.track.dimensions();
        let mut window = Window::new(
            "Racing RL",
            width as usize,
            height as usize,
            WindowOptions {
                resize: true,
                scale: minifb::Scale::X1,
                ..Default::default()
            },
        )?;
        window.set_target_fps(fps as usize);

        let sound = if sound {
            match AudioOutput::new() {
                Ok(output) => Some(CuePlayer::new(output, fps)),
                Err(e) => {
                    tracing::warn!("audio disabled: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            window,
            canvas: Canvas::new(width as usize, height as usize),
            backdrop: assets.track.clone(),
            sound,
            show_rays,
        })
    }

    fn read_input(&self) -> FrameInput {
        let held: HeldKeys = KEY_MAP
            .iter()
            .filter(|(k, _)| self.window.is_key_down(*k))
            .map(|&(_, key)| key)
            .collect();
        let pressed: HeldKeys = KEY_MAP
            .iter()
            .filter(|(k, _)| self.window.is_key_pressed(*k, KeyRepeat::No))
            .map(|&(_, key)| key)
            .collect();
        FrameInput {
            held,
            pressed,
            close_requested: !self.window.is_open(),
        }
    }

    /// Drive `app` until it asks to close.
    pub fn run(&mut self, app: &mut App) -> Result<()> {
        loop {
            let input = self.read_input();
            if !app.frame(&input)? {
                break;
            }

            let cues = app.drain_cues();
            if let Some(player) = self.sound.as_mut() {
                for cue in cues {
                    player.play(cue);
                }
                player.frame();
            }

            match app.race() {
                Some(race) => draw_race(&mut self.canvas, race, self.show_rays),
                None => self.canvas.fill_from(&self.backdrop, 0.35),
            }
            self.window.set_title(&app.status());
            self.window
                .update_with_buffer(self.canvas.pixels(), self.canvas.width, self.canvas.height)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn blend_respects_alpha_and_clips() {
        let mut canvas = Canvas::new(4, 4);
        let mut img = RgbaImage::new(2, 2);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([0, 255, 0, 0]));
        img.put_pixel(0, 1, Rgba([0, 0, 255, 255]));
        canvas.blend(&img, IVec2::new(3, -1));
        canvas.blend(&img, IVec2::new(0, 0));
        assert_eq!(canvas.pixel(0, 0), 0x00ff_0000);
        assert_eq!(canvas.pixel(1, 0), 0);
        assert_eq!(canvas.pixel(0, 1), 0x0000_00ff);
        // Only the bottom-left pixel of the clipped copy lands on the canvas.
        assert_eq!(canvas.pixel(3, 0), 0x0000_00ff);
    }

    #[test]
    fn line_covers_both_endpoints() {
        let mut canvas = Canvas::new(8, 8);
        canvas.line(Vec2::new(1.0, 1.0), Vec2::new(6.0, 4.0), 7);
        assert_eq!(canvas.pixel(1, 1), 7);
        assert_eq!(canvas.pixel(6, 4), 7);
        assert_eq!(canvas.pixels().iter().filter(|&&p| p == 7).count(), 6);
    }
}
