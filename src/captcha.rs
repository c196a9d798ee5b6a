use std::collections::HashSet;
use std::io::Cursor;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use image::{ImageFormat, Rgba, RgbaImage};
use rand::Rng;

pub const CAPTCHA_TTL_SECS: u64 = 60;

const CANVAS_WIDTH: u32 = 100;
const CANVAS_HEIGHT: u32 = 37;
const WARP_PERIOD: f64 = 7.4;

/// Rendered captcha plus its concealment mask, both base64 PNGs.
#[derive(Clone)]
pub struct CaptchaEntry {
    pub captcha_b64: String,
    pub mask_b64: String,
    pub expires_at: u64,
}

/// TTL-bounded store of rendered captchas keyed by the secret part of
/// the token. Expired entries are dropped on the next access.
#[derive(Default)]
pub struct CaptchaCache {
    imgs: DashMap<String, CaptchaEntry>,
}

impl CaptchaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch(&self, secret_part: &str, now: u64) -> Option<(String, String)> {
        let entry = self.imgs.get(secret_part)?;
        if now > entry.expires_at {
            drop(entry);
            self.imgs.remove(secret_part);
            return None;
        }
        Some((entry.captcha_b64.clone(), entry.mask_b64.clone()))
    }

    pub fn insert(&self, secret_part: String, captcha_b64: String, mask_b64: String, now: u64) {
        self.imgs.insert(
            secret_part,
            CaptchaEntry {
                captcha_b64,
                mask_b64,
                expires_at: now + CAPTCHA_TTL_SECS,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.imgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imgs.is_empty()
    }
}

/// Render the captcha pair for a token split. The answer the client
/// must read off the image is `secret_part`; the two public labels
/// are decoys drawn from the public remainder of the token.
pub fn render(secret_part: &str, public_part: &str) -> anyhow::Result<(String, String)> {
    let mut rng = rand::thread_rng();

    let mut canvas = RgbaImage::new(CANVAS_WIDTH, CANVAS_HEIGHT);

    let decoy_tail = if public_part.len() > 6 { &public_part[6..] } else { "" };
    let decoy_head = &public_part[..public_part.len().min(6)];

    add_label(&mut canvas, 0, 18, decoy_tail, Rgba([61, 140, 64, 20]));
    let random_channel: u8 = rng.gen_range(0..255);
    add_label(
        &mut canvas,
        rng.gen_range(0..90),
        rng.gen_range(0..30),
        decoy_head,
        Rgba([255, random_channel, random_channel, 100]),
    );
    add_label(
        &mut canvas,
        rng.gen_range(0..25),
        rng.gen_range(0..20) + 10,
        secret_part,
        Rgba([61, 140, 64, 255]),
    );

    let amplitude = f64::from(rng.gen_range(10u32..20)) / 10.0;
    let warped = warp(&canvas, amplitude, WARP_PERIOD);

    let mut captcha = warped;
    let mut mask = RgbaImage::new(CANVAS_WIDTH, CANVAS_HEIGHT);

    // Concealment triangles: each pixel the triangles touch is
    // brightened in the captcha, and the exact addend is recorded in
    // the mask so client-side subtraction restores the original.
    // Already-covered pixels are skipped; stacking addends would make
    // the captcha unsolvable.
    let random_shift = rng.gen_range(0..50) - 25;
    let num_triangles = rng.gen_range(0..20) + 10;
    let mut covered: HashSet<(u32, u32)> = HashSet::new();

    for _ in 0..num_triangles {
        let size = rng.gen_range(0..5) + 10;
        let x = rng.gen_range(0..CANVAS_WIDTH - size);
        let y = rng.gen_range(0..CANVAS_HEIGHT - size);
        draw_triangle(&mut covered, &mut captcha, &mut mask, x, y, size, random_shift);
    }

    Ok((encode_png(&captcha)?, encode_png(&mask)?))
}

fn encode_png(img: &RgbaImage) -> anyhow::Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("encoding captcha png")?;
    Ok(STANDARD.encode(bytes))
}

/// 5x7 bitmap face for the hex alphabet. Tokens are hex strings, so
/// sixteen glyphs cover every label.
const GLYPH_WIDTH: i64 = 5;
const GLYPH_HEIGHT: i64 = 7;
const GLYPH_ADVANCE: i64 = 6;

#[rustfmt::skip]
fn glyph(c: char) -> Option<[u8; 7]> {
    Some(match c {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        'a' => [0b00000, 0b00000, 0b01110, 0b00001, 0b01111, 0b10001, 0b01111],
        'b' => [0b10000, 0b10000, 0b10110, 0b11001, 0b10001, 0b10001, 0b11110],
        'c' => [0b00000, 0b00000, 0b01110, 0b10000, 0b10000, 0b10001, 0b01110],
        'd' => [0b00001, 0b00001, 0b01101, 0b10011, 0b10001, 0b10001, 0b01111],
        'e' => [0b00000, 0b00000, 0b01110, 0b10001, 0b11111, 0b10000, 0b01110],
        'f' => [0b00110, 0b01001, 0b01000, 0b11100, 0b01000, 0b01000, 0b01000],
        _ => return None,
    })
}

/// Draw `text` with its baseline at `y`, alpha-blending over the
/// canvas. Glyphs running past the canvas edge are clipped.
fn add_label(img: &mut RgbaImage, x: i64, y: i64, text: &str, color: Rgba<u8>) {
    let mut pen_x = x;
    for c in text.chars() {
        if let Some(rows) = glyph(c) {
            for (row_idx, row) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if row & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                        continue;
                    }
                    let px = pen_x + col;
                    let py = y - GLYPH_HEIGHT + row_idx as i64;
                    if px < 0 || py < 0 || px >= i64::from(CANVAS_WIDTH) || py >= i64::from(CANVAS_HEIGHT) {
                        continue;
                    }
                    blend_pixel(img, px as u32, py as u32, color);
                }
            }
        }
        pen_x += GLYPH_ADVANCE;
    }
}

fn blend_pixel(img: &mut RgbaImage, x: u32, y: u32, src: Rgba<u8>) {
    let dst = img.get_pixel(x, y);
    let alpha = f32::from(src.0[3]) / 255.0;
    let inv = 1.0 - alpha;
    let blend =
        |s: u8, d: u8| -> u8 { (f32::from(s) * alpha + f32::from(d) * inv).round() as u8 };
    let out = Rgba([
        blend(src.0[0], dst.0[0]),
        blend(src.0[1], dst.0[1]),
        blend(src.0[2], dst.0[2]),
        src.0[3].saturating_add(((f32::from(dst.0[3]) * inv).round()) as u8),
    ]);
    img.put_pixel(x, y, out);
}

/// Per-pixel sine displacement: each destination pixel samples the
/// source at `(x + A*sin(y/P), y + A*sin(x/P))`.
fn warp(img: &RgbaImage, amplitude: f64, period: f64) -> RgbaImage {
    let mut out = RgbaImage::new(img.width(), img.height());
    for y in 0..img.height() {
        for x in 0..img.width() {
            let dx = amplitude * (f64::from(y) / period).sin();
            let dy = amplitude * (f64::from(x) / period).sin();
            let sx = f64::from(x) + dx;
            let sy = f64::from(y) + dy;
            if sx >= 0.0 && sy >= 0.0 && sx < f64::from(img.width()) && sy < f64::from(img.height())
            {
                out.put_pixel(x, y, *img.get_pixel(sx as u32, sy as u32));
            }
        }
    }
    out
}

/// Upward-pointing filled triangle with its base at `y + size`. Every
/// pixel it claims gets the same addend in the captcha and the mask.
fn draw_triangle(
    covered: &mut HashSet<(u32, u32)>,
    captcha: &mut RgbaImage,
    mask: &mut RgbaImage,
    x: u32,
    y: u32,
    size: u32,
    shift: i32,
) {
    let addend = (128 + shift).clamp(0, 255) as u8;
    for row in 0..=size {
        let half = row / 2;
        let center = x + size / 2;
        let start = center.saturating_sub(half);
        let end = (center + half).min(captcha.width() - 1);
        let py = y + row;
        if py >= captcha.height() {
            break;
        }
        for px in start..=end {
            if !covered.insert((px, py)) {
                continue;
            }
            let pixel = captcha.get_pixel(px, py);
            captcha.put_pixel(
                px,
                py,
                Rgba([
                    pixel.0[0].saturating_add(addend),
                    pixel.0[1].saturating_add(addend),
                    pixel.0[2].saturating_add(addend),
                    255,
                ]),
            );
            mask.put_pixel(px, py, Rgba([addend, addend, addend, 255]));
        }
    }
}
