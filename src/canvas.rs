//! Stroke capture and rasterization for the practice canvas.
//!
//! Coordinates are stored in CSS pixels. The raster is produced at device
//! resolution (`css * device_pixel_ratio`), on an opaque white background,
//! with the optional 米字格 guide grid drawn underneath the strokes.

use std::io::Cursor;

use base64::Engine;
use image::{ImageFormat, Rgba, RgbaImage};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);
const INK: Rgba<u8> = Rgba([0, 0, 0, 255]);
/// rgba(255, 0, 0, 0.2)
const GRID: Rgba<u8> = Rgba([255, 0, 0, 51]);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// The element's bounding rectangle in client coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Largest raster edge an export will allocate, in device pixels.
pub const MAX_RASTER_EDGE: u32 = 4096;
const MAX_DPR: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SurfaceFile")]
pub struct Surface {
    /// Container size in CSS pixels.
    pub width: u32,
    pub height: u32,
    pub device_pixel_ratio: f32,
}

/// Unchecked form of `Surface` as it appears in stroke files.
#[derive(Deserialize)]
struct SurfaceFile {
    width: u32,
    height: u32,
    #[serde(default = "default_dpr")]
    device_pixel_ratio: f32,
}

fn default_dpr() -> f32 {
    1.0
}

impl TryFrom<SurfaceFile> for Surface {
    type Error = String;

    fn try_from(file: SurfaceFile) -> std::result::Result<Self, Self::Error> {
        let dpr = file.device_pixel_ratio;
        if !dpr.is_finite() || dpr <= 0.0 || dpr > MAX_DPR {
            return Err(format!("device_pixel_ratio must be in (0, {}], got {}", MAX_DPR, dpr));
        }
        let surface = Surface {
            width: file.width,
            height: file.height,
            device_pixel_ratio: dpr,
        };
        let (w, h) = surface.raster_size();
        if file.width == 0 || file.height == 0 || w > MAX_RASTER_EDGE || h > MAX_RASTER_EDGE {
            return Err(format!(
                "surface {}x{} at {}x must be non-empty and at most {} device pixels per side",
                file.width, file.height, dpr, MAX_RASTER_EDGE
            ));
        }
        Ok(surface)
    }
}

impl Surface {
    pub fn new(width: u32, height: u32, device_pixel_ratio: f32) -> Self {
        Self {
            width,
            height,
            device_pixel_ratio: if device_pixel_ratio > 0.0 {
                device_pixel_ratio
            } else {
                1.0
            },
        }
    }

    pub fn raster_size(&self) -> (u32, u32) {
        let w = (self.width as f32 * self.device_pixel_ratio).round().max(1.0) as u32;
        let h = (self.height as f32 * self.device_pixel_ratio).round().max(1.0) as u32;
        (w, h)
    }

    /// Map a pointer or touch position into surface (CSS pixel) space,
    /// accounting for any CSS scaling of the element and the DPR.
    pub fn to_surface(&self, client_x: f32, client_y: f32, rect: ClientRect) -> Point {
        let (raster_w, raster_h) = self.raster_size();
        let scale_x = if rect.width > 0.0 { raster_w as f32 / rect.width } else { 1.0 };
        let scale_y = if rect.height > 0.0 { raster_h as f32 / rect.height } else { 1.0 };
        let x = client_x - rect.left;
        let y = client_y - rect.top;
        Point::new(
            x * scale_x / self.device_pixel_ratio,
            y * scale_y / self.device_pixel_ratio,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportOptions {
    pub grid: bool,
    /// Stroke width in CSS pixels.
    pub line_width: f32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            grid: true,
            line_width: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeSession {
    pub surface: Surface,
    #[serde(default)]
    pub strokes: Vec<Vec<Point>>,
    #[serde(skip)]
    drawing: bool,
}

impl StrokeSession {
    pub fn new(surface: Surface) -> Self {
        Self {
            surface,
            strokes: Vec::new(),
            drawing: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RelayError::bad_request(format!("Invalid stroke file: {}", e)))
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.iter().all(|s| s.is_empty())
    }

    pub fn begin_stroke(&mut self, p: Point) {
        self.strokes.push(vec![p]);
        self.drawing = true;
    }

    pub fn extend_stroke(&mut self, p: Point) {
        if !self.drawing {
            return;
        }
        if let Some(stroke) = self.strokes.last_mut() {
            stroke.push(p);
        }
    }

    pub fn end_stroke(&mut self) {
        self.drawing = false;
    }

    /// Resets the drawing surface only.
    pub fn clear(&mut self) {
        self.strokes.clear();
        self.drawing = false;
    }

    pub fn export(&self, options: &ExportOptions) -> RgbaImage {
        let (w, h) = self.surface.raster_size();
        let dpr = self.surface.device_pixel_ratio;
        let mut img = RgbaImage::from_pixel(w, h, BACKGROUND);

        if options.grid {
            draw_grid(&mut img);
        }

        let radius = (options.line_width * dpr / 2.0).max(0.5);
        for stroke in &self.strokes {
            let mut points = stroke.iter().map(|p| (p.x * dpr, p.y * dpr));
            let Some(mut prev) = points.next() else {
                continue;
            };
            stamp_disc(&mut img, prev, radius, INK);
            for next in points {
                draw_segment(&mut img, prev, next, radius);
                prev = next;
            }
        }

        debug!("Exported {} strokes at {}x{}", self.strokes.len(), w, h);
        img
    }

    pub fn export_png(&self, options: &ExportOptions) -> Result<Vec<u8>> {
        encode_png(&self.export(options))
    }

    pub fn export_data_url(&self, options: &ExportOptions) -> Result<String> {
        let png = self.export_png(options)?;
        let encoded = base64::prelude::BASE64_STANDARD.encode(&png);
        info!("Canvas encoded as data URL, size: {} bytes", encoded.len());
        Ok(format!("data:image/png;base64,{}", encoded))
    }
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut png_buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_buffer), ImageFormat::Png)
        .map_err(|e| RelayError::bad_request(format!("Failed to encode PNG: {}", e)))?;
    Ok(png_buffer)
}

/// Centre cross plus both diagonals, 1px.
fn draw_grid(img: &mut RgbaImage) {
    let w = img.width() as f32;
    let h = img.height() as f32;
    let lines = [
        ((w / 2.0, 0.0), (w / 2.0, h)),
        ((0.0, h / 2.0), (w, h / 2.0)),
        ((0.0, 0.0), (w, h)),
        ((w, 0.0), (0.0, h)),
    ];
    for (start, end) in lines {
        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        let steps = dx.abs().max(dy.abs()).ceil() as u32;
        let mut last = None;
        for i in 0..=steps {
            let t = i as f32 / steps.max(1) as f32;
            let x = (start.0 + dx * t).floor();
            let y = (start.1 + dy * t).floor();
            if x < 0.0 || y < 0.0 || x >= w || y >= h {
                continue;
            }
            let px = (x as u32, y as u32);
            if last == Some(px) {
                continue;
            }
            last = Some(px);
            blend(img, px.0, px.1, GRID);
        }
    }
}

/// Dense sub-pixel stepping with a disc stamp at each step gives round caps
/// and joins.
fn draw_segment(img: &mut RgbaImage, from: (f32, f32), to: (f32, f32), radius: f32) {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    let distance = (dx * dx + dy * dy).sqrt();
    if distance < 0.1 {
        stamp_disc(img, to, radius, INK);
        return;
    }
    let spacing = (radius * 0.5).max(0.25);
    let steps = (distance / spacing).ceil() as u32;
    for i in 1..=steps {
        let t = i as f32 / steps as f32;
        stamp_disc(img, (from.0 + dx * t, from.1 + dy * t), radius, INK);
    }
}

fn stamp_disc(img: &mut RgbaImage, center: (f32, f32), radius: f32, color: Rgba<u8>) {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let min_x = ((center.0 - radius).floor() as i64).max(0);
    let max_x = ((center.0 + radius).ceil() as i64).min(w - 1);
    let min_y = ((center.1 - radius).floor() as i64).max(0);
    let max_y = ((center.1 + radius).ceil() as i64).min(h - 1);
    let r2 = radius * radius;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let px = x as f32 + 0.5 - center.0;
            let py = y as f32 + 0.5 - center.1;
            if px * px + py * py <= r2 {
                img.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

fn blend(img: &mut RgbaImage, x: u32, y: u32, color: Rgba<u8>) {
    let alpha = color.0[3] as f32 / 255.0;
    let dst = img.get_pixel_mut(x, y);
    for c in 0..3 {
        let mixed = color.0[c] as f32 * alpha + dst.0[c] as f32 * (1.0 - alpha);
        dst.0[c] = mixed.round() as u8;
    }
    dst.0[3] = 255;
}
