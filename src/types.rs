use std::time::Instant;

/// A captured camera frame in RGBA8 layout.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            rgba,
            width,
            height,
            sequence,
            timestamp: Instant::now(),
        }
    }

    pub fn expected_len(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(4)
    }
}

/// Point in normalized image coordinates, both axes in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Unfiltered model output for a single box.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub top_left: Point,
    pub bottom_right: Point,
}

impl RawDetection {
    pub fn area(&self) -> f32 {
        (self.bottom_right.y - self.top_left.y) * (self.bottom_right.x - self.top_left.x)
    }
}

/// Render-ready detection after duplicate suppression.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub color: Color,
    pub top_left: Point,
    pub bottom_right: Point,
}

impl Detection {
    pub fn display_text(&self) -> String {
        format!("{} [{:.2}%]", self.label, self.confidence * 100.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Hue in degrees, saturation and brightness in `[0, 1]`.
    pub fn from_hsb(hue: f32, saturation: f32, brightness: f32) -> Self {
        let h = hue.rem_euclid(360.0) / 60.0;
        let c = brightness * saturation;
        let x = c * (1.0 - (h % 2.0 - 1.0).abs());
        let m = brightness - c;
        let (r, g, b) = match h as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        Self::rgb(to_u8(r), to_u8(g), to_u8(b))
    }

    /// Stable color for a class label, identical across frames and models.
    pub fn for_label(label: &str) -> Self {
        // FNV-1a keeps the mapping independent of the hasher's random seed.
        let mut hash: u32 = 0x811c_9dc5;
        for byte in label.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let bucket = hash % 18;
        Self::from_hsb(((bucket + 1) * 20) as f32, 0.5, 1.0)
    }

    pub fn to_rgba(self) -> [u8; 4] {
        [self.r, self.g, self.b, 255]
    }
}
