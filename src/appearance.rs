use std::collections::BTreeMap;
use std::ops::Range;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::Appearance;

pub const SKIN_TONE_CODES: std::ops::RangeInclusive<u8> = 1..=10;
/// Medium tone, used whenever the photo cannot be classified.
pub const SKIN_TONE_FALLBACK: u8 = 5;
pub const HAIR_COLOR_FALLBACK: u8 = 0;
pub const STYLE_FALLBACK: u8 = 0;
pub const MIN_MASKED_PIXELS: usize = 40;
pub const BUILTIN_PALETTE_VERSION: &str = "2024.1";

// Chroma box for skin, in full-range BT.601 YCbCr.
const SKIN_CR: (f64, f64) = (133.0, 173.0);
const SKIN_CB: (f64, f64) = (77.0, 127.0);
const MIN_ALPHA: u8 = 128;
const BACKGROUND_DARK_LUMA: f64 = 15.0;
const BACKGROUND_BRIGHT_LUMA: f64 = 235.0;

/// Fractional crop `(x0, x1, y0, y1)` of the image.
type Region = (f64, f64, f64, f64);
const FACE_REGION: Region = (0.25, 0.75, 0.20, 0.70);
const HAIR_REGION: Region = (0.25, 0.75, 0.0, 0.25);

// Style detection bands, as fractions of the image height.
const HAIR_STYLE_BAND: f64 = 0.35;
const CHIN_START: f64 = 0.55;
const FOREHEAD_BAND: (f64, f64) = (0.10, 0.30);
const EYE_BAND: (f64, f64) = (0.35, 0.45);

// Luma step between neighbouring masked pixels that counts as an edge.
const HAIR_EDGE_STEP: f64 = 40.0;
const BEARD_EDGE_STEP: f64 = 20.0;
const HAIR_TEXTURE_SATURATION: f64 = 0.3;
const MIN_CHIN_SKIN_PIXELS: usize = 100;
const MIN_BEARD_LUMA: f64 = 60.0;

const BAND_ROW_STD: f64 = 12.0;
const MIN_BAND_ROWS: usize = 8;
const MIN_BAND_OFFSET: usize = 6;
const SHADE_ROW_MEAN: f64 = 40.0;
const SHADE_ROW_STD: f64 = 20.0;
const MIN_SHADE_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ycc {
    pub y: f64,
    pub cb: f64,
    pub cr: f64,
}

impl Ycc {
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        let (r, g, b) = (r as f64, g as f64, b as f64);
        Self {
            y: 0.299 * r + 0.587 * g + 0.114 * b,
            cb: 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b,
            cr: 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b,
        }
    }

    fn distance_sq(&self, other: &Ycc) -> f64 {
        let dy = self.y - other.y;
        let dcb = self.cb - other.cb;
        let dcr = self.cr - other.cr;
        dy * dy + dcb * dcb + dcr * dcr
    }

    fn is_skin(&self) -> bool {
        (SKIN_CR.0..=SKIN_CR.1).contains(&self.cr) && (SKIN_CB.0..=SKIN_CB.1).contains(&self.cb)
    }

    fn is_background(&self) -> bool {
        self.y < BACKGROUND_DARK_LUMA || self.y > BACKGROUND_BRIGHT_LUMA
    }

    fn is_hair(&self) -> bool {
        !self.is_skin() && !self.is_background()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub code: u8,
    pub label: String,
    pub color: Ycc,
}

impl PaletteEntry {
    fn new(code: u8, label: &str, y: f64, cb: f64, cr: f64) -> Self {
        Self {
            code,
            label: label.to_string(),
            color: Ycc { y, cb, cr },
        }
    }
}

/// Ordered reference points; order decides ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    pub entries: Vec<PaletteEntry>,
}

impl Palette {
    /// Code of the closest entry, lowest index on ties.
    pub fn nearest(&self, color: &Ycc) -> Option<u8> {
        let mut best: Option<(f64, u8)> = None;
        for entry in &self.entries {
            let d = entry.color.distance_sq(color);
            if best.is_none_or(|(best_d, _)| d < best_d) {
                best = Some((d, entry.code));
            }
        }
        best.map(|(_, code)| code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HairVolume {
    None,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl HairVolume {
    fn from_coverage(coverage: f64) -> Self {
        match coverage {
            c if c < 0.03 => Self::None,
            c if c < 0.10 => Self::Low,
            c if c < 0.20 => Self::Medium,
            c if c < 0.35 => Self::High,
            _ => Self::VeryHigh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HairTexture {
    Smooth,
    Wavy,
    Curly,
    Afro,
    Dreads,
}

impl HairTexture {
    fn from_score(score: f64, coverage: f64) -> Self {
        if coverage < 0.05 {
            return Self::Smooth;
        }
        match score {
            s if s < 0.2 => Self::Smooth,
            s if s < 0.4 => Self::Wavy,
            s if s < 0.6 => Self::Curly,
            s if s < 0.8 => Self::Afro,
            _ => Self::Dreads,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacialHair {
    None,
    Stubble,
    Goatee,
    Beard,
    FullBeard,
}

impl FacialHair {
    fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.01 => Self::None,
            s if s < 0.03 => Self::Stubble,
            s if s < 0.06 => Self::Goatee,
            s if s < 0.10 => Self::Beard,
            _ => Self::FullBeard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accessory {
    None,
    BlackHeadband,
    TwoToneHeadband,
    WhiteHeadband,
    Sunglasses,
}

/// Game style indices per detected category. A texture code, when present,
/// wins over the volume code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleCodes {
    pub hair_volume: BTreeMap<HairVolume, u8>,
    pub hair_texture: BTreeMap<HairTexture, u8>,
    pub facial_hair: BTreeMap<FacialHair, u8>,
    pub accessory: BTreeMap<Accessory, u8>,
}

impl StyleCodes {
    pub fn builtin() -> Self {
        Self {
            hair_volume: BTreeMap::from([
                (HairVolume::None, 0),
                (HairVolume::Low, 1),
                (HairVolume::Medium, 2),
                (HairVolume::High, 17),
                (HairVolume::VeryHigh, 82),
            ]),
            hair_texture: BTreeMap::from([
                (HairTexture::Curly, 2),
                (HairTexture::Afro, 10),
                (HairTexture::Dreads, 19),
            ]),
            facial_hair: BTreeMap::from([
                (FacialHair::None, 0),
                (FacialHair::Stubble, 1),
                (FacialHair::Goatee, 2),
                (FacialHair::Beard, 3),
                (FacialHair::FullBeard, 4),
            ]),
            accessory: BTreeMap::from([
                (Accessory::None, 0),
                (Accessory::BlackHeadband, 1),
                (Accessory::TwoToneHeadband, 2),
                (Accessory::WhiteHeadband, 4),
                (Accessory::Sunglasses, 6),
            ]),
        }
    }

    pub fn hair(&self, volume: HairVolume, texture: HairTexture) -> u8 {
        self.hair_texture
            .get(&texture)
            .or_else(|| self.hair_volume.get(&volume))
            .copied()
            .unwrap_or(STYLE_FALLBACK)
    }

    pub fn facial(&self, density: FacialHair) -> u8 {
        self.facial_hair
            .get(&density)
            .copied()
            .unwrap_or(STYLE_FALLBACK)
    }

    pub fn accessory(&self, kind: Accessory) -> u8 {
        self.accessory.get(&kind).copied().unwrap_or(STYLE_FALLBACK)
    }
}

impl Default for StyleCodes {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppearancePalettes {
    pub version: String,
    pub skin: Palette,
    pub hair: Palette,
    #[serde(default)]
    pub styles: StyleCodes,
}

impl AppearancePalettes {
    pub fn builtin() -> Self {
        Self {
            version: BUILTIN_PALETTE_VERSION.to_string(),
            skin: Palette {
                entries: vec![
                    PaletteEntry::new(1, "porcelain", 230.1, 108.8, 145.8),
                    PaletteEntry::new(2, "fair", 205.0, 106.6, 153.7),
                    PaletteEntry::new(3, "light", 183.7, 102.2, 156.8),
                    PaletteEntry::new(4, "light medium", 165.6, 98.9, 159.7),
                    PaletteEntry::new(5, "medium", 148.6, 97.2, 163.3),
                    PaletteEntry::new(6, "tan", 125.4, 97.9, 161.3),
                    PaletteEntry::new(7, "brown", 98.4, 104.1, 158.4),
                    PaletteEntry::new(8, "dark brown", 79.0, 108.2, 153.0),
                    PaletteEntry::new(9, "deep", 60.7, 112.9, 147.5),
                    PaletteEntry::new(10, "darkest", 42.0, 119.0, 140.8),
                ],
            },
            hair: Palette {
                entries: vec![
                    PaletteEntry::new(1, "black", 22.7, 126.5, 129.7),
                    PaletteEntry::new(2, "dark brown", 44.8, 119.6, 138.8),
                    PaletteEntry::new(3, "brown", 82.6, 109.6, 147.5),
                    PaletteEntry::new(4, "blond", 172.1, 92.9, 147.9),
                    PaletteEntry::new(5, "red", 90.5, 99.5, 170.4),
                    PaletteEntry::new(6, "gray", 170.0, 128.0, 128.0),
                ],
            },
            styles: StyleCodes::builtin(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.version.trim().is_empty() {
            return Err("palette version is empty".to_string());
        }
        if self.skin.entries.is_empty() {
            return Err("skin palette is empty".to_string());
        }
        if let Some(bad) = self
            .skin
            .entries
            .iter()
            .find(|e| !SKIN_TONE_CODES.contains(&e.code))
        {
            return Err(format!("skin code {} outside {:?}", bad.code, SKIN_TONE_CODES));
        }
        if let Some(bad) = self
            .hair
            .entries
            .iter()
            .find(|e| e.code == HAIR_COLOR_FALLBACK)
        {
            return Err(format!("hair entry {:?} uses the fallback code", bad.label));
        }
        Ok(())
    }

    pub fn fallback(&self) -> Appearance {
        Appearance {
            skin_tone_code: SKIN_TONE_FALLBACK,
            hair_color_code: HAIR_COLOR_FALLBACK,
            hair_style_code: STYLE_FALLBACK,
            facial_hair_code: STYLE_FALLBACK,
            accessory_code: STYLE_FALLBACK,
            palette_version: self.version.clone(),
        }
    }
}

/// Best-effort classification of a headshot. Missing or undecodable images
/// get the fallback; this never fails.
pub fn classify(image: Option<&[u8]>, palettes: &AppearancePalettes) -> Appearance {
    let Some(bytes) = image.filter(|b| !b.is_empty()) else {
        return palettes.fallback();
    };
    match image::load_from_memory(bytes) {
        Ok(decoded) => classify_image(&decoded.to_rgba8(), palettes),
        Err(err) => {
            debug!(error = %err, "headshot could not be decoded");
            palettes.fallback()
        }
    }
}

pub fn classify_image(img: &RgbaImage, palettes: &AppearancePalettes) -> Appearance {
    let mut out = palettes.fallback();
    if img.width() == 0 || img.height() == 0 {
        return out;
    }
    let plane = Plane::new(img);

    match plane.region_mean(FACE_REGION, Ycc::is_skin) {
        Some(mean) => {
            out.skin_tone_code = palettes.skin.nearest(&mean).unwrap_or(SKIN_TONE_FALLBACK);
        }
        None => {
            debug!("too few skin pixels in face region");
            return out;
        }
    }
    if let Some(mean) = plane.region_mean(HAIR_REGION, Ycc::is_hair) {
        out.hair_color_code = palettes.hair.nearest(&mean).unwrap_or(HAIR_COLOR_FALLBACK);
    }

    let styles = &palettes.styles;
    let (volume, texture) = hair_style(&plane);
    out.hair_style_code = styles.hair(volume, texture);
    out.facial_hair_code = styles.facial(facial_hair(&plane));
    out.accessory_code = styles.accessory(accessory(&plane));
    out
}

/// Opaque pixels in YCbCr, row-major; `None` marks a transparent pixel.
struct Plane {
    width: u32,
    height: u32,
    pixels: Vec<Option<Ycc>>,
}

impl Plane {
    fn new(img: &RgbaImage) -> Self {
        let pixels = img
            .pixels()
            .map(|&Rgba([r, g, b, a])| (a >= MIN_ALPHA).then(|| Ycc::from_rgb(r, g, b)))
            .collect();
        Self {
            width: img.width(),
            height: img.height(),
            pixels,
        }
    }

    fn at(&self, x: u32, y: u32) -> Option<&Ycc> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels[(y as usize) * (self.width as usize) + x as usize].as_ref()
    }

    fn rows(&self, from: f64, to: f64) -> Range<u32> {
        let (start, end) = span(self.height, from, to);
        start..end
    }

    fn region_mean(&self, region: Region, keep: impl Fn(&Ycc) -> bool) -> Option<Ycc> {
        let (x0, x1) = span(self.width, region.0, region.1);
        let mut n = 0usize;
        let mut sum = Ycc {
            y: 0.0,
            cb: 0.0,
            cr: 0.0,
        };
        for y in self.rows(region.2, region.3) {
            for x in x0..x1 {
                let Some(c) = self.at(x, y).filter(|c| keep(c)) else {
                    continue;
                };
                sum.y += c.y;
                sum.cb += c.cb;
                sum.cr += c.cr;
                n += 1;
            }
        }

        if n < MIN_MASKED_PIXELS {
            return None;
        }
        let n = n as f64;
        Some(Ycc {
            y: sum.y / n,
            cb: sum.cb / n,
            cr: sum.cr / n,
        })
    }

    /// `(masked, edges)` over full-width `rows`. A masked pixel is an edge when
    /// a masked right or lower neighbour differs from it by more than `step`
    /// in luma, so mask outlines never count.
    fn edge_density(
        &self,
        rows: Range<u32>,
        keep: impl Fn(&Ycc) -> bool,
        step: f64,
    ) -> (usize, usize) {
        let mut masked = 0;
        let mut edges = 0;
        for y in rows.clone() {
            for x in 0..self.width {
                let Some(c) = self.at(x, y).filter(|c| keep(c)) else {
                    continue;
                };
                masked += 1;
                let right = self.at(x + 1, y).filter(|n| keep(n));
                let below = self.at(x, y + 1).filter(|n| keep(n) && y + 1 < rows.end);
                let gradient = right.map_or(0.0, |n| (n.y - c.y).abs())
                    + below.map_or(0.0, |n| (n.y - c.y).abs());
                if gradient > step {
                    edges += 1;
                }
            }
        }
        (masked, edges)
    }

    /// Mean and standard deviation of luma across row `y`, or `None` when
    /// most of the row is transparent.
    fn row_stats(&self, y: u32) -> Option<(f64, f64)> {
        let lumas = (0..self.width)
            .filter_map(|x| self.at(x, y).map(|c| c.y))
            .collect::<Vec<_>>();
        if lumas.len() * 2 < self.width as usize {
            return None;
        }
        let n = lumas.len() as f64;
        let mean = lumas.iter().sum::<f64>() / n;
        let var = lumas.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Some((mean, var.sqrt()))
    }
}

/// Hair volume from coverage of the top band relative to the head width, and
/// texture from edge density inside the hair mask.
fn hair_style(plane: &Plane) -> (HairVolume, HairTexture) {
    let band = plane.rows(0.0, HAIR_STYLE_BAND);
    let (hair_pixels, edges) = plane.edge_density(band.clone(), Ycc::is_hair, HAIR_EDGE_STEP);

    let skin_columns = (0..plane.width)
        .filter(|&x| (0..plane.height).any(|y| plane.at(x, y).is_some_and(Ycc::is_skin)))
        .count();
    let head_width = if (skin_columns as f64) < plane.width as f64 * 0.3 {
        (plane.width as f64 * 0.6) as usize
    } else {
        skin_columns
    };
    let head_area = band.len() * head_width;
    let coverage = if head_area == 0 {
        0.0
    } else {
        hair_pixels as f64 / head_area as f64
    };
    let texture = if hair_pixels == 0 {
        0.0
    } else {
        (edges as f64 / hair_pixels as f64 / HAIR_TEXTURE_SATURATION).min(1.0)
    };
    (
        HairVolume::from_coverage(coverage),
        HairTexture::from_score(texture, coverage),
    )
}

/// Dark, textured patches inside the skin mask below the mouth.
fn facial_hair(plane: &Plane) -> FacialHair {
    let chin = plane.rows(CHIN_START, 1.0);
    let (skin, edges) = plane.edge_density(chin.clone(), Ycc::is_skin, BEARD_EDGE_STEP);
    if skin < MIN_CHIN_SKIN_PIXELS {
        return FacialHair::None;
    }

    let lumas = chin
        .flat_map(|y| (0..plane.width).map(move |x| (x, y)))
        .filter_map(|(x, y)| plane.at(x, y).filter(|c| c.is_skin()).map(|c| c.y))
        .collect::<Vec<_>>();
    let mean = lumas.iter().sum::<f64>() / lumas.len() as f64;
    let threshold = MIN_BEARD_LUMA.max(mean * 0.5);
    let dark = lumas.iter().filter(|&&y| y < threshold).count();

    let skin = skin as f64;
    FacialHair::from_score(dark as f64 / skin * 0.4 + edges as f64 / skin * 0.6)
}

/// Headbands show as a run of uniform rows across the forehead; sunglasses
/// as several dark uniform rows at eye level.
fn accessory(plane: &Plane) -> Accessory {
    let forehead = plane.rows(FOREHEAD_BAND.0, FOREHEAD_BAND.1);
    // (offset into the forehead band, rows, summed row means)
    let mut best: Option<(usize, usize, f64)> = None;
    let mut run: Option<(usize, usize, f64)> = None;
    for (offset, y) in forehead.enumerate() {
        match plane.row_stats(y).filter(|(_, std)| *std < BAND_ROW_STD) {
            Some((mean, _)) => {
                let (start, len, sum) = run.unwrap_or((offset, 0, 0.0));
                run = Some((start, len + 1, sum + mean));
            }
            None => run = None,
        }
        if let Some(current) = run
            && best.is_none_or(|b| current.1 > b.1)
        {
            best = Some(current);
        }
    }
    if let Some((start, len, sum)) = best
        && len >= MIN_BAND_ROWS
        && start >= MIN_BAND_OFFSET
    {
        let brightness = sum / len as f64;
        return if brightness < 60.0 {
            Accessory::BlackHeadband
        } else if brightness > 180.0 {
            Accessory::WhiteHeadband
        } else {
            Accessory::TwoToneHeadband
        };
    }

    let shaded = plane
        .rows(EYE_BAND.0, EYE_BAND.1)
        .filter_map(|y| plane.row_stats(y))
        .filter(|(mean, std)| *mean < SHADE_ROW_MEAN && *std < SHADE_ROW_STD)
        .count();
    if shaded >= MIN_SHADE_ROWS {
        return Accessory::Sunglasses;
    }
    Accessory::None
}

fn span(len: u32, from: f64, to: f64) -> (u32, u32) {
    let start = ((len as f64) * from).floor() as u32;
    let end = ((len as f64) * to).ceil() as u32;
    (start.min(len), end.clamp(start.min(len), len))
}
