//! Binary reflected Gray code structured light patterns.
//!
//! A projector of size `width x height` is encoded with `ceil(log2(width))` column bits and
//! `ceil(log2(height))` row bits. Every bit is projected twice, once as the pattern and once as its
//! photometric inverse, so decoding compares each pixel against itself rather than a global
//! threshold. Patterns are ordered column bits first, most significant bit first:
//!
//! ```txt
//! x[msb], !x[msb], ..., x[lsb], !x[lsb], y[msb], !y[msb], ..., y[lsb], !y[lsb]
//! ```
use image::GrayImage;
use rayon::prelude::*;

/// Default minimum difference between a pattern and its inverse for a pixel to count as lit.
pub const DEFAULT_CONTRAST_THRESHOLD: u8 = 10;

/// Default number of least significant bits whose contrast is not checked.
pub const DEFAULT_UNVALIDATED_LOW_BITS: u32 = 4;

pub fn binary_to_gray(binary: u32) -> u32 {
    binary ^ (binary >> 1)
}

pub fn gray_to_binary(gray: u32) -> u32 {
    let mut binary = gray;
    let mut shift = 1;
    while shift < 32 {
        binary ^= binary >> shift;
        shift *= 2;
    }
    binary
}

fn num_bits(size: u32) -> u32 {
    (size as f64).log2().ceil() as u32
}

/// Pattern generator and decoder for one projector.
#[derive(Debug, Clone)]
pub struct GrayCode {
    pub width: u32,
    pub height: u32,
    pub num_x_bits: u32,
    pub num_y_bits: u32,
    /// A pixel is valid at a bit level only if `|captured - inverted|` exceeds this.
    pub contrast_threshold: u8,
    /// Number of least significant levels excluded from the validity mask. Fine stripes are
    /// blurred by the camera and would otherwise mask most of the image. The most significant
    /// level is validated regardless.
    pub unvalidated_low_bits: u32,
}

/// Per camera pixel decoding of one axis.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub width: u32,
    pub height: u32,
    /// Decoded projector column or row for every camera pixel, row major.
    pub values: Vec<i32>,
    /// `true` where `values` is trustworthy.
    pub mask: Vec<bool>,
}

impl Decoded {
    pub fn get(&self, x: u32, y: u32) -> Option<i32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) as usize;
        if self.mask[i] {
            Some(self.values[i])
        } else {
            None
        }
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|x| **x).count()
    }
}

/// Projector pixel for each camera pixel, combining the column and row decodings.
#[derive(Debug, Clone)]
pub struct DecodedCorrespondences {
    pub x: Decoded,
    pub y: Decoded,
}

impl DecodedCorrespondences {
    /// Projector pixel seen at camera pixel `(x, y)`, if both axes decoded.
    pub fn get(&self, x: u32, y: u32) -> Option<(i32, i32)> {
        match (self.x.get(x, y), self.y.get(x, y)) {
            (Some(px), Some(py)) => Some((px, py)),
            _ => None,
        }
    }

    pub fn width(&self) -> u32 {
        self.x.width
    }

    pub fn height(&self) -> u32 {
        self.x.height
    }

    pub fn valid_count(&self) -> usize {
        self.x
            .mask
            .iter()
            .zip(self.y.mask.iter())
            .filter(|(a, b)| **a && **b)
            .count()
    }
}

impl GrayCode {
    pub fn new(width: u32, height: u32) -> Self {
        GrayCode {
            width,
            height,
            num_x_bits: num_bits(width),
            num_y_bits: num_bits(height),
            contrast_threshold: DEFAULT_CONTRAST_THRESHOLD,
            unvalidated_low_bits: DEFAULT_UNVALIDATED_LOW_BITS,
        }
    }

    pub fn with_thresholds(self, contrast_threshold: u8, unvalidated_low_bits: u32) -> Self {
        GrayCode {
            contrast_threshold,
            unvalidated_low_bits,
            ..self
        }
    }

    /// Number of images produced by [GrayCode::generate].
    pub fn num_patterns(&self) -> usize {
        2 * (self.num_x_bits + self.num_y_bits) as usize
    }

    /// Value (0 or 255) of pattern `index` at projector pixel `(x, y)`.
    pub fn pattern_value(&self, index: usize, x: u32, y: u32) -> u8 {
        let level = (index / 2) as u32;
        let inverted = index % 2 == 1;
        let (coord, bits, level) = if level < self.num_x_bits {
            (x, self.num_x_bits, level)
        } else {
            (y, self.num_y_bits, level - self.num_x_bits)
        };
        let bit = (binary_to_gray(coord) >> (bits - 1 - level)) & 1 == 1;
        if bit != inverted {
            255
        } else {
            0
        }
    }

    /// Generate every pattern in projection order.
    pub fn generate(&self) -> Vec<GrayImage> {
        (0..self.num_patterns())
            .into_par_iter()
            .map(|i| GrayImage::from_fn(self.width, self.height, |x, y| {
                image::Luma([self.pattern_value(i, x, y)])
            }))
            .collect()
    }

    /// Decode captured images, given in the order of [GrayCode::generate].
    pub fn decode(&self, captured: &[GrayImage]) -> crate::Result<DecodedCorrespondences> {
        if captured.len() != self.num_patterns() {
            return Err(crate::Error::InvalidInput(format!(
                "expected {} captured patterns, got {}",
                self.num_patterns(),
                captured.len()
            )));
        }
        let (w, h) = match captured.first() {
            Some(c) => c.dimensions(),
            None => return Err(crate::Error::InvalidInput("no patterns to decode".to_string())),
        };
        if captured.iter().any(|c| c.dimensions() != (w, h)) {
            return Err(crate::Error::InvalidInput(
                "captured patterns differ in size".to_string(),
            ));
        }

        let split = 2 * self.num_x_bits as usize;
        let x = self.decode_axis(&captured[..split], self.num_x_bits, self.width, w, h);
        let y = self.decode_axis(&captured[split..], self.num_y_bits, self.height, w, h);
        Ok(DecodedCorrespondences { x, y })
    }

    fn decode_axis(
        &self,
        captured: &[GrayImage],
        bits: u32,
        dimension: u32,
        width: u32,
        height: u32,
    ) -> Decoded {
        // the most significant level is always checked
        let validated = bits.saturating_sub(self.unvalidated_low_bits).max(bits.min(1));
        let threshold = self.contrast_threshold as i32;

        let (values, mask): (Vec<i32>, Vec<bool>) = (0..(width * height) as usize)
            .into_par_iter()
            .map(|i| {
                let x = i as u32 % width;
                let y = i as u32 / width;
                let mut value = 0i32;
                let mut valid = true;
                let mut binary = false;
                for level in 0..bits {
                    let c = captured[2 * level as usize].get_pixel(x, y)[0] as i32;
                    let inv = captured[2 * level as usize + 1].get_pixel(x, y)[0] as i32;
                    if level < validated {
                        valid &= (c - inv).abs() > threshold;
                    }
                    // running xor turns the gray code bit into a binary bit
                    binary ^= c >= inv;
                    if binary {
                        value += 1 << (bits - 1 - level);
                    }
                }
                let in_range = value >= 0 && value < dimension as i32;
                (value, valid && in_range)
            })
            .unzip();

        Decoded {
            width,
            height,
            values,
            mask,
        }
    }
}
