use std::io::Cursor;

use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use serde::Deserialize;

use crate::bounds::BoundingBox;
use crate::error::Result;

/// How source pixels are sampled when a tile is resized or reprojected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
}

/// A decoded stored tile and its extent in the pyramid's SRS.
pub(crate) struct Fragment {
    pub bounds: BoundingBox,
    pub image: RgbaImage,
}

/// Bilinear contributions gathered for one output pixel.
#[derive(Clone, Copy, Default)]
struct Blend {
    sums: [f64; 4],
    weight: f64,
    /// Set once a fragment contains the pixel's sample point.
    covered: bool,
}

/// The output tile. Pixels stay transparent until a fragment covers them.
pub(crate) struct Canvas {
    image: RgbaImage,
    blend: Vec<Blend>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Canvas {
            image: RgbaImage::new(width, height),
            blend: Vec::new(),
        }
    }

    /// Paints `fragment` into the output pixels whose native coordinate it
    /// contains and returns how many those are. `coords` holds one entry per
    /// output pixel in row-major order; `None` marks pixels that could not be
    /// projected.
    ///
    /// Nearest sampling fills still transparent pixels only, so the first
    /// fragment painted wins. Bilinear sampling takes each of the four source
    /// pixels around a sample from whichever fragment holds it, so pixels on a
    /// seam between stored tiles blend both sides. Fragments must come from
    /// one tile matrix for that to hold.
    pub fn paint(&mut self, fragment: &Fragment, coords: &[Option<(f64, f64)>], resampling: Resampling) -> usize {
        let (fw, fh) = fragment.image.dimensions();
        if fw == 0 || fh == 0 {
            return 0;
        }

        match resampling {
            Resampling::Nearest => self.paint_nearest(fragment, coords),
            Resampling::Bilinear => self.paint_bilinear(fragment, coords),
        }
    }

    fn paint_nearest(&mut self, fragment: &Fragment, coords: &[Option<(f64, f64)>]) -> usize {
        let width = self.image.width();
        let bounds = &fragment.bounds;
        let mut painted = 0;

        for (i, coord) in coords.iter().enumerate() {
            let Some((x, y)) = *coord else {
                continue;
            };
            if !bounds.contains(x, y) {
                continue;
            }

            let (px, py) = (i as u32 % width, i as u32 / width);
            if self.image.get_pixel(px, py)[3] != 0 {
                continue;
            }

            let (fx, fy) = fragment_position(fragment, x, y);
            self.image.put_pixel(px, py, sample_nearest(&fragment.image, fx, fy));
            painted += 1;
        }

        painted
    }

    fn paint_bilinear(&mut self, fragment: &Fragment, coords: &[Option<(f64, f64)>]) -> usize {
        if self.blend.is_empty() {
            self.blend = vec![Blend::default(); self.image.len() / 4];
        }
        let (fw, fh) = fragment.image.dimensions();
        let mut painted = 0;

        for (i, coord) in coords.iter().enumerate() {
            let Some((x, y)) = *coord else {
                continue;
            };
            let (fx, fy) = fragment_position(fragment, x, y);

            // Pixel centres sit at half-integer coordinates.
            let (cx, cy) = (fx - 0.5, fy - 0.5);
            let (x0, y0) = (cx.floor(), cy.floor());
            let (tx, ty) = (cx - x0, cy - y0);
            let (x0, y0) = (x0 as i64, y0 as i64);

            let corners = [
                (x0, y0, (1.0 - tx) * (1.0 - ty)),
                (x0 + 1, y0, tx * (1.0 - ty)),
                (x0, y0 + 1, (1.0 - tx) * ty),
                (x0 + 1, y0 + 1, tx * ty),
            ];

            let blend = &mut self.blend[i];
            for (sx, sy, weight) in corners {
                if weight <= 0.0
                    || sx < 0
                    || sy < 0
                    || sx >= i64::from(fw)
                    || sy >= i64::from(fh)
                {
                    continue;
                }
                let pixel = fragment.image.get_pixel(sx as u32, sy as u32);
                for (sum, channel) in blend.sums.iter_mut().zip(pixel.0) {
                    *sum += f64::from(channel) * weight;
                }
                blend.weight += weight;
            }

            if fragment.bounds.contains(x, y) {
                blend.covered = true;
                painted += 1;
            }
        }

        painted
    }

    pub fn encode(mut self) -> Result<Vec<u8>> {
        let width = self.image.width();
        for (i, blend) in self.blend.iter().enumerate() {
            if !blend.covered || blend.weight <= 0.0 {
                continue;
            }
            let mut channels = [0u8; 4];
            for (channel, sum) in channels.iter_mut().zip(blend.sums) {
                *channel = (sum / blend.weight).round().clamp(0.0, 255.0) as u8;
            }
            self.image
                .put_pixel(i as u32 % width, i as u32 / width, Rgba(channels));
        }

        encode_png(self.image)
    }
}

/// Continuous pixel position of a native coordinate within `fragment`,
/// `(0, 0)` being its top-left corner.
fn fragment_position(fragment: &Fragment, x: f64, y: f64) -> (f64, f64) {
    let (fw, fh) = fragment.image.dimensions();
    let bounds = &fragment.bounds;
    (
        (x - bounds.min_x) * f64::from(fw) / bounds.width(),
        (bounds.max_y - y) * f64::from(fh) / bounds.height(),
    )
}

/// A fully transparent PNG.
pub(crate) fn blank_png(width: u32, height: u32) -> Result<Vec<u8>> {
    encode_png(RgbaImage::new(width, height))
}

fn encode_png(image: RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;

    Ok(bytes)
}

fn clamped_pixel(image: &RgbaImage, x: i64, y: i64) -> Rgba<u8> {
    let x = x.clamp(0, i64::from(image.width()) - 1) as u32;
    let y = y.clamp(0, i64::from(image.height()) - 1) as u32;
    *image.get_pixel(x, y)
}

/// `fx` and `fy` are continuous pixel coordinates, `(0, 0)` being the
/// top-left corner of the image.
fn sample_nearest(image: &RgbaImage, fx: f64, fy: f64) -> Rgba<u8> {
    clamped_pixel(image, fx.floor() as i64, fy.floor() as i64)
}
