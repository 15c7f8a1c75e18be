//! Tile-space domain types: Web-Mercator math, the stitched raster, and the
//! pixel-to-geo transform attached to it.
//!
//! Tile scheme is XYZ (Web-Mercator), tile edge 256 px. All latitudes and
//! longitudes are WGS84 decimal degrees.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::f64::consts::PI;

/// Tile edge length in pixels for XYZ providers.
pub const TILE_SIZE: u32 = 256;

/// One XYZ tile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Tile containing the given WGS84 point at `zoom`.
    pub fn from_lat_lon(latitude: f64, longitude: f64, zoom: u8) -> Self {
        let n = f64::from(1u32 << zoom);
        let x = ((longitude + 180.0) / 360.0 * n).floor();
        let lat_rad = latitude.to_radians();
        let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();

        let max = (1u32 << zoom) - 1;
        Self {
            zoom,
            x: (x.max(0.0) as u32).min(max),
            y: (y.max(0.0) as u32).min(max),
        }
    }

    /// WGS84 coordinate of this tile's north-west corner.
    pub fn northwest(&self) -> (f64, f64) {
        let n = f64::from(1u32 << self.zoom);
        let lon = f64::from(self.x) / n * 360.0 - 180.0;
        let lat = (PI * (1.0 - 2.0 * f64::from(self.y) / n)).sinh().atan();
        (lat.to_degrees(), lon)
    }
}

/// Affine mapping from pixel coordinates of a stitched raster to WGS84.
///
/// `degrees_per_pixel_y` is negative: pixel rows grow southward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub degrees_per_pixel_x: f64,
    pub degrees_per_pixel_y: f64,
}

impl GeoTransform {
    /// Geographic position of a pixel center.
    pub fn pixel_to_geo(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.origin_lat + y * self.degrees_per_pixel_y,
            self.origin_lon + x * self.degrees_per_pixel_x,
        )
    }

    /// Approximate ground sample distance in meters per pixel at the
    /// transform's origin latitude.
    pub fn ground_sample_distance_m(&self) -> f64 {
        const METERS_PER_DEGREE_LON_EQUATOR: f64 = 111_320.0;
        self.degrees_per_pixel_x
            * METERS_PER_DEGREE_LON_EQUATOR
            * self.origin_lat.to_radians().cos().abs()
    }
}

/// A stitched RGB raster with its geographic footprint and a content hash.
#[derive(Debug, Clone)]
pub struct StitchedImage {
    pub image: RgbImage,
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: u8,
    pub transform: GeoTransform,
    /// SHA-256 over the raw pixel buffer, hex-encoded.
    pub content_hash: String,
}

impl StitchedImage {
    pub fn new(
        image: RgbImage,
        center_lat: f64,
        center_lon: f64,
        zoom: u8,
        transform: GeoTransform,
    ) -> Self {
        let content_hash = hash_pixels(&image);
        Self {
            image,
            center_lat,
            center_lon,
            zoom,
            transform,
            content_hash,
        }
    }
}

pub fn hash_pixels(image: &RgbImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_raw());
    hex::encode(hasher.finalize())
}

/// Stitch a `(2r+1) x (2r+1)` block of decoded tiles, row-major around the
/// center tile, into one raster and derive its geo transform.
///
/// `tiles` must be ordered row-by-row (north to south, west to east) and
/// every entry must be `TILE_SIZE` square; the caller substitutes gray
/// placeholders for failed tiles before stitching.
pub fn stitch(
    center: TileCoord,
    radius: u32,
    tiles: &[RgbImage],
    center_lat: f64,
    center_lon: f64,
) -> StitchedImage {
    let side = 2 * radius + 1;
    assert_eq!(
        tiles.len(),
        (side * side) as usize,
        "tile block must be complete before stitching"
    );

    let width = side * TILE_SIZE;
    let height = side * TILE_SIZE;
    let mut canvas = RgbImage::new(width, height);

    for (index, tile) in tiles.iter().enumerate() {
        let row = index as u32 / side;
        let col = index as u32 % side;
        let x_off = col * TILE_SIZE;
        let y_off = row * TILE_SIZE;
        for y in 0..TILE_SIZE {
            for x in 0..TILE_SIZE {
                canvas.put_pixel(x_off + x, y_off + y, *tile.get_pixel(x, y));
            }
        }
    }

    let top_left = TileCoord {
        zoom: center.zoom,
        x: center.x.saturating_sub(radius),
        y: center.y.saturating_sub(radius),
    };
    let bottom_right = TileCoord {
        zoom: center.zoom,
        x: top_left.x + side,
        y: top_left.y + side,
    };
    let (origin_lat, origin_lon) = top_left.northwest();
    let (end_lat, end_lon) = bottom_right.northwest();

    let transform = GeoTransform {
        origin_lat,
        origin_lon,
        degrees_per_pixel_x: (end_lon - origin_lon) / f64::from(width),
        degrees_per_pixel_y: (end_lat - origin_lat) / f64::from(height),
    };

    StitchedImage::new(canvas, center_lat, center_lon, center.zoom, transform)
}

/// Neutral gray placeholder used when a tile permanently fails to download.
pub fn placeholder_tile() -> RgbImage {
    RgbImage::from_pixel(TILE_SIZE, TILE_SIZE, image::Rgb([128, 128, 128]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_contains_its_defining_point() {
        let (lat, lon, zoom) = (52.52, 13.405, 17);
        let tile = TileCoord::from_lat_lon(lat, lon, zoom);
        let (nw_lat, nw_lon) = tile.northwest();
        let next = TileCoord {
            zoom,
            x: tile.x + 1,
            y: tile.y + 1,
        };
        let (se_lat, se_lon) = next.northwest();

        // North-west corner is north and west of the point, the opposite
        // corner south and east of it.
        assert!(nw_lat >= lat && lat > se_lat, "{nw_lat} {lat} {se_lat}");
        assert!(nw_lon <= lon && lon < se_lon, "{nw_lon} {lon} {se_lon}");
    }

    #[test]
    fn tile_clamps_at_poles() {
        let tile = TileCoord::from_lat_lon(89.9, 0.0, 3);
        assert!(tile.y < 8);
        let tile = TileCoord::from_lat_lon(-89.9, 0.0, 3);
        assert!(tile.y < 8);
    }

    #[test]
    fn stitch_produces_expected_dimensions_and_transform() {
        let center = TileCoord::from_lat_lon(40.0, -74.0, 12);
        let tiles: Vec<RgbImage> = (0..9).map(|_| placeholder_tile()).collect();
        let stitched = stitch(center, 1, &tiles, 40.0, -74.0);

        assert_eq!(stitched.image.width(), 3 * TILE_SIZE);
        assert_eq!(stitched.image.height(), 3 * TILE_SIZE);
        assert!(stitched.transform.degrees_per_pixel_x > 0.0);
        assert!(stitched.transform.degrees_per_pixel_y < 0.0);

        // Pixel (0, 0) must map to the north-west corner of the block.
        let (lat, lon) = stitched.transform.pixel_to_geo(0.0, 0.0);
        assert!((lat - stitched.transform.origin_lat).abs() < 1e-12);
        assert!((lon - stitched.transform.origin_lon).abs() < 1e-12);
    }

    #[test]
    fn content_hash_is_stable_and_input_sensitive() {
        let a = RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
        let b = RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 4]));
        assert_eq!(hash_pixels(&a), hash_pixels(&a));
        assert_ne!(hash_pixels(&a), hash_pixels(&b));
    }
}
