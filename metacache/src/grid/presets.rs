//! Well-known grid definitions.

use super::{Extent, Grid, Unit};

/// Radius used by the spherical mercator projection, in meters.
const MERCATOR_EXTENT: f64 = 20037508.342789244;

/// Plate carree grid over the whole globe in degrees, 256px tiles.
///
/// Level 0 is two tiles wide (0.703125 degrees per pixel), each level
/// halving the resolution of the previous one.
pub fn wgs84(nlevels: usize) -> Grid {
    let resolutions: Vec<f64> = (0..nlevels).map(|z| 0.703125 / (1u64 << z) as f64).collect();
    Grid::new(
        "WGS84",
        Extent::new(-180.0, -90.0, 180.0, 90.0),
        Unit::Degrees,
        256,
        256,
        &resolutions,
    )
}

/// Spherical mercator grid compatible with common web map tile services.
///
/// Level 0 is a single 256px tile covering the projected globe.
pub fn google_maps_compatible(nlevels: usize) -> Grid {
    let res0 = MERCATOR_EXTENT * 2.0 / 256.0;
    let resolutions: Vec<f64> = (0..nlevels).map(|z| res0 / (1u64 << z) as f64).collect();
    Grid::new(
        "GoogleMapsCompatible",
        Extent::new(
            -MERCATOR_EXTENT,
            -MERCATOR_EXTENT,
            MERCATOR_EXTENT,
            MERCATOR_EXTENT,
        ),
        Unit::Meters,
        256,
        256,
        &resolutions,
    )
}
