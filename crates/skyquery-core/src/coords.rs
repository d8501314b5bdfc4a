//! Coordinate transformer for cone searches.
//!
//! Converts search radii into radians and sky positions (right ascension,
//! declination) into the longitude/latitude convention used by the
//! spherical range predicate stored in catalog documents
//! (`coordinates.radec_geojson`). The mapping is `lon = ra - 180`,
//! `lat = dec`, all in degrees.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::literal::Literal;

/// Angular unit accepted for `cone_search_unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AngularUnit {
    Deg,
    Arcmin,
    Arcsec,
    Rad,
}

impl AngularUnit {
    pub const ALL: [AngularUnit; 4] = [Self::Deg, Self::Arcmin, Self::Arcsec, Self::Rad];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deg => "deg",
            Self::Arcmin => "arcmin",
            Self::Arcsec => "arcsec",
            Self::Rad => "rad",
        }
    }
}

impl fmt::Display for AngularUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AngularUnit {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deg" => Ok(Self::Deg),
            "arcmin" => Ok(Self::Arcmin),
            "arcsec" => Ok(Self::Arcsec),
            "rad" => Ok(Self::Rad),
            other => Err(CoordinateError::UnknownUnit(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("unknown angular unit `{0}`; expected one of deg, arcmin, arcsec, rad")]
    UnknownUnit(String),
    #[error("cannot parse coordinate `{0}`")]
    Unparseable(String),
    #[error("right ascension {0} is outside [0, 360) degrees")]
    RaOutOfRange(f64),
    #[error("declination {0} is outside [-90, 90] degrees")]
    DecOutOfRange(f64),
    #[error("expected an (ra, dec) pair, got {0}")]
    NotAPair(String),
}

/// Convert a radius in `unit` to radians.
pub fn to_radians(radius: f64, unit: AngularUnit) -> f64 {
    match unit {
        AngularUnit::Deg => radius * (PI / 180.0),
        AngularUnit::Arcmin => radius * (PI / 180.0 / 60.0),
        AngularUnit::Arcsec => radius * (PI / 180.0 / 3600.0),
        AngularUnit::Rad => radius,
    }
}

/// Remap (ra, dec) in degrees to the (lon, lat) convention of the store.
pub fn to_geo_point(ra: f64, dec: f64) -> (f64, f64) {
    (ra - 180.0, dec)
}

/// Validate that (ra, dec) are in range, returning them unchanged.
pub fn check_radec(ra: f64, dec: f64) -> Result<(f64, f64), CoordinateError> {
    if !ra.is_finite() || !(0.0..360.0).contains(&ra) {
        return Err(CoordinateError::RaOutOfRange(ra));
    }
    if !dec.is_finite() || !(-90.0..=90.0).contains(&dec) {
        return Err(CoordinateError::DecOutOfRange(dec));
    }
    Ok((ra, dec))
}

/// Decode one supplied pair into a storage-convention point.
///
/// Numeric elements (or numeric strings) are degrees. Two sexagesimal strings
/// are read as RA in hours and Dec in degrees and go through radians so
/// results match the historical conversion to the last bit.
pub fn pair_to_geo_point(pair: &Literal) -> Result<(f64, f64), CoordinateError> {
    let items = match pair.as_sequence() {
        Some(items) if items.len() == 2 => items,
        _ => return Err(CoordinateError::NotAPair(pair.to_string())),
    };
    match (&items[0], &items[1]) {
        (Literal::Str(ra), Literal::Str(dec)) if is_sexagesimal(ra) || is_sexagesimal(dec) => {
            let ra_rad = ra_hours_to_radians(ra)?;
            let dec_rad = dec_degrees_to_radians(dec)?;
            let ra_deg = ra_rad * 180.0 / PI;
            let dec_deg = dec_rad * 180.0 / PI;
            check_radec(ra_deg, dec_deg)?;
            Ok((ra_deg - 180.0, dec_deg))
        }
        (ra, dec) => {
            let (ra, dec) = check_radec(degrees(ra)?, degrees(dec)?)?;
            Ok(to_geo_point(ra, dec))
        }
    }
}

fn degrees(value: &Literal) -> Result<f64, CoordinateError> {
    match value {
        Literal::Str(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CoordinateError::Unparseable(s.clone())),
        other => other
            .as_f64()
            .ok_or_else(|| CoordinateError::Unparseable(other.to_string())),
    }
}

fn is_sexagesimal(s: &str) -> bool {
    s.contains(':') || s.chars().any(|c| matches!(c, 'h' | 'd' | 'm' | 's'))
}

/// Split `12:34:56.7`, `12h34m56.7s` or `-12d34m56s` into three fields.
fn sexagesimal_fields(s: &str) -> Result<(String, f64, f64), CoordinateError> {
    let normalized = s
        .trim()
        .trim_end_matches('s')
        .replace(['h', 'd', 'm'], ":");
    let parts: Vec<&str> = normalized.split(':').collect();
    if parts.len() != 3 {
        return Err(CoordinateError::Unparseable(s.to_string()));
    }
    let bad = || CoordinateError::Unparseable(s.to_string());
    let first = parts[0].trim().to_string();
    first.parse::<f64>().map_err(|_| bad())?;
    let minutes = parts[1].trim().parse::<f64>().map_err(|_| bad())?;
    let seconds = parts[2].trim().parse::<f64>().map_err(|_| bad())?;
    Ok((first, minutes, seconds))
}

fn ra_hours_to_radians(s: &str) -> Result<f64, CoordinateError> {
    let (hours, minutes, seconds) = sexagesimal_fields(s)?;
    let hours: f64 = hours
        .parse()
        .map_err(|_| CoordinateError::Unparseable(s.to_string()))?;
    Ok((hours + minutes / 60.0 + seconds / 3600.0) * PI / 12.0)
}

fn dec_degrees_to_radians(s: &str) -> Result<f64, CoordinateError> {
    let (degrees, minutes, seconds) = sexagesimal_fields(s)?;
    let sign = if degrees.starts_with('-') { -1.0 } else { 1.0 };
    let degrees: f64 = degrees
        .parse()
        .map_err(|_| CoordinateError::Unparseable(s.to_string()))?;
    Ok(sign * (degrees.abs() + minutes.abs() / 60.0 + seconds.abs() / 3600.0) * PI / 180.0)
}

/// Great-circle distance in radians between two (lon, lat) points in degrees.
pub fn angular_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lon1, lat1) = (a.0.to_radians(), a.1.to_radians());
    let (lon2, lat2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::parse_literal;

    #[test]
    fn test_units() {
        assert!((to_radians(3600.0, AngularUnit::Arcsec) - PI / 180.0).abs() < 1e-12);
        assert!((to_radians(60.0, AngularUnit::Arcmin) - PI / 180.0).abs() < 1e-12);
        assert_eq!(to_radians(0.25, AngularUnit::Rad), 0.25);
        assert_eq!("arcsec".parse::<AngularUnit>().unwrap(), AngularUnit::Arcsec);
        assert!("parsec".parse::<AngularUnit>().is_err());
    }

    #[test]
    fn test_geo_point_remap() {
        assert_eq!(to_geo_point(10.0, 20.0), (-170.0, 20.0));
        assert_eq!(to_geo_point(359.5, -90.0), (179.5, -90.0));
    }

    #[test]
    fn test_numeric_and_string_pairs() {
        let p = parse_literal("(10.0, 20.0)").unwrap();
        assert_eq!(pair_to_geo_point(&p).unwrap(), (-170.0, 20.0));
        let p = parse_literal("['10.0', '-5']").unwrap();
        assert_eq!(pair_to_geo_point(&p).unwrap(), (-170.0, -5.0));
    }

    #[test]
    fn test_sexagesimal_pair() {
        let p = parse_literal("('12:00:00', '-30:30:00')").unwrap();
        let (lon, lat) = pair_to_geo_point(&p).unwrap();
        assert!((lon - 0.0).abs() < 1e-9);
        assert!((lat + 30.5).abs() < 1e-9);

        let p = parse_literal("('06h00m00s', '+10d15m00s')").unwrap();
        let (lon, lat) = pair_to_geo_point(&p).unwrap();
        assert!((lon + 90.0).abs() < 1e-9);
        assert!((lat - 10.25).abs() < 1e-9);
    }

    #[test]
    fn test_negative_zero_degrees_keeps_sign() {
        let p = parse_literal("('00:00:00', '-00:30:00')").unwrap();
        let (_, lat) = pair_to_geo_point(&p).unwrap();
        assert!((lat + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range() {
        let p = parse_literal("(360.0, 0)").unwrap();
        assert_eq!(
            pair_to_geo_point(&p).unwrap_err(),
            CoordinateError::RaOutOfRange(360.0)
        );
        let p = parse_literal("(10, 91)").unwrap();
        assert!(matches!(
            pair_to_geo_point(&p),
            Err(CoordinateError::DecOutOfRange(_))
        ));
        let p = parse_literal("(1, 2, 3)").unwrap();
        assert!(matches!(
            pair_to_geo_point(&p),
            Err(CoordinateError::NotAPair(_))
        ));
    }

    #[test]
    fn test_angular_distance() {
        let d = angular_distance((0.0, 0.0), (1.0, 0.0));
        assert!((d - PI / 180.0).abs() < 1e-12);
        let d = angular_distance((-170.0, 20.0), (-170.0, 20.0));
        assert_eq!(d, 0.0);
        let d = angular_distance((0.0, 90.0), (0.0, -90.0));
        assert!((d - PI).abs() < 1e-12);
    }
}
