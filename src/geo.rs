use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::models::Coordinates;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// `(35.6762, 139.6503)`
static PARENTHETICAL_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\)").expect("valid regex")
});

/// `54.51N 160.13W`, `54.51 °N, 160.13 °W`
static DIRECTIONAL_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?\d{1,2}\.\d+)\s*°?\s*([NSns])[,;\s]+(-?\d{1,3}\.\d+)\s*°?\s*([EWew])")
        .expect("valid regex")
});

/// `1.849900, 126.994300`
static BARE_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?\d{1,3}\.\d+)[,\s]+(-?\d{1,3}\.\d+)").expect("valid regex")
});

pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Find an explicit coordinate pair in free text.
///
/// Patterns are tried in precedence order: parenthetical pair, then a pair
/// with N/S/E/W suffixes, then a bare decimal pair. Within a pattern the first
/// in-range match wins; out-of-range candidates are skipped.
pub fn extract_inline_coordinates(text: &str) -> Option<Coordinates> {
    first_valid(&PARENTHETICAL_PAIR, text, plain_pair)
        .or_else(|| first_valid(&DIRECTIONAL_PAIR, text, directional_pair))
        .or_else(|| first_valid(&BARE_PAIR, text, plain_pair))
}

fn first_valid(
    pattern: &Regex,
    text: &str,
    parse: fn(&Captures) -> Option<Coordinates>,
) -> Option<Coordinates> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| parse(&caps))
        .find(Coordinates::is_valid)
}

fn plain_pair(caps: &Captures) -> Option<Coordinates> {
    let lat = caps.get(1)?.as_str().parse().ok()?;
    let lng = caps.get(2)?.as_str().parse().ok()?;
    Some(Coordinates::new(lat, lng))
}

fn directional_pair(caps: &Captures) -> Option<Coordinates> {
    let lat: f64 = caps.get(1)?.as_str().parse().ok()?;
    let lng: f64 = caps.get(3)?.as_str().parse().ok()?;
    let south = caps.get(2)?.as_str().eq_ignore_ascii_case("s");
    let west = caps.get(4)?.as_str().eq_ignore_ascii_case("w");

    Some(Coordinates::new(
        if south { -lat.abs() } else { lat.abs() },
        if west { -lng.abs() } else { lng.abs() },
    ))
}
