//! Drawn-shape to measurement conversion.
//!
//! Shapes arrive in the map's display projection. They are reprojected to
//! geographic coordinates, measured on the sphere and wrapped in a GeoJSON
//! Feature ready to be posted to the API.

use crate::types::{MeasurementKind, NewMeasurement};
use anyhow::{anyhow, Context, Result};
use geo::{ChamberlainDuquetteArea, Coord, HaversineLength, LineString, MapCoords, Polygon};
use geojson::{Feature, GeoJson, JsonObject, Value};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

// Spherical Web Mercator
const EARTH_RADIUS: f64 = 6_378_137.0;
const MERCATOR_MAX_LAT: f64 = 85.051_128_78;

/// Coordinate reference system the map draws in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplayProjection {
    #[default]
    #[serde(rename = "EPSG:3857")]
    WebMercator,
    #[serde(rename = "EPSG:4326")]
    Geographic,
}

impl DisplayProjection {
    /// Display coordinate to (lon, lat) degrees.
    pub fn to_geographic(self, c: Coord<f64>) -> Coord<f64> {
        match self {
            DisplayProjection::Geographic => c,
            DisplayProjection::WebMercator => Coord {
                x: (c.x / EARTH_RADIUS).to_degrees(),
                y: (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
            },
        }
    }

    /// (lon, lat) degrees to display coordinate.
    pub fn from_geographic(self, c: Coord<f64>) -> Coord<f64> {
        match self {
            DisplayProjection::Geographic => c,
            DisplayProjection::WebMercator => {
                let lat = c.y.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT).to_radians();
                Coord {
                    x: EARTH_RADIUS * c.x.to_radians(),
                    y: EARTH_RADIUS * (PI / 4.0 + lat / 2.0).tan().ln(),
                }
            }
        }
    }
}

/// A finished drawing, still in display coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawnShape {
    Line(LineString<f64>),
    Polygon(Polygon<f64>),
}

impl DrawnShape {
    pub fn kind(&self) -> MeasurementKind {
        match self {
            DrawnShape::Line(_) => MeasurementKind::LineString,
            DrawnShape::Polygon(_) => MeasurementKind::Polygon,
        }
    }

    /// Build a shape from geographic vertices, projecting them for display.
    pub fn from_lon_lat(kind: MeasurementKind, vertices: &[(f64, f64)], projection: DisplayProjection) -> Self {
        let coords: Vec<Coord<f64>> = vertices
            .iter()
            .map(|&(x, y)| projection.from_geographic(Coord { x, y }))
            .collect();
        match kind {
            MeasurementKind::LineString => DrawnShape::Line(LineString::new(coords)),
            MeasurementKind::Polygon => DrawnShape::Polygon(Polygon::new(LineString::new(coords), vec![])),
        }
    }

    /// Convert to a measurement, or `None` when the shape is degenerate
    /// (a line with fewer than two distinct vertices, a polygon with fewer than three).
    pub fn measure(&self, projection: DisplayProjection) -> Option<NewMeasurement> {
        let kind = self.kind();
        let (value, geometry) = match self {
            DrawnShape::Line(line) => {
                let geographic = line.map_coords(|c| projection.to_geographic(c));
                if distinct_vertices(&geographic) < 2 {
                    return None;
                }
                let length = geographic.haversine_length();
                (length, Value::LineString(positions(&geographic)))
            }
            DrawnShape::Polygon(poly) => {
                let ring = poly.exterior().map_coords(|c| projection.to_geographic(c));
                if distinct_vertices(&ring) < 3 {
                    return None;
                }
                // Holes are not drawable; only the outer ring is measured and stored.
                let outer = Polygon::new(ring, vec![]);
                let area = outer.chamberlain_duquette_unsigned_area();
                (area, Value::Polygon(vec![positions(outer.exterior())]))
            }
        };

        let feature = Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geometry)),
            id: None,
            properties: None,
            foreign_members: None,
        };

        Some(NewMeasurement {
            kind,
            geojson: serde_json::Value::Object(JsonObject::from(&feature)),
            value,
            unit: kind.unit().to_string(),
        })
    }
}

fn positions(line: &LineString<f64>) -> Vec<Vec<f64>> {
    line.coords().map(|c| vec![c.x, c.y]).collect()
}

fn distinct_vertices(line: &LineString<f64>) -> usize {
    let mut coords: Vec<Coord<f64>> = line.coords().copied().collect();
    coords.dedup();
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    coords.len()
}

/// Read drawn shapes from a GeoJSON file in display coordinates.
///
/// Accepts a FeatureCollection, a single Feature or a bare Geometry. Features
/// that are neither lines nor polygons are skipped.
pub fn load_drawn_shapes(path: &Path) -> Result<Vec<DrawnShape>> {
    let file = File::open(path).with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let geojson = GeoJson::from_reader(BufReader::new(file)).context("Failed to parse GeoJSON")?;

    let geometries: Vec<geojson::Geometry> = match geojson {
        GeoJson::FeatureCollection(fc) => fc.features.into_iter().filter_map(|f| f.geometry).collect(),
        GeoJson::Feature(f) => f.geometry.into_iter().collect(),
        GeoJson::Geometry(g) => vec![g],
    };

    let mut shapes = Vec::new();
    for geometry in geometries {
        match geometry.value {
            Value::LineString(_) | Value::Polygon(_) => {
                let geo_geom: geo::Geometry<f64> = geometry
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;
                match geo_geom {
                    geo::Geometry::LineString(l) => shapes.push(DrawnShape::Line(l)),
                    geo::Geometry::Polygon(p) => shapes.push(DrawnShape::Polygon(p)),
                    _ => {}
                }
            }
            _ => tracing::debug!("skipping non line/polygon geometry"),
        }
    }
    Ok(shapes)
}
