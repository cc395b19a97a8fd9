use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Geometry tag of a measurement. Serialized with the GeoJSON type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementKind {
    LineString,
    Polygon,
}

impl MeasurementKind {
    /// Unit the value is reported in: meters for lines, square meters for polygons.
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementKind::LineString => "m",
            MeasurementKind::Polygon => "m²",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::LineString => "LineString",
            MeasurementKind::Polygon => "Polygon",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LineString" => Ok(MeasurementKind::LineString),
            "Polygon" => Ok(MeasurementKind::Polygon),
            other => Err(ValidationError::UnknownType(other.to_string())),
        }
    }
}

/// A measurement as submitted by a client, before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMeasurement {
    #[serde(rename = "type")]
    pub kind: MeasurementKind,
    pub geojson: Value,
    pub value: f64,
    pub unit: String,
}

/// A persisted measurement document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MeasurementKind,
    pub geojson: Value,
    pub value: f64,
    pub unit: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),
    #[error("field '{0}' must be {1}")]
    WrongShape(&'static str, &'static str),
    #[error("type must be LineString or Polygon, got '{0}'")]
    UnknownType(String),
    #[error("value must be a finite, non-negative number")]
    InvalidValue,
}

impl NewMeasurement {
    /// Validate a raw create payload.
    ///
    /// Only presence and shape of the four fields are checked, plus the
    /// document schema (type tag, non-negative value). The geometry itself and
    /// its agreement with `type` are taken as submitted.
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        let obj = payload
            .as_object()
            .ok_or(ValidationError::WrongShape("body", "a JSON object"))?;

        let kind = match obj.get("type") {
            None | Some(Value::Null) => return Err(ValidationError::Missing("type")),
            Some(Value::String(s)) => s.parse::<MeasurementKind>()?,
            Some(_) => return Err(ValidationError::WrongShape("type", "a string")),
        };

        let geojson = match obj.get("geojson") {
            None | Some(Value::Null) => return Err(ValidationError::Missing("geojson")),
            Some(v @ Value::Object(_)) => v.clone(),
            Some(_) => return Err(ValidationError::WrongShape("geojson", "an object")),
        };

        let value = match obj.get("value") {
            None | Some(Value::Null) => return Err(ValidationError::Missing("value")),
            Some(Value::Number(n)) => n.as_f64().ok_or(ValidationError::InvalidValue)?,
            Some(_) => return Err(ValidationError::WrongShape("value", "a number")),
        };
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::InvalidValue);
        }

        let unit = match obj.get("unit") {
            None | Some(Value::Null) => return Err(ValidationError::Missing("unit")),
            Some(Value::String(s)) if s.is_empty() => return Err(ValidationError::Missing("unit")),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(ValidationError::WrongShape("unit", "a string")),
        };

        Ok(NewMeasurement { kind, geojson, value, unit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line_payload() -> Value {
        json!({
            "type": "LineString",
            "geojson": { "type": "Feature", "geometry": { "type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 0.0]] } },
            "value": 111195.0,
            "unit": "m"
        })
    }

    #[test]
    fn accepts_well_formed_payload() {
        let m = NewMeasurement::from_payload(&line_payload()).unwrap();
        assert_eq!(m.kind, MeasurementKind::LineString);
        assert_eq!(m.unit, "m");
        assert_eq!(m.value, 111195.0);
    }

    #[test]
    fn rejects_string_value() {
        let mut p = line_payload();
        p["value"] = json!("12");
        assert_eq!(
            NewMeasurement::from_payload(&p),
            Err(ValidationError::WrongShape("value", "a number"))
        );
    }

    #[test]
    fn rejects_missing_unit_and_geojson() {
        let mut p = line_payload();
        p.as_object_mut().unwrap().remove("unit");
        assert_eq!(NewMeasurement::from_payload(&p), Err(ValidationError::Missing("unit")));

        let mut p = line_payload();
        p.as_object_mut().unwrap().remove("geojson");
        assert_eq!(NewMeasurement::from_payload(&p), Err(ValidationError::Missing("geojson")));
    }

    #[test]
    fn does_not_cross_check_geometry_type() {
        let mut p = line_payload();
        p["type"] = json!("Polygon");
        let m = NewMeasurement::from_payload(&p).unwrap();
        assert_eq!(m.kind, MeasurementKind::Polygon);
    }

    #[test]
    fn rejects_unknown_tag_and_negative_value() {
        let mut p = line_payload();
        p["type"] = json!("Point");
        assert!(matches!(
            NewMeasurement::from_payload(&p),
            Err(ValidationError::UnknownType(_))
        ));

        let mut p = line_payload();
        p["value"] = json!(-1.0);
        assert_eq!(NewMeasurement::from_payload(&p), Err(ValidationError::InvalidValue));
    }

    #[test]
    fn measurement_serializes_as_document() {
        let now = Utc::now();
        let m = Measurement {
            id: "abc".into(),
            kind: MeasurementKind::Polygon,
            geojson: json!({}),
            value: 2.5,
            unit: "m²".into(),
            created_at: now,
            updated_at: now,
        };
        let doc = serde_json::to_value(&m).unwrap();
        assert_eq!(doc["_id"], "abc");
        assert_eq!(doc["type"], "Polygon");
        assert!(doc.get("createdAt").is_some());
        assert!(doc.get("updatedAt").is_some());
    }
}
