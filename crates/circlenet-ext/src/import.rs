//! GeoJSON result import
//!
//! Accepts a `FeatureCollection`, a single `Feature` or a bare array of
//! features, the three shapes the host's own exporter produces.

use crate::error::DetectionError;
use crate::hierarchy::{AnnotationHierarchy, Geometry, ObjectKind, PathClass, PathObject};
use crate::Result;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: Option<FeatureProperties>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureProperties {
    object_type: Option<String>,
    classification: Option<Classification>,
    name: Option<String>,
    is_locked: Option<bool>,
    measurements: Option<Measurements>,
}

#[derive(Debug, Deserialize)]
struct Classification {
    name: String,
    color: Option<[u8; 3]>,
    /// Packed 0xAARRGGBB, as a signed 32-bit value
    #[serde(rename = "colorRGB")]
    color_rgb: Option<i64>,
}

impl Classification {
    fn into_path_class(self) -> PathClass {
        let color = self.color.or_else(|| {
            self.color_rgb.map(|packed| {
                [
                    ((packed >> 16) & 0xff) as u8,
                    ((packed >> 8) & 0xff) as u8,
                    (packed & 0xff) as u8,
                ]
            })
        });
        PathClass {
            name: self.name,
            color,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Measurements {
    Map(BTreeMap<String, Value>),
    List(Vec<NamedMeasurement>),
}

#[derive(Debug, Deserialize)]
struct NamedMeasurement {
    name: String,
    #[serde(default)]
    value: Value,
}

impl Measurements {
    /// Non-numeric values (null, "NaN") are dropped
    fn into_map(self) -> BTreeMap<String, f64> {
        let pairs: Vec<(String, Value)> = match self {
            Measurements::Map(map) => map.into_iter().collect(),
            Measurements::List(list) => list.into_iter().map(|m| (m.name, m.value)).collect(),
        };
        pairs
            .into_iter()
            .filter_map(|(name, value)| value.as_f64().map(|v| (name, v)))
            .collect()
    }
}

fn document_features(document: Value) -> std::result::Result<Vec<Value>, String> {
    match document {
        Value::Array(features) => Ok(features),
        Value::Object(mut object) => {
            let kind = object
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string);
            match kind.as_deref() {
                Some("FeatureCollection") => match object.remove("features") {
                    Some(Value::Array(features)) => Ok(features),
                    Some(_) => Err("`features` is not an array".to_string()),
                    None => Ok(Vec::new()),
                },
                Some("Feature") => Ok(vec![Value::Object(object)]),
                Some(other) => Err(format!("unsupported GeoJSON type `{}`", other)),
                None => Err("missing GeoJSON `type`".to_string()),
            }
        }
        _ => Err("expected a GeoJSON object or array".to_string()),
    }
}

fn to_path_object(feature: Feature, geometry: Geometry) -> PathObject {
    let properties = feature.properties.unwrap_or_default();
    let id = feature.id.and_then(|id| match id {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    PathObject {
        id,
        kind: properties
            .object_type
            .as_deref()
            .map(ObjectKind::from_object_type)
            .unwrap_or(ObjectKind::Annotation),
        name: properties.name,
        classification: properties.classification.map(Classification::into_path_class),
        geometry,
        locked: properties.is_locked.unwrap_or(false),
        measurements: properties
            .measurements
            .map(Measurements::into_map)
            .unwrap_or_default(),
    }
}

/// Parse GeoJSON from `reader` into path objects.
///
/// Features without geometry are skipped; anything structurally wrong fails
/// the whole read.
pub fn read_objects<R: Read>(reader: R) -> std::result::Result<Vec<PathObject>, String> {
    let document: Value = serde_json::from_reader(reader).map_err(|e| e.to_string())?;
    let features = document_features(document)?;

    let mut objects = Vec::with_capacity(features.len());
    for (index, raw) in features.into_iter().enumerate() {
        let mut feature: Feature =
            serde_json::from_value(raw).map_err(|e| format!("feature {}: {}", index, e))?;
        match feature.geometry.take() {
            Some(geometry) => objects.push(to_path_object(feature, geometry)),
            None => warn!(index, "Skipping feature without geometry"),
        }
    }
    Ok(objects)
}

/// Read a result file from disk
pub fn load_result(path: &Path) -> Result<Vec<PathObject>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DetectionError::ResultFileMissing {
            path: path.to_path_buf(),
        },
        _ => DetectionError::Io(e),
    })?;

    read_objects(BufReader::new(file)).map_err(|reason| DetectionError::ResultParseFailure {
        path: path.to_path_buf(),
        reason,
    })
}

/// Parse `result_dir/file_name` and add its objects to `hierarchy`.
///
/// Returns the number of objects added. The hierarchy is untouched unless
/// the whole file parsed.
pub fn import(
    result_dir: &Path,
    file_name: &str,
    hierarchy: &dyn AnnotationHierarchy,
) -> Result<usize> {
    let path = result_dir.join(file_name);
    debug!(path = %path.display(), "Reading detection result");

    let objects = load_result(&path)?;
    let count = objects.len();
    hierarchy.add_objects(objects);

    info!(path = %path.display(), count, "Imported detection result");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::SharedHierarchy;
    use tempfile::tempdir;

    const COLLECTION: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "id": "6f1c2a4e-0000-4000-8000-000000000001",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0, 0], [10, 0], [10, 10], [0, 10], [0, 0]]]
                },
                "properties": {
                    "objectType": "annotation",
                    "classification": { "name": "glomerulus", "color": [255, 0, 0] },
                    "isLocked": true,
                    "measurements": { "score": 0.93, "radius": 5, "missing": null }
                }
            },
            {
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [4.5, 7.25] },
                "properties": {
                    "objectType": "detection",
                    "classification": { "name": "glomerulus", "colorRGB": -65536 },
                    "measurements": [{ "name": "score", "value": 0.5 }]
                }
            }
        ]
    }"#;

    #[test]
    fn test_read_feature_collection() {
        let objects = read_objects(COLLECTION.as_bytes()).unwrap();
        assert_eq!(objects.len(), 2);

        let first = &objects[0];
        assert_eq!(first.kind, ObjectKind::Annotation);
        assert_eq!(
            first.id.as_deref(),
            Some("6f1c2a4e-0000-4000-8000-000000000001")
        );
        assert!(first.locked);
        assert_eq!(
            first.classification,
            Some(PathClass {
                name: "glomerulus".to_string(),
                color: Some([255, 0, 0]),
            })
        );
        assert_eq!(first.measurements.get("score"), Some(&0.93));
        assert_eq!(first.measurements.get("radius"), Some(&5.0));
        assert!(!first.measurements.contains_key("missing"));
        assert_eq!(first.geometry.bounds(), Some((0.0, 0.0, 10.0, 10.0)));

        let second = &objects[1];
        assert_eq!(second.kind, ObjectKind::Detection);
        assert!(!second.locked);
        // 0xFFFF0000 packed
        assert_eq!(
            second.classification.as_ref().and_then(|c| c.color),
            Some([255, 0, 0])
        );
        assert_eq!(second.measurements.get("score"), Some(&0.5));
    }

    #[test]
    fn test_read_single_feature_and_array() {
        let single = r#"{"type": "Feature", "geometry": {"type": "Point", "coordinates": [1, 2]}, "properties": null}"#;
        let objects = read_objects(single.as_bytes()).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].kind, ObjectKind::Annotation);

        let array = format!("[{0}, {0}]", single);
        assert_eq!(read_objects(array.as_bytes()).unwrap().len(), 2);
    }

    #[test]
    fn test_null_geometry_is_skipped() {
        let doc = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "geometry": null, "properties": {}},
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [0, 0]}}
        ]}"#;
        assert_eq!(read_objects(doc.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_collection() {
        let doc = r#"{"type": "FeatureCollection", "features": []}"#;
        assert!(read_objects(doc.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_documents() {
        assert!(read_objects("{ not json".as_bytes()).is_err());
        assert!(read_objects(r#"{"type": "Topology"}"#.as_bytes()).is_err());
        assert!(read_objects("42".as_bytes()).is_err());
        let bad_geometry = r#"{"type": "Feature", "geometry": {"type": "Circle", "coordinates": [0, 0]}}"#;
        assert!(read_objects(bad_geometry.as_bytes()).is_err());
    }

    #[test]
    fn test_import_adds_objects() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("slide1.geojson"), COLLECTION).unwrap();

        let hierarchy = SharedHierarchy::new();
        let count = import(dir.path(), "slide1.geojson", &hierarchy).unwrap();
        assert_eq!(count, 2);
        assert_eq!(hierarchy.object_count(), 2);
    }

    #[test]
    fn test_import_missing_file() {
        let dir = tempdir().unwrap();
        let hierarchy = SharedHierarchy::new();

        let err = import(dir.path(), "slide1.geojson", &hierarchy).unwrap_err();
        assert!(matches!(err, DetectionError::ResultFileMissing { .. }));
        assert!(!err.is_fatal());
        assert_eq!(hierarchy.object_count(), 0);
    }

    #[test]
    fn test_import_parse_failure_leaves_hierarchy_untouched() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("slide1.geojson"), "{\"type\": \"FeatureCollection\", ").unwrap();

        let hierarchy = SharedHierarchy::new();
        let err = import(dir.path(), "slide1.geojson", &hierarchy).unwrap_err();
        assert!(matches!(err, DetectionError::ResultParseFailure { .. }));
        assert_eq!(hierarchy.object_count(), 0);
    }
}
