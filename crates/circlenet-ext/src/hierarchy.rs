//! Host object model: annotation objects and the hierarchy that owns them

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// GeoJSON position: x, y and optional further ordinates
pub type Position = Vec<f64>;

/// Geometry of a path object, in image pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl Geometry {
    /// Axis-aligned bounds as (min_x, min_y, max_x, max_y); `None` when empty
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let mut acc: Option<(f64, f64, f64, f64)> = None;
        self.visit_positions(&mut |p: &Position| {
            if p.len() < 2 {
                return;
            }
            let (x, y) = (p[0], p[1]);
            acc = Some(match acc {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        });
        acc
    }

    fn visit_positions(&self, f: &mut dyn FnMut(&Position)) {
        match self {
            Geometry::Point { coordinates } => f(coordinates),
            Geometry::MultiPoint { coordinates } | Geometry::LineString { coordinates } => {
                for p in coordinates {
                    f(p);
                }
            }
            Geometry::MultiLineString { coordinates } | Geometry::Polygon { coordinates } => {
                for p in coordinates.iter().flatten() {
                    f(p);
                }
            }
            Geometry::MultiPolygon { coordinates } => {
                for p in coordinates.iter().flatten().flatten() {
                    f(p);
                }
            }
            Geometry::GeometryCollection { geometries } => {
                for g in geometries {
                    g.visit_positions(f);
                }
            }
        }
    }
}

/// Kind of path object, mirroring the host's object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Annotation,
    Detection,
    Tile,
    Cell,
    TmaCore,
}

impl ObjectKind {
    /// Parse a GeoJSON `objectType`; unknown values are treated as annotations
    pub fn from_object_type(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "detection" => ObjectKind::Detection,
            "tile" => ObjectKind::Tile,
            "cell" => ObjectKind::Cell,
            "tma_core" | "tmacore" => ObjectKind::TmaCore,
            _ => ObjectKind::Annotation,
        }
    }
}

/// Classification attached to an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathClass {
    pub name: String,
    /// RGB display color
    pub color: Option<[u8; 3]>,
}

/// One object in the host hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathObject {
    pub id: Option<String>,
    pub kind: ObjectKind,
    pub name: Option<String>,
    pub classification: Option<PathClass>,
    pub geometry: Geometry,
    pub locked: bool,
    pub measurements: BTreeMap<String, f64>,
}

impl PathObject {
    pub fn annotation(geometry: Geometry) -> Self {
        PathObject {
            id: None,
            kind: ObjectKind::Annotation,
            name: None,
            classification: None,
            geometry,
            locked: false,
            measurements: BTreeMap::new(),
        }
    }
}

/// The host's annotation collection for one open image.
///
/// Implementations must tolerate being called from a worker thread; the
/// detection job is the only writer.
pub trait AnnotationHierarchy: Send + Sync {
    /// Add objects without touching existing ones
    fn add_objects(&self, objects: Vec<PathObject>);

    fn object_count(&self) -> usize;
}

/// Lock-guarded in-memory hierarchy
#[derive(Debug, Default)]
pub struct SharedHierarchy {
    objects: RwLock<Vec<PathObject>>,
}

impl SharedHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current objects
    pub fn snapshot(&self) -> Vec<PathObject> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AnnotationHierarchy for SharedHierarchy {
    fn add_objects(&self, objects: Vec<PathObject>) {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(objects);
    }

    fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
