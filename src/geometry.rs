// Per-route GeoJSON derived from the raw tables:
// route -> trips -> shapes gives the route's lines, route -> trips -> stop_times -> stops
// gives its stops. The derived table is replaced as a whole on every run.

use crate::error::{AtlasError, Result};
use crate::progress::ProgressSink;
use crate::store::{DatasetSession, Document, DocumentStore, Query, TableRef};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value as GeoValue};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

pub const GEOMETRY_TABLE: &str = "routes_geojson";

const ROUTES: &str = "routes";
const TRIPS: &str = "trips";
const SHAPES: &str = "shapes";
const STOP_TIMES: &str = "stop_times";
const STOPS: &str = "stops";

/// Feature member carrying the variant tag (`route` or `stop`).
pub const KIND_MEMBER: &str = "kind";

pub type Position = [f64; 2];

#[derive(Debug, Clone, PartialEq)]
pub enum RouteFeature {
    /// One line per distinct shape used by the route's trips, `[lon, lat]` in sequence order.
    Route {
        properties: Document,
        lines: Vec<Vec<Position>>,
    },
    Stop {
        properties: Document,
        position: Position,
    },
}

impl RouteFeature {
    pub fn kind(&self) -> &'static str {
        match self {
            RouteFeature::Route { .. } => "route",
            RouteFeature::Stop { .. } => "stop",
        }
    }

    pub fn properties(&self) -> &Document {
        match self {
            RouteFeature::Route { properties, .. } | RouteFeature::Stop { properties, .. } => {
                properties
            }
        }
    }

    pub fn to_feature(&self) -> Feature {
        let geometry = match self {
            RouteFeature::Route { lines, .. } => GeoValue::MultiLineString(
                lines
                    .iter()
                    .map(|line| line.iter().map(|p| p.to_vec()).collect())
                    .collect(),
            ),
            RouteFeature::Stop { position, .. } => GeoValue::Point(position.to_vec()),
        };

        let mut members = JsonObject::new();
        members.insert(KIND_MEMBER.to_string(), Value::from(self.kind()));

        Feature {
            bbox: None,
            geometry: Some(Geometry::new(geometry)),
            id: None,
            properties: Some(self.properties().clone()),
            foreign_members: Some(members),
        }
    }

    /// `None` for features without a known tag or whose geometry does not match it.
    pub fn from_feature(feature: &Feature) -> Option<Self> {
        let kind = feature.foreign_members.as_ref()?.get(KIND_MEMBER)?.as_str()?;
        let geometry = &feature.geometry.as_ref()?.value;
        let properties = feature.properties.clone().unwrap_or_default();

        match (kind, geometry) {
            ("route", GeoValue::MultiLineString(lines)) => Some(RouteFeature::Route {
                properties,
                lines: lines
                    .iter()
                    .map(|line| line.iter().filter_map(|p| to_position(p)).collect())
                    .collect(),
            }),
            ("stop", GeoValue::Point(point)) => Some(RouteFeature::Stop {
                properties,
                position: to_position(point)?,
            }),
            _ => None,
        }
    }
}

fn to_position(coords: &[f64]) -> Option<Position> {
    match coords {
        [lon, lat, ..] => Some([*lon, *lat]),
        _ => None,
    }
}

/// The feature collection stored for one route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteGeometry {
    pub route_id: String,
    pub features: Vec<RouteFeature>,
}

impl RouteGeometry {
    pub fn route(&self) -> Option<&RouteFeature> {
        self.features
            .iter()
            .find(|f| matches!(f, RouteFeature::Route { .. }))
    }

    pub fn stops(&self) -> impl Iterator<Item = &RouteFeature> {
        self.features
            .iter()
            .filter(|f| matches!(f, RouteFeature::Stop { .. }))
    }

    pub fn to_feature_collection(&self) -> FeatureCollection {
        let mut members = JsonObject::new();
        members.insert("id".to_string(), Value::from(self.route_id.clone()));

        FeatureCollection {
            bbox: None,
            features: self.features.iter().map(RouteFeature::to_feature).collect(),
            foreign_members: Some(members),
        }
    }

    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self.to_feature_collection())? {
            Value::Object(doc) => Ok(doc),
            _ => Err(AtlasError::Storage(
                "Feature collection did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn from_document(doc: Document) -> Result<Self> {
        let collection: FeatureCollection = serde_json::from_value(Value::Object(doc))?;
        let route_id = collection
            .foreign_members
            .as_ref()
            .and_then(|members| members.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| AtlasError::Storage("Route geometry without an id".to_string()))?
            .to_string();

        Ok(RouteGeometry {
            route_id,
            features: collection
                .features
                .iter()
                .filter_map(RouteFeature::from_feature)
                .collect(),
        })
    }
}

pub struct GeometryDeriver;

impl GeometryDeriver {
    /// Rebuilds the derived table from the current raw tables and returns what was stored.
    /// Every raw table is read once, whatever the number of routes.
    pub async fn derive(
        session: &DatasetSession,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<RouteGeometry>> {
        let store = session.store();
        let routes_table = session.table(ROUTES)?;
        let trips_table = session.table(TRIPS)?;
        let shapes_table = session.table(SHAPES)?;
        let stop_times_table = session.table(STOP_TIMES)?;
        let stops_table = session.table(STOPS)?;
        let all = Query::all();
        let by_sequence = Query::all().sort_by("shape_pt_sequence");

        let (routes, trips, shape_points, stop_times, stops) = futures::try_join!(
            store.find(&routes_table, &all),
            store.find(&trips_table, &all),
            store.find(&shapes_table, &by_sequence),
            store.find(&stop_times_table, &all),
            store.find(&stops_table, &all),
        )?;
        let index = RouteIndex::build(trips, &shape_points, &stop_times, stops);

        sink.notify("Calculating GeoJSON shapes");
        let geometries: Vec<RouteGeometry> = routes
            .into_iter()
            .filter_map(|route| match route.get("route_id").and_then(id_string) {
                Some(route_id) => Some(index.route_geometry(route_id, route, sink)),
                None => {
                    warn!(dataset = session.dataset(), "route without route_id, skipping");
                    None
                }
            })
            .collect();

        sink.notify("Creating route GeoJSON collection");
        let docs = geometries
            .iter()
            .map(RouteGeometry::to_document)
            .collect::<Result<Vec<_>>>()?;

        let table = session.table(GEOMETRY_TABLE)?;
        store.delete_all(&table).await?;
        if !docs.is_empty() {
            store.insert_many(&table, docs).await?;
        }

        info!(
            dataset = session.dataset(),
            routes = geometries.len(),
            "route geometry derived"
        );
        sink.notify("Finished GeoJSON calculations");
        Ok(geometries)
    }

    /// Reads the derived table. Empty means "not computed yet", not "no routes".
    pub async fn load(store: &dyn DocumentStore, dataset: &str) -> Result<Vec<RouteGeometry>> {
        store
            .find(&TableRef::new(dataset, GEOMETRY_TABLE)?, &Query::all())
            .await?
            .into_iter()
            .map(RouteGeometry::from_document)
            .collect()
    }
}

/// The raw tables keyed for per-route lookups.
struct RouteIndex {
    trips_by_route: HashMap<String, Vec<Document>>,
    /// Points already in sequence order.
    shapes: HashMap<String, Vec<Position>>,
    /// Distinct stop ids per route, in stop_times order.
    stops_by_route: HashMap<String, Vec<String>>,
    stops: HashMap<String, Document>,
}

impl RouteIndex {
    fn build(
        trips: Vec<Document>,
        shape_points: &[Document],
        stop_times: &[Document],
        stops: Vec<Document>,
    ) -> Self {
        let mut shapes: HashMap<String, Vec<Position>> = HashMap::new();
        for point in shape_points {
            if let Some(shape_id) = point.get("shape_id").and_then(id_string) {
                shapes
                    .entry(shape_id)
                    .or_default()
                    .extend(coordinates(point, "shape_pt_lon", "shape_pt_lat"));
            }
        }

        let mut route_of_trip: HashMap<String, String> = HashMap::new();
        let mut trips_by_route: HashMap<String, Vec<Document>> = HashMap::new();
        for trip in trips {
            let Some(route_id) = trip.get("route_id").and_then(id_string) else {
                continue;
            };
            if let Some(trip_id) = trip.get("trip_id").and_then(id_string) {
                route_of_trip.entry(trip_id).or_insert_with(|| route_id.clone());
            }
            trips_by_route.entry(route_id).or_default().push(trip);
        }

        let mut seen = HashSet::new();
        let mut stops_by_route: HashMap<String, Vec<String>> = HashMap::new();
        for stop_time in stop_times {
            let trip_id = stop_time.get("trip_id").and_then(id_string);
            let stop_id = stop_time.get("stop_id").and_then(id_string);
            if let (Some(trip_id), Some(stop_id)) = (trip_id, stop_id) {
                if let Some(route_id) = route_of_trip.get(&trip_id) {
                    if seen.insert((route_id.clone(), stop_id.clone())) {
                        stops_by_route.entry(route_id.clone()).or_default().push(stop_id);
                    }
                }
            }
        }

        let mut stops_by_id: HashMap<String, Document> = HashMap::new();
        for stop in stops {
            if let Some(stop_id) = stop.get("stop_id").and_then(id_string) {
                stops_by_id.entry(stop_id).or_insert(stop);
            }
        }

        RouteIndex {
            trips_by_route,
            shapes,
            stops_by_route,
            stops: stops_by_id,
        }
    }

    fn route_geometry(&self, route_id: String, route: Document, sink: &dyn ProgressSink) -> RouteGeometry {
        sink.notify(&format!("Working on {}", route_id));

        let trips = self
            .trips_by_route
            .get(&route_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        sink.notify(&format!("Found {} trips for {}", trips.len(), route_id));

        // a shape id without points still gives the route an (empty) line
        let lines: Vec<Vec<Position>> = distinct_ids(trips, "shape_id")
            .iter()
            .map(|shape_id| self.shapes.get(shape_id).cloned().unwrap_or_default())
            .collect();
        sink.notify(&format!("Found {} shapes for {}", lines.len(), route_id));

        let stop_ids = self
            .stops_by_route
            .get(&route_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        sink.notify(&format!("Found {} stops for {}", stop_ids.len(), route_id));

        let stop_features = stop_ids
            .iter()
            .filter_map(|stop_id| self.stops.get(stop_id))
            .filter_map(|stop| {
                let position = coordinates(stop, "stop_lon", "stop_lat")?;
                Some(RouteFeature::Stop {
                    properties: stop.clone(),
                    position,
                })
            });
        let mut features = vec![RouteFeature::Route {
            properties: route,
            lines,
        }];
        features.extend(stop_features);
        sink.notify(&format!("Finished calculating route {}", route_id));

        RouteGeometry { route_id, features }
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Distinct ids in `field`, first-seen order, ignoring null and empty strings.
fn distinct_ids(docs: &[Document], field: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in docs.iter().filter_map(|doc| doc.get(field).and_then(id_string)) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// `[lon, lat]` when both fields hold numbers.
fn coordinates(doc: &Document, lon_field: &str, lat_field: &str) -> Option<Position> {
    let lon = doc.get(lon_field)?.as_f64()?;
    let lat = doc.get(lat_field)?.as_f64()?;
    Some([lon, lat])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullSink;
    use crate::store::{MemoryStore, Sessions};
    use crate::testing::FaultyStore;
    use serde_json::json;
    use std::sync::Arc;

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    async fn seed(session: &DatasetSession, table: &str, values: Vec<Value>) {
        session
            .store()
            .insert_many(&session.table(table).unwrap(), docs(values))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shape_points_follow_sequence_not_storage_order() {
        let sessions = Sessions::new(Arc::new(MemoryStore::new()));
        let session = sessions.acquire("SC").await.unwrap();

        seed(&session, ROUTES, vec![json!({"route_id": "10", "route_color": "FF0000"})]).await;
        seed(&session, TRIPS, vec![
            json!({"route_id": "10", "trip_id": "t1", "shape_id": "s1"}),
            json!({"route_id": "10", "trip_id": "t2", "shape_id": "s1"}),
        ])
        .await;
        seed(&session, SHAPES, vec![
            json!({"shape_id": "s1", "shape_pt_lat": 3.0, "shape_pt_lon": -3.0, "shape_pt_sequence": 3}),
            json!({"shape_id": "s1", "shape_pt_lat": 1.0, "shape_pt_lon": -1.0, "shape_pt_sequence": 1}),
            json!({"shape_id": "s1", "shape_pt_lat": 2.0, "shape_pt_lon": -2.0, "shape_pt_sequence": 2}),
        ])
        .await;

        let derived = GeometryDeriver::derive(&session, &NullSink).await.unwrap();
        assert_eq!(derived.len(), 1);
        match derived[0].route() {
            Some(RouteFeature::Route { lines, properties }) => {
                assert_eq!(lines, &vec![vec![[-1.0, 1.0], [-2.0, 2.0], [-3.0, 3.0]]]);
                assert_eq!(properties["route_color"], "FF0000");
            }
            other => panic!("expected a route feature, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stops_without_coordinates_are_left_out() {
        let sessions = Sessions::new(Arc::new(MemoryStore::new()));
        let session = sessions.acquire("SC").await.unwrap();

        seed(&session, ROUTES, vec![json!({"route_id": "10"})]).await;
        seed(&session, TRIPS, vec![json!({"route_id": "10", "trip_id": "t1", "shape_id": ""})]).await;
        seed(&session, STOP_TIMES, vec![
            json!({"trip_id": "t1", "stop_id": "a", "stop_sequence": 1}),
            json!({"trip_id": "t1", "stop_id": "b", "stop_sequence": 2}),
            json!({"trip_id": "t1", "stop_id": "c", "stop_sequence": 3}),
            json!({"trip_id": "t1", "stop_id": "missing", "stop_sequence": 4}),
        ])
        .await;
        seed(&session, STOPS, vec![
            json!({"stop_id": "a", "stop_lat": 36.9, "stop_lon": -122.0}),
            json!({"stop_id": "b", "stop_lat": 36.9}),
            json!({"stop_id": "c", "stop_lat": 36.9, "stop_lon": ""}),
        ])
        .await;

        let derived = GeometryDeriver::derive(&session, &NullSink).await.unwrap();
        let stops: Vec<&RouteFeature> = derived[0].stops().collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].properties()["stop_id"], "a");

        // empty shape ids are ignored rather than producing an empty line
        match derived[0].route() {
            Some(RouteFeature::Route { lines, .. }) => assert!(lines.is_empty()),
            other => panic!("expected a route feature, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn route_without_trips_yields_empty_geometry() {
        let sessions = Sessions::new(Arc::new(MemoryStore::new()));
        let session = sessions.acquire("SC").await.unwrap();
        seed(&session, ROUTES, vec![json!({"route_id": "lonely"})]).await;

        let derived = GeometryDeriver::derive(&session, &NullSink).await.unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].route_id, "lonely");
        assert_eq!(derived[0].stops().count(), 0);
        assert!(matches!(
            derived[0].route(),
            Some(RouteFeature::Route { lines, .. }) if lines.is_empty()
        ));
    }

    #[tokio::test]
    async fn derived_table_is_replaced_and_reloadable() {
        let sessions = Sessions::new(Arc::new(MemoryStore::new()));
        let session = sessions.acquire("SC").await.unwrap();
        seed(&session, ROUTES, vec![json!({"route_id": "1"}), json!({"route_id": "2"})]).await;

        GeometryDeriver::derive(&session, &NullSink).await.unwrap();
        GeometryDeriver::derive(&session, &NullSink).await.unwrap();

        let stored = GeometryDeriver::load(session.store(), "SC").await.unwrap();
        assert_eq!(stored.len(), 2);
        let mut ids: Vec<&str> = stored.iter().map(|g| g.route_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn raw_tables_are_read_once_whatever_the_route_count() {
        let store = Arc::new(FaultyStore::new());
        let sessions = Sessions::new(store.clone());
        let session = sessions.acquire("SC").await.unwrap();

        seed(&session, ROUTES, (1..=6).map(|n| json!({"route_id": n.to_string()})).collect()).await;
        seed(&session, TRIPS, vec![
            json!({"route_id": "1", "trip_id": "t1", "shape_id": "s1"}),
            json!({"route_id": "2", "trip_id": "t2", "shape_id": "s1"}),
            json!({"route_id": "3", "trip_id": "t3", "shape_id": "s2"}),
        ])
        .await;
        seed(&session, SHAPES, vec![
            json!({"shape_id": "s1", "shape_pt_lat": 1.0, "shape_pt_lon": -1.0, "shape_pt_sequence": 1}),
            json!({"shape_id": "s2", "shape_pt_lat": 2.0, "shape_pt_lon": -2.0, "shape_pt_sequence": 1}),
        ])
        .await;
        seed(&session, STOP_TIMES, vec![
            json!({"trip_id": "t1", "stop_id": "a", "stop_sequence": 1}),
            json!({"trip_id": "t2", "stop_id": "a", "stop_sequence": 1}),
            json!({"trip_id": "t2", "stop_id": "b", "stop_sequence": 2}),
        ])
        .await;
        seed(&session, STOPS, vec![
            json!({"stop_id": "a", "stop_lat": 36.9, "stop_lon": -122.0}),
            json!({"stop_id": "b", "stop_lat": 37.0, "stop_lon": -122.1}),
        ])
        .await;

        let before = store.finds();
        let derived = GeometryDeriver::derive(&session, &NullSink).await.unwrap();
        assert_eq!(store.finds() - before, 5);

        assert_eq!(derived.len(), 6);
        let route = |id: &str| derived.iter().find(|g| g.route_id == id).unwrap();
        assert_eq!(route("1").stops().count(), 1);
        assert_eq!(route("2").stops().count(), 2);
        assert_eq!(route("6").stops().count(), 0);
        assert!(matches!(
            route("3").route(),
            Some(RouteFeature::Route { lines, .. }) if lines == &vec![vec![[-2.0, 2.0]]]
        ));
    }

    #[test]
    fn features_carry_an_explicit_kind() {
        let mut properties = Document::new();
        properties.insert("stop_id".to_string(), json!("a"));
        let geometry = RouteGeometry {
            route_id: "10".to_string(),
            features: vec![
                RouteFeature::Route {
                    properties: Document::new(),
                    lines: vec![vec![[-122.0, 36.9], [-122.1, 37.0]]],
                },
                RouteFeature::Stop {
                    properties,
                    position: [-122.0, 36.9],
                },
            ],
        };

        let doc = geometry.to_document().unwrap();
        assert_eq!(doc["type"], "FeatureCollection");
        assert_eq!(doc["id"], "10");
        assert_eq!(doc["features"][0][KIND_MEMBER], "route");
        assert_eq!(doc["features"][0]["geometry"]["type"], "MultiLineString");
        assert_eq!(doc["features"][1][KIND_MEMBER], "stop");
        assert_eq!(doc["features"][1]["geometry"]["coordinates"], json!([-122.0, 36.9]));

        assert_eq!(RouteGeometry::from_document(doc).unwrap(), geometry);
    }
}
