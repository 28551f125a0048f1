// HTTP API over the feed registry, the ingestion pipeline and the stored tables

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::geometry::GeometryDeriver;
use crate::ingest::Ingestor;
use crate::normalize::to_csv;
use crate::progress::ProgressHub;
use crate::registry::{Feed, FeedRegistry};
use crate::store::{DocumentStore, Query, Sessions, TableRef};
use crate::sync::TableMeta;
use actix_cors::Cors;
use actix_files as fs;
use actix_web::http::StatusCode;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn DocumentStore>,
    registry: Arc<FeedRegistry>,
    ingestor: Arc<Ingestor>,
    hub: Arc<ProgressHub>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Result<Self> {
        let sessions = Arc::new(Sessions::new(Arc::clone(&store)));
        Ok(AppState {
            registry: Arc::new(FeedRegistry::new(Arc::clone(&store))?),
            ingestor: Arc::new(Ingestor::new(sessions, config)?),
            hub: Arc::new(ProgressHub::new()),
            store,
        })
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T, feed_id: Option<&str>) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp(),
            sources: feed_id.map(|id| vec![id.to_string()]).unwrap_or_default(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().timestamp(),
            sources: vec![],
        }
    }
}

fn status_for(err: &AtlasError) -> StatusCode {
    match err {
        AtlasError::FeedNotFound(_) | AtlasError::TableNotFound { .. } => StatusCode::NOT_FOUND,
        AtlasError::FeedExists(_) => StatusCode::CONFLICT,
        AtlasError::InvalidFeed(_) | AtlasError::InvalidName(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        AtlasError::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: AtlasError) -> HttpResponse {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("request failed: {}", err);
    } else {
        warn!("request rejected: {}", err);
    }
    HttpResponse::build(status).json(ApiResponse::<()>::error(err.to_string()))
}

fn respond<T: Serialize>(result: Result<T>, feed_id: Option<&str>) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Ok().json(ApiResponse::success(data, feed_id)),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Feeds
// ============================================================================

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "gtfs-atlas",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn list_feeds(state: web::Data<AppState>) -> HttpResponse {
    respond(state.registry.list().await, None)
}

async fn create_feed(state: web::Data<AppState>, body: web::Json<Feed>) -> HttpResponse {
    let feed = match state.registry.insert(body.into_inner()).await {
        Ok(feed) => feed,
        Err(e) => return error_response(e),
    };

    info!(feed = %feed.id, "new feed registered, starting ingestion");
    let sink = state.hub.sink(&feed.id);
    match state.ingestor.ingest(&feed.id, &feed.url, sink.as_ref()).await {
        Ok(report) => {
            HttpResponse::Created().json(ApiResponse::success(report, Some(feed.id.as_str())))
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    url: Option<String>,
}

async fn refresh_feed(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<RefreshRequest>>,
) -> HttpResponse {
    let feed_id = path.into_inner();
    let request = body.map(web::Json::into_inner).unwrap_or_default();

    let feed = match request.url {
        Some(url) => state.registry.update_url(&feed_id, &url).await,
        None => state.registry.get(&feed_id).await,
    };
    let feed = match feed {
        Ok(feed) => feed,
        Err(e) => return error_response(e),
    };

    let sink = state.hub.sink(&feed.id);
    respond(
        state.ingestor.ingest(&feed.id, &feed.url, sink.as_ref()).await,
        Some(feed.id.as_str()),
    )
}

// ============================================================================
// Stored data
// ============================================================================

async fn get_routes(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let feed_id = path.into_inner();
    let result = async {
        state.registry.get(&feed_id).await?;
        let routes = GeometryDeriver::load(state.store.as_ref(), &feed_id).await?;
        Ok::<_, AtlasError>(
            routes
                .iter()
                .map(|route| route.to_feature_collection())
                .collect::<Vec<_>>(),
        )
    }
    .await;
    respond(result, Some(feed_id.as_str()))
}

async fn list_tables(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let feed_id = path.into_inner();
    let result = async {
        state.registry.get(&feed_id).await?;
        TableMeta::load_all(state.store.as_ref(), &feed_id).await
    }
    .await;
    respond(result, Some(feed_id.as_str()))
}

async fn export_table(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (feed_id, table) = path.into_inner();
    let result = async {
        state.registry.get(&feed_id).await?;
        let meta = TableMeta::load(state.store.as_ref(), &feed_id, &table)
            .await?
            .ok_or_else(|| AtlasError::TableNotFound {
                dataset: feed_id.clone(),
                table: table.clone(),
            })?;
        let rows = state
            .store
            .find(&TableRef::new(&feed_id, &table)?, &Query::all())
            .await?;
        to_csv(&meta.header, &rows)
    }
    .await;

    match result {
        Ok(csv) => HttpResponse::Ok()
            .content_type("text/csv; charset=utf-8")
            .body(csv),
        Err(e) => error_response(e),
    }
}

/// Server-sent events; one `data:` line per progress message of the feed.
async fn progress_stream(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let feed_id = path.into_inner();
    if let Err(e) = state.registry.get(&feed_id).await {
        return error_response(e);
    }

    // lagged subscribers just miss messages
    let events = BroadcastStream::new(state.hub.subscribe(&feed_id)).filter_map(|message| {
        message
            .ok()
            .map(|text| Ok::<_, Infallible>(web::Bytes::from(format!("data: {}\n\n", text))))
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(events)
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::scope("/api/feeds")
            .route("", web::get().to(list_feeds))
            .route("", web::post().to(create_feed))
            .route("/{id}", web::patch().to(refresh_feed))
            .route("/{id}/routes", web::get().to(get_routes))
            .route("/{id}/tables", web::get().to(list_tables))
            .route("/{id}/tables/{table}.csv", web::get().to(export_table))
            .route("/{id}/progress", web::get().to(progress_stream)),
    );
}

pub async fn run_server(config: Config, store: Arc<dyn DocumentStore>) -> Result<()> {
    let state = AppState::new(store, &config)?;
    let static_dir: Option<PathBuf> = config.static_dir.clone();

    info!(bind = %config.bind, port = config.port, "starting HTTP server");
    if let Some(dir) = &static_dir {
        info!(dir = %dir.display(), "serving static files");
    }

    HttpServer::new(move || {
        let mut app = App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure);
        if let Some(dir) = &static_dir {
            app = app.service(fs::Files::new("/", dir.clone()).index_file("index.html"));
        }

        app.wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
    })
    .bind((config.bind.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::build_zip;
    use crate::progress::NullSink;
    use crate::store::MemoryStore;
    use actix_web::test;
    use bytes::Bytes;
    use serde_json::Value;

    fn state() -> AppState {
        AppState::new(Arc::new(MemoryStore::new()), &Config::default()).unwrap()
    }

    async fn register(state: &AppState, id: &str) {
        state
            .registry()
            .insert(Feed {
                id: id.to_string(),
                name: "Santa Cruz Metro".to_string(),
                url: "http://127.0.0.1:9/gtfs.zip".to_string(),
            })
            .await
            .unwrap();
    }

    #[actix_web::test]
    async fn health_and_empty_feed_list() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());

        let body: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/feeds").to_request(),
        )
        .await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], serde_json::json!([]));
    }

    #[actix_web::test]
    async fn error_statuses() {
        let state = state();
        register(&state, "SC").await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let missing = test::TestRequest::get().uri("/api/feeds/XX/routes").to_request();
        assert_eq!(test::call_service(&app, missing).await.status(), StatusCode::NOT_FOUND);

        let duplicate = test::TestRequest::post()
            .uri("/api/feeds")
            .set_json(serde_json::json!({"id": "SC", "name": "Again", "url": "https://x.org/a.zip"}))
            .to_request();
        assert_eq!(test::call_service(&app, duplicate).await.status(), StatusCode::CONFLICT);

        let invalid = test::TestRequest::post()
            .uri("/api/feeds")
            .set_json(serde_json::json!({"id": "../SC", "name": "Bad", "url": "https://x.org/a.zip"}))
            .to_request();
        assert_eq!(
            test::call_service(&app, invalid).await.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let unreachable = test::TestRequest::patch().uri("/api/feeds/SC").to_request();
        assert_eq!(test::call_service(&app, unreachable).await.status(), StatusCode::BAD_GATEWAY);

        let no_table = test::TestRequest::get().uri("/api/feeds/SC/tables/stops.csv").to_request();
        assert_eq!(test::call_service(&app, no_table).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn serves_ingested_tables_and_routes() {
        let state = state();
        register(&state, "SC").await;
        state
            .ingestor()
            .ingest_bytes(
                "SC",
                build_zip(&[
                    ("routes.txt", "route_id,route_long_name\n10,\"Downtown, Beach\"\n"),
                    ("stops.txt", "stop_id,stop_lat,stop_lon\n1,36.97,-122.03\n"),
                ]),
                &NullSink,
            )
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let tables: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/feeds/SC/tables").to_request(),
        )
        .await;
        let names: Vec<&str> = tables["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["table"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["routes", "stops"]);

        let csv = test::call_and_read_body(
            &app,
            test::TestRequest::get().uri("/api/feeds/SC/tables/routes.csv").to_request(),
        )
        .await;
        assert_eq!(csv, "route_id,route_long_name\n10,\"Downtown, Beach\"\n");

        let routes: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/feeds/SC/routes").to_request(),
        )
        .await;
        assert_eq!(routes["sources"], serde_json::json!(["SC"]));
        assert_eq!(routes["data"][0]["type"], "FeatureCollection");
        assert_eq!(routes["data"][0]["id"], "10");
    }
}
