use actix_cors::Cors;
use actix_web::{http::StatusCode, web, App, HttpResponse, HttpServer, Result as ActixResult};
use contentdb_core::{Error, ErrorKind};
use contentdb_search::{IndexRequest, SearchRequest, SearchService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Deserialize)]
struct ContainerQuery {
    container: Option<u64>,
}

#[derive(Deserialize)]
struct InitializeLedgerRequest {
    #[serde(default)]
    column_names: Vec<String>,
    #[serde(default)]
    container: Option<u64>,
}

#[derive(Deserialize)]
struct DedupeRequest {
    scale: f64,
    #[serde(default)]
    container: Option<u64>,
}

#[derive(Serialize)]
struct ScaleSummary {
    scale: f64,
    rows: usize,
    duplicates: usize,
}

#[derive(Serialize)]
struct LedgerSummary {
    featureset: String,
    container: Option<u64>,
    generation: u64,
    column_names: Vec<String>,
    rows: usize,
    scales: Vec<ScaleSummary>,
}

pub struct RestApi;

impl RestApi {
    pub async fn start(service: Arc<SearchService>, port: u16) -> std::io::Result<()> {
        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .wrap(cors)
                .app_data(web::Data::new(service.clone()))
                .configure(Self::routes)
        })
        .bind(("0.0.0.0", port))?
        .run()
        .await
    }

    pub fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/featuresets", web::get().to(list_featuresets))
            .route("/images/{id}/featuresets", web::get().to(image_featuresets))
            .route("/featuresets/{fs}/search", web::post().to(search))
            .route("/featuresets/{fs}/images/{id}/index", web::post().to(calculate_and_index))
            .route(
                "/featuresets/{fs}/containers/{id}/index",
                web::post().to(calculate_and_index_container),
            )
            .route("/featuresets/{fs}/rebuild", web::post().to(rebuild))
            .route("/featuresets/{fs}/ledger", web::put().to(initialize_ledger))
            .route("/featuresets/{fs}/ledger", web::get().to(get_ledger))
            .route("/featuresets/{fs}/ledger", web::delete().to(delete_ledger))
            .route("/featuresets/{fs}/ledger/dedupe", web::post().to(dedupe_ledger));
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::LedgerExists | ErrorKind::RebuildInProgress => StatusCode::CONFLICT,
        ErrorKind::Format | ErrorKind::InvalidDimension | ErrorKind::InvalidRequest => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &Error) -> HttpResponse {
    let status = status_for(e.kind());
    if status.is_server_error() {
        warn!("Request failed: {}", e);
    }
    HttpResponse::build(status).json(serde_json::json!({
        "error": e.to_string(),
        "kind": e.kind(),
    }))
}

async fn list_featuresets(service: web::Data<Arc<SearchService>>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(service.registry()))
}

async fn image_featuresets(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<u64>,
) -> ActixResult<HttpResponse> {
    let image_id = path.into_inner();
    let (ctx, _cancel) = service.context();

    match service.featuresets_for_image(image_id, &ctx).await {
        Ok(sets) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "result": sets
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn search(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<String>,
    req: web::Json<SearchRequest>,
) -> ActixResult<HttpResponse> {
    let featureset = path.into_inner();
    let (ctx, _cancel) = service.context();

    match service.search(&featureset, &req, &ctx).await {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn calculate_and_index(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<(String, u64)>,
    req: Option<web::Json<IndexRequest>>,
) -> ActixResult<HttpResponse> {
    let (featureset, image_id) = path.into_inner();
    let mut request = req
        .map(|r| r.into_inner())
        .unwrap_or_else(|| IndexRequest::new(image_id));
    request.image_id = image_id;
    let (ctx, _cancel) = service.context();

    match service.calculate_and_index(&featureset, &request, &ctx).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn calculate_and_index_container(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<(String, u64)>,
    req: Option<web::Json<IndexRequest>>,
) -> ActixResult<HttpResponse> {
    let (featureset, container_id) = path.into_inner();
    let request = req
        .map(|r| r.into_inner())
        .unwrap_or_else(|| IndexRequest::new(0));
    let (ctx, _cancel) = service.context();

    match service
        .calculate_and_index_container(&featureset, container_id, &request, &ctx)
        .await
    {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn rebuild(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let featureset = path.into_inner();
    let (ctx, _cancel) = service.context();

    match service.rebuild_index(&featureset, &ctx).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn initialize_ledger(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<String>,
    req: web::Json<InitializeLedgerRequest>,
) -> ActixResult<HttpResponse> {
    let featureset = path.into_inner();
    let req = req.into_inner();

    match service
        .storage()
        .initialize(&featureset, req.column_names, req.container)
    {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "result": true
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn get_ledger(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<String>,
    query: web::Query<ContainerQuery>,
) -> ActixResult<HttpResponse> {
    let featureset = path.into_inner();

    let generation = match service.storage().retrieve(&featureset, query.container) {
        Ok(generation) => generation,
        Err(e) => return Ok(error_response(&e)),
    };

    let scales = generation
        .iter()
        .map(|(scale, rows)| ScaleSummary {
            scale: scale.0,
            rows: rows.len(),
            duplicates: generation.duplicate_count(scale),
        })
        .collect();
    let summary = LedgerSummary {
        featureset,
        container: query.container,
        generation: generation.number(),
        column_names: generation.column_names().to_vec(),
        rows: generation.len(),
        scales,
    };
    Ok(HttpResponse::Ok().json(summary))
}

async fn delete_ledger(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<String>,
    query: web::Query<ContainerQuery>,
) -> ActixResult<HttpResponse> {
    let featureset = path.into_inner();

    match service.storage().drop_ledger(&featureset, query.container) {
        Ok(true) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "result": true
        }))),
        Ok(false) => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "error": "Ledger not found",
            "kind": ErrorKind::NotFound,
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn dedupe_ledger(
    service: web::Data<Arc<SearchService>>,
    path: web::Path<String>,
    req: web::Json<DedupeRequest>,
) -> ActixResult<HttpResponse> {
    let featureset = path.into_inner();

    match service
        .storage()
        .remove_duplicates(req.scale, &featureset, req.container)
    {
        Ok(removed) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "removed": removed
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}
