//! Marksheet Extractor - OCR + LLM structured extraction server for academic
//! marksheets, with per-field confidence scoring.

mod confidence;
mod config;
mod error;
mod extractor;
mod fallback;
mod llm;
mod normalize;
mod ocr;
mod pipeline;
mod schema;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use config::{PatternTables, Settings};
use error::ExtractionError;
use extractor::{LlmExtractor, StructuredExtractor};
use fallback::FallbackExtractor;
use llm::GeminiClient;
use ocr::{TesseractEngine, TextRecognizer};
use pipeline::{BatchFile, Pipeline};
use schema::ExtractionRecord;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    engine: Arc<TesseractEngine>,
    settings: Arc<Settings>,
    llm_configured: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marksheet_extractor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let tables = PatternTables::load_or_default(std::path::Path::new("configs/patterns.json"))?;

    let engine = Arc::new(TesseractEngine::new(&settings));
    if engine.is_available().await {
        info!("OCR engine available at '{}'", settings.tesseract_path);
    } else {
        warn!(
            "OCR engine not found at '{}'; raster documents will yield empty records",
            settings.tesseract_path
        );
    }

    // A missing model key is not fatal: the server runs fallback-only.
    let llm: Option<Arc<dyn StructuredExtractor>> = match GeminiClient::from_env(settings.llm_timeout) {
        Ok(client) => {
            info!("Gemini client initialized");
            Some(Arc::new(LlmExtractor::new(client)))
        }
        Err(e) => {
            warn!("No usable model configuration ({}), running fallback-only", e);
            None
        }
    };

    let fallback: Arc<dyn StructuredExtractor> = Arc::new(FallbackExtractor::new(tables));
    let pipeline = Arc::new(Pipeline::new(
        engine.clone(),
        llm.clone(),
        fallback,
        settings.clone(),
    ));

    // The batch endpoint can carry a full batch of maximum-size files plus
    // multipart framing overhead.
    let body_limit =
        settings.max_file_size as usize * settings.max_batch_size + 1024 * 1024;

    let state = AppState {
        pipeline,
        engine,
        settings: Arc::new(settings.clone()),
        llm_configured: llm.is_some(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract))
        .route("/batch-extract", post(batch_extract))
        .route("/debug-ocr", post(debug_ocr))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&settings.allowed_origins))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
    info!("Server listening on http://0.0.0.0:8000");
    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ocr_available: bool,
    llm_configured: bool,
}

/// Health check with component availability.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ocr_available: state.engine.is_available().await,
        llm_configured: state.llm_configured,
    })
}

/// Extract structured data from one uploaded marksheet.
async fn extract(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ExtractionRecord>, (StatusCode, String)> {
    let mut files = read_uploads(multipart).await?;
    if files.len() != 1 {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("expected exactly one file, got {}", files.len()),
        ));
    }
    let file = files.remove(0);
    info!(
        "Received file: {} ({}, {} bytes)",
        file.filename,
        file.mime,
        file.data.len()
    );

    let record = state
        .pipeline
        .run(file.data, &file.mime)
        .await
        .map_err(error_response)?;
    Ok(Json(record))
}

#[derive(serde::Serialize)]
struct BatchItem {
    filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<ExtractionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(serde::Serialize)]
struct BatchResponse {
    total: usize,
    succeeded: usize,
    failed: usize,
    results: Vec<BatchItem>,
}

/// Extract a batch of marksheets. Per-file failures are reported in place;
/// only an invalid batch as a whole fails the request.
async fn batch_extract(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<BatchResponse>, (StatusCode, String)> {
    let files = read_uploads(multipart).await?;
    if files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no files uploaded".to_string()));
    }
    info!("Received batch of {} file(s)", files.len());

    let batch: Vec<BatchFile> = files
        .into_iter()
        .map(|f| BatchFile {
            filename: f.filename,
            mime: f.mime,
            data: f.data,
        })
        .collect();

    let outcomes = state
        .pipeline
        .run_batch_named(batch)
        .await
        .map_err(error_response)?;

    let mut results = Vec::with_capacity(outcomes.len());
    let mut succeeded = 0;
    for (filename, outcome) in outcomes {
        match outcome {
            Ok(record) => {
                succeeded += 1;
                results.push(BatchItem {
                    filename,
                    record: Some(record),
                    error: None,
                });
            }
            Err(e) => results.push(BatchItem {
                filename,
                record: None,
                error: Some(e.to_string()),
            }),
        }
    }

    Ok(Json(BatchResponse {
        total: results.len(),
        succeeded,
        failed: results.len() - succeeded,
        results,
    }))
}

#[derive(serde::Serialize)]
struct DebugOcrPage {
    page: u32,
    text: String,
    confidence: f64,
}

#[derive(serde::Serialize)]
struct DebugOcrResponse {
    pages: Vec<DebugOcrPage>,
}

/// Run only the normalize and OCR stages, returning the recognized text per
/// page. Diagnostic aid for tuning preprocessing against real scans.
async fn debug_ocr(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DebugOcrResponse>, (StatusCode, String)> {
    let mut files = read_uploads(multipart).await?;
    if files.len() != 1 {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("expected exactly one file, got {}", files.len()),
        ));
    }
    let file = files.remove(0);

    if file.data.len() as u64 > state.settings.max_file_size {
        return Err(error_response(ExtractionError::FileTooLarge {
            size: file.data.len() as u64,
            max: state.settings.max_file_size,
        }));
    }
    if !state.settings.allowed_file_types.iter().any(|t| *t == file.mime) {
        return Err(error_response(ExtractionError::UnsupportedFileType(
            file.mime,
        )));
    }

    let mime = file.mime.clone();
    let pages = tokio::task::spawn_blocking(move || normalize::normalize(&file.data, &mime))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("preprocessing crashed: {}", e),
            )
        })?
        .map_err(error_response)?;

    let mut out = Vec::with_capacity(pages.len());
    for page in &pages {
        let ocr = state.engine.recognize_page(page).await;
        out.push(DebugOcrPage {
            page: page.page_num,
            text: ocr.text,
            confidence: ocr.confidence,
        });
    }
    Ok(Json(DebugOcrResponse { pages: out }))
}

// ============================================================================
// Helper functions
// ============================================================================

struct UploadedFile {
    filename: String,
    mime: String,
    data: Vec<u8>,
}

/// Read every `file`/`files` field from a multipart body. The MIME type
/// comes from the part header, or from the filename extension when the
/// client didn't set one.
async fn read_uploads(mut multipart: Multipart) -> Result<Vec<UploadedFile>, (StatusCode, String)> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        if !matches!(field.name(), Some("file") | Some("files")) {
            continue;
        }
        let filename = field.file_name().unwrap_or("document").to_string();
        let declared = field.content_type().map(|c| c.to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e)))?
            .to_vec();
        let mime = declared.unwrap_or_else(|| mime_from_filename(&filename).to_string());
        files.push(UploadedFile {
            filename,
            mime,
            data,
        });
    }
    Ok(files)
}

fn mime_from_filename(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

fn error_response(err: ExtractionError) -> (StatusCode, String) {
    (err.status_code(), err.to_string())
}
