use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{
    get, http::StatusCode, post, web, App, HttpResponse, HttpServer, ResponseError, Result,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::error::JobError;
use crate::models::{build_upload_path, JobSnapshot};
use crate::service::JobService;

pub struct AppState {
    pub service: Arc<JobService>,
    pub upload_dir: PathBuf,
}

#[derive(Serialize)]
struct StatusResponse {
    jobs: Vec<JobSnapshot>,
}

#[derive(Deserialize)]
struct SubmitParams {
    job_id: String,
    filename: Option<String>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorType {
    DuplicateJobId,
    UploadError,
    InvalidRequest,
    NotFound,
    NotReady,
    ResultMissing,
    Internal,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorType,
    description: String,
}

#[derive(Debug)]
pub struct ApiError(JobError);

impl ApiError {
    fn kind(&self) -> ErrorType {
        match &self.0 {
            JobError::DuplicateJobId(_) => ErrorType::DuplicateJobId,
            JobError::Upload(_) => ErrorType::UploadError,
            JobError::InvalidRequest(_) => ErrorType::InvalidRequest,
            JobError::NotFound(_) => ErrorType::NotFound,
            JobError::NotReady(_) => ErrorType::NotReady,
            JobError::ResultMissing { .. } => ErrorType::ResultMissing,
            JobError::QueueClosed | JobError::Transition(_) | JobError::Io(_) => ErrorType::Internal,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        ApiError(err)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorType::DuplicateJobId
            | ErrorType::UploadError
            | ErrorType::InvalidRequest
            | ErrorType::NotReady => StatusCode::BAD_REQUEST,
            ErrorType::NotFound | ErrorType::ResultMissing => StatusCode::NOT_FOUND,
            ErrorType::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.kind(),
            description: self.0.to_string(),
        })
    }
}

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[get("/")]
async fn list_jobs(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse {
        jobs: data.service.list(),
    })
}

#[get("/job_status/{job_id}")]
async fn job_status(
    data: web::Data<AppState>,
    job_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let snapshot = data.service.status(&job_id)?;
    Ok(HttpResponse::Ok().json(snapshot))
}

async fn store_upload(path: &Path, mut payload: web::Payload) -> Result<(), JobError> {
    let mut file = fs::File::create(path).await?;

    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| JobError::Upload(e.to_string()))?;
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    Ok(())
}

#[post("/process")]
async fn submit(
    data: web::Data<AppState>,
    params: web::Query<SubmitParams>,
    payload: web::Payload,
) -> Result<HttpResponse, ApiError> {
    let job_id = params.job_id.trim();
    if job_id.is_empty() {
        return Err(JobError::InvalidRequest("job_id must not be empty".to_owned()).into());
    }

    // Cheap early rejection; `submit` re-checks atomically.
    if data.service.is_used(job_id) {
        error!(job_id, "job id has been used before");
        return Err(JobError::DuplicateJobId(job_id.to_owned()).into());
    }

    let file_name = params.filename.as_deref().unwrap_or("upload.csv");
    let path = build_upload_path(&data.upload_dir, file_name);

    if let Err(err) = store_upload(&path, payload).await {
        error!(job_id, error = %err, "upload failed");
        let _ = fs::remove_file(&path).await;
        let err = match err {
            JobError::Upload(_) => err,
            other => JobError::Upload(other.to_string()),
        };
        return Err(err.into());
    }

    if fs::metadata(&path).await.is_err() {
        error!(job_id, path = %path.display(), "CSV file not found after upload");
        return Err(JobError::Upload("CSV file not found after upload".to_owned()).into());
    }

    info!(job_id, file_name, path = %path.display(), "received upload");

    match data.service.submit(job_id, path.clone()) {
        Ok(receipt) => Ok(HttpResponse::Ok().json(receipt)),
        Err(err) => {
            let _ = fs::remove_file(&path).await;
            Err(err.into())
        }
    }
}

async fn serve_result(
    data: &AppState,
    job_id: &str,
    expected_name: Option<&str>,
) -> Result<HttpResponse, ApiError> {
    let path = data.service.result_file(job_id, expected_name).await?;

    let file = fs::File::open(&path).await.map_err(|err| match err.kind() {
        ErrorKind::NotFound => JobError::ResultMissing {
            job_id: job_id.to_owned(),
            path: path.clone(),
        },
        _ => JobError::Io(err),
    })?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result.csv".to_owned());

    info!(job_id, path = %path.display(), "serving download");

    Ok(HttpResponse::Ok()
        .content_type("text/csv")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(file_name)],
        })
        .streaming(ReaderStream::new(file)))
}

#[get("/download/{job_id}")]
async fn download(
    data: web::Data<AppState>,
    job_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    serve_result(&data, &job_id, None).await
}

#[get("/download/{job_id}/{file_name}")]
async fn download_named(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (job_id, file_name) = path.into_inner();
    serve_result(&data, &job_id, Some(&file_name)).await
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(list_jobs)
        .service(job_status)
        .service(submit)
        .service(download)
        .service(download_named);
}

pub async fn start_web_server(state: AppState, port: u16) -> std::io::Result<()> {
    let app_state = web::Data::new(state);

    info!("Starting web server at 0.0.0.0:{port}...");

    HttpServer::new(move || App::new().app_data(app_state.clone()).configure(routes))
        .bind(("0.0.0.0", port))?
        .run()
        .await
}
