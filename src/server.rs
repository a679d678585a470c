use crate::{
    error::{Operation, ServiceError, ServiceResult},
    ingest,
    staging::{StagedUpload, UploadWriter},
    store::{Row, Store},
    table::{self, UpdateRequest},
};
use bytes::{Buf, Bytes};
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::{convert::Infallible, path::PathBuf, sync::Arc};
use tracing::{debug, error, warn};
use warp::{
    http::StatusCode,
    multipart::{FormData, Part},
    reply::{Json, WithStatus},
    Filter, Rejection, Reply,
};

/// Largest JSON body accepted by `PUT /table/:name`.
pub const MAX_JSON_BYTES: u64 = 1024 * 1024;

const TABLE_NAME_FIELD: &str = "tableName";
const FILE_FIELD: &str = "file";

/// Shared handles every route needs.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub upload_dir: Arc<PathBuf>,
    pub max_upload_bytes: u64,
}

impl AppState {
    pub fn new(store: Arc<Store>, upload_dir: impl Into<PathBuf>, max_upload_bytes: u64) -> Self {
        AppState {
            store,
            upload_dir: Arc::new(upload_dir.into()),
            max_upload_bytes,
        }
    }
}

#[derive(Serialize)]
struct MessageBody {
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct TableBody {
    table: String,
    rows: Vec<Row>,
}

type JsonReply = WithStatus<Json>;

fn ok_message(message: String) -> JsonReply {
    warp::reply::with_status(warp::reply::json(&MessageBody { message }), StatusCode::OK)
}

fn error_body(message: &str, status: StatusCode) -> JsonReply {
    warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            error: message.to_string(),
        }),
        status,
    )
}

fn error_reply(err: &ServiceError, op: Operation) -> JsonReply {
    if err.status().is_server_error() {
        error!(operation = ?op, error = %err, "request failed");
    } else {
        warn!(operation = ?op, error = %err, "rejected request");
    }
    error_body(err.public_message(op), err.status())
}

/// Run store work on the blocking pool and turn the outcome into a reply.
async fn run_blocking<T, F, R>(op: Operation, work: F, render: R) -> JsonReply
where
    T: Send + 'static,
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    R: FnOnce(T) -> JsonReply,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => render(value),
        Ok(Err(err)) => error_reply(&err, op),
        Err(join_err) => {
            error!(operation = ?op, error = %join_err, "blocking task failed");
            error_body("Internal server error.", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Every route of the service, with CORS and per-request tracing applied.
pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path::end()
        .and(warp::get())
        .map(|| "Server is running");

    let upload = warp::path("upload")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::multipart::form().max_length(state.max_upload_bytes))
        .and_then(upload_csv);

    let read = warp::path!("table" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(read_table);

    let clear = warp::path!("table" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(clear_table);

    let update = warp::path!("table" / String)
        .and(warp::put())
        .and(with_state(state))
        .and(warp::body::content_length_limit(MAX_JSON_BYTES))
        .and(warp::body::bytes())
        .and_then(update_table);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE"])
        .allow_header("content-type");

    health
        .or(upload)
        .or(read)
        .or(clear)
        .or(update)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::trace::request())
}

/// Fields collected from the upload form.
#[derive(Default)]
struct UploadForm {
    table_name: Option<String>,
    file: Option<StagedUpload>,
}

async fn upload_csv(state: AppState, form: FormData) -> Result<impl Reply, Rejection> {
    let form = match read_upload_form(&state.upload_dir, form).await {
        Ok(form) => form,
        Err(err) => return Ok(error_reply(&err, Operation::Upload)),
    };

    let store = state.store.clone();
    let reply = run_blocking(
        Operation::Upload,
        move || ingest::ingest(&store, form.table_name.as_deref(), form.file),
        |report| ok_message(report.message()),
    )
    .await;
    Ok(reply)
}

async fn read_upload_form(dir: &std::path::Path, form: FormData) -> ServiceResult<UploadForm> {
    let mut parts = Box::pin(form);
    let mut out = UploadForm::default();

    while let Some(part) = parts.try_next().await.map_err(malformed)? {
        let field = part.name().to_string();
        match field.as_str() {
            TABLE_NAME_FIELD => {
                let raw = read_text_part(part).await?;
                out.table_name = Some(raw);
            }
            FILE_FIELD if part.filename().is_some() => {
                out.file = Some(stage_file_part(dir, part).await?);
            }
            other => debug!(field = other, "ignoring form field"),
        }
    }
    Ok(out)
}

fn malformed(err: warp::Error) -> ServiceError {
    ServiceError::Validation(format!("malformed multipart body: {err}"))
}

async fn read_text_part(part: Part) -> ServiceResult<String> {
    let mut data = Box::pin(part.stream());
    let mut text = Vec::new();
    while let Some(mut buf) = data.try_next().await.map_err(malformed)? {
        while buf.has_remaining() {
            let chunk = buf.chunk();
            let n = chunk.len();
            text.extend_from_slice(chunk);
            buf.advance(n);
        }
    }
    Ok(String::from_utf8_lossy(&text).into_owned())
}

async fn stage_file_part(dir: &std::path::Path, part: Part) -> ServiceResult<StagedUpload> {
    let mut writer = UploadWriter::create(dir)?;
    let mut data = Box::pin(part.stream());
    while let Some(mut buf) = data.try_next().await.map_err(malformed)? {
        while buf.has_remaining() {
            let chunk = buf.chunk();
            let n = chunk.len();
            writer.write_chunk(chunk).await?;
            buf.advance(n);
        }
    }
    Ok(writer.finish().await?)
}

/// Table names arrive percent-encoded in the path (`my%20ledger`).
fn decode_table_name(raw: &str) -> ServiceResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|name| name.into_owned())
        .map_err(|_| ServiceError::InvalidIdentifier(raw.to_string()))
}

async fn read_table(raw: String, state: AppState) -> Result<impl Reply, Rejection> {
    let name = match decode_table_name(&raw) {
        Ok(name) => name,
        Err(err) => return Ok(error_reply(&err, Operation::Read)),
    };
    let store = state.store.clone();
    let table_name = name.clone();
    let reply = run_blocking(
        Operation::Read,
        move || table::read_all(&store, &table_name),
        |rows| {
            warp::reply::with_status(
                warp::reply::json(&TableBody { table: name, rows }),
                StatusCode::OK,
            )
        },
    )
    .await;
    Ok(reply)
}

async fn clear_table(raw: String, state: AppState) -> Result<impl Reply, Rejection> {
    let name = match decode_table_name(&raw) {
        Ok(name) => name,
        Err(err) => return Ok(error_reply(&err, Operation::Clear)),
    };
    let store = state.store.clone();
    let table_name = name.clone();
    let reply = run_blocking(
        Operation::Clear,
        move || table::clear(&store, &table_name),
        |deleted| ok_message(format!("Cleared {deleted} rows from '{name}'")),
    )
    .await;
    Ok(reply)
}

async fn update_table(raw: String, state: AppState, body: Bytes) -> Result<impl Reply, Rejection> {
    let name = match decode_table_name(&raw) {
        Ok(name) => name,
        Err(err) => return Ok(error_reply(&err, Operation::Update)),
    };
    let request: UpdateRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            let err = ServiceError::Validation(format!("unreadable update body: {e}"));
            return Ok(error_reply(&err, Operation::Update));
        }
    };

    let store = state.store.clone();
    let table_name = name.clone();
    let reply = run_blocking(
        Operation::Update,
        move || table::update_row(&store, &table_name, request),
        |id| {
            ok_message(format!(
                "Updated row {} in table '{}'",
                table::display_id(&id),
                name
            ))
        },
    )
    .await;
    Ok(reply)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found.")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Upload too large.")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed.")
    } else {
        debug!(rejection = ?err, "unhandled rejection");
        (StatusCode::BAD_REQUEST, "Bad request.")
    };
    Ok(error_body(message, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state(dir: &std::path::Path) -> AppState {
        AppState::new(Arc::new(Store::open_in_memory().unwrap()), dir, 1024 * 1024)
    }

    #[tokio::test]
    async fn health_check_is_plain_text() {
        let dir = tempdir().unwrap();
        let res = warp::test::request()
            .method("GET")
            .path("/")
            .reply(&routes(state(dir.path())))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"Server is running");
    }

    #[test]
    fn table_names_are_percent_decoded() {
        assert_eq!(decode_table_name("my%20ledger").unwrap(), "my ledger");
        assert_eq!(decode_table_name("ledger").unwrap(), "ledger");
        assert_eq!(decode_table_name("caf%C3%A9").unwrap(), "café");
    }

    #[tokio::test]
    async fn undecodable_table_name_is_bad_request() {
        let dir = tempdir().unwrap();
        let res = warp::test::request()
            .method("GET")
            .path("/table/%FF")
            .reply(&routes(state(dir.path())))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["error"], "Invalid table or column name.");
    }

    #[tokio::test]
    async fn unknown_path_is_json_not_found() {
        let dir = tempdir().unwrap();
        let res = warp::test::request()
            .method("GET")
            .path("/nowhere")
            .reply(&routes(state(dir.path())))
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["error"], "Not found.");
    }
}
