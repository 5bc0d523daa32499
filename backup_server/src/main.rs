mod auth;
mod session;
mod state;

use crate::{auth::AuthContext, state::AppState};
use argon2::password_hash::rand_core::OsRng as ArgonOsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::extract::Multipart;
use clap::Parser;
use local_ip_address::local_ip;
use mime_guess::from_path;
use rand::rngs::OsRng as RandOsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use vault_core::metadata::{fileset_path, DeleteKind, SetKind};
use vault_core::{NewBlob, VaultError};

/// Current time in milliseconds since the epoch; every engine call is
/// timestamped by the caller, not the engine itself (spec.md §4.4).
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Database root directory (holds master.key, pending/, blobs/, home/)
    #[arg(short = 'd', long = "db-dir", default_value = "./data")]
    db_dir: PathBuf,

    /// Passphrase protecting the master key. Falls back to
    /// BACKUP_SERVER_PASSPHRASE, then to a fixed development default —
    /// production deployments must set one of the first two.
    #[arg(long)]
    passphrase: Option<String>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (StatusCode::OK, Json(ApiResponse { success: true, data: Some(data), message: None })).into_response()
    }
    fn err(status: StatusCode, message: impl Into<String>) -> Response {
        (status, Json(ApiResponse::<T> { success: false, data: None, message: Some(message.into()) })).into_response()
    }
}

fn vault_error_response(e: VaultError) -> Response {
    let status = match e {
        VaultError::NotFound(_) => StatusCode::NOT_FOUND,
        VaultError::AlreadyExists(_) => StatusCode::CONFLICT,
        VaultError::QuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
        VaultError::Invalid(_) | VaultError::ValidationFailed => StatusCode::BAD_REQUEST,
        VaultError::Outdated | VaultError::UpdateTimestampTooOld => StatusCode::CONFLICT,
        VaultError::DecryptFailed | VaultError::EncryptFailed(_) => StatusCode::UNAUTHORIZED,
        VaultError::Internal(_) | VaultError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ApiResponse::<()>::err(status, e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = env_logger::builder().filter_level(log::LevelFilter::Info).try_init();
    let args = Args::parse();

    let passphrase = args
        .passphrase
        .or_else(|| std::env::var("BACKUP_SERVER_PASSPHRASE").ok())
        .unwrap_or_else(|| "change-me-in-production".to_string());

    std::fs::create_dir_all(&args.db_dir)?;
    let state = AppState::open(&args.db_dir, &passphrase)?;

    log::info!("database root: {}", args.db_dir.display());
    println!("Starting server at http://localhost:{}", args.port);
    match local_ip() {
        Ok(ip) => println!("Also available at http://{ip}:{}", args.port),
        Err(_) => println!("Could not determine local IP address"),
    }

    let app = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/signup", post(signup_handler))
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .route("/api/gallery", get(gallery_handler))
        .route("/api/trash", get(trash_handler))
        .route("/api/trash/empty", post(empty_trash_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/files/:set/:filename", get(download_handler))
        .route("/api/files/:set/:filename", delete(trash_file_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn status_handler() -> Response {
    ApiResponse::ok(serde_json::json!({ "status": "ready" }))
}

#[derive(Deserialize)]
struct SignupPayload {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
    user_id: i64,
}

fn hash_password(password: &str) -> Result<Vec<u8>, Response> {
    let salt = SaltString::generate(&mut ArgonOsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string().into_bytes())
        .map_err(|_| ApiResponse::<()>::err(StatusCode::INTERNAL_SERVER_ERROR, "password hashing failed"))
}

async fn signup_handler(State(state): State<AppState>, Json(payload): Json<SignupPayload>) -> Response {
    let hashed = match hash_password(&payload.password) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    let mut salt = vec![0u8; 16];
    RandOsRng.fill_bytes(&mut salt);

    let user = match state.metadata.add_user(
        &payload.email,
        hashed,
        salt,
        vec![],
        vec![],
        false,
        now_ms(),
    ) {
        Ok(id) => id,
        Err(e) => return vault_error_response(e),
    };

    match session::mint_session(&state.metadata, user, now_ms()) {
        Ok(token) => ApiResponse::ok(AuthResponse { token, user_id: user }),
        Err(e) => vault_error_response(e),
    }
}

#[derive(Deserialize)]
struct LoginPayload {
    email: String,
    password: String,
}

async fn login_handler(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> Response {
    let user = match state.metadata.user(&payload.email) {
        Ok(u) => u,
        Err(_) => return ApiResponse::<()>::err(StatusCode::UNAUTHORIZED, "invalid credentials"),
    };

    let valid = PasswordHash::new(&String::from_utf8_lossy(&user.hashed_password))
        .ok()
        .map(|parsed| Argon2::default().verify_password(payload.password.as_bytes(), &parsed).is_ok())
        .unwrap_or(false);
    if !valid {
        return ApiResponse::<()>::err(StatusCode::UNAUTHORIZED, "invalid credentials");
    }

    match session::mint_session(&state.metadata, user.user_id, now_ms()) {
        Ok(token) => ApiResponse::ok(AuthResponse { token, user_id: user.user_id }),
        Err(e) => vault_error_response(e),
    }
}

async fn logout_handler(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    match token {
        Some(token) => match session::revoke_session(&state.metadata, token) {
            Ok(()) => ApiResponse::ok(()),
            Err(e) => vault_error_response(e),
        },
        None => ApiResponse::<()>::err(StatusCode::BAD_REQUEST, "missing bearer token"),
    }
}

#[derive(Serialize)]
struct FileEntry {
    name: String,
    size: u64,
}

#[derive(Serialize)]
struct FileList {
    files: Vec<FileEntry>,
}

async fn gallery_handler(auth: AuthContext, State(state): State<AppState>) -> Response {
    match state.metadata.gallery(auth.user) {
        Ok(fs) => ApiResponse::ok(FileList {
            files: fs
                .files
                .into_iter()
                .map(|(name, spec)| FileEntry { name, size: spec.store_file_size })
                .collect(),
        }),
        Err(e) => vault_error_response(e),
    }
}

async fn trash_handler(auth: AuthContext, State(state): State<AppState>) -> Response {
    match state.metadata.trash(auth.user) {
        Ok(fs) => ApiResponse::ok(FileList {
            files: fs
                .files
                .into_iter()
                .map(|(name, spec)| FileEntry { name, size: spec.store_file_size })
                .collect(),
        }),
        Err(e) => vault_error_response(e),
    }
}

#[derive(Deserialize)]
struct EmptyTrashPayload {
    #[serde(default)]
    before_ms: Option<i64>,
}

async fn empty_trash_handler(
    auth: AuthContext,
    State(state): State<AppState>,
    Json(payload): Json<EmptyTrashPayload>,
) -> Response {
    let trash = fileset_path(auth.user, SetKind::Trash);
    let before = payload.before_ms.unwrap_or_else(now_ms);
    match state.blobs.empty_trash(&trash, before, now_ms()) {
        Ok(()) => ApiResponse::ok(()),
        Err(e) => vault_error_response(e),
    }
}

fn random_tmp_path() -> String {
    let mut bytes = [0u8; 16];
    RandOsRng.fill_bytes(&mut bytes);
    format!("tmp/{}", hex::encode(bytes))
}

/// Accepts two required multipart fields (`content`, `thumb`) carrying
/// already client-encrypted bytes, an optional `headers` field (the
/// sealed per-file header, spec.md §4.2), and a required `filename`
/// field, then lands them as one new gallery entry.
async fn upload_handler(
    auth: AuthContext,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let mut filename: Option<String> = None;
    let mut headers: Vec<u8> = Vec::new();
    let mut content: Option<Vec<u8>> = None;
    let mut thumb: Option<Vec<u8>> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(name) = field.name().map(|n| n.to_string()) else { continue };
        match name.as_str() {
            "filename" => filename = field.text().await.ok(),
            "headers" => headers = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default(),
            "content" => content = field.bytes().await.ok().map(|b| b.to_vec()),
            "thumb" => thumb = field.bytes().await.ok().map(|b| b.to_vec()),
            _ => {}
        }
    }

    let (Some(filename), Some(content), Some(thumb)) = (filename, content, thumb) else {
        return ApiResponse::<()>::err(StatusCode::BAD_REQUEST, "filename, content, and thumb are required");
    };

    let content_tmp = random_tmp_path();
    let thumb_tmp = random_tmp_path();
    if let Err(e) = write_tmp(&state, &content_tmp, &content) {
        return vault_error_response(e);
    }
    if let Err(e) = write_tmp(&state, &thumb_tmp, &thumb) {
        return vault_error_response(e);
    }

    let gallery = fileset_path(auth.user, SetKind::Gallery);
    let new_blob = NewBlob {
        content_temp: content_tmp,
        thumb_temp: thumb_tmp,
        content_size: content.len() as u64,
        thumb_size: thumb.len() as u64,
        headers,
    };
    match state.blobs.add_file(auth.user, &gallery, &filename, new_blob, now_ms()) {
        Ok(()) => ApiResponse::ok(()),
        Err(e) => vault_error_response(e),
    }
}

fn write_tmp(state: &AppState, logical: &str, data: &[u8]) -> vault_core::VaultResult<()> {
    let mut w = state.storage.open_blob_write(logical)?;
    w.write_all(data)?;
    w.finish()?;
    Ok(())
}

fn set_kind_from_str(s: &str) -> Option<SetKind> {
    match s {
        "gallery" => Some(SetKind::Gallery),
        "trash" => Some(SetKind::Trash),
        _ => None,
    }
}

async fn download_handler(
    auth: AuthContext,
    State(state): State<AppState>,
    Path((set, filename)): Path<(String, String)>,
) -> Response {
    let Some(kind) = set_kind_from_str(&set) else {
        return ApiResponse::<()>::err(StatusCode::NOT_FOUND, "unknown file set");
    };
    let fs = match kind {
        SetKind::Gallery => state.metadata.gallery(auth.user),
        SetKind::Trash => state.metadata.trash(auth.user),
        SetKind::Album => unreachable!(),
    };
    let fs = match fs {
        Ok(fs) => fs,
        Err(e) => return vault_error_response(e),
    };
    let Some(spec) = fs.files.get(&filename) else {
        return ApiResponse::<()>::err(StatusCode::NOT_FOUND, "file not found");
    };

    let (mut reader, _start) = match state.storage.open_blob_read(&spec.store_file_path) {
        Ok(r) => r,
        Err(e) => return vault_error_response(e),
    };
    let mut content = Vec::new();
    if let Err(e) = reader.read_to_end(&mut content) {
        return vault_error_response(VaultError::Io(e));
    }

    let mime = from_path(&filename).first_or_octet_stream();
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime.as_ref())
        .body(axum::body::Body::from(content))
        .unwrap()
}

async fn trash_file_handler(
    auth: AuthContext,
    State(state): State<AppState>,
    Path((set, filename)): Path<(String, String)>,
) -> Response {
    let Some(kind) = set_kind_from_str(&set) else {
        return ApiResponse::<()>::err(StatusCode::NOT_FOUND, "unknown file set");
    };
    let now = now_ms();
    let result = match kind {
        SetKind::Gallery => {
            let gallery = fileset_path(auth.user, SetKind::Gallery);
            let trash = fileset_path(auth.user, SetKind::Trash);
            state.blobs.move_file(&gallery, &trash, &filename, None, true, DeleteKind::Gallery, now)
        }
        SetKind::Trash => {
            let trash = fileset_path(auth.user, SetKind::Trash);
            state.blobs.delete_files(&trash, &[filename], now)
        }
        SetKind::Album => unreachable!(),
    };
    match result {
        Ok(()) => ApiResponse::ok(()),
        Err(e) => vault_error_response(e),
    }
}
