use futures::stream::StreamExt;
use multer::bytes::Bytes;
use multer::{Constraints, Multipart};
use rocket::data::{Data, ToByteUnit};
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::form::{Form, FromForm};
use rocket::http::{ContentType, Status};
use rocket::outcome::Outcome;
use rocket::response::stream::ByteStream;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::tokio::io::AsyncWriteExt;
use rocket::tokio::sync::Mutex;
use rocket::{http, request, Build, Rocket, State};
use rocket_sync_db_pools::database;
use tokio_util::codec;
use uuid::Uuid;

use crate::auth;
use crate::blob::BlobStore;
use crate::conf::AppConfig;
use crate::db;
use crate::errors::{self, CoffreError};

#[database("sqlite_coffre")]
pub struct DbConn(diesel::SqliteConnection);

// simplify sqlite tx by only supporting one writer at a time.
pub struct WriteLock(Mutex<()>);

/// Request guard for the protected routes. A request must carry
/// `Authorization: Bearer <token>` where the token is shaped like an issued
/// one (64 hex chars) *and* is present, unexpired, in the token registry.
/// Malformed tokens are rejected before any storage access.
pub struct AuthUser {
    pub username: String,
}

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for AuthUser {
    type Error = ();

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        let header = match request.headers().get_one("Authorization") {
            Some(header) => header,
            None => return Outcome::Failure((Status::Unauthorized, ())),
        };
        let token = match header.strip_prefix("Bearer ") {
            Some(token) => token,
            None => return Outcome::Failure((Status::Unauthorized, ())),
        };
        if !auth::is_well_formed_token(token) {
            return Outcome::Failure((Status::Unauthorized, ()));
        }

        let conn = match request.guard::<DbConn>().await {
            Outcome::Success(conn) => conn,
            Outcome::Failure(_) | Outcome::Forward(_) => {
                return Outcome::Failure((Status::InternalServerError, ()))
            }
        };
        let token = token.to_string();
        match conn.run(move |c| db::get_valid_token(c, &token)).await {
            Ok(Some(access_token)) => Outcome::Success(AuthUser {
                username: access_token.username,
            }),
            Ok(None) => {
                log::debug!("bearer token not in the registry, or expired");
                Outcome::Failure((Status::Unauthorized, ()))
            }
            Err(err) => {
                log::error!("cannot validate bearer token: {:?}", err);
                Outcome::Failure((Status::InternalServerError, ()))
            }
        }
    }
}

#[derive(Debug)]
struct MultipartBoundary<'r>(&'r str);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for MultipartBoundary<'r> {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        let ct = request.guard::<&http::ContentType>().await;
        ct.and_then(|ct| match ct.media_type().param("boundary") {
            Some(boundary) => request::Outcome::Success(MultipartBoundary(boundary)),
            None => request::Outcome::Forward(()),
        })
    }
}

#[rocket::get("/")]
fn index() -> &'static str {
    "coffre"
}

#[derive(Debug, FromForm, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    msg: String,
}

#[rocket::post("/register", format = "json", data = "<creds>")]
async fn register_json(
    creds: Json<Credentials>,
    conn: DbConn,
    write_lock: &State<WriteLock>,
) -> errors::Result<Json<RegisterResponse>> {
    register_user(creds.into_inner(), conn, write_lock).await
}

#[rocket::post("/register", data = "<creds>", rank = 2)]
async fn register_form(
    creds: Form<Credentials>,
    conn: DbConn,
    write_lock: &State<WriteLock>,
) -> errors::Result<Json<RegisterResponse>> {
    register_user(creds.into_inner(), conn, write_lock).await
}

async fn register_user(
    creds: Credentials,
    conn: DbConn,
    write_lock: &State<WriteLock>,
) -> errors::Result<Json<RegisterResponse>> {
    if creds.username.is_empty() || creds.password.is_empty() {
        return Err(CoffreError::BadRequest(
            "username and password must not be empty".to_string(),
        ));
    }
    let user = {
        let _guard = write_lock.0.lock().await;
        conn.run(move |c| db::create_user(c, &creds.username, &creds.password))
            .await?
    };
    log::info!("registered user {}", user.username);
    Ok(Json(RegisterResponse {
        msg: "User registered successfully".to_string(),
    }))
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
}

#[rocket::post("/token", data = "<creds>")]
async fn login(
    creds: Form<Credentials>,
    conn: DbConn,
    write_lock: &State<WriteLock>,
    config: &State<AppConfig>,
) -> errors::Result<Json<TokenResponse>> {
    let creds = creds.into_inner();
    let valid_hours = config.token_valid_hours;
    // issuing a token writes to the registry
    let access_token = {
        let _guard = write_lock.0.lock().await;
        conn.run(move |c| db::authenticate(c, &creds.username, &creds.password, valid_hours))
            .await?
    };
    Ok(Json(TokenResponse {
        access_token: access_token.token,
        token_type: "bearer",
    }))
}

#[derive(Serialize)]
struct UploadResponse {
    filename: String,
}

#[rocket::post("/upload", data = "<data>")]
async fn upload(
    _user: AuthUser,
    boundary: MultipartBoundary<'_>,
    data: Data<'_>,
    conn: DbConn,
    write_lock: &State<WriteLock>,
    config: &State<AppConfig>,
) -> errors::Result<Json<UploadResponse>> {
    let store = BlobStore::new(&config.root_path);

    let stream = codec::FramedRead::new(data.open(usize::MAX.mebibytes()), codec::BytesCodec::new());
    let constraints = Constraints::new().allowed_fields(vec!["file"]);
    let mut multipart = Multipart::with_constraints(stream, boundary.0.to_string(), constraints);

    while let Some(mut field) = multipart.next_field().await? {
        let filename = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            // a file part without a name has nothing to catalog
            _ => continue,
        };
        let content_type = field
            .content_type()
            .map(|ct| ct.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        // the storage key is never derived from the user supplied filename
        let key = Uuid::new_v4().to_string();

        let mut writer = store.create_staged(&key).await?;
        while let Some(chunk) = field.chunk().await.transpose() {
            let mut chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    log::error!("got an error while reading a chunk: {:?}", err);
                    discard_staged(&store, &key).await;
                    return Err(err.into());
                }
            };
            if let Err(err) = writer.write_all_buf(&mut chunk).await {
                discard_staged(&store, &key).await;
                return Err(err.into());
            }
        }
        if let Err(err) = writer.shutdown().await {
            discard_staged(&store, &key).await;
            return Err(err.into());
        }

        // catalog row first, then promote: readers can never observe a
        // half-written blob, and a crash in between only leaks a staged
        // file for the cleanup sweep.
        let record = {
            let _guard = write_lock.0.lock().await;
            let create_file = db::CreateFile {
                filename,
                content_type,
                storage_key: key.clone(),
            };
            conn.run(move |c| db::create_file(c, create_file)).await?
        };
        store.promote(&key).await?;

        log::info!("uploaded {} as blob {}", record.filename, record.storage_key);
        return Ok(Json(UploadResponse {
            filename: record.filename,
        }));
    }

    Err(CoffreError::BadRequest(
        "no file field in the multipart body".to_string(),
    ))
}

/// Best effort removal of a staged upload after a failure. The caller's
/// error is the one worth reporting, a discard failure only gets logged.
async fn discard_staged(store: &BlobStore, key: &str) {
    if let Err(err) = store.discard(key).await {
        log::error!("cannot discard staged upload {}: {:?}", key, err);
    }
}

#[rocket::post("/upload", rank = 2)]
fn upload_not_multipart(_user: AuthUser) -> CoffreError {
    CoffreError::BadRequest("multipart/form-data body required".to_string())
}

#[derive(Serialize)]
struct FileView {
    id: i32,
    filename: String,
    content_type: String,
}

#[rocket::get("/files")]
async fn list_files(_user: AuthUser, conn: DbConn) -> errors::Result<Json<Vec<FileView>>> {
    let records = conn.run(|c| db::get_files(c)).await?;
    let views = records
        .into_iter()
        .map(|r| FileView {
            id: r.id,
            filename: r.filename,
            content_type: r.content_type,
        })
        .collect();
    Ok(Json(views))
}

#[rocket::get("/download/<file_id>")]
async fn download(
    file_id: i32,
    _user: AuthUser,
    conn: DbConn,
    config: &State<AppConfig>,
) -> errors::Result<Option<(ContentType, ByteStream![Bytes])>> {
    let record = match conn.run(move |c| db::get_file(c, file_id)).await? {
        Some(record) => record,
        None => return Ok(None),
    };

    let store = BlobStore::new(&config.root_path);
    let stream = match store.read_stream(&record.storage_key).await? {
        Some(stream) => stream,
        None => {
            // catalog row whose promote never happened
            log::error!(
                "blob missing for file {} (key {})",
                record.id,
                record.storage_key
            );
            return Ok(None);
        }
    };

    let content_type = ContentType::parse_flexible(&record.content_type)
        .unwrap_or(ContentType::Binary);
    // dropping the stream (client disconnect) stops chunk production; a
    // read error mid-stream can only truncate the response, the status line
    // is long gone by then
    let bytes = stream.scan((), |_, chunk| {
        futures::future::ready(match chunk {
            Ok(chunk) => Some(chunk),
            Err(err) => {
                log::error!("IO error while streaming blob: {:?}", err);
                None
            }
        })
    });
    Ok(Some((content_type, ByteStream::from(bytes))))
}

async fn run_migrations(rocket: Rocket<Build>) -> rocket::fairing::Result {
    let conn = match DbConn::get_one(&rocket).await {
        Some(conn) => conn,
        None => {
            log::error!("cannot access the connection pool to run migrations");
            return Err(rocket);
        }
    };
    match conn.run(|c| db::run_migrations(c)).await {
        Ok(_) => Ok(rocket),
        Err(err) => {
            log::error!("database migrations failed: {:?}", err);
            Err(rocket)
        }
    }
}

pub fn build_app(figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .mount(
            "/",
            rocket::routes![
                index,
                register_json,
                register_form,
                login,
                upload,
                upload_not_multipart,
                list_files,
                download
            ],
        )
        .attach(DbConn::fairing())
        .attach(AdHoc::config::<AppConfig>())
        .attach(AdHoc::try_on_ignite("database migrations", run_migrations))
        .manage(WriteLock(Mutex::new(())))
}
