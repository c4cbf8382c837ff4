use std::io::Cursor;

use diesel;
use multer;
use rocket::http::{ContentType, Status};
use rocket::response;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoffreError>;

#[derive(Error, Debug)]
pub enum CoffreError {
    #[error("database error {0:?}")]
    DbError(#[from] diesel::result::Error),

    #[error("database connection error {0:?}")]
    ConnectionError(#[from] diesel::ConnectionError),

    #[error("migration error {0:?}")]
    MigrationError(#[from] diesel_migrations::RunMigrationsError),

    #[error("multipart decoding error {0:?}")]
    MultipartError(#[from] multer::Error),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl<'r> response::Responder<'r, 'static> for CoffreError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> response::Result<'static> {
        let (err_str, status) = match &self {
            CoffreError::UserAlreadyExists(username) => {
                let err_str = format!("Username already registered: {}", username);
                (err_str, Status::BadRequest)
            }
            CoffreError::InvalidCredentials => {
                ("Invalid credentials".to_string(), Status::Unauthorized)
            }
            CoffreError::BadRequest(msg) => (msg.clone(), Status::BadRequest),
            CoffreError::MultipartError(err) => {
                (format!("Invalid multipart body: {}", err), Status::BadRequest)
            }
            _ => {
                log::error!("got a generic error! {:?}", self);
                ("internal server error".to_string(), Status::InternalServerError)
            }
        };
        response::Response::build()
            .sized_body(err_str.len(), Cursor::new(err_str))
            .status(status)
            .header(ContentType::Text)
            .ok()
    }
}
