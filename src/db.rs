use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;

use crate::auth;
use crate::errors::{self, CoffreError};
use crate::schema::{files, tokens, users};

embed_migrations!();

#[derive(Debug, Queryable)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub password_hash: String,
}

#[derive(Insertable)]
#[table_name = "users"]
struct NewUser<'a> {
    username: &'a str,
    password_hash: &'a str,
}

/// A row of the file catalog. `filename` is display metadata only, the blob
/// on disk lives under `storage_key`, which is never derived from user input.
#[derive(Debug, Clone, Queryable)]
pub struct FileRecord {
    pub id: i32,
    pub filename: String,
    pub content_type: String,
    pub storage_key: String,
}

#[derive(Debug)]
pub struct CreateFile {
    pub filename: String,
    pub content_type: String,
    pub storage_key: String,
}

#[derive(Insertable)]
#[table_name = "files"]
struct NewFile<'a> {
    filename: &'a str,
    content_type: &'a str,
    storage_key: &'a str,
}

/// An issued bearer token. Tokens are opaque to the client, validity lives
/// entirely in this registry.
#[derive(Debug, Queryable)]
pub struct AccessToken {
    pub token: String,
    pub username: String,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Insertable)]
#[table_name = "tokens"]
struct NewToken<'a> {
    token: &'a str,
    username: &'a str,
    created_at: NaiveDateTime,
    expires_at: NaiveDateTime,
}

pub fn connect(db_url: &str) -> errors::Result<SqliteConnection> {
    let conn = SqliteConnection::establish(db_url)?;
    Ok(conn)
}

pub fn run_migrations(conn: &SqliteConnection) -> errors::Result<()> {
    embedded_migrations::run(conn)?;
    Ok(())
}

/// Hashes the password and inserts the user. Uniqueness is enforced by the
/// UNIQUE constraint on `username`, not by a prior lookup, so two concurrent
/// registrations cannot both succeed.
pub fn create_user(conn: &SqliteConnection, username: &str, password: &str) -> errors::Result<User> {
    let password_hash = auth::hash_password(password)?;
    let new_user = NewUser {
        username,
        password_hash: &password_hash,
    };
    match diesel::insert_into(users::table).values(&new_user).execute(conn) {
        Ok(_) => (),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(CoffreError::UserAlreadyExists(username.to_string()))
        }
        Err(err) => return Err(err.into()),
    }
    let user = users::table
        .filter(users::username.eq(username))
        .first(conn)?;
    Ok(user)
}

/// Verifies the credentials and, on success, issues a token and records it
/// in the registry. An unknown username and a wrong password are
/// indistinguishable to the caller.
pub fn authenticate(
    conn: &SqliteConnection,
    username: &str,
    password: &str,
    valid_hours: i64,
) -> errors::Result<AccessToken> {
    let user: Option<User> = users::table
        .filter(users::username.eq(username))
        .first(conn)
        .optional()?;
    let user = match user {
        Some(u) => u,
        None => return Err(CoffreError::InvalidCredentials),
    };
    if !auth::verify_password(password, &user.password_hash) {
        return Err(CoffreError::InvalidCredentials);
    }

    let token = auth::issue_token(&user.username);
    let now = chrono::Utc::now().naive_utc();
    let new_token = NewToken {
        token: &token,
        username: &user.username,
        created_at: now,
        expires_at: now + chrono::Duration::hours(valid_hours),
    };
    diesel::insert_into(tokens::table)
        .values(&new_token)
        .execute(conn)?;
    let access_token = tokens::table.find(&token).first(conn)?;
    Ok(access_token)
}

/// Looks up a token in the registry, returning it only if it hasn't expired.
pub fn get_valid_token(conn: &SqliteConnection, token: &str) -> errors::Result<Option<AccessToken>> {
    let now = chrono::Utc::now().naive_utc();
    let access_token = tokens::table
        .find(token)
        .filter(tokens::expires_at.gt(now))
        .first(conn)
        .optional()?;
    Ok(access_token)
}

pub fn delete_expired_tokens(conn: &SqliteConnection) -> errors::Result<usize> {
    let now = chrono::Utc::now().naive_utc();
    let n = diesel::delete(tokens::table.filter(tokens::expires_at.le(now))).execute(conn)?;
    Ok(n)
}

pub fn create_file(conn: &SqliteConnection, create_file: CreateFile) -> errors::Result<FileRecord> {
    let new_file = NewFile {
        filename: &create_file.filename,
        content_type: &create_file.content_type,
        storage_key: &create_file.storage_key,
    };
    diesel::insert_into(files::table)
        .values(&new_file)
        .execute(conn)?;
    // storage_key is unique, so this reselect is unambiguous even without
    // last_insert_rowid
    let record = files::table
        .filter(files::storage_key.eq(&create_file.storage_key))
        .first(conn)?;
    Ok(record)
}

/// Full catalog scan in insertion order. No pagination.
pub fn get_files(conn: &SqliteConnection) -> errors::Result<Vec<FileRecord>> {
    let records = files::table.order(files::id.asc()).load(conn)?;
    Ok(records)
}

pub fn get_file(conn: &SqliteConnection, file_id: i32) -> errors::Result<Option<FileRecord>> {
    let record = files::table.find(file_id).first(conn).optional()?;
    Ok(record)
}

/// Every storage key the catalog knows about, for the orphan sweep.
pub fn get_storage_keys(conn: &SqliteConnection) -> errors::Result<Vec<String>> {
    let keys = files::table.select(files::storage_key).load(conn)?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> SqliteConnection {
        let conn = SqliteConnection::establish(":memory:").unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let conn = test_conn();
        create_user(&conn, "alice", "secret").unwrap();
        let err = create_user(&conn, "alice", "other").unwrap_err();
        assert!(matches!(err, CoffreError::UserAlreadyExists(_)));
        // no partial row from the failed attempt
        let count: i64 = users::table.count().get_result(&conn).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn authenticate_checks_password_and_existence() {
        let conn = test_conn();
        create_user(&conn, "alice", "secret").unwrap();

        let tok = authenticate(&conn, "alice", "secret", 24).unwrap();
        assert_eq!(tok.username, "alice");
        assert!(tok.expires_at > tok.created_at);

        let err = authenticate(&conn, "alice", "wrong", 24).unwrap_err();
        assert!(matches!(err, CoffreError::InvalidCredentials));
        let err = authenticate(&conn, "bob", "secret", 24).unwrap_err();
        assert!(matches!(err, CoffreError::InvalidCredentials));
    }

    #[test]
    fn issued_token_is_valid_until_expiry() {
        let conn = test_conn();
        create_user(&conn, "alice", "secret").unwrap();
        let tok = authenticate(&conn, "alice", "secret", 24).unwrap();

        let found = get_valid_token(&conn, &tok.token).unwrap();
        assert_eq!(found.unwrap().username, "alice");
        assert!(get_valid_token(&conn, "0".repeat(64).as_str()).unwrap().is_none());

        // a token issued with no validity window is already expired
        let expired = authenticate(&conn, "alice", "secret", 0).unwrap();
        assert!(get_valid_token(&conn, &expired.token).unwrap().is_none());
        assert_eq!(delete_expired_tokens(&conn).unwrap(), 1);
    }

    #[test]
    fn catalog_keeps_insertion_order() {
        let conn = test_conn();
        for i in 0..3 {
            create_file(
                &conn,
                CreateFile {
                    filename: format!("f{}.bin", i),
                    content_type: "application/octet-stream".to_string(),
                    storage_key: format!("key-{}", i),
                },
            )
            .unwrap();
        }
        let records = get_files(&conn).unwrap();
        assert_eq!(records.len(), 3);
        let names: Vec<_> = records.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["f0.bin", "f1.bin", "f2.bin"]);
        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        assert!(get_file(&conn, records[0].id).unwrap().is_some());
        assert!(get_file(&conn, 9999).unwrap().is_none());

        let keys = get_storage_keys(&conn).unwrap();
        assert_eq!(keys.len(), 3);
    }
}
