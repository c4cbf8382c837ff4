use clap::Parser;
use std::path::PathBuf;
use std::{env::VarError, error::Error};

use coffre::cleanup;
use coffre::conf::AppConfig;
use coffre::db;

/// Utility binary to manage users and force maintenance tasks.
#[derive(Debug, Parser)]
#[clap(version, author, about)]
struct Opts {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    /// Force a cleanup of expired tokens, stale staged uploads and orphan blobs
    Cleanup {
        /// defaults to DATABASE_URL env variable if not provided
        #[clap(short, long)]
        database_url: Option<String>,

        /// defaults to the root_path from Rocket.toml if not provided
        #[clap(short, long)]
        root_path: Option<PathBuf>,
    },
    GenUser {
        #[clap(short, long)]
        username: String,

        #[clap(short, long)]
        password: String,

        /// defaults to DATABASE_URL env variable if not provided
        #[clap(short, long)]
        database_url: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Opts::parse().cmd {
        SubCommand::Cleanup {
            database_url,
            root_path,
        } => cleanup(database_url, root_path),
        SubCommand::GenUser {
            username,
            password,
            database_url,
        } => gen_user(database_url, username, password),
    }
}

fn cleanup(database_url: Option<String>, root_path: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let db_url = get_db_url(database_url)?;
    let conn = db::connect(&db_url)?;
    let root_path = match root_path {
        Some(path) => path,
        None => AppConfig::from_rocket_config()?.root_path,
    };
    cleanup::cleanup_once(&conn, &root_path)?;
    Ok(())
}

fn gen_user(
    database_url: Option<String>,
    username: String,
    password: String,
) -> Result<(), Box<dyn Error>> {
    let db_url = get_db_url(database_url)?;
    let conn = db::connect(&db_url)?;
    db::run_migrations(&conn)?;
    let user = db::create_user(&conn, &username, &password)?;
    println!("created user {} with id {}", user.username, user.id);
    Ok(())
}

fn get_db_url(database_url: Option<String>) -> Result<String, Box<dyn Error>> {
    match database_url {
        Some(x) => Ok(x),
        None => match std::env::var("DATABASE_URL") {
            Ok(x) => Ok(x),
            Err(VarError::NotPresent) => Err("DATABASE_URL env var not found".into()),
            Err(VarError::NotUnicode(_)) => Err("DATABASE_URL env var not valid unicode".into()),
        },
    }
}
