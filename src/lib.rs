#[macro_use] extern crate anyhow;
#[macro_use] extern crate diesel;
#[macro_use] extern crate diesel_migrations;

pub mod api;
pub mod auth;
pub mod blob;
pub mod cleanup;
pub mod conf;
pub mod db;
pub mod errors;
pub mod schema;
