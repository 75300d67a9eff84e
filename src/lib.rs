pub mod cli;
pub mod config;
pub mod db;
pub mod differ;
pub mod error;
pub mod guard;
pub mod normalizer;
pub mod parser;
pub mod schema;
pub mod sentinel;
pub mod sync;
pub mod table;
pub mod workbook;
