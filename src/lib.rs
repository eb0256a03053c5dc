pub mod app;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod extract;
pub mod fs_util;
pub mod lineage;
pub mod output;
pub mod taxonomy;
pub mod tree_format;
pub mod validate;
