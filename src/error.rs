use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileMapError {
    #[error("failed to open metadata file {path}: {source}")]
    OpenMetadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open auxiliary metadata file {path}: {source}")]
    OpenAuxMetadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open data file {path}: {source}")]
    OpenData {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("asynchronous dispatch failed: {0}")]
    Dispatch(#[source] std::io::Error),

    #[error("invalid page size: {0}")]
    InvalidPageSize(u32),

    #[error("map is still loading")]
    Loading,

    #[error("map is closed")]
    Closed,

    #[error("metadata is corrupt: {0}")]
    Corrupt(#[from] MetaError),
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("bad magic marker")]
    BadMagic,

    #[error("truncated metadata: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("content digest mismatch")]
    DigestMismatch,

    #[error("bad canary byte for item {item}")]
    BadCanary { item: u32 },

    #[error("missing item {item}")]
    MissingItem { item: u32 },

    #[error("malformed item {item}: {reason}")]
    BadItem { item: u32, reason: &'static str },
}
