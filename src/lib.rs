use std::error::Error;

pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod notebook;
pub mod storage;
pub mod store;
pub mod sync;
pub mod webdav;

pub fn unpack_error(err: &(dyn Error)) -> String {
    let mut parts = Vec::new();
    parts.push(err.to_string());
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}
