pub mod archive;
pub mod config;
pub mod dex;
pub mod download;
pub mod error;
pub mod icons;
pub mod install;
pub mod libs;
pub mod manifest;
pub mod pipeline;
pub mod res;
pub mod sign;
pub mod utils;

#[cfg(test)]
mod testing;
