pub mod compression;
pub mod error;
pub mod storage;
pub mod utils;
