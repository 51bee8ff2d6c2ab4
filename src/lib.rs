pub mod config;
pub mod console;
pub mod model_download;
pub mod pipeline;
pub mod types;
