//! HTTP preview of the published outputs.

pub mod board;
pub mod server;

pub use board::{PreviewBoard, spawn_board_feeder};
pub use server::{PreviewServer, spawn_preview_server};
