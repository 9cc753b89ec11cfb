//! Utilities module - text processing shared by search and classification

pub mod text_utils;

pub use text_utils::TextUtils;
