//! Shared utility functions for sqlforge.

pub mod json_extraction;

pub use json_extraction::{
    extract_sql_from_response, find_matching_delimiter, try_extract_json_from_response,
    JsonExtractionResult,
};
