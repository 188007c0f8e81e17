//! Langbase Pipes client and wire types.
//!
//! Every judgment and every LLM-assisted retrieval step in this crate is a
//! Langbase pipe run. The client performs exactly one HTTP attempt per call;
//! retry policy lives in [`crate::resilience`].

mod client;
mod types;


pub use client::*;
pub use types::*;

use serde::de::DeserializeOwned;

use crate::error::{ServiceError, ServiceResult};

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON (fast path)
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Parse a pipe completion into a typed structure.
///
/// There is no lenient fallback: a completion that does not match `T`
/// is an [`ServiceError::InvalidResponse`].
pub fn parse_completion<T: DeserializeOwned>(pipe: &str, completion: &str) -> ServiceResult<T> {
    let json = extract_json_from_completion(completion).map_err(|message| {
        ServiceError::InvalidResponse {
            message: format!("{}: {}", pipe, message),
        }
    })?;

    serde_json::from_str::<T>(json).map_err(|e| {
        let preview: String = completion.chars().take(200).collect();
        ServiceError::InvalidResponse {
            message: format!(
                "{}: JSON parse error: {} | Response preview: {}",
                pipe, e, preview
            ),
        }
    })
}
