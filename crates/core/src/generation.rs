//! Generation request validation and normalization.
//!
//! Every check here runs before a request is handed to the network layer,
//! so a rejected request never reaches the resilient client.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Minimum prompt length in characters (after trimming).
pub const MIN_PROMPT_LENGTH: usize = 5;

/// Maximum prompt length in characters (after trimming).
pub const MAX_PROMPT_LENGTH: usize = 2_000;

/// Minimum number of variants per request.
pub const MIN_VARIANTS: u8 = 1;

/// Maximum number of variants per request.
pub const MAX_VARIANTS: u8 = 8;

/// Largest accepted width or height in pixels.
pub const MAX_DIMENSION_PX: u32 = 8_192;

/// Pattern for `WIDTHxHEIGHT` dimension strings.
pub const DIMENSIONS_PATTERN: &str = r"^(\d{1,5})x(\d{1,5})$";

static DIMENSIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DIMENSIONS_PATTERN).expect("valid regex"));

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Output image encoding requested from the render service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::Webp),
            other => Err(CoreError::Validation(format!(
                "Unknown output format '{other}'. Must be one of: png, jpeg, webp"
            ))),
        }
    }
}

/// Parsed `WIDTHxHEIGHT` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A generation request as supplied by the caller, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub project_id: String,
    pub prompt: String,
    pub variant_count: u8,
    pub format: String,
    pub dimensions: String,
    /// Free-form brand constraints forwarded to the service untouched.
    #[serde(default)]
    pub constraints: Option<serde_json::Value>,
}

/// A request that passed validation. Only obtainable through
/// [`validate_request`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedRequest {
    pub project_id: String,
    pub prompt: String,
    pub variant_count: u8,
    pub format: OutputFormat,
    pub dimensions: Dimensions,
    pub constraints: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a prompt: trimmed length must be within
/// [`MIN_PROMPT_LENGTH`]..=[`MAX_PROMPT_LENGTH`] characters.
pub fn validate_prompt(prompt: &str) -> Result<(), CoreError> {
    let len = prompt.trim().chars().count();
    if len < MIN_PROMPT_LENGTH {
        return Err(CoreError::Validation(format!(
            "Prompt is too short: at least {MIN_PROMPT_LENGTH} characters required (got {len})"
        )));
    }
    if len > MAX_PROMPT_LENGTH {
        return Err(CoreError::Validation(format!(
            "Prompt is too long: at most {MAX_PROMPT_LENGTH} characters allowed (got {len})"
        )));
    }
    Ok(())
}

/// Validate the number of requested variants.
pub fn validate_variant_count(count: u8) -> Result<(), CoreError> {
    if !(MIN_VARIANTS..=MAX_VARIANTS).contains(&count) {
        return Err(CoreError::Validation(format!(
            "Variant count must be between {MIN_VARIANTS} and {MAX_VARIANTS} (got {count})"
        )));
    }
    Ok(())
}

/// Parse and validate a `WIDTHxHEIGHT` dimension string.
pub fn parse_dimensions(value: &str) -> Result<Dimensions, CoreError> {
    let invalid = || {
        CoreError::Validation(format!(
            "Dimensions must look like WIDTHxHEIGHT, e.g. 1024x1024 (got '{value}')"
        ))
    };

    let caps = DIMENSIONS_RE.captures(value.trim()).ok_or_else(invalid)?;
    let width: u32 = caps[1].parse().map_err(|_| invalid())?;
    let height: u32 = caps[2].parse().map_err(|_| invalid())?;

    for (side, px) in [("Width", width), ("Height", height)] {
        if px == 0 || px > MAX_DIMENSION_PX {
            return Err(CoreError::Validation(format!(
                "{side} must be between 1 and {MAX_DIMENSION_PX} pixels (got {px})"
            )));
        }
    }

    Ok(Dimensions { width, height })
}

/// Validate every field of a generation request and normalize it.
///
/// The prompt is trimmed and the format lower-cased; the first failing
/// check is reported.
pub fn validate_request(request: &GenerationRequest) -> Result<ValidatedRequest, CoreError> {
    if request.project_id.trim().is_empty() {
        return Err(CoreError::Validation(
            "Project id must not be empty".to_string(),
        ));
    }
    validate_prompt(&request.prompt)?;
    validate_variant_count(request.variant_count)?;
    let dimensions = parse_dimensions(&request.dimensions)?;
    let format = OutputFormat::parse(&request.format)?;

    Ok(ValidatedRequest {
        project_id: request.project_id.trim().to_string(),
        prompt: request.prompt.trim().to_string(),
        variant_count: request.variant_count,
        format,
        dimensions,
        constraints: request.constraints.clone(),
    })
}
