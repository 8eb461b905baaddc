//! Mozilla `updates.xml` metadata.
//!
//! The update server answers a check with an `<updates>` document holding
//! exactly one `<update>` element, which carries one `<patch>` per patch
//! type. Anything else (zero updates, several updates, duplicate patch
//! types) is a protocol violation and the check fails.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Patch type preferred when both are offered.
pub const PATCH_PARTIAL: &str = "partial";

/// Fallback patch type.
pub const PATCH_COMPLETE: &str = "complete";

// =============================================================================
// Schema
// =============================================================================

#[derive(Debug, Deserialize)]
struct Updates {
    #[serde(rename = "update", default)]
    update: Vec<UpdateElement>,
}

#[derive(Debug, Deserialize)]
struct UpdateElement {
    #[serde(rename = "@type")]
    _type: Option<String>,
    #[serde(rename = "@displayVersion")]
    _display_version: Option<String>,
    #[serde(rename = "@appVersion")]
    app_version: String,
    #[serde(rename = "@platformVersion")]
    _platform_version: Option<String>,
    #[serde(rename = "@buildID")]
    _build_id: Option<String>,
    #[serde(rename = "patch", default)]
    patch: Vec<Patch>,
}

/// One downloadable patch advertised by the update server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Patch {
    /// Patch type, `partial` or `complete`.
    #[serde(rename = "@type")]
    pub patch_type: String,
    /// Download URL.
    #[serde(rename = "@URL")]
    pub url: String,
    /// Hash function name; only `SHA512` is accepted downstream.
    #[serde(rename = "@hashFunction")]
    pub hash_function: String,
    /// Expected digest, hex.
    #[serde(rename = "@hashValue")]
    pub hash_value: String,
    /// Advertised size in bytes.
    #[serde(rename = "@size", default)]
    pub size: u64,
}

/// The parsed update offer.
#[derive(Debug, Clone)]
pub struct UpdateEntry {
    /// Version the update produces.
    pub app_version: String,
    /// Advertised patches, at most one per type.
    pub patches: Vec<Patch>,
}

// =============================================================================
// Parsing and Selection
// =============================================================================

/// Parses an `updates.xml` document into an [`UpdateEntry`].
///
/// # Errors
///
/// Malformed XML, zero or multiple `<update>` elements.
pub fn parse_update_xml(raw: &[u8]) -> Result<UpdateEntry> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::UpdateMetadata("document is not UTF-8".into()))?;
    let updates: Updates = quick_xml::de::from_str(text)
        .map_err(|e| Error::UpdateMetadata(format!("malformed updates.xml: {e}")))?;

    let mut elements = updates.update;
    if elements.len() != 1 {
        return Err(Error::UpdateMetadata(format!(
            "expected exactly one update element, got {}",
            elements.len()
        )));
    }
    let update = elements.remove(0);

    Ok(UpdateEntry {
        app_version: update.app_version,
        patches: update.patch,
    })
}

/// Selects the patch to apply: `partial` is favored over `complete`.
///
/// # Errors
///
/// Duplicate patch types, or no usable patch at all.
pub fn select_patch(entry: &UpdateEntry) -> Result<&Patch> {
    let mut by_type: HashMap<&str, &Patch> = HashMap::new();
    for patch in &entry.patches {
        if by_type.insert(patch.patch_type.as_str(), patch).is_some() {
            return Err(Error::UpdateMetadata(format!(
                "duplicate patch entry for type '{}'",
                patch.patch_type
            )));
        }
    }

    by_type
        .get(PATCH_PARTIAL)
        .or_else(|| by_type.get(PATCH_COMPLETE))
        .copied()
        .ok_or_else(|| Error::UpdateMetadata("no suitable patch found".into()))
}

// =============================================================================
// Tests
// =============================================================================
