//! Programmatic component collaborators.
//!
//! Components are authored and bundled outside the pipeline. The export side
//! only consumes two things: the bundler's reports, which become
//! `Component` element payloads, and a renderer that draws a live component
//! frame during compositing.

use std::path::Path;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::{ComponentPayload, RenderMode, SourceRef};

/// Result of validating a component project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A composition exported by a component project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionInfo {
    pub id: String,
    pub duration_frames: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl CompositionInfo {
    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.duration_frames as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// Result of scanning a component project for compositions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub is_valid: bool,
    #[serde(default)]
    pub compositions: Vec<CompositionInfo>,
    #[serde(default)]
    pub root_path: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Per-component bundling outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleResult {
    pub component_id: String,
    pub success: bool,
    /// Bundled module source, on success.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Result of bundling selected components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleReport {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<BundleResult>,
}

/// External component bundler.
pub trait ComponentBundler: Send + Sync {
    fn validate(&self, path: &Path) -> SpliceResult<ValidationReport>;

    fn scan(&self, path: &Path) -> SpliceResult<ScanReport>;

    fn bundle(&self, path: &Path, component_ids: &[String]) -> SpliceResult<BundleReport>;
}

/// Renders one frame of a live component.
pub trait ComponentRenderer: Send + Sync {
    /// Draw `component` at `local_time_secs` (seconds since the element's
    /// visible window opened) onto a transparent `width` x `height` surface.
    fn render_frame(
        &self,
        component: &ComponentPayload,
        local_time_secs: f64,
        width: u32,
        height: u32,
    ) -> SpliceResult<RgbaImage>;
}

/// Turn a successful bundle result into a component element payload.
///
/// `prerendered` switches the payload to prerendered mode backed by the given
/// rendered asset.
pub fn component_payload_from_bundle(
    result: &BundleResult,
    props: serde_json::Map<String, serde_json::Value>,
    prerendered: Option<SourceRef>,
) -> SpliceResult<ComponentPayload> {
    if !result.success {
        return Err(SpliceError::validation(format!(
            "component {} failed to bundle: {}",
            result.component_id,
            result.error.as_deref().unwrap_or("unknown error")
        )));
    }
    if result.code.as_deref().map_or(true, str::is_empty) {
        return Err(SpliceError::validation(format!(
            "component {} bundled without code",
            result.component_id
        )));
    }

    let render_mode = if prerendered.is_some() {
        RenderMode::Prerendered
    } else {
        RenderMode::Live
    };
    Ok(ComponentPayload {
        component_id: result.component_id.clone(),
        props,
        render_mode,
        prerendered_source: prerendered,
    })
}

/// Bundle `component_id` from `path`, checking validation and scan first.
///
/// Returns the payload and the matching composition's metadata.
pub fn import_component(
    bundler: &dyn ComponentBundler,
    path: &Path,
    component_id: &str,
) -> SpliceResult<(ComponentPayload, CompositionInfo)> {
    let validation = bundler.validate(path)?;
    if !validation.is_valid {
        return Err(SpliceError::validation(format!(
            "component project {} is invalid: {}",
            path.display(),
            validation.errors.join("; ")
        )));
    }

    let scan = bundler.scan(path)?;
    let composition = scan
        .compositions
        .into_iter()
        .find(|c| c.id == component_id)
        .ok_or_else(|| {
            SpliceError::validation(format!(
                "component {component_id} not found in {}",
                path.display()
            ))
        })?;

    let report = bundler.bundle(path, &[component_id.to_string()])?;
    let result = report
        .results
        .iter()
        .find(|r| r.component_id == component_id)
        .ok_or_else(|| {
            SpliceError::validation(format!("bundler returned no result for {component_id}"))
        })?;

    let payload = component_payload_from_bundle(result, Default::default(), None)?;
    tracing::info!(
        component_id,
        duration_secs = composition.duration_secs(),
        "Imported component"
    );
    Ok((payload, composition))
}
