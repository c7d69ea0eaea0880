//! Tracks: typed, ordered lanes of elements.

use serde::{Deserialize, Serialize};

use crate::element::Element;

/// What a track holds. Fixed when the track is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Media,
    Audio,
    Text,
    Sticker,
    Caption,
    Effect,
    ProgrammaticComponent,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Media => "media",
            TrackKind::Audio => "audio",
            TrackKind::Text => "text",
            TrackKind::Sticker => "sticker",
            TrackKind::Caption => "caption",
            TrackKind::Effect => "effect",
            TrackKind::ProgrammaticComponent => "programmatic_component",
        }
    }

    /// Whether elements of this kind draw pixels.
    pub fn is_visual(self) -> bool {
        !matches!(self, TrackKind::Audio)
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered lane of elements. Later tracks draw above earlier ones.
///
/// Fields are private: the kind never changes after creation and elements are
/// only inserted through [`crate::Timeline`], which validates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    id: String,
    kind: TrackKind,
    #[serde(default)]
    name: String,
    #[serde(default)]
    elements: Vec<Element>,
}

impl Track {
    /// Create an empty track.
    pub fn new(id: impl Into<String>, kind: TrackKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            elements: vec![],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Elements ordered by start time.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, element_id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == element_id)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Insert keeping start-time order; equal starts keep insertion order.
    pub(crate) fn insert_sorted(&mut self, element: Element) {
        let idx = self
            .elements
            .partition_point(|e| e.start_time <= element.start_time);
        self.elements.insert(idx, element);
    }

    pub(crate) fn take(&mut self, element_id: &str) -> Option<Element> {
        let idx = self.elements.iter().position(|e| e.id == element_id)?;
        Some(self.elements.remove(idx))
    }

    pub(crate) fn take_all(&mut self) -> Vec<Element> {
        std::mem::take(&mut self.elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{AudioPayload, ElementPayload, SourceRef};

    fn clip(id: &str, start: f64) -> Element {
        Element::new(
            id,
            start,
            1.0,
            ElementPayload::Audio(AudioPayload {
                source: SourceRef::new("a.wav"),
                volume: 1.0,
                muted: false,
            }),
        )
    }

    #[test]
    fn test_insert_sorted_keeps_start_order() {
        let mut track = Track::new("a1", TrackKind::Audio, "Music");
        track.insert_sorted(clip("c", 4.0));
        track.insert_sorted(clip("a", 0.0));
        track.insert_sorted(clip("b", 2.0));
        track.insert_sorted(clip("b2", 2.0));

        let ids: Vec<&str> = track.elements().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "b2", "c"]);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TrackKind::ProgrammaticComponent).unwrap();
        assert_eq!(json, "\"programmatic_component\"");
    }
}
