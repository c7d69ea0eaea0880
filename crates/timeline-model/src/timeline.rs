//! The editable timeline, its query layer, and export snapshots.

use std::collections::HashSet;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use splice_common::error::SpliceError;

use crate::element::Element;
use crate::track::{Track, TrackKind};

/// Ordered set of tracks. Track order is z-order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Schema version.
    pub version: String,

    tracks: Vec<Track>,
}

/// An element visible at a given time, with its stacking position.
#[derive(Debug, Clone, Copy)]
pub struct ActiveElement<'a> {
    /// Index of the owning track (z-order).
    pub track_index: usize,
    pub track_kind: TrackKind,
    pub element: &'a Element,
}

/// Errors raised by timeline mutations and document I/O.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid element {id}: {message}")]
    InvalidElement { id: String, message: String },

    #[error("Element {element} ({found}) cannot be placed on {expected} track {track}")]
    KindMismatch {
        track: String,
        element: String,
        expected: TrackKind,
        found: TrackKind,
    },

    #[error("Duplicate id: {id}")]
    DuplicateId { id: String },

    #[error("Track not found: {id}")]
    TrackNotFound { id: String },

    #[error("Element not found: {id}")]
    ElementNotFound { id: String },

    #[error("Invalid export settings: {message}")]
    InvalidSettings { message: String },

    #[error("Timeline lock poisoned")]
    Poisoned,
}

impl From<ModelError> for SpliceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::IoError { path, source } if source.kind() == std::io::ErrorKind::NotFound => {
                SpliceError::FileNotFound { path }
            }
            ModelError::IoError { source, .. } => SpliceError::Io(source),
            ModelError::Poisoned => SpliceError::resource("timeline lock poisoned"),
            other => SpliceError::validation(other.to_string()),
        }
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            tracks: vec![],
        }
    }

    /// Tracks in z-order (first is bottom-most).
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, track_id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == track_id)
    }

    /// Every element with its track index, in track order then start time.
    pub fn elements(&self) -> impl Iterator<Item = ActiveElement<'_>> {
        self.tracks.iter().enumerate().flat_map(|(idx, track)| {
            track.elements().iter().map(move |element| ActiveElement {
                track_index: idx,
                track_kind: track.kind(),
                element,
            })
        })
    }

    pub fn find_element(&self, element_id: &str) -> Option<ActiveElement<'_>> {
        self.elements().find(|a| a.element.id == element_id)
    }

    /// Append a track on top of the stack.
    pub fn add_track(&mut self, track: Track) -> Result<(), ModelError> {
        if self.track(track.id()).is_some() {
            return Err(ModelError::DuplicateId {
                id: track.id().to_string(),
            });
        }
        let mut track = track;
        let elements = track.take_all();
        self.tracks.push(track);
        let track_id = self.tracks[self.tracks.len() - 1].id().to_string();
        for element in elements {
            if let Err(e) = self.add_element(&track_id, element) {
                self.tracks.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove a track and all of its elements.
    pub fn remove_track(&mut self, track_id: &str) -> Result<Track, ModelError> {
        let idx = self
            .tracks
            .iter()
            .position(|t| t.id() == track_id)
            .ok_or_else(|| ModelError::TrackNotFound {
                id: track_id.to_string(),
            })?;
        Ok(self.tracks.remove(idx))
    }

    /// Insert a validated element into a track.
    pub fn add_element(&mut self, track_id: &str, element: Element) -> Result<(), ModelError> {
        if self.find_element(&element.id).is_some() {
            return Err(ModelError::DuplicateId { id: element.id });
        }
        let track = self.track_mut(track_id)?;
        check_element(track, &element)?;
        track.insert_sorted(element);
        Ok(())
    }

    /// Replace an existing element (matched by id) on the given track.
    pub fn update_element(&mut self, track_id: &str, element: Element) -> Result<(), ModelError> {
        let track = self.track_mut(track_id)?;
        check_element(track, &element)?;
        track
            .take(&element.id)
            .ok_or_else(|| ModelError::ElementNotFound {
                id: element.id.clone(),
            })?;
        track.insert_sorted(element);
        Ok(())
    }

    pub fn remove_element(
        &mut self,
        track_id: &str,
        element_id: &str,
    ) -> Result<Element, ModelError> {
        self.track_mut(track_id)?
            .take(element_id)
            .ok_or_else(|| ModelError::ElementNotFound {
                id: element_id.to_string(),
            })
    }

    /// Shift an element to a new start time.
    pub fn move_element(
        &mut self,
        track_id: &str,
        element_id: &str,
        start_time: f64,
    ) -> Result<(), ModelError> {
        let mut element = self
            .track(track_id)
            .ok_or_else(|| ModelError::TrackNotFound {
                id: track_id.to_string(),
            })?
            .element(element_id)
            .cloned()
            .ok_or_else(|| ModelError::ElementNotFound {
                id: element_id.to_string(),
            })?;
        element.start_time = start_time;
        self.update_element(track_id, element)
    }

    /// Timeline length: the latest element end, `0.0` when empty.
    pub fn compute_duration(&self) -> f64 {
        self.elements()
            .map(|a| a.element.end_time())
            .fold(0.0, f64::max)
    }

    /// Non-hidden elements visible at `time_secs`, bottom-most first.
    pub fn active_elements_at(&self, time_secs: f64) -> Vec<ActiveElement<'_>> {
        self.elements()
            .filter(|a| !a.element.hidden && a.element.visible_window().contains(time_secs))
            .collect()
    }

    /// Re-check every invariant. Used for documents that bypassed the mutators.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut track_ids = HashSet::new();
        let mut element_ids = HashSet::new();
        for track in &self.tracks {
            if !track_ids.insert(track.id()) {
                return Err(ModelError::DuplicateId {
                    id: track.id().to_string(),
                });
            }
            for element in track.elements() {
                if !element_ids.insert(element.id.as_str()) {
                    return Err(ModelError::DuplicateId {
                        id: element.id.clone(),
                    });
                }
                check_element(track, element)?;
            }
            let ordered = track
                .elements()
                .windows(2)
                .all(|pair| pair[0].start_time <= pair[1].start_time);
            if !ordered {
                return Err(ModelError::InvalidElement {
                    id: track.id().to_string(),
                    message: "elements are not ordered by start time".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Load and validate a timeline document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ModelError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let timeline: Timeline =
            serde_json::from_str(&json).map_err(|e| ModelError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })?;
        timeline.validate()?;
        Ok(timeline)
    }

    /// Save the timeline as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ModelError::IoError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ModelError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| ModelError::IoError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn track_mut(&mut self, track_id: &str) -> Result<&mut Track, ModelError> {
        self.tracks
            .iter_mut()
            .find(|t| t.id() == track_id)
            .ok_or_else(|| ModelError::TrackNotFound {
                id: track_id.to_string(),
            })
    }
}

fn check_element(track: &Track, element: &Element) -> Result<(), ModelError> {
    element
        .validate()
        .map_err(|message| ModelError::InvalidElement {
            id: element.id.clone(),
            message,
        })?;
    let found = element.payload.track_kind();
    if found != track.kind() {
        return Err(ModelError::KindMismatch {
            track: track.id().to_string(),
            element: element.id.clone(),
            expected: track.kind(),
            found,
        });
    }
    Ok(())
}

/// Immutable copy of a timeline taken at export start.
#[derive(Debug, Clone)]
pub struct TimelineSnapshot {
    timeline: Arc<Timeline>,
    revision: u64,
}

impl TimelineSnapshot {
    /// Wrap an already-owned timeline (e.g. one loaded from disk).
    pub fn from_timeline(timeline: Timeline) -> Self {
        Self {
            timeline: Arc::new(timeline),
            revision: 0,
        }
    }

    /// Edit revision of the shared timeline when this snapshot was taken.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

impl Deref for TimelineSnapshot {
    type Target = Timeline;

    fn deref(&self) -> &Timeline {
        &self.timeline
    }
}

#[derive(Debug, Default)]
struct Revisioned {
    timeline: Timeline,
    revision: u64,
}

/// Editor-owned timeline shared with export sessions.
///
/// Edits take the write lock; snapshots deep-copy under the read lock so an
/// export never observes a half-applied edit.
#[derive(Debug, Clone, Default)]
pub struct SharedTimeline {
    inner: Arc<RwLock<Revisioned>>,
}

impl SharedTimeline {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Revisioned {
                timeline,
                revision: 0,
            })),
        }
    }

    /// Apply an edit atomically. A failed edit leaves the timeline untouched.
    pub fn edit<T>(
        &self,
        f: impl FnOnce(&mut Timeline) -> Result<T, ModelError>,
    ) -> Result<T, ModelError> {
        let mut guard = self.inner.write().map_err(|_| ModelError::Poisoned)?;
        let mut draft = guard.timeline.clone();
        let out = f(&mut draft)?;
        guard.timeline = draft;
        guard.revision += 1;
        Ok(out)
    }

    /// Copy-on-read snapshot.
    pub fn snapshot(&self) -> Result<TimelineSnapshot, ModelError> {
        let guard = self.inner.read().map_err(|_| ModelError::Poisoned)?;
        Ok(TimelineSnapshot {
            timeline: Arc::new(guard.timeline.clone()),
            revision: guard.revision,
        })
    }

    pub fn revision(&self) -> Result<u64, ModelError> {
        Ok(self.inner.read().map_err(|_| ModelError::Poisoned)?.revision)
    }
}
