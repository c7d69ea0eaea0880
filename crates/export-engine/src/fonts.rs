//! Font catalog: maps `(family, weight, style)` requests to concrete files.
//!
//! Resolution is a pure lookup over the configured catalog. Missing families
//! fall back to the default family and record a warning instead of failing.

use std::path::PathBuf;

use splice_common::config::FontConfig;
use splice_timeline::{FontStyle, FontWeight, TextPayload};

/// One concrete font file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontFace {
    pub family: String,
    pub weight: u16,
    pub italic: bool,
    pub path: PathBuf,
}

/// Outcome of a font lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFont {
    /// Family actually used.
    pub family: String,

    /// Font file, when the catalog has one for the family.
    pub path: Option<PathBuf>,

    /// Set when the requested family or variant was not available.
    pub warning: Option<String>,
}

/// Configured font families.
#[derive(Debug, Clone, Default)]
pub struct FontCatalog {
    default_family: String,
    faces: Vec<FontFace>,
}

impl FontCatalog {
    pub fn new(default_family: impl Into<String>, faces: Vec<FontFace>) -> Self {
        Self {
            default_family: default_family.into(),
            faces,
        }
    }

    pub fn from_config(config: &FontConfig) -> Self {
        let faces = config
            .families
            .iter()
            .flat_map(|family| {
                family.files.iter().map(move |file| FontFace {
                    family: family.family.clone(),
                    weight: file.weight,
                    italic: file.italic,
                    path: file.path.clone(),
                })
            })
            .collect();
        Self::new(config.default_family.clone(), faces)
    }

    pub fn default_family(&self) -> &str {
        &self.default_family
    }

    /// Resolve the font for a text payload.
    pub fn resolve_text(&self, text: &TextPayload) -> ResolvedFont {
        let weight = text.font_weight.unwrap_or(FontWeight::Normal).value();
        let italic = text.font_style == Some(FontStyle::Italic);
        self.resolve(&text.font_family, weight, italic)
    }

    /// Closest variant of `family`, else the closest variant of the default family.
    pub fn resolve(&self, family: &str, weight: u16, italic: bool) -> ResolvedFont {
        if let Some(face) = self.best_face(family, weight, italic) {
            let warning = (face.weight != weight || face.italic != italic).then(|| {
                format!(
                    "font '{family}' has no {} {weight} variant; using {} {}",
                    style_name(italic),
                    style_name(face.italic),
                    face.weight
                )
            });
            return ResolvedFont {
                family: face.family.clone(),
                path: Some(face.path.clone()),
                warning,
            };
        }

        let fallback = self.best_face(&self.default_family, weight, italic);
        let warning = Some(match fallback {
            Some(_) => format!(
                "font '{family}' not found; falling back to '{}'",
                self.default_family
            ),
            None => format!(
                "font '{family}' not found and default family '{}' has no files",
                self.default_family
            ),
        });
        match fallback {
            Some(face) => ResolvedFont {
                family: face.family.clone(),
                path: Some(face.path.clone()),
                warning,
            },
            // Nothing configured: leave the family name for the system to resolve.
            None => ResolvedFont {
                family: family.to_string(),
                path: None,
                warning,
            },
        }
    }

    fn best_face(&self, family: &str, weight: u16, italic: bool) -> Option<&FontFace> {
        self.faces
            .iter()
            .filter(|face| face.family.eq_ignore_ascii_case(family))
            .min_by_key(|face| {
                (
                    face.italic != italic,
                    (i32::from(face.weight) - i32::from(weight)).unsigned_abs(),
                )
            })
    }
}

fn style_name(italic: bool) -> &'static str {
    if italic {
        "italic"
    } else {
        "normal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> FontCatalog {
        let face = |family: &str, weight, italic, path: &str| FontFace {
            family: family.to_string(),
            weight,
            italic,
            path: PathBuf::from(path),
        };
        FontCatalog::new(
            "DejaVu Sans",
            vec![
                face("DejaVu Sans", 400, false, "/f/DejaVuSans.ttf"),
                face("DejaVu Sans", 700, false, "/f/DejaVuSans-Bold.ttf"),
                face("Inter", 400, false, "/f/Inter-Regular.ttf"),
                face("Inter", 700, true, "/f/Inter-BoldItalic.ttf"),
            ],
        )
    }

    #[test]
    fn test_exact_variant_has_no_warning() {
        let font = catalog().resolve("inter", 700, true);
        assert_eq!(font.path, Some(PathBuf::from("/f/Inter-BoldItalic.ttf")));
        assert!(font.warning.is_none());
    }

    #[test]
    fn test_style_preferred_over_weight() {
        let font = catalog().resolve("Inter", 400, true);
        assert_eq!(font.path, Some(PathBuf::from("/f/Inter-BoldItalic.ttf")));
        assert!(font.warning.is_some());
    }

    #[test]
    fn test_unknown_family_falls_back_with_warning() {
        let font = catalog().resolve("Comic Neue", 700, false);
        assert_eq!(font.family, "DejaVu Sans");
        assert_eq!(font.path, Some(PathBuf::from("/f/DejaVuSans-Bold.ttf")));
        assert!(font.warning.unwrap().contains("Comic Neue"));
    }

    #[test]
    fn test_empty_catalog_resolves_without_path() {
        let font = FontCatalog::new("Sans", vec![]).resolve("Inter", 400, false);
        assert_eq!(font.family, "Inter");
        assert!(font.path.is_none());
        assert!(font.warning.is_some());
    }
}
