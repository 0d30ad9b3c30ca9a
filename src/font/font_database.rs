//! System font lookup backed by fontdb.

use super::{FontSpec, FontStyle};
use crate::error::{RenderError, Result};
use fontdb::{Database, Family, Query, Source, Stretch, Style, Weight, ID};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Font faces known to the process, with file contents loaded on demand.
///
/// Face bytes are read once per face and shared; atlases built from the same
/// face reuse the cached copy.
pub struct FontDatabase {
    db: Database,
    loaded: Mutex<HashMap<ID, Arc<Vec<u8>>>>,
}

impl FontDatabase {
    /// Scans the system font directories.
    pub fn new() -> Self {
        let mut db = Database::new();
        db.load_system_fonts();
        info!("Loaded {} system fonts", db.len());
        Self::with_database(db)
    }

    /// Holds only the faces of the given font files.
    pub fn from_font_data(fonts: Vec<Vec<u8>>) -> Self {
        let mut db = Database::new();
        for data in fonts {
            db.load_font_data(data);
        }
        debug!("Loaded {} faces from memory", db.len());
        Self::with_database(db)
    }

    fn with_database(db: Database) -> Self {
        Self {
            db,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// First face whose family name matches, ignoring ASCII case.
    pub fn find_font(&self, family: &str) -> Option<ID> {
        self.db.faces().find_map(|face| {
            let matches = face.families.iter().any(|(name, _)| name.eq_ignore_ascii_case(family));
            matches.then_some(face.id)
        })
    }

    /// Face of `family` closest to `style`.
    pub fn query(&self, family: &str, style: FontStyle) -> Option<ID> {
        let families = [Family::Name(family)];
        let query = Query {
            families: &families,
            weight: if style.bold { Weight::BOLD } else { Weight::NORMAL },
            stretch: Stretch::Normal,
            style: if style.italic { Style::Italic } else { Style::Normal },
        };
        self.db.query(&query).or_else(|| self.find_font(family))
    }

    pub fn default_font(&self) -> Option<ID> {
        self.db.faces().next().map(|face| face.id)
    }

    /// Bytes of the file holding face `id`.
    pub fn get_font_data(&self, id: ID) -> Option<Arc<Vec<u8>>> {
        if let Some(data) = self.loaded.lock().unwrap_or_else(PoisonError::into_inner).get(&id) {
            return Some(data.clone());
        }

        let (source, _) = self.db.face_source(id)?;
        let bytes = match source {
            Source::Binary(data) => data.as_ref().as_ref().to_vec(),
            Source::File(path) | Source::SharedFile(path, _) => match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read font file {:?}: {}", path, e);
                    return None;
                }
            },
        };

        let data = Arc::new(bytes);
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, data.clone());
        Some(data)
    }

    /// Font bytes and face index for `spec`.
    ///
    /// An unknown family falls back to the first face in the database.
    pub fn resolve(&self, spec: &FontSpec) -> Result<(Arc<Vec<u8>>, u32)> {
        let id = match self.query(&spec.family, spec.style) {
            Some(id) => id,
            None => {
                warn!("Font family '{}' not found, using default font", spec.family);
                self.default_font()
                    .ok_or_else(|| RenderError::RasterizerFailure("no fonts available".into()))?
            }
        };

        let index = self.db.face(id).map_or(0, |face| face.index);
        let data = self
            .get_font_data(id)
            .ok_or_else(|| RenderError::RasterizerFailure(format!("failed to load font data for '{}'", spec.family)))?;
        Ok((data, index))
    }

    /// Sorted, deduplicated family names.
    pub fn list_families(&self) -> Vec<String> {
        let mut families: Vec<String> = self
            .db
            .faces()
            .flat_map(|face| face.families.iter().map(|(name, _)| name.clone()))
            .collect();
        families.sort_unstable();
        families.dedup();
        families
    }
}

impl Default for FontDatabase {
    fn default() -> Self {
        Self::new()
    }
}
