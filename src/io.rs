//! Project and cel persistence.
//!
//! Documents serialize to a bincode container with a magic/version tag,
//! preserving the cel table — including link groups, so shared surfaces are
//! stored once and come back shared.  Single cels serialize to a small
//! clipboard format for copy/paste between documents.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cels::{Cel, CelKey, FrameId, LayerId, LinkType, SurfaceId};
use crate::document::{Document, Frame, Layer};
use crate::surface::{PixelSurface, Rect};

/// Magic header for the document format (v1).
const DOC_MAGIC_V1: &str = "RCL1";
/// Magic header for the single-cel clipboard format.
const CEL_MAGIC_V1: &str = "RCC1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a project file.
const MAX_LAYERS: usize = 1024;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Serialize(String),
    InvalidFormat(String),
}

impl std::fmt::Display for ProjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "I/O error: {}", e),
            ProjectError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ProjectError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<Box<bincode::ErrorKind>> for ProjectError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ProjectError::Serialize(e.to_string())
    }
}

// ============================================================================
// DOCUMENT FILE FORMAT (v1)
// ============================================================================

#[derive(Serialize, Deserialize)]
struct DocumentFileV1 {
    magic: String,
    width: u32,
    height: u32,
    active_layer_index: usize,
    active_frame_index: usize,
    layers: Vec<LayerRecord>,
    frames: Vec<FrameRecord>,
    /// Distinct surfaces, stored once each.  The empty singleton is omitted.
    surfaces: Vec<SurfaceRecord>,
    cels: Vec<CelRecord>,
}

#[derive(Serialize, Deserialize)]
struct LayerRecord {
    id: u32,
    name: String,
    visible: bool,
    opacity: u8,
}

#[derive(Serialize, Deserialize)]
struct FrameRecord {
    id: u32,
    duration_ms: u32,
}

#[derive(Serialize, Deserialize)]
struct SurfaceRecord {
    id: u32,
    pixels: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct CelRecord {
    layer: u32,
    frame: u32,
    /// Surface id within the file; 0 means the empty singleton.
    surface: u32,
    link_group: Option<u32>,
    link_type: LinkType,
    opacity: Option<u8>,
}

/// Build the serializable v1 container from a document.  This copies pixel
/// data, so the result can be handed to a background thread for the write.
fn build_document_v1(doc: &Document) -> DocumentFileV1 {
    let layers = doc
        .layers
        .iter()
        .map(|l| LayerRecord {
            id: l.id.0,
            name: l.name.clone(),
            visible: l.visible,
            opacity: l.opacity,
        })
        .collect();
    let frames = doc
        .frames
        .iter()
        .map(|f| FrameRecord { id: f.id.0, duration_ms: f.duration_ms })
        .collect();

    // Store each referenced surface once; cels keep pointing at its id.
    let mut seen: Vec<u32> = Vec::new();
    let mut surfaces = Vec::new();
    let mut cels = Vec::new();
    for key in doc.cels.cel_keys().collect::<Vec<_>>() {
        let Some(cel) = doc.cels.cel(key) else { continue };
        if cel.surface != SurfaceId::EMPTY && !seen.contains(&cel.surface.0) {
            if let Some(surface) = doc.cels.surface(cel.surface) {
                seen.push(cel.surface.0);
                surfaces.push(SurfaceRecord {
                    id: cel.surface.0,
                    pixels: surface.bytes().to_vec(),
                });
            }
        }
        cels.push(CelRecord {
            layer: key.layer.0,
            frame: key.frame.0,
            surface: cel.surface.0,
            link_group: cel.link_group.map(|g| g.0),
            link_type: cel.link_type,
            opacity: cel.opacity,
        });
    }

    DocumentFileV1 {
        magic: DOC_MAGIC_V1.to_string(),
        width: doc.width(),
        height: doc.height(),
        active_layer_index: doc.layer_index(doc.active_layer).unwrap_or(0),
        active_frame_index: doc.frame_index(doc.active_frame).unwrap_or(0),
        layers,
        frames,
        surfaces,
        cels,
    }
}

pub fn encode_document(doc: &Document) -> Result<Vec<u8>, ProjectError> {
    Ok(bincode::serialize(&build_document_v1(doc))?)
}

pub fn save_document(doc: &Document, path: &Path) -> Result<(), ProjectError> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &build_document_v1(doc))?;
    crate::log_info!("saved document {} to {}", doc.id, path.display());
    Ok(())
}

pub fn load_document(path: &Path) -> Result<Document, ProjectError> {
    let raw = std::fs::read(path)?;
    let doc = decode_document(&raw)?;
    crate::log_info!(
        "loaded document from {} ({}x{}, {} layers, {} frames)",
        path.display(),
        doc.width(),
        doc.height(),
        doc.layers.len(),
        doc.frames.len()
    );
    Ok(doc)
}

pub fn decode_document(raw: &[u8]) -> Result<Document, ProjectError> {
    // bincode encodes a String as an 8-byte length prefix + UTF-8 data, so
    // the 4-char magic sits at bytes 8..12.
    if raw.len() < 12 {
        return Err(ProjectError::InvalidFormat("File too small".into()));
    }
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != DOC_MAGIC_V1 {
        return Err(ProjectError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }
    let file: DocumentFileV1 = bincode::deserialize(raw)?;
    rebuild_document(file)
}

fn rebuild_document(file: DocumentFileV1) -> Result<Document, ProjectError> {
    if file.width == 0 || file.height == 0 {
        return Err(ProjectError::InvalidFormat("Canvas dimensions cannot be zero".into()));
    }
    if file.width > MAX_CANVAS_DIM || file.height > MAX_CANVAS_DIM {
        return Err(ProjectError::InvalidFormat(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            file.width, file.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if (file.width as u64) * (file.height as u64) > crate::surface::MAX_SURFACE_PIXELS {
        return Err(ProjectError::InvalidFormat(format!(
            "Canvas area {}x{} exceeds the {}-pixel surface limit",
            file.width,
            file.height,
            crate::surface::MAX_SURFACE_PIXELS
        )));
    }
    if file.layers.is_empty() || file.frames.is_empty() {
        return Err(ProjectError::InvalidFormat(
            "Document must contain at least one layer and one frame".into(),
        ));
    }
    if file.layers.len() > MAX_LAYERS {
        return Err(ProjectError::InvalidFormat(format!(
            "Document contains {} layers, which exceeds the maximum of {}",
            file.layers.len(),
            MAX_LAYERS
        )));
    }

    let mut doc = Document::bare(file.width, file.height);
    let expected_bytes = (file.width as usize) * (file.height as usize) * 4;

    for l in &file.layers {
        doc.layers.push(Layer {
            id: LayerId(l.id),
            name: l.name.clone(),
            visible: l.visible,
            opacity: l.opacity,
        });
    }
    for f in &file.frames {
        doc.frames.push(Frame { id: FrameId(f.id), duration_ms: f.duration_ms });
    }
    doc.restore_id_counters(
        file.layers.iter().map(|l| l.id).max().map_or(0, |m| m + 1),
        file.frames.iter().map(|f| f.id).max().map_or(0, |m| m + 1),
    );

    // Surface ids are reassigned on insert; remap cel references.
    let mut id_map: Vec<(u32, SurfaceId)> = Vec::with_capacity(file.surfaces.len());
    for s in file.surfaces {
        if s.pixels.len() != expected_bytes {
            return Err(ProjectError::InvalidFormat(format!(
                "Surface {} has {} bytes, expected {} ({}x{}x4)",
                s.id,
                s.pixels.len(),
                expected_bytes,
                file.width,
                file.height,
            )));
        }
        let new_id = doc
            .cels
            .insert_surface(PixelSurface::from_bytes(file.width, file.height, s.pixels));
        id_map.push((s.id, new_id));
    }

    for c in file.cels {
        let surface = if c.surface == SurfaceId::EMPTY.0 {
            SurfaceId::EMPTY
        } else {
            match id_map.iter().find(|(old, _)| *old == c.surface) {
                Some(&(_, new)) => new,
                None => {
                    return Err(ProjectError::InvalidFormat(format!(
                        "Cel ({},{}) references missing surface {}",
                        c.layer, c.frame, c.surface
                    )));
                }
            }
        };
        doc.cels.insert_cel(
            CelKey::new(LayerId(c.layer), FrameId(c.frame)),
            Cel {
                surface,
                link_group: c.link_group.map(crate::cels::LinkGroupId),
                link_type: c.link_type,
                opacity: c.opacity,
            },
        );
    }

    let active_layer = file.active_layer_index.min(doc.layers.len() - 1);
    let active_frame = file.active_frame_index.min(doc.frames.len() - 1);
    doc.active_layer = doc.layers[active_layer].id;
    doc.active_frame = doc.frames[active_frame].id;
    Ok(doc)
}

// ============================================================================
// SINGLE-CEL CLIPBOARD FORMAT
// ============================================================================

#[derive(Serialize, Deserialize)]
struct CelFileV1 {
    magic: String,
    width: u32,
    height: u32,
    opacity: Option<u8>,
    pixels: Vec<u8>,
}

/// Serialize one cel's pixels for copy/paste.  Blank cels serialize too —
/// pasting them produces a blank cel.
pub fn encode_cel(doc: &Document, layer: LayerId, frame: FrameId) -> Result<Vec<u8>, ProjectError> {
    let key = CelKey::new(layer, frame);
    let (surface_id, opacity) = doc
        .cels
        .cel(key)
        .map(|c| (c.surface, c.opacity))
        .unwrap_or((SurfaceId::EMPTY, None));
    let surface = doc
        .cels
        .surface(surface_id)
        .ok_or_else(|| ProjectError::InvalidFormat("Cel references a missing surface".into()))?;
    let data = CelFileV1 {
        magic: CEL_MAGIC_V1.to_string(),
        width: doc.width(),
        height: doc.height(),
        opacity,
        pixels: surface.bytes().to_vec(),
    };
    Ok(bincode::serialize(&data)?)
}

/// Paste previously serialized cel pixels onto a cel of `doc`.  The source
/// document must have the same canvas size.
pub fn decode_cel_onto(
    doc: &mut Document,
    layer: LayerId,
    frame: FrameId,
    raw: &[u8],
) -> Result<(), ProjectError> {
    if raw.len() < 12 {
        return Err(ProjectError::InvalidFormat("Cel data too small".into()));
    }
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != CEL_MAGIC_V1 {
        return Err(ProjectError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }
    let data: CelFileV1 = bincode::deserialize(raw)?;
    if data.width != doc.width() || data.height != doc.height() {
        return Err(ProjectError::InvalidFormat(format!(
            "Cel size {}x{} does not match canvas {}x{}",
            data.width,
            data.height,
            doc.width(),
            doc.height()
        )));
    }
    let expected = (data.width as usize) * (data.height as usize) * 4;
    if data.pixels.len() != expected {
        return Err(ProjectError::InvalidFormat(format!(
            "Cel has {} bytes, expected {}",
            data.pixels.len(),
            expected
        )));
    }

    let key = CelKey::new(layer, frame);
    doc.cels.ensure_independent(key);
    let id = doc.cels.get_surface(key);
    let full = Rect::from_min_max(0, 0, data.width as i32, data.height as i32);
    if let Some(surface) = doc.cels.surface_mut(id) {
        surface.write_rect(full, &data.pixels);
    }
    doc.cels.set_cel_opacity(key, data.opacity);
    doc.scheduler.mark_dirty(None);
    Ok(())
}
