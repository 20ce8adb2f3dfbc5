//! Output document assembly.
//!
//! Builds the output PDF either from raster frames (one full-page image per
//! frame) or by applying an [`EditPlan`] to an existing PDF.

use crate::protocol::{EditPlan, ReconstructionRequest, RequestBody};
use crate::raster::RasterFrame;
use crate::source::inherited;
use lopdf::encryption::DecryptionError;
use lopdf::{Document, Object, ObjectId};
use printpdf::{
    Image, ImageTransform, Mm, PdfDocument, PdfDocumentReference, PdfLayerIndex, PdfPageIndex,
};
use std::collections::HashSet;
use std::io::BufWriter;
use std::ops::ControlFlow;
use tracing::{debug, info};

/// Keys a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Errors that can occur during reconstruction.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructError {
    #[error("No pages provided")]
    NoPages,

    #[error("PDF creation error: {0}")]
    PdfCreation(String),

    #[error("Invalid page dimensions: width={width}, height={height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Invalid render scale: {0}")]
    InvalidScale(f32),

    #[error("Image creation error: {0}")]
    ImageCreation(String),

    #[error("Failed to load source PDF: {0}")]
    SourceLoad(String),

    #[error("Wrong decryption credential")]
    WrongCredential,

    #[error("Cannot decrypt source PDF: {0}")]
    UnsupportedEncryption(String),

    #[error("Page {page} does not exist (document has {page_count} pages)")]
    PageOutOfRange { page: u32, page_count: usize },

    #[error("Reconstruction cancelled")]
    Cancelled,
}

/// Title stamped into rasterized output.
const DOCUMENT_TITLE: &str = "Transcoded document";

/// Assembles output documents.
#[derive(Debug, Default)]
pub struct Reconstructor;

impl Reconstructor {
    pub fn new() -> Self {
        Reconstructor
    }

    /// Converts frame pixels to points (1/72 inch); `scale` is pixels per point.
    fn pixels_to_points(pixels: u32, scale: f32) -> f32 {
        pixels as f32 / scale
    }

    /// Converts points to millimeters.
    fn points_to_mm(points: f32) -> f32 {
        points * 0.352778
    }

    /// Runs a request to completion.
    ///
    /// `on_page(done, total)` is called after every assembled page; returning
    /// `ControlFlow::Break` abandons the work with `Cancelled`.
    pub fn reconstruct(
        &self,
        request: ReconstructionRequest,
        on_page: &mut dyn FnMut(usize, usize) -> ControlFlow<()>,
    ) -> Result<Vec<u8>, ReconstructError> {
        info!(
            tier = %request.tier,
            pages = request.page_count(),
            "Reconstructing document"
        );
        match request.body {
            RequestBody::Frames(frames) => self.assemble_frames(frames, on_page),
            RequestBody::Edit(plan) => self.assemble_edit(plan, on_page),
        }
    }

    /// Builds a PDF with one full-page image per frame.
    ///
    /// Each page is sized `pixels / scale` points, so output pages keep the
    /// dimensions of the pages they were rendered from.
    pub fn assemble_frames(
        &self,
        frames: Vec<RasterFrame>,
        on_page: &mut dyn FnMut(usize, usize) -> ControlFlow<()>,
    ) -> Result<Vec<u8>, ReconstructError> {
        let total = frames.len();
        let mut frames = frames.into_iter();
        let first = frames.next().ok_or(ReconstructError::NoPages)?;
        let (width_mm, height_mm) = Self::page_mm(&first)?;

        let (doc, page_idx, layer_idx) =
            PdfDocument::new(DOCUMENT_TITLE, Mm(width_mm), Mm(height_mm), "Layer 1");
        self.add_frame_image(&doc, page_idx, layer_idx, first)?;
        Self::checkpoint(on_page, 1, total)?;

        for (done, frame) in frames.enumerate() {
            let (width_mm, height_mm) = Self::page_mm(&frame)?;
            let (page_idx, layer_idx) = doc.add_page(Mm(width_mm), Mm(height_mm), "Layer 1");
            self.add_frame_image(&doc, page_idx, layer_idx, frame)?;
            Self::checkpoint(on_page, done + 2, total)?;
        }

        let mut buf = Vec::new();
        doc.save(&mut BufWriter::new(&mut buf))
            .map_err(|e| ReconstructError::PdfCreation(e.to_string()))?;

        debug!(bytes = buf.len(), "Rasterized document assembled");
        Ok(buf)
    }

    fn checkpoint(
        on_page: &mut dyn FnMut(usize, usize) -> ControlFlow<()>,
        done: usize,
        total: usize,
    ) -> Result<(), ReconstructError> {
        match on_page(done, total) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => Err(ReconstructError::Cancelled),
        }
    }

    fn page_mm(frame: &RasterFrame) -> Result<(f32, f32), ReconstructError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(ReconstructError::InvalidDimensions {
                width: frame.width,
                height: frame.height,
            });
        }
        if !frame.scale.is_finite() || frame.scale <= 0.0 {
            return Err(ReconstructError::InvalidScale(frame.scale));
        }
        Ok((
            Self::points_to_mm(Self::pixels_to_points(frame.width, frame.scale)),
            Self::points_to_mm(Self::pixels_to_points(frame.height, frame.scale)),
        ))
    }

    /// Decodes a frame and places it over the whole page.
    fn add_frame_image(
        &self,
        doc: &PdfDocumentReference,
        page_idx: PdfPageIndex,
        layer_idx: PdfLayerIndex,
        frame: RasterFrame,
    ) -> Result<(), ReconstructError> {
        let pixels = frame
            .decode()
            .map_err(|e| ReconstructError::ImageCreation(e.to_string()))?;
        if pixels.dimensions() != (frame.width, frame.height) {
            return Err(ReconstructError::ImageCreation(format!(
                "frame for page {} decodes to {}x{}, declared {}x{}",
                frame.page,
                pixels.width(),
                pixels.height(),
                frame.width,
                frame.height
            )));
        }

        let image = Image::from_dynamic_image(&::image::DynamicImage::ImageRgb8(pixels));
        let current_layer = doc.get_page(page_idx).get_layer(layer_idx);

        // An image placed at `dpi` spans pixels / dpi inches.
        image.add_to_layer(
            current_layer,
            ImageTransform {
                translate_x: Some(Mm(0.0)),
                translate_y: Some(Mm(0.0)),
                dpi: Some(72.0 * frame.scale),
                ..Default::default()
            },
        );

        Ok(())
    }

    /// Applies page selection, order and rotation to a source PDF.
    pub fn assemble_edit(
        &self,
        plan: EditPlan,
        on_page: &mut dyn FnMut(usize, usize) -> ControlFlow<()>,
    ) -> Result<Vec<u8>, ReconstructError> {
        if plan.pages.is_empty() {
            return Err(ReconstructError::NoPages);
        }

        let mut doc = Document::load_mem(&plan.document)
            .map_err(|e| ReconstructError::SourceLoad(e.to_string()))?;
        if doc.is_encrypted() {
            let credential = plan.credential.as_deref().unwrap_or("");
            doc.decrypt(credential).map_err(|e| match e {
                lopdf::Error::Decryption(DecryptionError::IncorrectPassword) => {
                    ReconstructError::WrongCredential
                }
                other => ReconstructError::UnsupportedEncryption(other.to_string()),
            })?;
        }

        let page_ids = doc.get_pages();
        let root_pages = root_pages_id(&doc)?;
        let total = plan.pages.len();
        let mut kids = Vec::with_capacity(total);
        let mut used = HashSet::new();

        for (done, edit) in plan.pages.iter().enumerate() {
            let source_id =
                *page_ids
                    .get(&edit.page.get())
                    .ok_or(ReconstructError::PageOutOfRange {
                        page: edit.page.get(),
                        page_count: page_ids.len(),
                    })?;

            let flattened = flatten_page(&doc, source_id)?;
            let existing = match flattened.get(b"Rotate") {
                Ok(Object::Integer(r)) => *r,
                _ => 0,
            };
            let rotation = (existing + edit.rotation as i64).rem_euclid(360);

            let mut page = flattened;
            page.set("Parent", root_pages);
            if rotation == 0 {
                page.remove(b"Rotate");
            } else {
                page.set("Rotate", rotation);
            }

            // A page used twice needs its own object.
            let id = if used.insert(source_id) {
                doc.objects.insert(source_id, Object::Dictionary(page));
                source_id
            } else {
                doc.add_object(page)
            };
            kids.push(Object::Reference(id));
            Self::checkpoint(on_page, done + 1, total)?;
        }

        let count = kids.len() as i64;
        match doc.get_object_mut(root_pages) {
            Ok(Object::Dictionary(pages)) => {
                pages.set("Kids", kids);
                pages.set("Count", count);
            }
            _ => {
                return Err(ReconstructError::SourceLoad(
                    "page tree root is not a dictionary".to_string(),
                ))
            }
        }

        doc.prune_objects();
        doc.compress();

        let mut buf = Vec::new();
        doc.save_to(&mut buf)
            .map_err(|e| ReconstructError::PdfCreation(e.to_string()))?;

        debug!(pages = total, bytes = buf.len(), "Edited document assembled");
        Ok(buf)
    }
}

fn root_pages_id(doc: &Document) -> Result<ObjectId, ReconstructError> {
    let missing = || ReconstructError::SourceLoad("document has no page tree".to_string());
    let root = match doc.trailer.get(b"Root") {
        Ok(Object::Reference(id)) => *id,
        _ => return Err(missing()),
    };
    match doc.get_dictionary(root).map_err(|_| missing())?.get(b"Pages") {
        Ok(Object::Reference(id)) => Ok(*id),
        _ => Err(missing()),
    }
}

/// Copies a page dictionary with inherited attributes made explicit.
fn flatten_page(doc: &Document, id: ObjectId) -> Result<lopdf::Dictionary, ReconstructError> {
    let original = doc
        .get_dictionary(id)
        .map_err(|e| ReconstructError::SourceLoad(e.to_string()))?;
    let mut page = original.clone();
    for key in INHERITABLE {
        if !page.has(key) {
            if let Some(value) = inherited(doc, original, key) {
                page.set(key.to_vec(), value.clone());
            }
        }
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameEncoding, QualityTier};
    use crate::page_collection::{PageEdit, PageId};
    use crate::source::test_support::{aes_encrypted_pdf, image_pdf, LOCKED_PASSWORD, LOCKED_PDF};

    fn page(n: u32) -> PageId {
        PageId::new(n).unwrap()
    }

    fn png_frame(n: u32, width: u32, height: u32, scale: f32) -> RasterFrame {
        let pixels = ::image::RgbImage::from_pixel(width, height, ::image::Rgb([255, 0, 0]));
        let mut payload = Vec::new();
        ::image::DynamicImage::ImageRgb8(pixels)
            .write_to(
                &mut std::io::Cursor::new(&mut payload),
                ::image::ImageOutputFormat::Png,
            )
            .unwrap();
        RasterFrame {
            page: page(n),
            width,
            height,
            scale,
            encoding: FrameEncoding::Png,
            quality: 100,
            payload,
        }
    }

    fn keep_going() -> impl FnMut(usize, usize) -> ControlFlow<()> {
        |_, _| ControlFlow::Continue(())
    }

    #[test]
    fn test_pixels_to_points() {
        // 150 pixels at 1.5 pixels per point = 100 points
        assert_eq!(Reconstructor::pixels_to_points(150, 1.5), 100.0);
    }

    #[test]
    fn test_points_to_mm() {
        // 72 points = 1 inch = 25.4 mm
        let mm = Reconstructor::points_to_mm(72.0);
        assert!((mm - 25.4).abs() < 0.1);
    }

    #[test]
    fn test_reconstruct_empty_frames() {
        let result = Reconstructor::new().assemble_frames(vec![], &mut keep_going());
        assert!(matches!(result, Err(ReconstructError::NoPages)));
    }

    #[test]
    fn test_reconstruct_frames() {
        let frames = vec![png_frame(1, 4, 2, 2.0), png_frame(2, 3, 3, 1.0)];
        let mut progress = Vec::new();
        let pdf = Reconstructor::new()
            .assemble_frames(frames, &mut |done, total| {
                progress.push((done, total));
                ControlFlow::Continue(())
            })
            .unwrap();

        assert!(pdf.starts_with(b"%PDF-"));
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
        let doc = Document::load_mem(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[test]
    fn test_reconstruct_invalid_dimensions() {
        let mut frame = png_frame(1, 2, 2, 1.0);
        frame.width = 0;
        let result = Reconstructor::new().assemble_frames(vec![frame], &mut keep_going());
        assert!(matches!(
            result,
            Err(ReconstructError::InvalidDimensions {
                width: 0,
                height: 2
            })
        ));
    }

    #[test]
    fn test_reconstruct_mismatched_frame() {
        let mut frame = png_frame(1, 2, 2, 1.0);
        frame.height = 5;
        let result = Reconstructor::new().assemble_frames(vec![frame], &mut keep_going());
        assert!(matches!(result, Err(ReconstructError::ImageCreation(_))));
    }

    #[test]
    fn test_cancel_between_pages() {
        let frames = vec![png_frame(1, 2, 2, 1.0), png_frame(2, 2, 2, 1.0)];
        let result =
            Reconstructor::new().assemble_frames(frames, &mut |_, _| ControlFlow::Break(()));
        assert!(matches!(result, Err(ReconstructError::Cancelled)));
    }

    #[test]
    fn test_edit_reorders_and_rotates() {
        let source = image_pdf(&[
            Some((2, 2, [1, 1, 1])),
            Some((2, 2, [2, 2, 2])),
            Some((2, 2, [3, 3, 3])),
        ]);
        let plan = EditPlan {
            document: source,
            credential: None,
            pages: vec![
                PageEdit {
                    page: page(3),
                    rotation: 90,
                },
                PageEdit {
                    page: page(1),
                    rotation: 0,
                },
            ],
        };
        let request = ReconstructionRequest::edit(QualityTier::Medium, plan);
        let pdf = Reconstructor::new()
            .reconstruct(request, &mut keep_going())
            .unwrap();

        let doc = Document::load_mem(&pdf).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);

        let first = doc.get_dictionary(*pages.get(&1).unwrap()).unwrap();
        assert_eq!(first.get(b"Rotate").unwrap().as_i64().unwrap(), 90);
        assert!(first.get(b"MediaBox").is_ok());

        let second = doc.get_dictionary(*pages.get(&2).unwrap()).unwrap();
        assert!(second.get(b"Rotate").is_err());
    }

    #[test]
    fn test_edit_duplicate_pages_get_distinct_objects() {
        let source = image_pdf(&[Some((2, 2, [1, 1, 1]))]);
        let plan = EditPlan {
            document: source,
            credential: None,
            pages: vec![
                PageEdit {
                    page: page(1),
                    rotation: 0,
                },
                PageEdit {
                    page: page(1),
                    rotation: 180,
                },
            ],
        };
        let pdf = Reconstructor::new()
            .assemble_edit(plan, &mut keep_going())
            .unwrap();
        let doc = Document::load_mem(&pdf).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);
        assert_ne!(pages.get(&1), pages.get(&2));
    }

    #[test]
    fn test_edit_page_out_of_range() {
        let plan = EditPlan {
            document: image_pdf(&[Some((2, 2, [1, 1, 1]))]),
            credential: None,
            pages: vec![PageEdit {
                page: page(4),
                rotation: 0,
            }],
        };
        let result = Reconstructor::new().assemble_edit(plan, &mut keep_going());
        assert!(matches!(
            result,
            Err(ReconstructError::PageOutOfRange {
                page: 4,
                page_count: 1
            })
        ));
    }

    #[test]
    fn test_edit_rejects_garbage() {
        let plan = EditPlan {
            document: b"not a pdf".to_vec(),
            credential: None,
            pages: vec![PageEdit {
                page: page(1),
                rotation: 0,
            }],
        };
        let result = Reconstructor::new().assemble_edit(plan, &mut keep_going());
        assert!(matches!(result, Err(ReconstructError::SourceLoad(_))));
    }

    fn single_page_plan(document: Vec<u8>, credential: Option<&str>) -> EditPlan {
        EditPlan {
            document,
            credential: credential.map(str::to_string),
            pages: vec![PageEdit {
                page: page(1),
                rotation: 90,
            }],
        }
    }

    #[test]
    fn test_edit_encrypted_source() {
        let plan = single_page_plan(LOCKED_PDF.to_vec(), Some("nope"));
        let result = Reconstructor::new().assemble_edit(plan, &mut keep_going());
        assert!(matches!(result, Err(ReconstructError::WrongCredential)));

        let plan = single_page_plan(LOCKED_PDF.to_vec(), Some(LOCKED_PASSWORD));
        let pdf = Reconstructor::new()
            .assemble_edit(plan, &mut keep_going())
            .unwrap();
        let doc = Document::load_mem(&pdf).unwrap();
        assert!(!doc.is_encrypted());
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn test_edit_unsupported_encryption() {
        let plan = single_page_plan(aes_encrypted_pdf(), Some("anything"));
        let result = Reconstructor::new().assemble_edit(plan, &mut keep_going());
        assert!(matches!(result, Err(ReconstructError::UnsupportedEncryption(_))));
    }
}
