//! Opened, decoded source documents.
//!
//! A [`SourceDocument`] wraps a [`DocumentHandle`], a small sum type over the
//! decoding backends the engine understands. Everything downstream only uses
//! the handle's capabilities: page count, page size and `render(page, scale)`.

use crate::page_collection::PageId;
use crate::stream_reader::{self, PixelStreamReader, StreamError};
use image::imageops::{self, FilterType};
use image::RgbImage;
use lopdf::encryption::DecryptionError;
use lopdf::{Dictionary, Document, Object, ObjectId};
use mupdf::{Colorspace, Matrix, Pixmap};
use std::io::Cursor;
use tracing::{debug, info, instrument};

/// Largest pixel count a single page may render to.
pub const MAX_RENDER_PIXELS: u64 = 1 << 26;

/// Errors that can occur while opening or unlocking a document.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Unrecognized document format")]
    UnknownFormat,

    #[error("Failed to parse PDF: {0}")]
    Pdf(String),

    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to read pixel stream: {0}")]
    Stream(#[from] StreamError),

    #[error("Document has no pages")]
    NoPages,

    #[error("Wrong decryption credential")]
    WrongCredential,

    #[error("Cannot decrypt document: {0}")]
    UnsupportedEncryption(String),
}

/// Errors that can occur while rendering a single page.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("Document is locked")]
    Locked,

    #[error("Page {page} does not exist (document has {page_count} pages)")]
    PageOutOfRange { page: PageId, page_count: u32 },

    #[error("Page {page} is unreadable: {reason}")]
    Unreadable { page: PageId, reason: String },
}

/// Page dimensions in the document's native unit (points for PDF, pixels otherwise).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    /// Pixel size of this page rendered at `scale`; never zero.
    pub fn scaled(self, scale: f32) -> (u32, u32) {
        let w = (self.width * scale).round().max(1.0) as u32;
        let h = (self.height * scale).round().max(1.0) as u32;
        (w, h)
    }
}

/// Which backend decoded the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image,
    PixelStream,
}

/// PDF pages: `lopdf` reads structure and lock state, `mupdf` rasterizes.
pub struct PdfPages {
    bytes: Vec<u8>,
    document: Document,
    page_ids: Vec<ObjectId>,
    credential: Option<String>,
}

/// Pages that are already pixel grids.
pub struct RasterPages {
    bytes: Vec<u8>,
    pages: Vec<RgbImage>,
}

/// Decoded document handle.
pub enum DocumentHandle {
    Pdf(PdfPages),
    Raster(RasterPages),
}

impl DocumentHandle {
    pub fn page_count(&self) -> u32 {
        match self {
            DocumentHandle::Pdf(pdf) => pdf.page_ids.len() as u32,
            DocumentHandle::Raster(raster) => raster.pages.len() as u32,
        }
    }

    pub fn page_size(&self, page: PageId) -> Option<PageSize> {
        match self {
            DocumentHandle::Pdf(pdf) => pdf.page_size(page),
            DocumentHandle::Raster(raster) => raster.pages.get(page.index()).map(|img| PageSize {
                width: img.width() as f32,
                height: img.height() as f32,
            }),
        }
    }

    /// Renders `page` at `scale`. The result is exactly `page_size(page).scaled(scale)`.
    ///
    /// Pages without area, or whose rendering would exceed
    /// [`MAX_RENDER_PIXELS`], are unreadable.
    pub fn render(&self, page: PageId, scale: f32) -> Result<RgbImage, RenderError> {
        let size = self.page_size(page).ok_or(RenderError::PageOutOfRange {
            page,
            page_count: self.page_count(),
        })?;
        if !(size.width > 0.0 && size.height > 0.0) {
            return Err(RenderError::Unreadable {
                page,
                reason: "page has no area".to_string(),
            });
        }

        let (width, height) = size.scaled(scale);
        if u64::from(width) * u64::from(height) > MAX_RENDER_PIXELS {
            return Err(RenderError::Unreadable {
                page,
                reason: format!("{width}x{height} pixels exceeds the render limit"),
            });
        }

        let pixels = match self {
            DocumentHandle::Pdf(pdf) => pdf.rasterize(page, width, height)?,
            DocumentHandle::Raster(raster) => raster.pages[page.index()].clone(),
        };

        if pixels.dimensions() == (width, height) {
            Ok(pixels)
        } else {
            Ok(imageops::resize(&pixels, width, height, FilterType::Triangle))
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            DocumentHandle::Pdf(pdf) => &pdf.bytes,
            DocumentHandle::Raster(raster) => &raster.bytes,
        }
    }
}

/// An opened document plus its lock state.
pub struct SourceDocument {
    kind: DocumentKind,
    handle: DocumentHandle,
    locked: bool,
}

impl SourceDocument {
    /// Sniffs the format of `bytes`, decodes it and detects its lock state.
    ///
    /// An encrypted PDF opens unlocked when its user password is empty.
    /// Otherwise, without a credential it is returned locked, and a
    /// credential that does not unlock it fails with `WrongCredential`.
    #[instrument(skip_all, fields(bytes_len = bytes.len()))]
    pub fn open(bytes: Vec<u8>, credential: Option<&str>) -> Result<Self, SourceError> {
        let (kind, handle, locked) = if bytes.starts_with(b"%PDF-") {
            let (pdf, locked) = PdfPages::load(bytes, credential)?;
            (DocumentKind::Pdf, DocumentHandle::Pdf(pdf), locked)
        } else if stream_reader::is_pixel_stream(&bytes) {
            let pages = PixelStreamReader::new(Cursor::new(&bytes)).read_all_pages()?;
            (
                DocumentKind::PixelStream,
                DocumentHandle::Raster(RasterPages { bytes, pages }),
                false,
            )
        } else if image::guess_format(&bytes).is_ok() {
            let page = image::load_from_memory(&bytes)?.to_rgb8();
            (
                DocumentKind::Image,
                DocumentHandle::Raster(RasterPages {
                    bytes,
                    pages: vec![page],
                }),
                false,
            )
        } else {
            return Err(SourceError::UnknownFormat);
        };

        if handle.page_count() == 0 {
            return Err(SourceError::NoPages);
        }

        info!(?kind, pages = handle.page_count(), locked, "Document opened");

        Ok(SourceDocument {
            kind,
            handle,
            locked,
        })
    }

    /// Supplies a credential for a locked document.
    ///
    /// On failure the document stays locked.
    pub fn unlock(&mut self, credential: &str) -> Result<(), SourceError> {
        if !self.locked {
            return Ok(());
        }
        if let DocumentHandle::Pdf(pdf) = &mut self.handle {
            pdf.decrypt(credential)?;
        }
        self.locked = false;
        debug!("Document unlocked");
        Ok(())
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The credential that unlocked the document, if it needed one.
    pub fn credential(&self) -> Option<&str> {
        match &self.handle {
            DocumentHandle::Pdf(pdf) => pdf.credential.as_deref(),
            DocumentHandle::Raster(_) => None,
        }
    }

    /// The original encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        self.handle.bytes()
    }

    pub fn page_count(&self) -> u32 {
        self.handle.page_count()
    }

    pub fn page_size(&self, page: PageId) -> Option<PageSize> {
        self.handle.page_size(page)
    }

    pub fn render(&self, page: PageId, scale: f32) -> Result<RgbImage, RenderError> {
        if self.locked {
            return Err(RenderError::Locked);
        }
        self.handle.render(page, scale)
    }
}

impl std::fmt::Debug for SourceDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDocument")
            .field("kind", &self.kind)
            .field("pages", &self.page_count())
            .field("locked", &self.locked)
            .field("bytes", &self.bytes().len())
            .finish()
    }
}

impl PdfPages {
    fn load(bytes: Vec<u8>, credential: Option<&str>) -> Result<(Self, bool), SourceError> {
        let document =
            Document::load_mem(&bytes).map_err(|e| SourceError::Pdf(e.to_string()))?;
        let page_ids = document.get_pages().into_values().collect();
        let mut pdf = PdfPages {
            bytes,
            document,
            page_ids,
            credential: None,
        };

        if !pdf.document.is_encrypted() {
            return Ok((pdf, false));
        }

        match credential {
            Some(credential) => pdf.decrypt(credential)?,
            // An empty user password opens without asking.
            None => match pdf.decrypt("") {
                Ok(()) => debug!("Opened with the empty user password"),
                Err(SourceError::WrongCredential) => return Ok((pdf, true)),
                Err(e) => return Err(e),
            },
        }
        Ok((pdf, false))
    }

    fn decrypt(&mut self, credential: &str) -> Result<(), SourceError> {
        self.document
            .decrypt(credential)
            .map_err(|e| match e {
                lopdf::Error::Decryption(DecryptionError::IncorrectPassword) => {
                    SourceError::WrongCredential
                }
                other => SourceError::UnsupportedEncryption(other.to_string()),
            })?;
        self.credential = Some(credential.to_string());
        Ok(())
    }

    fn page_dict(&self, page: PageId) -> Option<&Dictionary> {
        let id = *self.page_ids.get(page.index())?;
        self.document.get_dictionary(id).ok()
    }

    /// Visible page size: the crop box (or media box), turned by `/Rotate`.
    fn page_size(&self, page: PageId) -> Option<PageSize> {
        let dict = self.page_dict(page)?;
        let page_box = [b"CropBox".as_slice(), b"MediaBox".as_slice()]
            .into_iter()
            .find_map(|key| {
                inherited(&self.document, dict, key)
                    .and_then(|obj| numbers(&self.document, obj))
                    .filter(|values| values.len() == 4)
            });

        // US Letter when the page tree carries no usable box.
        let (width, height) = match page_box {
            Some(v) => ((v[2] - v[0]).abs(), (v[3] - v[1]).abs()),
            None => (612.0, 792.0),
        };
        let quarter_turns = inherited(&self.document, dict, b"Rotate")
            .and_then(|obj| integer(&self.document, obj))
            .map_or(0, |degrees| degrees.rem_euclid(360) / 90);

        if quarter_turns % 2 == 1 {
            Some(PageSize {
                width: height,
                height: width,
            })
        } else {
            Some(PageSize { width, height })
        }
    }

    /// Rasterizes one page to `width` x `height` pixels with MuPDF.
    ///
    /// MuPDF is not thread-safe, so every call opens its own document.
    fn rasterize(&self, page: PageId, width: u32, height: u32) -> Result<RgbImage, RenderError> {
        let unreadable = |reason: String| RenderError::Unreadable { page, reason };
        let failed = |e: mupdf::error::Error| unreadable(e.to_string());

        let mut document =
            mupdf::Document::from_bytes(&self.bytes, "application/pdf").map_err(failed)?;
        if document.needs_password().map_err(failed)? {
            let credential = self.credential.as_deref().unwrap_or("");
            if !document.authenticate(credential).map_err(failed)? {
                return Err(unreadable("renderer rejected the credential".to_string()));
            }
        }

        let index = i32::try_from(page.index())
            .map_err(|_| unreadable("page index out of range".to_string()))?;
        let pdf_page = document.load_page(index).map_err(failed)?;
        let bounds = pdf_page.bounds().map_err(failed)?;
        let (page_width, page_height) = (bounds.x1 - bounds.x0, bounds.y1 - bounds.y0);
        if !(page_width > 0.0 && page_height > 0.0) {
            return Err(unreadable("page has no area".to_string()));
        }

        let transform = Matrix::new_scale(width as f32 / page_width, height as f32 / page_height);
        let pixmap = pdf_page
            .to_pixmap(&transform, &Colorspace::device_rgb(), false, false)
            .map_err(failed)?;
        pixmap_to_rgb(&pixmap).map_err(unreadable)
    }
}

fn pixmap_to_rgb(pixmap: &Pixmap) -> Result<RgbImage, String> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(format!("unsupported pixmap format: {n} channels"));
    }

    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let row_bytes = width * n;
    if samples.len() < stride.saturating_mul(height) || row_bytes > stride {
        return Err("pixmap buffer size mismatch".to_string());
    }

    let mut out = Vec::with_capacity(width * height * 3);
    for row in samples.chunks(stride).take(height) {
        for px in row[..row_bytes].chunks_exact(n) {
            out.extend_from_slice(&px[..3]);
        }
    }

    RgbImage::from_raw(pixmap.width(), pixmap.height(), out)
        .ok_or_else(|| "pixmap has no pixels".to_string())
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// Looks a key up on a page, walking `/Parent` for inheritable attributes.
pub(crate) fn inherited<'a>(
    doc: &'a Document,
    dict: &'a Dictionary,
    key: &[u8],
) -> Option<&'a Object> {
    let mut current = dict;
    for _ in 0..32 {
        if let Ok(value) = current.get(key) {
            return Some(resolve(doc, value));
        }
        match current.get(b"Parent") {
            Ok(Object::Reference(parent)) => current = doc.get_dictionary(*parent).ok()?,
            _ => return None,
        }
    }
    None
}

fn integer(doc: &Document, obj: &Object) -> Option<i64> {
    match resolve(doc, obj) {
        Object::Integer(i) => Some(*i),
        Object::Real(r) => Some(*r as i64),
        _ => None,
    }
}

fn numbers(doc: &Document, obj: &Object) -> Option<Vec<f32>> {
    match obj {
        Object::Array(items) => items
            .iter()
            .map(|item| match resolve(doc, item) {
                Object::Integer(i) => Some(*i as f32),
                Object::Real(r) => Some(*r as f32),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}
