//! Page rasterization.
//!
//! Turns pages of a [`SourceDocument`] into encoded [`RasterFrame`]s. The
//! producer owns a single encode surface that is cleared between pages, so
//! pages are produced strictly one after another.

use crate::config::{FrameEncoding, QualityTier};
use crate::page_collection::{PageEdit, PageId};
use crate::source::{RenderError, SourceDocument};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops;
use image::{ColorType, ImageEncoder, ImageFormat, RgbImage};
use tracing::{debug, instrument, warn};

/// Errors that can occur while producing frames.
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Failed to encode page {page}: {source}")]
    Encode {
        page: PageId,
        source: image::ImageError,
    },

    #[error("Failed to decode frame for page {page}: {source}")]
    Decode {
        page: PageId,
        source: image::ImageError,
    },

    #[error("No usable pages: none of the {requested} requested pages could be rendered")]
    NoUsablePages { requested: usize },
}

/// One rendered, encoded page.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterFrame {
    pub page: PageId,
    pub width: u32,
    pub height: u32,
    /// Pixels per native page unit used when rendering.
    pub scale: f32,
    pub encoding: FrameEncoding,
    /// Encoder quality on a 1-100 scale; 100 for lossless frames.
    pub quality: u8,
    pub payload: Vec<u8>,
}

impl RasterFrame {
    /// Decodes the payload back into pixels.
    pub fn decode(&self) -> Result<RgbImage, RasterError> {
        let format = match self.encoding {
            FrameEncoding::Jpeg => ImageFormat::Jpeg,
            FrameEncoding::Png => ImageFormat::Png,
        };
        image::load_from_memory_with_format(&self.payload, format)
            .map(|img| img.to_rgb8())
            .map_err(|source| RasterError::Decode {
                page: self.page,
                source,
            })
    }
}

/// A page that was skipped because it could not be rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPage {
    pub page: PageId,
    pub reason: RenderError,
}

/// Frames for a whole job plus the pages that had to be skipped.
#[derive(Debug, Default)]
pub struct RasterOutput {
    pub frames: Vec<RasterFrame>,
    pub skipped: Vec<SkippedPage>,
}

/// Renders and encodes pages one at a time.
pub struct RasterProducer {
    encoding: FrameEncoding,
    surface: Vec<u8>,
}

impl RasterProducer {
    pub fn new(encoding: FrameEncoding) -> Self {
        RasterProducer {
            encoding,
            surface: Vec::new(),
        }
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.encoding
    }

    /// Renders one page at `scale`, applies `rotation` (clockwise degrees)
    /// and encodes the result.
    pub fn render_frame(
        &mut self,
        source: &SourceDocument,
        page: PageId,
        rotation: u16,
        scale: f32,
        quality: u8,
    ) -> Result<RasterFrame, RasterError> {
        let pixels = rotate(source.render(page, scale)?, rotation);
        let (width, height) = pixels.dimensions();

        self.surface.clear();
        let quality = match self.encoding {
            FrameEncoding::Jpeg => {
                let quality = quality.clamp(1, 100);
                JpegEncoder::new_with_quality(&mut self.surface, quality)
                    .encode(pixels.as_raw(), width, height, ColorType::Rgb8)
                    .map_err(|source| RasterError::Encode { page, source })?;
                quality
            }
            FrameEncoding::Png => {
                PngEncoder::new(&mut self.surface)
                    .write_image(pixels.as_raw(), width, height, ColorType::Rgb8)
                    .map_err(|source| RasterError::Encode { page, source })?;
                100
            }
        };
        let payload = self.surface.to_vec();
        self.surface.clear();

        debug!(%page, width, height, bytes = payload.len(), "Frame encoded");

        Ok(RasterFrame {
            page,
            width,
            height,
            scale,
            encoding: self.encoding,
            quality,
            payload,
        })
    }

    /// Renders `pages` in order under `tier`'s policy.
    ///
    /// `on_progress` receives the completed fraction after every page,
    /// skipped pages included. Unreadable pages are skipped; any other
    /// failure aborts the run.
    #[instrument(skip_all, fields(pages = pages.len(), tier = %tier))]
    pub fn render_pages(
        &mut self,
        source: &SourceDocument,
        pages: &[PageEdit],
        tier: QualityTier,
        on_progress: impl FnMut(f32),
    ) -> Result<RasterOutput, RasterError> {
        let scale = tier.policy().render_scale;
        self.render_pages_at(source, pages, scale, tier.jpeg_quality(), on_progress)
    }

    /// Like [`render_pages`](Self::render_pages) with an explicit scale and quality.
    pub fn render_pages_at(
        &mut self,
        source: &SourceDocument,
        pages: &[PageEdit],
        scale: f32,
        quality: u8,
        mut on_progress: impl FnMut(f32),
    ) -> Result<RasterOutput, RasterError> {
        let mut output = RasterOutput::default();

        for (done, edit) in pages.iter().enumerate() {
            match self.render_frame(source, edit.page, edit.rotation, scale, quality) {
                Ok(frame) => output.frames.push(frame),
                Err(RasterError::Render(reason)) => {
                    warn!(page = %edit.page, %reason, "Skipping unreadable page");
                    output.skipped.push(SkippedPage {
                        page: edit.page,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
            on_progress((done + 1) as f32 / pages.len() as f32);
        }

        if output.frames.is_empty() {
            return Err(RasterError::NoUsablePages {
                requested: pages.len(),
            });
        }

        Ok(output)
    }
}

fn rotate(pixels: RgbImage, rotation: u16) -> RgbImage {
    match rotation % 360 {
        90 => imageops::rotate90(&pixels),
        180 => imageops::rotate180(&pixels),
        270 => imageops::rotate270(&pixels),
        _ => pixels,
    }
}
