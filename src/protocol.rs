//! Messages exchanged with a reconstruction context.
//!
//! In-process workers pass these values over channels directly. Worker
//! subprocesses use the binary encoding below over stdin/stdout; all integers
//! are big-endian.
//!
//! Request:
//! - Magic `RQ` (2 bytes), version (1 byte), tier (1 byte), body tag (1 byte)
//! - Frames body: frame count (4 bytes), then per frame page (4), width (4),
//!   height (4), scale (f32), encoding (1), quality (1), payload length (4), payload
//! - Edit body: document length (4), document, credential flag (1), optional
//!   credential length (2) + UTF-8, page count (4), then per page page (4) and
//!   rotation (2)
//!
//! Events, each prefixed by a tag byte:
//! - `1` progress: fraction (f32)
//! - `2` finished: length (4), document bytes
//! - `3` failed: length (2), UTF-8 reason

use crate::config::{FrameEncoding, QualityTier};
use crate::page_collection::{PageEdit, PageId};
use crate::raster::RasterFrame;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

const MAGIC: &[u8; 2] = b"RQ";
const VERSION: u8 = 1;
const MAX_PAYLOAD: u32 = 1 << 30;

const BODY_FRAMES: u8 = 0;
const BODY_EDIT: u8 = 1;

const EVENT_PROGRESS: u8 = 1;
const EVENT_FINISHED: u8 = 2;
const EVENT_FAILED: u8 = 3;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Not a reconstruction request")]
    BadMagic,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown quality tier code: {0}")]
    UnknownTier(u8),

    #[error("Unknown frame encoding code: {0}")]
    UnknownEncoding(u8),

    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("Invalid page number: {0}")]
    InvalidPage(u32),

    #[error("Payload of {0} bytes exceeds the protocol limit")]
    PayloadTooLarge(u64),

    #[error("Credential is not valid UTF-8")]
    InvalidCredential,
}

/// Instructions for assembling an output document from an existing PDF.
#[derive(Debug, Clone, PartialEq)]
pub struct EditPlan {
    pub document: Vec<u8>,
    pub credential: Option<String>,
    pub pages: Vec<PageEdit>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Ordered frames, one output page each.
    Frames(Vec<RasterFrame>),
    /// Page selection, order and rotation applied to a source PDF.
    Edit(EditPlan),
}

/// Work handed to a reconstruction context. The context owns it outright.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionRequest {
    pub tier: QualityTier,
    pub body: RequestBody,
}

impl ReconstructionRequest {
    pub fn frames(tier: QualityTier, frames: Vec<RasterFrame>) -> Self {
        ReconstructionRequest {
            tier,
            body: RequestBody::Frames(frames),
        }
    }

    pub fn edit(tier: QualityTier, plan: EditPlan) -> Self {
        ReconstructionRequest {
            tier,
            body: RequestBody::Edit(plan),
        }
    }

    /// Number of output pages the request describes.
    pub fn page_count(&self) -> usize {
        match &self.body {
            RequestBody::Frames(frames) => frames.len(),
            RequestBody::Edit(plan) => plan.pages.len(),
        }
    }
}

/// Messages a context sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructionEvent {
    /// Fraction of pages assembled, in `[0, 1]`.
    Progress(f32),
    /// The finished document. Sent exactly once, last.
    Finished(Vec<u8>),
    /// Human-readable failure reason. Sent at most once, last.
    Failed(String),
}

impl ReconstructionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReconstructionEvent::Progress(_))
    }
}

/// Messages the caller sends to a running context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Cancel,
}

fn encoding_code(encoding: FrameEncoding) -> u8 {
    match encoding {
        FrameEncoding::Jpeg => 0,
        FrameEncoding::Png => 1,
    }
}

fn encoding_from_code(code: u8) -> Result<FrameEncoding, ProtocolError> {
    match code {
        0 => Ok(FrameEncoding::Jpeg),
        1 => Ok(FrameEncoding::Png),
        other => Err(ProtocolError::UnknownEncoding(other)),
    }
}

fn checked_len(len: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_PAYLOAD => Ok(len),
        _ => Err(ProtocolError::PayloadTooLarge(len as u64)),
    }
}

fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = reader.read_u32::<BigEndian>()?;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len as u64));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_page<R: Read>(reader: &mut R) -> Result<PageId, ProtocolError> {
    let number = reader.read_u32::<BigEndian>()?;
    PageId::new(number).ok_or(ProtocolError::InvalidPage(number))
}

/// Writes a request in the subprocess wire format.
pub fn write_request<W: Write>(
    writer: &mut W,
    request: &ReconstructionRequest,
) -> Result<(), ProtocolError> {
    writer.write_all(MAGIC)?;
    writer.write_u8(VERSION)?;
    writer.write_u8(request.tier.to_wire())?;

    match &request.body {
        RequestBody::Frames(frames) => {
            writer.write_u8(BODY_FRAMES)?;
            writer.write_u32::<BigEndian>(checked_len(frames.len())?)?;
            for frame in frames {
                writer.write_u32::<BigEndian>(frame.page.get())?;
                writer.write_u32::<BigEndian>(frame.width)?;
                writer.write_u32::<BigEndian>(frame.height)?;
                writer.write_f32::<BigEndian>(frame.scale)?;
                writer.write_u8(encoding_code(frame.encoding))?;
                writer.write_u8(frame.quality)?;
                writer.write_u32::<BigEndian>(checked_len(frame.payload.len())?)?;
                writer.write_all(&frame.payload)?;
            }
        }
        RequestBody::Edit(plan) => {
            writer.write_u8(BODY_EDIT)?;
            writer.write_u32::<BigEndian>(checked_len(plan.document.len())?)?;
            writer.write_all(&plan.document)?;
            match &plan.credential {
                Some(credential) => {
                    let len = u16::try_from(credential.len())
                        .map_err(|_| ProtocolError::PayloadTooLarge(credential.len() as u64))?;
                    writer.write_u8(1)?;
                    writer.write_u16::<BigEndian>(len)?;
                    writer.write_all(credential.as_bytes())?;
                }
                None => writer.write_u8(0)?,
            }
            writer.write_u32::<BigEndian>(checked_len(plan.pages.len())?)?;
            for edit in &plan.pages {
                writer.write_u32::<BigEndian>(edit.page.get())?;
                writer.write_u16::<BigEndian>(edit.rotation)?;
            }
        }
    }

    writer.flush()?;
    Ok(())
}

/// Reads a request written by [`write_request`].
pub fn read_request<R: Read>(reader: &mut R) -> Result<ReconstructionRequest, ProtocolError> {
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let tier_code = reader.read_u8()?;
    let tier = QualityTier::from_wire(tier_code).ok_or(ProtocolError::UnknownTier(tier_code))?;

    let body = match reader.read_u8()? {
        BODY_FRAMES => {
            let count = reader.read_u32::<BigEndian>()?;
            let mut frames = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                let page = read_page(reader)?;
                let width = reader.read_u32::<BigEndian>()?;
                let height = reader.read_u32::<BigEndian>()?;
                let scale = reader.read_f32::<BigEndian>()?;
                let encoding = encoding_from_code(reader.read_u8()?)?;
                let quality = reader.read_u8()?;
                let payload = read_bytes(reader)?;
                frames.push(RasterFrame {
                    page,
                    width,
                    height,
                    scale,
                    encoding,
                    quality,
                    payload,
                });
            }
            RequestBody::Frames(frames)
        }
        BODY_EDIT => {
            let document = read_bytes(reader)?;
            let credential = match reader.read_u8()? {
                0 => None,
                _ => {
                    let len = reader.read_u16::<BigEndian>()?;
                    let mut buf = vec![0u8; len as usize];
                    reader.read_exact(&mut buf)?;
                    Some(String::from_utf8(buf).map_err(|_| ProtocolError::InvalidCredential)?)
                }
            };
            let count = reader.read_u32::<BigEndian>()?;
            let mut pages = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                let page = read_page(reader)?;
                let rotation = reader.read_u16::<BigEndian>()?;
                pages.push(PageEdit { page, rotation });
            }
            RequestBody::Edit(EditPlan {
                document,
                credential,
                pages,
            })
        }
        other => return Err(ProtocolError::UnknownTag(other)),
    };

    Ok(ReconstructionRequest { tier, body })
}

/// Writes one event in the subprocess wire format.
pub fn write_event<W: Write>(
    writer: &mut W,
    event: &ReconstructionEvent,
) -> Result<(), ProtocolError> {
    match event {
        ReconstructionEvent::Progress(fraction) => {
            writer.write_u8(EVENT_PROGRESS)?;
            writer.write_f32::<BigEndian>(*fraction)?;
        }
        ReconstructionEvent::Finished(document) => {
            writer.write_u8(EVENT_FINISHED)?;
            writer.write_u32::<BigEndian>(checked_len(document.len())?)?;
            writer.write_all(document)?;
        }
        ReconstructionEvent::Failed(reason) => {
            let bytes = reason.as_bytes();
            let bytes = &bytes[..bytes.len().min(u16::MAX as usize)];
            writer.write_u8(EVENT_FAILED)?;
            writer.write_u16::<BigEndian>(bytes.len() as u16)?;
            writer.write_all(bytes)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Reads the next event. Returns `Ok(None)` on a clean end of stream.
pub fn read_event<R: Read>(reader: &mut R) -> Result<Option<ReconstructionEvent>, ProtocolError> {
    let tag = match reader.read_u8() {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let event = match tag {
        EVENT_PROGRESS => ReconstructionEvent::Progress(reader.read_f32::<BigEndian>()?),
        EVENT_FINISHED => ReconstructionEvent::Finished(read_bytes(reader)?),
        EVENT_FAILED => {
            let len = reader.read_u16::<BigEndian>()?;
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            ReconstructionEvent::Failed(String::from_utf8_lossy(&buf).into_owned())
        }
        other => return Err(ProtocolError::UnknownTag(other)),
    };
    Ok(Some(event))
}
