//! Reader for raw pixel-stream documents.
//!
//! A pixel stream is the simplest paged document the engine accepts:
//! - Page count (2 bytes, big-endian int)
//! - For each page:
//!   - Page width (2 bytes, big-endian int)
//!   - Page height (2 bytes, big-endian int)
//!   - Page data (width * height * 3 bytes, RGB pixels)

use byteorder::{BigEndian, ReadBytesExt};
use image::RgbImage;
use std::io::{self, Read};

/// One page of a pixel stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelPage {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u8>,
}

impl PixelPage {
    /// Creates a page, checking that the buffer matches the dimensions.
    pub fn new(width: u16, height: u16, pixels: Vec<u8>) -> Result<Self, StreamError> {
        let expected_size = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected_size {
            return Err(StreamError::InvalidPixelData {
                expected: expected_size,
                actual: pixels.len(),
            });
        }
        Ok(PixelPage {
            width,
            height,
            pixels,
        })
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Converts the page into an RGB image, consuming the pixel buffer.
    pub fn into_image(self) -> Result<RgbImage, StreamError> {
        let (width, height) = (self.width, self.height);
        RgbImage::from_raw(width as u32, height as u32, self.pixels)
            .ok_or(StreamError::InvalidPageDimensions { width, height })
    }
}

/// Errors that can occur during stream reading.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid page count: {0}")]
    InvalidPageCount(u16),

    #[error("Invalid page dimensions: width={width}, height={height}")]
    InvalidPageDimensions { width: u16, height: u16 },

    #[error("Invalid pixel data: expected {expected} bytes, got {actual}")]
    InvalidPixelData { expected: usize, actual: usize },

    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// Reads pages from a pixel stream.
pub struct PixelStreamReader<R: Read> {
    reader: R,
}

/// Walks the headers of an in-memory stream without copying pixels.
///
/// Returns true only when the buffer is exactly one well-formed stream.
pub fn is_pixel_stream(bytes: &[u8]) -> bool {
    let count = match bytes.get(..2) {
        Some(header) => u16::from_be_bytes([header[0], header[1]]),
        None => return false,
    };
    if count == 0 {
        return false;
    }

    let mut offset = 2usize;
    for _ in 0..count {
        let header = match bytes.get(offset..offset + 4) {
            Some(header) => header,
            None => return false,
        };
        let width = u16::from_be_bytes([header[0], header[1]]) as usize;
        let height = u16::from_be_bytes([header[2], header[3]]) as usize;
        if width == 0 || height == 0 {
            return false;
        }
        offset += 4 + width * height * 3;
    }

    offset == bytes.len()
}

impl<R: Read> PixelStreamReader<R> {
    pub fn new(reader: R) -> Self {
        PixelStreamReader { reader }
    }

    /// Reads the page count from the stream.
    pub fn read_page_count(&mut self) -> Result<u16, StreamError> {
        let count = self.reader.read_u16::<BigEndian>()?;
        if count == 0 {
            return Err(StreamError::InvalidPageCount(count));
        }
        Ok(count)
    }

    /// Reads a single page from the stream.
    pub fn read_page(&mut self) -> Result<PixelPage, StreamError> {
        let width = self.reader.read_u16::<BigEndian>()?;
        let height = self.reader.read_u16::<BigEndian>()?;

        if width == 0 || height == 0 {
            return Err(StreamError::InvalidPageDimensions { width, height });
        }

        let num_bytes = (width as usize) * (height as usize) * 3;
        let mut pixels = vec![0u8; num_bytes];
        self.reader.read_exact(&mut pixels).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StreamError::UnexpectedEof
            } else {
                StreamError::Io(e)
            }
        })?;

        Ok(PixelPage {
            width,
            height,
            pixels,
        })
    }

    /// Reads every page and converts each to an image.
    pub fn read_all_pages(&mut self) -> Result<Vec<RgbImage>, StreamError> {
        let page_count = self.read_page_count()?;
        let mut pages = Vec::with_capacity(page_count as usize);

        for _ in 0..page_count {
            pages.push(self.read_page()?.into_image()?);
        }

        Ok(pages)
    }
}

#[cfg(test)]
pub(crate) fn encode_pixel_stream(pages: &[(u16, u16, Vec<u8>)]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&(pages.len() as u16).to_be_bytes());
    for (width, height, pixels) in pages {
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(pixels);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_page_count_zero() {
        let mut reader = PixelStreamReader::new(Cursor::new(vec![0x00, 0x00]));
        assert!(matches!(
            reader.read_page_count(),
            Err(StreamError::InvalidPageCount(0))
        ));
    }

    #[test]
    fn test_read_all_pages() {
        let data = encode_pixel_stream(&[(2, 2, vec![255u8; 12]), (3, 1, vec![7u8; 9])]);
        let mut reader = PixelStreamReader::new(Cursor::new(data));

        let pages = reader.read_all_pages().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].dimensions(), (2, 2));
        assert_eq!(pages[1].dimensions(), (3, 1));
        assert_eq!(pages[1].get_pixel(2, 0).0, [7, 7, 7]);
    }

    #[test]
    fn test_invalid_page_dimensions() {
        let data = encode_pixel_stream(&[(0, 100, vec![])]);
        let mut reader = PixelStreamReader::new(Cursor::new(data));
        reader.read_page_count().unwrap();

        assert!(matches!(
            reader.read_page(),
            Err(StreamError::InvalidPageDimensions { .. })
        ));
    }

    #[test]
    fn test_incomplete_pixel_data() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&[255u8; 6]);

        let mut reader = PixelStreamReader::new(Cursor::new(data));
        reader.read_page_count().unwrap();

        assert!(matches!(reader.read_page(), Err(StreamError::UnexpectedEof)));
    }

    #[test]
    fn test_pixel_page_new_invalid_size() {
        let result = PixelPage::new(2, 2, vec![255u8; 10]);
        assert!(matches!(
            result,
            Err(StreamError::InvalidPixelData {
                expected: 12,
                actual: 10
            })
        ));
        assert_eq!(PixelPage::new(2, 2, vec![0; 12]).unwrap().pixel_count(), 4);
    }

    #[test]
    fn test_is_pixel_stream() {
        let data = encode_pixel_stream(&[(2, 2, vec![0u8; 12])]);
        assert!(is_pixel_stream(&data));

        let mut trailing = data.clone();
        trailing.push(0);
        assert!(!is_pixel_stream(&trailing));
        assert!(!is_pixel_stream(&data[..data.len() - 1]));
        assert!(!is_pixel_stream(b"%PDF-1.7"));
        assert!(!is_pixel_stream(&[]));
    }
}
