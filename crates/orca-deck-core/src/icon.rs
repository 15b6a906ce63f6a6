//! Icon bitmaps for the keypad display.
//!
//! The device expects 32x32 pixels in RGB565, most significant byte first.

use thiserror::Error;

/// Icon edge length in pixels.
pub const ICON_SIZE: usize = 32;

/// Size of an encoded icon: 32 x 32 pixels at two bytes each.
pub const ICON_BYTES: usize = ICON_SIZE * ICON_SIZE * 2;

/// Size of an RGB888 source image accepted by [`IconPayload::from_rgb888`].
pub const RGB888_BYTES: usize = ICON_SIZE * ICON_SIZE * 3;

/// Errors building an icon payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IconError {
    #[error("icon must be exactly {expected} bytes, got {actual}")]
    WrongSize { expected: usize, actual: usize },
}

/// A validated RGB565 bitmap, ready for upload.
#[derive(Clone, PartialEq, Eq)]
pub struct IconPayload(Vec<u8>);

impl IconPayload {
    /// Wrap already encoded RGB565 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, IconError> {
        if bytes.len() != ICON_BYTES {
            return Err(IconError::WrongSize {
                expected: ICON_BYTES,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    /// Convert packed 8-bit RGB pixels, row-major.
    pub fn from_rgb888(pixels: &[u8]) -> Result<Self, IconError> {
        if pixels.len() != RGB888_BYTES {
            return Err(IconError::WrongSize {
                expected: RGB888_BYTES,
                actual: pixels.len(),
            });
        }

        let mut bytes = Vec::with_capacity(ICON_BYTES);
        for px in pixels.chunks_exact(3) {
            bytes.extend_from_slice(&rgb565(px[0], px[1], px[2]).to_be_bytes());
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for IconPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IconPayload({} bytes)", self.0.len())
    }
}

/// Pack one pixel as 5 bits red, 6 bits green, 5 bits blue.
pub fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_size() {
        let icon = IconPayload::new(vec![0u8; ICON_BYTES]).unwrap();
        assert_eq!(icon.len(), 2048);
    }

    #[test]
    fn rejects_wrong_size() {
        let err = IconPayload::new(vec![0u8; 100]).unwrap_err();
        assert_eq!(
            err,
            IconError::WrongSize {
                expected: 2048,
                actual: 100
            }
        );
        assert!(IconPayload::from_rgb888(&[0u8; 2048]).is_err());
    }

    #[test]
    fn rgb565_packing() {
        assert_eq!(rgb565(0xFF, 0xFF, 0xFF), 0xFFFF);
        assert_eq!(rgb565(0xFF, 0, 0), 0xF800);
        assert_eq!(rgb565(0, 0xFF, 0), 0x07E0);
        assert_eq!(rgb565(0, 0, 0xFF), 0x001F);
    }

    #[test]
    fn rgb888_conversion_is_big_endian() {
        let mut pixels = vec![0u8; RGB888_BYTES];
        // First pixel pure red, second pure blue.
        pixels[0] = 0xFF;
        pixels[5] = 0xFF;

        let icon = IconPayload::from_rgb888(&pixels).unwrap();
        let bytes = icon.as_bytes();
        assert_eq!(bytes.len(), ICON_BYTES);
        assert_eq!(&bytes[0..2], &[0xF8, 0x00]);
        assert_eq!(&bytes[2..4], &[0x00, 0x1F]);
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }
}
