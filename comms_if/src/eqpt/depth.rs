//! # Depth Camera Interface

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{convert::TryFrom, ops::Deref};

use base64::DecodeError;
use byteorder::{BigEndian, ByteOrder};
use chrono::{serde::ts_milliseconds, DateTime, Utc};
use image::{ImageBuffer, Luma, Pixel, Primitive};
use serde::{Deserialize, Serialize, Serializer};

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// Raw 16 bit depth buffer as delivered by the camera driver.
pub type DepthBuffer = ImageBuffer<Luma<u16>, Vec<u16>>;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A serialisable depth image frame, used when frames are archived or replayed.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DepthFrame {
    /// UTC timestamp at which the frame was acquired
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Width of the image in pixels
    pub width: u32,

    /// Height of the image in pixels
    pub height: u32,

    /// The formatted image data, encoded in base64, by first flattening the 16 bit image, then
    /// converting to a bigendian Vec<u8>, then encoding in base64.
    pub b64_data: String,
}

/// A depth image in raw sensor units.
///
/// Each sample is the z depth from the camera's optical centre. Samples convert linearly to
/// meters with the camera's fixed depth scale, and a zero sample means no return.
#[derive(Debug, Clone, Serialize)]
pub struct DepthImage {
    /// UTC timestamp at which the frame was acquired
    pub timestamp: DateTime<Utc>,

    /// The 16 bit greyscale depth image
    #[serde(serialize_with = "serialize_image_buffer_luma")]
    pub image: DepthBuffer,
}

#[derive(Debug, Serialize)]
struct SerdeImgBuff<Container> {
    width: u32,
    height: u32,
    data: Container,
}

// -----------------------------------------------------------------------------------------------
// ENUMS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone)]
pub enum DepthError {
    #[error("Failed to decode depth image from base64: {0}")]
    DepthDecodeError(DecodeError),

    #[error("The encoded frame data was the wrong size")]
    FrameWrongSize,
}

// -----------------------------------------------------------------------------------------------
// IMPLS
// -----------------------------------------------------------------------------------------------

impl DepthImage {
    /// Build an image from row-major samples, `None` if `data` isn't `width * height` long.
    pub fn from_raw(
        timestamp: DateTime<Utc>,
        width: u32,
        height: u32,
        data: Vec<u16>,
    ) -> Option<Self> {
        Some(Self {
            timestamp,
            image: ImageBuffer::from_raw(width, height, data)?,
        })
    }

    /// An image of the given size with no returns in any pixel.
    pub fn empty(timestamp: DateTime<Utc>, width: u32, height: u32) -> Self {
        Self {
            timestamp,
            image: ImageBuffer::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Get the raw sample at pixel `(u, v)`, or `None` if the pixel is outside the image.
    pub fn sample(&self, u: u32, v: u32) -> Option<u16> {
        if u < self.image.width() && v < self.image.height() {
            Some(self.image.get_pixel(u, v)[0])
        } else {
            None
        }
    }

    /// Set the raw sample at pixel `(u, v)`, ignoring pixels outside the image.
    pub fn set_sample(&mut self, u: u32, v: u32, sample: u16) {
        if u < self.image.width() && v < self.image.height() {
            self.image.put_pixel(u, v, Luma([sample]));
        }
    }
}

impl TryFrom<DepthFrame> for DepthImage {
    type Error = DepthError;

    fn try_from(frame: DepthFrame) -> Result<Self, Self::Error> {
        let bytes = base64::decode(frame.b64_data).map_err(DepthError::DepthDecodeError)?;

        // Samples are two bytes each, an odd count can't be a valid frame
        if bytes.len() % 2 != 0 {
            return Err(DepthError::FrameWrongSize);
        }

        let mut buff = vec![0u16; bytes.len() / 2];
        BigEndian::read_u16_into(&bytes, &mut buff);

        Self::from_raw(frame.timestamp, frame.width, frame.height, buff)
            .ok_or(DepthError::FrameWrongSize)
    }
}

impl From<&DepthImage> for DepthFrame {
    fn from(img: &DepthImage) -> Self {
        let raw = img.image.as_raw();
        let mut bytes = vec![0u8; raw.len() * 2];
        BigEndian::write_u16_into(raw, &mut bytes);

        Self {
            timestamp: img.timestamp,
            width: img.image.width(),
            height: img.image.height(),
            b64_data: base64::encode(bytes),
        }
    }
}

impl<P, Container> From<&ImageBuffer<P, Container>> for SerdeImgBuff<Container>
where
    P: Pixel + 'static,
    P::Subpixel: 'static,
    Container: Deref<Target = [P::Subpixel]> + Clone,
{
    fn from(img: &ImageBuffer<P, Container>) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            data: img.as_raw().clone(),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn serialize_image_buffer_luma<S, T, Container>(
    img: &ImageBuffer<Luma<T>, Container>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + Primitive + 'static,
    <Luma<T> as Pixel>::Subpixel: 'static,
    Container: Serialize + Deref<Target = [<Luma<T> as Pixel>::Subpixel]> + Clone,
{
    SerdeImgBuff::from(img).serialize(serializer)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame_decode() {
        let mut img = DepthImage::empty(Utc::now(), 4, 3);
        img.set_sample(1, 2, 5000);
        img.set_sample(3, 0, 1234);
        img.set_sample(9, 9, 1);

        let decoded = DepthImage::try_from(DepthFrame::from(&img)).unwrap();

        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 3);
        assert_eq!(decoded.sample(1, 2), Some(5000));
        assert_eq!(decoded.sample(3, 0), Some(1234));
        assert_eq!(decoded.sample(0, 0), Some(0));
        assert_eq!(decoded.sample(4, 0), None);
    }

    #[test]
    fn test_frame_wrong_size() {
        let frame = DepthFrame {
            timestamp: Utc::now(),
            width: 4,
            height: 4,
            b64_data: base64::encode(vec![0u8; 6]),
        };

        assert!(matches!(
            DepthImage::try_from(frame),
            Err(DepthError::FrameWrongSize)
        ));
    }
}
