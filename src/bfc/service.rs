//! Higher-level BFC operations built on [`super::transport::BfcTransport`].

use crate::error::{Error, SieResult};
use crate::serial::SerialPort;

use super::transport::{BfcTransport, ExecOptions};
use super::frame::FrameType;

const DISPLAY_DST: u8 = 0x06;
const GET_DISPLAY_INFO_CMD: u8 = 0x03;

/// Pixel formats reported by `getDisplayInfo`'s type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Wb,
    Rgb332,
    Rgba4444,
    Rgb565,
    Rgb888,
    Rgb8888,
}

impl PixelFormat {
    fn from_type(ty: u8) -> SieResult<Self> {
        match ty {
            1 => Ok(PixelFormat::Wb),
            2 => Ok(PixelFormat::Rgb332),
            3 => Ok(PixelFormat::Rgba4444),
            4 => Ok(PixelFormat::Rgb565),
            5 => Ok(PixelFormat::Rgb888),
            9 => Ok(PixelFormat::Rgb8888),
            other => Err(Error::ProtocolViolation(format!(
                "unknown BFC display pixel type {other}"
            ))),
        }
    }

    /// Bytes needed to hold `width * height` pixels in this format. `wb`
    /// is 1-bit-per-pixel, packed 8 pixels to a byte.
    fn buffer_size(self, width: u32, height: u32) -> u64 {
        let pixels = width as u64 * height as u64;
        match self {
            PixelFormat::Wb => pixels.div_ceil(8),
            PixelFormat::Rgb332 => pixels,
            PixelFormat::Rgba4444 | PixelFormat::Rgb565 => pixels * 2,
            PixelFormat::Rgb888 => pixels * 3,
            PixelFormat::Rgb8888 => pixels * 4,
        }
    }
}

/// Display geometry and pixel layout reported by the phone.
#[derive(Debug, Clone, Copy)]
pub struct DisplayInfo {
    pub address: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl<P: SerialPort> BfcTransport<P> {
    /// Queries display geometry: a single frame carrying
    /// `(address:u32_le, width:u16_le, height:u16_le, type:u8)`.
    pub async fn get_display_info(&self, src: u8) -> SieResult<DisplayInfo> {
        let reply = self
            .exec(
                src,
                DISPLAY_DST,
                &[GET_DISPLAY_INFO_CMD],
                ExecOptions {
                    ty: FrameType::Single,
                    ..Default::default()
                },
            )
            .await?;

        if reply.len() < 9 {
            return Err(Error::ProtocolViolation(format!(
                "BFC display info reply too short: {} bytes",
                reply.len()
            )));
        }

        let address = u32::from_le_bytes(reply[0..4].try_into().unwrap()) as u64;
        let width = u16::from_le_bytes(reply[4..6].try_into().unwrap()) as u32;
        let height = u16::from_le_bytes(reply[6..8].try_into().unwrap()) as u32;
        let format = PixelFormat::from_type(reply[8])?;

        Ok(DisplayInfo { address, width, height, format })
    }

    /// Reads the phone's display info, then pulls exactly as many bytes
    /// as its pixel format and geometry require.
    pub async fn get_display_buffer(&self, src: u8) -> SieResult<Vec<u8>> {
        let info = self.get_display_info(src).await?;
        let size = info.format.buffer_size(info.width, info.height);
        self.read_memory(src, info.address, size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wb_packs_eight_pixels_per_byte() {
        assert_eq!(PixelFormat::Wb.buffer_size(128, 64), 128 * 64 / 8);
        assert_eq!(PixelFormat::Wb.buffer_size(101, 1), 13);
    }

    #[test]
    fn rgb565_is_two_bytes_per_pixel() {
        assert_eq!(PixelFormat::Rgb565.buffer_size(176, 220), 176 * 220 * 2);
    }

    #[test]
    fn rgb8888_is_four_bytes_per_pixel() {
        assert_eq!(PixelFormat::Rgb8888.buffer_size(10, 10), 400);
    }

    #[test]
    fn unknown_pixel_type_is_rejected() {
        assert!(PixelFormat::from_type(0xFF).is_err());
    }
}
