//! `multipart/x-mixed-replace` JPEG streams over lazy frame iterators.
//!
//! Frames are pulled and encoded only when the HTTP writer asks for more
//! bytes, so a client that stops reading stops the camera, and dropping the
//! reader drops the iterator (and with it the camera).

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::{self, Read};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const JPEG_QUALITY: u8 = 80;

/// Encode one multipart part: boundary, headers, JPEG body.
pub fn encode_part(image: &RgbImage, out: &mut Vec<u8>) -> io::Result<()> {
    out.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes());
    JpegEncoder::new_with_quality(&mut *out, JPEG_QUALITY)
        .encode_image(image)
        .map_err(io::Error::other)?;
    out.extend_from_slice(b"\r\n");
    Ok(())
}

/// `Read` adapter producing one multipart part per frame.
pub struct MjpegStream<I> {
    frames: I,
    part: Vec<u8>,
    pos: usize,
    sent: u64,
}

impl<I> MjpegStream<I>
where
    I: Iterator<Item = RgbImage>,
{
    pub fn new(frames: I) -> Self {
        Self {
            frames,
            part: Vec::new(),
            pos: 0,
            sent: 0,
        }
    }
}

impl<I> Read for MjpegStream<I>
where
    I: Iterator<Item = RgbImage>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.part.len() {
            let Some(frame) = self.frames.next() else {
                return Ok(0);
            };
            self.part.clear();
            self.pos = 0;
            encode_part(&frame, &mut self.part)?;
            self.sent += 1;
        }
        let n = buf.len().min(self.part.len() - self.pos);
        buf[..n].copy_from_slice(&self.part[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<I> Drop for MjpegStream<I> {
    fn drop(&mut self) {
        tracing::debug!(frames = self.sent, "mjpeg stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> impl Iterator<Item = RgbImage> {
        (0..n).map(|i| RgbImage::from_pixel(16, 16, image::Rgb([i as u8 * 40, 0, 0])))
    }

    #[test]
    fn test_parts_are_framed() {
        let mut body = Vec::new();
        MjpegStream::new(frames(2)).read_to_end(&mut body).unwrap();

        let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert!(body.starts_with(header));
        let parts = body.windows(header.len()).filter(|w| *w == header).count();
        assert_eq!(parts, 2);
        // JPEG SOI right after the part headers, and parts end with CRLF.
        assert_eq!(&body[header.len()..header.len() + 2], &[0xFF, 0xD8]);
        assert!(body.ends_with(b"\xFF\xD9\r\n"));
    }

    #[test]
    fn test_small_reads_reassemble() {
        let mut whole = Vec::new();
        MjpegStream::new(frames(3)).read_to_end(&mut whole).unwrap();

        let mut stream = MjpegStream::new(frames(3));
        let mut pieces = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            pieces.extend_from_slice(&buf[..n]);
        }
        assert_eq!(pieces, whole);
    }

    #[test]
    fn test_empty_iterator_is_empty_body() {
        let mut body = Vec::new();
        MjpegStream::new(frames(0)).read_to_end(&mut body).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_frames_pulled_lazily() {
        let pulled = std::cell::Cell::new(0);
        let counted = (0..100).map(|_| {
            pulled.set(pulled.get() + 1);
            RgbImage::new(8, 8)
        });
        let mut stream = MjpegStream::new(counted);
        let mut buf = [0u8; 4];
        stream.read(&mut buf).unwrap();
        assert_eq!(pulled.get(), 1);
    }
}
