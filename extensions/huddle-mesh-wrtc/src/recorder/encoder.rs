//! Turns composed pictures and mixed audio into one file.
//!
//! The bundled [`CborSegmentEncoder`] writes a sequence of CBOR values: one
//! [`Segment::Header`], then `Video` segments holding JPEG pictures and `Audio`
//! segments holding 16 bit PCM, in the order they were produced.
//!
//! That file is an archive, not a playable container: media players cannot open
//! it. [`read_segments`] gets the pictures and samples back out. To upload
//! something a player understands, pass a [`RecordingEncoder`] that muxes a real
//! container (for example fragmented MP4 over encoded video and Opus audio).

use std::io::Cursor;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use huddle::error::Error;
use huddle::media::AudioChunk;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};

pub trait RecordingEncoder: Send {
    fn mime_type(&self) -> &str;

    fn write_frame(&mut self, at: Duration, frame: &RgbaImage) -> Result<(), Error>;

    fn write_audio(&mut self, at: Duration, chunk: &AudioChunk) -> Result<(), Error>;

    /// Finalizes the file. Nothing can be written afterwards.
    fn finish(self: Box<Self>) -> Result<Bytes, Error>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Segment {
    Header {
        width: u32,
        height: u32,
        fps: u32,
        sample_rate: u32,
        started_at: DateTime<Utc>,
    },
    Video {
        at_ms: u64,
        jpeg: Bytes,
    },
    Audio {
        at_ms: u64,
        sample_rate: u32,
        pcm: Vec<i16>,
    },
}

pub struct CborSegmentEncoder {
    quality: u8,
    buffer: Vec<u8>,
    frames: usize,
}

impl CborSegmentEncoder {
    pub fn new(width: u32, height: u32, fps: u32, sample_rate: u32, quality: u8) -> Result<Self, Error> {
        let mut encoder = Self {
            quality: quality.clamp(1, 100),
            buffer: vec![],
            frames: 0,
        };
        encoder.push(&Segment::Header {
            width,
            height,
            fps,
            sample_rate,
            started_at: Utc::now(),
        })?;
        Ok(encoder)
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    fn push(&mut self, segment: &Segment) -> Result<(), Error> {
        serde_cbor::to_writer(&mut self.buffer, segment).map_err(|e| Error::Encoding(e.to_string()))
    }
}

impl RecordingEncoder for CborSegmentEncoder {
    fn mime_type(&self) -> &str {
        "application/cbor"
    }

    fn write_frame(&mut self, at: Duration, frame: &RgbaImage) -> Result<(), Error> {
        let rgb = DynamicImage::ImageRgba8(frame.clone()).to_rgb8();
        let mut jpeg = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&rgb)
            .map_err(|e| Error::Encoding(e.to_string()))?;
        self.push(&Segment::Video {
            at_ms: at.as_millis() as u64,
            jpeg: Bytes::from(jpeg.into_inner()),
        })?;
        self.frames += 1;
        Ok(())
    }

    fn write_audio(&mut self, at: Duration, chunk: &AudioChunk) -> Result<(), Error> {
        let pcm = chunk
            .samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        self.push(&Segment::Audio {
            at_ms: at.as_millis() as u64,
            sample_rate: chunk.sample_rate,
            pcm,
        })
    }

    fn finish(self: Box<Self>) -> Result<Bytes, Error> {
        Ok(Bytes::from(self.buffer))
    }
}

/// Reads back a file written by [`CborSegmentEncoder`]
pub fn read_segments(data: &[u8]) -> Result<Vec<Segment>, Error> {
    serde_cbor::Deserializer::from_slice(data)
        .into_iter::<Segment>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Encoding(e.to_string()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use huddle::media::AudioChunk;
    use image::{Rgba, RgbaImage};

    use super::{read_segments, CborSegmentEncoder, RecordingEncoder, Segment};

    #[test]
    fn segments_come_back_in_write_order() -> anyhow::Result<()> {
        let mut encoder = Box::new(CborSegmentEncoder::new(8, 8, 30, 8000, 80)?);
        let picture = RgbaImage::from_pixel(8, 8, Rgba([200, 10, 10, 255]));
        encoder.write_frame(Duration::from_millis(0), &picture)?;
        encoder.write_audio(Duration::from_millis(33), &AudioChunk::new(8000, vec![1.0, -1.0, 0.0]))?;
        encoder.write_frame(Duration::from_millis(33), &picture)?;
        assert_eq!(encoder.frames(), 2);

        let data = encoder.finish()?;
        let segments = read_segments(&data)?;
        assert_eq!(segments.len(), 4);
        assert!(matches!(segments[0], Segment::Header { width: 8, fps: 30, .. }));
        match &segments[1] {
            Segment::Video { at_ms, jpeg } => {
                assert_eq!(*at_ms, 0);
                let decoded = image::load_from_memory(jpeg)?.to_rgb8();
                assert_eq!(decoded.dimensions(), (8, 8));
                assert!(decoded.get_pixel(4, 4).0[0] > 150);
            }
            other => anyhow::bail!("unexpected segment {other:?}"),
        }
        assert!(matches!(
            &segments[2],
            Segment::Audio { at_ms: 33, pcm, .. } if pcm == &vec![i16::MAX, -i16::MAX, 0]
        ));
        Ok(())
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(read_segments(&[0xff, 0x00, 0x13]).is_err());
    }
}
