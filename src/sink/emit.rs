use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::Serialize;
use std::io::Write;

use super::ResultSink;
use crate::frame::Image;
use crate::process::AnalysisResult;
use crate::CameraId;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// One emitted line.
#[derive(Debug, Serialize)]
pub struct EmitPayload {
    pub camera_id: CameraId,
    /// `data:image/jpeg;base64,...`
    pub image: String,
    pub names: Vec<String>,
    pub is_cheating: bool,
}

impl EmitPayload {
    pub fn from_result(result: &AnalysisResult, quality: u8) -> Result<Self> {
        Ok(Self {
            camera_id: result.camera_id,
            image: jpeg_data_url(&result.image, quality)?,
            names: result.names(),
            is_cheating: result.is_cheating(),
        })
    }
}

/// Encode an RGB8 image as baseline JPEG.
pub fn encode_jpeg(image: &Image, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode(
            image.pixels(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .context("encode frame as JPEG")?;
    Ok(bytes)
}

pub fn jpeg_data_url(image: &Image, quality: u8) -> Result<String> {
    let jpeg = encode_jpeg(image, quality)?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    ))
}

/// Network emitter: writes one JSON object per result, newline-terminated,
/// to any byte transport (socket, pipe, file, stdout).
pub struct EmitSink<W: Write + Send> {
    writer: W,
    quality: u8,
    emitted: u64,
}

impl<W: Write + Send> EmitSink<W> {
    pub fn new(writer: W) -> Self {
        Self::with_quality(writer, DEFAULT_JPEG_QUALITY)
    }

    pub fn with_quality(writer: W, quality: u8) -> Self {
        Self {
            writer,
            quality,
            emitted: 0,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ResultSink for EmitSink<W> {
    fn name(&self) -> &str {
        "emit"
    }

    fn accept(&mut self, result: &AnalysisResult) -> Result<()> {
        let payload = EmitPayload::from_result(result, self.quality)?;
        serde_json::to_writer(&mut self.writer, &payload).context("serialize emit payload")?;
        self.writer.write_all(b"\n").context("write emit payload")?;
        self.writer.flush().context("flush emit transport")?;
        self.emitted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, RecognitionMatch};
    use crate::sink::tests::sample_result;

    #[test]
    fn emits_one_json_line_with_jpeg_data_url() {
        let mut result = sample_result(3, 7, true);
        result.matches.push(RecognitionMatch {
            identity: "Grace Hopper".to_string(),
            similarity: 0.91,
            bbox: BoundingBox::new(0, 0, 4, 4),
        });

        let mut sink = EmitSink::new(Vec::new());
        sink.accept(&result).unwrap();
        sink.accept(&sample_result(3, 8, false)).unwrap();
        assert_eq!(sink.emitted(), 2);

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["camera_id"], 3);
        assert_eq!(first["is_cheating"], true);
        assert_eq!(first["names"], serde_json::json!(["Grace Hopper"]));

        let data_url = first["image"].as_str().unwrap();
        let encoded = data_url.strip_prefix("data:image/jpeg;base64,").unwrap();
        let jpeg = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    struct ClosedSocket;

    impl Write for ClosedSocket {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer went away",
            ))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transport_errors_surface_to_the_distributor() {
        let mut sink = EmitSink::new(ClosedSocket);
        assert!(sink.accept(&sample_result(0, 1, false)).is_err());
        assert_eq!(sink.emitted(), 0);
    }
}
