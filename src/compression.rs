//! Layer compression (§4.9): the wire media type each layer archive
//! format maps to, and streaming (de)compressor constructors.

use std::io::{Read, Write};

use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use oci_spec::image::MediaType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
    Zip,
}

const ZIP_MEDIA_TYPE: &str = "application/zip";

impl Compression {
    pub fn media_type(&self) -> MediaType {
        match self {
            Compression::None => MediaType::ImageLayer,
            Compression::Gzip => MediaType::ImageLayerGzip,
            Compression::Zstd => MediaType::ImageLayerZstd,
            Compression::Zip => MediaType::Other(ZIP_MEDIA_TYPE.to_string()),
        }
    }

    /// Tar-based variants carry `unpack=true`; zip does not (§4.9).
    pub fn unpack_annotation_value(&self) -> &'static str {
        match self {
            Compression::Zip => "false",
            _ => "true",
        }
    }
}

impl TryFrom<&MediaType> for Compression {
    type Error = ();
    fn try_from(media_type: &MediaType) -> Result<Self, Self::Error> {
        match media_type {
            MediaType::ImageLayer => Ok(Compression::None),
            MediaType::ImageLayerGzip => Ok(Compression::Gzip),
            MediaType::ImageLayerZstd => Ok(Compression::Zstd),
            MediaType::Other(s) if s == ZIP_MEDIA_TYPE => Ok(Compression::Zip),
            _ => Err(()),
        }
    }
}

/// Wraps `writer` with the compressor for `compression`; for `None`
/// returns a pass-through so callers have one code path.
pub fn compress_writer<'a, W: Write + 'a>(
    compression: Compression,
    writer: W,
) -> std::io::Result<Box<dyn Write + 'a>> {
    Ok(match compression {
        Compression::None | Compression::Zip => Box::new(writer),
        Compression::Gzip => Box::new(GzEncoder::new(writer, GzLevel::default())),
        Compression::Zstd => Box::new(zstd::stream::Encoder::new(writer, 0)?.auto_finish()),
    })
}

/// Wraps `reader` with the decompressor for `compression`.
pub fn decompress_reader<'a, R: Read + 'a>(
    compression: Compression,
    reader: R,
) -> std::io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::None | Compression::Zip => Box::new(reader),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::Decoder::new(reader)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_roundtrip() {
        for c in [Compression::None, Compression::Gzip, Compression::Zstd, Compression::Zip] {
            let mt = c.media_type();
            assert_eq!(Compression::try_from(&mt).unwrap(), c);
        }
    }

    #[test]
    fn test_unpack_annotation() {
        assert_eq!(Compression::Gzip.unpack_annotation_value(), "true");
        assert_eq!(Compression::Zip.unpack_annotation_value(), "false");
    }

    #[test]
    fn test_gzip_roundtrip() {
        let mut buf = Vec::new();
        {
            let mut w = compress_writer(Compression::Gzip, &mut buf).unwrap();
            w.write_all(b"hello world").unwrap();
        }
        let mut out = Vec::new();
        decompress_reader(Compression::Gzip, &buf[..])
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"hello world");
    }
}
