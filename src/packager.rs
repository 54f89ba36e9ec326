//! Artifact packager (C9): streams files/directories into layers and
//! manifests, and unpacks them back out.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageManifestBuilder, MediaType, SCHEMA_VERSION};

use crate::compression::{self, Compression};
use crate::content_store::{ContentStore, Selector};
use crate::digest;
use crate::error::{Error, Result};
use crate::model::{self, CONTENT_DIGEST_ANNOTATION, CONTENT_UNPACK_ANNOTATION, TITLE_ANNOTATION};

pub const DEFAULT_FILE_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const DEFAULT_UNKNOWN_ARTIFACT_TYPE: &str = "application/vnd.unknown.artifact.v1";

/// One filesystem input to `push_artifact`: a single file becomes one
/// layer verbatim; a directory becomes a packed archive layer.
pub struct Input {
    pub path: std::path::PathBuf,
    /// `None` picks the default per §4.9 (tar+gzip for directories, the
    /// file-layer media type for files).
    pub compression: Option<Compression>,
}

impl Input {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Input {
            path: path.into(),
            compression: None,
        }
    }
}

/// Packs `input` into one layer blob (in memory; callers needing a
/// truly unbounded stream for huge directories can adapt this to write
/// to a temp file instead — the archive format and annotation
/// convention are unchanged either way) and pushes it, returning the
/// layer's descriptor.
pub async fn pack_and_push_layer(
    store: &impl ContentStore,
    input: &Input,
) -> Result<Descriptor> {
    let metadata = std::fs::metadata(&input.path)?;
    let title = input
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invariant("input path has no file name"))?
        .to_string();

    if metadata.is_file() {
        let data = Bytes::from(std::fs::read(&input.path)?);
        let computed = digest::digest(&data);
        store.push_blob(&computed, data.clone()).await?;
        let oci_digest: oci_spec::image::Digest = (&computed).try_into()?;
        let mut annotations = HashMap::new();
        annotations.insert(TITLE_ANNOTATION.to_string(), title);
        return Ok(DescriptorBuilder::default()
            .media_type(DEFAULT_FILE_LAYER_MEDIA_TYPE)
            .size(data.len() as u64)
            .digest(oci_digest)
            .annotations(annotations)
            .build()
            .map_err(|e| Error::invariant(e.to_string()))?);
    }

    let compression = input.compression.unwrap_or(Compression::Gzip);
    let (uncompressed_digest, packed) = pack_directory(&input.path, compression)?;
    let packed = Bytes::from(packed);
    let computed = digest::digest(&packed);
    store.push_blob(&computed, packed.clone()).await?;

    let oci_digest: oci_spec::image::Digest = (&computed).try_into()?;
    let mut annotations = HashMap::new();
    annotations.insert(TITLE_ANNOTATION.to_string(), title);
    annotations.insert(
        CONTENT_UNPACK_ANNOTATION.to_string(),
        compression.unpack_annotation_value().to_string(),
    );
    annotations.insert(CONTENT_DIGEST_ANNOTATION.to_string(), uncompressed_digest.to_string());

    Ok(DescriptorBuilder::default()
        .media_type(compression.media_type())
        .size(packed.len() as u64)
        .digest(oci_digest)
        .annotations(annotations)
        .build()
        .map_err(|e| Error::invariant(e.to_string()))?)
}

/// Tars `dir` then applies `compression`; returns the digest of the
/// uncompressed tar (used for the `io.deis.oras.content.digest`
/// annotation, verified on unpack) alongside the final bytes pushed.
fn pack_directory(dir: &Path, compression: Compression) -> Result<(digest::Digest, Vec<u8>)> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        builder.append_dir_all(".", dir)?;
        builder.finish()?;
    }
    let uncompressed_digest = digest::digest(&tar_bytes);

    if compression == Compression::Zip {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        write_zip_dir(&mut zip, dir, dir)?;
        let zip_bytes = zip.finish()?.into_inner();
        return Ok((uncompressed_digest, zip_bytes));
    }

    let mut out = Vec::new();
    {
        let mut writer = compression::compress_writer(compression, &mut out)?;
        writer.write_all(&tar_bytes)?;
    }
    Ok((uncompressed_digest, out))
}

fn write_zip_dir<W: std::io::Write + std::io::Seek>(
    zip: &mut zip::ZipWriter<W>,
    root: &Path,
    current: &Path,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap();
        if path.is_dir() {
            zip.add_directory(rel.to_string_lossy(), zip::write::SimpleFileOptions::default())?;
            write_zip_dir(zip, root, &path)?;
        } else {
            zip.start_file(rel.to_string_lossy(), zip::write::SimpleFileOptions::default())?;
            let data = std::fs::read(&path)?;
            zip.write_all(&data)?;
        }
    }
    Ok(())
}

/// `pushArtifact`: packs every input into a layer, pushes an empty
/// config unless the caller supplied one, then pushes the manifest.
pub async fn push_artifact(
    store: &impl ContentStore,
    selector: &Selector,
    artifact_type: Option<&str>,
    annotations: HashMap<String, String>,
    inputs: &[Input],
) -> Result<Descriptor> {
    let mut layers = Vec::with_capacity(inputs.len());
    for input in inputs {
        layers.push(pack_and_push_layer(store, input).await?);
    }

    let config = model::empty_config_descriptor()?;
    store.push_blob(&config.digest().try_into()?, Bytes::from_static(model::EMPTY_CONFIG_BYTES)).await?;

    let mut builder = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers);
    if let Some(artifact_type) = artifact_type {
        builder = builder.artifact_type(MediaType::Other(artifact_type.to_string()));
    }
    if !annotations.is_empty() {
        builder = builder.annotations(annotations);
    }
    let manifest = builder.build().map_err(|e| Error::invariant(e.to_string()))?;
    let data = Bytes::from(serde_json::to_vec(&manifest)?);
    store.push_manifest(selector, "application/vnd.oci.image.manifest.v1+json", data).await
}

/// `attachArtifact`: builds a manifest with `subject` set to the
/// subject's own descriptor and pushes it; discoverable later via
/// `get_referrers`.
pub async fn attach_artifact(
    store: &impl ContentStore,
    selector: &Selector,
    subject: Descriptor,
    artifact_type: Option<&str>,
    annotations: HashMap<String, String>,
    inputs: &[Input],
) -> Result<Descriptor> {
    let mut layers = Vec::with_capacity(inputs.len());
    for input in inputs {
        layers.push(pack_and_push_layer(store, input).await?);
    }
    let config = model::empty_config_descriptor()?;
    store.push_blob(&config.digest().try_into()?, Bytes::from_static(model::EMPTY_CONFIG_BYTES)).await?;

    let mut builder = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers)
        .subject(subject);
    let artifact_type = artifact_type.unwrap_or(DEFAULT_UNKNOWN_ARTIFACT_TYPE);
    builder = builder.artifact_type(MediaType::Other(artifact_type.to_string()));
    if !annotations.is_empty() {
        builder = builder.annotations(annotations);
    }
    let manifest = builder.build().map_err(|e| Error::invariant(e.to_string()))?;
    let data = Bytes::from(serde_json::to_vec(&manifest)?);
    store.push_manifest(selector, "application/vnd.oci.image.manifest.v1+json", data).await
}

/// `pullArtifact`: fetches the manifest, streams titled layers to
/// `<dest>/<title>`, unpacking tar/tar+gzip/tar+zstd/zip layers and
/// verifying the unpacked content digest when present.
pub async fn pull_artifact(
    store: &impl ContentStore,
    selector: &Selector,
    dest: &Path,
    overwrite: bool,
) -> Result<()> {
    let Some((_, data)) = store.get_manifest(selector).await? else {
        return Err(Error::invariant("manifest not found"));
    };
    let manifest = oci_spec::image::ImageManifest::from_reader(std::io::Cursor::new(&data))?;

    std::fs::create_dir_all(dest)?;

    for layer in manifest.layers() {
        let Some(title) = layer
            .annotations()
            .as_ref()
            .and_then(|a| a.get(TITLE_ANNOTATION))
        else {
            continue;
        };
        let digest: digest::Digest = layer.digest().try_into()?;
        let Some(bytes) = store.fetch_blob(&digest).await? else {
            return Err(Error::invariant(format!("layer blob {digest} missing from store")));
        };

        let out_path = dest.join(title);
        if out_path.exists() && !overwrite {
            return Err(Error::invariant(format!("{} already exists", out_path.display())));
        }

        let unpack = layer
            .annotations()
            .as_ref()
            .and_then(|a| a.get(CONTENT_UNPACK_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false);

        if unpack {
            let compression = Compression::try_from(layer.media_type())
                .map_err(|_| Error::invariant("unrecognized layer media type for unpack"))?;
            unpack_layer(&bytes, compression, &out_path, layer.annotations())?;
        } else {
            std::fs::write(&out_path, &bytes)?;
        }
    }
    Ok(())
}

fn unpack_layer(
    bytes: &[u8],
    compression: Compression,
    out_dir: &Path,
    annotations: &Option<HashMap<String, String>>,
) -> Result<()> {
    if compression == Compression::Zip {
        std::fs::create_dir_all(out_dir)?;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let out_path = out_dir.join(file.mangled_name());
            if file.is_dir() {
                std::fs::create_dir_all(&out_path)?;
            } else {
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = std::fs::File::create(&out_path)?;
                std::io::copy(&mut file, &mut out)?;
            }
        }
        return Ok(());
    }

    let mut tar_bytes = Vec::new();
    {
        let mut reader = compression::decompress_reader(compression, bytes)?;
        std::io::Read::read_to_end(&mut reader, &mut tar_bytes)?;
    }

    if let Some(expected) = annotations.as_ref().and_then(|a| a.get(CONTENT_DIGEST_ANNOTATION)) {
        let computed = digest::digest(&tar_bytes);
        if &computed.to_string() != expected {
            return Err(Error::DigestMismatch {
                expected: expected.clone(),
                computed: computed.to_string(),
            });
        }
    }

    std::fs::create_dir_all(out_dir)?;
    let mut archive = tar::Archive::new(&tar_bytes[..]);
    archive.unpack(out_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_layout::OciLayout;

    #[tokio::test]
    async fn test_push_and_pull_single_file_roundtrip() {
        let store_dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(store_dir.path()).unwrap();

        let input_dir = tempfile::tempdir().unwrap();
        let file_path = input_dir.path().join("hello.txt");
        std::fs::write(&file_path, b"hello world").unwrap();

        let selector = Selector::from_tag("latest");
        push_artifact(&layout, &selector, None, HashMap::new(), &[Input::new(&file_path)])
            .await
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        pull_artifact(&layout, &selector, dest.path(), false).await.unwrap();

        let pulled = std::fs::read(dest.path().join("hello.txt")).unwrap();
        assert_eq!(pulled, b"hello world");
    }

    #[tokio::test]
    async fn test_push_and_pull_directory_tar_gzip() {
        // S6: a directory of three files becomes one tar+gzip layer.
        let store_dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(store_dir.path()).unwrap();

        let input_dir = tempfile::tempdir().unwrap();
        let pack_dir = input_dir.path().join("payload");
        std::fs::create_dir_all(&pack_dir).unwrap();
        std::fs::write(pack_dir.join("file1.txt"), b"foobar").unwrap();
        std::fs::write(pack_dir.join("file2.txt"), b"test1234").unwrap();
        std::fs::write(pack_dir.join("file3.txt"), b"barfoo").unwrap();

        let selector = Selector::from_tag("latest");
        let descriptor = push_artifact(&layout, &selector, None, HashMap::new(), &[Input::new(&pack_dir)])
            .await
            .unwrap();

        let (_, manifest_bytes) = layout.get_manifest(&selector).await.unwrap().unwrap();
        let manifest = oci_spec::image::ImageManifest::from_reader(std::io::Cursor::new(&manifest_bytes)).unwrap();
        assert_eq!(manifest.layers().len(), 1);
        assert_eq!(
            manifest.layers()[0].media_type().to_string(),
            "application/vnd.oci.image.layer.v1.tar+gzip"
        );
        assert_eq!(
            manifest.layers()[0]
                .annotations()
                .as_ref()
                .and_then(|a| a.get(CONTENT_UNPACK_ANNOTATION))
                .map(String::as_str),
            Some("true")
        );

        let dest = tempfile::tempdir().unwrap();
        pull_artifact(&layout, &selector, dest.path(), false).await.unwrap();

        let unpacked = dest.path().join("payload");
        assert_eq!(std::fs::read(unpacked.join("file1.txt")).unwrap(), b"foobar");
        assert_eq!(std::fs::read(unpacked.join("file2.txt")).unwrap(), b"test1234");
        assert_eq!(std::fs::read(unpacked.join("file3.txt")).unwrap(), b"barfoo");
        let _ = descriptor;
    }
}
