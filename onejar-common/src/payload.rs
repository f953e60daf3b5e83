//! Executable payload
//!
//! A packaged archive is the boot binary with the output tree appended as an
//! uncompressed tar payload, so entries can be read in place by offset:
//! [boot binary][ONEJAR_MAGIC][metadata_len:u32][metadata:JSON][tar payload][header_offset:u64][ONEJAR_MAGIC]

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a onejar payload
///
/// The leading 0x00 keeps the sequence out of ordinary string literals; the
/// last byte is the format version.
pub const ONEJAR_MAGIC: &[u8; 8] = b"\x00OJAR\xE2\x96\x01";

/// Current metadata format version
pub const PAYLOAD_FORMAT_VERSION: u8 = 1;

/// Footer: header offset (u64) followed by the magic
const FOOTER_LEN: u64 = 16;

/// Upper bound for the metadata block
const MAX_METADATA_LEN: usize = 1024 * 1024;

/// Metadata stored between the header magic and the tar payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub format_version: u8,

    /// Hosted application id, for display
    pub application: String,

    /// Size of the tar payload in bytes
    pub payload_size: u64,

    /// SHA256 of the tar payload, hex encoded
    pub payload_checksum: String,

    /// Tool and version that assembled the archive
    pub created_by: String,
}

/// Location of the payload inside an executable
#[derive(Debug, Clone)]
pub struct PayloadInfo {
    pub metadata: PayloadMetadata,

    /// Offset where the tar payload starts
    pub payload_offset: u64,

    /// Size of the tar payload
    pub payload_size: u64,

    /// Path to the executable (for reopening)
    pub exe_path: PathBuf,
}

/// Create an uncompressed tar archive from a directory
pub fn create_tar_archive(input_dir: &Path) -> Result<Vec<u8>> {
    let mut archive_data = Vec::new();

    {
        let mut builder = tar::Builder::new(&mut archive_data);
        builder.follow_symlinks(false);

        builder
            .append_dir_all(".", input_dir)
            .context("Failed to add directory to tar archive")?;

        builder.finish().context("Failed to finish tar archive")?;
    }

    Ok(archive_data)
}

/// Calculate SHA256 checksum
pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Assemble `boot binary + payload(tree)` into `output`
pub fn write_executable(
    output: &Path,
    boot_binary: &[u8],
    tree: &Path,
    application: &str,
) -> Result<PayloadMetadata> {
    let tar_data = create_tar_archive(tree)?;

    let metadata = PayloadMetadata {
        format_version: PAYLOAD_FORMAT_VERSION,
        application: application.to_string(),
        payload_size: tar_data.len() as u64,
        payload_checksum: calculate_sha256(&tar_data),
        created_by: format!("onejar {}", env!("CARGO_PKG_VERSION")),
    };
    let metadata_json = serde_json::to_vec(&metadata)?;

    let mut output_file = File::create(output)
        .with_context(|| format!("Failed to create {:?}", output))?;

    output_file.write_all(boot_binary)?;
    output_file.write_all(ONEJAR_MAGIC)?;
    output_file.write_all(&(metadata_json.len() as u32).to_le_bytes())?;
    output_file.write_all(&metadata_json)?;
    output_file.write_all(&tar_data)?;

    // Footer allows O(1) lookup of the header regardless of payload size
    let header_offset = boot_binary.len() as u64;
    output_file.write_all(&header_offset.to_le_bytes())?;
    output_file.write_all(ONEJAR_MAGIC)?;
    output_file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(output)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(output, perms)?;
    }

    Ok(metadata)
}

/// Read payload information from an assembled executable
pub fn read_payload_info(exe_path: &Path) -> Result<PayloadInfo> {
    let file = File::open(exe_path)
        .with_context(|| format!("Failed to open executable: {:?}", exe_path))?;

    let file_size = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let header_offset = find_header_offset(&mut reader, file_size)?
        .ok_or_else(|| anyhow::anyhow!("onejar footer not found in {:?}", exe_path))?;

    reader.seek(SeekFrom::Start(header_offset))?;
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != *ONEJAR_MAGIC {
        bail!("Header magic mismatch at offset {}", header_offset);
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let metadata_len = u32::from_le_bytes(len_bytes) as usize;

    if metadata_len > MAX_METADATA_LEN {
        bail!("Metadata length {} exceeds maximum (1MB)", metadata_len);
    }

    let mut metadata_bytes = vec![0u8; metadata_len];
    reader.read_exact(&mut metadata_bytes)?;

    let metadata: PayloadMetadata = serde_json::from_slice(&metadata_bytes)
        .context("Failed to parse onejar metadata")?;

    if metadata.format_version != PAYLOAD_FORMAT_VERSION {
        bail!("Unsupported payload format version {}", metadata.format_version);
    }

    let payload_offset = reader.stream_position()?;
    let available = (file_size - FOOTER_LEN).saturating_sub(payload_offset);
    if metadata.payload_size != available {
        bail!(
            "Payload size mismatch: metadata says {}, archive holds {}",
            metadata.payload_size,
            available
        );
    }

    Ok(PayloadInfo {
        payload_size: metadata.payload_size,
        metadata,
        payload_offset,
        exe_path: exe_path.to_path_buf(),
    })
}

/// Whether `path` carries a onejar footer
pub fn has_payload(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let Ok(meta) = file.metadata() else {
        return false;
    };
    let mut reader = BufReader::new(file);
    matches!(find_header_offset(&mut reader, meta.len()), Ok(Some(_)))
}

/// Locate the header using the footer
fn find_header_offset<R: Read + Seek>(reader: &mut R, file_size: u64) -> Result<Option<u64>> {
    if file_size < FOOTER_LEN {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(file_size - FOOTER_LEN))?;
    let mut footer = [0u8; FOOTER_LEN as usize];
    reader.read_exact(&mut footer)?;

    let (offset_bytes, magic_bytes) = footer.split_at(8);
    if magic_bytes != ONEJAR_MAGIC {
        return Ok(None);
    }

    let mut offset = [0u8; 8];
    offset.copy_from_slice(offset_bytes);
    let offset = u64::from_le_bytes(offset);

    // Sanity check offset
    if offset >= file_size - FOOTER_LEN {
        return Ok(None);
    }

    Ok(Some(offset))
}

/// Create a reader positioned at the payload start
pub fn open_payload_reader(info: &PayloadInfo) -> Result<impl Read> {
    let file = File::open(&info.exe_path)?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(info.payload_offset))?;
    Ok(reader.take(info.payload_size))
}

/// Verify the payload checksum recorded in the metadata
pub fn verify_checksum(info: &PayloadInfo) -> Result<bool> {
    let mut reader = open_payload_reader(info)?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()) == info.metadata.payload_checksum)
}
