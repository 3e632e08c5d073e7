//! Sequential archive stream carrying one changeset.
//!
//! ```text
//! magic "CRNA" | version u16
//! { 0x01 | header_len u32 | bincode(EntryHeader) | body[size] }*
//! [ 0x02 | len u32 | bincode(Manifest) ]
//! 0xFF | entry_count u64 | blake3(all preceding bytes) [32]
//! ```
//!
//! All integers are little-endian. Bodies are present only for regular
//! files. Entries appear in strictly increasing path order.

use crate::diff::{Change, ChangeEntry, Changeset};
use crate::manifest::Manifest;
use crate::types::is_normalized;
use crate::{ContentHash, Error, FileKind, FileRecord, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tracing::debug;

pub const MAGIC: &[u8; 4] = b"CRNA";

const TAG_ENTRY: u8 = 0x01;
const TAG_MANIFEST: u8 = 0x02;
const TAG_END: u8 = 0xFF;

const MAX_HEADER_LEN: u32 = 1 << 20;
const MAX_MANIFEST_LEN: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V1,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion::V1;

    pub fn as_u16(self) -> u16 {
        match self {
            FormatVersion::V1 => 1,
        }
    }

    pub fn from_u16(version: u16) -> Result<Self> {
        match version {
            1 => Ok(FormatVersion::V1),
            other => Err(Error::format(
                "archive header",
                format!("unsupported format version {}", other),
            )),
        }
    }
}

/// Per-entry metadata, stored ahead of the entry body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub path: String,
    pub change: Change,
    pub kind: FileKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub fingerprint: Option<ContentHash>,
    pub link_target: Option<String>,
}

impl EntryHeader {
    pub fn from_entry(entry: &ChangeEntry) -> Self {
        let record = &entry.record;
        Self {
            path: record.path.clone(),
            change: entry.change,
            kind: record.kind,
            mode: record.mode,
            size: record.size,
            mtime: record.mtime,
            fingerprint: record.fingerprint,
            link_target: record.link_target.clone(),
        }
    }

    pub fn into_record(self) -> (Change, FileRecord) {
        (
            self.change,
            FileRecord {
                path: self.path,
                kind: self.kind,
                mode: self.mode,
                size: self.size,
                mtime: self.mtime,
                fingerprint: self.fingerprint,
                link_target: self.link_target,
            },
        )
    }

    fn has_body(&self) -> bool {
        self.kind == FileKind::File
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !is_normalized(&self.path) {
            return Err(format!("unsafe path {:?}", self.path));
        }
        let tombstone = self.kind == FileKind::Tombstone;
        if tombstone != (self.change == Change::Removed) {
            return Err(format!(
                "entry {} is {:?} but marked {:?}",
                self.path, self.kind, self.change
            ));
        }
        if self.kind == FileKind::File && self.fingerprint.is_none() {
            return Err(format!("file {} has no fingerprint", self.path));
        }
        if self.kind == FileKind::Symlink && self.link_target.is_none() {
            return Err(format!("symlink {} has no target", self.path));
        }
        Ok(())
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming archive encoder.
pub struct ArchiveWriter<W: Write> {
    out: HashingWriter<W>,
    count: u64,
    last_path: Option<String>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut out = HashingWriter {
            inner,
            hasher: blake3::Hasher::new(),
        };
        out.write_all(MAGIC)?;
        out.write_all(&FormatVersion::CURRENT.as_u16().to_le_bytes())?;
        Ok(Self {
            out,
            count: 0,
            last_path: None,
        })
    }

    /// Appends one entry. Paths must arrive in increasing order and `body`
    /// must be exactly the file content described by `header`.
    pub fn append(&mut self, header: &EntryHeader, body: &[u8]) -> Result<()> {
        header
            .validate()
            .map_err(|reason| Error::format("archive writer", reason))?;
        if let Some(last) = &self.last_path {
            if header.path.as_str() <= last.as_str() {
                return Err(Error::format(
                    "archive writer",
                    format!("entry {} does not sort after {}", header.path, last),
                ));
            }
        }
        if header.has_body() {
            if body.len() as u64 != header.size {
                return Err(Error::format(
                    "archive writer",
                    format!(
                        "entry {} declares {} bytes but {} were given",
                        header.path,
                        header.size,
                        body.len()
                    ),
                ));
            }
        } else if !body.is_empty() {
            return Err(Error::format(
                "archive writer",
                format!("entry {} cannot carry a body", header.path),
            ));
        }

        let encoded = bincode::serialize(header)
            .map_err(|e| Error::format("archive writer", e.to_string()))?;
        let len = section_len(encoded.len(), MAX_HEADER_LEN)
            .map_err(|reason| Error::format(format!("archive entry {}", header.path), reason))?;
        self.out.write_all(&[TAG_ENTRY])?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&encoded)?;
        self.out.write_all(body)?;

        self.count += 1;
        self.last_path = Some(header.path.clone());
        Ok(())
    }

    /// Writes the optional manifest section and the end marker, returning the
    /// underlying writer.
    pub fn finish(mut self, manifest: Option<&Manifest>) -> Result<W> {
        if let Some(manifest) = manifest {
            let encoded = bincode::serialize(manifest)
                .map_err(|e| Error::format("archive writer", e.to_string()))?;
            let len = section_len(encoded.len(), MAX_MANIFEST_LEN)
                .map_err(|reason| Error::format("archive manifest", reason))?;
            self.out.write_all(&[TAG_MANIFEST])?;
            self.out.write_all(&len.to_le_bytes())?;
            self.out.write_all(&encoded)?;
        }

        self.out.write_all(&[TAG_END])?;
        self.out.write_all(&self.count.to_le_bytes())?;
        let digest = self.out.hasher.finalize();

        let mut inner = self.out.inner;
        inner.write_all(digest.as_bytes())?;
        inner.flush()?;
        Ok(inner)
    }
}

/// Length prefix for a section of `len` bytes. Anything the reader would
/// refuse is refused here, before a blob is ever uploaded.
fn section_len(len: usize, limit: u32) -> std::result::Result<u32, String> {
    u32::try_from(len)
        .ok()
        .filter(|&n| n <= limit)
        .ok_or_else(|| format!("section of {} bytes exceeds the limit of {} bytes", len, limit))
}

struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// One decoded entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub header: EntryHeader,
    pub body: Option<Bytes>,
}

/// Streaming archive decoder. Entries are validated as they are read; the
/// count and digest are checked when the end marker is reached.
pub struct ArchiveReader<R: Read> {
    input: HashingReader<R>,
    version: FormatVersion,
    count: u64,
    last_path: Option<String>,
    manifest: Option<Manifest>,
    finished: bool,
}

fn read_err(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::format("archive", "stream is truncated")
    } else {
        Error::Io(e)
    }
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        let mut input = HashingReader {
            inner,
            hasher: blake3::Hasher::new(),
        };
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic).map_err(read_err)?;
        if &magic != MAGIC {
            return Err(Error::format("archive header", "bad magic"));
        }
        let mut version = [0u8; 2];
        input.read_exact(&mut version).map_err(read_err)?;
        let version = FormatVersion::from_u16(u16::from_le_bytes(version))?;

        Ok(Self {
            input,
            version,
            count: 0,
            last_path: None,
            manifest: None,
            finished: false,
        })
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    /// Manifest section, available once [`next_entry`](Self::next_entry) has
    /// returned `None`.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn into_manifest(self) -> Option<Manifest> {
        self.manifest
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.input.read_exact(&mut byte).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::format("archive", "stream ends without an end marker")
            } else {
                Error::Io(e)
            }
        })?;
        Ok(byte[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.input.read_exact(&mut buf).map_err(read_err)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf).map_err(read_err)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(1 << 20) as usize);
        (&mut self.input).take(len).read_to_end(&mut buf).map_err(read_err)?;
        if buf.len() as u64 != len {
            return Err(Error::format("archive", "stream is truncated"));
        }
        Ok(buf)
    }

    /// Next entry, or `None` once the end marker has been verified.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.read_u8()? {
                TAG_ENTRY if self.manifest.is_none() => return self.read_entry().map(Some),
                TAG_MANIFEST if self.manifest.is_none() => {
                    let len = self.read_u32()?;
                    if len > MAX_MANIFEST_LEN {
                        return Err(Error::format(
                            "archive manifest",
                            format!("section of {} bytes exceeds the limit", len),
                        ));
                    }
                    let data = self.read_exact_vec(len as u64)?;
                    let manifest: Manifest = bincode::deserialize(&data)
                        .map_err(|e| Error::format("archive manifest", e.to_string()))?;
                    manifest
                        .validate()
                        .map_err(|reason| Error::format("archive manifest", reason))?;
                    self.manifest = Some(manifest);
                }
                TAG_END => {
                    self.read_end()?;
                    return Ok(None);
                }
                tag => {
                    return Err(Error::format(
                        "archive",
                        format!("unexpected section tag {:#04x}", tag),
                    ));
                }
            }
        }
    }

    fn read_entry(&mut self) -> Result<ArchiveEntry> {
        let header_len = self.read_u32()?;
        if header_len > MAX_HEADER_LEN {
            return Err(Error::format(
                "archive entry",
                format!("header of {} bytes exceeds the limit", header_len),
            ));
        }
        let data = self.read_exact_vec(header_len as u64)?;
        let header: EntryHeader = bincode::deserialize(&data)
            .map_err(|e| Error::format("archive entry", e.to_string()))?;
        header
            .validate()
            .map_err(|reason| Error::format("archive entry", reason))?;

        if let Some(last) = &self.last_path {
            if header.path.as_str() <= last.as_str() {
                return Err(Error::format(
                    format!("archive entry {}", header.path),
                    format!("does not sort after {}", last),
                ));
            }
        }

        let body = if header.has_body() {
            let body = self.read_exact_vec(header.size)?;
            if header.fingerprint != Some(ContentHash::from_data(&body)) {
                return Err(Error::format(
                    format!("archive entry {}", header.path),
                    "content does not match its fingerprint",
                ));
            }
            Some(Bytes::from(body))
        } else {
            None
        };

        self.count += 1;
        self.last_path = Some(header.path.clone());
        Ok(ArchiveEntry { header, body })
    }

    fn read_end(&mut self) -> Result<()> {
        let count = self.read_u64()?;
        let computed = self.input.hasher.finalize();

        let mut stored = [0u8; 32];
        self.input.inner.read_exact(&mut stored).map_err(read_err)?;

        if count != self.count {
            return Err(Error::format(
                "archive trailer",
                format!("declares {} entries but {} were read", count, self.count),
            ));
        }
        if computed.as_bytes() != &stored {
            return Err(Error::format("archive trailer", "digest mismatch"));
        }

        let mut probe = [0u8; 1];
        loop {
            match self.input.inner.read(&mut probe) {
                Ok(0) => break,
                Ok(_) => return Err(Error::format("archive trailer", "trailing data")),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        self.finished = true;
        Ok(())
    }
}

/// Serializes a changeset and the manifest it produces.
pub fn pack(changeset: &Changeset) -> Result<Vec<u8>> {
    let mut writer = ArchiveWriter::new(Vec::new())?;
    for entry in changeset.entries() {
        let body = entry.content.as_deref().unwrap_or_default();
        writer.append(&EntryHeader::from_entry(entry), body)?;
    }
    let data = writer.finish(Some(changeset.manifest()))?;
    debug!(entries = changeset.entries().len(), bytes = data.len(), "Archive packed");
    Ok(data)
}

/// Inverse of [`pack`]. The manifest section is required.
pub fn unpack(data: &[u8]) -> Result<Changeset> {
    let mut reader = ArchiveReader::new(data)?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry()? {
        let (change, record) = entry.header.into_record();
        entries.push(ChangeEntry {
            change,
            record,
            content: entry.body,
        });
    }
    let manifest = reader
        .into_manifest()
        .ok_or_else(|| Error::format("archive", "manifest section is missing"))?;
    Ok(Changeset::new(entries, manifest, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{DiffMode, diff};
    use crate::scan::{ScanOptions, scan_tree};
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/readme.md"), b"# cairn\n").unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();
        dir
    }

    fn sample_changeset() -> Changeset {
        let dir = sample_tree();
        let scan = scan_tree(dir.path(), &ScanOptions::default()).unwrap();
        diff(None, &scan, DiffMode::Full)
    }

    #[test]
    fn test_roundtrip_matches_tree() {
        let dir = sample_tree();
        let scan = scan_tree(dir.path(), &ScanOptions::default()).unwrap();
        let changeset = diff(None, &scan, DiffMode::Incremental);

        let restored = unpack(&pack(&changeset).unwrap()).unwrap();
        assert_eq!(restored.entries().len(), scan.len());
        for entry in restored.entries() {
            assert_eq!(entry.change, Change::Added);
            assert_eq!(&entry.record, &scan.get(&entry.record.path).unwrap().record);
        }
        let readme = restored
            .entries()
            .iter()
            .find(|e| e.record.path == "docs/readme.md")
            .unwrap();
        assert_eq!(readme.content.as_deref(), Some(&b"# cairn\n"[..]));
        assert_eq!(restored.manifest(), changeset.manifest());
    }

    #[test]
    fn test_pack_is_deterministic() {
        let changeset = sample_changeset();
        assert_eq!(pack(&changeset).unwrap(), pack(&changeset).unwrap());
    }

    #[test]
    fn test_every_truncation_is_a_format_fault() {
        let data = pack(&sample_changeset()).unwrap();
        for len in 0..data.len() {
            let err = unpack(&data[..len]).unwrap_err();
            assert!(matches!(err, Error::Format { .. }), "len {}: {:?}", len, err);
        }
    }

    #[test]
    fn test_trailing_data_is_rejected() {
        let mut data = pack(&sample_changeset()).unwrap();
        data.push(0);
        assert!(matches!(unpack(&data).unwrap_err(), Error::Format { .. }));
    }

    #[test]
    fn test_body_fingerprint_mismatch() {
        let changeset = sample_changeset();
        let mut data = pack(&changeset).unwrap();
        let pos = data.windows(5).position(|w| w == b"hello").unwrap();
        data[pos] = b'j';

        let err = unpack(&data).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(err.to_string().contains("a.txt"));
    }

    #[test]
    fn test_unknown_version() {
        let mut data = pack(&sample_changeset()).unwrap();
        data[4] = 9;
        let err = unpack(&data).unwrap_err();
        assert!(err.to_string().contains("unsupported format version 9"));
    }

    #[test]
    fn test_writer_rejects_unsorted_and_unsafe_entries() {
        let header = |path: &str| EntryHeader {
            path: path.to_string(),
            change: Change::Added,
            kind: FileKind::Directory,
            mode: 0o755,
            size: 0,
            mtime: 0,
            fingerprint: None,
            link_target: None,
        };

        let mut writer = ArchiveWriter::new(Vec::new()).unwrap();
        writer.append(&header("b"), &[]).unwrap();
        assert!(writer.append(&header("a"), &[]).is_err());
        assert!(writer.append(&header("../etc"), &[]).is_err());
        assert!(writer.append(&header("c"), b"body").is_err());
    }

    #[test]
    fn test_section_limits_match_the_reader() {
        assert_eq!(section_len(16, MAX_HEADER_LEN), Ok(16));
        assert_eq!(section_len(MAX_MANIFEST_LEN as usize, MAX_MANIFEST_LEN), Ok(MAX_MANIFEST_LEN));
        assert!(section_len(MAX_MANIFEST_LEN as usize + 1, MAX_MANIFEST_LEN).is_err());
        #[cfg(target_pointer_width = "64")]
        assert!(section_len(u32::MAX as usize + 5, u32::MAX).is_err());
    }

    #[test]
    fn test_writer_rejects_oversized_header() {
        let header = EntryHeader {
            path: "a".repeat(MAX_HEADER_LEN as usize + 1),
            change: Change::Added,
            kind: FileKind::Directory,
            mode: 0o755,
            size: 0,
            mtime: 0,
            fingerprint: None,
            link_target: None,
        };
        let mut writer = ArchiveWriter::new(Vec::new()).unwrap();
        let err = writer.append(&header, &[]).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(err.to_string().contains("exceeds the limit"));

        // Nothing was written for the refused entry, so the archive still decodes.
        let data = writer.finish(Some(&Manifest::new())).unwrap();
        assert!(unpack(&data).unwrap().entries().is_empty());
    }

    #[test]
    fn test_streaming_reader_without_manifest() {
        let mut writer = ArchiveWriter::new(Vec::new()).unwrap();
        let body = b"streamed";
        let header = EntryHeader {
            path: "s.bin".to_string(),
            change: Change::Modified,
            kind: FileKind::File,
            mode: 0o600,
            size: body.len() as u64,
            mtime: 42,
            fingerprint: Some(ContentHash::from_data(body)),
            link_target: None,
        };
        writer.append(&header, body).unwrap();
        let data = writer.finish(None).unwrap();

        let mut reader = ArchiveReader::new(&data[..]).unwrap();
        assert_eq!(reader.version(), FormatVersion::V1);
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.header, header);
        assert_eq!(entry.body.as_deref(), Some(&body[..]));
        assert!(reader.next_entry().unwrap().is_none());
        assert!(reader.manifest().is_none());

        // The manifest section is mandatory for whole-changeset decoding.
        assert!(matches!(unpack(&data).unwrap_err(), Error::Format { .. }));
    }
}
