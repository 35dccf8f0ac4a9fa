use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::remote_file::{FileSystem, OpenMode, RemoteFile};
use crate::util::{self, HASH_LEN};

/// Marker at the start of every frame. The high bit and the CR/LF/EOF
/// bytes catch files that went through text-mode or 7-bit mangling.
const FRAME_MAGIC: [u8; 8] = [0x89, b'C', b'B', b'F', 0x0d, 0x0a, 0x1a, 0x0a];

/// Bytes of overhead added by [`pack_blob`] around a payload.
const FRAME_OVERHEAD: usize = FRAME_MAGIC.len() + 8 + HASH_LEN;

/// Frames `data` so the result can be appended to a shard file and later
/// split back out: magic, u64 LE payload length, payload, payload hash.
///
/// Concatenations of packed frames are self-delimiting; readers can
/// recover every complete frame from any append-consistent prefix.
pub fn pack_blob(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(util::hash(data).as_bytes());
    out
}

/// A complete frame recovered from a packed byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob<'a> {
    pub data: &'a [u8],
    pub hash: String,
}

/// Iterates the complete frames of a packed byte stream.
///
/// Stops -- without yielding anything further -- at the first truncated
/// frame, magic mismatch, or hash mismatch. Partial trailing frames are
/// the normal case when reading a peer shard mid-append, so a clean stop
/// is the contract, not an error.
pub struct BlobFrameIter<'a> {
    buf: &'a [u8],
    pos: usize,
    num_valid_frames: usize,
    stopped: bool,
}

impl<'a> BlobFrameIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            num_valid_frames: 0,
            stopped: false,
        }
    }

    /// Number of complete, valid frames yielded so far.
    pub fn num_valid_frames(&self) -> usize {
        self.num_valid_frames
    }

    fn try_next(&mut self) -> Option<Blob<'a>> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        if rest.is_empty() {
            return None;
        }
        if rest.len() < FRAME_MAGIC.len() + 8 || rest[..FRAME_MAGIC.len()] != FRAME_MAGIC {
            return None;
        }
        let len_bytes: [u8; 8] = rest[FRAME_MAGIC.len()..FRAME_MAGIC.len() + 8]
            .try_into()
            .unwrap();
        let payload_len = u64::from_le_bytes(len_bytes) as usize;
        // Validate the length against what is actually present before
        // touching the payload.
        let frame_len = FRAME_OVERHEAD.checked_add(payload_len)?;
        if rest.len() < frame_len {
            return None;
        }
        let payload = &rest[FRAME_MAGIC.len() + 8..FRAME_MAGIC.len() + 8 + payload_len];
        let stored_hash = &rest[frame_len - HASH_LEN..frame_len];
        let hash = util::hash(payload);
        if stored_hash != hash.as_bytes() {
            return None;
        }
        self.pos += frame_len;
        self.num_valid_frames += 1;
        Some(Blob {
            data: payload,
            hash,
        })
    }
}

impl<'a> Iterator for BlobFrameIter<'a> {
    type Item = Blob<'a>;

    fn next(&mut self) -> Option<Blob<'a>> {
        if self.stopped {
            return None;
        }
        match self.try_next() {
            Some(blob) => Some(blob),
            None => {
                self.stopped = true;
                None
            }
        }
    }
}

/// Unpacks a concatenation of frames into the original blobs and their
/// hashes. Stops at the first incomplete or corrupt frame.
pub fn unpack_blobs(buf: &[u8]) -> (Vec<Vec<u8>>, Vec<String>) {
    let mut blobs = Vec::new();
    let mut hashes = Vec::new();
    for blob in BlobFrameIter::new(buf) {
        blobs.push(blob.data.to_vec());
        hashes.push(blob.hash);
    }
    (blobs, hashes)
}

/// Appends packed frames to a shard file through the filesystem seam.
///
/// One appender per file, one writer per shard; peers only ever read.
pub struct BlobFileAppender {
    file: Box<dyn RemoteFile>,
}

impl BlobFileAppender {
    pub fn open(fs: &Arc<dyn FileSystem>, path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: fs.open(path, OpenMode::Append)?,
        })
    }

    /// Packs `data` into a frame and appends it. A failure here is fatal
    /// to the shard: callers propagate it.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.append(&pack_blob(data))
    }

    pub fn close(self) -> io::Result<()> {
        self.file.close()
    }
}

/// Reads an entire shard file and returns its raw bytes. A missing file
/// yields an empty buffer: a peer that has not written yet looks the same
/// as a peer with an empty file.
pub fn read_blob_file(fs: &Arc<dyn FileSystem>, path: &Path) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    match fs.open(path, OpenMode::Read) {
        Ok(mut file) => {
            file.read_to_end(&mut buf)?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    Ok(buf)
}
