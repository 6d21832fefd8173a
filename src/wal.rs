use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// Bytes around each payload: length prefix and checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Larger length prefixes are treated as corruption.
const MAX_EVENT_LEN: usize = 64 << 20;

fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_EVENT_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large"));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` marks the end of the valid prefix: clean EOF, a torn
/// frame, a checksum mismatch, or an undecodable payload.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_frame_part(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_EVENT_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_frame_part(reader, &mut payload)? || !read_frame_part(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, len as u64 + FRAME_OVERHEAD)))
}

fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append one framed event to `frames`. On error `frames` is left as it was.
pub fn encode_frame(frames: &mut Vec<u8>, event: &Event) -> io::Result<()> {
    let start = frames.len();
    encode_event(frames, event).inspect_err(|_| frames.truncate(start))
}

/// Append-only booking ledger.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little-endian. Opening the
/// ledger replays it and cuts off anything after the last intact record, so later
/// appends never land behind garbage. A failed commit is cut off the same way before
/// it returns.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Bytes covered by committed frames.
    committed_len: u64,
    /// Set when a failed commit could not be rolled back; every later commit fails.
    poisoned: bool,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_writes_after: Option<usize>,
}

impl Wal {
    /// Open (or create) the ledger at `path` and return it with every intact event.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::scan(path)?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                path = %path.display(),
                discarded = on_disk - valid_len,
                "ledger tail is torn or corrupt; truncating"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let wal = Self {
            file,
            path: path.to_path_buf(),
            committed_len: valid_len,
            poisoned: false,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_writes_after: None,
        };
        Ok((wal, events))
    }

    /// Intact events and the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;
        while let Some((event, size)) = decode_event(&mut reader)? {
            events.push(event);
            valid_len += size;
        }
        Ok((events, valid_len))
    }

    /// Read every intact event without opening for writes.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Durably append `count` events already framed by [`encode_frame`]. Either all of
    /// them are committed or, on error, none of them stays in the file.
    pub fn commit(&mut self, frames: &[u8], count: u64) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("ledger unusable after failed rollback"));
        }
        if let Err(e) = self.write_frames(frames) {
            self.rollback();
            return Err(e);
        }
        self.committed_len += frames.len() as u64;
        self.appends_since_compact += count;
        Ok(())
    }

    fn write_frames(&mut self, frames: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_writes_after.take() {
            self.file.write_all(&frames[..limit.min(frames.len())])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(frames)?;
        self.file.sync_all()
    }

    /// Cut the file back to its committed length.
    fn rollback(&mut self) {
        let result = self
            .file
            .set_len(self.committed_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = result {
            error!(path = %self.path.display(), "ledger rollback failed: {e}");
            self.poisoned = true;
        }
    }

    /// Make the next commit write only `bytes` of its frames and then fail.
    #[cfg(test)]
    pub fn fail_writes_after(&mut self, bytes: usize) {
        self.fail_writes_after = Some(bytes);
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        let mut frames = Vec::new();
        encode_frame(&mut frames, event)?;
        self.commit(&frames, 1)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("ledger.tmp")
    }

    /// Write `events` to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the ledger and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.poisoned = false;
        self.appends_since_compact = 0;
        Ok(())
    }
}
