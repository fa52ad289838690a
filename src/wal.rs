use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Bytes of framing around each payload: the length prefix and the CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format. Returns the frame size.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(u64::from(len) + FRAME_OVERHEAD)
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the log ended (possibly mid-frame).
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next intact frame and its size. `None` at end of log or at the first damaged frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);

    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, u64::from(len) + FRAME_OVERHEAD)))
}

/// Intact events of the log at `path`, and the byte length they span.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0;
    while let Some((event, size)) = read_frame(&mut reader)? {
        events.push(event);
        intact_len += size;
    }
    Ok((events, intact_len))
}

/// Append-only Write-Ahead Log holding every committed lot and reservation event.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt tail (crash mid-write) is cut off when the log is opened,
///   so new frames always follow the last intact one.
/// - A batch is durable only once `flush_sync` succeeds; `rollback` removes a failed one.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Bytes known to be intact and synced.
    committed_len: u64,
    pending_len: u64,
    pending_appends: u64,
    appends_since_compact: u64,
    /// Make the next `flush_sync` fail after its bytes reach the file.
    #[cfg(test)]
    pub(crate) fail_next_sync: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, cutting off any damaged tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Open the WAL and return the intact events it already holds.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact_len) = read_log(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact_len {
            warn!(
                "{}: discarding {} damaged bytes after offset {intact_len}",
                path.display(),
                on_disk - intact_len
            );
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len: intact_len,
            pending_len: 0,
            pending_appends: 0,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_next_sync: false,
        };
        Ok((wal, events))
    }

    /// Append and fsync a single event. Production code batches with
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Call `flush_sync()` to commit the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let size = encode_event(&mut self.writer, event)?;
        self.pending_len += size;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, including
    /// bytes that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let failed = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        // into_parts hands back the file without writing the buffered bytes.
        let (file, _unwritten) = failed.into_parts();
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.appends_since_compact -= self.pending_appends;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.pending_len = 0;
        self.pending_appends = 0;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all intact events in order.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Money;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn lot_created(id: Ulid, capacity: u32) -> Event {
        Event::LotCreated {
            id,
            name: "Riverside".into(),
            address: "2 Quay Rd".into(),
            postal_code: "40001".into(),
            unit_price: Money::from_cents(1500),
            spots: (1..=capacity).collect(),
            next_spot: capacity + 1,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let lot = Ulid::new();
        let events = vec![
            lot_created(lot, 3),
            Event::ReservationOpened {
                id: Ulid::new(),
                lot_id: lot,
                spot: 1,
                requester: "alice".into(),
                start: 1_000,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_truncated_tail() {
        let path = tmp_path("truncation.wal");
        let event = lot_created(Ulid::new(), 2);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn open_cuts_torn_tail_before_appending() {
        let path = tmp_path("torn_then_append.wal");
        let first = lot_created(Ulid::new(), 2);
        let second = lot_created(Ulid::new(), 3);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        {
            let mut wal = Wal::open(&path).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unsynced_batch() {
        let path = tmp_path("rollback.wal");
        let kept = lot_created(Ulid::new(), 1);
        let failed = lot_created(Ulid::new(), 2);
        let after = lot_created(Ulid::new(), 3);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();

            // Half a batch can reach the file before the failure is noticed.
            wal.append_buffered(&failed).unwrap();
            wal.writer.flush().unwrap();
            assert_eq!(Wal::replay(&path).unwrap().len(), 2);

            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
            wal.append(&after).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_drops_buffered_bytes() {
        let path = tmp_path("rollback_buffered.wal");
        let kept = lot_created(Ulid::new(), 1);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.append_buffered(&lot_created(Ulid::new(), 2)).unwrap();
            wal.rollback().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = lot_created(Ulid::new(), 1);
        let bad = Event::LotDeleted { id: Ulid::new() };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_log_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let lot = Ulid::new();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&lot_created(lot, 2)).unwrap();
            for i in 0..20 {
                let capacity = if i % 2 == 0 { 3 } else { 2 };
                wal.append(&Event::LotResized {
                    id: lot,
                    capacity,
                    added: if capacity == 3 { vec![3 + i] } else { vec![] },
                    removed: if capacity == 2 { vec![2 + i] } else { vec![] },
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![lot_created(lot, 2)];
        let later = Event::LotDeleted { id: lot };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_counted_until_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|_| lot_created(Ulid::new(), 1)).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
