use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one committed transaction as `[len][payload][crc]`.
fn encode_record(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record, or `None` at the end of the log or at the first
/// torn or corrupt record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Vec<Event>>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

/// Storage under the log: `File` in production.
pub trait LogFile: Write {
    fn sync(&mut self) -> io::Result<()>;
    /// Cut the file back to `len` bytes and make that durable.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }
}

/// Append-only write-ahead log of one organization.
///
/// Each record is `[u32 le: payload len][bincode Vec<Event>][u32 le: crc32 of payload]`
/// and carries every event of one committed transaction, so replay applies a
/// transaction whole or not at all. A crash mid-write leaves a torn tail that
/// replay stops at.
pub struct Wal<F: LogFile = File> {
    file: F,
    path: PathBuf,
    /// Length of the durable prefix. A failed batch is cut back to it.
    committed_len: u64,
    /// Set when a failed batch could not be cut back; every later append fails.
    poisoned: bool,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = Self::open_append(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self::with_file(file, path, committed_len))
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn staging_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// First compaction phase: write the snapshot events, one per record,
    /// to a staging file next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::staging_path(path))?);
        for event in events {
            encode_record(&mut writer, std::slice::from_ref(event))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Second compaction phase: rename the staging file over the log and
    /// continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::staging_path(&self.path), &self.path)?;
        let file = Self::open_append(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.poisoned = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// All events of all intact records, in commit order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        while let Some(batch) = read_record(&mut reader)? {
            events.extend(batch);
        }
        Ok(events)
    }
}

impl<F: LogFile> Wal<F> {
    pub(crate) fn with_file(file: F, path: &Path, committed_len: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            committed_len,
            poisoned: false,
            appends_since_compact: 0,
        }
    }

    /// Append one transaction and make it durable.
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_batch([events])
    }

    /// Append several transactions with a single fsync, all or nothing: on
    /// any error the file is cut back to where the batch began, so none of
    /// the batch replays after a restart.
    pub fn append_batch<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a [Event]>,
    ) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL unusable after a failed rollback"));
        }
        let mut buf = Vec::new();
        let mut count = 0;
        for events in records {
            encode_record(&mut buf, events)?;
            count += 1;
        }

        let written = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        if let Err(e) = written {
            if let Err(cut) = self.file.truncate(self.committed_len) {
                tracing::error!(
                    "WAL {}: could not discard failed batch: {cut}",
                    self.path.display()
                );
                self.poisoned = true;
            }
            return Err(e);
        }

        self.committed_len += buf.len() as u64;
        self.appends_since_compact += count;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records (transactions) appended since open or the last compaction.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, Schedule, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn resource(id: Ulid, capacity: Option<u32>) -> Event {
        Event::ResourceCreated {
            id,
            name: Some("Room".into()),
            description: None,
            capacity,
            schedule: Schedule::default(),
        }
    }

    fn booking(resource_id: Ulid, start: i64, end: i64) -> Event {
        Event::BookingCreated {
            id: Ulid::new(),
            resource_id,
            span: Span::new(start, end),
            status: "confirmed".into(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let events = vec![resource(rid, Some(1)), booking(rid, 1000, 2000)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(std::slice::from_ref(e)).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn multi_event_record_replays_in_order() {
        let path = tmp_path("multi_event.wal");
        let _ = fs::remove_file(&path);

        let (a, b) = (Ulid::new(), Ulid::new());
        let txn = vec![
            resource(a, None),
            resource(b, None),
            Event::UnavailabilityCreated {
                id: Ulid::new(),
                resource_id: a,
                span: Span::new(0, 10),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&txn).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }

        assert_eq!(Wal::replay(&path).unwrap(), txn);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = resource(Ulid::new(), Some(2));

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(std::slice::from_ref(&event)).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn truncated_transaction_is_dropped_whole() {
        let path = tmp_path("truncated_txn.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let first = vec![resource(rid, Some(1))];
        let second = vec![booking(rid, 0, 10), booking(rid, 20, 30)];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        // Chop the last few bytes off: the CRC of the second record is gone.
        let len = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), first);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let events = vec![Event::ResourceDeleted { id: Ulid::new() }];

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&events).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();

        // Churn: bookings created and deleted again
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&[resource(rid, Some(1))]).unwrap();
            for _ in 0..10 {
                let created = booking(rid, 0, 500);
                let Event::BookingCreated { id, .. } = created else {
                    unreachable!()
                };
                wal.append(&[created]).unwrap();
                wal.append(&[Event::BookingDeleted { id, resource_id: rid }])
                    .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Compact: final state is just the resource
        let compacted_events = vec![resource(rid, Some(1))];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted_events).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, compacted_events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let compacted = vec![resource(rid, None)];
        let new_event = Event::UnavailabilityCreated {
            id: Ulid::new(),
            resource_id: rid,
            span: Span::new(1000, 2000),
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&compacted).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(std::slice::from_ref(&new_event)).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![compacted[0].clone(), new_event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn batch_appends_with_one_sync() {
        let path = tmp_path("batch_append.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (0..5).map(|_| resource(Ulid::new(), Some(3))).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_batch(events.iter().map(std::slice::from_ref)).unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    /// Accepts `budget` bytes, then fails every write.
    struct ShortFile {
        inner: File,
        budget: usize,
    }

    impl Write for ShortFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = self.inner.write(&buf[..buf.len().min(self.budget)])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl LogFile for ShortFile {
        fn sync(&mut self) -> io::Result<()> {
            self.inner.sync_all()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.inner.truncate(len)
        }
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let path = tmp_path("failed_batch.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let durable = vec![resource(rid, Some(1))];
        Wal::open(&path).unwrap().append(&durable).unwrap();
        let committed_len = fs::metadata(&path).unwrap().len();

        // Room for the first transaction of the batch and part of the second.
        let first = vec![booking(rid, 0, 10)];
        let second = vec![booking(rid, 20, 30)];
        let mut first_len = Vec::new();
        encode_record(&mut first_len, &first).unwrap();
        let file = ShortFile {
            inner: OpenOptions::new().append(true).open(&path).unwrap(),
            budget: first_len.len() + 5,
        };

        let mut wal = Wal::with_file(file, &path, committed_len);
        assert!(wal.append_batch([first.as_slice(), second.as_slice()]).is_err());
        assert_eq!(wal.appends_since_compact(), 0);
        drop(wal);

        assert_eq!(fs::metadata(&path).unwrap().len(), committed_len);
        assert_eq!(Wal::replay(&path).unwrap(), durable);

        // The log stays usable after the failed batch.
        let later = vec![booking(rid, 40, 50)];
        Wal::open(&path).unwrap().append(&later).unwrap();
        let mut expected = durable;
        expected.extend(later);
        assert_eq!(Wal::replay(&path).unwrap(), expected);

        let _ = fs::remove_file(&path);
    }
}
