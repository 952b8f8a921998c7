use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact event, or `None` at end of log or at the first damaged frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
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
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only event log backing the booking store and the rollup table.
///
/// A crash mid-write leaves a short or mismatching trailing frame; replay
/// stops there and keeps everything before it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event; durable only after [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted log over the live one and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
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

    /// Every intact event in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, Utc};
    use ulid::Ulid;

    use crate::model::{ActivityCategory, Booking, MonthlyEffortAggregate, RollupKey, Window};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotledger_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn booking(subject_id: Ulid, day: u32) -> Booking {
        let date = NaiveDate::from_ymd_opt(2025, 7, day).unwrap();
        let now = Utc::now();
        Booking {
            id: Ulid::new(),
            subject_id,
            window: Window::single_day(
                date,
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            ),
            activity_id: Ulid::new(),
            activity_name: Some("Workshop".into()),
            description: "quarterly workshop".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn created(subject_id: Ulid, day: u32) -> Event {
        Event::BookingCreated {
            booking: booking(subject_id, day),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let b = booking(Ulid::new(), 15);
        let key = RollupKey::for_booking(&b);
        let mut row = MonthlyEffortAggregate::new(key, ActivityCategory::Blended, Utc::now());
        row.accumulate(1.5, Utc::now());

        let events = vec![
            Event::BookingCreated { booking: b.clone() },
            Event::AggregateUpserted { aggregate: row },
            Event::BookingDeleted {
                id: b.id,
                subject_id: b.subject_id,
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
    fn truncated_tail_is_dropped() {
        let path = tmp_path("truncated_tail.wal");
        let event = created(Ulid::new(), 15);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_checksum.wal");
        let good = created(Ulid::new(), 15);
        let bad = Event::BookingDeleted {
            id: Ulid::new(),
            subject_id: Ulid::new(),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let subject = Ulid::new();
        let keep = created(subject, 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            for day in 2..20 {
                let b = booking(subject, day);
                wal.append(&Event::BookingCreated { booking: b.clone() }).unwrap();
                wal.append(&Event::BookingDeleted {
                    id: b.id,
                    subject_id: subject,
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let after_compact = created(subject, 21);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&after_compact).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, after_compact]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let subject = Ulid::new();
        let events: Vec<Event> = (1..=5).map(|day| created(subject, day)).collect();
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
