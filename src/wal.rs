//! Room document log.
//!
//! Entries are `[len: u32 LE][bincode Event][crc32 LE]`. The log is valid up to
//! its first entry that is short or fails its checksum; everything after that
//! point is dropped when the log is opened. Writes always land at the end of
//! the valid prefix, so bytes left behind by a failed or torn write are
//! overwritten by the next commit instead of hiding it from replay.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const HEADER_LEN: usize = 4;
const CRC_LEN: usize = 4;

fn encode_entry(buf: &mut Vec<u8>, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL entry over 4 GiB"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

/// One entry from the front of `buf` and the number of bytes it used.
fn decode_entry(buf: &[u8]) -> Option<(Event, usize)> {
    let len = u32::from_le_bytes(buf.get(..HEADER_LEN)?.try_into().ok()?) as usize;
    let payload_end = HEADER_LEN.checked_add(len)?;
    let entry_end = payload_end.checked_add(CRC_LEN)?;
    let payload = buf.get(HEADER_LEN..payload_end)?;
    let crc = u32::from_le_bytes(buf.get(payload_end..entry_end)?.try_into().ok()?);
    if crc != crc32fast::hash(payload) {
        return None;
    }
    let event = bincode::deserialize(payload).ok()?;
    Some((event, entry_end))
}

/// Every event in the valid prefix of `bytes`, plus that prefix's length.
fn decode_prefix(bytes: &[u8]) -> (Vec<Event>, u64) {
    let mut events = Vec::new();
    let mut pos = 0;
    while let Some((event, used)) = decode_entry(&bytes[pos..]) {
        events.push(event);
        pos += used;
    }
    (events, pos as u64)
}

fn read_if_exists(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

pub struct Wal {
    file: File,
    path: PathBuf,
    /// End of the last committed entry. Nothing past it is ever replayed.
    committed_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, cut off any torn tail and return the
    /// events it holds.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let bytes = read_if_exists(path)?;
        let (events, committed_len) = decode_prefix(&bytes);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if committed_len < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                discarded = bytes.len() as u64 - committed_len,
                "truncating torn WAL tail"
            );
            file.set_len(committed_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            committed_len,
            appends_since_compact: events.len() as u64,
        };
        Ok((wal, events))
    }

    /// Read-only replay. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(decode_prefix(&read_if_exists(path)?).0)
    }

    /// Write `events` as one batch with a single sync. Either the whole batch is
    /// committed or the log is left as it was.
    pub fn commit<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        let mut buf = Vec::new();
        let mut count = 0;
        for event in events {
            encode_entry(&mut buf, event)?;
            count += 1;
        }
        if count == 0 {
            return Ok(());
        }

        let end = self.committed_len + buf.len() as u64;
        if let Err(e) = self.write_batch(&buf, end) {
            if let Err(trunc) = self.file.set_len(self.committed_len) {
                warn!("cannot drop partial WAL batch: {trunc}");
            }
            return Err(e);
        }
        self.committed_len = end;
        self.appends_since_compact += count;
        Ok(())
    }

    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.commit(std::iter::once(event))
    }

    fn write_batch(&mut self, buf: &[u8], end: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.committed_len))?;
        self.file.write_all(buf)?;
        // Drop stale bytes past the batch, e.g. from an earlier failed write.
        self.file.set_len(end)?;
        self.file.sync_data()
    }

    /// Replace the log with exactly `events`, atomically via rename.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let mut buf = Vec::new();
        for event in events {
            encode_entry(&mut buf, event)?;
        }
        let tmp_path = self.path.with_extension("wal.compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        // Make the rename durable where the platform allows syncing a directory.
        if let Some(dir) = self.path.parent().and_then(|d| File::open(d).ok()) {
            let _ = dir.sync_all();
        }

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.committed_len = buf.len() as u64;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, Room, RoomType, TimeRange};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomdesk_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn saved(name: &str) -> Event {
        Event::RoomSaved {
            room: Room::new(Ulid::new(), name.into(), RoomType::Study),
        }
    }

    fn scribble(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn batch_commit_reopens_with_same_events() {
        let path = tmp_path("batch.wal");
        let events = vec![saved("A"), saved("B"), Event::RoomDeleted { id: Ulid::new() }];
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert!(replayed.is_empty());
            wal.commit(&events).unwrap();
            assert_eq!(wal.appends_since_compact(), 3);
        }

        let (wal, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events);
        // Replayed entries count toward the next compaction.
        assert_eq!(wal.appends_since_compact(), 3);
    }

    #[test]
    fn missing_file_replays_empty() {
        assert!(Wal::replay(&tmp_path("missing.wal")).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let path = tmp_path("torn_open.wal");
        let first = saved("A");
        Wal::open(&path).unwrap().0.append(&first).unwrap();
        let clean_len = fs::metadata(&path).unwrap().len();
        scribble(&path, &[9, 0, 0, 0, 1, 2]);

        let (mut wal, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);

        let second = saved("B");
        wal.append(&second).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn append_after_garbage_behind_open_handle_is_replayed() {
        let path = tmp_path("torn_live.wal");
        let (mut wal, _) = Wal::open(&path).unwrap();
        let first = saved("A");
        wal.append(&first).unwrap();
        scribble(&path, &[9, 0, 0, 0, 1, 2]);

        let second = saved("B");
        wal.append(&second).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn failed_commit_leaves_log_unchanged() {
        let path = tmp_path("failed_commit.wal");
        let (mut wal, _) = Wal::open(&path).unwrap();
        let first = saved("A");
        wal.append(&first).unwrap();

        // A read-only handle makes every write fail.
        wal.file = File::open(&path).unwrap();
        assert!(wal.commit(&[saved("lost-1"), saved("lost-2")]).is_err());
        assert_eq!(wal.appends_since_compact(), 1);

        wal.file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let third = saved("C");
        wal.append(&third).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, third]);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = saved("A");
        Wal::open(&path).unwrap().0.append(&good).unwrap();

        let payload = bincode::serialize(&Event::RoomDeleted { id: Ulid::new() }).unwrap();
        let mut entry = (payload.len() as u32).to_le_bytes().to_vec();
        entry.extend_from_slice(&payload);
        entry.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        scribble(&path, &entry);
        scribble(&path, &{
            let mut buf = Vec::new();
            encode_entry(&mut buf, &saved("after")).unwrap();
            buf
        });

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compaction_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let (mut wal, _) = Wal::open(&path).unwrap();
        let mut room = Room::new(Ulid::new(), "Study Room".into(), RoomType::Study);
        for _ in 0..10 {
            room.bookings.push(Booking {
                id: Ulid::new(),
                slot: TimeRange::parse("07-01", "09:00", "10:00").unwrap(),
                user_id: "u1".into(),
                user_name: "Ann".into(),
                confirmed: true,
            });
            wal.append(&Event::RoomSaved { room: room.clone() }).unwrap();
            room.bookings.clear();
            wal.append(&Event::RoomSaved { room: room.clone() }).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = Event::RoomSaved { room };
        wal.compact(std::slice::from_ref(&snapshot)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = Event::RoomDeleted { id: Ulid::new() };
        wal.append(&later).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, later]);
    }
}
