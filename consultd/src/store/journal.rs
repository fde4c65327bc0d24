//! Append-only JSON-lines journal on local disk.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Store, StoreError};

/// One JSON document per line, fsynced per append.
///
/// A failed append truncates the file back to its previous length, so a
/// torn record can only ever be the final line, which replay skips.
pub struct JournalStore<R> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<fn() -> R>,
}

impl<R> JournalStore<R> {
    /// Open or create the journal at a specific path.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        debug!(path = %path.display(), "opened journal");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            _record: PhantomData,
        })
    }
}

impl<R> Store<R> for JournalStore<R>
where
    R: Serialize + DeserializeOwned,
{
    fn append(&self, record: &R) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let before = file.seek(SeekFrom::End(0))?;
        let written = file.write_all(&line).and_then(|()| file.sync_data());
        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "journal append failed, rolling back");
            file.set_len(before)?;
            return Err(e.into());
        }
        Ok(())
    }

    fn replay(&self) -> Result<Vec<R>, StoreError> {
        let file = File::open(&self.path)?;
        let lines = BufReader::new(file)
            .lines()
            .collect::<Result<Vec<_>, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) if index == last => {
                    warn!(path = %self.path.display(), error = %e, "skipping torn trailing record");
                }
                Err(e) => {
                    return Err(StoreError::Corrupt {
                        line: index + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        n: u32,
    }

    #[test]
    fn append_then_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.jsonl");

        let store = JournalStore::<Record>::open_at(&path).unwrap();
        store.append(&Record { n: 1 }).unwrap();
        store.append(&Record { n: 2 }).unwrap();
        drop(store);

        let reopened = JournalStore::<Record>::open_at(&path).unwrap();
        assert_eq!(
            reopened.replay().unwrap(),
            vec![Record { n: 1 }, Record { n: 2 }]
        );
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "{\"n\":1}\n{\"n\":").unwrap();

        let store = JournalStore::<Record>::open_at(&path).unwrap();
        assert_eq!(store.replay().unwrap(), vec![Record { n: 1 }]);
    }

    #[test]
    fn corruption_before_the_tail_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "garbage\n{\"n\":1}\n").unwrap();

        let store = JournalStore::<Record>::open_at(&path).unwrap();
        assert!(matches!(
            store.replay(),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }
}
