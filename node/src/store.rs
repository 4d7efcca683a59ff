use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use decay_core::{
    config::{Naming, StorageConfig},
    naming::{counter_artifact_name, timestamp_artifact_name, ArtifactName, NameTooLong},
    CalendarTimestamp,
};

use crate::{clock, record::Record};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage at {0:?} is not mounted")]
    Unavailable(PathBuf),
    #[error("failed to open {name} for writing: {source}")]
    Open {
        name: ArtifactName,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {name}: {source}")]
    Write {
        name: ArtifactName,
        #[source]
        source: io::Error,
    },
    #[error("failed to open {name} for reading: {source}")]
    Read {
        name: ArtifactName,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Name(#[from] NameTooLong),
    #[error("timestamp naming needs a resolved time")]
    MissingTimestamp,
}

/// A persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: ArtifactName,
    pub byte_length: u64,
    pub path: PathBuf,
}

/// Non-volatile storage for records, rooted at a directory.
///
/// The file counter is process local and starts at zero, so a restarted
/// node with counter naming writes over the files of the previous run.
pub struct DurableStore {
    root: PathBuf,
    naming: Naming,
    extension: String,
    counter_prefix: String,
    counter: u32,
}

impl DurableStore {
    pub fn mount(config: &StorageConfig) -> Self {
        match std::fs::create_dir_all(&config.root) {
            Ok(()) => log::info!("Storage mounted at {:?}", config.root),
            Err(e) => log::error!("Storage initialization failed at {:?}: {e}", config.root),
        }

        Self {
            root: config.root.clone(),
            naming: config.naming,
            extension: config.extension.clone(),
            counter_prefix: config.counter_prefix.clone(),
            counter: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn naming(&self) -> Naming {
        self.naming
    }

    pub fn needs_timestamp(&self) -> bool {
        self.naming == Naming::Timestamp
    }

    fn next_name(
        &mut self,
        timestamp: Option<&CalendarTimestamp>,
    ) -> Result<ArtifactName, StoreError> {
        match self.naming {
            Naming::Timestamp => {
                let timestamp = timestamp.ok_or(StoreError::MissingTimestamp)?;
                Ok(timestamp_artifact_name(timestamp, &self.extension)?)
            }
            Naming::Counter => {
                let counter = self.counter;
                self.counter = self.counter.wrapping_add(1);
                Ok(counter_artifact_name(
                    &self.counter_prefix,
                    counter,
                    &self.extension,
                )?)
            }
        }
    }

    /// Writes the record as a new artifact, replacing any file of the same
    /// name.
    pub fn persist(
        &mut self,
        record: &Record,
        timestamp: Option<&CalendarTimestamp>,
    ) -> Result<Artifact, StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::Unavailable(self.root.clone()));
        }

        let name = self.next_name(timestamp)?;
        log::debug!("Generated filename: {name}");
        let path = self.root.join(name.as_str());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| StoreError::Open {
                name: name.clone(),
                source,
            })?;

        let write = |file: &mut File| -> io::Result<()> {
            file.write_all(record.as_bytes())?;
            if let (Naming::Timestamp, Some(timestamp)) = (self.naming, timestamp) {
                match clock::modified_time(timestamp) {
                    Ok(modified) => file.set_modified(modified)?,
                    Err(e) => log::warn!("Not stamping {name}: {e}"),
                }
            }
            file.sync_all()
        };

        write(&mut file).map_err(|source| StoreError::Write {
            name: name.clone(),
            source,
        })?;

        log::info!("Data saved to storage as {name}");

        Ok(Artifact {
            name,
            byte_length: record.len() as u64,
            path,
        })
    }

    /// Reopens an artifact and reports its size on storage.
    pub fn open(&self, artifact: &Artifact) -> Result<(File, u64), StoreError> {
        let read_error = |source| StoreError::Read {
            name: artifact.name.clone(),
            source,
        };
        let file = File::open(&artifact.path).map_err(read_error)?;
        let len = file.metadata().map_err(read_error)?.len();
        Ok((file, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decay_core::{record::RecordLayout, AdcResolution, CaptureBuffer, Sample, VoltageScale};

    fn record(samples: u32) -> Record {
        let mut buffer = CaptureBuffer::new(0);
        for i in 0..samples {
            buffer
                .push(Sample {
                    value: 4095 - i as u16,
                    elapsed_us: i * 5,
                })
                .unwrap();
        }
        Record::serialize(
            &buffer,
            &VoltageScale::new(3.3, AdcResolution::BITS_12),
            RecordLayout::Csv,
        )
    }

    fn storage(root: &Path, naming: Naming) -> StorageConfig {
        StorageConfig {
            root: root.to_path_buf(),
            naming,
            ..Default::default()
        }
    }

    const TIMESTAMP: CalendarTimestamp = CalendarTimestamp {
        year: 2024,
        month: 11,
        day: 2,
        hour: 14,
        minute: 30,
        second: 12,
    };

    #[test]
    fn timestamp_naming_writes_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DurableStore::mount(&storage(dir.path(), Naming::Timestamp));
        let record = record(499);

        let artifact = store.persist(&record, Some(&TIMESTAMP)).unwrap();

        assert_eq!(artifact.name, "11021430.csv");
        let contents = std::fs::read(&artifact.path).unwrap();
        assert_eq!(contents, record.as_bytes());
        assert_eq!(artifact.byte_length, contents.len() as u64);

        let modified = std::fs::metadata(&artifact.path).unwrap().modified().unwrap();
        assert_eq!(modified, clock::modified_time(&TIMESTAMP).unwrap());
    }

    #[test]
    fn read_back_length_matches_declared_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DurableStore::mount(&storage(dir.path(), Naming::Timestamp));

        let artifact = store.persist(&record(37), Some(&TIMESTAMP)).unwrap();
        let (_, len) = store.open(&artifact).unwrap();

        assert_eq!(len, artifact.byte_length);
    }

    #[test]
    fn same_minute_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DurableStore::mount(&storage(dir.path(), Naming::Timestamp));

        let first = store.persist(&record(100), Some(&TIMESTAMP)).unwrap();
        let later = CalendarTimestamp {
            second: 48,
            ..TIMESTAMP
        };
        let second = store.persist(&record(10), Some(&later)).unwrap();

        assert_eq!(first.name, second.name);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        let (_, len) = store.open(&second).unwrap();
        assert_eq!(len, second.byte_length);
    }

    #[test]
    fn counter_naming_increments() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = storage(dir.path(), Naming::Counter);
        config.extension = "txt".to_string();
        let mut store = DurableStore::mount(&config);

        let names: Vec<_> = (0..3)
            .map(|_| store.persist(&record(3), None).unwrap().name)
            .collect();

        assert_eq!(names, ["data_0.txt", "data_1.txt", "data_2.txt"]);
    }

    #[test]
    fn timestamp_naming_requires_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DurableStore::mount(&storage(dir.path(), Naming::Timestamp));

        assert!(matches!(
            store.persist(&record(1), None),
            Err(StoreError::MissingTimestamp)
        ));
    }

    #[test]
    fn missing_medium_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DurableStore::mount(&storage(dir.path(), Naming::Timestamp));
        drop(dir);

        assert!(matches!(
            store.persist(&record(1), Some(&TIMESTAMP)),
            Err(StoreError::Unavailable(_))
        ));
    }
}
