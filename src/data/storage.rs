//! File writers for run data.
//!
//! Every output file is named `{prefix}_{timestamp}` with the ISO timestamp
//! made filesystem-safe (`:`, `-` and `.` become `_`), so files from one
//! session sort chronologically.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Filesystem-safe local timestamp, microsecond resolution.
pub fn timestamp_token() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
        .replace(':', "_")
        .replace('-', "_")
        .replace('.', "_")
}

// ---------------------------------------------------------------------------
// CSV sample log
// ---------------------------------------------------------------------------

#[cfg(feature = "storage_csv")]
mod csv_impl {
    use super::*;
    use crate::core::{DataPoint, StorageWriter};
    use async_trait::async_trait;

    /// One CSV file per run: `timestamp,instrument,channel,value,unit`.
    pub struct CsvWriter {
        writer: csv::Writer<File>,
        path: PathBuf,
    }

    impl CsvWriter {
        pub fn create(dir: &Path, prefix: &str) -> Result<Self> {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create record dir {}", dir.display()))?;
            let path = dir.join(format!("{prefix}_{}.csv", timestamp_token()));
            let writer = csv::Writer::from_path(&path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            log::info!("logging samples to {}", path.display());
            Ok(Self { writer, path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    #[async_trait]
    impl StorageWriter for CsvWriter {
        async fn write(&mut self, data: &[DataPoint]) -> Result<()> {
            for point in data {
                self.writer
                    .serialize(point)
                    .context("csv serialization failed")?;
            }
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.writer.flush().context("csv flush failed")?;
            log::info!("closed sample log {}", self.path.display());
            Ok(())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_impl::CsvWriter;

#[cfg(not(feature = "storage_csv"))]
mod csv_stub {
    use super::*;
    use crate::core::{DataPoint, StorageWriter};
    use crate::error::ControlError;
    use async_trait::async_trait;

    /// Placeholder when the crate is built without `storage_csv`.
    pub struct CsvWriter;

    impl CsvWriter {
        pub fn create(_dir: &Path, _prefix: &str) -> Result<Self> {
            Err(ControlError::FeatureNotEnabled("storage_csv".to_string()).into())
        }
    }

    #[async_trait]
    impl StorageWriter for CsvWriter {
        async fn write(&mut self, _data: &[DataPoint]) -> Result<()> {
            Err(ControlError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
pub use csv_stub::CsvWriter;

// ---------------------------------------------------------------------------
// Raw interferometer capture
// ---------------------------------------------------------------------------

/// Appends raw displacement stream frames to a `.aws` file.
pub struct AwsRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    frames: u64,
}

impl AwsRecorder {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create record dir {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer
            .write_all(frame)
            .with_context(|| format!("write to {} failed", self.path.display()))?;
        self.frames += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("flush of {} failed", self.path.display()))?;
        log::info!(
            "captured {} frames to {}",
            self.frames,
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_tokens_are_filesystem_safe() {
        let token = timestamp_token();
        assert!(!token.contains(':'));
        assert!(!token.contains('-'));
        assert!(!token.contains('.'));
        assert!(token.contains('T'));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn csv_writer_logs_header_and_rows() {
        use crate::core::{DataPoint, StorageWriter};

        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvWriter::create(dir.path(), "motor_cycle").unwrap();
        let path = writer.path().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("motor_cycle_"));

        writer
            .write(&[
                DataPoint::now("picomotor", "position", 100.0, "steps"),
                DataPoint::now("picomotor", "position", 200.0, "steps"),
            ])
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,instrument,channel,value,unit");
        assert!(lines[1].contains("picomotor,position,100.0,steps"));
    }

    #[test]
    fn aws_recorder_appends_raw_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids_record_test.aws");
        let mut recorder = AwsRecorder::create(&path).unwrap();
        recorder.write_frame(&[1, 2, 3, 4]).unwrap();
        recorder.write_frame(&[5, 6, 7, 8]).unwrap();
        recorder.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
