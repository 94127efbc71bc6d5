use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// CSV training log, one directory per run under the logs root.
///
/// Scalars land in `scalars.csv` as `step,tag,value,wall_time` rows, a
/// format that spreadsheet tools and plotting scripts read directly.
pub struct TrainingLogger {
    log_dir: PathBuf,
    step: i64,
    start_time: u64,
    scalar_writer: BufWriter<File>,
}

impl TrainingLogger {
    pub fn new(logs_dir: &Path, run_name: &str) -> Result<Self> {
        let log_dir = logs_dir.join(run_name);
        create_dir_all(&log_dir)?;

        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let scalar_file = File::create(log_dir.join("scalars.csv"))?;
        let mut scalar_writer = BufWriter::new(scalar_file);
        writeln!(scalar_writer, "step,tag,value,wall_time")?;

        Ok(Self {
            log_dir,
            step: 0,
            start_time,
            scalar_writer,
        })
    }

    /// Set the global step stamped on subsequent scalars.
    pub fn set_step(&mut self, step: i64) {
        self.step = step;
    }

    pub fn add_scalar(&mut self, tag: &str, value: f32) -> Result<()> {
        let wall_time = self.wall_time();
        writeln!(self.scalar_writer, "{},{},{},{}", self.step, tag, value, wall_time)?;
        self.scalar_writer.flush()?;
        Ok(())
    }

    pub fn add_scalars(&mut self, main_tag: &str, tag_scalar_pairs: &[(&str, f32)]) -> Result<()> {
        for (tag, value) in tag_scalar_pairs {
            self.add_scalar(&format!("{}/{}", main_tag, tag), *value)?;
        }
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn flush(&mut self) -> Result<()> {
        self.scalar_writer.flush()?;
        Ok(())
    }

    fn wall_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .saturating_sub(self.start_time)
    }
}

impl Drop for TrainingLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scalars_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut logger = TrainingLogger::new(dir.path(), "test_run").unwrap();
            logger.add_scalar("loss", 0.5).unwrap();
            logger.set_step(10);
            logger.add_scalars("train", &[("loss", 0.25), ("epsilon", 0.4)]).unwrap();
        }
        let contents = fs::read_to_string(dir.path().join("test_run").join("scalars.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "step,tag,value,wall_time");
        assert!(lines[1].starts_with("0,loss,0.5,"));
        assert!(lines[2].starts_with("10,train/loss,0.25,"));
        assert!(lines[3].starts_with("10,train/epsilon,0.4,"));
    }
}
