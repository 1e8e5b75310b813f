//! Per-run artifact directory.
//!
//! Every run creates `.tomato/runs/TIMESTAMP_SHORTID/` and component log
//! files inside it (app output, per-container logs, engine events). The
//! directory is created at run start and never deleted by the engine, so a
//! failed run leaves its evidence behind.

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

/// Handle to one run's artifact directory.
#[derive(Debug, Clone)]
pub struct RunContext {
    dir: Utf8PathBuf,
}

impl RunContext {
    /// Create the artifact directory for a new run under `base`.
    ///
    /// The directory name is `TIMESTAMP_SHORTID`, for example
    /// `.tomato/runs/20260807_143002_1a2b3c4d/`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the directory cannot be created.
    pub fn create(base: &Utf8Path) -> std::io::Result<Self> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let short_id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let dir = base.join("runs").join(format!("{timestamp}_{short_id}"));
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Create a run context rooted at the default `.tomato` base.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the directory cannot be created.
    pub fn create_default() -> std::io::Result<Self> {
        Self::create(Utf8Path::new(".tomato"))
    }

    /// The run's artifact directory.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Path for a component's log file (`app`, `container-postgres`, ...).
    #[must_use]
    pub fn log_path(&self, component: &str) -> Utf8PathBuf {
        self.dir.join(format!("{component}.log"))
    }

    /// Create (truncating) a component's log file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the file cannot be created.
    pub fn create_log_file(&self, component: &str) -> std::io::Result<std::fs::File> {
        std::fs::File::create(self.log_path(component))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn create_builds_timestamped_directory() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let base = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 path");

        let run = RunContext::create(&base).expect("create run dir");
        assert!(run.dir().as_std_path().is_dir());
        assert!(run.dir().as_str().contains("runs"));

        let name = run.dir().file_name().expect("dir name");
        let (timestamp, short_id) = name.rsplit_once('_').expect("timestamp_shortid form");
        assert!(timestamp.len() >= 15);
        assert_eq!(short_id.len(), 8);
    }

    #[rstest]
    fn log_files_are_created_inside_the_run_directory() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let base = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 path");

        let run = RunContext::create(&base).expect("create run dir");
        let file = run.create_log_file("container-postgres");
        assert!(file.is_ok());
        assert!(run.log_path("container-postgres").as_std_path().exists());
    }
}
