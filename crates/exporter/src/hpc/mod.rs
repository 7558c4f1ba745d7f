//! HPC job-to-device correlation source.
//!
//! On clusters driven by an HPC scheduler instead of Kubernetes, a
//! mapping directory holds one file per GPU index whose lines are the
//! job names currently placed on that GPU. This source is independent
//! of the pod cache and no precedence between the two is assumed; the
//! emission path attaches whichever context exists.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

type JobIndex = HashMap<u32, Vec<String>>;

pub struct HpcJobMapper {
    mapping_dir: PathBuf,
    /// Published jobs-by-GPU-index map, swapped as a whole per refresh.
    published: RwLock<Arc<JobIndex>>,
}

impl HpcJobMapper {
    pub fn new<P: Into<PathBuf>>(mapping_dir: P) -> Self {
        Self {
            mapping_dir: mapping_dir.into(),
            published: RwLock::new(Arc::new(JobIndex::new())),
        }
    }

    /// Jobs currently mapped to a GPU index, from the last completed
    /// refresh.
    pub fn jobs_for_device(&self, gpu_index: u32) -> Vec<String> {
        self.published
            .read()
            .expect("poisoned")
            .get(&gpu_index)
            .cloned()
            .unwrap_or_default()
    }

    /// Rebuilds the map from the mapping directory and publishes it. A
    /// missing directory publishes an empty map: no jobs are placed.
    pub fn refresh(&self) -> io::Result<()> {
        let mut index = JobIndex::new();

        let entries = match std::fs::read_dir(&self.mapping_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                *self.published.write().expect("poisoned") = Arc::new(index);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            // Files are named by GPU index; anything else in the
            // directory is ignored.
            let Some(gpu_index) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
                debug!(file = ?name, "Ignoring non-index file in job mapping directory");
                continue;
            };
            let content = std::fs::read_to_string(entry.path())?;
            let jobs: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            if !jobs.is_empty() {
                index.insert(gpu_index, jobs);
            }
        }

        debug!(gpus = index.len(), "Published HPC job mapping");
        *self.published.write().expect("poisoned") = Arc::new(index);
        Ok(())
    }

    /// Refreshes on an interval until cancelled. Read failures keep the
    /// previous map and are retried on the next tick.
    pub async fn run(&self, interval: Duration, cancellation_token: CancellationToken) {
        info!(dir = %self.mapping_dir.display(), "Starting HPC job mapper");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("HPC job mapper shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh() {
                        warn!("HPC job mapping refresh failed, keeping previous map: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_mapping(dir: &std::path::Path, gpu_index: u32, jobs: &[&str]) {
        let mut file = std::fs::File::create(dir.join(gpu_index.to_string())).unwrap();
        for job in jobs {
            writeln!(file, "{job}").unwrap();
        }
    }

    #[test]
    fn reads_one_file_per_gpu_index() {
        let dir = tempfile::tempdir().unwrap();
        write_mapping(dir.path(), 0, &["job-alpha", "job-beta"]);
        write_mapping(dir.path(), 3, &["job-gamma"]);
        std::fs::write(dir.path().join("README"), "not an index").unwrap();

        let mapper = HpcJobMapper::new(dir.path());
        mapper.refresh().unwrap();

        assert_eq!(
            mapper.jobs_for_device(0),
            vec!["job-alpha".to_string(), "job-beta".to_string()]
        );
        assert_eq!(mapper.jobs_for_device(3), vec!["job-gamma".to_string()]);
        assert!(mapper.jobs_for_device(1).is_empty());
    }

    #[test]
    fn missing_directory_publishes_an_empty_map() {
        let mapper = HpcJobMapper::new("/nonexistent/hpc-jobs");
        mapper.refresh().unwrap();
        assert!(mapper.jobs_for_device(0).is_empty());
    }

    #[test]
    fn refresh_replaces_the_previous_map_atomically() {
        let dir = tempfile::tempdir().unwrap();
        write_mapping(dir.path(), 0, &["job-alpha"]);

        let mapper = HpcJobMapper::new(dir.path());
        mapper.refresh().unwrap();
        assert_eq!(mapper.jobs_for_device(0), vec!["job-alpha".to_string()]);

        std::fs::remove_file(dir.path().join("0")).unwrap();
        write_mapping(dir.path(), 1, &["job-beta"]);
        mapper.refresh().unwrap();

        assert!(mapper.jobs_for_device(0).is_empty());
        assert_eq!(mapper.jobs_for_device(1), vec!["job-beta".to_string()]);
    }

    #[test]
    fn blank_lines_and_whitespace_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2"), "  job-x \n\n job-y\n").unwrap();

        let mapper = HpcJobMapper::new(dir.path());
        mapper.refresh().unwrap();
        assert_eq!(
            mapper.jobs_for_device(2),
            vec!["job-x".to_string(), "job-y".to_string()]
        );
    }
}
