//! Raw agent output per iteration (`Loop_State/<task_id>/iterations/<n>.log`).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::atomic::write_atomic;

pub fn iterations_dir(loop_state_dir: &Path, task_id: &str) -> PathBuf {
    loop_state_dir.join(task_id).join("iterations")
}

pub fn iteration_log_path(loop_state_dir: &Path, task_id: &str, iteration: u32) -> PathBuf {
    iterations_dir(loop_state_dir, task_id).join(format!("{iteration}.log"))
}

pub fn write_iteration_log(
    loop_state_dir: &Path,
    task_id: &str,
    iteration: u32,
    output: &str,
) -> Result<PathBuf> {
    let path = iteration_log_path(loop_state_dir, task_id, iteration);
    write_atomic(&path, output.as_bytes())?;
    Ok(path)
}

/// Output of a past iteration, if it was logged.
pub fn read_iteration_log(
    loop_state_dir: &Path,
    task_id: &str,
    iteration: u32,
) -> Result<Option<String>> {
    let path = iteration_log_path(loop_state_dir, task_id, iteration);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Drop every iteration log for `task_id` (a fresh run starts numbering at 1).
pub fn clear_iteration_logs(loop_state_dir: &Path, task_id: &str) -> Result<()> {
    let dir = iterations_dir(loop_state_dir, task_id);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_and_clear() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_iteration_log(temp.path(), "abcd1234", 3, "output").expect("write");
        assert!(path.ends_with("abcd1234/iterations/3.log"));
        assert_eq!(
            read_iteration_log(temp.path(), "abcd1234", 3).expect("read"),
            Some("output".to_string())
        );
        assert_eq!(read_iteration_log(temp.path(), "abcd1234", 4).expect("read"), None);

        clear_iteration_logs(temp.path(), "abcd1234").expect("clear");
        assert_eq!(read_iteration_log(temp.path(), "abcd1234", 3).expect("read"), None);
        clear_iteration_logs(temp.path(), "abcd1234").expect("clear twice");
    }
}
