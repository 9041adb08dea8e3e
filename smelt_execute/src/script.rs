use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Where a command's script and captured stdout land on disk once materialized.
pub struct MaterializedScript {
    pub script_path: PathBuf,
    pub stdout_path: PathBuf,
}

/// Writes a command's script lines out as an executable `command.sh` under
/// `<working_dir>/smelt-out/<command_ref>/`, alongside the `command.out` path its stdout will be
/// captured into. `command_ref` may contain path separators (e.g. `//foo:bar`), so it is
/// flattened before use as a directory name. `working_dir` defaults to the session's `smelt_root`
/// when a command leaves it unset, so this lands at `smelt_root/smelt-out/<name>/` in the common
/// case.
pub fn materialize(working_dir: &Path, command_ref: &str, script: &[String]) -> io::Result<MaterializedScript> {
    let flattened = command_ref.replace(['/', ':'], "_");
    let run_dir = working_dir.join("smelt-out").join(flattened);
    fs::create_dir_all(&run_dir)?;

    let script_path = run_dir.join("command.sh");
    let mut contents = String::from("#!/bin/bash\nset -euo pipefail\n");
    for line in script {
        contents.push_str(line);
        contents.push('\n');
    }
    fs::write(&script_path, contents)?;
    set_executable(&script_path)?;

    let stdout_path = run_dir.join("command.out");
    Ok(MaterializedScript { script_path, stdout_path })
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_writes_an_executable_script() {
        let tempdir = tempfile::tempdir().unwrap();
        let materialized = materialize(
            tempdir.path(),
            "//tests:smoke",
            &["echo hello".to_owned(), "echo world".to_owned()],
        )
        .unwrap();

        let contents = fs::read_to_string(&materialized.script_path).unwrap();
        assert!(contents.contains("echo hello"));
        assert!(contents.contains("echo world"));
        assert!(materialized.script_path.exists());
        assert!(!materialized.stdout_path.exists(), "stdout is only written once the command runs");
    }

    #[test]
    fn command_ref_with_separators_gets_flattened_into_a_directory_name() {
        let tempdir = tempfile::tempdir().unwrap();
        let materialized = materialize(tempdir.path(), "//tests:smoke", &["true".to_owned()]).unwrap();
        assert_eq!(
            materialized.script_path.parent().unwrap().file_name().unwrap(),
            "_tests_smoke"
        );
    }
}
