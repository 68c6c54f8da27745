//! Writes and removes the daemon's PID file, re-written in place whenever
//! `AppConfig.pid_file` changes via reload.

use std::fs;
use std::io;
use std::path::Path;

pub fn write(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    fs::write(path, format!("{}\n", std::process::id()))
}

pub fn remove(path: impl AsRef<Path>) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_current_pid() {
        let path = std::env::temp_dir().join(format!("maild-pidfile-test-{}", std::process::id()));
        write(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        remove(&path);
        assert!(!path.exists());
    }
}
