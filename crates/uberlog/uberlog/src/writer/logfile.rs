//! The rotating log file the writer slave appends to.
//!
//! Archives are named `<stem>-YYYY-MM-DDTHH-MM-SS-mmm-Z<ext>` in UTC, so a
//! plain lexicographic sort of the directory listing is also a chronological
//! sort, across timezones and DST transitions.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::Utc;

pub struct LogFile {
    filename: PathBuf,
    file: Option<File>,
    size: i64,
    max_size: i64,
    max_archives: i32,
}

impl LogFile {
    pub fn new(filename: PathBuf, max_size: i64, max_archives: i32) -> LogFile {
        LogFile {
            filename,
            file: None,
            size: 0,
            max_size,
            max_archives,
        }
    }

    /// Opens the file if it is not already open, appending to any existing
    /// contents. Seeking to the end also establishes the current size, which
    /// the rollover check works from.
    pub fn open(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&self.filename)?;
            self.size = file.seek(SeekFrom::End(0))? as i64;
            self.file = Some(file);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
        self.size = 0;
    }

    /// Appends `buf`, rolling the file over first if it would grow past the
    /// size limit. A failed `write` gets one close/reopen/retry, which is
    /// the useful response to transient filesystem trouble such as a network
    /// share dropping and coming back. Short writes are counted but not
    /// retried mid-frame.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.open()?;
        if self.size + buf.len() as i64 > self.max_size {
            self.roll_over()?;
            self.open()?;
        }
        if buf.is_empty() {
            return Ok(());
        }

        let written = match self.write_once(buf) {
            Ok(n) => n,
            Err(_) => {
                self.close();
                self.open()?;
                self.write_once(buf)?
            }
        };
        self.size += written as i64;
        if written != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to log file",
            ));
        }
        Ok(())
    }

    fn write_once(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "log file not open")),
        }
    }

    /// Closes and renames the live file to its archive name, then prunes the
    /// oldest archives beyond the retention count. A failed rename is
    /// reported as a failed write; failed deletions are ignored.
    fn roll_over(&mut self) -> io::Result<()> {
        self.close();
        let archive = self.archive_name();
        std::fs::rename(&self.filename, &archive)?;

        let archives = self.find_archives();
        let keep = self.max_archives.max(0) as usize;
        if archives.len() > keep {
            for old in &archives[..archives.len() - keep] {
                let _ = std::fs::remove_file(old);
            }
        }
        Ok(())
    }

    /// Splits the configured filename at the extension: the suffix after the
    /// last `.` in the basename, if any.
    fn split_extension(&self) -> (String, String) {
        let full = self.filename.to_string_lossy().into_owned();
        let base_start = full.rfind('/').map(|i| i + 1).unwrap_or(0);
        match full[base_start..].rfind('.') {
            Some(dot) => {
                let at = base_start + dot;
                (full[..at].to_string(), full[at..].to_string())
            }
            None => (full, String::new()),
        }
    }

    fn archive_name(&self) -> PathBuf {
        let (stem, ext) = self.split_extension();
        let stamp = Utc::now().format("-%Y-%m-%dT%H-%M-%S-%3f-Z");
        PathBuf::from(format!("{stem}{stamp}{ext}"))
    }

    /// All files matching `<stem>-*` in the log directory, sorted so the
    /// oldest archive comes first (the naming convention makes lexicographic
    /// order chronological).
    fn find_archives(&self) -> Vec<PathBuf> {
        let (stem, _) = self.split_extension();
        let pattern = format!("{stem}-*");
        let mut archives: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.flatten().collect(),
            Err(_) => Vec::new(),
        };
        archives.sort();
        archives
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("uberlog-logfile-{}-{tag}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    #[test]
    fn extension_is_split_at_the_last_dot_of_the_basename() {
        let lf = LogFile::new(PathBuf::from("/var/log.d/app.2.log"), 0, 0);
        let (stem, ext) = lf.split_extension();
        assert_eq!(stem, "/var/log.d/app.2");
        assert_eq!(ext, ".log");

        let lf = LogFile::new(PathBuf::from("/var/log.d/app"), 0, 0);
        let (stem, ext) = lf.split_extension();
        assert_eq!(stem, "/var/log.d/app");
        assert_eq!(ext, "");
    }

    #[test]
    fn append_resumes_at_the_existing_size() {
        let dir = test_dir("append");
        let path = dir.join("app.log");
        std::fs::write(&path, b"existing").unwrap();

        let mut lf = LogFile::new(path.clone(), 1 << 20, 3);
        lf.write(b" more").unwrap();
        lf.close();
        assert_eq!(std::fs::read(&path).unwrap(), b"existing more");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rollover_prunes_to_the_retention_count() {
        let dir = test_dir("rollover");
        let path = dir.join("app.log");
        let mut lf = LogFile::new(path.clone(), 64, 2);

        // Each chunk fills the file, so every second write rotates. Spacing
        // the writes keeps the millisecond archive stamps unique.
        let chunk = [b'a'; 60];
        for _ in 0..8 {
            lf.write(&chunk).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(3));
        }
        lf.close();

        let mut archives: Vec<PathBuf> = std::fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("app-"))
            })
            .collect();
        archives.sort();
        assert_eq!(archives.len(), 2, "retention keeps exactly max_archives");

        // Lexicographic order must equal chronological order.
        let older = std::fs::metadata(&archives[0]).unwrap().modified().unwrap();
        let newer = std::fs::metadata(&archives[1]).unwrap().modified().unwrap();
        assert!(older <= newer);

        // Archive names keep the extension after the UTC stamp.
        for archive in &archives {
            let name = archive.file_name().unwrap().to_str().unwrap();
            assert!(name.ends_with("-Z.log"), "unexpected archive name {name}");
        }
        assert!(path.exists(), "a fresh live file replaces the rotated one");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn oversized_single_write_still_lands() {
        let dir = test_dir("oversize");
        let path = dir.join("app.log");
        let mut lf = LogFile::new(path.clone(), 16, 1);
        // Larger than max_size: the write itself is never split or refused,
        // only the next write triggers rotation.
        lf.write(&[b'x'; 40]).unwrap();
        lf.close();
        assert_eq!(std::fs::read(&path).unwrap().len(), 40);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
