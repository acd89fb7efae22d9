use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{info, warn};

use crate::error::MonitorError;

/// How long to wait at EOF before checking the file again
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Longest line kept in memory; longer lines are dropped up to their newline
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Where to start reading when the follower is opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Start,
    End,
}

/// Identifies the file behind a path, to detect rotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity(meta: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn identity(_meta: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

/// Follows a growing log file line by line, like `tail -F`.
///
/// Truncation and rotation are handled by reopening the path from the start.
/// A trailing line without a newline is held until the newline arrives.
/// Lines over [`MAX_LINE_BYTES`] are dropped with a warning.
pub struct LogFollower {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    identity: Option<FileIdentity>,
    /// Bytes consumed from the current file
    offset: u64,
    /// Bytes of the line being assembled
    pending: Vec<u8>,
    /// Skipping the rest of an oversized line
    discarding: bool,
    poll_interval: Duration,
    /// Set once a reopen failure has been reported, cleared on success
    reopen_failed: bool,
}

impl LogFollower {
    /// Open `path` for following. Fails if it does not exist or is not a file.
    pub fn open(path: impl AsRef<Path>, whence: Whence) -> Result<Self, MonitorError> {
        let path = path.as_ref().to_path_buf();
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MonitorError::LogPathMissing(path));
            }
            Err(source) => return Err(MonitorError::Io { path, source }),
        };
        if !meta.is_file() {
            return Err(MonitorError::NotAFile(path));
        }

        let io_err = |source| MonitorError::Io {
            path: path.clone(),
            source,
        };
        let mut file = std::fs::File::open(&path).map_err(io_err)?;
        let offset = match whence {
            Whence::Start => 0,
            Whence::End => file.seek(SeekFrom::End(0)).map_err(io_err)?,
        };

        Ok(Self {
            reader: Some(BufReader::new(File::from_std(file))),
            identity: identity(&meta),
            offset,
            pending: Vec::new(),
            discarding: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reopen_failed: false,
            path,
        })
    }

    /// Override how long to wait at EOF
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The followed path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next complete line.
    ///
    /// Errors are transient: the file is reopened on the following call.
    pub async fn next_line(&mut self) -> io::Result<String> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                self.reopen().await;
                if self.reader.is_none() {
                    tokio::time::sleep(self.poll_interval).await;
                }
                continue;
            };

            let (used, newline) = match reader.fill_buf().await {
                Ok(buf) => {
                    let newline = buf.iter().position(|&b| b == b'\n');
                    let used = newline.map_or(buf.len(), |i| i + 1);
                    if !self.discarding {
                        self.pending.extend_from_slice(&buf[..used]);
                    }
                    (used, newline.is_some())
                }
                Err(e) => {
                    self.reader = None;
                    return Err(e);
                }
            };

            if used == 0 {
                if !self.check_replaced().await {
                    tokio::time::sleep(self.poll_interval).await;
                }
                continue;
            }

            reader.consume(used);
            self.offset += used as u64;

            if !self.discarding && self.pending.len() > MAX_LINE_BYTES {
                warn!(
                    path = %self.path.display(),
                    limit = MAX_LINE_BYTES,
                    "line too long, dropping it"
                );
                self.pending.clear();
                self.discarding = !newline;
                continue;
            }
            if newline {
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                return Ok(self.take_line());
            }
        }
    }

    /// Turn the follower into an endless stream of lines
    pub fn into_lines(self) -> impl Stream<Item = io::Result<String>> {
        futures::stream::unfold(self, |mut follower| async move {
            let next = follower.next_line().await;
            Some((next, follower))
        })
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }

    /// At EOF: detect rotation or truncation. Returns true if the read
    /// position changed and reading should resume immediately.
    async fn check_replaced(&mut self) -> bool {
        // A missing path mid-rotation is not an error; keep the old handle.
        let Ok(meta) = tokio::fs::metadata(&self.path).await else {
            return false;
        };

        let current = identity(&meta);
        if current.is_some() && current != self.identity {
            info!(path = %self.path.display(), "log file rotated, reopening");
            self.reader = None;
            return true;
        }

        if meta.len() < self.offset {
            info!(path = %self.path.display(), "log file truncated, reading from start");
            self.offset = 0;
            self.pending.clear();
            self.discarding = false;
            if let Some(reader) = self.reader.as_mut() {
                if let Err(e) = reader.seek(SeekFrom::Start(0)).await {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "seek after truncation failed"
                    );
                    self.reader = None;
                }
            }
            return true;
        }

        false
    }

    /// Open the path again. The same file, still at least as long as what
    /// was consumed, resumes at the saved offset; anything else starts over.
    async fn reopen(&mut self) {
        let offset = self.offset;
        let previous = self.identity;
        let opened = async {
            let mut file = File::open(&self.path).await?;
            let meta = file.metadata().await?;
            let current = identity(&meta);
            let resume = current.is_some() && current == previous && meta.len() >= offset;
            if resume {
                file.seek(SeekFrom::Start(offset)).await?;
            }
            Ok::<_, io::Error>((file, current, resume))
        }
        .await;

        match opened {
            Ok((file, current, resume)) => {
                if !resume {
                    self.offset = 0;
                    self.pending.clear();
                    self.discarding = false;
                }
                self.identity = current;
                self.reader = Some(BufReader::new(file));
                self.reopen_failed = false;
            }
            Err(e) => {
                if !self.reopen_failed {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "cannot reopen log file, retrying"
                    );
                    self.reopen_failed = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    const FAST: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(5);

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn next(follower: &mut LogFollower) -> String {
        tokio::time::timeout(WAIT, follower.next_line())
            .await
            .expect("line within timeout")
            .expect("line read")
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = LogFollower::open(dir.path().join("nope.log"), Whence::End);
        assert!(matches!(result, Err(MonitorError::LogPathMissing(_))));
    }

    #[test]
    fn test_open_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = LogFollower::open(dir.path(), Whence::End);
        assert!(matches!(result, Err(MonitorError::NotAFile(_))));
    }

    #[tokio::test]
    async fn test_follows_from_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut follower = LogFollower::open(&path, Whence::End)
            .unwrap()
            .with_poll_interval(FAST);
        append(&path, "new1\nnew2\r\n");

        assert_eq!(next(&mut follower).await, "new1");
        assert_eq!(next(&mut follower).await, "new2");
    }

    #[tokio::test]
    async fn test_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "first\n").unwrap();

        let mut follower = LogFollower::open(&path, Whence::Start).unwrap();
        assert_eq!(next(&mut follower).await, "first");
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let mut follower = LogFollower::open(&path, Whence::End)
            .unwrap()
            .with_poll_interval(FAST);
        append(&path, "par");

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            append(&writer_path, "tial\n");
        });

        assert_eq!(next(&mut follower).await, "partial");
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "aaaaaaaa\nbbbbbbbb\n").unwrap();

        let mut follower = LogFollower::open(&path, Whence::End)
            .unwrap()
            .with_poll_interval(FAST);
        std::fs::write(&path, "c\n").unwrap();

        assert_eq!(next(&mut follower).await, "c");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_reopens_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "before\n").unwrap();

        let mut follower = LogFollower::open(&path, Whence::End)
            .unwrap()
            .with_poll_interval(FAST);
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "fresh\n").unwrap();

        assert_eq!(next(&mut follower).await, "fresh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reopen_after_read_error_resumes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "ERROR historical 1\nERROR historical 2\n").unwrap();

        let mut follower = LogFollower::open(&path, Whence::End)
            .unwrap()
            .with_poll_interval(FAST);
        append(&path, "new\n");
        assert_eq!(next(&mut follower).await, "new");

        // State left behind by a failed read
        follower.reader = None;
        append(&path, "after\n");
        assert_eq!(next(&mut follower).await, "after");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reopen_keeps_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let mut follower = LogFollower::open(&path, Whence::End)
            .unwrap()
            .with_poll_interval(FAST);
        append(&path, "first\nsec");
        assert_eq!(next(&mut follower).await, "first");

        follower.reader = None;
        append(&path, "ond\n");
        assert_eq!(next(&mut follower).await, "second");
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut contents = vec![b'x'; MAX_LINE_BYTES + 10];
        contents.extend_from_slice(b"\nok\n");
        std::fs::write(&path, &contents).unwrap();

        let mut follower = LogFollower::open(&path, Whence::Start).unwrap();
        assert_eq!(next(&mut follower).await, "ok");
        assert!(follower.pending.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_lossy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"ok \xff\n").unwrap();

        let mut follower = LogFollower::open(&path, Whence::Start).unwrap();
        assert_eq!(next(&mut follower).await, "ok \u{fffd}");
    }

    #[tokio::test]
    async fn test_into_lines_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let follower = LogFollower::open(&path, Whence::Start).unwrap();
        let lines: Vec<String> = tokio::time::timeout(
            WAIT,
            follower.into_lines().take(2).map(|l| l.unwrap()).collect(),
        )
        .await
        .unwrap();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }
}
