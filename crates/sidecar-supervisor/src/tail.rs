use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Incremental line reader over a growing log file. Mirrors the events-file
/// tailer: track the last offset, read only new bytes, carry partial lines
/// until their newline arrives.
#[derive(Debug)]
pub struct LineTailer {
    path: PathBuf,
    offset: u64,
    carry: Vec<u8>,
}

impl LineTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            carry: Vec::new(),
        }
    }

    pub fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        if len < self.offset {
            self.offset = 0;
            self.carry.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut chunk)?;
        self.offset = len;
        self.carry.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.carry.iter().position(|byte| *byte == b'\n') {
            let mut raw: Vec<u8> = self.carry.drain(..=newline).collect();
            raw.pop();
            if raw.ends_with(b"\r") {
                raw.pop();
            }
            if raw.is_empty() {
                continue;
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_lines_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut tailer = LineTailer::new(&path);
        assert!(tailer.poll().unwrap().is_empty());

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"first\nsecond\npart").unwrap();
        assert_eq!(tailer.poll().unwrap(), vec!["first", "second"]);

        file.write_all(b"ial\n").unwrap();
        assert_eq!(tailer.poll().unwrap(), vec!["partial"]);
    }

    #[test]
    fn truncation_resets_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "a\nb\n").unwrap();

        let mut tailer = LineTailer::new(&path);
        assert_eq!(tailer.poll().unwrap().len(), 2);

        fs::write(&path, "c\n").unwrap();
        assert_eq!(tailer.poll().unwrap(), vec!["c"]);
    }
}
