//! Read-only, memory-mapped view over a single host file.
//!
//! `ContextHandle` is a scoped resource: the mapping is released when
//! the handle drops, on every exit path, since `memmap2::Mmap` itself
//! unmaps on `Drop`. Nothing here ever writes to the mapped region.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use regex::bytes::Regex as BytesRegex;

const BINARY_SCAN_WINDOW: usize = 8 * 1024;
const BINARY_CONTROL_RATIO_THRESHOLD: f64 = 0.30;
const FINGERPRINT_SHINGLE_SIZE: usize = 5;
/// Every Nth shingle is kept so fingerprinting a large file stays cheap
/// while still sampling across the whole file, not just a prefix.
const FINGERPRINT_SAMPLE_STRIDE: usize = 7;
const SEARCH_HARD_CAP: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context file not found: {0}")]
    NotFound(PathBuf),
    #[error("context file rejected as binary")]
    Binary,
    #[error("io error opening context file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ContextHandle {
    mmap: Mmap,
    fingerprint: HashSet<String>,
}

impl ContextHandle {
    /// Opens `path` read-only and memory-maps it. Rejects binary content
    /// after scanning the first 8 KiB (spec §4.3 "Binary rejection").
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ContextError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ContextError::NotFound(path.to_path_buf())
            } else {
                ContextError::Io(e)
            }
        })?;
        // SAFETY: the file is opened read-only for the lifetime of this
        // handle and is not truncated or written to by this process.
        let mmap = unsafe { Mmap::map(&file)? };
        if looks_binary(&mmap) {
            return Err(ContextError::Binary);
        }
        let fingerprint = build_fingerprint(&mmap);
        Ok(Self { mmap, fingerprint })
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    /// Decodes `[start, start+length)` best-effort, replacing invalid
    /// UTF-8 with the replacement character. Bounds are clamped.
    pub fn read(&self, start: usize, length: usize) -> String {
        let size = self.mmap.len();
        let start = start.min(size);
        let end = start.saturating_add(length).min(size);
        String::from_utf8_lossy(&self.mmap[start..end]).into_owned()
    }

    pub fn read_window(&self, offset: usize, radius: usize) -> String {
        let start = offset.saturating_sub(radius);
        let length = radius.saturating_mul(2);
        self.read(start, length)
    }

    pub fn snippet(&self, offset: usize, window: usize) -> String {
        self.read_window(offset, window)
    }

    /// Byte-level regex search, bounded by `max_results` (hard cap 10).
    /// Matches that are not valid UTF-8 are skipped silently.
    pub fn search(&self, pattern: &BytesRegex, max_results: usize) -> Vec<(usize, String)> {
        let cap = max_results.min(SEARCH_HARD_CAP);
        let mut out = Vec::new();
        for m in pattern.find_iter(&self.mmap) {
            if out.len() >= cap {
                break;
            }
            if let Ok(text) = std::str::from_utf8(m.as_bytes()) {
                out.push((m.start(), text.to_string()));
            }
        }
        out
    }

    /// Line-oriented search returning `(1-based line number, line text,
    /// surrounding context)`.
    pub fn search_lines(
        &self,
        pattern: &BytesRegex,
        max_results: usize,
    ) -> Vec<(usize, String, String)> {
        let cap = max_results.min(SEARCH_HARD_CAP);
        let lines: Vec<&[u8]> = self.mmap.split(|&b| b == b'\n').collect();
        let mut out = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if out.len() >= cap {
                break;
            }
            if pattern.is_match(line) {
                let text = String::from_utf8_lossy(line).into_owned();
                let context = surrounding_lines(&lines, idx);
                out.push((idx + 1, text, context));
            }
        }
        out
    }

    /// A finite, restartable sequence of `(1-based line number, line
    /// text)` starting at `start_line`.
    pub fn iterate_lines(&self, start_line: usize) -> impl Iterator<Item = (usize, String)> + '_ {
        self.mmap
            .split(|&b| b == b'\n')
            .enumerate()
            .skip(start_line.saturating_sub(1))
            .map(|(idx, line)| (idx + 1, String::from_utf8_lossy(line).into_owned()))
    }

    pub fn head(&self, n: usize) -> String {
        self.iterate_lines(1).take(n).map(|(_, line)| line).collect::<Vec<_>>().join("\n")
    }

    pub fn tail(&self, n: usize) -> String {
        let lines: Vec<&[u8]> = self.mmap.split(|&b| b == b'\n').collect();
        let start = lines.len().saturating_sub(n);
        lines[start..]
            .iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The n-gram fingerprint sampled at open time, consumed by the
    /// Egress Filter's context-echo stage.
    pub fn fingerprint(&self) -> &HashSet<String> {
        &self.fingerprint
    }
}

fn looks_binary(data: &[u8]) -> bool {
    let window = &data[..data.len().min(BINARY_SCAN_WINDOW)];
    if window.is_empty() {
        return false;
    }
    if window.contains(&0) {
        return true;
    }
    let control_count = window
        .iter()
        .filter(|&&b| (b < 0x20 || b == 0x7F) && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    (control_count as f64 / window.len() as f64) > BINARY_CONTROL_RATIO_THRESHOLD
}

fn surrounding_lines(lines: &[&[u8]], idx: usize) -> String {
    let start = idx.saturating_sub(1);
    let end = (idx + 2).min(lines.len());
    lines[start..end].iter().map(|l| String::from_utf8_lossy(l).into_owned()).collect::<Vec<_>>().join("\n")
}

fn build_fingerprint(data: &[u8]) -> HashSet<String> {
    let text = String::from_utf8_lossy(data);
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < FINGERPRINT_SHINGLE_SIZE {
        return if words.is_empty() { HashSet::new() } else { HashSet::from([words.join(" ")]) };
    }
    words
        .windows(FINGERPRINT_SHINGLE_SIZE)
        .step_by(FINGERPRINT_SAMPLE_STRIDE)
        .map(|w| w.join(" "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn opens_text_file_and_reports_size() {
        let f = write_temp(b"hello world\nsecond line\n");
        let handle = ContextHandle::open(f.path()).unwrap();
        assert_eq!(handle.size(), 24);
    }

    #[test]
    fn rejects_null_byte_content() {
        let f = write_temp(b"hello\0world");
        assert!(matches!(ContextHandle::open(f.path()), Err(ContextError::Binary)));
    }

    #[test]
    fn rejects_missing_file() {
        let result = ContextHandle::open("/nonexistent/path/does-not-exist.txt");
        assert!(matches!(result, Err(ContextError::NotFound(_))));
    }

    #[test]
    fn read_clamps_out_of_bounds_window() {
        let f = write_temp(b"short");
        let handle = ContextHandle::open(f.path()).unwrap();
        assert_eq!(handle.read(100, 10), "");
        assert_eq!(handle.read(2, 100), "ort");
    }

    #[test]
    fn head_and_tail_return_expected_lines() {
        let f = write_temp(b"one\ntwo\nthree\nfour");
        let handle = ContextHandle::open(f.path()).unwrap();
        assert_eq!(handle.head(2), "one\ntwo");
        assert_eq!(handle.tail(2), "three\nfour");
    }

    #[test]
    fn search_lines_finds_secret_sentence() {
        let f = write_temp(b"normal line\nthe root password is hunter2 for the prod cluster\nfooter\n");
        let handle = ContextHandle::open(f.path()).unwrap();
        let pattern = BytesRegex::new("password").unwrap();
        let hits = handle.search_lines(&pattern, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn iterate_lines_is_restartable() {
        let f = write_temp(b"a\nb\nc\n");
        let handle = ContextHandle::open(f.path()).unwrap();
        let first: Vec<_> = handle.iterate_lines(2).collect();
        let second: Vec<_> = handle.iterate_lines(2).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], (2, "b".to_string()));
    }
}
