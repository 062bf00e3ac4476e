use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

// Extension fast paths checked before sampling content.
const TEXT_EXT: &[&str] = &["csv", "md", "py", "sh", "txt"];
const BINARY_EXT: &[&str] = &[
    "bin", "gif", "gz", "jpeg", "jpg", "pickle", "png", "ppm", "pyc", "rar", "tar", "tif",
    "tiff", "xz", "zip",
];

const SAMPLE_SIZE: usize = 1024;
const CONTROL_CHARS: &[u8] = b"\n\r\t\x0c\x08";

/// Heuristic text check, adapted from the binaryornot approach: known
/// extensions decide outright, otherwise a leading sample is scored by
/// printable-character ratios with a UTF-8 decode as the tie breaker.
pub fn is_text_file(path: &Path) -> io::Result<bool> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Ok(false);
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if TEXT_EXT.contains(&ext.as_str()) {
            return Ok(true);
        }
        if BINARY_EXT.contains(&ext.as_str()) {
            return Ok(false);
        }
    }
    let mut sample = vec![0u8; SAMPLE_SIZE];
    let n = match File::open(path).and_then(|mut f| f.read(&mut sample)) {
        Ok(n) => n,
        Err(_) => return Ok(false),
    };
    sample.truncate(n);
    Ok(sample_is_text(&sample))
}

/// `is_text_file` with I/O failures reported as non-text.
pub fn safe_is_text_file(path: &Path) -> bool {
    match is_text_file(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not check for text file");
            false
        }
    }
}

fn sample_is_text(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return true;
    }
    let len = sample.len() as f64;
    let low_chars = sample
        .iter()
        .filter(|&&b| !(CONTROL_CHARS.contains(&b) || (32..127).contains(&b)))
        .count();
    let low_ascii = sample.iter().filter(|&&b| b < 127).count();
    let nontext_ratio1 = low_chars as f64 / len;
    let nontext_ratio2 = low_ascii as f64 / len;
    let likely_binary = (nontext_ratio1 > 0.3 && nontext_ratio2 < 0.05)
        || (nontext_ratio1 > 0.8 && nontext_ratio2 > 0.8);

    // Approximates a charset sniff: valid non-ASCII UTF-8 counts as a
    // decodable unicode encoding.
    let decodable_as_unicode =
        std::str::from_utf8(sample).is_ok() && !sample.is_ascii();

    if likely_binary {
        decodable_as_unicode
    } else if decodable_as_unicode {
        true
    } else {
        !(sample.contains(&0x00) || sample.contains(&0xff))
    }
}
