//! Stderr signature table shared by the encoder supervisor and the
//! integrity checker. Bounded stderr from a failed child process is matched
//! against a curated list of known-corrupt and known-benign substrings.

/// What a failed run's stderr tail implies about the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The source itself is broken; trash it and drop the catalog record.
    Corrupt,
    /// Hardware decode init failed; retry with software decode.
    HardwareDecodeInit,
    /// Some other failure; record the error and leave the file pending.
    Generic,
}

struct Signature {
    needle: &'static str,
    classification: Classification,
}

const SIGNATURES: &[Signature] = &[
    Signature { needle: "invalid nal unit size", classification: Classification::Corrupt },
    Signature { needle: "unspecified pixel format", classification: Classification::Corrupt },
    Signature { needle: "unknown codec", classification: Classification::Corrupt },
    Signature { needle: "too many packets buffered", classification: Classification::Corrupt },
    Signature { needle: "invalid data found when processing input", classification: Classification::Corrupt },
    Signature { needle: "could not open encoder before eof", classification: Classification::Corrupt },
    Signature { needle: "probe command failed", classification: Classification::Corrupt },
    Signature { needle: "251", classification: Classification::HardwareDecodeInit },
];

/// Exit codes that imply corruption independent of any stderr match.
fn exit_code_implies_corruption(exit_code: Option<i32>) -> bool {
    matches!(exit_code, Some(-22))
}

/// A process killed by SIGFPE (8 on Linux) always implies corruption.
fn signal_implies_corruption(signal: Option<i32>) -> bool {
    matches!(signal, Some(8))
}

/// Classifies a nonzero-exit child run from its bounded stderr, exit code
/// and (unix-only) terminating signal.
pub fn classify(stderr_tail: &[String], exit_code: Option<i32>, signal: Option<i32>) -> Classification {
    if exit_code_implies_corruption(exit_code) || signal_implies_corruption(signal) {
        return Classification::Corrupt;
    }
    let joined = stderr_tail.join("\n").to_lowercase();
    for signature in SIGNATURES {
        if joined.contains(signature.needle) {
            return signature.classification;
        }
    }
    Classification::Generic
}

/// Lines the integrity checker treats as informational noise rather than
/// evidence of a broken stream.
const BENIGN_PATTERNS: &[&str] = &[
    "deprecated pixel format",
    "message repeated",
    "stream mapping",
    "configuration:",
    "libavutil",
    "libavcodec",
    "libavformat",
    "encoder         :",
    "input #0",
    "output #0",
    "metadata:",
    "duration:",
];

/// Subtracts benign lines and returns whatever `error`-bearing lines remain.
/// An empty result means the decode pass is considered clean.
pub fn residual_errors(stderr_tail: &[String]) -> Vec<&str> {
    stderr_tail
        .iter()
        .map(|line| line.as_str())
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("error") && !BENIGN_PATTERNS.iter().any(|p| lower.contains(p))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_nal_unit_is_corrupt() {
        let stderr = vec!["[h264] error while decoding MB: invalid nal unit size".to_string()];
        assert_eq!(classify(&stderr, Some(1), None), Classification::Corrupt);
    }

    #[test]
    fn signature_251_is_hardware_decode_init_failure() {
        let stderr = vec!["hwaccel init failed, error 251".to_string()];
        assert_eq!(classify(&stderr, Some(1), None), Classification::HardwareDecodeInit);
    }

    #[test]
    fn exit_code_negative_22_is_corrupt() {
        assert_eq!(classify(&[], Some(-22), None), Classification::Corrupt);
    }

    #[test]
    fn sigfpe_is_corrupt() {
        assert_eq!(classify(&[], None, Some(8)), Classification::Corrupt);
    }

    #[test]
    fn unmatched_stderr_is_generic() {
        let stderr = vec!["disk is full".to_string()];
        assert_eq!(classify(&stderr, Some(1), None), Classification::Generic);
    }

    #[test]
    fn benign_lines_are_subtracted() {
        let stderr = vec![
            "ffmpeg version 6.1 Copyright (c) 2000-2024".to_string(),
            "configuration: --enable-gpl".to_string(),
            "libavutil      58. 29.100 / 58. 29.100".to_string(),
            "Input #0, matroska,webm, from 'movie.mkv':".to_string(),
        ];
        assert!(residual_errors(&stderr).is_empty());
    }

    #[test]
    fn real_error_lines_survive_the_benign_filter() {
        let stderr = vec![
            "configuration: --enable-gpl".to_string(),
            "[h264] Error splitting the input into NAL units.".to_string(),
        ];
        assert_eq!(residual_errors(&stderr).len(), 1);
    }
}
