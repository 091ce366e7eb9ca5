use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Verdict on one finished transcode attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub processed: bool,
    pub output_size: Option<u64>,
    /// `input_size - output_size`, present whenever the output exists
    pub size_difference: Option<i64>,
}

/// An attempt counts as processed only if the encoder succeeded and left an
/// output strictly smaller than the input.
///
/// `output_size` is `None` when no output file exists.
pub fn evaluate(input_size: u64, output_size: Option<u64>, transcode_succeeded: bool) -> Outcome {
    let processed = transcode_succeeded && output_size.map(|out| out < input_size).unwrap_or(false);
    Outcome {
        processed,
        output_size,
        size_difference: output_size.map(|out| input_size as i64 - out as i64),
    }
}

impl Outcome {
    pub fn bytes_saved(&self) -> u64 {
        if self.processed {
            self.size_difference.unwrap_or(0).max(0) as u64
        } else {
            0
        }
    }
}

/// Remove the input of a processed job
///
/// Call only after the ledger entry for the input has been durably
/// recorded.
pub fn delete_input(input: &Path) -> Result<()> {
    fs::remove_file(input).with_context(|| format!("Failed to delete input file: {}", input.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_smaller_output_is_processed() {
        let o = evaluate(1000, Some(800), true);
        assert!(o.processed);
        assert_eq!(o.size_difference, Some(200));
        assert_eq!(o.bytes_saved(), 200);
    }

    #[test]
    fn test_larger_output_is_not_processed() {
        let o = evaluate(1000, Some(1200), true);
        assert!(!o.processed);
        assert_eq!(o.size_difference, Some(-200));
        assert_eq!(o.bytes_saved(), 0);
    }

    #[test]
    fn test_missing_output_is_not_processed() {
        let o = evaluate(1000, None, true);
        assert!(!o.processed);
        assert_eq!(o.size_difference, None);
    }

    #[test]
    fn test_equal_size_is_not_processed() {
        assert!(!evaluate(1000, Some(1000), true).processed);
    }

    #[test]
    fn test_delete_input_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.mkv");
        fs::write(&path, b"old").unwrap();
        delete_input(&path).unwrap();
        assert!(!path.exists());
        assert!(delete_input(&path).is_err());
    }

    proptest! {
        #[test]
        fn test_failed_transcode_never_processed(input in any::<u32>(), output in proptest::option::of(any::<u32>())) {
            let o = evaluate(input as u64, output.map(u64::from), false);
            prop_assert!(!o.processed);
        }

        #[test]
        fn test_processed_iff_strictly_smaller(input in any::<u32>(), output in any::<u32>()) {
            let o = evaluate(input as u64, Some(output as u64), true);
            prop_assert_eq!(o.processed, output < input);
            prop_assert_eq!(o.size_difference, Some(input as i64 - output as i64));
        }
    }
}
