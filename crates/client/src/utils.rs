//! Internal helper macros.

/// Returns early with `$error` unless `$predicate` holds.
///
/// Like `assert!`, but for validation that must surface as an error instead of a panic.
///
/// ```ignore
/// ensure!(src.len() <= self.max_header_size, ParseError::too_large_header(src.len(), self.max_header_size));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
