//! Internal helper macros.

/// Returns `Err($error)` early unless `$predicate` holds.
///
/// Used by the framer for limits and header validation:
///
/// ```ignore
/// ensure!(head_size <= MAX_HEADER_BYTES, ParseError::too_large_header(head_size, MAX_HEADER_BYTES));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
