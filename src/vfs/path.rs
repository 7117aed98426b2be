//! Pathname grammar shared by every back-end.
//!
//! A pathname is a `file:` URI with an optional authority (ignored) and a
//! path, or a bare path. Both normalise to a leading-slash form, which is
//! the canonical name used as the substrate key and in lock names.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::vfs::{VfsError, VfsResult};

/// Normalise `input` to its canonical leading-slash form.
///
/// Accepts `file:` URIs (`file:data.db`, `file:///data.db`,
/// `file://host/data.db`) and bare paths. Query and fragment parts are
/// dropped; any other scheme is rejected.
pub fn normalize(input: &str) -> VfsResult<String> {
    let mut rest = input;
    if let Some(tail) = strip_scheme(rest) {
        rest = tail;
        if let Some(after) = rest.strip_prefix("//") {
            // authority is ignored; the path resumes at the next slash
            rest = match after.find('/') {
                Some(idx) => &after[idx..],
                None => "",
            };
        }
    } else if let Some(colon) = rest.find(':') {
        // a colon ahead of the first slash marks a scheme we do not speak
        if rest.find('/').map_or(true, |slash| colon < slash) {
            return Err(VfsError::CantOpen);
        }
    }

    let end = rest.find(['?', '#']).unwrap_or(rest.len());
    let path = &rest[..end];
    if path.is_empty() {
        return Err(VfsError::CantOpen);
    }

    if path.starts_with('/') {
        Ok(path.to_owned())
    } else {
        Ok(format!("/{path}"))
    }
}

fn strip_scheme(input: &str) -> Option<&str> {
    let tail = input.strip_prefix("file:")?;
    Some(tail)
}

/// Generate a unique name for an anonymous open.
pub fn anonymous() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().subsec_nanos();
    format!("/.anonymous/{seq:x}-{nanos:08x}")
}
