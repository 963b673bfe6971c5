// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Filename fitting and sanitation for the 16-byte Start trailer.
//!
//! The trailer holds at most [`MAX_PAYLOAD`] bytes of NUL-padded UTF-8, so
//! longer names are squeezed deterministically: the first 8 bytes of the
//! name, a `~`, and its last 7 bytes (never splitting a UTF-8 character).
//! The receiving side trusts nothing about the name and strips any path
//! components before using it.

use crate::MAX_PAYLOAD;

/// Fit a filename into the Start trailer.
///
/// Names of at most 16 bytes pass through unchanged. Longer names become
/// `first8~last7`. Multi-byte characters straddling a cut are dropped
/// rather than split, so the result may be slightly shorter than 16 bytes
/// but is always valid UTF-8.
pub fn wire_name(name: &str) -> String {
    if name.len() <= MAX_PAYLOAD {
        return name.to_owned();
    }
    let head_end = floor_char_boundary(name, 8);
    let tail_start = ceil_char_boundary(name, name.len() - 7);
    format!("{}~{}", &name[..head_end], &name[tail_start..])
}

/// Strip path components from a received name, keeping only the final
/// segment. Returns `None` if nothing usable remains (empty name, or a
/// name that is all separators/dots).
pub fn sanitize(name: &str) -> Option<String> {
    let base = name
        .rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())?;
    if base == "." || base == ".." {
        return None;
    }
    Some(base.to_owned())
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}
