//! Fragment location naming.
//!
//! Locations come from a user callback when one is installed. Otherwise the
//! configured pattern is expanded with the fragment index using printf-style
//! integer conversions:
//!
//! - `%d`, `%i`, `%u` - decimal index
//! - `%x`, `%X` - hexadecimal index
//! - `%05d`, `%5d`, `%-5d` - zero-padded, space-padded and left-aligned widths
//! - `%ld`, `%lu`, `%zu`, ... - length modifiers are accepted and ignored
//! - `%%` - literal percent sign

use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::Sample;

/// Callback naming a fragment from its index and the first reference buffer.
///
/// Returning `None` falls back to the location pattern.
pub type FormatLocationFn = Arc<dyn Fn(u32, &Sample) -> Option<PathBuf> + Send + Sync>;

/// Expands `pattern` with `index`.
pub fn format_location(pattern: &str, index: u32) -> String {
    let mut result = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }

        let mut spec = String::from("%");
        let mut zero_pad = false;
        let mut left_align = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '0' if !zero_pad => zero_pad = true,
                '-' => left_align = true,
                _ => break,
            }
            spec.push(flag);
            chars.next();
        }

        let mut width = 0usize;
        while let Some(&digit) = chars.peek() {
            let Some(value) = digit.to_digit(10) else {
                break;
            };
            width = width.saturating_mul(10).saturating_add(value as usize);
            spec.push(digit);
            chars.next();
        }

        while let Some(&modifier) = chars.peek() {
            if !matches!(modifier, 'l' | 'h' | 'z' | 'j' | 't') {
                break;
            }
            spec.push(modifier);
            chars.next();
        }

        let digits = match chars.peek() {
            Some('d' | 'i' | 'u') => index.to_string(),
            Some('x') => format!("{index:x}"),
            Some('X') => format!("{index:X}"),
            Some('%') if spec.len() == 1 => {
                chars.next();
                result.push('%');
                continue;
            }
            // Unrecognized conversion, keep it literally
            _ => {
                result.push_str(&spec);
                continue;
            }
        };
        chars.next();

        if left_align {
            result.push_str(&format!("{digits:<width$}"));
        } else if zero_pad {
            result.push_str(&format!("{digits:0>width$}"));
        } else {
            result.push_str(&format!("{digits:>width$}"));
        }
    }

    result
}
