//! Name-label utilities (spec §4.4): service-type validation/canonicalization,
//! RFC 6763 instance-name truncation, and legacy DNS-escape unescaping.
//!
//! These are pure functions with no broker state, grounded directly in
//! spec.md's boundary behaviors (§8) rather than in the teacher's own code
//! (the teacher has no mDNS label parsing of its own — `mdns-sd` does that
//! internally). Hand-written rather than regex-based: the grammar is small
//! and fixed, and the teacher's own parsing (`protocol.rs`'s length-prefixed
//! framing) favors explicit byte-level state machines over pulling in a
//! regex engine for a handful of fixed rules.

use tracing::warn;

/// Max UTF-8 bytes for an instance name (RFC 6763).
pub const MAX_LABEL_LENGTH: usize = 63;

/// Fast-path codepoint bound: 63 bytes / 4 bytes-per-codepoint (UTF-8 max).
const FAST_PATH_CODEPOINTS: usize = MAX_LABEL_LENGTH / 4;

/// Validates a label of the form `_[a-zA-Z0-9_-]{1,61}[a-zA-Z0-9]`.
fn is_valid_label(label: &str) -> bool {
    let Some(rest) = label.strip_prefix('_') else {
        return false;
    };
    // rest = middle(1..=61 chars) + final(1 alnum char)
    if rest.len() < 2 || rest.len() > 62 {
        return false;
    }
    if !rest.is_ascii() {
        return false;
    }
    let bytes = rest.as_bytes();
    let final_char = bytes[bytes.len() - 1] as char;
    if !final_char.is_ascii_alphanumeric() {
        return false;
    }
    let middle = &rest[..rest.len() - 1];
    middle
        .bytes()
        .all(|b| (b as char).is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn proto_label(label: &str) -> Option<&'static str> {
    match label {
        "_tcp" => Some("_tcp"),
        "_udp" => Some("_udp"),
        _ => None,
    }
}

/// Validates a service type against `(_L\.)?(_L\._(tcp|udp))` and returns its
/// canonical form. A leading subtype label is rewritten to
/// `<subtype>._sub.<type>._proto` (spec §4.4, §8 boundary example).
///
/// Returns `None` on any rejection; callers translate that to
/// [`crate::error::NsdError::BadParameters`] (register/resolve) or
/// [`crate::error::NsdError::Internal`] (discover, per spec §4.5).
pub fn validate_service_type(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let labels: Vec<&str> = raw.split('.').collect();
    match labels.as_slice() {
        [type_label, proto] => {
            if is_valid_label(type_label) && proto_label(proto).is_some() {
                Some(raw.to_string())
            } else {
                None
            }
        }
        [subtype_label, type_label, proto] => {
            if is_valid_label(subtype_label) && is_valid_label(type_label) && proto_label(proto).is_some()
            {
                Some(format!("{subtype_label}._sub.{type_label}.{proto}"))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Truncates an instance name to at most 63 UTF-8 bytes, never splitting a
/// codepoint. Fast path: names with at most 15 codepoints are always within
/// the byte budget (15 * 4 = 60 <= 63) and are returned unchanged.
pub fn truncate_instance_name(name: &str) -> String {
    if name.chars().count() <= FAST_PATH_CODEPOINTS {
        return name.to_string();
    }
    if name.len() <= MAX_LABEL_LENGTH {
        return name.to_string();
    }
    let mut end = 0;
    for (idx, ch) in name.char_indices() {
        if idx + ch.len_utf8() > MAX_LABEL_LENGTH {
            break;
        }
        end = idx + ch.len_utf8();
    }
    name[..end].to_string()
}

/// Unescapes a legacy-daemon full name up to (and not including) the first
/// unescaped `.`, returning `(instance_name, rest)`. `rest` still contains
/// the service type and trailing domain, e.g. `"_foo._tcp.local."`.
///
/// A backslash followed by `.` or `\` is a literal byte; a backslash
/// followed by exactly three decimal digits is a decimal-encoded byte.
/// Any other escape, or a backslash with fewer than the required following
/// bytes, is a malformed/truncated sequence: logged and parsing stops,
/// returning `None`.
pub fn unescape_full_name(full: &str) -> Option<(String, String)> {
    let bytes = full.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                let instance = String::from_utf8(out).ok()?;
                return Some((instance, full[i + 1..].to_string()));
            }
            b'\\' => {
                if i + 1 >= bytes.len() {
                    warn!(full, "truncated escape sequence at end of full name");
                    return None;
                }
                match bytes[i + 1] {
                    b'.' | b'\\' => {
                        out.push(bytes[i + 1]);
                        i += 2;
                    }
                    d if d.is_ascii_digit() => {
                        if i + 4 > bytes.len() {
                            warn!(full, "truncated decimal escape sequence");
                            return None;
                        }
                        let digits = &bytes[i + 1..i + 4];
                        if !digits.iter().all(u8::is_ascii_digit) {
                            warn!(full, "malformed decimal escape sequence");
                            return None;
                        }
                        let value: u32 = std::str::from_utf8(digits).ok()?.parse().ok()?;
                        if value > 255 {
                            warn!(full, value, "decimal escape out of byte range");
                            return None;
                        }
                        out.push(value as u8);
                        i += 4;
                    }
                    other => {
                        warn!(full, escaped = other as char, "unrecognized escape sequence");
                        return None;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    warn!(full, "no unescaped '.' boundary found in full name");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_type_accepted_as_is() {
        assert_eq!(
            validate_service_type("_foo._tcp").as_deref(),
            Some("_foo._tcp")
        );
    }

    #[test]
    fn subtype_is_canonicalized() {
        assert_eq!(
            validate_service_type("_bar._foo._tcp").as_deref(),
            Some("_bar._sub._foo._tcp")
        );
    }

    #[test]
    fn empty_string_rejected() {
        assert_eq!(validate_service_type(""), None);
    }

    #[test]
    fn non_tcp_udp_proto_rejected() {
        assert_eq!(validate_service_type("_foo._sctp"), None);
    }

    #[test]
    fn too_many_labels_rejected() {
        assert_eq!(validate_service_type("_a._b._c._tcp"), None);
    }

    #[test]
    fn label_without_leading_underscore_rejected() {
        assert_eq!(validate_service_type("foo._tcp"), None);
    }

    #[test]
    fn truncate_short_ascii_unchanged() {
        assert_eq!(truncate_instance_name("Printer"), "Printer");
    }

    #[test]
    fn truncate_long_ascii_to_63_bytes() {
        let name: String = std::iter::repeat('a').take(100).collect();
        let truncated = truncate_instance_name(&name);
        assert_eq!(truncated.len(), 63);
    }

    #[test]
    fn truncate_respects_codepoint_boundaries() {
        // 20 four-byte codepoints (80 bytes) must truncate to <= 63 bytes
        // without splitting the last codepoint.
        let name: String = std::iter::repeat('\u{1F600}').take(20).collect();
        let truncated = truncate_instance_name(&name);
        assert!(truncated.len() <= 63);
        assert!(truncated.chars().all(|c| c == '\u{1F600}'));
        assert_eq!(truncated.len() % 4, 0);
    }

    #[test]
    fn unescape_space_and_boundary() {
        let (instance, rest) = unescape_full_name("Svc\\032Name._foo._tcp.local.").unwrap();
        assert_eq!(instance, "Svc Name");
        assert_eq!(rest, "_foo._tcp.local.");
    }

    #[test]
    fn unescape_literal_backslash_and_dot() {
        let (instance, rest) = unescape_full_name("A\\.B\\\\C._x._tcp.local.").unwrap();
        assert_eq!(instance, "A.B\\C");
        assert_eq!(rest, "_x._tcp.local.");
    }

    #[test]
    fn unescape_truncated_sequence_returns_none() {
        assert_eq!(unescape_full_name("Svc\\0._foo._tcp.local."), None);
    }

    #[test]
    fn unescape_no_boundary_returns_none() {
        assert_eq!(unescape_full_name("NoDotsHere"), None);
    }
}
