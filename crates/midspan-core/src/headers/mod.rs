//! Header transformations applied as requests and responses cross the
//! proxy.
//!
//! All functions operate on [`http::HeaderMap`] and take explicit inputs
//! (addresses, config, times) so they stay pure and testable.

pub mod forwarded;
pub mod transform;
pub mod via;

/// How much of the protocol stack a Via/Forwarded parameter prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStackDetail {
    /// Shortest tags, joined without separators
    Compact,
    /// Standard tags, space separated
    Standard,
    /// Every tag, including transport layers
    Full,
}

/// Render a protocol stack (outermost first) at the requested detail.
///
/// `separator` joins the tags for Forwarded (`-`); Via uses the standard
/// form with `/` only where HTTP versions appear.
#[must_use]
pub fn write_protocol_stack(
    detail: ProtocolStackDetail,
    stack: &[&str],
    separator: char,
) -> String {
    match detail {
        ProtocolStackDetail::Compact => {
            // Single-letter tags: http/1.1 -> h1, http/2 -> h2, tls -> T
            let mut out = String::new();
            for tag in stack {
                let compact = match *tag {
                    "http/1.0" => "h0",
                    "http/1.1" => "h1",
                    "h2" | "http/2" => "h2",
                    "h3" | "http/3" => "h3",
                    "tls/1.2" | "tls/1.3" | "tls" => "T",
                    other => other.get(..1).unwrap_or(""),
                };
                out.push_str(compact);
            }
            out
        }
        ProtocolStackDetail::Standard => stack
            .iter()
            .filter(|tag| tag.starts_with("http") || **tag == "h2" || **tag == "h3")
            .copied()
            .collect::<Vec<_>>()
            .join(&separator.to_string()),
        ProtocolStackDetail::Full => stack.join(&separator.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_stack() {
        assert_eq!(
            write_protocol_stack(
                ProtocolStackDetail::Compact,
                &["http/1.1", "tls/1.3", "tcp"],
                '-'
            ),
            "h1Tt"
        );
    }

    #[test]
    fn standard_stack_keeps_http_layers() {
        assert_eq!(
            write_protocol_stack(
                ProtocolStackDetail::Standard,
                &["http/1.1", "tls/1.3", "tcp"],
                ' '
            ),
            "http/1.1"
        );
    }

    #[test]
    fn full_stack_keeps_everything() {
        assert_eq!(
            write_protocol_stack(ProtocolStackDetail::Full, &["h2", "tls/1.3", "tcp"], '-'),
            "h2-tls/1.3-tcp"
        );
    }
}
