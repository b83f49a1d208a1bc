use std::io;

pub trait IoResultExt {
    fn ignore(self, kind: io::ErrorKind) -> Self;
}

impl IoResultExt for io::Result<()> {
    fn ignore(self, kind: io::ErrorKind) -> io::Result<()> {
        match self {
            Err(e) => {
                if e.kind() == kind {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Ok(()) => Ok(()),
        }
    }
}

// First 8 hex characters of a fingerprint, used when synthesizing a
// describedSystemVersion.version (see document.rs). Mirrors the "unknown"
// fallback when there's no fingerprint at all (local mode, first ever request).
pub fn short_hex(fingerprint: Option<&str>) -> String {
    match fingerprint {
        Some(f) => {
            let hex_only: String = f.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            if hex_only.len() >= 8 {
                hex_only[..8].to_owned()
            } else {
                "unknown".to_owned()
            }
        }
        None => "unknown".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hex_truncates() {
        assert_eq!(short_hex(Some("abcdef0123456789")), "abcdef01");
    }

    #[test]
    fn short_hex_missing_is_unknown() {
        assert_eq!(short_hex(None), "unknown");
    }

    #[test]
    fn short_hex_remote_fingerprint_stops_at_colon() {
        // Remote fingerprints look like "<sha>:<subpath>" - non-hex subpath
        // characters must not leak into the truncated prefix.
        assert_eq!(short_hex(Some("deadbeef12:.")), "deadbeef");
    }
}
