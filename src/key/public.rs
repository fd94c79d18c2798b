//! Public-key presentation: fingerprints, randomart, authorized-keys lines.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

/// How to render a key fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FingerprintFormat {
    /// `SHA256:<unpadded base64>`, the OpenSSH default.
    #[default]
    Sha256Base64,

    /// Lowercase hex of the SHA-256 digest.
    Sha256Hex,
}

fn digest(blob: &[u8]) -> [u8; 32] {
    Sha256::digest(blob).into()
}

/// SHA-256 fingerprint of a public-key blob.
pub fn fingerprint(blob: &[u8], format: FingerprintFormat) -> String {
    let digest = digest(blob);
    match format {
        FingerprintFormat::Sha256Hex => {
            let mut hex = String::with_capacity(digest.len() * 2);
            for byte in digest {
                hex.push_str(&format!("{byte:02x}"));
            }
            hex
        }
        FingerprintFormat::Sha256Base64 => {
            let mut b64 = BASE64.encode(digest);
            while b64.ends_with('=') {
                b64.pop();
            }
            format!("SHA256:{b64}")
        }
    }
}

/// The `authorized_keys` line for a public-key blob.
pub fn authorized_key_line(key_type: &str, blob: &[u8], comment: &str) -> String {
    format!("{key_type} {} {comment}", BASE64.encode(blob))
}

const FLDBASE: usize = 8;
const FLDSIZE_Y: usize = FLDBASE + 1;
const FLDSIZE_X: usize = FLDBASE * 2 + 1;

/// OpenSSH "drunken bishop" visual host key.
///
/// Returns the framed rows, header first. The walk follows the classic
/// algorithm: each digest byte moves the bishop four times, two bits per
/// step, and the visit count of every cell picks its symbol.
pub fn randomart(blob: &[u8], family: &str, bits: usize) -> Vec<String> {
    const SYMBOLS: &[u8] = b" .o+=*BOX@%&#/^";

    let mut grid = [[0usize; FLDSIZE_X]; FLDSIZE_Y];
    let mut x = FLDSIZE_X / 2;
    let mut y = FLDSIZE_Y / 2;

    for byte in digest(blob) {
        let mut input = byte;
        for _ in 0..4 {
            x = if input & 0x1 != 0 {
                (x + 1).min(FLDSIZE_X - 1)
            } else {
                x.saturating_sub(1)
            };
            y = if input & 0x2 != 0 {
                (y + 1).min(FLDSIZE_Y - 1)
            } else {
                y.saturating_sub(1)
            };
            if grid[y][x] < SYMBOLS.len() - 2 {
                grid[y][x] += 1;
            }
            input >>= 2;
        }
    }

    let mut rows = Vec::with_capacity(FLDSIZE_Y + 2);

    let label = format!("[{family} {bits}]");
    let front_pad = (FLDSIZE_X.saturating_sub(label.len())) / 2;
    let back_pad = FLDSIZE_X.saturating_sub(label.len()) - front_pad;
    rows.push(format!(
        "+{}{label}{}+",
        "-".repeat(front_pad),
        "-".repeat(back_pad)
    ));

    for (row, cells) in grid.iter().enumerate() {
        let mut line = String::with_capacity(FLDSIZE_X + 2);
        line.push('|');
        for (col, &count) in cells.iter().enumerate() {
            if row == FLDSIZE_Y / 2 && col == FLDSIZE_X / 2 {
                line.push('S');
            } else if row == y && col == x {
                line.push('E');
            } else {
                line.push(SYMBOLS[count] as char);
            }
        }
        line.push('|');
        rows.push(line);
    }

    rows.push("+----[SHA256]-----+".to_string());
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_formats() {
        // SHA-256 of the empty input is a well-known vector.
        let b64 = fingerprint(b"", FingerprintFormat::Sha256Base64);
        assert_eq!(b64, "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
        assert!(!b64.ends_with('='));

        let hex = fingerprint(b"", FingerprintFormat::Sha256Hex);
        assert_eq!(
            hex,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprints_differ_per_blob() {
        assert_ne!(
            fingerprint(b"a", FingerprintFormat::Sha256Base64),
            fingerprint(b"b", FingerprintFormat::Sha256Base64)
        );
    }

    #[test]
    fn authorized_key_line_shape() {
        let line = authorized_key_line("ssh-ed25519", &[1, 2, 3], "me@host");
        assert_eq!(line, "ssh-ed25519 AQID me@host");
    }

    #[test]
    fn randomart_frame_geometry() {
        let art = randomart(&[0xAB; 32], "ED25519", 256);
        assert_eq!(art.len(), FLDSIZE_Y + 2);
        for row in &art {
            assert_eq!(row.len(), FLDSIZE_X + 2, "row: {row}");
        }
        assert!(art[0].contains("[ED25519 256]"));
        assert_eq!(art.last().unwrap(), "+----[SHA256]-----+");
        // Start marker sits at the centre.
        let middle = &art[1 + FLDSIZE_Y / 2];
        assert_eq!(middle.as_bytes()[1 + FLDSIZE_X / 2], b'S');
    }

    #[test]
    fn randomart_is_deterministic() {
        assert_eq!(
            randomart(b"blob", "RSA", 3072),
            randomart(b"blob", "RSA", 3072)
        );
    }
}
