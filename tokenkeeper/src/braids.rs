use aliri_braid::braid;
use std::fmt;

/// Implements `Debug` and `Display` so that secrets only show up in logs
/// when explicitly requested with the alternate flag (`{:#}`/`{:#?}`)
///
/// Even then, `Debug` only reveals a prefix, capped by the formatter width
/// or the given default.
macro_rules! redacted {
    ($ty:ty: $label:literal, $prefix:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    reveal_prefix(self.as_str(), &mut *f, $prefix)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("<", $label, ">"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    reveal_prefix(self.as_str(), &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("<", $label, ">"))
                }
            }
        }
    };
}

fn reveal_prefix(secret: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_chars = f.width().unwrap_or(default_len);
    if max_chars <= 1 {
        return f.write_str("…");
    }

    match secret.char_indices().nth(max_chars - 1) {
        Some((cut, _)) => {
            f.write_str(&secret[..cut])?;
            f.write_str("…")
        }
        None => f.write_str(secret),
    }
}

/// A client ID, used to identify this client to the issuing authority
#[braid(serde)]
pub struct ClientId;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

redacted!(ClientSecretRef: "client secret", 4);

/// A bearer access token as issued by the issuing authority
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "access token", 12);
