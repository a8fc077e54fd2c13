//! Text representation of descriptors for storage.
//!
//! Format: `[0.123456,-0.654321,...]`, six fractional digits per value.

use crate::types::Descriptor;
use thiserror::Error;

const FRACTION_DIGITS: usize = 6;

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("invalid descriptor value at index {index}: {token:?}")]
    ParseError { index: usize, token: String },
}

/// Render a descriptor as bracketed comma-separated decimals.
pub fn encode(descriptor: &Descriptor) -> String {
    let body = descriptor
        .values()
        .iter()
        .map(|v| format!("{v:.prec$}", prec = FRACTION_DIGITS))
        .collect::<Vec<_>>()
        .join(",");
    format!("[{body}]")
}

/// Parse the text produced by [`encode`].
///
/// Blank content (`"[]"`, `""`) decodes to an empty descriptor. Any token that
/// is not a finite number fails the whole decode.
pub fn decode(text: &str) -> Result<Descriptor, CodecError> {
    let inner = text.trim();
    let inner = inner.strip_prefix('[').unwrap_or(inner);
    let inner = inner.strip_suffix(']').unwrap_or(inner);

    if inner.trim().is_empty() {
        return Ok(Descriptor::new(Vec::new()));
    }

    let values = inner
        .split(',')
        .enumerate()
        .map(|(index, token)| {
            let token = token.trim();
            token
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| CodecError::ParseError {
                    index,
                    token: token.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Descriptor::new(values))
}

/// Decode stored text, treating malformed input as "not comparable".
///
/// Used while sweeping the gallery: a corrupt record must not abort the sweep.
pub fn decode_lenient(text: &str) -> Option<Descriptor> {
    match decode(text) {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            tracing::warn!(error = %e, "malformed stored descriptor, treating as not comparable");
            None
        }
    }
}
