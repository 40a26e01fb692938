//! Turning retrieved bytes into document text.
//!
//! GEMINI2 documents are assumed to be UTF-8 unless the XML declaration says
//! otherwise. The declaration itself is stripped before storing so that the
//! stored text is encoding-neutral.

use std::sync::LazyLock;

use geoharvest_shared::{HarvestError, Result};
use regex::Regex;

/// Leading `<?xml ... ?>` declaration.
static DECLARATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*<\?xml.*?\?>").expect("declaration regex"));

/// `encoding="..."` inside a declaration.
static ENCODING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"encoding\s*=\s*["']([A-Za-z0-9._-]+)["']"#).expect("encoding regex")
});

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Decoded document text plus the encoding it was read as.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub text: String,
    pub encoding: String,
}

/// Decode raw bytes using the declared encoding and strip the declaration.
pub fn decode_document(raw: &[u8]) -> Result<Decoded> {
    let raw = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);

    let head = String::from_utf8_lossy(&raw[..raw.len().min(256)]);
    let declared = DECLARATION_RE
        .find(&head)
        .and_then(|decl| ENCODING_RE.captures(decl.as_str()))
        .map(|caps| caps[1].to_ascii_lowercase());

    let (text, encoding) = match declared.as_deref() {
        None | Some("utf-8") | Some("utf8") | Some("ascii") | Some("us-ascii") => {
            let text = String::from_utf8(raw.to_vec())
                .map_err(|e| HarvestError::parse(format!("document is not valid UTF-8: {e}")))?;
            (text, "utf-8".to_string())
        }
        Some("iso-8859-1") | Some("iso8859-1") | Some("latin1") | Some("latin-1") => {
            (raw.iter().map(|&b| b as char).collect(), "iso-8859-1".to_string())
        }
        Some(other) => {
            return Err(HarvestError::parse(format!(
                "unsupported document encoding '{other}'"
            )));
        }
    };

    Ok(Decoded {
        text: strip_xml_declaration(&text).trim().to_string(),
        encoding,
    })
}

/// Remove a leading XML declaration, if present.
pub fn strip_xml_declaration(text: &str) -> &str {
    match DECLARATION_RE.find(text) {
        Some(m) => &text[m.end()..],
        None => text,
    }
}
