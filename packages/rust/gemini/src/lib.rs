//! GEMINI2 / ISO19139 document parsing and validation.
//!
//! Turns retrieved bytes into document text ([`decode_document`]), reads the
//! canonical field map ([`parse`]) and checks documents against configured
//! profiles ([`Validators`]).

pub mod decode;
pub mod document;
pub mod validation;
pub mod xpath;

use chrono::NaiveDateTime;
use tracing::{debug, instrument};

use geoharvest_shared::{HarvestError, ParsedFields, Result};

pub use decode::{Decoded, decode_document, strip_xml_declaration};
pub use document::{
    GeminiDocument, MAX_TAG_LENGTH, find_all_metadata, find_metadata, parse_metadata_date,
    truncate_tag,
};
pub use validation::{Gemini2Profile, Iso19139Profile, ValidationProfile, Validators};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse raw document bytes into the canonical field map.
pub fn parse(raw: &[u8]) -> Result<ParsedFields> {
    let decoded = decode_document(raw)?;
    parse_text(&decoded.text)
}

/// Parse already decoded document text into the canonical field map.
#[instrument(skip_all, fields(len = text.len()))]
pub fn parse_text(text: &str) -> Result<ParsedFields> {
    let doc = parse_tree(text)?;
    let gemini = GeminiDocument::from_tree(&doc)?;
    let fields = gemini.read_values();
    debug!(guid = fields.text("guid"), "document parsed");
    Ok(fields)
}

/// The metadata modification date of a parsed document.
pub fn metadata_modified(fields: &ParsedFields) -> Result<NaiveDateTime> {
    let value = fields.text("metadata-date");
    parse_metadata_date(value).ok_or_else(|| HarvestError::MissingReferenceDate {
        guid: fields.text("guid").to_string(),
        value: value.to_string(),
    })
}

fn parse_tree(text: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(text)
        .map_err(|e| HarvestError::parse(format!("could not parse XML: {e}")))
}

// ---------------------------------------------------------------------------
// Extraction from containers
// ---------------------------------------------------------------------------

/// Cut the first `gmd:MD_Metadata` element out of `text` as a standalone
/// document, carrying the namespace declarations it inherits.
pub fn extract_metadata(text: &str) -> Result<String> {
    let doc = parse_tree(text)?;
    let node = find_metadata(&doc)
        .ok_or_else(|| HarvestError::parse("no gmd:MD_Metadata element found"))?;
    Ok(standalone(text, node))
}

/// Cut every top-level `gmd:MD_Metadata` element out of `text`.
pub fn extract_all_metadata(text: &str) -> Result<Vec<String>> {
    let doc = parse_tree(text)?;
    Ok(find_all_metadata(&doc)
        .into_iter()
        .map(|node| standalone(text, node))
        .collect())
}

fn standalone(text: &str, node: roxmltree::Node<'_, '_>) -> String {
    let element = &text[node.range()];
    let start_tag = element.split('>').next().unwrap_or(element);
    let name_end = element
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(element.len());

    let mut declarations = String::new();
    for ns in node.namespaces() {
        let attr = match ns.name() {
            Some("xml") => continue,
            Some(prefix) => format!("xmlns:{prefix}"),
            None => "xmlns".to_string(),
        };
        if declares(start_tag, &attr) {
            continue;
        }
        declarations.push_str(&format!(" {attr}=\"{}\"", ns.uri()));
    }

    format!("{}{}{}", &element[..name_end], declarations, &element[name_end..])
}

fn declares(start_tag: &str, attr: &str) -> bool {
    start_tag.match_indices(attr).any(|(i, _)| {
        let rest = start_tag[i + attr.len()..].trim_start();
        let before_ok = start_tag[..i].ends_with(char::is_whitespace);
        before_ok && rest.starts_with('=')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> Vec<u8> {
        std::fs::read(format!("../../../fixtures/xml/{name}")).unwrap()
    }

    #[test]
    fn parses_dataset_fixture() {
        let fields = parse(&fixture("gemini_dataset.xml")).unwrap();
        assert_eq!(fields.text("guid"), "test-dataset-1");
        assert_eq!(fields.text("title"), "Thames Flood Zones");
        assert_eq!(fields.text("resource-type"), "dataset");
        assert_eq!(fields.text("metadata-date"), "2011-09-23T10:06:08");
        assert_eq!(fields.text("bbox-west-long"), "-1.5");
        assert_eq!(fields.text("bbox-north-lat"), "52.0");
        assert_eq!(fields.list("use-constraints"), vec!["Reference Only", "http://x/licence"]);
        assert_eq!(fields.list("limitations-on-public-access"), vec!["no limitations"]);

        let parties = fields.records("responsible-organisation");
        assert_eq!(parties.len(), 3);
        assert_eq!(parties[0]["organisation-name"], "Environment Agency");
        assert_eq!(parties[0]["role"], "owner");

        let locators = fields.records("resource-locator");
        assert_eq!(locators.len(), 2);
        assert_eq!(locators[0]["url"], "http://example.com/flood-zones.zip");

        assert_eq!(fields.list("keyword-inspire-theme"), vec!["Natural risk zones"]);
        assert!(fields.list("tags").iter().all(|t| t.chars().count() <= MAX_TAG_LENGTH));
        assert!(fields.list("tags").iter().any(|t| t.chars().count() == MAX_TAG_LENGTH));
        assert_eq!(fields.list("temporal-extent-begin"), vec!["2010-01-01"]);
    }

    #[test]
    fn parses_service_fixture() {
        let fields = parse(&fixture("gemini_service.xml")).unwrap();
        assert_eq!(fields.text("resource-type"), "service");
        assert_eq!(fields.text("spatial-data-service-type"), "view");
        let coupled = fields.records("coupled-resource");
        assert_eq!(coupled.len(), 1);
        assert!(coupled[0]["href"].contains("id=test-dataset-1"));
    }

    #[test]
    fn missing_fields_read_empty() {
        let xml = br#"<gmd:MD_Metadata xmlns:gmd="http://www.isotc211.org/2005/gmd"/>"#;
        let fields = parse(xml).unwrap();
        assert_eq!(fields.text("title"), "");
        assert!(fields.list("tags").is_empty());
        assert!(fields.records("resource-locator").is_empty());
    }

    #[test]
    fn malformed_xml_is_error() {
        let err = parse(b"<gmd:MD_Metadata").unwrap_err();
        assert!(matches!(err, HarvestError::MalformedDocument { .. }));
    }

    #[test]
    fn metadata_modified_requires_known_format() {
        let mut fields = ParsedFields::new();
        fields.insert("guid", geoharvest_shared::FieldValue::Text("g".into()));
        fields.insert(
            "metadata-date",
            geoharvest_shared::FieldValue::Text("Sept 2011".into()),
        );
        let err = metadata_modified(&fields).unwrap_err();
        assert!(matches!(err, HarvestError::MissingReferenceDate { .. }));
    }

    #[test]
    fn extracts_from_csw_response_with_namespaces() {
        let text = String::from_utf8(fixture("csw_record_by_id.xml")).unwrap();
        let extracted = extract_metadata(&text).unwrap();
        assert!(extracted.starts_with("<gmd:MD_Metadata"));
        // The cut-out document parses on its own.
        let fields = parse_text(&extracted).unwrap();
        assert_eq!(fields.text("guid"), "test-dataset-1");
    }

    #[test]
    fn does_not_duplicate_local_declarations() {
        let text = r#"<wrap xmlns:gco="http://www.isotc211.org/2005/gco"><gmd:MD_Metadata xmlns:gmd="http://www.isotc211.org/2005/gmd"><gmd:fileIdentifier><gco:CharacterString>x</gco:CharacterString></gmd:fileIdentifier></gmd:MD_Metadata></wrap>"#;
        let extracted = extract_metadata(text).unwrap();
        assert_eq!(extracted.matches("xmlns:gmd=").count(), 1);
        assert_eq!(extracted.matches("xmlns:gco=").count(), 1);
        assert_eq!(parse_text(&extracted).unwrap().text("guid"), "x");
    }

    #[test]
    fn extract_all_from_static_batch() {
        let text = String::from_utf8(fixture("csw_static_batch.xml")).unwrap();
        let docs = extract_all_metadata(&text).unwrap();
        assert_eq!(docs.len(), 2);
    }
}
