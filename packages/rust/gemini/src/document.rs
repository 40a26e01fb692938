//! GEMINI2 / ISO19139 field extraction.
//!
//! [`GeminiDocument`] reads the flat field map consumed by the import stage
//! from a `gmd:MD_Metadata` element.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use roxmltree::Node;

use geoharvest_shared::{FieldValue, HarvestError, ParsedFields, Result};

use crate::xpath::{self, first, first_of, select, select_first, values};

/// Tags longer than this are cut down on ingestion.
pub const MAX_TAG_LENGTH: usize = 50;

const METADATA_TAG: &str = "gmd:MD_Metadata";
const IDENT: &str = "gmd:identificationInfo/gmd:MD_DataIdentification|srv:SV_ServiceIdentification";
const CITATION: &str = "gmd:citation/gmd:CI_Citation";
const EXTENT: &str = "gmd:extent|srv:extent/gmd:EX_Extent";
const BBOX: &str = "gmd:geographicElement/gmd:EX_GeographicBoundingBox";
const STRING: &str = "gco:CharacterString|gmx:Anchor";

/// A parsed metadata document rooted at `gmd:MD_Metadata`.
pub struct GeminiDocument<'a, 'input> {
    root: Node<'a, 'input>,
}

impl<'a, 'input> GeminiDocument<'a, 'input> {
    /// Locate the `gmd:MD_Metadata` element: the root itself or its first descendant.
    pub fn from_tree(doc: &'a roxmltree::Document<'input>) -> Result<Self> {
        find_metadata(doc)
            .map(|root| Self { root })
            .ok_or_else(|| {
                HarvestError::parse(
                    "content is not a valid Gemini document without the gmd:MD_Metadata element",
                )
            })
    }

    /// Wrap an already located `gmd:MD_Metadata` element.
    pub fn from_node(root: Node<'a, 'input>) -> Self {
        Self { root }
    }

    pub fn node(&self) -> Node<'a, 'input> {
        self.root
    }

    /// The document's unique identifier, empty when absent.
    pub fn guid(&self) -> String {
        first(self.root, "gmd:fileIdentifier/gco:CharacterString")
    }

    /// Read every canonical field.
    pub fn read_values(&self) -> ParsedFields {
        let md = self.root;
        let ident = select_first(md, IDENT);
        let citation = ident.and_then(|i| select_first(i, CITATION));
        let extents: Vec<Node<'_, '_>> = ident.map(|i| select(i, EXTENT)).unwrap_or_default();

        let mut fields = ParsedFields::new();
        let text = |fields: &mut ParsedFields, key: &str, value: String| {
            fields.insert(key, FieldValue::Text(value));
        };

        text(&mut fields, "guid", self.guid());
        text(
            &mut fields,
            "metadata-language",
            first_of(
                md,
                &[
                    "gmd:language/gmd:LanguageCode/@codeListValue",
                    "gmd:language/gco:CharacterString",
                ],
            ),
        );
        text(
            &mut fields,
            "resource-type",
            first_of(
                md,
                &[
                    "gmd:hierarchyLevel/gmd:MD_ScopeCode/@codeListValue",
                    "gmd:hierarchyLevel/gmd:MD_ScopeCode",
                ],
            ),
        );
        text(
            &mut fields,
            "metadata-date",
            first(md, "gmd:dateStamp/gco:DateTime|gco:Date"),
        );
        text(
            &mut fields,
            "spatial-reference-system",
            first(
                md,
                &format!(
                    "gmd:referenceSystemInfo/gmd:MD_ReferenceSystem/gmd:referenceSystemIdentifier/gmd:RS_Identifier/gmd:code/{STRING}"
                ),
            ),
        );
        text(
            &mut fields,
            "contact-email",
            first(
                md,
                "gmd:contact/gmd:CI_ResponsibleParty/gmd:contactInfo/gmd:CI_Contact/gmd:address/gmd:CI_Address/gmd:electronicMailAddress/gco:CharacterString",
            ),
        );
        fields.insert(
            "metadata-point-of-contact",
            FieldValue::Records(
                select(md, "gmd:contact/gmd:CI_ResponsibleParty")
                    .into_iter()
                    .map(responsible_party)
                    .collect(),
            ),
        );

        // Citation
        let cite_text = |path: &str| citation.map(|c| first(c, path)).unwrap_or_default();
        text(&mut fields, "title", cite_text("gmd:title/gco:CharacterString"));
        text(
            &mut fields,
            "unique-resource-identifier",
            cite_text(&format!(
                "gmd:identifier/gmd:MD_Identifier|gmd:RS_Identifier/gmd:code/{STRING}"
            )),
        );
        fields.insert(
            "alternate-title",
            FieldValue::List(
                citation
                    .map(|c| values(c, "gmd:alternateTitle/gco:CharacterString"))
                    .unwrap_or_default(),
            ),
        );
        fields.insert(
            "dataset-reference-date",
            FieldValue::Records(
                citation
                    .map(|c| select(c, "gmd:date/gmd:CI_Date"))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|d| {
                        let mut rec = BTreeMap::new();
                        rec.insert(
                            "type".to_string(),
                            first_of(
                                d,
                                &[
                                    "gmd:dateType/gmd:CI_DateTypeCode/@codeListValue",
                                    "gmd:dateType/gmd:CI_DateTypeCode",
                                ],
                            ),
                        );
                        rec.insert("value".to_string(), first(d, "gmd:date/gco:Date|gco:DateTime"));
                        rec
                    })
                    .collect(),
            ),
        );

        // Identification
        let ident_text = |path: &str| ident.map(|i| first(i, path)).unwrap_or_default();
        let ident_list = |path: &str| ident.map(|i| values(i, path)).unwrap_or_default();

        text(&mut fields, "abstract", ident_text("gmd:abstract/gco:CharacterString"));
        text(&mut fields, "purpose", ident_text("gmd:purpose/gco:CharacterString"));
        text(
            &mut fields,
            "frequency-of-update",
            ident_text(
                "gmd:resourceMaintenance/gmd:MD_MaintenanceInformation/gmd:maintenanceAndUpdateFrequency/gmd:MD_MaintenanceFrequencyCode/@codeListValue",
            ),
        );
        text(
            &mut fields,
            "spatial-data-service-type",
            ident_text("srv:serviceType/gco:LocalName"),
        );
        text(
            &mut fields,
            "spatial-resolution",
            ident_text("gmd:spatialResolution/gmd:MD_Resolution/gmd:distance/gco:Distance"),
        );
        text(
            &mut fields,
            "additional-information-source",
            ident_text("gmd:supplementalInformation/gco:CharacterString"),
        );
        fields.insert(
            "equivalent-scale",
            FieldValue::List(ident_list(
                "gmd:spatialResolution/gmd:MD_Resolution/gmd:equivalentScale/gmd:MD_RepresentativeFraction/gmd:denominator/gco:Integer",
            )),
        );
        fields.insert(
            "dataset-language",
            FieldValue::List(ident_list("gmd:language/gmd:LanguageCode/@codeListValue")),
        );
        fields.insert(
            "topic-category",
            FieldValue::List(ident_list("gmd:topicCategory/gmd:MD_TopicCategoryCode")),
        );
        fields.insert(
            "responsible-organisation",
            FieldValue::Records(
                ident
                    .map(|i| select(i, "gmd:pointOfContact/gmd:CI_ResponsibleParty"))
                    .unwrap_or_default()
                    .into_iter()
                    .map(responsible_party)
                    .collect(),
            ),
        );

        // Keywords
        let keywords = ident
            .map(|i| select(i, "gmd:descriptiveKeywords/gmd:MD_Keywords"))
            .unwrap_or_default();
        let mut inspire = Vec::new();
        let mut controlled = Vec::new();
        let mut free_text = Vec::new();
        for block in keywords {
            let thesaurus = first(block, &format!("gmd:thesaurusName/gmd:CI_Citation/gmd:title/{STRING}"));
            let words = values(block, &format!("gmd:keyword/{STRING}"));
            if thesaurus.to_ascii_lowercase().contains("inspire") {
                inspire.extend(words);
            } else if !thesaurus.is_empty() {
                controlled.extend(words);
            } else {
                free_text.extend(words);
            }
        }
        let mut tags: Vec<String> = Vec::new();
        for word in inspire.iter().chain(&controlled).chain(&free_text) {
            let tag = truncate_tag(word);
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        fields.insert("keyword-inspire-theme", FieldValue::List(inspire));
        fields.insert("keyword-controlled-other", FieldValue::List(controlled));
        fields.insert("keyword-free-text", FieldValue::List(free_text));
        fields.insert("tags", FieldValue::List(tags));

        // Constraints
        let constraints = "gmd:resourceConstraints/gmd:MD_Constraints|gmd:MD_LegalConstraints";
        fields.insert(
            "use-constraints",
            FieldValue::List(ident_list(&format!(
                "{constraints}/gmd:useLimitation/gco:CharacterString"
            ))),
        );
        fields.insert(
            "use-constraints-anchor-href",
            FieldValue::List(ident_list(&format!(
                "{constraints}/gmd:useLimitation/gmx:Anchor/@xlink:href"
            ))),
        );
        fields.insert(
            "use-constraints-anchor-title",
            FieldValue::List(ident_list(&format!(
                "{constraints}/gmd:useLimitation/gmx:Anchor"
            ))),
        );
        fields.insert(
            "limitations-on-public-access",
            FieldValue::List(ident_list(&format!(
                "gmd:resourceConstraints/gmd:MD_LegalConstraints/gmd:otherConstraints/{STRING}"
            ))),
        );

        // Extent
        let extent_first = |path: &str| {
            extents
                .iter()
                .map(|e| first(*e, path))
                .find(|v| !v.is_empty())
                .unwrap_or_default()
        };
        let extent_all = |path: &str| {
            extents
                .iter()
                .flat_map(|e| values(*e, path))
                .collect::<Vec<_>>()
        };
        for (key, element) in [
            ("bbox-west-long", "westBoundLongitude"),
            ("bbox-east-long", "eastBoundLongitude"),
            ("bbox-south-lat", "southBoundLatitude"),
            ("bbox-north-lat", "northBoundLatitude"),
        ] {
            text(
                &mut fields,
                key,
                extent_first(&format!("{BBOX}/gmd:{element}/gco:Decimal")),
            );
        }
        fields.insert(
            "extent-free-text",
            FieldValue::List(extent_all(&format!(
                "gmd:geographicElement/gmd:EX_GeographicDescription/gmd:geographicIdentifier/gmd:MD_Identifier/gmd:code/{STRING}"
            ))),
        );
        let period = "gmd:temporalElement/gmd:EX_TemporalExtent/gmd:extent/gml:TimePeriod";
        fields.insert(
            "temporal-extent-begin",
            FieldValue::List(extent_all(&format!("{period}/gml:beginPosition"))),
        );
        fields.insert(
            "temporal-extent-end",
            FieldValue::List(extent_all(&format!("{period}/gml:endPosition"))),
        );

        // Services
        fields.insert(
            "coupled-resource",
            FieldValue::Records(
                ident
                    .map(|i| select(i, "srv:operatesOn"))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|op| {
                        let mut rec = BTreeMap::new();
                        rec.insert("href".to_string(), first(op, "@xlink:href"));
                        rec.insert("uuid".to_string(), first(op, "@uuidref"));
                        rec.insert("title".to_string(), first(op, "@xlink:title"));
                        rec
                    })
                    .collect(),
            ),
        );

        // Distribution
        let distribution = "gmd:distributionInfo/gmd:MD_Distribution";
        fields.insert(
            "data-format",
            FieldValue::Records(
                select(md, &format!("{distribution}/gmd:distributionFormat/gmd:MD_Format"))
                    .into_iter()
                    .map(|f| {
                        let mut rec = BTreeMap::new();
                        rec.insert("name".to_string(), first(f, "gmd:name/gco:CharacterString"));
                        rec.insert(
                            "version".to_string(),
                            first(f, "gmd:version/gco:CharacterString"),
                        );
                        rec
                    })
                    .collect(),
            ),
        );
        fields.insert(
            "resource-locator",
            FieldValue::Records(
                select(
                    md,
                    &format!(
                        "{distribution}/gmd:transferOptions/gmd:MD_DigitalTransferOptions/gmd:onLine/gmd:CI_OnlineResource"
                    ),
                )
                .into_iter()
                .map(|r| {
                    let mut rec = BTreeMap::new();
                    rec.insert("url".to_string(), first(r, "gmd:linkage/gmd:URL"));
                    rec.insert(
                        "function".to_string(),
                        first(r, "gmd:function/gmd:CI_OnLineFunctionCode/@codeListValue"),
                    );
                    rec.insert("name".to_string(), first(r, "gmd:name/gco:CharacterString"));
                    rec.insert(
                        "description".to_string(),
                        first(r, "gmd:description/gco:CharacterString"),
                    );
                    rec.insert(
                        "protocol".to_string(),
                        first(r, "gmd:protocol/gco:CharacterString"),
                    );
                    rec
                })
                .collect(),
            ),
        );

        text(
            &mut fields,
            "lineage",
            first(
                md,
                "gmd:dataQualityInfo/gmd:DQ_DataQuality/gmd:lineage/gmd:LI_Lineage/gmd:statement/gco:CharacterString",
            ),
        );

        fields
    }
}

fn responsible_party(party: Node<'_, '_>) -> BTreeMap<String, String> {
    let mut rec = BTreeMap::new();
    rec.insert(
        "organisation-name".to_string(),
        first(party, &format!("gmd:organisationName/{STRING}")),
    );
    rec.insert(
        "individual-name".to_string(),
        first(party, "gmd:individualName/gco:CharacterString"),
    );
    rec.insert(
        "position-name".to_string(),
        first(party, "gmd:positionName/gco:CharacterString"),
    );
    rec.insert(
        "contact-email".to_string(),
        first(
            party,
            "gmd:contactInfo/gmd:CI_Contact/gmd:address/gmd:CI_Address/gmd:electronicMailAddress/gco:CharacterString",
        ),
    );
    rec.insert(
        "role".to_string(),
        first_of(
            party,
            &["gmd:role/gmd:CI_RoleCode/@codeListValue", "gmd:role/gmd:CI_RoleCode"],
        ),
    );
    rec
}

/// The `gmd:MD_Metadata` element of a tree: the root, or the first one below it.
pub fn find_metadata<'a, 'input>(doc: &'a roxmltree::Document<'input>) -> Option<Node<'a, 'input>> {
    doc.root_element()
        .descendants()
        .find(|n| xpath::is_element(*n, METADATA_TAG))
}

/// Every `gmd:MD_Metadata` element in a tree, outermost first.
pub fn find_all_metadata<'a, 'input>(doc: &'a roxmltree::Document<'input>) -> Vec<Node<'a, 'input>> {
    doc.root_element()
        .descendants()
        .filter(|n| xpath::is_element(*n, METADATA_TAG))
        .filter(|n| {
            !n.ancestors()
                .skip(1)
                .any(|a| xpath::is_element(a, METADATA_TAG))
        })
        .collect()
}

/// Parse a metadata date in either accepted form (`YYYY-MM-DD` or
/// `YYYY-MM-DDTHH:MM:SS`).
pub fn parse_metadata_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok()
}

/// Cut a tag down to [`MAX_TAG_LENGTH`] characters.
pub fn truncate_tag(tag: &str) -> String {
    tag.chars().take(MAX_TAG_LENGTH).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_date_formats() {
        let date_only = parse_metadata_date("2011-09-23").unwrap();
        assert_eq!(date_only.to_string(), "2011-09-23 00:00:00");

        let date_time = parse_metadata_date("2011-09-23T10:06:08").unwrap();
        assert_eq!(date_time.to_string(), "2011-09-23 10:06:08");

        assert!(parse_metadata_date("23/09/2011").is_none());
        assert!(parse_metadata_date("").is_none());
    }

    #[test]
    fn tags_truncated_to_fifty_chars() {
        let long = "a".repeat(70);
        assert_eq!(truncate_tag(&long).chars().count(), 50);
        assert_eq!(truncate_tag("short"), "short");
        // Multi-byte characters count as one each.
        assert_eq!(truncate_tag(&"é".repeat(60)).chars().count(), 50);
    }

    #[test]
    fn nested_metadata_found() {
        let xml = r#"<csw:GetRecordByIdResponse xmlns:csw="http://www.opengis.net/cat/csw/2.0.2"
            xmlns:gmd="http://www.isotc211.org/2005/gmd" xmlns:gco="http://www.isotc211.org/2005/gco">
            <gmd:MD_Metadata><gmd:fileIdentifier><gco:CharacterString>x-1</gco:CharacterString></gmd:fileIdentifier></gmd:MD_Metadata>
        </csw:GetRecordByIdResponse>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let gemini = GeminiDocument::from_tree(&doc).unwrap();
        assert_eq!(gemini.guid(), "x-1");
        assert_eq!(find_all_metadata(&doc).len(), 1);
    }

    #[test]
    fn missing_metadata_element() {
        let doc = roxmltree::Document::parse("<html><body/></html>").unwrap();
        assert!(GeminiDocument::from_tree(&doc).is_err());
    }
}
