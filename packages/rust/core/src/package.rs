//! Building a [`NormalizedRecord`] from parsed GEMINI fields.
//!
//! Covers the extras allow-list, licence and responsible-party processing,
//! the GeoJSON extent and resource locators (with view-service probing).

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use geoharvest_shared::{NormalizedRecord, ParsedFields, RecordState, Resource, new_id};
use geoharvest_sources::ViewServiceProbe;

/// Parsed keys copied verbatim into the record's extras.
pub const EXTRA_FIELDS: &[&str] = &[
    "bbox-east-long",
    "bbox-north-lat",
    "bbox-south-lat",
    "bbox-west-long",
    "spatial-reference-system",
    "guid",
    "dataset-reference-date",
    "resource-type",
    "metadata-language",
    "coupled-resource",
    "contact-email",
    "frequency-of-update",
    "spatial-data-service-type",
];

/// Format label given to affirmed view services.
pub const VIEW_SERVICE_FORMAT: &str = "WMS";

const DEFAULT_RESOURCE_DESCRIPTION: &str = "Resource locator";

/// Per-import values that do not come from the document.
#[derive(Debug, Clone)]
pub struct RecordContext<'a> {
    pub object_id: &'a str,
    pub source_reference: &'a str,
    pub publisher_id: Option<&'a str>,
    pub metadata_modified: NaiveDateTime,
}

// ---------------------------------------------------------------------------
// Licence
// ---------------------------------------------------------------------------

/// Licence extras split out of the use-constraint fields.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Licence {
    /// Free text, followed by any URLs after the first.
    pub licence: Vec<String>,
    pub licence_url: Option<String>,
    pub licence_url_title: Option<String>,
}

/// Whether a string parses with both a scheme and a network location.
pub fn is_url(value: &str) -> bool {
    Url::parse(value.trim())
        .map(|url| url.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// Split use constraints into free text and licence URLs.
///
/// An anchor href is the primary licence URL (titled by the anchor text when
/// present); URL-shaped free-text entries come after it.
pub fn process_licence(
    use_constraints: &[String],
    anchor_href: Option<&str>,
    anchor_title: Option<&str>,
) -> Licence {
    let mut urls: Vec<(String, Option<String>)> = Vec::new();
    if let Some(href) = anchor_href.filter(|h| !h.trim().is_empty()) {
        let title = anchor_title
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string);
        urls.push((href.trim().to_string(), title));
    }

    let mut licence = Vec::new();
    for constraint in use_constraints {
        if is_url(constraint) {
            urls.push((constraint.trim().to_string(), None));
        } else {
            licence.push(constraint.clone());
        }
    }

    let mut urls = urls.into_iter();
    let (licence_url, licence_url_title) = match urls.next() {
        Some((url, title)) => (Some(url), title),
        None => (None, None),
    };
    licence.extend(urls.map(|(url, _)| url));

    Licence {
        licence,
        licence_url,
        licence_url_title,
    }
}

// ---------------------------------------------------------------------------
// Responsible parties
// ---------------------------------------------------------------------------

/// Collapse parties into `"Name (role, role)"` strings and pick the provider.
///
/// The provider is the first `owner`, else the first `publisher`, else empty.
pub fn process_responsible_organisations(
    parties: &[BTreeMap<String, String>],
) -> (String, Vec<String>) {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    let mut owner = None;
    let mut publisher = None;

    for party in parties {
        let name = party.get("organisation-name").cloned().unwrap_or_default();
        let role = party.get("role").cloned().unwrap_or_default();

        match role.as_str() {
            "owner" if owner.is_none() => owner = Some(name.clone()),
            "publisher" if publisher.is_none() => publisher = Some(name.clone()),
            _ => {}
        }

        match grouped.iter_mut().find(|(n, _)| *n == name) {
            Some((_, roles)) => {
                if !roles.contains(&role) {
                    roles.push(role);
                }
            }
            None => grouped.push((name, vec![role])),
        }
    }

    let provider = owner.or(publisher).unwrap_or_default();
    let described = grouped
        .into_iter()
        .map(|(name, roles)| format!("{name} ({})", roles.join(", ")))
        .collect();
    (provider, described)
}

// ---------------------------------------------------------------------------
// Extent
// ---------------------------------------------------------------------------

/// GeoJSON polygon for the bounding box, `None` unless all four coordinates parse.
pub fn spatial_extent(fields: &ParsedFields) -> Option<String> {
    let coord = |key: &str| fields.text(key).trim().parse::<f64>().ok();
    let west = coord("bbox-west-long")?;
    let east = coord("bbox-east-long")?;
    let south = coord("bbox-south-lat")?;
    let north = coord("bbox-north-lat")?;

    let polygon = json!({
        "type": "Polygon",
        "coordinates": [[
            [west, south],
            [west, north],
            [east, north],
            [east, south],
            [west, south],
        ]],
    });
    Some(polygon.to_string())
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Turn resource locators into resources, probing service endpoints.
pub async fn build_resources(
    fields: &ParsedFields,
    probe: &dyn ViewServiceProbe,
) -> Vec<Resource> {
    let is_service = fields.text("resource-type") == "service";
    let mut resources = Vec::new();

    for locator in fields.records("resource-locator") {
        let url = locator.get("url").map(|u| u.trim()).unwrap_or_default();
        if url.is_empty() {
            continue;
        }
        let field = |key: &str| locator.get(key).cloned().unwrap_or_default();

        let mut resource = Resource {
            url: url.to_string(),
            name: field("name"),
            description: match field("description") {
                d if d.trim().is_empty() => DEFAULT_RESOURCE_DESCRIPTION.to_string(),
                d => d,
            },
            protocol: field("protocol"),
            function: field("function"),
            ..Resource::default()
        };

        if is_service && probe.is_view_service(url).await {
            debug!(%url, "view service affirmed");
            resource.verified = true;
            resource.verified_date = Some(Utc::now());
            resource.format = Some(VIEW_SERVICE_FORMAT.to_string());
        }
        resources.push(resource);
    }

    mark_recommended_preview(&mut resources);
    resources
}

/// Flag at most one resource as the preview: the first verified view
/// service, else the first with a view-service format.
pub fn mark_recommended_preview(resources: &mut [Resource]) {
    let is_view = |r: &Resource| r.format.as_deref() == Some(VIEW_SERVICE_FORMAT);
    let chosen = resources
        .iter()
        .position(|r| r.verified && is_view(r))
        .or_else(|| resources.iter().position(is_view));
    if let Some(index) = chosen {
        resources[index].recommended_preview = true;
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The extras map of a record.
pub fn build_extras(fields: &ParsedFields, ctx: &RecordContext<'_>) -> BTreeMap<String, Value> {
    let mut extras = BTreeMap::new();
    extras.insert("UKLP".to_string(), json!("True"));
    extras.insert("harvest_object_id".to_string(), json!(ctx.object_id));
    extras.insert(
        "harvest_source_reference".to_string(),
        json!(ctx.source_reference),
    );
    extras.insert(
        "metadata-date".to_string(),
        json!(ctx.metadata_modified.format("%Y-%m-%d").to_string()),
    );

    for key in EXTRA_FIELDS {
        extras.insert(key.to_string(), fields.to_json(key));
    }

    let licence = process_licence(
        &fields.list("use-constraints"),
        fields.list("use-constraints-anchor-href").first().map(String::as_str),
        fields.list("use-constraints-anchor-title").first().map(String::as_str),
    );
    extras.insert("licence".to_string(), json!(licence.licence));
    if let Some(url) = licence.licence_url {
        extras.insert("licence_url".to_string(), json!(url));
    }
    if let Some(title) = licence.licence_url_title {
        extras.insert("licence_url_title".to_string(), json!(title));
    }

    extras.insert(
        "access_constraints".to_string(),
        json!(fields.list("limitations-on-public-access")),
    );
    let begin = fields.list("temporal-extent-begin");
    if !begin.is_empty() {
        extras.insert("temporal_coverage-from".to_string(), json!(begin));
    }
    let end = fields.list("temporal-extent-end");
    if !end.is_empty() {
        extras.insert("temporal_coverage-to".to_string(), json!(end));
    }

    let (provider, parties) =
        process_responsible_organisations(fields.records("responsible-organisation"));
    extras.insert("provider".to_string(), json!(provider));
    extras.insert("responsible-party".to_string(), json!(parties.join("; ")));

    if let Some(extent) = spatial_extent(fields) {
        extras.insert("spatial".to_string(), json!(extent));
    }
    extras
}

/// Build a fresh record with a new id and no name yet.
pub async fn build_record(
    fields: &ParsedFields,
    ctx: &RecordContext<'_>,
    probe: &dyn ViewServiceProbe,
) -> NormalizedRecord {
    NormalizedRecord {
        id: new_id(),
        name: String::new(),
        title: fields.text("title").to_string(),
        notes: fields.text("abstract").to_string(),
        state: RecordState::Active,
        tags: fields.list("tags"),
        resources: build_resources(fields, probe).await,
        extras: build_extras(fields, ctx),
        groups: ctx.publisher_id.map(|p| vec![p.to_string()]).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use geoharvest_shared::FieldValue;
    use geoharvest_sources::NoProbe;

    struct AffirmAll;

    #[async_trait]
    impl ViewServiceProbe for AffirmAll {
        async fn is_view_service(&self, url: &str) -> bool {
            url.contains("wms")
        }
    }

    fn fixture_fields(name: &str) -> ParsedFields {
        let raw = std::fs::read(format!("../../../fixtures/xml/{name}")).unwrap();
        geoharvest_gemini::parse(&raw).unwrap()
    }

    fn ctx() -> RecordContext<'static> {
        RecordContext {
            object_id: "obj-1",
            source_reference: "http://csw.example.com/csw?id=test-dataset-1",
            publisher_id: Some("environment-agency"),
            metadata_modified: NaiveDateTime::parse_from_str(
                "2011-09-23T10:06:08",
                "%Y-%m-%dT%H:%M:%S",
            )
            .unwrap(),
        }
    }

    fn party(name: &str, role: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("organisation-name".to_string(), name.to_string()),
            ("role".to_string(), role.to_string()),
        ])
    }

    #[test]
    fn url_shape() {
        assert!(is_url("http://x/licence"));
        assert!(is_url("https://example.com/a?b=c"));
        assert!(!is_url("Reference Only"));
        assert!(!is_url("mailto:someone@example.com"));
        assert!(!is_url("urn:x:licence"));
    }

    #[test]
    fn licence_free_text_url_becomes_licence_url() {
        let constraints = vec!["Reference Only".to_string(), "http://x/licence".to_string()];
        let licence = process_licence(&constraints, None, None);
        assert_eq!(licence.licence_url.as_deref(), Some("http://x/licence"));
        assert_eq!(licence.licence, vec!["Reference Only"]);
        assert_eq!(licence.licence_url_title, None);
    }

    #[test]
    fn licence_anchor_takes_priority() {
        let constraints = vec!["Free text".to_string(), "http://x/other".to_string()];
        let licence = process_licence(
            &constraints,
            Some("http://x/ogl"),
            Some("Open Government Licence"),
        );
        assert_eq!(licence.licence_url.as_deref(), Some("http://x/ogl"));
        assert_eq!(
            licence.licence_url_title.as_deref(),
            Some("Open Government Licence")
        );
        assert_eq!(licence.licence, vec!["Free text", "http://x/other"]);
    }

    #[test]
    fn licence_without_urls() {
        let licence = process_licence(&["Use freely".to_string()], Some(""), None);
        assert_eq!(licence.licence_url, None);
        assert_eq!(licence.licence, vec!["Use freely"]);
    }

    #[test]
    fn parties_collapse_roles_and_pick_owner() {
        let parties = vec![
            party("Met Office", "publisher"),
            party("Environment Agency", "pointOfContact"),
            party("Environment Agency", "owner"),
            party("Environment Agency", "owner"),
        ];
        let (provider, described) = process_responsible_organisations(&parties);
        assert_eq!(provider, "Environment Agency");
        assert_eq!(
            described,
            vec!["Met Office (publisher)", "Environment Agency (pointOfContact, owner)"]
        );
    }

    #[test]
    fn provider_falls_back_to_publisher_then_empty() {
        let (provider, _) = process_responsible_organisations(&[
            party("A", "pointOfContact"),
            party("B", "publisher"),
        ]);
        assert_eq!(provider, "B");

        let (provider, described) = process_responsible_organisations(&[]);
        assert_eq!(provider, "");
        assert!(described.is_empty());
    }

    #[test]
    fn extent_requires_all_coordinates() {
        let fields = fixture_fields("gemini_dataset.xml");
        let extent: Value = serde_json::from_str(&spatial_extent(&fields).unwrap()).unwrap();
        assert_eq!(extent["type"], "Polygon");
        assert_eq!(extent["coordinates"][0][0], json!([-1.5, 51.0]));
        assert_eq!(extent["coordinates"][0][2], json!([0.5, 52.0]));

        let mut partial = fields.clone();
        partial.insert("bbox-north-lat", FieldValue::Text(String::new()));
        assert_eq!(spatial_extent(&partial), None);
    }

    #[test]
    fn preview_prefers_verified() {
        let mut resources = vec![
            Resource {
                url: "a".into(),
                format: Some(VIEW_SERVICE_FORMAT.into()),
                ..Resource::default()
            },
            Resource {
                url: "b".into(),
                format: Some(VIEW_SERVICE_FORMAT.into()),
                verified: true,
                ..Resource::default()
            },
        ];
        mark_recommended_preview(&mut resources);
        assert!(!resources[0].recommended_preview);
        assert!(resources[1].recommended_preview);

        let mut unverified = vec![
            Resource::default(),
            Resource {
                format: Some(VIEW_SERVICE_FORMAT.into()),
                ..Resource::default()
            },
        ];
        mark_recommended_preview(&mut unverified);
        assert!(unverified[1].recommended_preview);
    }

    #[tokio::test]
    async fn dataset_record() {
        let fields = fixture_fields("gemini_dataset.xml");
        let record = build_record(&fields, &ctx(), &NoProbe).await;

        assert_eq!(record.title, "Thames Flood Zones");
        assert_eq!(record.state, RecordState::Active);
        assert_eq!(record.groups, vec!["environment-agency"]);
        assert_eq!(record.extra_str("UKLP"), "True");
        assert_eq!(record.extra_str("guid"), "test-dataset-1");
        assert_eq!(record.extra_str("harvest_object_id"), "obj-1");
        assert_eq!(record.extra_str("metadata-date"), "2011-09-23");
        assert_eq!(record.extra_str("licence_url"), "http://x/licence");
        assert_eq!(record.extras["licence"], json!(["Reference Only"]));
        assert_eq!(record.extras["access_constraints"], json!(["no limitations"]));
        assert_eq!(record.extras["temporal_coverage-from"], json!(["2010-01-01"]));
        assert_eq!(record.extra_str("provider"), "Environment Agency");
        assert!(record.extra_str("responsible-party").contains("Environment Agency (owner, publisher"));
        assert!(record.extras.contains_key("spatial"));

        assert_eq!(record.resources.len(), 2);
        assert_eq!(record.resources[0].description, "Resource locator");
        assert_eq!(record.resources[1].description, "More information");
        assert!(record.resources.iter().all(|r| r.format.is_none() && !r.verified));
        assert!(record.tags.iter().all(|t| t.chars().count() <= 50));
    }

    #[tokio::test]
    async fn service_resources_are_probed() {
        let fields = fixture_fields("gemini_service.xml");
        let record = build_record(&fields, &ctx(), &AffirmAll).await;

        let wms = record
            .resources
            .iter()
            .find(|r| r.url.contains("wms"))
            .unwrap();
        assert!(wms.verified);
        assert!(wms.verified_date.is_some());
        assert_eq!(wms.format.as_deref(), Some(VIEW_SERVICE_FORMAT));
        assert!(wms.recommended_preview);
        assert_eq!(record.extra_str("licence_url_title"), "Open Government Licence");
        assert!(!record.extras.contains_key("spatial"));
    }
}
