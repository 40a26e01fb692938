//! Minimal namespace-aware path selection over `roxmltree` trees.
//!
//! Paths are `/`-separated steps of `prefix:local` names. A step may list
//! alternatives with `|` (`gmd:MD_DataIdentification|srv:SV_ServiceIdentification`),
//! `*` matches any element, and a final `@name` or `@prefix:name` step selects
//! an attribute in [`values`]. Only child axes are supported.

use roxmltree::Node;

pub const GMD: &str = "http://www.isotc211.org/2005/gmd";
pub const GCO: &str = "http://www.isotc211.org/2005/gco";
pub const GMX: &str = "http://www.isotc211.org/2005/gmx";
pub const SRV: &str = "http://www.isotc211.org/2005/srv";
pub const XLINK: &str = "http://www.w3.org/1999/xlink";
pub const CSW: &str = "http://www.opengis.net/cat/csw/2.0.2";
pub const OWS: &str = "http://www.opengis.net/ows";
pub const DC: &str = "http://purl.org/dc/elements/1.1/";

const GML: &[&str] = &["http://www.opengis.net/gml/3.2", "http://www.opengis.net/gml"];

fn namespaces_for(prefix: &str) -> &'static [&'static str] {
    match prefix {
        "gmd" => &[GMD],
        "gco" => &[GCO],
        "gmx" => &[GMX],
        "srv" => &[SRV],
        "xlink" => &[XLINK],
        "csw" => &[CSW],
        "ows" => &[OWS, "http://www.opengis.net/ows/1.1"],
        "gml" => GML,
        "dc" => &[DC],
        _ => &[],
    }
}

/// Whether `node` is an element named `prefix:local` (or any element for `*`).
pub fn is_element(node: Node<'_, '_>, qname: &str) -> bool {
    if !node.is_element() {
        return false;
    }
    if qname == "*" {
        return true;
    }
    let tag = node.tag_name();
    match qname.split_once(':') {
        Some((prefix, local)) => {
            tag.name() == local
                && tag
                    .namespace()
                    .is_some_and(|ns| namespaces_for(prefix).contains(&ns))
        }
        None => tag.name() == qname && tag.namespace().is_none(),
    }
}

fn step_matches(node: Node<'_, '_>, step: &str) -> bool {
    step.split('|').any(|alt| is_element(node, alt))
}

/// Select every element reached by `path` from `node`.
pub fn select<'a, 'input>(node: Node<'a, 'input>, path: &str) -> Vec<Node<'a, 'input>> {
    let mut current = vec![node];
    for step in path.split('/').filter(|s| !s.is_empty()) {
        current = current
            .into_iter()
            .flat_map(|n| n.children().filter(move |c| step_matches(*c, step)))
            .collect();
        if current.is_empty() {
            break;
        }
    }
    current
}

/// First element reached by `path`, if any.
pub fn select_first<'a, 'input>(node: Node<'a, 'input>, path: &str) -> Option<Node<'a, 'input>> {
    select(node, path).into_iter().next()
}

/// Concatenated, trimmed text content of an element.
pub fn text_content(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|d| d.is_text())
        .filter_map(|d| d.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn attribute_value(node: Node<'_, '_>, name: &str) -> Option<String> {
    let value = match name.split_once(':') {
        Some((prefix, local)) => namespaces_for(prefix)
            .iter()
            .find_map(|ns| node.attribute((*ns, local))),
        None => node.attribute(name),
    };
    value.map(|v| v.trim().to_string())
}

/// Non-empty string values at `path`; a trailing `@attr` step reads attributes.
pub fn values(node: Node<'_, '_>, path: &str) -> Vec<String> {
    let (element_path, attr) = match path.rsplit_once('/') {
        Some((head, last)) if last.starts_with('@') => (head, Some(&last[1..])),
        _ if path.starts_with('@') => ("", Some(&path[1..])),
        _ => (path, None),
    };

    select(node, element_path)
        .into_iter()
        .filter_map(|n| match attr {
            Some(name) => attribute_value(n, name),
            None => Some(text_content(n)),
        })
        .filter(|v| !v.is_empty())
        .collect()
}

/// First value at `path`, or an empty string.
pub fn first(node: Node<'_, '_>, path: &str) -> String {
    values(node, path).into_iter().next().unwrap_or_default()
}

/// First non-empty value among several candidate paths.
pub fn first_of(node: Node<'_, '_>, paths: &[&str]) -> String {
    paths
        .iter()
        .map(|p| first(node, p))
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<gmd:MD_Metadata xmlns:gmd="http://www.isotc211.org/2005/gmd"
        xmlns:gco="http://www.isotc211.org/2005/gco"
        xmlns:gmx="http://www.isotc211.org/2005/gmx"
        xmlns:xlink="http://www.w3.org/1999/xlink">
      <gmd:fileIdentifier><gco:CharacterString> abc-123 </gco:CharacterString></gmd:fileIdentifier>
      <gmd:hierarchyLevel><gmd:MD_ScopeCode codeListValue="dataset">dataset</gmd:MD_ScopeCode></gmd:hierarchyLevel>
      <gmd:useLimitation><gco:CharacterString>one</gco:CharacterString></gmd:useLimitation>
      <gmd:useLimitation><gmx:Anchor xlink:href="http://x/licence">OGL</gmx:Anchor></gmd:useLimitation>
    </gmd:MD_Metadata>"#;

    #[test]
    fn selects_text_and_attributes() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let root = doc.root_element();
        assert!(is_element(root, "gmd:MD_Metadata"));

        assert_eq!(first(root, "gmd:fileIdentifier/gco:CharacterString"), "abc-123");
        assert_eq!(
            first(root, "gmd:hierarchyLevel/gmd:MD_ScopeCode/@codeListValue"),
            "dataset"
        );
        assert_eq!(
            values(root, "gmd:useLimitation/gco:CharacterString|gmx:Anchor"),
            vec!["one", "OGL"]
        );
        assert_eq!(
            first(root, "gmd:useLimitation/gmx:Anchor/@xlink:href"),
            "http://x/licence"
        );
    }

    #[test]
    fn missing_paths_are_empty() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let root = doc.root_element();
        assert!(values(root, "gmd:identificationInfo/*/gmd:abstract").is_empty());
        assert_eq!(first(root, "gmd:nothing/@codeListValue"), "");
        assert_eq!(
            first_of(root, &["gmd:nothing", "gmd:fileIdentifier/gco:CharacterString"]),
            "abc-123"
        );
    }

    #[test]
    fn prefix_must_match_namespace() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let root = doc.root_element();
        assert!(select(root, "srv:fileIdentifier").is_empty());
        assert_eq!(select(root, "*").len(), 4);
    }
}
