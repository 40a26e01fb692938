//! Schema-profile validation.
//!
//! A profile is a named set of structural rules checked against the parsed
//! tree. Validation never fails: it reports `(is_valid, messages)`, where the
//! first message names the failing profile and the rest list failed rules.

use roxmltree::Node;

use geoharvest_shared::{HarvestError, Result};

use crate::document::{GeminiDocument, find_metadata, parse_metadata_date};
use crate::xpath::{is_element, select};

/// One named validation profile.
pub trait ValidationProfile: Send + Sync {
    /// Configuration name, e.g. `gemini2`.
    fn name(&self) -> &'static str;

    /// Human-readable title used in messages.
    fn title(&self) -> &'static str;

    /// Failed rule descriptions for the document root; empty when valid.
    fn check(&self, root: Node<'_, '_>) -> Vec<String>;
}

/// ISO 19139 structural check.
pub struct Iso19139Profile;

impl ValidationProfile for Iso19139Profile {
    fn name(&self) -> &'static str {
        "iso19139"
    }

    fn title(&self) -> &'static str {
        "ISO19139 XSD Schema"
    }

    fn check(&self, root: Node<'_, '_>) -> Vec<String> {
        if !is_element(root, "gmd:MD_Metadata") {
            return vec![format!(
                "Root element is {:?}, expected gmd:MD_Metadata",
                root.tag_name().name()
            )];
        }
        ["gmd:fileIdentifier", "gmd:contact", "gmd:dateStamp", "gmd:identificationInfo"]
            .into_iter()
            .filter(|child| select(root, child).is_empty())
            .map(|child| format!("Element {child} is required"))
            .collect()
    }
}

/// GEMINI 2 content rules.
pub struct Gemini2Profile;

const RESOURCE_TYPES: &[&str] = &["dataset", "series", "service"];

impl ValidationProfile for Gemini2Profile {
    fn name(&self) -> &'static str {
        "gemini2"
    }

    fn title(&self) -> &'static str {
        "GEMINI 2.1 Schematron"
    }

    fn check(&self, root: Node<'_, '_>) -> Vec<String> {
        let fields = GeminiDocument::from_node(root).read_values();
        let mut failures = Vec::new();

        if fields.text("guid").is_empty() {
            failures.push("File identifier is missing".to_string());
        }
        if fields.text("title").is_empty() {
            failures.push("Title is missing".to_string());
        }
        if fields.text("abstract").is_empty() {
            failures.push("Abstract is missing".to_string());
        }
        if parse_metadata_date(fields.text("metadata-date")).is_none() {
            failures.push(format!(
                "Metadata date {:?} is not a valid date",
                fields.text("metadata-date")
            ));
        }
        if !RESOURCE_TYPES.contains(&fields.text("resource-type")) {
            failures.push(format!(
                "Resource type {:?} must be one of dataset, series or service",
                fields.text("resource-type")
            ));
        }
        // Services carry no extent requirement.
        if fields.text("resource-type") != "service" {
            for key in ["bbox-west-long", "bbox-east-long", "bbox-south-lat", "bbox-north-lat"] {
                if fields.text(key).parse::<f64>().is_err() {
                    failures.push(format!("Bounding box coordinate {key} is missing or not numeric"));
                }
            }
        }
        let has_party = fields.records("responsible-organisation").iter().any(|p| {
            p.get("organisation-name").is_some_and(|v| !v.is_empty())
                && p.get("role").is_some_and(|v| !v.is_empty())
        });
        if !has_party {
            failures.push("At least one responsible organisation with a name and role is required".to_string());
        }
        if fields.list("tags").is_empty() {
            failures.push("At least one keyword is required".to_string());
        }
        let has_constraint = ["use-constraints", "use-constraints-anchor-title", "limitations-on-public-access"]
            .iter()
            .any(|key| !fields.list(key).is_empty());
        if !has_constraint {
            failures.push("A use or access constraint is required".to_string());
        }
        failures
    }
}

/// Look up a profile by its configuration name.
pub fn profile_by_name(name: &str) -> Option<Box<dyn ValidationProfile>> {
    match name.trim() {
        "iso19139" => Some(Box::new(Iso19139Profile)),
        "gemini2" => Some(Box::new(Gemini2Profile)),
        _ => None,
    }
}

/// An ordered list of profiles applied to every document.
pub struct Validators {
    profiles: Vec<Box<dyn ValidationProfile>>,
}

impl Validators {
    /// Build validators from configured profile names.
    pub fn new(names: &[String]) -> Result<Self> {
        let profiles = names
            .iter()
            .map(|name| {
                profile_by_name(name)
                    .ok_or_else(|| HarvestError::config(format!("unknown validation profile '{name}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { profiles })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.profiles.iter().map(|p| p.name()).collect()
    }

    /// Validate document text. Stops at the first failing profile.
    pub fn is_valid(&self, text: &str) -> (bool, Vec<String>) {
        let doc = match roxmltree::Document::parse(text) {
            Ok(doc) => doc,
            Err(e) => return (false, vec![format!("Could not parse XML: {e}")]),
        };
        let root = find_metadata(&doc).unwrap_or_else(|| doc.root_element());

        for profile in &self.profiles {
            let failures = profile.check(root);
            if !failures.is_empty() {
                tracing::debug!(profile = profile.name(), failures = failures.len(), "validation failed");
                let mut messages = Vec::with_capacity(failures.len() + 1);
                messages.push(format!("Validating against \"{}\" profile failed", profile.title()));
                messages.extend(failures);
                return (false, messages);
            }
        }
        (true, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> String {
        std::fs::read_to_string("../../../fixtures/xml/gemini_dataset.xml").unwrap()
    }

    fn default_validators() -> Validators {
        Validators::new(&["iso19139".to_string(), "gemini2".to_string()]).unwrap()
    }

    #[test]
    fn dataset_fixture_is_valid() {
        let (valid, messages) = default_validators().is_valid(&fixture());
        assert!(valid, "unexpected failures: {messages:?}");
        assert!(messages.is_empty());
    }

    #[test]
    fn missing_title_fails_gemini() {
        let xml = fixture().replace("Thames Flood Zones", "");
        let (valid, messages) = default_validators().is_valid(&xml);
        assert!(!valid);
        assert_eq!(messages[0], "Validating against \"GEMINI 2.1 Schematron\" profile failed");
        assert!(messages.iter().any(|m| m == "Title is missing"));
    }

    #[test]
    fn wrong_root_fails_iso() {
        let (valid, messages) = default_validators().is_valid("<record><id>1</id></record>");
        assert!(!valid);
        assert!(messages[0].contains("ISO19139"));
    }

    #[test]
    fn unparseable_text_is_invalid_not_error() {
        let (valid, messages) = default_validators().is_valid("<unclosed>");
        assert!(!valid);
        assert!(messages[0].starts_with("Could not parse XML"));
    }

    #[test]
    fn unknown_profile_is_config_error() {
        let err = Validators::new(&["fgdc".to_string()]).err().unwrap();
        assert!(matches!(err, HarvestError::Config { .. }));
    }

    #[test]
    fn empty_profile_list_accepts_anything() {
        let validators = Validators::new(&[]).unwrap();
        assert!(validators.is_valid("<anything/>").0);
    }
}
