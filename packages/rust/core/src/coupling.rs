//! Service-to-dataset coupling maintenance.

use tracing::debug;
use url::Url;

use geoharvest_shared::{ParsedFields, Result};
use geoharvest_storage::Storage;

/// The dataset GUID a coupled-resource reference points at.
///
/// The `id` query parameter of the href wins; the uuidref is the fallback.
pub fn coupled_guid(href: &str, uuidref: &str) -> Option<String> {
    let from_href = Url::parse(href.trim()).ok().and_then(|url| {
        url.query_pairs()
            .find(|(key, _)| key.eq_ignore_ascii_case("id"))
            .map(|(_, value)| value.trim().to_string())
    });
    from_href
        .filter(|g| !g.is_empty())
        .or_else(|| Some(uuidref.trim().to_string()).filter(|g| !g.is_empty()))
}

/// Update coupling rows after a record was written.
///
/// A service replaces its rows with one per `operatesOn` reference; any
/// other record links the rows already waiting for its GUID.
pub async fn sync_couplings(
    storage: &Storage,
    fields: &ParsedFields,
    guid: &str,
    record_id: &str,
) -> Result<()> {
    if fields.text("resource-type") != "service" {
        let linked = storage.fill_couplings(guid, record_id).await?;
        if linked > 0 {
            debug!(%guid, linked, "dataset linked to waiting services");
        }
        return Ok(());
    }

    let mut links = Vec::new();
    for reference in fields.records("coupled-resource") {
        let href = reference.get("href").map(String::as_str).unwrap_or_default();
        let uuid = reference.get("uuid").map(String::as_str).unwrap_or_default();
        let Some(dataset_guid) = coupled_guid(href, uuid) else {
            debug!(%guid, %href, "coupled resource without a resolvable GUID");
            continue;
        };
        let dataset_record = storage
            .current_objects_for_guid(&dataset_guid, "")
            .await?
            .into_iter()
            .find_map(|object| object.record_id);
        links.push((dataset_guid, dataset_record));
    }

    debug!(%guid, couplings = links.len(), "service couplings registered");
    storage.replace_couplings(record_id, &links).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_from_href_query() {
        assert_eq!(
            coupled_guid(
                "http://csw.example.com/csw?service=CSW&request=GetRecordById&id=abc-123",
                "other"
            )
            .as_deref(),
            Some("abc-123")
        );
    }

    #[test]
    fn guid_falls_back_to_uuidref() {
        assert_eq!(
            coupled_guid("http://csw.example.com/record", "abc-123").as_deref(),
            Some("abc-123")
        );
        assert_eq!(coupled_guid("", " abc ").as_deref(), Some("abc"));
        assert_eq!(coupled_guid("not a url", ""), None);
    }
}
