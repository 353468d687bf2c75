//! Namespace and XPath query configuration for notifications and APPL documents.
//!
//! Every query has a built-in default. A JSON file can override any subset of them,
//! keyed by the logical field name (`feedId`, `photographerName`, ...).
use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::Deserialize;
use thiserror::Error;

pub const ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";
pub const ECR_NAMESPACE: &str = "http://ap.org/schemas/ecr/notification";
pub const APPL_NAMESPACE: &str = "http://ap.org/schemas/03/2005/appl";

#[derive(Error, Debug)]
pub enum FeedConfigError {
    #[error("failed to read feed configuration from {path}: {error}")]
    Read {
        path: String,
        error: std::io::Error,
    },
    #[error("invalid feed configuration in {path}: {error}")]
    Invalid {
        path: String,
        error: serde_json::Error,
    },
}

/// Queries used to read notifications and the APPL documents they link to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedConfig {
    /// Prefix to namespace URI map available to every query.
    pub namespaces: BTreeMap<String, String>,
    pub notification: NotificationQueries,
    pub appl: ApplQueries,
}

impl FeedConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FeedConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|error| FeedConfigError::Read {
            path: path.display().to_string(),
            error,
        })?;

        Self::from_json(&text).map_err(|error| FeedConfigError::Invalid {
            path: path.display().to_string(),
            error,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        let namespaces = [
            ("atom", ATOM_NAMESPACE),
            ("ecr", ECR_NAMESPACE),
            ("appl", APPL_NAMESPACE),
        ]
        .into_iter()
        .map(|(prefix, uri)| (prefix.to_owned(), uri.to_owned()))
        .collect();

        Self {
            namespaces,
            notification: NotificationQueries::default(),
            appl: ApplQueries::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationQueries {
    pub feed_id: String,
    pub entry_id: String,
    pub item_id: String,
    pub version: String,
    pub products: String,
    pub saved_search_ids: String,
    pub filing_ids: String,
    pub title: String,
    pub etag: String,
    pub content_link: String,
    pub entry_date_time: String,
    pub feed_date_time: String,
    /// Matches every target node; each contributes its `name` attribute.
    pub targets: String,
}

impl Default for NotificationQueries {
    fn default() -> Self {
        let entry = "/atom:feed/atom:entry";
        Self {
            feed_id: "/atom:feed/atom:id".to_owned(),
            entry_id: format!("{entry}/atom:id"),
            item_id: format!("{entry}/ecr:item/@id"),
            version: format!("{entry}/ecr:item/@version"),
            products: format!("{entry}/ecr:classification/ecr:products"),
            saved_search_ids: format!("{entry}/ecr:classification/ecr:savedSearchIds"),
            filing_ids: format!("{entry}/ecr:classification/ecr:filingIds"),
            title: format!("{entry}/atom:title"),
            etag: format!("{entry}/atom:content/@ecr:etag"),
            content_link: format!("{entry}/atom:content/@src"),
            entry_date_time: format!("{entry}/atom:updated"),
            feed_date_time: "/atom:feed/atom:updated".to_owned(),
            targets: format!("{entry}/ecr:targets/ecr:target"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplQueries {
    pub media_type: String,
    pub item_id: String,
    pub record_sequence_number: String,
    pub title: String,
    pub photographer_name: String,
    pub photographer_title: String,
    pub photographer_id: String,
    pub credit: String,
    pub copyright: String,
    pub first_created_date_time: String,
    pub item_start_date_time: String,
    pub caption: String,
    pub filing_ids: String,
}

impl Default for ApplQueries {
    fn default() -> Self {
        let identification = "/appl:Publication/appl:Identification";
        let management = "/appl:Publication/appl:PublicationManagement";
        let news_lines = "/appl:Publication/appl:NewsLines";
        Self {
            media_type: format!("{identification}/appl:MediaType"),
            item_id: format!("{identification}/appl:ItemId"),
            record_sequence_number: format!("{identification}/appl:RecordSequenceNumber"),
            title: format!("{news_lines}/appl:Title"),
            photographer_name: format!("{news_lines}/appl:ByLine"),
            photographer_title: format!("{news_lines}/appl:ByLine/@Title"),
            photographer_id: format!("{news_lines}/appl:ByLine/@Id"),
            credit: format!("{news_lines}/appl:CreditLine"),
            copyright: format!("{news_lines}/appl:CopyrightLine"),
            first_created_date_time: format!("{management}/appl:FirstCreated"),
            item_start_date_time: format!("{management}/appl:ItemStartDateTime"),
            caption: "/appl:Publication/appl:PublicationComponent[@Role='Caption']/appl:TextContentItem/appl:Body".to_owned(),
            filing_ids: "/appl:Publication/appl:FilingMetadata/appl:Id".to_owned(),
        }
    }
}

/// Behaviour of notification retrievals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Attempts used when fetching the APPL of an incoming notification.
    pub default_retries: u32,
    /// Attempts used when regenerating a notification from an item id.
    pub reingest_retries: u32,
    /// Replace an unknown entity tag with the one returned by a successful fetch.
    pub populate_missing_etag: bool,
    /// Item URL, with `{item_id}` standing in for the item id.
    pub item_url_template: String,
    /// Tagging authority used as the prefix of regenerated feed ids.
    pub feed_id_namespace: String,
}

impl NotificationConfig {
    pub fn item_url(&self, item_id: &str) -> String {
        self.item_url_template.replace("{item_id}", item_id)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            reingest_retries: 5,
            populate_missing_etag: true,
            item_url_template: "http://localhost:8080/items/{item_id}".to_owned(),
            feed_id_namespace: "tag:pipelineingestion.ap.org".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_overrides_only_named_queries() {
        let config = FeedConfig::from_json(
            r#"{"notification": {"itemId": "/feed/item/@id"}, "namespaces": {"x": "urn:x"}}"#,
        )
        .expect("failed to parse feed config");

        assert_eq!(config.notification.item_id, "/feed/item/@id");
        assert_eq!(
            config.notification.feed_id,
            NotificationQueries::default().feed_id
        );
        assert_eq!(config.appl, ApplQueries::default());
        assert_eq!(config.namespaces.get("x").map(String::as_str), Some("urn:x"));
        assert!(!config.namespaces.contains_key("atom"));
    }

    #[test]
    fn test_default_namespaces_cover_default_queries() {
        let config = FeedConfig::default();

        for prefix in ["atom", "ecr", "appl"] {
            assert!(config.namespaces.contains_key(prefix));
        }
    }

    #[test]
    fn test_item_url_fills_template() {
        let config = NotificationConfig {
            item_url_template: "https://ecr.example.com/items/{item_id}?format=appl".to_owned(),
            ..NotificationConfig::default()
        };

        assert_eq!(
            config.item_url("abc123"),
            "https://ecr.example.com/items/abc123?format=appl"
        );
    }
}
