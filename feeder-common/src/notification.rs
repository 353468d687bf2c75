//! # Notification
//!
//! Content change notifications, parsed from Atom markup into typed fields, and the
//! retrievals that follow their content links.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::config::{FeedConfig, NotificationConfig, NotificationQueries};
use crate::fetch::{DocumentFetcher, FetchError, FetchedDocument};
use crate::xml::{NodeQuery, ParseError, XmlDocument};

/// Query parameter value selecting the JSON representation of an APPL document.
pub const APPL_JSON_DOC_TYPE: &str = "application/vnd.ap.esappl+json";
/// Message id given to notifications synthesized by `create_notification_from_appl`.
pub const RELATED_RETRIEVAL_MESSAGE_ID: &str = "RelatedRetrieval";

const SENTINEL_ETAG_PREFIX: &str = "0000";
const NOTIFICATION_TEMPLATE: &str = include_str!("notification_template.xml");

/// Errors raised by retrievals that start from a notification.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("notification has no {0}")]
    MissingField(&'static str),
    #[error("{url} is not a valid url: {error}")]
    InvalidUrl { url: String, error: url::ParseError },
    #[error("could not find any filing ids using query = {query}")]
    MissingFilingIds { query: String },
    #[error("failed to serialize synthesized notification: {0}")]
    Template(std::io::Error),
}

/// The entity tag of the document a notification refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EntityTag {
    Known(String),
    /// Not supplied, or supplied as the all-zeros placeholder.
    #[default]
    Unknown,
}

impl EntityTag {
    fn from_notification_value(value: Option<String>) -> Self {
        match value {
            Some(tag) if !tag.is_empty() && !tag.starts_with(SENTINEL_ETAG_PREFIX) => {
                EntityTag::Known(tag)
            }
            _ => EntityTag::Unknown,
        }
    }

    pub fn as_known(&self) -> Option<&str> {
        match self {
            EntityTag::Known(tag) => Some(tag),
            EntityTag::Unknown => None,
        }
    }
}

/// How the text of a notification field is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    StringArray,
    NumericArray,
    Number,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationField {
    FeedId,
    EntryId,
    ItemId,
    Version,
    Products,
    SavedSearchIds,
    FilingIds,
    Title,
    Etag,
    ContentLink,
    EntryDateTime,
    FeedDateTime,
}

impl NotificationField {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationField::FeedId => "feedId",
            NotificationField::EntryId => "entryId",
            NotificationField::ItemId => "itemId",
            NotificationField::Version => "version",
            NotificationField::Products => "products",
            NotificationField::SavedSearchIds => "savedSearchIds",
            NotificationField::FilingIds => "filingIds",
            NotificationField::Title => "title",
            NotificationField::Etag => "etag",
            NotificationField::ContentLink => "contentLink",
            NotificationField::EntryDateTime => "entryDateTime",
            NotificationField::FeedDateTime => "feedDateTime",
        }
    }

    pub fn query<'q>(&self, queries: &'q NotificationQueries) -> &'q str {
        match self {
            NotificationField::FeedId => &queries.feed_id,
            NotificationField::EntryId => &queries.entry_id,
            NotificationField::ItemId => &queries.item_id,
            NotificationField::Version => &queries.version,
            NotificationField::Products => &queries.products,
            NotificationField::SavedSearchIds => &queries.saved_search_ids,
            NotificationField::FilingIds => &queries.filing_ids,
            NotificationField::Title => &queries.title,
            NotificationField::Etag => &queries.etag,
            NotificationField::ContentLink => &queries.content_link,
            NotificationField::EntryDateTime => &queries.entry_date_time,
            NotificationField::FeedDateTime => &queries.feed_date_time,
        }
    }
}

/// Every field read from a notification, in the order they are read.
pub const NOTIFICATION_SCHEMA: &[(NotificationField, FieldKind)] = &[
    (NotificationField::FeedId, FieldKind::String),
    (NotificationField::EntryId, FieldKind::String),
    (NotificationField::ItemId, FieldKind::String),
    (NotificationField::Version, FieldKind::String),
    (NotificationField::Products, FieldKind::NumericArray),
    (NotificationField::SavedSearchIds, FieldKind::NumericArray),
    (NotificationField::FilingIds, FieldKind::StringArray),
    (NotificationField::Title, FieldKind::String),
    (NotificationField::Etag, FieldKind::String),
    (NotificationField::ContentLink, FieldKind::String),
    (NotificationField::EntryDateTime, FieldKind::Date),
    (NotificationField::FeedDateTime, FieldKind::Date),
];

/// A coerced field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Texts(Vec<String>),
    Numbers(Vec<i64>),
    Number(i64),
    Date(DateTime<FixedOffset>),
    Absent,
}

impl FieldValue {
    /// Coerce the text of a matched node according to `kind`.
    pub fn coerce(kind: FieldKind, text: &str) -> Self {
        match kind {
            FieldKind::String => FieldValue::Text(text.to_owned()),
            FieldKind::StringArray => {
                if text.trim().is_empty() {
                    FieldValue::Texts(Vec::new())
                } else {
                    FieldValue::Texts(text.split(',').map(str::to_owned).collect())
                }
            }
            FieldKind::NumericArray => {
                let mut numbers: Vec<i64> = text
                    .split(',')
                    .filter(|token| !token.trim().is_empty())
                    .filter_map(|token| match token.trim().parse::<i64>() {
                        Ok(number) => Some(number),
                        Err(_) => {
                            warn!(token, "dropping non numeric value");
                            None
                        }
                    })
                    .collect();
                numbers.sort_unstable();
                FieldValue::Numbers(numbers)
            }
            FieldKind::Number => match parse_leading_integer(text) {
                Some(number) => FieldValue::Number(number),
                None => FieldValue::Absent,
            },
            FieldKind::Date => match DateTime::parse_from_rfc3339(text.trim()) {
                Ok(date) => FieldValue::Date(date),
                Err(error) => {
                    warn!(text, "could not parse date: {}", error);
                    FieldValue::Absent
                }
            },
        }
    }

    /// The value of a field missing from the document: empty for arrays, absent otherwise.
    pub fn missing(kind: FieldKind) -> Self {
        match kind {
            FieldKind::StringArray => FieldValue::Texts(Vec::new()),
            FieldKind::NumericArray => FieldValue::Numbers(Vec::new()),
            _ => FieldValue::Absent,
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::Number(number) => Some(number.to_string()),
            FieldValue::Date(date) => Some(date.to_rfc3339()),
            FieldValue::Texts(texts) => Some(texts.join(",")),
            FieldValue::Numbers(numbers) => Some(
                numbers
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            FieldValue::Absent => None,
        }
    }

    fn into_texts(self) -> Vec<String> {
        match self {
            FieldValue::Texts(texts) => texts,
            _ => Vec::new(),
        }
    }

    fn into_numbers(self) -> Vec<i64> {
        match self {
            FieldValue::Numbers(numbers) => numbers,
            _ => Vec::new(),
        }
    }

    fn into_date(self) -> Option<DateTime<FixedOffset>> {
        match self {
            FieldValue::Date(date) => Some(date),
            _ => None,
        }
    }
}

/// Parse an optionally signed run of digits at the start of `text`.
fn parse_leading_integer(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(unsigned.len());
    let number = unsigned[..end].parse::<i64>().ok()?;

    Some(if negative { -number } else { number })
}

/// A parsed content change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    message_id: String,
    feed_id: Option<String>,
    entry_id: Option<String>,
    item_id: Option<String>,
    version: Option<String>,
    products: Vec<i64>,
    saved_search_ids: Vec<i64>,
    filing_ids: Vec<String>,
    title: Option<String>,
    etag: EntityTag,
    content_link: Option<String>,
    entry_date_time: Option<DateTime<FixedOffset>>,
    feed_date_time: Option<DateTime<FixedOffset>>,
    targets: Vec<String>,
}

impl Notification {
    /// Parse notification markup. Fields missing from the document are logged and left
    /// empty; only malformed markup or an invalid query fails.
    pub fn parse(message_id: &str, text: &str, config: &FeedConfig) -> Result<Self, ParseError> {
        let document = XmlDocument::parse(text).map_err(|error| {
            error!(message_id, "error parsing notification: {}", error);
            error
        })?;
        let query = NodeQuery::new(config.namespaces.clone());

        let mut notification = Notification {
            message_id: message_id.to_owned(),
            ..Notification::default()
        };

        for (field, kind) in NOTIFICATION_SCHEMA {
            let value = match query.first(&document, field.query(&config.notification))? {
                Some(node) => FieldValue::coerce(*kind, &node.value),
                None => {
                    warn!(
                        message_id,
                        field = field.name(),
                        "could not find field in notification"
                    );
                    FieldValue::missing(*kind)
                }
            };
            notification.assign(*field, value);
        }

        notification.targets = query
            .all(&document, &config.notification.targets)?
            .iter()
            .filter_map(|node| node.attribute("name").map(str::to_owned))
            .collect();

        Ok(notification)
    }

    fn assign(&mut self, field: NotificationField, value: FieldValue) {
        match field {
            NotificationField::FeedId => self.feed_id = value.into_text(),
            NotificationField::EntryId => self.entry_id = value.into_text(),
            NotificationField::ItemId => self.item_id = value.into_text(),
            NotificationField::Version => self.version = value.into_text(),
            NotificationField::Products => self.products = value.into_numbers(),
            NotificationField::SavedSearchIds => self.saved_search_ids = value.into_numbers(),
            NotificationField::FilingIds => self.filing_ids = value.into_texts(),
            NotificationField::Title => self.title = value.into_text(),
            NotificationField::Etag => {
                self.etag = EntityTag::from_notification_value(value.into_text())
            }
            NotificationField::ContentLink => self.content_link = value.into_text(),
            NotificationField::EntryDateTime => self.entry_date_time = value.into_date(),
            NotificationField::FeedDateTime => self.feed_date_time = value.into_date(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn feed_id(&self) -> Option<&str> {
        self.feed_id.as_deref()
    }

    pub fn entry_id(&self) -> Option<&str> {
        self.entry_id.as_deref()
    }

    pub fn item_id(&self) -> Option<&str> {
        self.item_id.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Product ids, sorted ascending.
    pub fn products(&self) -> &[i64] {
        &self.products
    }

    pub fn saved_search_ids(&self) -> &[i64] {
        &self.saved_search_ids
    }

    pub fn filing_ids(&self) -> &[String] {
        &self.filing_ids
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn etag(&self) -> &EntityTag {
        &self.etag
    }

    pub fn content_link(&self) -> Option<&str> {
        self.content_link.as_deref()
    }

    pub fn entry_date_time(&self) -> Option<DateTime<FixedOffset>> {
        self.entry_date_time
    }

    pub fn feed_date_time(&self) -> Option<DateTime<FixedOffset>> {
        self.feed_date_time
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn contains_target(&self, name: &str) -> bool {
        self.targets.iter().any(|target| target == name)
    }

    /// True only if the notification has targets and every name in `names` is one of them.
    pub fn contains_targets(&self, names: &[&str]) -> bool {
        if self.targets.is_empty() {
            return false;
        }
        let targets: HashSet<&str> = self.targets.iter().map(String::as_str).collect();
        let matched: HashSet<&str> = names
            .iter()
            .copied()
            .filter(|name| targets.contains(name))
            .collect();

        matched.len() == names.len()
    }

    /// Product ids present both in this notification and in `allowlist`, ascending.
    pub fn matching_products(&self, allowlist: &[i64]) -> Vec<i64> {
        self.products
            .iter()
            .copied()
            .filter(|product| allowlist.contains(product))
            .collect()
    }

    /// Replace an unknown entity tag with `fetched`; a known tag is left untouched.
    pub fn backfill_etag(&mut self, fetched: Option<&str>) -> bool {
        match (&self.etag, fetched) {
            (EntityTag::Unknown, Some(tag)) => {
                self.etag = EntityTag::Known(tag.to_owned());
                true
            }
            _ => false,
        }
    }
}

/// Parses notifications and performs the retrievals they describe.
#[derive(Clone)]
pub struct NotificationService {
    fetcher: DocumentFetcher,
    feed: Arc<FeedConfig>,
    config: NotificationConfig,
}

impl NotificationService {
    pub fn new(fetcher: DocumentFetcher, feed: Arc<FeedConfig>, config: NotificationConfig) -> Self {
        Self {
            fetcher,
            feed,
            config,
        }
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    pub fn feed(&self) -> &FeedConfig {
        &self.feed
    }

    pub fn parse(&self, message_id: &str, text: &str) -> Result<Notification, ParseError> {
        Notification::parse(message_id, text, &self.feed)
    }

    /// Download the APPL document the notification links to.
    pub async fn fetch_appl(
        &self,
        notification: &mut Notification,
        retry_limit: u32,
    ) -> Result<FetchedDocument, RetrievalError> {
        let url = notification
            .content_link()
            .ok_or(RetrievalError::MissingField("contentLink"))?
            .to_owned();

        self.fetch_for(notification, &url, retry_limit).await
    }

    /// Download the JSON representation of the APPL document the notification links to.
    pub async fn fetch_appl_json(
        &self,
        notification: &mut Notification,
        retry_limit: u32,
    ) -> Result<FetchedDocument, RetrievalError> {
        let link = notification
            .content_link()
            .ok_or(RetrievalError::MissingField("contentLink"))?;
        let url = with_doc_type(link, APPL_JSON_DOC_TYPE)?;

        self.fetch_for(notification, &url, retry_limit).await
    }

    /// Download the JSON representation of the latest version of the notification's item,
    /// rather than the version this notification refers to.
    pub async fn fetch_latest_appl_json(
        &self,
        notification: &mut Notification,
        retry_limit: u32,
    ) -> Result<FetchedDocument, RetrievalError> {
        let item_id = notification
            .item_id()
            .ok_or(RetrievalError::MissingField("itemId"))?;
        let url = with_doc_type(&self.config.item_url(item_id), APPL_JSON_DOC_TYPE)?;

        self.fetch_for(notification, &url, retry_limit).await
    }

    async fn fetch_for(
        &self,
        notification: &mut Notification,
        url: &str,
        retry_limit: u32,
    ) -> Result<FetchedDocument, RetrievalError> {
        let document = self.fetcher.fetch(url, retry_limit).await?;

        if self.config.populate_missing_etag && notification.backfill_etag(document.etag.as_deref()) {
            tracing::debug!(
                message_id = notification.message_id(),
                "populated missing entity tag from download"
            );
        }

        Ok(document)
    }

    /// Build a fresh notification for `item_id` from its current APPL document.
    pub async fn create_notification_from_appl(
        &self,
        item_id: &str,
    ) -> Result<Notification, RetrievalError> {
        let item_url = self.config.item_url(item_id);
        let document = self
            .fetcher
            .fetch(&item_url, self.config.reingest_retries)
            .await?;

        let text = self.synthesize_notification(item_id, &item_url, &document, Utc::now())?;

        Ok(self.parse(RELATED_RETRIEVAL_MESSAGE_ID, &text)?)
    }

    /// Fill the notification template from a downloaded APPL document.
    fn synthesize_notification(
        &self,
        item_id: &str,
        item_url: &str,
        document: &FetchedDocument,
        now: DateTime<Utc>,
    ) -> Result<String, RetrievalError> {
        let appl = XmlDocument::parse(&document.body).map_err(|error| {
            error!(item_id, "error parsing APPL: {}", error);
            error
        })?;
        let query = NodeQuery::new(self.feed.namespaces.clone());
        let appl_queries = &self.feed.appl;

        let sequence = query
            .first(&appl, &appl_queries.record_sequence_number)?
            .map(|node| node.value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .ok_or(RetrievalError::MissingField("recordSequenceNumber"))?;
        let sequence = parse_leading_integer(&sequence)
            .map(|number| number.to_string())
            .unwrap_or(sequence);

        let filing_ids: Vec<String> = query
            .all(&appl, &appl_queries.filing_ids)?
            .into_iter()
            .map(|node| node.value)
            .collect();
        if filing_ids.is_empty() {
            error!(
                item_id,
                query = %appl_queries.filing_ids,
                "could not find any filing ids"
            );
            return Err(RetrievalError::MissingFilingIds {
                query: appl_queries.filing_ids.clone(),
            });
        }

        let template = XmlDocument::parse(NOTIFICATION_TEMPLATE)?;
        let slots = &self.feed.notification;
        let feed_id = format!(
            "{},{}:{},{}",
            self.config.feed_id_namespace,
            now.format("%Y-%m-%d"),
            item_id,
            sequence
        );
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let title = format!("Item:{},Version:{}", item_id, sequence);
        let filing_ids = filing_ids.join(",");

        let mut values = vec![
            (NotificationField::FeedId, feed_id.as_str()),
            (NotificationField::FeedDateTime, timestamp.as_str()),
            (NotificationField::EntryDateTime, timestamp.as_str()),
            (NotificationField::ItemId, item_id),
            (NotificationField::Version, sequence.as_str()),
            (NotificationField::ContentLink, item_url),
            (NotificationField::Title, title.as_str()),
            (NotificationField::FilingIds, filing_ids.as_str()),
        ];
        if let Some(etag) = document.etag.as_deref() {
            values.push((NotificationField::Etag, etag));
        }

        for (field, value) in values {
            let slot = field.query(slots);
            if !query.replace_first(&template, slot, value)? {
                error!(
                    field = field.name(),
                    query = slot,
                    "could not find template node"
                );
            }
        }

        template.to_xml().map_err(RetrievalError::Template)
    }
}

/// Set the `doc_type` query parameter of `link`, replacing any existing value.
fn with_doc_type(link: &str, doc_type: &str) -> Result<String, RetrievalError> {
    let mut url = Url::parse(link).map_err(|error| RetrievalError::InvalidUrl {
        url: link.to_owned(),
        error,
    })?;

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "doc_type")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("doc_type", doc_type);

    Ok(url.into())
}
