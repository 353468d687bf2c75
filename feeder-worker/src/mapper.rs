//! Map APPL documents into content registry records.
use feeder_common::config::{ApplQueries, FeedConfig};
use feeder_common::xml::{NodeQuery, ParseError, XmlDocument, XmlNode};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

pub const PHOTO_MEDIA_TYPE: &str = "Photo";

/// APPL fields that can be read into a registry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplField {
    MediaType,
    ItemId,
    Title,
    PhotographerName,
    PhotographerTitle,
    PhotographerId,
    Credit,
    Copyright,
    FirstCreatedDateTime,
    ItemStartDateTime,
    Caption,
}

impl ApplField {
    pub fn name(&self) -> &'static str {
        match self {
            ApplField::MediaType => "mediaType",
            ApplField::ItemId => "itemId",
            ApplField::Title => "title",
            ApplField::PhotographerName => "photographerName",
            ApplField::PhotographerTitle => "photographerTitle",
            ApplField::PhotographerId => "photographerId",
            ApplField::Credit => "credit",
            ApplField::Copyright => "copyright",
            ApplField::FirstCreatedDateTime => "firstCreatedDateTime",
            ApplField::ItemStartDateTime => "itemStartDateTime",
            ApplField::Caption => "caption",
        }
    }

    pub fn query<'q>(&self, queries: &'q ApplQueries) -> &'q str {
        match self {
            ApplField::MediaType => &queries.media_type,
            ApplField::ItemId => &queries.item_id,
            ApplField::Title => &queries.title,
            ApplField::PhotographerName => &queries.photographer_name,
            ApplField::PhotographerTitle => &queries.photographer_title,
            ApplField::PhotographerId => &queries.photographer_id,
            ApplField::Credit => &queries.credit,
            ApplField::Copyright => &queries.copyright,
            ApplField::FirstCreatedDateTime => &queries.first_created_date_time,
            ApplField::ItemStartDateTime => &queries.item_start_date_time,
            ApplField::Caption => &queries.caption,
        }
    }
}

/// Where a mapped value lands in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryTarget {
    Field(&'static str),
    /// A key of a nested object, created on first use.
    Nested(&'static str, &'static str),
    /// `Year-Month-DayTTime` assembled from attributes of the matched element.
    CreatedDate(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRule {
    pub source: ApplField,
    pub target: RegistryTarget,
}

const fn rule(source: ApplField, target: RegistryTarget) -> MappingRule {
    MappingRule { source, target }
}

pub const PHOTO_MAPPING: &[MappingRule] = &[
    rule(ApplField::ItemId, RegistryTarget::Field("id")),
    rule(ApplField::Title, RegistryTarget::Field("title")),
    rule(ApplField::PhotographerName, RegistryTarget::Nested("author", "name")),
    rule(ApplField::PhotographerTitle, RegistryTarget::Nested("author", "title")),
    rule(ApplField::PhotographerId, RegistryTarget::Nested("author", "id")),
    rule(ApplField::Credit, RegistryTarget::Field("credit")),
    rule(ApplField::Copyright, RegistryTarget::Field("copyright")),
    rule(
        ApplField::FirstCreatedDateTime,
        RegistryTarget::CreatedDate("createdDateTime"),
    ),
    rule(ApplField::ItemStartDateTime, RegistryTarget::Field("publishedDateTime")),
    rule(ApplField::Caption, RegistryTarget::Field("description")),
];

/// A content registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryItem(Map<String, Value>);

impl RegistryItem {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn url(&self) -> Option<&str> {
        self.0.get("url").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    fn set(&mut self, target: RegistryTarget, value: String) {
        match target {
            RegistryTarget::Field(key) | RegistryTarget::CreatedDate(key) => {
                self.0.insert(key.to_owned(), Value::String(value));
            }
            RegistryTarget::Nested(parent, child) => {
                let entry = self
                    .0
                    .entry(parent.to_owned())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(object) = entry {
                    object.insert(child.to_owned(), Value::String(value));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapping {
    Mapped(RegistryItem),
    /// The document is not a photo.
    NotApplicable,
}

/// Builds photo registry records from APPL documents.
#[derive(Debug, Clone)]
pub struct PhotoMapper {
    query: NodeQuery,
    queries: ApplQueries,
    mapi_base_url: String,
}

impl PhotoMapper {
    pub fn new(feed: &FeedConfig, mapi_base_url: &str) -> Self {
        Self {
            query: NodeQuery::new(feed.namespaces.clone()),
            queries: feed.appl.clone(),
            mapi_base_url: mapi_base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Map `appl` for the item `item_id`. Missing fields are skipped with a warning.
    pub fn map(&self, appl: &str, item_id: &str) -> Result<Mapping, ParseError> {
        let document = XmlDocument::parse(appl)?;

        let media_type = self
            .query
            .first(&document, ApplField::MediaType.query(&self.queries))?
            .map(|node| node.value);
        if media_type.as_deref() != Some(PHOTO_MEDIA_TYPE) {
            info!(item_id, ?media_type, "item is not a photo");
            return Ok(Mapping::NotApplicable);
        }

        let mut item = RegistryItem(Map::new());
        item.0.insert(
            "rightModel".to_owned(),
            json!({
                "id": "ap42",
                "name": "editorialOnly",
                "restrictions": "no online or web use",
            }),
        );
        item.0.insert(
            "url".to_owned(),
            Value::String(format!(
                "{}/{}/preview/preview.jpg",
                self.mapi_base_url, item_id
            )),
        );

        for MappingRule { source, target } in PHOTO_MAPPING {
            let Some(node) = self.query.first(&document, source.query(&self.queries))? else {
                warn!(item_id, field = source.name(), "could not find field in APPL");
                continue;
            };

            let value = match target {
                RegistryTarget::CreatedDate(_) => match composite_date(&node) {
                    Some(value) => value,
                    None => {
                        warn!(
                            item_id,
                            field = source.name(),
                            "date is missing one of Year, Month, Day or Time"
                        );
                        continue;
                    }
                },
                _ => node.value,
            };
            item.set(*target, value);
        }

        Ok(Mapping::Mapped(item))
    }
}

fn composite_date(node: &XmlNode) -> Option<String> {
    Some(format!(
        "{}-{}-{}T{}",
        node.attribute("Year")?,
        node.attribute("Month")?,
        node.attribute("Day")?,
        node.attribute("Time")?
    ))
}
