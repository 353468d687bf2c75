//! Thin layer over `sxd-document` and `sxd-xpath` to run namespaced XPath queries.
use std::collections::BTreeMap;

use sxd_document::{dom, parser, writer, Package};
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value};
use thiserror::Error;

/// Errors raised while reading markup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("markup is not well formed: {0}")]
    Malformed(String),
    #[error("{query} is not a valid node query: {reason}")]
    InvalidQuery { query: String, reason: String },
}

/// A parsed XML document.
pub struct XmlDocument {
    package: Package,
}

impl XmlDocument {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let package =
            parser::parse(text).map_err(|error| ParseError::Malformed(format!("{:?}", error)))?;

        Ok(Self { package })
    }

    /// Serialize the document back to text.
    pub fn to_xml(&self) -> std::io::Result<String> {
        let document = self.package.as_document();
        let mut output = Vec::new();
        writer::format_document(&document, &mut output)?;

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

/// An owned snapshot of a matched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    /// Attribute value for attribute nodes, text content otherwise.
    pub value: String,
    /// Attributes by local name, for element nodes.
    attributes: BTreeMap<String, String>,
}

impl XmlNode {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn from_node(node: &Node<'_>) -> Self {
        match node {
            Node::Attribute(attribute) => Self {
                value: attribute.value().to_owned(),
                attributes: BTreeMap::new(),
            },
            Node::Element(element) => Self {
                value: node.string_value(),
                attributes: element
                    .attributes()
                    .into_iter()
                    .map(|a| (a.name().local_part().to_owned(), a.value().to_owned()))
                    .collect(),
            },
            _ => Self {
                value: node.string_value(),
                attributes: BTreeMap::new(),
            },
        }
    }
}

/// Evaluates XPath queries with a fixed set of namespace prefixes.
#[derive(Debug, Clone)]
pub struct NodeQuery {
    namespaces: BTreeMap<String, String>,
}

impl NodeQuery {
    pub fn new(namespaces: BTreeMap<String, String>) -> Self {
        Self { namespaces }
    }

    /// Return the first node matching `query` in document order.
    pub fn first(&self, document: &XmlDocument, query: &str) -> Result<Option<XmlNode>, ParseError> {
        let doc = document.package.as_document();
        let nodes = self.evaluate(&doc, query)?;

        Ok(nodes.first().map(XmlNode::from_node))
    }

    /// Return every node matching `query` in document order.
    pub fn all(&self, document: &XmlDocument, query: &str) -> Result<Vec<XmlNode>, ParseError> {
        let doc = document.package.as_document();
        let nodes = self.evaluate(&doc, query)?;

        Ok(nodes.iter().map(XmlNode::from_node).collect())
    }

    /// Replace the value of the first node matching `query`.
    /// Returns `false` if nothing matched or the node cannot hold a value.
    pub fn replace_first(
        &self,
        document: &XmlDocument,
        query: &str,
        value: &str,
    ) -> Result<bool, ParseError> {
        let doc = document.package.as_document();
        let nodes = self.evaluate(&doc, query)?;

        let replaced = match nodes.into_iter().next() {
            Some(Node::Element(element)) => {
                element.set_text(value);
                true
            }
            Some(Node::Attribute(attribute)) => match attribute.parent() {
                Some(parent) => {
                    parent.set_attribute_value(attribute.name(), value);
                    true
                }
                None => false,
            },
            _ => false,
        };

        Ok(replaced)
    }

    fn evaluate<'d>(&self, doc: &dom::Document<'d>, query: &str) -> Result<Vec<Node<'d>>, ParseError> {
        let invalid = |reason: String| ParseError::InvalidQuery {
            query: query.to_owned(),
            reason,
        };

        let xpath = Factory::new()
            .build(query)
            .map_err(|error| invalid(format!("{:?}", error)))?
            .ok_or_else(|| invalid("empty query".to_owned()))?;

        let mut context = Context::new();
        for (prefix, uri) in &self.namespaces {
            context.set_namespace(prefix, uri);
        }

        match xpath.evaluate(&context, doc.root()) {
            Ok(Value::Nodeset(nodes)) => Ok(nodes.document_order()),
            Ok(_) => Err(invalid("query does not select nodes".to_owned())),
            Err(error) => Err(invalid(format!("{:?}", error))),
        }
    }
}
