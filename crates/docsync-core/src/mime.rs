//! Mime registry.
//!
//! Decides whether a document is stored as XML (validated, structured) or as
//! an opaque binary stream, and resolves a mime type from a declared name or
//! from the file extension.

use crate::path::ResourcePath;
use std::collections::HashMap;

/// How documents of a mime type are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MimeKind {
    /// Structured content, validated then stored
    Xml,
    /// Opaque byte stream
    Binary,
}

/// A registered mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    /// Canonical name, e.g. `application/xml`
    pub name: String,
    /// Storage kind
    pub kind: MimeKind,
}

impl MimeType {
    /// Whether documents of this type take the XML storage path.
    #[must_use]
    pub fn is_xml(&self) -> bool {
        self.kind == MimeKind::Xml
    }
}

const DEFAULT_TYPES: &[(&str, MimeKind, &[&str])] = &[
    ("application/xml", MimeKind::Xml, &["xml", "xsd", "wsdl", "rdf", "dbx"]),
    ("text/xml", MimeKind::Xml, &[]),
    ("application/xslt+xml", MimeKind::Xml, &["xsl", "xslt"]),
    ("application/xhtml+xml", MimeKind::Xml, &["xhtml", "xht"]),
    ("application/atom+xml", MimeKind::Xml, &["atom"]),
    ("image/svg+xml", MimeKind::Xml, &["svg"]),
    ("application/xquery", MimeKind::Binary, &["xq", "xql", "xqm", "xquery", "xqy"]),
    ("text/plain", MimeKind::Binary, &["txt", "text", "md"]),
    ("text/html", MimeKind::Binary, &["html", "htm"]),
    ("text/css", MimeKind::Binary, &["css"]),
    ("text/csv", MimeKind::Binary, &["csv"]),
    ("application/javascript", MimeKind::Binary, &["js"]),
    ("application/json", MimeKind::Binary, &["json"]),
    ("application/pdf", MimeKind::Binary, &["pdf"]),
    ("application/zip", MimeKind::Binary, &["zip"]),
    ("image/png", MimeKind::Binary, &["png"]),
    ("image/jpeg", MimeKind::Binary, &["jpg", "jpeg"]),
    ("image/gif", MimeKind::Binary, &["gif"]),
    ("application/octet-stream", MimeKind::Binary, &["bin", "dat"]),
];

/// Registry of known mime types and file extensions.
#[derive(Debug, Clone)]
pub struct MimeTable {
    types: HashMap<String, MimeType>,
    extensions: HashMap<String, String>,
}

impl Default for MimeTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for (name, kind, extensions) in DEFAULT_TYPES {
            table.register(name, *kind, extensions);
        }
        table
    }
}

impl MimeTable {
    /// A registry with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    /// Register a mime type and the extensions that map to it.
    pub fn register(&mut self, name: &str, kind: MimeKind, extensions: &[&str]) {
        let name = name.to_ascii_lowercase();
        for ext in extensions {
            self.extensions.insert(ext.to_ascii_lowercase(), name.clone());
        }
        self.types.insert(name.clone(), MimeType { name, kind });
    }

    /// Look up a declared mime type by name.
    ///
    /// Parameters such as `; charset=utf-8` are ignored.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&MimeType> {
        let bare = name.split(';').next().unwrap_or_default().trim();
        self.types.get(&bare.to_ascii_lowercase())
    }

    /// Resolve a mime type from the extension of the last path segment.
    #[must_use]
    pub fn for_path(&self, path: &ResourcePath) -> Option<&MimeType> {
        let (_, ext) = path.name().rsplit_once('.')?;
        let name = self.extensions.get(&ext.to_ascii_lowercase())?;
        self.types.get(name)
    }
}
