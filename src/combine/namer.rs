//! Naming of rewritten resources.

use crate::value::HASH_LEN;

/// The marker separating a rewritten resource's name from its metadata.
pub const PAGESPEED_MARKER: &str = "pagespeed";

/// The parts of a rewritten resource's leaf name:
/// `<name>.pagespeed.<id>.<hash>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNamer {
    /// The identifier of the filter that produced the resource.
    pub id: String,
    /// The name derived from the inputs.
    pub name: String,
    /// The hash of the resource contents.
    pub hash: String,
    /// The file extension.
    pub ext: String,
}

impl ResourceNamer {
    /// Creates a namer from its parts.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        hash: impl Into<String>,
        ext: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            hash: hash.into(),
            ext: ext.into(),
        }
    }

    /// Encodes the leaf name.
    pub fn encode(&self) -> String {
        format!(
            "{name}.{PAGESPEED_MARKER}.{id}.{hash}.{ext}",
            name = self.name,
            id = self.id,
            hash = self.hash,
            ext = self.ext
        )
    }

    /// Decodes a leaf name produced by [`ResourceNamer::encode`].
    pub fn decode(leaf: &str) -> Option<Self> {
        let mut parts = leaf.rsplitn(5, '.');
        let ext = parts.next()?;
        let hash = parts.next()?;
        let id = parts.next()?;
        let marker = parts.next()?;
        let name = parts.next()?;

        if marker != PAGESPEED_MARKER || [ext, hash, id].iter().any(|p| p.is_empty()) {
            return None;
        }

        Some(Self::new(id, name, hash, ext))
    }

    /// Gets the length of the leaf name that a name of `name_len` bytes will
    /// eventually have once hashed.
    pub fn eventual_size(id: &str, ext: &str, name_len: usize) -> usize {
        // Four dots around the marker, id and hash
        name_len + PAGESPEED_MARKER.len() + id.len() + HASH_LEN + ext.len() + 4
    }
}
