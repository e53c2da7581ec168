//! Persisted prototype descriptors and the layers they hold.
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

/// How a path's content is interpreted when layers are merged and rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Opaque bytes; layers are merged whole-file.
    Text,
    /// JSON key/value tree.
    Json,
    /// YAML key/value tree.
    Yaml,
    /// TOML key/value tree.
    Toml,
}

impl FileType {
    /// Infer the type from the path's extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            Some("yaml" | "yml") => Self::Yaml,
            Some("toml") => Self::Toml,
            _ => Self::Text,
        }
    }

    /// Whether content of this type is merged key-wise.
    #[must_use]
    pub const fn is_structured(self) -> bool {
        !matches!(self, Self::Text)
    }

    /// Lowercase format name used in messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        }
    }
}

/// Content proposed by one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum LayerContent {
    /// Whole-file bytes, stored base64-encoded.
    Text(#[serde(with = "base64_bytes")] Vec<u8>),
    /// A parsed key/value tree.
    Tree(serde_json::Value),
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Per-key optionality for a structured layer, mirroring its tree.
///
/// A key maps either to a flag (applying to the key and, for a nested tree,
/// to every key below it) or to a nested map for finer control. Keys that
/// are not mentioned take the layer's own `is_optional` flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyOptions(BTreeMap<String, KeyOption>);

/// Optionality of a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyOption {
    /// `true` if the key is optional.
    Flag(bool),
    /// Optionality of the keys of a nested tree.
    Nested(KeyOptions),
}

impl KeyOption {
    /// Whether the key yields to a required value. A nested tree is optional
    /// only if every key below it is.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        match self {
            Self::Flag(optional) => *optional,
            Self::Nested(nested) => nested.all_optional(),
        }
    }
}

impl KeyOptions {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, option: KeyOption) -> Self {
        self.0.insert(key.into(), option);
        self
    }

    /// Option recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KeyOption> {
        self.0.get(key)
    }

    /// Record the option for `key`.
    pub fn insert(&mut self, key: impl Into<String>, option: KeyOption) {
        self.0.insert(key.into(), option);
    }

    /// Remove `key`, returning its nested map (empty if it held a flag).
    pub fn take_nested(&mut self, key: &str) -> Self {
        match self.0.remove(key) {
            Some(KeyOption::Nested(nested)) => nested,
            Some(KeyOption::Flag(_)) | None => Self::default(),
        }
    }

    /// Whether every recorded key is optional.
    #[must_use]
    pub fn all_optional(&self) -> bool {
        self.0.values().all(KeyOption::is_optional)
    }

    /// Whether no key is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, KeyOption)> for KeyOptions {
    fn from_iter<I: IntoIterator<Item = (String, KeyOption)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One proposed contribution to a path. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Proposed content; `None` makes the layer a no-op.
    pub content: Option<LayerContent>,
    /// Per-key optionality for structured content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_options: Option<KeyOptions>,
    /// Whether the layer yields to required layers.
    pub is_optional: bool,
}

impl Layer {
    /// A required text layer.
    #[must_use]
    pub fn text(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            content: Some(LayerContent::Text(bytes.into())),
            key_options: None,
            is_optional: false,
        }
    }

    /// A required tree layer.
    #[must_use]
    pub const fn tree(value: serde_json::Value) -> Self {
        Self {
            content: Some(LayerContent::Tree(value)),
            key_options: None,
            is_optional: false,
        }
    }

    /// Mark the layer optional.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    /// Attach per-key optionality.
    #[must_use]
    pub fn with_key_options(mut self, options: KeyOptions) -> Self {
        self.key_options = Some(options);
        self
    }
}

/// All pending changes for one real path.
///
/// A descriptor with zero layers means "no pending change" and is never
/// materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeDescriptor {
    /// Layers in insertion order.
    pub layers: Vec<Layer>,
    /// Whether a real file existed when the descriptor was created.
    pub real_file_existed: bool,
    /// How content is merged and rendered.
    pub file_type: FileType,
}

impl PrototypeDescriptor {
    /// Create an empty descriptor.
    #[must_use]
    pub const fn new(file_type: FileType, real_file_existed: bool) -> Self {
        Self {
            layers: Vec::new(),
            real_file_existed,
            file_type,
        }
    }

    /// Append a layer; content-less layers are dropped.
    pub fn push(&mut self, layer: Layer) {
        if layer.content.is_some() {
            self.layers.push(layer);
        }
    }

    /// Whether there is nothing to materialize.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Load a descriptor; a missing file means no pending change.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Io`] if the file cannot be read and
    /// [`OverlayError::Corrupt`] if it cannot be decoded.
    pub fn load(path: &Path) -> Result<Option<Self>, OverlayError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(OverlayError::io(path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| OverlayError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Persist the descriptor, replacing any previous version atomically.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), OverlayError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OverlayError::io(parent, e))?;
        }
        let encoded = serde_json::to_vec(self).map_err(|e| OverlayError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, encoded).map_err(|e| OverlayError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| OverlayError::io(path, e))
    }
}
