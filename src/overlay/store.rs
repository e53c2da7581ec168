//! The path overlay store.
//!
//! Every real absolute path with pending changes has a descriptor at
//! `<root>/<path>.prototype.json`. Reads, stats and listings combine the
//! overlay with the real filesystem, the overlay taking precedence.
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use super::format;
use super::merge::merge_layers;
use super::prototype::{FileType, KeyOptions, Layer, LayerContent, PrototypeDescriptor};
use crate::error::{MergeError, OverlayError};

/// Suffix appended to a real path to name its descriptor file.
const DESCRIPTOR_SUFFIX: &str = ".prototype.json";

/// Whether an [`Entry`] is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file (or anything that is not a directory).
    File,
    /// Directory.
    Directory,
}

/// Metadata for one path as seen through the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Final path component.
    pub name: String,
    /// Full real path.
    pub path: PathBuf,
    /// File or directory.
    pub kind: EntryKind,
    /// Size in bytes; for virtual files, the size of the merged content.
    pub size: u64,
    /// Whether the entry comes from the overlay.
    pub is_virtual: bool,
}

impl Entry {
    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A merged view of a path: the resolved layer plus how to render it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// The merge result.
    pub layer: Layer,
    /// Format of the descriptor.
    pub file_type: FileType,
}

/// Overlay of pending changes on top of the real filesystem.
#[derive(Debug)]
pub struct OverlayStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl OverlayStore {
    /// Create a store rooted at `root`; the directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Directory holding the descriptors.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append a layer for `path`, creating its descriptor if needed.
    ///
    /// A new descriptor records whether a real file exists at `path` and
    /// infers its format from the extension. Conflicts are only detected when
    /// the layers are merged.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidPath`] for relative or unnormalized
    /// paths and [`OverlayError::Io`] if the descriptor cannot be written.
    pub fn create_or_append(
        &self,
        path: &Path,
        content: Option<LayerContent>,
        key_options: Option<KeyOptions>,
        is_optional: bool,
    ) -> Result<(), OverlayError> {
        self.append(
            path,
            FileType::from_path(path),
            Layer {
                content,
                key_options,
                is_optional,
            },
        )
    }

    /// Propose whole-file `bytes` for `path`.
    ///
    /// # Errors
    ///
    /// See [`create_or_append`](Self::create_or_append).
    pub fn write_file(&self, path: &Path, bytes: &[u8], is_optional: bool) -> Result<(), OverlayError> {
        self.create_or_append(
            path,
            Some(LayerContent::Text(bytes.to_vec())),
            None,
            is_optional,
        )
    }

    /// Propose config `text` for `path`, parsed as `file_type`.
    ///
    /// [`FileType::Text`] stores the text verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Format`] if the text does not parse, otherwise
    /// see [`create_or_append`](Self::create_or_append).
    pub fn write_config(
        &self,
        path: &Path,
        text: &str,
        file_type: FileType,
        key_options: Option<KeyOptions>,
        is_optional: bool,
    ) -> Result<(), OverlayError> {
        let content = if file_type.is_structured() {
            let tree = format::parse(file_type, text).map_err(|message| OverlayError::Format {
                path: path.to_path_buf(),
                format: file_type.name().to_string(),
                message,
            })?;
            LayerContent::Tree(tree)
        } else {
            LayerContent::Text(text.as_bytes().to_vec())
        };
        self.append(
            path,
            file_type,
            Layer {
                content: Some(content),
                key_options,
                is_optional,
            },
        )
    }

    fn append(&self, path: &Path, file_type: FileType, layer: Layer) -> Result<(), OverlayError> {
        let rel = relative(path)?;
        if rel.as_os_str().is_empty() {
            return Err(OverlayError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        let descriptor_path = self.descriptor_path(&rel);

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut descriptor = PrototypeDescriptor::load(&descriptor_path)?
            .unwrap_or_else(|| PrototypeDescriptor::new(file_type, path.is_file()));
        descriptor.push(layer);
        if descriptor.is_empty() {
            return Ok(());
        }
        descriptor.save(&descriptor_path)
    }

    /// The descriptor for `path`, if any layers are pending.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid paths or unreadable descriptors.
    pub fn descriptor(&self, path: &Path) -> Result<Option<PrototypeDescriptor>, OverlayError> {
        let rel = relative(path)?;
        if rel.as_os_str().is_empty() {
            return Ok(None);
        }
        Ok(PrototypeDescriptor::load(&self.descriptor_path(&rel))?.filter(|d| !d.is_empty()))
    }

    /// Merge the pending layers for `path`.
    ///
    /// When a structured real file existed before the first write, its parsed
    /// content takes part as an optional base layer, so keys already on disk
    /// survive unless a rule sets them.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::MergeConflict`] or
    /// [`OverlayError::UnsupportedMerge`] if the layers cannot be merged.
    pub fn resolve(&self, path: &Path) -> Result<Option<Resolved>, OverlayError> {
        let Some(descriptor) = self.descriptor(path)? else {
            return Ok(None);
        };

        let mut layers = Vec::with_capacity(descriptor.layers.len() + 1);
        let writes_trees = descriptor
            .layers
            .iter()
            .any(|l| matches!(l.content, Some(LayerContent::Tree(_))));
        if descriptor.real_file_existed
            && descriptor.file_type.is_structured()
            && writes_trees
            && let Some(base) = read_real_tree(path, descriptor.file_type)?
        {
            layers.push(Layer::tree(base).optional());
        }
        let offset = layers.len();
        layers.extend(descriptor.layers);

        let layer = merge_layers(&layers).map_err(|e| {
            OverlayError::from_merge(path, shift_layer_index(e, offset))
        })?;
        Ok(Some(Resolved {
            layer,
            file_type: descriptor.file_type,
        }))
    }

    /// Merged bytes for `path`, or `None` when nothing is pending.
    ///
    /// # Errors
    ///
    /// Propagates merge errors and [`OverlayError::Format`] if a merged tree
    /// cannot be rendered.
    pub fn materialize(&self, path: &Path) -> Result<Option<Vec<u8>>, OverlayError> {
        let Some(resolved) = self.resolve(path)? else {
            return Ok(None);
        };
        match resolved.layer.content {
            Some(LayerContent::Text(bytes)) => Ok(Some(bytes)),
            Some(LayerContent::Tree(tree)) => {
                let file_type = if resolved.file_type.is_structured() {
                    resolved.file_type
                } else {
                    FileType::Json
                };
                format::render(file_type, &tree)
                    .map(Some)
                    .map_err(|message| OverlayError::Format {
                        path: path.to_path_buf(),
                        format: file_type.name().to_string(),
                        message,
                    })
            }
            None => Ok(None),
        }
    }

    /// Read `path` through the overlay.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if neither the overlay nor the real
    /// filesystem has the path, or any merge error.
    pub fn read(&self, path: &Path) -> Result<Vec<u8>, OverlayError> {
        if let Some(bytes) = self.materialize(path)? {
            return Ok(bytes);
        }
        fs::read(path).map_err(|e| real_error(path, e))
    }

    /// Read `path` through the overlay as UTF-8.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read), plus [`OverlayError::Format`] for non-UTF-8 content.
    pub fn read_to_string(&self, path: &Path) -> Result<String, OverlayError> {
        String::from_utf8(self.read(path)?).map_err(|e| OverlayError::Format {
            path: path.to_path_buf(),
            format: "utf-8".to_string(),
            message: e.to_string(),
        })
    }

    /// Metadata for `path`, the overlay taking precedence.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if the path exists nowhere.
    pub fn stat(&self, path: &Path) -> Result<Entry, OverlayError> {
        let rel = relative(path)?;
        let name = path
            .file_name()
            .map_or_else(|| "/".to_string(), |n| n.to_string_lossy().to_string());

        if let Some(bytes) = self.materialize(path)? {
            return Ok(Entry {
                name,
                path: path.to_path_buf(),
                kind: EntryKind::File,
                size: bytes.len() as u64,
                is_virtual: true,
            });
        }

        match fs::metadata(path) {
            Ok(meta) => Ok(Entry {
                name,
                path: path.to_path_buf(),
                kind: if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: meta.len(),
                is_virtual: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.root.join(&rel).is_dir() {
                    Ok(Entry {
                        name,
                        path: path.to_path_buf(),
                        kind: EntryKind::Directory,
                        size: 0,
                        is_virtual: true,
                    })
                } else {
                    Err(OverlayError::NotFound {
                        path: path.to_path_buf(),
                    })
                }
            }
            Err(e) => Err(OverlayError::io(path, e)),
        }
    }

    /// Whether `path` exists in the overlay or on disk.
    ///
    /// # Errors
    ///
    /// Propagates every [`stat`](Self::stat) error except `NotFound`.
    pub fn exists(&self, path: &Path) -> Result<bool, OverlayError> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(OverlayError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Union of real and overlay entries under `path`, sorted by name.
    ///
    /// When both sides have an entry of the same name, the overlay wins.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotADirectory`] if `path` is a file and
    /// [`OverlayError::NotFound`] if it exists nowhere.
    pub fn list_directory(&self, path: &Path) -> Result<Vec<Entry>, OverlayError> {
        let rel = relative(path)?;
        if self.descriptor(path)?.is_some() || path.is_file() {
            return Err(OverlayError::NotADirectory {
                path: path.to_path_buf(),
            });
        }

        let mut entries: BTreeMap<String, Entry> = BTreeMap::new();
        let mut found = false;

        match fs::read_dir(path) {
            Ok(read_dir) => {
                found = true;
                for item in read_dir {
                    let item = item.map_err(|e| OverlayError::io(path, e))?;
                    let name = item.file_name().to_string_lossy().to_string();
                    let meta = item.metadata().map_err(|e| OverlayError::io(item.path(), e))?;
                    entries.insert(
                        name.clone(),
                        Entry {
                            name,
                            path: item.path(),
                            kind: if meta.is_dir() {
                                EntryKind::Directory
                            } else {
                                EntryKind::File
                            },
                            size: meta.len(),
                            is_virtual: false,
                        },
                    );
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(OverlayError::io(path, e)),
        }

        let overlay_dir = self.root.join(&rel);
        match fs::read_dir(&overlay_dir) {
            Ok(read_dir) => {
                found = true;
                for item in read_dir {
                    let item = item.map_err(|e| OverlayError::io(&overlay_dir, e))?;
                    let raw = item.file_name().to_string_lossy().to_string();
                    if item.path().is_dir() {
                        let real = path.join(&raw);
                        entries.entry(raw.clone()).or_insert(Entry {
                            name: raw,
                            path: real,
                            kind: EntryKind::Directory,
                            size: 0,
                            is_virtual: true,
                        });
                    } else if let Some(name) = raw.strip_suffix(DESCRIPTOR_SUFFIX) {
                        let real = path.join(name);
                        if let Some(bytes) = self.materialize(&real)? {
                            entries.insert(
                                name.to_string(),
                                Entry {
                                    name: name.to_string(),
                                    path: real,
                                    kind: EntryKind::File,
                                    size: bytes.len() as u64,
                                    is_virtual: true,
                                },
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(OverlayError::io(&overlay_dir, e)),
        }

        if !found {
            return Err(OverlayError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(entries.into_values().collect())
    }

    /// Real paths of every descriptor with pending layers, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Io`] if the overlay tree cannot be walked.
    pub fn prototypes(&self) -> Result<Vec<PathBuf>, OverlayError> {
        let mut out = Vec::new();
        if self.root.is_dir() {
            self.collect_prototypes(&self.root, &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    fn collect_prototypes(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), OverlayError> {
        for item in fs::read_dir(dir).map_err(|e| OverlayError::io(dir, e))? {
            let item = item.map_err(|e| OverlayError::io(dir, e))?;
            let path = item.path();
            if path.is_dir() {
                self.collect_prototypes(&path, out)?;
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let rel = rel.to_string_lossy();
            if let Some(real) = rel.strip_suffix(DESCRIPTOR_SUFFIX) {
                let real = Path::new("/").join(real);
                if self.descriptor(&real)?.is_some() {
                    out.push(real);
                }
            }
        }
        Ok(())
    }

    /// Drop every pending change.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Io`] if the overlay directory cannot be removed.
    pub fn clear(&self) -> Result<(), OverlayError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OverlayError::io(&self.root, e)),
        }
    }

    fn descriptor_path(&self, rel: &Path) -> PathBuf {
        let mut joined = self.root.join(rel).into_os_string();
        joined.push(DESCRIPTOR_SUFFIX);
        PathBuf::from(joined)
    }
}

/// Validate `path` and return it relative to `/`.
fn relative(path: &Path) -> Result<PathBuf, OverlayError> {
    let invalid = || OverlayError::InvalidPath {
        path: path.to_path_buf(),
    };
    if !path.is_absolute() {
        return Err(invalid());
    }
    let mut rel = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => rel.push(part),
            Component::Prefix(_) | Component::CurDir | Component::ParentDir => {
                return Err(invalid());
            }
        }
    }
    Ok(rel)
}

fn real_error(path: &Path, e: io::Error) -> OverlayError {
    if e.kind() == io::ErrorKind::NotFound {
        OverlayError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        OverlayError::io(path, e)
    }
}

fn read_real_tree(path: &Path, file_type: FileType) -> Result<Option<Value>, OverlayError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(OverlayError::io(path, e)),
    };
    format::parse(file_type, &text)
        .map(Some)
        .map_err(|message| OverlayError::Format {
            path: path.to_path_buf(),
            format: file_type.name().to_string(),
            message,
        })
}

/// Report layer indices relative to the descriptor, not the base-extended list.
fn shift_layer_index(e: MergeError, offset: usize) -> MergeError {
    match e {
        MergeError::LayerConflict { layer } => MergeError::LayerConflict {
            layer: layer.saturating_sub(offset),
        },
        MergeError::NonTreeRoot { layer } => MergeError::NonTreeRoot {
            layer: layer.saturating_sub(offset),
        },
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: OverlayStore,
        real: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = OverlayStore::new(tmp.path().join("overlay"));
        let real = tmp.path().join("real");
        fs::create_dir_all(&real).unwrap();
        Fixture {
            _tmp: tmp,
            store,
            real,
        }
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    #[test]
    fn relative_paths_are_rejected() {
        let f = fixture();
        let err = f.store.write_file(Path::new("etc/hosts"), b"x", false).unwrap_err();
        assert!(matches!(err, OverlayError::InvalidPath { .. }));
    }

    #[test]
    fn parent_components_are_rejected() {
        let f = fixture();
        let err = f
            .store
            .write_file(&f.real.join("..").join("escape"), b"x", false)
            .unwrap_err();
        assert!(matches!(err, OverlayError::InvalidPath { .. }));
    }

    #[test]
    fn root_cannot_be_written() {
        let f = fixture();
        assert!(f.store.write_file(Path::new("/"), b"x", false).is_err());
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    #[test]
    fn read_prefers_overlay_then_real_then_not_found() {
        let f = fixture();
        let virtual_path = f.real.join("virtual.txt");
        let real_path = f.real.join("real.txt");
        fs::write(&real_path, "on disk").unwrap();
        f.store.write_file(&virtual_path, b"pending", false).unwrap();

        assert_eq!(f.store.read(&virtual_path).unwrap(), b"pending");
        assert_eq!(f.store.read(&real_path).unwrap(), b"on disk");
        assert!(matches!(
            f.store.read(&f.real.join("missing")).unwrap_err(),
            OverlayError::NotFound { .. }
        ));
    }

    #[test]
    fn overlay_shadows_real_file() {
        let f = fixture();
        let path = f.real.join("hosts");
        fs::write(&path, "orig").unwrap();
        f.store.write_file(&path, b"new", false).unwrap();
        assert_eq!(f.store.read_to_string(&path).unwrap(), "new");
        assert!(f.store.descriptor(&path).unwrap().unwrap().real_file_existed);
    }

    #[test]
    fn conflicting_writes_surface_on_read() {
        let f = fixture();
        let path = f.real.join("motd");
        f.store.write_file(&path, b"a", false).unwrap();
        f.store.write_file(&path, b"b", false).unwrap();
        let err = f.store.read(&path).unwrap_err();
        assert!(matches!(err, OverlayError::MergeConflict { .. }));
    }

    #[test]
    fn config_writes_merge_with_existing_file() {
        let f = fixture();
        let path = f.real.join("settings.json");
        fs::write(&path, r#"{"keep": true, "port": 1}"#).unwrap();
        f.store
            .write_config(&path, r#"{"port": 2}"#, FileType::Json, None, false)
            .unwrap();
        f.store
            .write_config(&path, "name: spito\n", FileType::Yaml, None, false)
            .unwrap();
        let merged: Value = serde_json::from_slice(&f.store.read(&path).unwrap()).unwrap();
        assert_eq!(merged, json!({"keep": true, "name": "spito", "port": 2}));
    }

    #[test]
    fn invalid_config_text_is_a_format_error() {
        let f = fixture();
        let err = f
            .store
            .write_config(&f.real.join("a.toml"), "x = [", FileType::Toml, None, false)
            .unwrap_err();
        assert!(matches!(err, OverlayError::Format { .. }));
    }

    #[test]
    fn array_writes_are_unsupported() {
        let f = fixture();
        let path = f.real.join("list.json");
        f.store
            .write_config(&path, r#"{"xs": [1]}"#, FileType::Json, None, false)
            .unwrap();
        f.store
            .write_config(&path, r#"{"xs": [2]}"#, FileType::Json, None, false)
            .unwrap();
        assert!(matches!(
            f.store.read(&path).unwrap_err(),
            OverlayError::UnsupportedMerge { .. }
        ));
    }

    #[test]
    fn contentless_layer_creates_no_descriptor() {
        let f = fixture();
        let path = f.real.join("nothing");
        f.store.create_or_append(&path, None, None, false).unwrap();
        assert!(f.store.descriptor(&path).unwrap().is_none());
        assert!(f.store.prototypes().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Stat / listing
    // -----------------------------------------------------------------------

    #[test]
    fn stat_reports_virtual_size() {
        let f = fixture();
        let path = f.real.join("v.txt");
        fs::write(&path, "longer on disk").unwrap();
        f.store.write_file(&path, b"abc", false).unwrap();
        let entry = f.store.stat(&path).unwrap();
        assert!(entry.is_virtual);
        assert_eq!(entry.size, 3);
    }

    #[test]
    fn virtual_directories_exist() {
        let f = fixture();
        let dir = f.real.join("new").join("deep");
        f.store.write_file(&dir.join("file"), b"x", false).unwrap();
        assert!(f.store.exists(&dir).unwrap());
        assert!(f.store.stat(&dir).unwrap().is_dir());
        assert!(!f.store.exists(&f.real.join("other")).unwrap());
    }

    #[test]
    fn listing_unions_and_prefers_overlay() {
        let f = fixture();
        fs::write(f.real.join("a"), "real a").unwrap();
        fs::write(f.real.join("b"), "real b").unwrap();
        f.store.write_file(&f.real.join("b"), b"virtual", false).unwrap();
        f.store.write_file(&f.real.join("c").join("d"), b"x", false).unwrap();

        let entries = f.store.list_directory(&f.real).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(!entries[0].is_virtual);
        assert!(entries[1].is_virtual);
        assert_eq!(entries[1].size, 7);
        assert!(entries[2].is_dir());
    }

    #[test]
    fn listing_a_file_fails() {
        let f = fixture();
        fs::write(f.real.join("file"), "x").unwrap();
        assert!(matches!(
            f.store.list_directory(&f.real.join("file")).unwrap_err(),
            OverlayError::NotADirectory { .. }
        ));
    }

    #[test]
    fn listing_missing_dir_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.store.list_directory(&f.real.join("nope")).unwrap_err(),
            OverlayError::NotFound { .. }
        ));
    }

    // -----------------------------------------------------------------------
    // Prototypes / clear
    // -----------------------------------------------------------------------

    #[test]
    fn prototypes_lists_real_paths_sorted() {
        let f = fixture();
        f.store.write_file(&f.real.join("z"), b"1", false).unwrap();
        f.store.write_file(&f.real.join("a").join("b"), b"2", false).unwrap();
        assert_eq!(
            f.store.prototypes().unwrap(),
            vec![f.real.join("a").join("b"), f.real.join("z")]
        );
    }

    #[test]
    fn clear_drops_everything() {
        let f = fixture();
        f.store.write_file(&f.real.join("z"), b"1", false).unwrap();
        f.store.clear().unwrap();
        assert!(f.store.prototypes().unwrap().is_empty());
        f.store.clear().unwrap();
    }
}
