//! CodeResources generation.
//!
//! Emits the v2 `_CodeSignature/CodeResources` plist: `files` (legacy SHA-1
//! entries), `files2` (SHA-1 + SHA-256, plus `cdhash` entries for nested
//! bundles), and the fixed `rules`/`rules2` presets. Written as a binary
//! plist with lexicographically sorted keys so output is byte-stable for
//! identical trees.

use crate::digest::sha1_sha256;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A classified bundle entry.
enum ResourceEntry {
    /// Regular file hashed into `files` and `files2`.
    File {
        sha1: [u8; 20],
        sha256: [u8; 32],
        optional: bool,
    },
    /// Symlink recorded by target path in `files2` only.
    Symlink { target: String },
    /// Nested bundle: hashes of its main executable plus its CDHash.
    NestedBundle {
        sha1: [u8; 20],
        sha256: [u8; 32],
        cdhash: [u8; 20],
    },
}

/// Builder for the CodeResources plist of one bundle.
pub struct CodeResourcesBuilder {
    bundle_path: PathBuf,
    /// Main executable, bundle-relative; never listed.
    main_executable: Option<String>,
    /// Nested bundle directories, bundle-relative; their contents are not
    /// walked as plain resources.
    nested_bundles: Vec<String>,
    entries: BTreeMap<String, ResourceEntry>,
}

/// Legacy v1 rules preset.
fn rules_preset() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".into(), Value::Boolean(true));

    let mut lproj = Dictionary::new();
    lproj.insert("optional".into(), Value::Boolean(true));
    lproj.insert("weight".into(), Value::Real(1000.0));
    rules.insert("^.*\\.lproj/".into(), Value::Dictionary(lproj));

    let mut locversion = Dictionary::new();
    locversion.insert("omit".into(), Value::Boolean(true));
    locversion.insert("weight".into(), Value::Real(1100.0));
    rules.insert(
        "^.*\\.lproj/locversion.plist$".into(),
        Value::Dictionary(locversion),
    );

    let mut base_lproj = Dictionary::new();
    base_lproj.insert("weight".into(), Value::Real(1010.0));
    rules.insert("^Base\\.lproj/".into(), Value::Dictionary(base_lproj));

    rules.insert("^version.plist$".into(), Value::Boolean(true));
    rules
}

/// v2 rules preset with nested/omit/weight attributes.
fn rules2_preset() -> Dictionary {
    let mut rules2 = Dictionary::new();
    rules2.insert("^.*".into(), Value::Boolean(true));

    let mut dsym = Dictionary::new();
    dsym.insert("weight".into(), Value::Real(11.0));
    rules2.insert(".*\\.dSYM($|/)".into(), Value::Dictionary(dsym));

    let mut ds_store = Dictionary::new();
    ds_store.insert("omit".into(), Value::Boolean(true));
    ds_store.insert("weight".into(), Value::Real(2000.0));
    rules2.insert("^(.*/)?\\.DS_Store$".into(), Value::Dictionary(ds_store));

    let mut nested = Dictionary::new();
    nested.insert("nested".into(), Value::Boolean(true));
    nested.insert("weight".into(), Value::Real(10.0));
    rules2.insert(
        "^(Frameworks|SharedFrameworks|PlugIns|Plug-ins|XPCServices|Helpers|MacOS|Library/(Automator|Spotlight|LoginItems))/".into(),
        Value::Dictionary(nested),
    );

    let mut lproj = Dictionary::new();
    lproj.insert("optional".into(), Value::Boolean(true));
    lproj.insert("weight".into(), Value::Real(1000.0));
    rules2.insert("^.*\\.lproj/".into(), Value::Dictionary(lproj));

    let mut locversion = Dictionary::new();
    locversion.insert("omit".into(), Value::Boolean(true));
    locversion.insert("weight".into(), Value::Real(1100.0));
    rules2.insert(
        "^.*\\.lproj/locversion.plist$".into(),
        Value::Dictionary(locversion),
    );

    let mut base_lproj = Dictionary::new();
    base_lproj.insert("weight".into(), Value::Real(1010.0));
    rules2.insert("^Base\\.lproj/".into(), Value::Dictionary(base_lproj));

    let mut info_plist = Dictionary::new();
    info_plist.insert("omit".into(), Value::Boolean(true));
    info_plist.insert("weight".into(), Value::Real(20.0));
    rules2.insert("^Info\\.plist$".into(), Value::Dictionary(info_plist));

    let mut pkg_info = Dictionary::new();
    pkg_info.insert("omit".into(), Value::Boolean(true));
    pkg_info.insert("weight".into(), Value::Real(20.0));
    rules2.insert("^PkgInfo$".into(), Value::Dictionary(pkg_info));

    let mut embedded = Dictionary::new();
    embedded.insert("weight".into(), Value::Real(20.0));
    rules2.insert(
        "^embedded\\.provisionprofile$".into(),
        Value::Dictionary(embedded),
    );

    let mut version_plist = Dictionary::new();
    version_plist.insert("weight".into(), Value::Real(20.0));
    rules2.insert("^version\\.plist$".into(), Value::Dictionary(version_plist));

    rules2
}

impl CodeResourcesBuilder {
    /// Create a builder for `bundle_path`.
    ///
    /// `main_executable` is the bundle-relative main executable (excluded
    /// from the listing); `nested_bundles` are bundle-relative child bundle
    /// directories whose contents are covered by their own signatures.
    pub fn new(
        bundle_path: impl AsRef<Path>,
        main_executable: Option<String>,
        nested_bundles: Vec<String>,
    ) -> Self {
        Self {
            bundle_path: bundle_path.as_ref().to_path_buf(),
            main_executable,
            nested_bundles,
            entries: BTreeMap::new(),
        }
    }

    fn is_excluded(&self, rel: &str) -> bool {
        if rel == "_CodeSignature" || rel.starts_with("_CodeSignature/") {
            return true;
        }
        if rel == ".DS_Store" || rel.ends_with("/.DS_Store") {
            return true;
        }
        if Some(rel) == self.main_executable.as_deref() {
            return true;
        }
        false
    }

    fn in_nested_bundle(&self, rel: &str) -> bool {
        self.nested_bundles
            .iter()
            .any(|nested| rel == nested || rel.starts_with(&format!("{}/", nested)))
    }

    /// Walk the bundle and hash every resource file.
    pub fn scan(&mut self) -> Result<&mut Self> {
        let bundle_path = self.bundle_path.clone();
        let candidates: Vec<(String, PathBuf, bool)> = WalkDir::new(&bundle_path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let path = entry.path().to_path_buf();
                let rel = path
                    .strip_prefix(&bundle_path)
                    .ok()?
                    .to_string_lossy()
                    .into_owned();
                if rel.is_empty() {
                    return None;
                }
                let meta = fs::symlink_metadata(&path).ok()?;
                let is_symlink = meta.file_type().is_symlink();
                if !is_symlink && meta.is_dir() {
                    return None;
                }
                if self.is_excluded(&rel) || self.in_nested_bundle(&rel) {
                    return None;
                }
                Some((rel, path, is_symlink))
            })
            .collect();

        let hashed: Vec<Result<(String, ResourceEntry)>> = candidates
            .par_iter()
            .map(|(rel, path, is_symlink)| {
                let entry = if *is_symlink {
                    read_symlink_entry(path)?
                } else {
                    let data = fs::read(path)?;
                    let (sha1, sha256) = sha1_sha256(&data);
                    ResourceEntry::File {
                        sha1,
                        sha256,
                        optional: rel.contains(".lproj/"),
                    }
                };
                Ok((rel.clone(), entry))
            })
            .collect();

        for result in hashed {
            let (rel, entry) = result?;
            self.entries.insert(rel, entry);
        }
        Ok(self)
    }

    /// Record a nested bundle entry.
    ///
    /// `executable_bytes` is the child's signed main executable;
    /// `cdhash` is the SHA-1 CDHash of its primary CodeDirectory.
    pub fn add_nested_bundle(&mut self, rel: impl Into<String>, executable_bytes: &[u8], cdhash: [u8; 20]) {
        let (sha1, sha256) = sha1_sha256(executable_bytes);
        self.entries.insert(
            rel.into(),
            ResourceEntry::NestedBundle {
                sha1,
                sha256,
                cdhash,
            },
        );
    }

    /// Add a plain file entry without touching the filesystem.
    pub fn add_file(&mut self, rel: impl Into<String>, data: &[u8], optional: bool) {
        let (sha1, sha256) = sha1_sha256(data);
        self.entries.insert(
            rel.into(),
            ResourceEntry::File {
                sha1,
                sha256,
                optional,
            },
        );
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the listing is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialise to a binary plist.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut files = Dictionary::new();
        for (rel, entry) in &self.entries {
            match entry {
                ResourceEntry::File {
                    sha1, optional, ..
                } => {
                    if *optional {
                        let mut dict = Dictionary::new();
                        dict.insert("hash".into(), Value::Data(sha1.to_vec()));
                        dict.insert("optional".into(), Value::Boolean(true));
                        files.insert(rel.clone(), Value::Dictionary(dict));
                    } else {
                        files.insert(rel.clone(), Value::Data(sha1.to_vec()));
                    }
                }
                // Symlinks and nested bundles only exist in files2.
                ResourceEntry::Symlink { .. } | ResourceEntry::NestedBundle { .. } => {}
            }
        }

        let mut files2 = Dictionary::new();
        for (rel, entry) in &self.entries {
            // The v2 rules omit these from files2 while files keeps them.
            if rel == "Info.plist" || rel == "PkgInfo" {
                continue;
            }
            let mut dict = Dictionary::new();
            match entry {
                ResourceEntry::File {
                    sha1,
                    sha256,
                    optional,
                } => {
                    dict.insert("hash".into(), Value::Data(sha1.to_vec()));
                    dict.insert("hash2".into(), Value::Data(sha256.to_vec()));
                    if *optional {
                        dict.insert("optional".into(), Value::Boolean(true));
                    }
                }
                ResourceEntry::Symlink { target } => {
                    dict.insert("symlink".into(), Value::String(target.clone()));
                }
                ResourceEntry::NestedBundle {
                    sha1,
                    sha256,
                    cdhash,
                } => {
                    dict.insert("cdhash".into(), Value::Data(cdhash.to_vec()));
                    dict.insert("hash".into(), Value::Data(sha1.to_vec()));
                    dict.insert("hash2".into(), Value::Data(sha256.to_vec()));
                }
            }
            files2.insert(rel.clone(), Value::Dictionary(dict));
        }

        let mut root = Dictionary::new();
        root.insert("files".into(), Value::Dictionary(files));
        root.insert("files2".into(), Value::Dictionary(files2));
        root.insert("rules".into(), Value::Dictionary(rules_preset()));
        root.insert("rules2".into(), Value::Dictionary(rules2_preset()));

        let mut buf = Vec::new();
        Value::Dictionary(root)
            .to_writer_binary(&mut buf)
            .map_err(Error::Plist)?;
        Ok(buf)
    }
}

#[cfg(unix)]
fn read_symlink_entry(path: &Path) -> Result<ResourceEntry> {
    let target = fs::read_link(path)?;
    Ok(ResourceEntry::Symlink {
        target: target.to_string_lossy().into_owned(),
    })
}

#[cfg(not(unix))]
fn read_symlink_entry(_path: &Path) -> Result<ResourceEntry> {
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    )))
}
