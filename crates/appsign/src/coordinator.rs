//! Top-level signing orchestration.
//!
//! Walks the bundle tree leaf-first and, per node: signs the loose Mach-O
//! files it owns, regenerates `_CodeSignature/CodeResources` with freshly
//! computed child CDHashes, then re-signs the main executable against the
//! new resource hashes. All rewritten files go through a sibling temporary
//! path and an atomic rename, so a failure never leaves partial output at
//! the target.

use crate::bundle::code_resources::CodeResourcesBuilder;
use crate::bundle::walker::{build_plan, BundleNode};
use crate::crypto::identity::SigningIdentity;
use crate::macho::editor;
use crate::macho::signer::{sign_image, SliceSigningParams};
use crate::macho::MachOImage;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Entitlements used for non-executable images (dylibs, frameworks).
const EMPTY_ENTITLEMENTS: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n<plist version=\"1.0\">\n<dict/>\n</plist>\n";

/// Caller options for one signing run.
#[derive(Debug, Default, Clone)]
pub struct SignOptions {
    /// Replace the root bundle's `CFBundleIdentifier`.
    pub bundle_id: Option<String>,
    /// Replace the root bundle's `CFBundleDisplayName`.
    pub display_name: Option<String>,
    /// Replace `CFBundleVersion` and `CFBundleShortVersionString`.
    pub bundle_version: Option<String>,
    /// Copy this dylib into the bundle and inject a load command for it
    /// into the main executable.
    pub dylib_file: Option<PathBuf>,
    /// Inject with `LC_LOAD_WEAK_DYLIB` instead of `LC_LOAD_DYLIB`.
    pub weak_inject: bool,
    /// Skip writing `embedded.mobileprovision` into the root bundle.
    pub suppress_embedded_profile: bool,
}

/// Signs one bundle tree with one identity.
pub struct SignCoordinator<'a> {
    identity: &'a SigningIdentity,
    options: SignOptions,
}

impl<'a> SignCoordinator<'a> {
    /// Create a coordinator for `identity`.
    pub fn new(identity: &'a SigningIdentity, options: SignOptions) -> Self {
        Self { identity, options }
    }

    /// Sign the `.app` directory at `app_path` in place.
    pub fn sign(&self, app_path: &Path) -> Result<()> {
        if !app_path.join("Info.plist").is_file() {
            return Err(Error::MalformedBundle(format!(
                "{} has no Info.plist",
                app_path.display()
            )));
        }

        // Info.plist edits and the embedded profile land on disk before
        // anything is hashed.
        self.apply_root_overrides(app_path)?;
        if !self.options.suppress_embedded_profile {
            if let Some(profile) = self.identity.profile() {
                write_atomic(&app_path.join("embedded.mobileprovision"), profile.raw())?;
            }
        }
        if let Some(dylib_file) = &self.options.dylib_file {
            let name = dylib_file
                .file_name()
                .ok_or_else(|| Error::MalformedBundle("dylib path has no file name".into()))?;
            fs::copy(dylib_file, app_path.join(name))?;
        }

        let plan = build_plan(app_path)?;
        info!(
            "signing {} with {} bundle node(s), team {}",
            app_path.display(),
            plan.nodes.len(),
            self.identity.team_id()
        );

        let mut cdhashes: HashMap<PathBuf, [u8; 20]> = HashMap::new();
        for node in &plan.nodes {
            let result = self.sign_node(node, &mut cdhashes);
            if node.depth == 0 {
                result?;
            } else {
                result.map_err(|e| Error::ChildSign {
                    path: node.path.clone(),
                    source: Box::new(e),
                })?;
            }
        }
        Ok(())
    }

    /// Apply bundle id / display name / version overrides to the root
    /// Info.plist.
    fn apply_root_overrides(&self, app_path: &Path) -> Result<()> {
        if self.options.bundle_id.is_none()
            && self.options.display_name.is_none()
            && self.options.bundle_version.is_none()
        {
            return Ok(());
        }

        let info_path = app_path.join("Info.plist");
        if !info_path.exists() {
            return Err(Error::MalformedBundle(format!(
                "{} has no Info.plist",
                app_path.display()
            )));
        }
        let mut info = plist::Value::from_file(&info_path)?
            .into_dictionary()
            .ok_or_else(|| {
                Error::MalformedBundle(format!("{} Info.plist is not a dict", app_path.display()))
            })?;

        if let Some(bundle_id) = &self.options.bundle_id {
            info.insert(
                "CFBundleIdentifier".into(),
                plist::Value::String(bundle_id.clone()),
            );
        }
        if let Some(name) = &self.options.display_name {
            info.insert(
                "CFBundleDisplayName".into(),
                plist::Value::String(name.clone()),
            );
        }
        if let Some(version) = &self.options.bundle_version {
            info.insert(
                "CFBundleVersion".into(),
                plist::Value::String(version.clone()),
            );
            info.insert(
                "CFBundleShortVersionString".into(),
                plist::Value::String(version.clone()),
            );
        }

        let mut buf = Vec::new();
        plist::Value::Dictionary(info).to_writer_xml(&mut buf)?;
        write_atomic(&info_path, &buf)
    }

    /// Sign one bundle node: loose binaries, CodeResources, main executable.
    fn sign_node(&self, node: &BundleNode, cdhashes: &mut HashMap<PathBuf, [u8; 20]>) -> Result<()> {
        debug!("signing bundle node {}", node.path.display());

        // Inject into the root main executable before its bytes are hashed.
        if node.depth == 0 {
            if let Some(dylib_file) = &self.options.dylib_file {
                let name = dylib_file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("injected.dylib");
                let install_path = format!("@executable_path/{}", name);
                let mut image = MachOImage::open(&node.executable)?;
                if editor::inject_dylib(&mut image, &install_path, self.options.weak_inject)? {
                    info!("injected {} into {}", install_path, node.executable.display());
                    write_atomic(&node.executable, image.data())?;
                }
            }
        }

        // Loose Mach-O files owned by this node first; their signed bytes
        // end up in CodeResources.
        for path in self.loose_binaries(node)? {
            self.sign_loose_binary(&path)?;
        }

        // CodeResources with freshly computed child hashes.
        let exec_rel = node
            .executable
            .strip_prefix(&node.path)
            .map(|p| p.to_string_lossy().into_owned())
            .ok();
        let child_rels: Vec<String> = node
            .children
            .iter()
            .filter_map(|c| c.strip_prefix(&node.path).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        let mut builder = CodeResourcesBuilder::new(&node.path, exec_rel, child_rels);
        builder.scan()?;
        for child in &node.children {
            let rel = match child.strip_prefix(&node.path) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let cdhash = cdhashes.get(child).copied().ok_or_else(|| {
                Error::MalformedBundle(format!(
                    "nested bundle {} was not signed before its parent",
                    child.display()
                ))
            })?;
            let child_exec = child_executable(child)?;
            let exec_bytes = fs::read(&child_exec)?;
            builder.add_nested_bundle(rel, &exec_bytes, cdhash);
        }
        let code_resources = builder.build()?;
        let codesig_dir = node.path.join("_CodeSignature");
        fs::create_dir_all(&codesig_dir)?;
        write_atomic(&codesig_dir.join("CodeResources"), &code_resources)?;

        // Main executable last, against the final resource hashes.
        let info_plist = fs::read(node.path.join("Info.plist"))?;
        let image = MachOImage::open(&node.executable)?;
        let is_executable = image
            .slices()
            .first()
            .map(|s| s.is_executable)
            .unwrap_or(false);
        // Framework binaries are dylibs; they get empty entitlements.
        let (entitlements, entitlements_der) = if is_executable {
            (
                self.identity.entitlements().or(Some(EMPTY_ENTITLEMENTS)),
                self.identity.entitlements_der(),
            )
        } else {
            (Some(EMPTY_ENTITLEMENTS), None)
        };
        let signed = sign_image(
            image,
            &SliceSigningParams {
                identifier: &node.bundle_id,
                team_id: Some(self.identity.team_id()),
                info_plist: Some(&info_plist),
                code_resources: Some(&code_resources),
                entitlements,
                entitlements_der,
                allow_unsigned_exec: is_executable && self.identity.get_task_allow(),
                identity: self.identity,
            },
        )?;
        write_atomic(&node.executable, &signed.data)?;
        cdhashes.insert(node.path.clone(), signed.cdhash);
        info!(
            "signed {} as {}",
            node.executable.display(),
            node.bundle_id
        );
        Ok(())
    }

    /// Mach-O files directly owned by a node: everything outside nested
    /// bundles and `_CodeSignature`, except the main executable.
    fn loose_binaries(&self, node: &BundleNode) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&node.path)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let path = e.path();
                if !e.file_type().is_dir() {
                    return true;
                }
                path.file_name().map_or(true, |n| n != "_CodeSignature")
                    && !node.children.iter().any(|c| c.as_path() == path)
            })
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || path == node.executable {
                continue;
            }
            if is_macho_file(path)? {
                out.push(path.to_path_buf());
            }
        }
        Ok(out)
    }

    /// Sign a loose binary: identifier from the file stem, no Info.plist or
    /// CodeResources slots, empty entitlements unless it is an executable.
    fn sign_loose_binary(&self, path: &Path) -> Result<()> {
        let image = MachOImage::open(path)?;
        let is_executable = image
            .slices()
            .first()
            .map(|s| s.is_executable)
            .unwrap_or(false);
        let identifier = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed")
            .to_string();

        let (entitlements, entitlements_der) = if is_executable {
            (
                self.identity.entitlements().or(Some(EMPTY_ENTITLEMENTS)),
                self.identity.entitlements_der(),
            )
        } else {
            (Some(EMPTY_ENTITLEMENTS), None)
        };

        debug!("signing loose binary {}", path.display());
        let signed = sign_image(
            image,
            &SliceSigningParams {
                identifier: &identifier,
                team_id: Some(self.identity.team_id()),
                info_plist: None,
                code_resources: None,
                entitlements,
                entitlements_der,
                allow_unsigned_exec: false,
                identity: self.identity,
            },
        )?;
        write_atomic(path, &signed.data)
    }
}

/// Main executable path of an already-signed child bundle.
fn child_executable(bundle: &Path) -> Result<PathBuf> {
    let info = plist::Value::from_file(bundle.join("Info.plist"))?
        .into_dictionary()
        .ok_or_else(|| {
            Error::MalformedBundle(format!("{} Info.plist is not a dict", bundle.display()))
        })?;
    let name = info
        .get("CFBundleExecutable")
        .and_then(plist::Value::as_string)
        .map(str::to_string)
        .or_else(|| {
            bundle
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            Error::MalformedBundle(format!("{} has no executable name", bundle.display()))
        })?;
    Ok(bundle.join(name))
}

/// True when the file starts with a Mach-O or fat magic.
fn is_macho_file(path: &Path) -> Result<bool> {
    use std::io::Read;
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(false),
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return Ok(false);
    }
    Ok(matches!(
        magic,
        [0xfe, 0xed, 0xfa, 0xce]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe]
            | [0xbe, 0xba, 0xfe, 0xca]
    ))
}

/// Write through a sibling temp file, fsync, and rename over the target.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::MalformedBundle(format!("{} has no parent", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Append a load command for `dylib_path` to the executable at `path`.
///
/// `create_if_absent` controls whether a missing reference is added; when
/// false only an existing reference is refreshed. Returns whether the file
/// changed.
pub fn inject_dylib(
    path: &Path,
    dylib_path: &str,
    weak: bool,
    create_if_absent: bool,
) -> Result<bool> {
    let mut image = MachOImage::open(path)?;
    let present = editor::list_dylibs(&image).iter().any(|p| p == dylib_path);
    if present {
        return Ok(false);
    }
    if !create_if_absent {
        warn!(
            "{} does not reference {} and creation was not requested",
            path.display(),
            dylib_path
        );
        return Ok(false);
    }
    let changed = editor::inject_dylib(&mut image, dylib_path, weak)?;
    if changed {
        write_atomic(path, image.data())?;
    }
    Ok(changed)
}

/// Install paths referenced by the executable at `path`.
pub fn list_dylibs(path: &Path) -> Result<Vec<String>> {
    let image = MachOImage::open(path)?;
    Ok(editor::list_dylibs(&image))
}

/// Remove every load command whose dylib basename is in `names`.
pub fn uninstall_dylibs(path: &Path, names: &[String]) -> Result<bool> {
    let mut image = MachOImage::open(path)?;
    let set: BTreeSet<String> = names.iter().cloned().collect();
    let changed = editor::remove_dylibs(&mut image, &set)?;
    if changed {
        write_atomic(path, image.data())?;
    }
    Ok(changed)
}

/// Rewrite a dylib install path in the executable at `path`.
pub fn change_dylib_path(path: &Path, old: &str, new: &str) -> Result<bool> {
    let mut image = MachOImage::open(path)?;
    let changed = editor::change_dylib_path(&mut image, old, new)?;
    if changed {
        write_atomic(path, image.data())?;
    }
    Ok(changed)
}
