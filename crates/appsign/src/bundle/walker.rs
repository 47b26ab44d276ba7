//! Bundle discovery and signing order.
//!
//! Walks a bundle tree, recognising nested bundles by directory extension
//! (`.app`, `.appex`, `.framework`, `.xpc`) or by an `Info.plist` declaring
//! a signable `CFBundlePackageType`, and produces a [`SigningPlan`]:
//! deepest bundles first, ties broken by path, so every child is fully
//! signed before its parent hashes it.

use crate::{Error, Result};
use log::debug;
use plist::{Dictionary, Value};
use std::cmp::Reverse;
use std::path::{Path, PathBuf};

/// Bundle subdirectories scanned for nested bundles.
const NESTED_BUNDLE_DIRS: [&str; 5] = [
    "PlugIns",
    "Frameworks",
    "Watch",
    "XPCServices",
    "SystemExtensions",
];

/// Directory extensions treated as bundles.
const BUNDLE_EXTENSIONS: [&str; 4] = ["app", "appex", "framework", "xpc"];

/// Package types from Info.plist treated as signable bundles.
const SIGNABLE_PACKAGE_TYPES: [&str; 3] = ["APPL", "XPC!", "FMWK"];

/// One bundle directory within the tree.
#[derive(Debug, Clone)]
pub struct BundleNode {
    /// Absolute bundle path.
    pub path: PathBuf,
    /// Decoded Info.plist.
    pub info: Dictionary,
    /// `CFBundleIdentifier`, falling back to the directory stem.
    pub bundle_id: String,
    /// Main executable path (absolute), from `CFBundleExecutable`.
    pub executable: PathBuf,
    /// Direct child bundle paths (absolute), lexicographically ordered.
    pub children: Vec<PathBuf>,
    /// Nesting depth; the root bundle is 0.
    pub depth: usize,
}

/// Topologically sorted signing order: leaves first.
#[derive(Debug)]
pub struct SigningPlan {
    /// Bundle nodes, deepest first; every child precedes its parent.
    pub nodes: Vec<BundleNode>,
}

/// Whether `path` is a bundle directory.
pub fn is_bundle_dir(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if BUNDLE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return true;
        }
    }
    // Fall back to the declared package type.
    let info_path = path.join("Info.plist");
    if !info_path.exists() {
        return false;
    }
    plist::Value::from_file(&info_path)
        .ok()
        .and_then(|v| v.into_dictionary())
        .and_then(|d| {
            d.get("CFBundlePackageType")
                .and_then(Value::as_string)
                .map(|t| SIGNABLE_PACKAGE_TYPES.contains(&t))
        })
        .unwrap_or(false)
}

/// Read one bundle directory into a node, without recursing.
fn read_node(path: &Path, depth: usize) -> Result<BundleNode> {
    let info_path = path.join("Info.plist");
    if !info_path.exists() {
        return Err(Error::MalformedBundle(format!(
            "{} has no Info.plist",
            path.display()
        )));
    }
    let info = plist::Value::from_file(&info_path)?
        .into_dictionary()
        .ok_or_else(|| {
            Error::MalformedBundle(format!("{} Info.plist is not a dict", path.display()))
        })?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();
    let bundle_id = info
        .get("CFBundleIdentifier")
        .and_then(Value::as_string)
        .map(str::to_string)
        .unwrap_or_else(|| stem.clone());
    let executable_name = info
        .get("CFBundleExecutable")
        .and_then(Value::as_string)
        .map(str::to_string)
        .unwrap_or(stem);
    let executable = path.join(&executable_name);
    if !executable.is_file() {
        return Err(Error::MalformedBundle(format!(
            "{} main executable {} is missing",
            path.display(),
            executable_name
        )));
    }

    let mut children = Vec::new();
    for dir in NESTED_BUNDLE_DIRS {
        let subdir = path.join(dir);
        if !subdir.is_dir() {
            continue;
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&subdir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_bundle_dir(p))
            .collect();
        entries.sort();
        children.extend(entries);
    }

    Ok(BundleNode {
        path: path.to_path_buf(),
        info,
        bundle_id,
        executable,
        children,
        depth,
    })
}

/// Build the signing plan for the bundle rooted at `root`.
pub fn build_plan(root: &Path) -> Result<SigningPlan> {
    if !root.is_dir() {
        return Err(Error::MalformedBundle(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut nodes = Vec::new();
    let mut pending = vec![(root.to_path_buf(), 0usize)];
    while let Some((path, depth)) = pending.pop() {
        let node = read_node(&path, depth)?;
        debug!(
            "bundle {} (id {}, depth {}, {} children)",
            node.path.display(),
            node.bundle_id,
            depth,
            node.children.len()
        );
        for child in &node.children {
            pending.push((child.clone(), depth + 1));
        }
        nodes.push(node);
    }

    nodes.sort_by(|a, b| {
        Reverse(a.depth)
            .cmp(&Reverse(b.depth))
            .then_with(|| a.path.cmp(&b.path))
    });

    Ok(SigningPlan { nodes })
}
