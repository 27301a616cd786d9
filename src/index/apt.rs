// src/index/apt.rs

//! Debian archive index
//!
//! Fetches Release and Packages files from a mirror, resolves dependency
//! closures by name, and drives archive downloads plus the in-chroot commit
//! transaction.

use super::{MultiArch, Package, PackageIndex, Priority, PriorityClass};
use crate::chroot;
use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::fetch::{self, HttpClient};
use crate::progress::ProgressTracker;
use crate::status::StatusDb;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// dpkg invocations run by `commit`.
const UNPACK_ARGS: &[&str] = &["--unpack", "--force-depends", "--force-unsafe-io"];
const CONFIGURE_ARGS: &[&str] = &[
    "--configure",
    "--pending",
    "--force-configure-any",
    "--force-depends",
    "--force-unsafe-io",
];

/// Archive index backed by a Debian-format mirror.
pub struct AptIndex {
    url: String,
    suite: String,
    components: Vec<String>,
    arch: String,
    recommends: bool,
    target: PathBuf,
    cache_dir: PathBuf,
    lists_dir: PathBuf,
    client: HttpClient,
    /// Best candidate per package name
    packages: HashMap<String, Package>,
    /// Virtual name -> real providers
    provides: HashMap<String, Vec<String>>,
    /// Installed set read from the target's status file
    installed: HashMap<String, String>,
    marked: BTreeSet<String>,
}

impl AptIndex {
    pub fn new(config: &BootstrapConfig) -> Result<Self> {
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            suite: config.suite.clone(),
            components: config.components.clone(),
            arch: config.arch.clone(),
            recommends: config.recommends,
            target: config.target.clone(),
            cache_dir: config.archive_cache(),
            lists_dir: config.target.join("var/lib/apt/lists"),
            client: HttpClient::new()?,
            packages: HashMap::new(),
            provides: HashMap::new(),
            installed: HashMap::new(),
            marked: BTreeSet::new(),
        })
    }

    fn dist_url(&self, rest: &str) -> String {
        format!("{}/dists/{}/{}", self.url, self.suite, rest)
    }

    /// SHA256 table from the suite's Release file: `path -> digest`.
    fn fetch_release(&self) -> HashMap<String, String> {
        let url = self.dist_url("Release");
        let text = match self.client.get_bytes(&url) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("no Release file at {url} ({e}); indices will not be verified");
                return HashMap::new();
            }
        };
        parse_release_sha256(&text)
    }

    /// Download one component's Packages index, trying the compressed
    /// variants mirrors actually serve.
    fn fetch_packages(&self, component: &str, release: &HashMap<String, String>) -> Result<String> {
        let mut last_err = Error::FetchFailed(format!("no Packages index for {component}"));
        for ext in [".xz", ".gz", ""] {
            let rel = format!("{component}/binary-{}/Packages{ext}", self.arch);
            let url = self.dist_url(&rel);
            let raw = match self.client.get_bytes(&url) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("{url}: {e}");
                    last_err = e;
                    continue;
                }
            };

            match release.get(&rel) {
                Some(expected) => {
                    let actual = fetch::sha256_bytes(&raw);
                    if &actual != expected {
                        return Err(Error::ChecksumMismatch {
                            name: rel,
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
                None if !release.is_empty() => {
                    warn!("{rel} is not listed in the Release file");
                }
                None => {}
            }

            fs::create_dir_all(&self.lists_dir)?;
            let cache_name = format!(
                "{}_dists_{}_{}",
                sanitize_url(&self.url),
                self.suite,
                rel.replace('/', "_")
            );
            fs::write(self.lists_dir.join(cache_name), &raw)?;

            let text = crate::compression::decompress_auto(&raw)
                .map_err(|e| Error::FetchFailed(format!("failed to decompress {url}: {e}")))?;
            return String::from_utf8(text)
                .map_err(|e| Error::FetchFailed(format!("{url} is not valid UTF-8: {e}")));
        }
        Err(last_err)
    }

    /// Merge one Packages file into the candidate table, keeping the
    /// highest version per name.
    fn parse_packages(&mut self, text: &str) {
        for stanza in text.split("\n\n") {
            let Some(pkg) = parse_stanza(stanza) else {
                continue;
            };
            for virt in &pkg.provides {
                self.provides
                    .entry(virt.clone())
                    .or_default()
                    .push(pkg.name.clone());
            }
            match self.packages.get(&pkg.name) {
                Some(existing)
                    if compare_versions(&existing.version, &pkg.version) != Ordering::Less => {}
                _ => {
                    self.packages.insert(pkg.name.clone(), pkg);
                }
            }
        }
    }

    /// Map a (possibly virtual) name to a real candidate name.
    fn resolve_name(&self, name: &str) -> Option<String> {
        if self.packages.contains_key(name) {
            return Some(name.to_string());
        }
        self.provides
            .get(name)
            .and_then(|providers| providers.first())
            .cloned()
    }

    /// Mark `name` and walk its dependency closure.
    fn mark_closure(&mut self, name: String) -> Result<()> {
        let mut work = vec![name];
        while let Some(name) = work.pop() {
            if self.marked.contains(&name) || self.installed.contains_key(&name) {
                continue;
            }
            let Some(pkg) = self.packages.get(&name) else {
                // Virtual-only name reached through a dependency: the
                // resolver hands us a provider instead.
                continue;
            };
            self.marked.insert(name.clone());

            let mut groups: Vec<(Vec<String>, bool)> = Vec::new();
            for group in pkg.pre_depends.iter().chain(pkg.depends.iter()) {
                groups.push((group.clone(), true));
            }
            if self.recommends {
                for group in &pkg.recommends {
                    groups.push((group.clone(), false));
                }
            }

            for (group, hard) in groups {
                let chosen = group.iter().find_map(|alt| self.resolve_name(alt));
                match chosen {
                    Some(dep) => work.push(dep),
                    None if hard => {
                        return Err(Error::DependencyUnresolved {
                            package: name,
                            dependency: group.join(" | "),
                        });
                    }
                    None => {
                        debug!("skipping unavailable recommends {} of {}", group.join(" | "), name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Download work list for the current change set.
    fn download_plan(&self) -> Vec<(String, String, PathBuf, Option<String>, u64)> {
        self.changes()
            .into_iter()
            .map(|pkg| {
                (
                    pkg.name.clone(),
                    format!("{}/{}", self.url, pkg.filename),
                    self.archive_path(pkg),
                    pkg.sha256.clone(),
                    pkg.size,
                )
            })
            .collect()
    }
}

impl PackageIndex for AptIndex {
    fn update(&mut self) -> Result<()> {
        self.packages.clear();
        self.provides.clear();

        let release = self.fetch_release();
        for component in self.components.clone() {
            let text = self.fetch_packages(&component, &release)?;
            self.parse_packages(&text);
        }
        info!(
            "index holds {} packages for {}/{} [{}]",
            self.packages.len(),
            self.suite,
            self.components.join(","),
            self.arch
        );
        self.open()
    }

    fn open(&mut self) -> Result<()> {
        self.installed = StatusDb::new(&self.target).installed()?;
        Ok(())
    }

    fn filter_by_priority(&self, class: PriorityClass) -> Vec<&Package> {
        let mut matched: Vec<&Package> = self
            .packages
            .values()
            .filter(|pkg| match class {
                PriorityClass::Essential => pkg.essential,
                PriorityClass::Required => pkg.priority == Priority::Required,
                PriorityClass::Important => pkg.priority == Priority::Important,
                PriorityClass::Requested => false,
            })
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        matched
    }

    fn mark_install(&mut self, name: &str) -> Result<()> {
        let resolved = self
            .resolve_name(name)
            .ok_or_else(|| Error::UnknownPackage(name.to_string()))?;
        self.mark_closure(resolved)
    }

    fn changes(&self) -> Vec<&Package> {
        self.marked
            .iter()
            .filter(|name| !self.installed.contains_key(*name))
            .filter_map(|name| self.packages.get(name))
            .collect()
    }

    fn fetch_archives(&mut self, progress: &dyn ProgressTracker) -> Result<()> {
        let plan = self.download_plan();
        info!("fetching {} archives", plan.len());
        fs::create_dir_all(&self.cache_dir)?;

        for (name, url, dest, sha256, _size) in plan {
            if let (true, Some(expected)) = (dest.is_file(), sha256.as_ref()) {
                if fetch::verify_sha256(&dest, expected).is_ok() {
                    debug!("{} already cached", name);
                    continue;
                }
            }
            progress.set_message(&name);
            self.client.download_file(&url, &dest, progress)?;
            if let Some(expected) = sha256 {
                fetch::verify_sha256(&dest, &expected)?;
            }
        }
        progress.finish("archives fetched");
        Ok(())
    }

    fn commit(&mut self, progress: &dyn ProgressTracker) -> Result<()> {
        self.fetch_archives(progress)?;

        let target_cache = self.target.join("var/cache/apt/archives");
        fs::create_dir_all(&target_cache)?;

        let mut chroot_paths = Vec::new();
        for pkg in self.changes() {
            let file_name = pkg.archive_file_name();
            let cached = self.cache_dir.join(&file_name);
            let staged = target_cache.join(&file_name);
            if cached != staged && !staged.is_file() {
                fs::copy(&cached, &staged)?;
            }
            chroot_paths.push(format!("/var/cache/apt/archives/{file_name}"));
        }

        for path in &chroot_paths {
            let mut args = UNPACK_ARGS.to_vec();
            args.push(path);
            chroot::run_in_chroot(&self.target, "/usr/bin/dpkg", &args)?;
        }
        if !chroot_paths.is_empty() {
            chroot::run_in_chroot(&self.target, "/usr/bin/dpkg", CONFIGURE_ARGS)?;
        }

        self.marked.clear();
        self.open()
    }

    fn archive_path(&self, package: &Package) -> PathBuf {
        self.cache_dir.join(package.archive_file_name())
    }
}

/// Parse the SHA256 section of a Release file into `path -> digest`.
fn parse_release_sha256(text: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    let mut in_sha256 = false;
    for line in text.lines() {
        if line.starts_with("SHA256:") {
            in_sha256 = true;
            continue;
        }
        if !line.starts_with(' ') {
            in_sha256 = false;
            continue;
        }
        if in_sha256 {
            let mut fields = line.split_whitespace();
            if let (Some(digest), Some(_size), Some(path)) =
                (fields.next(), fields.next(), fields.next())
            {
                table.insert(path.to_string(), digest.to_string());
            }
        }
    }
    table
}

/// Parse one Packages stanza; `None` when it has no Package field.
fn parse_stanza(stanza: &str) -> Option<Package> {
    let mut pkg = Package::default();
    let mut seen_name = false;
    for line in stanza.lines() {
        // Continuation lines belong to multi-line fields (Description) that
        // the bootstrap does not use.
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Package" => {
                pkg.name = value.to_string();
                seen_name = true;
            }
            "Version" => pkg.version = value.to_string(),
            "Architecture" => pkg.architecture = value.to_string(),
            "Priority" => pkg.priority = Priority::parse(value),
            "Essential" => pkg.essential = value == "yes",
            "Multi-Arch" => pkg.multi_arch = MultiArch::parse(value),
            "Filename" => pkg.filename = value.to_string(),
            "Size" => pkg.size = value.parse().unwrap_or(0),
            "SHA256" => pkg.sha256 = Some(value.to_string()),
            "Depends" => pkg.depends = parse_dependency_list(value),
            "Pre-Depends" => pkg.pre_depends = parse_dependency_list(value),
            "Recommends" => pkg.recommends = parse_dependency_list(value),
            "Provides" => {
                pkg.provides = value
                    .split(',')
                    .filter_map(|p| p.split_whitespace().next())
                    .map(|p| p.split(':').next().unwrap_or(p).to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }
            _ => {}
        }
    }
    seen_name.then_some(pkg)
}

/// `a (>= 1), b | c` -> `[[a], [b, c]]`; version constraints and arch
/// qualifiers are stripped, resolution is by name.
fn parse_dependency_list(value: &str) -> Vec<Vec<String>> {
    value
        .split(',')
        .map(|group| {
            group
                .split('|')
                .filter_map(|alt| alt.split_whitespace().next())
                .map(|name| name.split(':').next().unwrap_or(name).to_string())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect()
}

fn sanitize_url(url: &str) -> String {
    url.trim_start_matches("http://")
        .trim_start_matches("https://")
        .replace('/', "_")
}

/// Compare two Debian version strings.
///
/// Implements the dpkg ordering: numeric epoch, then upstream and revision
/// compared as alternating non-digit/digit runs with `~` sorting before
/// everything, including the end of the string.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (epoch_a, rest_a) = split_epoch(a);
    let (epoch_b, rest_b) = split_epoch(b);
    if epoch_a != epoch_b {
        return epoch_a.cmp(&epoch_b);
    }

    let (upstream_a, revision_a) = split_revision(rest_a);
    let (upstream_b, revision_b) = split_revision(rest_b);
    match compare_fragment(upstream_a, upstream_b) {
        Ordering::Equal => compare_fragment(revision_a, revision_b),
        other => other,
    }
}

fn split_epoch(v: &str) -> (u64, &str) {
    match v.split_once(':') {
        Some((epoch, rest)) => (epoch.parse().unwrap_or(0), rest),
        None => (0, v),
    }
}

fn split_revision(v: &str) -> (&str, &str) {
    match v.rfind('-') {
        Some(i) => (&v[..i], &v[i + 1..]),
        None => (v, ""),
    }
}

/// Sort weight of a byte in the non-digit part of a version.
fn order(c: u8) -> i32 {
    match c {
        b'~' => -1,
        b'0'..=b'9' => 0,
        b'A'..=b'Z' | b'a'..=b'z' => i32::from(c),
        _ => i32::from(c) + 256,
    }
}

fn compare_fragment(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        // non-digit run
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let oa = if i < a.len() && !a[i].is_ascii_digit() { order(a[i]) } else { 0 };
            let ob = if j < b.len() && !b[j].is_ascii_digit() { order(b[j]) } else { 0 };
            if oa != ob {
                return oa.cmp(&ob);
            }
            if i < a.len() && !a[i].is_ascii_digit() {
                i += 1;
            }
            if j < b.len() && !b[j].is_ascii_digit() {
                j += 1;
            }
        }
        // numeric run
        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }
        let mut first_diff = Ordering::Equal;
        while i < a.len() && j < b.len() && a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }
    Ordering::Equal
}
