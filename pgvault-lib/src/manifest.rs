//! The per-backup manifest: every path, link, and file captured by a
//! backup, with the metadata restore needs to reproduce them.
//!
//! Built by walking the cluster's data directory (and every tablespace)
//! through the storage interface, persisted in dual copy inside the
//! backup's label directory, and edited at restore time to remap
//! tablespaces and links before the destination is cleaned.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::info::{BackupType, IniDoc};
use crate::pg::{PgControl, MANIFEST_TARGET_PGDATA};
use crate::storage::{FileType, SortOrder, Storage};

pub const MANIFEST_FILE: &str = "backup.manifest";
/// Name of the manifest saved into the restored data directory.
pub const MANIFEST_TARGET_FILE: &str = "backup.manifest";

/// Directory of tablespace links within the data directory.
pub const PG_TBLSPC: &str = "pg_tblspc";

const SECTION_BACKUP: &str = "backup";
const SECTION_BACKUP_DB: &str = "backup:db";
const SECTION_BACKUP_OPTION: &str = "backup:option";
const SECTION_BACKUP_TARGET: &str = "backup:target";
const SECTION_CIPHER: &str = "cipher";
const SECTION_DB: &str = "db";
const SECTION_TARGET_FILE: &str = "target:file";
const SECTION_TARGET_LINK: &str = "target:link";
const SECTION_TARGET_PATH: &str = "target:path";

lazy_static! {
    /// Temporary relation files (`t<n>_<relfilenode>`), never backed up.
    static ref TEMP_RELATION_RE: Regex = Regex::new("^t[0-9]+_").expect("valid regex");
}

/// Files and directories excluded from every backup. Directory entries
/// keep the directory itself but drop its content.
const EXCLUDE_FILE: &[&str] = &[
    "backup_label.old",
    "postmaster.opts",
    "postmaster.pid",
    "recovery.signal",
    "standby.signal",
];
const EXCLUDE_CONTENT: &[&str] = &[
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
    "pg_wal",
    "pg_xlog",
];

// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Path,
    Link,
}

/// A location the restore must reproduce: the data directory itself,
/// every tablespace, and every user-created link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTarget {
    pub name: String,
    pub target_type: TargetType,
    /// Absolute destination path.
    pub path: String,
    /// Set when the target is a link to a single file.
    pub file: Option<String>,
    pub tablespace_id: Option<u32>,
    pub tablespace_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPath {
    pub name: String,
    pub user: Option<String>,
    pub group: Option<String>,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLink {
    pub name: String,
    pub destination: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    /// Size in the repository (post compression/encryption); zero until
    /// the file is copied.
    pub size_repo: u64,
    pub timestamp: i64,
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    /// SHA-1 of the file content as copied.
    pub checksum: Option<String>,
    /// Page checksum verdict for relation files, when checked.
    pub checksum_page: Option<bool>,
    pub checksum_page_error: Option<Value>,
    /// Label of the prior backup this file is inherited from.
    pub reference: Option<String>,
    pub bundle_id: Option<u64>,
    pub bundle_offset: Option<u64>,
    /// Label of the backup holding the block map this file's block
    /// incremental delta builds on.
    pub block_incr_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDb {
    pub name: String,
    pub oid: u32,
    pub last_system_oid: u32,
}

/// The `[backup]` section: identity and WAL range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestBackupData {
    pub label: String,
    pub backup_type: Option<BackupType>,
    pub prior: Option<String>,
    pub timestamp_start: i64,
    pub timestamp_stop: i64,
    pub lsn_start: String,
    pub lsn_stop: String,
    pub archive_start: String,
    pub archive_stop: String,
}

/// The `[backup:option]` section: how files were stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestOptions {
    pub compress_type: Option<String>,
    pub bundle: bool,
    pub block_incr: bool,
    pub page_checksum: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub backup: ManifestBackupData,
    pub options: ManifestOptions,
    /// `{id, version, system_id, catalog, control}` of the incarnation.
    pub pg_id: u32,
    pub pg_version: String,
    pub pg_system_id: u64,
    pub pg_catalog_version: u32,
    pub pg_control_version: u32,
    pub targets: Vec<ManifestTarget>,
    pub paths: Vec<ManifestPath>,
    pub links: Vec<ManifestLink>,
    pub files: Vec<ManifestFile>,
    pub databases: Vec<ManifestDb>,
    pub cipher_pass: Option<String>,
}

impl Manifest {
    // ------------------------------------------------------------------
    // Build

    /// Walk the data directory and construct a manifest skeleton: all
    /// targets, paths, links, and files with their filesystem metadata.
    /// Checksums and repo sizes are filled in as files are copied.
    pub fn build(pg_storage: &Storage, control: &PgControl, pg_id: u32) -> Result<Self> {
        let mut manifest = Self {
            backup: ManifestBackupData::default(),
            options: ManifestOptions::default(),
            pg_id,
            pg_version: control.version.to_string(),
            pg_system_id: control.system_id,
            pg_catalog_version: control.catalog_version,
            pg_control_version: control.control_version,
            targets: Vec::new(),
            paths: Vec::new(),
            links: Vec::new(),
            files: Vec::new(),
            databases: Vec::new(),
            cipher_pass: None,
        };

        let root = pg_storage
            .info("", true)?
            .ok_or_else(|| Error::PathMissing(format!(
                "data directory '{}' does not exist",
                pg_storage.base().display()
            )))?;
        manifest.targets.push(ManifestTarget {
            name: MANIFEST_TARGET_PGDATA.to_owned(),
            target_type: TargetType::Path,
            path: pg_storage.base().to_string_lossy().into_owned(),
            file: None,
            tablespace_id: None,
            tablespace_name: None,
        });
        manifest.paths.push(ManifestPath {
            name: MANIFEST_TARGET_PGDATA.to_owned(),
            user: root.user,
            group: root.group,
            mode: root.mode,
        });

        manifest.walk(pg_storage, "", MANIFEST_TARGET_PGDATA)?;
        manifest.sort();
        Ok(manifest)
    }

    fn walk(&mut self, storage: &Storage, rel: &str, target_name: &str) -> Result<()> {
        for info in storage.info_list(rel, false, SortOrder::Asc)? {
            let rel_name = if rel.is_empty() {
                info.name.clone()
            } else {
                format!("{rel}/{}", info.name)
            };
            let name = format!("{target_name}/{rel_name}");

            if skip_entry(&rel_name, &info.name, info.file_type) {
                // Excluded directories keep their (empty) path entry.
                if info.file_type == FileType::Path {
                    self.paths.push(ManifestPath {
                        name,
                        user: info.user,
                        group: info.group,
                        mode: info.mode,
                    });
                }
                continue;
            }

            match info.file_type {
                FileType::Path => {
                    self.paths.push(ManifestPath {
                        name: name.clone(),
                        user: info.user.clone(),
                        group: info.group.clone(),
                        mode: info.mode,
                    });
                    self.walk(storage, &rel_name, target_name)?;
                }
                FileType::File => {
                    self.files.push(ManifestFile {
                        name,
                        size: info.size,
                        size_repo: 0,
                        timestamp: info.modified,
                        mode: info.mode,
                        user: info.user.clone(),
                        group: info.group.clone(),
                        checksum: None,
                        checksum_page: None,
                        checksum_page_error: None,
                        reference: None,
                        bundle_id: None,
                        bundle_offset: None,
                        block_incr_ref: None,
                    });
                }
                FileType::Link => {
                    let destination = info
                        .link_target
                        .as_ref()
                        .map(|target| target.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.links.push(ManifestLink {
                        name: name.clone(),
                        destination: destination.clone(),
                        user: info.user.clone(),
                        group: info.group.clone(),
                    });

                    let parent_is_tblspc = rel == PG_TBLSPC;
                    if parent_is_tblspc {
                        // A tablespace. The target is the link destination
                        // and its content is walked through the link.
                        let oid: u32 = info.name.parse().map_err(|_| {
                            Error::Format(format!(
                                "invalid tablespace link name '{}'",
                                info.name
                            ))
                        })?;
                        let tbs_target = format!("{PG_TBLSPC}/{}", info.name);
                        self.targets.push(ManifestTarget {
                            name: tbs_target.clone(),
                            target_type: TargetType::Link,
                            path: destination.clone(),
                            file: None,
                            tablespace_id: Some(oid),
                            tablespace_name: Some(format!("ts{oid}")),
                        });
                        // Walk the tablespace through the link, with
                        // names rooted at the target.
                        let tbs_storage = Storage::posix(&destination);
                        self.walk_target(&tbs_storage, &tbs_target)?;
                    } else {
                        // A user link: path or file target.
                        let linked = storage.info(&rel_name, true)?;
                        match linked {
                            Some(linked) if linked.file_type == FileType::Path => {
                                self.targets.push(ManifestTarget {
                                    name: name.clone(),
                                    target_type: TargetType::Link,
                                    path: destination.clone(),
                                    file: None,
                                    tablespace_id: None,
                                    tablespace_name: None,
                                });
                                let link_storage = Storage::posix(&destination);
                                self.walk_target(&link_storage, &name)?;
                            }
                            Some(linked) => {
                                let (dir, file) = split_link_file(&destination);
                                self.targets.push(ManifestTarget {
                                    name: name.clone(),
                                    target_type: TargetType::Link,
                                    path: dir,
                                    file: Some(file.clone()),
                                    tablespace_id: None,
                                    tablespace_name: None,
                                });
                                self.files.push(ManifestFile {
                                    name: format!("{name}/{file}"),
                                    size: linked.size,
                                    size_repo: 0,
                                    timestamp: linked.modified,
                                    mode: linked.mode,
                                    user: linked.user,
                                    group: linked.group,
                                    checksum: None,
                                    checksum_page: None,
                                    checksum_page_error: None,
                                    reference: None,
                                    bundle_id: None,
                                    bundle_offset: None,
                                    block_incr_ref: None,
                                });
                            }
                            None => {
                                return Err(Error::FileMissing(format!(
                                    "link '{name}' destination '{destination}' does not exist"
                                )))
                            }
                        }
                    }
                }
                FileType::Special => {
                    log::warn!("skipping special file '{name}'");
                }
            }
        }
        Ok(())
    }

    /// Walk a link/tablespace target's own tree, rooted at `target_name`.
    fn walk_target(&mut self, storage: &Storage, target_name: &str) -> Result<()> {
        if let Some(root) = storage.info("", true)? {
            self.paths.push(ManifestPath {
                name: target_name.to_owned(),
                user: root.user,
                group: root.group,
                mode: root.mode,
            });
        }
        self.walk(storage, "", target_name)
    }

    fn sort(&mut self) {
        self.targets.sort_by(|a, b| a.name.cmp(&b.name));
        self.paths.sort_by(|a, b| a.name.cmp(&b.name));
        self.links.sort_by(|a, b| a.name.cmp(&b.name));
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.databases.sort_by_key(|db| db.oid);
    }

    // ------------------------------------------------------------------
    // Validation

    /// Structural invariants, checked after build and after load.
    pub fn validate(&self) -> Result<()> {
        let pg_data_targets = self
            .targets
            .iter()
            .filter(|target| target.name == MANIFEST_TARGET_PGDATA)
            .count();
        if pg_data_targets != 1 {
            return Err(Error::FileInvalid(format!(
                "manifest requires exactly one '{MANIFEST_TARGET_PGDATA}' target, found \
                 {pg_data_targets}"
            )));
        }

        let target_names: Vec<&str> = self.targets.iter().map(|t| t.name.as_str()).collect();
        let covered = |name: &str| {
            target_names
                .iter()
                .any(|target| name == *target || name.starts_with(&format!("{target}/")))
        };
        let mut seen = HashSet::new();
        for name in self
            .paths
            .iter()
            .map(|p| &p.name)
            .chain(self.files.iter().map(|f| &f.name))
            .chain(self.links.iter().map(|l| &l.name))
        {
            if !covered(name) {
                return Err(Error::FileInvalid(format!(
                    "manifest entry '{name}' is not covered by any target"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::FileInvalid(format!(
                    "manifest entry '{name}' is duplicated"
                )));
            }
        }
        Ok(())
    }

    /// The label recorded inside must match the label directory the
    /// manifest was loaded from; guards against a renamed backup path.
    pub fn validate_label(&self, label: &str) -> Result<()> {
        if self.backup.label != label {
            return Err(Error::FileInvalid(format!(
                "requested backup '{label}' and manifest label '{}' do not match\nHINT: was the \
                 backup path renamed?",
                self.backup.label
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups

    pub fn target(&self, name: &str) -> Option<&ManifestTarget> {
        self.targets.iter().find(|target| target.name == name)
    }

    pub fn target_mut(&mut self, name: &str) -> Option<&mut ManifestTarget> {
        self.targets.iter_mut().find(|target| target.name == name)
    }

    pub fn file(&self, name: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|file| file.name == name)
    }

    pub fn file_mut(&mut self, name: &str) -> Option<&mut ManifestFile> {
        self.files.iter_mut().find(|file| file.name == name)
    }

    /// The target whose name prefixes `entry_name`; longest match wins so
    /// nested links resolve to the innermost target.
    pub fn target_covering(&self, entry_name: &str) -> Option<&ManifestTarget> {
        self.targets
            .iter()
            .filter(|target| {
                entry_name == target.name || entry_name.starts_with(&format!("{}/", target.name))
            })
            .max_by_key(|target| target.name.len())
    }

    /// Every backup label referenced by inherited files, deduplicated and
    /// sorted; the set the restore must be able to read.
    pub fn reference_list(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .files
            .iter()
            .filter_map(|file| file.reference.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        refs.sort();
        refs
    }

    // ------------------------------------------------------------------
    // Serialization

    pub fn to_ini(&self) -> IniDoc {
        let mut doc = IniDoc::new();
        let backup = &self.backup;
        doc.set(SECTION_BACKUP, "backup-label", json!(backup.label));
        if let Some(backup_type) = backup.backup_type {
            doc.set(SECTION_BACKUP, "backup-type", json!(backup_type.as_str()));
        }
        doc.set(SECTION_BACKUP, "backup-prior", json!(backup.prior));
        doc.set(SECTION_BACKUP, "backup-timestamp-start", json!(backup.timestamp_start));
        doc.set(SECTION_BACKUP, "backup-timestamp-stop", json!(backup.timestamp_stop));
        doc.set(SECTION_BACKUP, "backup-lsn-start", json!(backup.lsn_start));
        doc.set(SECTION_BACKUP, "backup-lsn-stop", json!(backup.lsn_stop));
        doc.set(SECTION_BACKUP, "backup-archive-start", json!(backup.archive_start));
        doc.set(SECTION_BACKUP, "backup-archive-stop", json!(backup.archive_stop));

        doc.set(SECTION_BACKUP_DB, "db-id", json!(self.pg_id));
        doc.set(SECTION_BACKUP_DB, "db-version", json!(self.pg_version));
        doc.set(SECTION_BACKUP_DB, "db-system-id", json!(self.pg_system_id));
        doc.set(SECTION_BACKUP_DB, "db-catalog-version", json!(self.pg_catalog_version));
        doc.set(SECTION_BACKUP_DB, "db-control-version", json!(self.pg_control_version));

        doc.set(SECTION_BACKUP_OPTION, "option-compress-type", json!(self.options.compress_type));
        doc.set(SECTION_BACKUP_OPTION, "option-bundle", json!(self.options.bundle));
        doc.set(SECTION_BACKUP_OPTION, "option-block-incr", json!(self.options.block_incr));
        doc.set(SECTION_BACKUP_OPTION, "option-page-checksum", json!(self.options.page_checksum));

        if let Some(pass) = &self.cipher_pass {
            doc.set(SECTION_CIPHER, KEY_CIPHER_PASS, json!(pass));
        }

        for target in &self.targets {
            let mut value = serde_json::Map::new();
            value.insert(
                "type".into(),
                json!(match target.target_type {
                    TargetType::Path => "path",
                    TargetType::Link => "link",
                }),
            );
            value.insert("path".into(), json!(target.path));
            if let Some(file) = &target.file {
                value.insert("file".into(), json!(file));
            }
            if let Some(id) = target.tablespace_id {
                value.insert("tablespace-id".into(), json!(id));
            }
            if let Some(name) = &target.tablespace_name {
                value.insert("tablespace-name".into(), json!(name));
            }
            doc.set(SECTION_BACKUP_TARGET, &target.name, Value::Object(value));
        }

        for path in &self.paths {
            doc.set(
                SECTION_TARGET_PATH,
                &path.name,
                json!({"user": path.user, "group": path.group, "mode": mode_str(path.mode)}),
            );
        }
        for link in &self.links {
            doc.set(
                SECTION_TARGET_LINK,
                &link.name,
                json!({"user": link.user, "group": link.group, "destination": link.destination}),
            );
        }
        for file in &self.files {
            let mut value = serde_json::Map::new();
            value.insert("size".into(), json!(file.size));
            value.insert("repo-size".into(), json!(file.size_repo));
            value.insert("timestamp".into(), json!(file.timestamp));
            value.insert("mode".into(), json!(mode_str(file.mode)));
            value.insert("user".into(), json!(file.user));
            value.insert("group".into(), json!(file.group));
            if let Some(checksum) = &file.checksum {
                value.insert("checksum".into(), json!(checksum));
            }
            if let Some(page) = file.checksum_page {
                value.insert("checksum-page".into(), json!(page));
            }
            if let Some(error) = &file.checksum_page_error {
                value.insert("checksum-page-error".into(), error.clone());
            }
            if let Some(reference) = &file.reference {
                value.insert("reference".into(), json!(reference));
            }
            if let Some(bundle_id) = file.bundle_id {
                value.insert("bundle-id".into(), json!(bundle_id));
                value.insert("bundle-offset".into(), json!(file.bundle_offset.unwrap_or(0)));
            }
            if let Some(block_ref) = &file.block_incr_ref {
                value.insert("block-incr-ref".into(), json!(block_ref));
            }
            doc.set(SECTION_TARGET_FILE, &file.name, Value::Object(value));
        }
        for db in &self.databases {
            doc.set(
                SECTION_DB,
                &db.name,
                json!({"db-id": db.oid, "db-last-system-id": db.last_system_oid}),
            );
        }
        doc
    }

    pub fn from_ini(doc: &IniDoc) -> Result<Self> {
        let str_key = |section: &str, key: &str| -> Result<String> {
            Ok(doc
                .require(section, key)?
                .as_str()
                .unwrap_or_default()
                .to_owned())
        };
        let opt_str = |section: &str, key: &str| -> Option<String> {
            doc.get(section, key).and_then(|v| v.as_str()).map(str::to_owned)
        };
        let i64_key = |section: &str, key: &str| -> i64 {
            doc.get(section, key).and_then(|v| v.as_i64()).unwrap_or(0)
        };

        let backup = ManifestBackupData {
            label: str_key(SECTION_BACKUP, "backup-label")?,
            backup_type: opt_str(SECTION_BACKUP, "backup-type")
                .map(|t| t.parse())
                .transpose()?,
            prior: opt_str(SECTION_BACKUP, "backup-prior"),
            timestamp_start: i64_key(SECTION_BACKUP, "backup-timestamp-start"),
            timestamp_stop: i64_key(SECTION_BACKUP, "backup-timestamp-stop"),
            lsn_start: opt_str(SECTION_BACKUP, "backup-lsn-start").unwrap_or_default(),
            lsn_stop: opt_str(SECTION_BACKUP, "backup-lsn-stop").unwrap_or_default(),
            archive_start: opt_str(SECTION_BACKUP, "backup-archive-start").unwrap_or_default(),
            archive_stop: opt_str(SECTION_BACKUP, "backup-archive-stop").unwrap_or_default(),
        };

        let options = ManifestOptions {
            compress_type: opt_str(SECTION_BACKUP_OPTION, "option-compress-type"),
            bundle: doc
                .get(SECTION_BACKUP_OPTION, "option-bundle")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            block_incr: doc
                .get(SECTION_BACKUP_OPTION, "option-block-incr")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            page_checksum: doc
                .get(SECTION_BACKUP_OPTION, "option-page-checksum")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        let mut targets = Vec::new();
        for name in doc.section_keys(SECTION_BACKUP_TARGET) {
            let value = doc.require(SECTION_BACKUP_TARGET, name)?;
            targets.push(ManifestTarget {
                name: name.to_owned(),
                target_type: match value["type"].as_str() {
                    Some("path") => TargetType::Path,
                    Some("link") => TargetType::Link,
                    other => {
                        return Err(Error::FileInvalid(format!(
                            "target '{name}' has invalid type {other:?}"
                        )))
                    }
                },
                path: value["path"].as_str().unwrap_or_default().to_owned(),
                file: value["file"].as_str().map(str::to_owned),
                tablespace_id: value["tablespace-id"].as_u64().map(|id| id as u32),
                tablespace_name: value["tablespace-name"].as_str().map(str::to_owned),
            });
        }

        let mut paths = Vec::new();
        for name in doc.section_keys(SECTION_TARGET_PATH) {
            let value = doc.require(SECTION_TARGET_PATH, name)?;
            paths.push(ManifestPath {
                name: name.to_owned(),
                user: value["user"].as_str().map(str::to_owned),
                group: value["group"].as_str().map(str::to_owned),
                mode: mode_parse(&value["mode"])?,
            });
        }

        let mut links = Vec::new();
        for name in doc.section_keys(SECTION_TARGET_LINK) {
            let value = doc.require(SECTION_TARGET_LINK, name)?;
            links.push(ManifestLink {
                name: name.to_owned(),
                destination: value["destination"].as_str().unwrap_or_default().to_owned(),
                user: value["user"].as_str().map(str::to_owned),
                group: value["group"].as_str().map(str::to_owned),
            });
        }

        let mut files = Vec::new();
        for name in doc.section_keys(SECTION_TARGET_FILE) {
            let value = doc.require(SECTION_TARGET_FILE, name)?;
            files.push(ManifestFile {
                name: name.to_owned(),
                size: value["size"].as_u64().unwrap_or(0),
                size_repo: value["repo-size"].as_u64().unwrap_or(0),
                timestamp: value["timestamp"].as_i64().unwrap_or(0),
                mode: mode_parse(&value["mode"])?,
                user: value["user"].as_str().map(str::to_owned),
                group: value["group"].as_str().map(str::to_owned),
                checksum: value["checksum"].as_str().map(str::to_owned),
                checksum_page: value["checksum-page"].as_bool(),
                checksum_page_error: value.get("checksum-page-error").cloned(),
                reference: value["reference"].as_str().map(str::to_owned),
                bundle_id: value["bundle-id"].as_u64(),
                bundle_offset: value["bundle-offset"].as_u64(),
                block_incr_ref: value["block-incr-ref"].as_str().map(str::to_owned),
            });
        }

        let mut databases = Vec::new();
        for name in doc.section_keys(SECTION_DB) {
            let value = doc.require(SECTION_DB, name)?;
            databases.push(ManifestDb {
                name: name.to_owned(),
                oid: value["db-id"].as_u64().unwrap_or(0) as u32,
                last_system_oid: value["db-last-system-id"].as_u64().unwrap_or(0) as u32,
            });
        }

        let mut manifest = Self {
            backup,
            options,
            pg_id: doc.require(SECTION_BACKUP_DB, "db-id")?.as_u64().unwrap_or(0) as u32,
            pg_version: str_key(SECTION_BACKUP_DB, "db-version")?,
            pg_system_id: doc
                .require(SECTION_BACKUP_DB, "db-system-id")?
                .as_u64()
                .unwrap_or(0),
            pg_catalog_version: doc
                .require(SECTION_BACKUP_DB, "db-catalog-version")?
                .as_u64()
                .unwrap_or(0) as u32,
            pg_control_version: doc
                .require(SECTION_BACKUP_DB, "db-control-version")?
                .as_u64()
                .unwrap_or(0) as u32,
            targets,
            paths,
            links,
            files,
            databases,
            cipher_pass: opt_str(SECTION_CIPHER, KEY_CIPHER_PASS),
        };
        manifest.sort();
        Ok(manifest)
    }

    /// Manifest path within the repository for a backup label.
    pub fn repo_path(label: &str) -> String {
        format!("<REPO:BACKUP>/{label}/{MANIFEST_FILE}")
    }

    pub fn load(storage: &Storage, label: &str, cipher_pass: Option<&str>) -> Result<Self> {
        let doc = crate::info::load(storage, &Self::repo_path(label), cipher_pass, false)?
            .expect("errors when missing");
        let manifest = Self::from_ini(&doc)?;
        manifest.validate_label(label)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, storage: &Storage, cipher_pass: Option<&str>) -> Result<()> {
        crate::info::save(
            storage,
            &Self::repo_path(&self.backup.label),
            &self.to_ini(),
            cipher_pass,
        )
    }
}

const KEY_CIPHER_PASS: &str = "cipher-pass";

fn mode_str(mode: u32) -> String {
    format!("{mode:04o}")
}

fn mode_parse(value: &Value) -> Result<u32> {
    let text = value
        .as_str()
        .ok_or_else(|| Error::FileInvalid("missing mode".into()))?;
    u32::from_str_radix(text, 8).map_err(|_| Error::FileInvalid(format!("invalid mode '{text}'")))
}

fn skip_entry(rel_name: &str, base_name: &str, file_type: FileType) -> bool {
    if file_type == FileType::File && EXCLUDE_FILE.contains(&rel_name) {
        return true;
    }
    // Content of transient directories is skipped but the directory kept.
    if let Some((parent, _)) = rel_name.rsplit_once('/') {
        if EXCLUDE_CONTENT.contains(&parent) {
            return true;
        }
    }
    // Temp files and relations never restore meaningfully.
    if base_name.starts_with("pgsql_tmp") || TEMP_RELATION_RE.is_match(base_name) {
        return true;
    }
    false
}

fn split_link_file(destination: &str) -> (String, String) {
    match destination.rsplit_once('/') {
        Some((dir, file)) => (dir.to_owned(), file.to_owned()),
        None => (String::new(), destination.to_owned()),
    }
}

// ----------------------------------------------------------------------------
// Restore-time remapping

/// Requested manifest edits, applied before the destination is cleaned.
#[derive(Debug, Clone, Default)]
pub struct ManifestRemap {
    /// New data directory.
    pub pg_data: Option<String>,
    /// Tablespace remaps by name or oid string; `*` maps all.
    pub tablespace_map: HashMap<String, String>,
    pub tablespace_map_all: Option<String>,
    /// Link remaps by link name relative to the data directory.
    pub link_map: HashMap<String, String>,
    /// `--link-all=off`: convert surviving links into plain paths/files.
    pub link_all: bool,
}

impl Manifest {
    /// Apply restore-time remapping. Order: data directory, tablespaces,
    /// links, then link-all conversion.
    pub fn remap(&mut self, remap: &ManifestRemap) -> Result<()> {
        if let Some(pg_data) = &remap.pg_data {
            self.target_mut(MANIFEST_TARGET_PGDATA)
                .expect("validated manifest has pg_data")
                .path = pg_data.clone();
        }

        // Tablespaces may be addressed by name or oid; both keys naming
        // the same tablespace is fine as long as they agree on the
        // destination.
        let mut tablespace_seen: HashMap<String, String> = HashMap::new();
        for (key, destination) in &remap.tablespace_map {
            let target = self
                .targets
                .iter_mut()
                .find(|target| {
                    target.tablespace_id.is_some()
                        && (target.tablespace_name.as_deref() == Some(key.as_str())
                            || target.tablespace_id.map(|id| id.to_string()).as_deref()
                                == Some(key.as_str()))
                })
                .ok_or_else(|| {
                    Error::TablespaceMap(format!("unable to remap invalid tablespace '{key}'"))
                })?;
            match tablespace_seen.get(&target.name) {
                Some(seen) if seen == destination => continue,
                Some(seen) => {
                    return Err(Error::TablespaceMap(format!(
                        "tablespace '{}' remapped by both name and id with different \
                         destinations ('{seen}' and '{destination}')",
                        target.name
                    )))
                }
                None => {}
            }
            tablespace_seen.insert(target.name.clone(), destination.clone());
            target.path = destination.clone();
            let name = target.name.clone();
            self.link_update(&name, destination);
        }
        if let Some(base) = &remap.tablespace_map_all {
            let renames: Vec<(String, String)> = self
                .targets
                .iter_mut()
                .filter(|target| target.tablespace_id.is_some())
                .filter(|target| !tablespace_seen.contains_key(&target.name))
                .map(|target| {
                    let tbs_name =
                        target.tablespace_name.clone().expect("tablespaces are named");
                    target.path = format!("{base}/{tbs_name}");
                    (target.name.clone(), target.path.clone())
                })
                .collect();
            for (name, destination) in renames {
                self.link_update(&name, &destination);
            }
        }

        for (link, destination) in &remap.link_map {
            let name = format!("{MANIFEST_TARGET_PGDATA}/{link}");
            let target_file = match self.target(&name) {
                Some(target) if target.tablespace_id.is_some() => {
                    return Err(Error::LinkMap(format!(
                        "'{link}' is a tablespace; use a tablespace map instead"
                    )))
                }
                Some(target) => target.file.clone(),
                None => {
                    return Err(Error::LinkMap(format!(
                        "unable to remap invalid link '{link}'"
                    )))
                }
            };
            match target_file {
                Some(file) => {
                    let (dir, new_file) = split_link_file(destination);
                    if new_file != file {
                        // Remapping may rename the linked file.
                        let old_name = format!("{name}/{file}");
                        if let Some(entry) = self.file_mut(&old_name) {
                            entry.name = format!("{name}/{new_file}");
                        }
                    }
                    let target = self.target_mut(&name).expect("target exists");
                    target.path = dir;
                    target.file = Some(new_file);
                }
                None => {
                    let target = self.target_mut(&name).expect("target exists");
                    target.path = destination.clone();
                }
            }
            self.link_update(&name, destination);
        }

        if remap.link_all {
            // Convert every non-tablespace link target into an in-place
            // path (or file) under the data directory.
            let converted: Vec<String> = self
                .targets
                .iter()
                .filter(|target| {
                    target.target_type == TargetType::Link && target.tablespace_id.is_none()
                })
                .map(|target| target.name.clone())
                .collect();
            for name in converted {
                let pg_data = self
                    .target(MANIFEST_TARGET_PGDATA)
                    .expect("validated manifest has pg_data")
                    .path
                    .clone();
                let rel = name
                    .strip_prefix(&format!("{MANIFEST_TARGET_PGDATA}/"))
                    .expect("links live under pg_data")
                    .to_owned();
                let target = self.target_mut(&name).expect("target exists");
                let is_file = target.file.is_some();
                target.target_type = TargetType::Path;
                target.path = format!("{pg_data}/{rel}");
                let link = self.links.iter().find(|l| l.name == name).cloned();
                self.links.retain(|l| l.name != name);
                if is_file {
                    // A file link becomes the file itself; drop the
                    // target and rehome the file under pg_data.
                    let target = self.target(&name).expect("target exists");
                    let file_name = format!("{name}/{}", target.file.clone().expect("file link"));
                    self.targets.retain(|t| t.name != name);
                    if let Some(entry) = self.file_mut(&file_name) {
                        entry.name = name.clone();
                    }
                } else if let Some(link) = link {
                    // A path link becomes a real path with the link's
                    // ownership.
                    self.paths.push(ManifestPath {
                        name: name.clone(),
                        user: link.user,
                        group: link.group,
                        mode: 0o700,
                    });
                    self.targets.retain(|t| t.name != name);
                }
            }
            self.sort();
        }
        Ok(())
    }

    fn link_update(&mut self, target_name: &str, destination: &str) {
        if let Some(link) = self.links.iter_mut().find(|link| link.name == target_name) {
            link.destination = destination.to_owned();
        }
    }

    /// Replace ownership that does not exist on this host with `None`
    /// (restore as the current user), warning once per name.
    pub fn ownership_reconcile<F>(&mut self, user_exists: F)
    where
        F: Fn(&str, bool) -> bool,
    {
        let mut missing: HashSet<(String, bool)> = HashSet::new();
        let mut fix = |owner: &mut Option<String>, group: bool| {
            if let Some(name) = owner.as_deref() {
                if !user_exists(name, group) {
                    missing.insert((name.to_owned(), group));
                    *owner = None;
                }
            }
        };
        for path in &mut self.paths {
            fix(&mut path.user, false);
            fix(&mut path.group, true);
        }
        for link in &mut self.links {
            fix(&mut link.user, false);
            fix(&mut link.group, true);
        }
        for file in &mut self.files {
            fix(&mut file.user, false);
            fix(&mut file.group, true);
        }
        for (name, group) in missing {
            let kind = if group { "group" } else { "user" };
            log::warn!("unknown {kind} '{name}' in manifest mapped to current {kind}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterGroup;
    use crate::pg::version::PG_VERSION_16;

    fn build_fixture() -> (tempfile::TempDir, Manifest) {
        let dir = tempfile::tempdir().unwrap();
        let pg = Storage::posix(dir.path().join("data"));
        pg.put("PG_VERSION", b"16\n", FilterGroup::new()).unwrap();
        pg.put("global/pg_control", &[0u8; 16], FilterGroup::new()).unwrap();
        pg.put("base/1/112", b"catalog", FilterGroup::new()).unwrap();
        pg.put("base/16384/3000", b"user data", FilterGroup::new()).unwrap();
        pg.put("postmaster.pid", b"123", FilterGroup::new()).unwrap();
        pg.put("pg_wal/000000010000000100000001", b"wal", FilterGroup::new()).unwrap();
        pg.path_create("pg_tblspc", 0o700).unwrap();

        let control = PgControl::for_version(PG_VERSION_16, 42);
        let manifest = Manifest::build(&pg, &control, 1).unwrap();
        (dir, manifest)
    }

    #[test]
    fn build_captures_and_excludes() {
        let (_dir, manifest) = build_fixture();
        manifest.validate().unwrap();

        let names: Vec<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"pg_data/PG_VERSION"));
        assert!(names.contains(&"pg_data/global/pg_control"));
        assert!(names.contains(&"pg_data/base/16384/3000"));
        // Excluded: pid file and WAL content.
        assert!(!names.contains(&"pg_data/postmaster.pid"));
        assert!(!names.iter().any(|n| n.starts_with("pg_data/pg_wal/")));
        // The pg_wal directory itself is kept.
        assert!(manifest.paths.iter().any(|p| p.name == "pg_data/pg_wal"));
    }

    #[test]
    fn ini_round_trip() {
        let (_dir, mut manifest) = build_fixture();
        manifest.backup.label = "20250801-010101F".into();
        manifest.backup.backup_type = Some(BackupType::Full);
        manifest.files[0].checksum = Some("a".repeat(40));
        manifest.files[0].size_repo = 17;
        manifest.databases.push(ManifestDb {
            name: "postgres".into(),
            oid: 5,
            last_system_oid: 13000,
        });

        let parsed = Manifest::from_ini(&manifest.to_ini()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn validate_rejects_uncovered_and_duplicate_names() {
        let (_dir, mut manifest) = build_fixture();
        manifest.files.push(ManifestFile {
            name: "rogue/file".into(),
            size: 0,
            size_repo: 0,
            timestamp: 0,
            mode: 0o600,
            user: None,
            group: None,
            checksum: None,
            checksum_page: None,
            checksum_page_error: None,
            reference: None,
            bundle_id: None,
            bundle_offset: None,
            block_incr_ref: None,
        });
        assert!(manifest.validate().is_err());

        let (_dir, mut manifest) = build_fixture();
        let dup = manifest.files[0].clone();
        manifest.files.push(dup);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn label_mismatch_is_detected() {
        let (_dir, mut manifest) = build_fixture();
        manifest.backup.label = "20250801-010101F".into();
        manifest.validate_label("20250801-010101F").unwrap();
        assert!(manifest.validate_label("20250802-010101F").is_err());
    }

    #[test]
    fn remap_pg_data_and_links() {
        let (_dir, mut manifest) = build_fixture();
        let remap = ManifestRemap {
            pg_data: Some("/restore/data".into()),
            ..ManifestRemap::default()
        };
        manifest.remap(&remap).unwrap();
        assert_eq!(manifest.target(MANIFEST_TARGET_PGDATA).unwrap().path, "/restore/data");

        // Unknown tablespace remap errors.
        let remap = ManifestRemap {
            tablespace_map: HashMap::from([("nope".into(), "/x".into())]),
            ..ManifestRemap::default()
        };
        assert!(matches!(manifest.remap(&remap), Err(Error::TablespaceMap(_))));
    }

    /// Graft a tablespace onto a built manifest, shaped the way the walk
    /// records one.
    fn add_tablespace(manifest: &mut Manifest, oid: u32, path: &str) {
        manifest.targets.push(ManifestTarget {
            name: format!("{PG_TBLSPC}/{oid}"),
            target_type: TargetType::Link,
            path: path.to_owned(),
            file: None,
            tablespace_id: Some(oid),
            tablespace_name: Some(format!("ts{oid}")),
        });
        manifest.links.push(ManifestLink {
            name: format!("{MANIFEST_TARGET_PGDATA}/{PG_TBLSPC}/{oid}"),
            destination: path.to_owned(),
            user: None,
            group: None,
        });
        manifest.sort();
    }

    #[test]
    fn remap_tablespace_by_name_and_id_agreeing_succeeds() {
        let (_dir, mut manifest) = build_fixture();
        add_tablespace(&mut manifest, 16401, "/tbs/old");

        // Both addressing forms with the same destination resolve once.
        let remap = ManifestRemap {
            tablespace_map: HashMap::from([
                ("ts16401".into(), "/tbs/new".into()),
                ("16401".into(), "/tbs/new".into()),
            ]),
            ..ManifestRemap::default()
        };
        manifest.remap(&remap).unwrap();
        assert_eq!(manifest.target("pg_tblspc/16401").unwrap().path, "/tbs/new");
    }

    #[test]
    fn remap_tablespace_by_name_and_id_disagreeing_errors() {
        let (_dir, mut manifest) = build_fixture();
        add_tablespace(&mut manifest, 16401, "/tbs/old");

        let remap = ManifestRemap {
            tablespace_map: HashMap::from([
                ("ts16401".into(), "/tbs/a".into()),
                ("16401".into(), "/tbs/b".into()),
            ]),
            ..ManifestRemap::default()
        };
        assert!(matches!(manifest.remap(&remap), Err(Error::TablespaceMap(_))));
    }

    #[test]
    fn ownership_reconcile_replaces_unknown() {
        let (_dir, mut manifest) = build_fixture();
        manifest.files[0].user = Some("nosuchuser".into());
        manifest.ownership_reconcile(|name, _group| name != "nosuchuser");
        assert_eq!(manifest.files[0].user, None);
    }

    #[test]
    fn reference_list_deduplicates() {
        let (_dir, mut manifest) = build_fixture();
        manifest.files[0].reference = Some("20250801-010101F".into());
        manifest.files[1].reference = Some("20250801-010101F".into());
        assert_eq!(manifest.reference_list(), vec!["20250801-010101F".to_owned()]);
    }
}
