//! The restore engine: backup-set selection, manifest remapping,
//! destination cleaning, selective-database zeroing, parallel file
//! dispatch, and recovery configuration.

pub mod file;

pub use file::{BackupDecode, RestoreFileContext, RestoreFileResult};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;

use shell_quote::{QuoteExt, Sh};

use crate::error::{Error, Result};
use crate::filter::FilterGroup;
use crate::manifest::{Manifest, ManifestRemap, ManifestTarget, MANIFEST_TARGET_FILE};
use crate::parallel;
use crate::pg::version::{PgVersion, PG_VERSION_12, PG_USER_OBJECT_MIN_ID};
use crate::pg::{MANIFEST_TARGET_PGDATA, PG_FILE_POSTMTRPID};
use crate::protocol::{ProtoCommand, ProtoJob, ProtoValue};
use crate::repo::Repo;
use crate::storage::{FileType, SortOrder, Storage, WriteParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreType {
    Default,
    Immediate,
    Time,
    Xid,
    Name,
    Preserve,
    Standby,
    None,
}

impl FromStr for RestoreType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(RestoreType::Default),
            "immediate" => Ok(RestoreType::Immediate),
            "time" => Ok(RestoreType::Time),
            "xid" => Ok(RestoreType::Xid),
            "name" => Ok(RestoreType::Name),
            "preserve" => Ok(RestoreType::Preserve),
            "standby" => Ok(RestoreType::Standby),
            "none" => Ok(RestoreType::None),
            other => Err(Error::OptionInvalidValue(format!(
                "'{other}' is not a valid restore type"
            ))),
        }
    }
}

pub struct RestoreConfig {
    pub stanza: String,
    /// Destination data directory.
    pub pg_path: PathBuf,
    pub repo: Repo,
    /// Specific backup set; latest when absent.
    pub set: Option<String>,
    pub delta: bool,
    pub force: bool,
    pub restore_type: RestoreType,
    pub target: Option<String>,
    pub target_timeline: Option<String>,
    pub target_action: Option<String>,
    pub target_inclusive: Option<bool>,
    pub tablespace_map: HashMap<String, String>,
    pub tablespace_map_all: Option<String>,
    pub link_map: HashMap<String, String>,
    pub link_all: bool,
    pub db_include: Vec<String>,
    pub db_exclude: Vec<String>,
    pub process_max: usize,
    pub protocol_timeout: std::time::Duration,
    /// Command used in the generated `restore_command`.
    pub cmd: String,
    pub repo_path_opt: String,
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub label: String,
    pub files_restored: usize,
    pub files_preserved: usize,
    pub files_zeroed: usize,
    pub size: u64,
}

pub fn cmd_restore(cfg: &RestoreConfig) -> Result<RestoreSummary> {
    let mut delta = cfg.delta || cfg.force;

    // ------------------------------------------------------------------
    // Preconditions

    let pg_storage = Storage::posix(&cfg.pg_path);
    if !cfg.pg_path.exists() {
        return Err(Error::PathMissing(format!(
            "restore destination '{}' does not exist",
            cfg.pg_path.display()
        )));
    }
    if cfg.pg_path.join(PG_FILE_POSTMTRPID).exists() {
        return Err(Error::PostmasterRunning(format!(
            "unable to restore while PostgreSQL is running\nHINT: presence of '{PG_FILE_POSTMTRPID}' \
             in '{}' indicates the cluster is running",
            cfg.pg_path.display()
        )));
    }
    if delta
        && !cfg.pg_path.join("global/pg_control").exists()
        && !cfg.pg_path.join(MANIFEST_TARGET_FILE).exists()
    {
        log::warn!(
            "--delta or --force specified but unable to find 'global/pg_control' or \
             '{MANIFEST_TARGET_FILE}' in '{}' - the '--delta' and '--force' options will be \
             disabled",
            cfg.pg_path.display()
        );
        delta = false;
    }

    // ------------------------------------------------------------------
    // Selection

    let info_backup = cfg.repo.load_backup_info()?;
    let record = match &cfg.set {
        Some(label) => info_backup.find(label).ok_or_else(|| {
            Error::BackupSetInvalid(format!("backup set '{label}' is not valid"))
        })?,
        None => info_backup.latest().ok_or_else(|| {
            Error::BackupSetInvalid("no backup sets to restore".into())
        })?,
    };
    let label = record.label.clone();
    log::info!("restore backup set {label}");

    let mut manifest =
        Manifest::load(&cfg.repo.storage, &label, info_backup.cipher_pass.as_deref())?;

    // ------------------------------------------------------------------
    // Remap and ownership

    let remap = ManifestRemap {
        pg_data: Some(cfg.pg_path.to_string_lossy().into_owned()),
        tablespace_map: cfg.tablespace_map.clone(),
        tablespace_map_all: cfg.tablespace_map_all.clone(),
        link_map: cfg.link_map.clone(),
        link_all: cfg.link_all,
    };
    manifest.remap(&remap)?;
    manifest.ownership_reconcile(|name, group| {
        if group {
            matches!(nix::unistd::Group::from_name(name), Ok(Some(_)))
        } else {
            matches!(nix::unistd::User::from_name(name), Ok(Some(_)))
        }
    });

    // ------------------------------------------------------------------
    // Selective restore

    let zero_files = selective_zero_set(cfg, &manifest)?;

    // ------------------------------------------------------------------
    // Clean and recreate structure

    for target in &manifest.targets {
        clean_target(cfg, &manifest, target, delta)?;
    }
    create_structure(&manifest)?;

    // ------------------------------------------------------------------
    // Parallel file dispatch

    let decode = decode_map(cfg, &info_backup.cipher_pass, &manifest)?;
    let context = RestoreFileContext {
        repo_storage: cfg.repo.storage.clone(),
        dest_storage: Storage::posix("/"),
        decode,
        delta,
        set_owner: nix::unistd::geteuid().is_root(),
    };

    let mut queues = build_queues(&manifest, &zero_files, &label);
    let queue_total = queues.len().max(1);
    let handler =
        |command: &ProtoCommand| -> Result<Vec<ProtoValue>> { file::execute(&context, command) };
    let mut summary = RestoreSummary {
        label: label.clone(),
        files_restored: 0,
        files_preserved: 0,
        files_zeroed: 0,
        size: 0,
    };
    parallel::execute(
        cfg.process_max,
        "restore file",
        cfg.protocol_timeout,
        |worker| {
            // Per-target queue affinity: a worker prefers the queue it
            // maps to and steals from the others when its own drains.
            for probe in 0..queues.len() {
                let queue = &mut queues[(worker + probe) % queue_total];
                if let Some(job) = queue.pop() {
                    return Ok(Some(job));
                }
            }
            Ok(None)
        },
        &handler,
        |outcome| {
            match outcome.output[0].as_str()? {
                "restored" => summary.files_restored += 1,
                "preserved" => summary.files_preserved += 1,
                "zeroed" => summary.files_zeroed += 1,
                _ => {}
            }
            summary.size += outcome.output[1].as_u64()?;
            Ok(())
        },
    )?;

    // ------------------------------------------------------------------
    // Recovery configuration and finalize

    write_recovery_config(cfg, &manifest)?;

    // Save the manifest into the restored data directory so a re-entrant
    // delta restore can diff against it.
    pg_storage.put(
        MANIFEST_TARGET_FILE,
        &manifest.to_ini().to_bytes(),
        FilterGroup::new(),
    )?;
    pg_storage.path_sync("")?;

    log::info!(
        "restore of backup set {label} completed ({} restored, {} preserved, {} zeroed)",
        summary.files_restored,
        summary.files_preserved,
        summary.files_zeroed
    );
    Ok(summary)
}

// ----------------------------------------------------------------------------

/// Destination directory a target cleans and restores into.
fn target_destination(target: &ManifestTarget) -> String {
    target.path.clone()
}

/// Absolute destination of one manifest entry.
fn entry_destination(manifest: &Manifest, name: &str) -> Result<String> {
    let target = manifest.target_covering(name).ok_or_else(|| {
        Error::FileInvalid(format!("manifest entry '{name}' is not covered by any target"))
    })?;
    if name == target.name {
        // A file-link target's file lands at path/file.
        if let Some(file) = &target.file {
            return Ok(format!("{}/{file}", target.path));
        }
        return Ok(target.path.clone());
    }
    let rel = &name[target.name.len() + 1..];
    Ok(format!("{}/{rel}", target.path))
}

fn clean_target(
    cfg: &RestoreConfig,
    manifest: &Manifest,
    target: &ManifestTarget,
    delta: bool,
) -> Result<()> {
    let destination = target_destination(target);
    let storage = Storage::posix(&destination);

    // A file-link target owns a single file inside an existing
    // directory; only make sure that directory is there.
    if target.file.is_some() {
        if storage.info("", true)?.is_none() {
            storage.path_create("", 0o700)?;
        }
        return Ok(());
    }

    let info = match storage.info("", true)? {
        Some(info) => info,
        None => {
            // Missing destination: create it with the manifest's mode.
            let mode = manifest
                .paths
                .iter()
                .find(|p| p.name == target.name)
                .map(|p| p.mode)
                .unwrap_or(0o700);
            storage.path_create("", mode)?;
            return Ok(());
        }
    };
    if info.file_type != FileType::Path {
        return Err(Error::PathOpen(format!(
            "restore target '{destination}' is not a directory"
        )));
    }
    // The destination must belong to us and be fully accessible.
    if !nix::unistd::geteuid().is_root() {
        let current = nix::unistd::User::from_uid(nix::unistd::geteuid())
            .ok()
            .flatten()
            .map(|user| user.name);
        if info.user != current {
            return Err(Error::FileOwner(format!(
                "unable to restore to path '{destination}' not owned by the current user"
            )));
        }
    }
    if info.mode & 0o700 != 0o700 {
        return Err(Error::PathOpen(format!(
            "unable to restore to path '{destination}' without rwx permissions"
        )));
    }

    if !delta {
        let allowed: &[&str] = match cfg.restore_type {
            RestoreType::Preserve => &[MANIFEST_TARGET_FILE, "recovery.conf", "postgresql.auto.conf", "recovery.signal", "standby.signal"],
            _ => &[MANIFEST_TARGET_FILE],
        };
        let unexpected: Vec<String> = storage
            .list("")?
            .into_iter()
            .filter(|name| !allowed.contains(&name.as_str()))
            .collect();
        if !unexpected.is_empty() {
            return Err(Error::PathNotEmpty(format!(
                "unable to restore to path '{destination}' that contains files\nHINT: use \
                 --delta or --force to force the restore",
            )));
        }
        return Ok(());
    }

    // Delta: drop anything the manifest does not know, reconcile the
    // mode and ownership of everything it does.
    let known: HashSet<String> = manifest
        .paths
        .iter()
        .map(|p| p.name.clone())
        .chain(manifest.files.iter().map(|f| f.name.clone()))
        .chain(manifest.links.iter().map(|l| l.name.clone()))
        .collect();
    let set_owner = nix::unistd::geteuid().is_root();
    for info in storage.info_list("", true, SortOrder::Desc)? {
        let name = format!("{}/{}", target.name, info.name);
        if target.name == MANIFEST_TARGET_PGDATA && info.name == MANIFEST_TARGET_FILE {
            continue;
        }
        if !known.contains(&name) {
            match info.file_type {
                FileType::Path => {
                    storage.path_remove(&info.name, true)?;
                }
                _ => storage.remove(&info.name, false)?,
            }
            continue;
        }
        let (mode, user, group) = match info.file_type {
            FileType::Path => {
                let entry = manifest.paths.iter().find(|p| p.name == name);
                match entry {
                    Some(p) => (Some(p.mode), p.user.clone(), p.group.clone()),
                    None => continue,
                }
            }
            FileType::File => {
                let entry = manifest.files.iter().find(|f| f.name == name);
                match entry {
                    Some(f) => (Some(f.mode), f.user.clone(), f.group.clone()),
                    None => continue,
                }
            }
            _ => continue,
        };
        if let Some(mode) = mode {
            if info.mode != mode {
                storage.mode_set(&info.name, mode)?;
            }
        }
        if set_owner && (info.user != user || info.group != group) {
            storage.owner_set(&info.name, user.as_deref(), group.as_deref())?;
        }
    }
    Ok(())
}

/// Create every path and symlink in the manifest that is still missing.
fn create_structure(manifest: &Manifest) -> Result<()> {
    let storage = Storage::posix("/");
    let set_owner = nix::unistd::geteuid().is_root();
    for path in &manifest.paths {
        let dest = entry_destination(manifest, &path.name)?;
        if storage.info(&dest, false)?.is_none() {
            storage.path_create(&dest, path.mode)?;
            if set_owner {
                storage.owner_set(&dest, path.user.as_deref(), path.group.as_deref())?;
            }
        }
    }
    for link in &manifest.links {
        // Tablespace links and plain links alike are recreated from the
        // links list.
        let target = manifest.target_covering(&link.name);
        let link_path = match target {
            // A link that is itself a target points at the (possibly
            // remapped) target path.
            Some(t) if t.name == link.name => match &t.file {
                Some(file) => format!("{}/{file}", t.path),
                None => t.path.clone(),
            },
            _ => link.destination.clone(),
        };
        // The symlink node itself lives inside its parent directory.
        let node = link_node_path(manifest, &link.name)?;
        if storage.info(&node, false)?.is_none() {
            storage.link_create(&link_path, &node)?;
        }
    }
    Ok(())
}

/// Filesystem path of the symlink node for a manifest link entry (the
/// link lives under its *parent* directory, not at its own target path).
fn link_node_path(manifest: &Manifest, link_name: &str) -> Result<String> {
    let (parent, base) = link_name.rsplit_once('/').ok_or_else(|| {
        Error::FileInvalid(format!("invalid link name '{link_name}'"))
    })?;
    let parent_dest = entry_destination(manifest, parent)?;
    Ok(format!("{parent_dest}/{base}"))
}

// ----------------------------------------------------------------------------

/// Resolve `--db-include`/`--db-exclude` to the set of manifest files to
/// zero instead of restore.
fn selective_zero_set(cfg: &RestoreConfig, manifest: &Manifest) -> Result<HashSet<String>> {
    let mut zero = HashSet::new();
    if cfg.db_include.is_empty() && cfg.db_exclude.is_empty() {
        return Ok(zero);
    }
    if manifest.databases.is_empty() {
        return Err(Error::FileInvalid(
            "backup manifest does not contain any database information\nHINT: was the backup \
             taken with a newer version?"
                .into(),
        ));
    }

    let resolve = |name: &str| -> Result<u32> {
        if let Ok(oid) = name.parse::<u32>() {
            return Ok(oid);
        }
        manifest
            .databases
            .iter()
            .find(|db| db.name == name)
            .map(|db| db.oid)
            .ok_or_else(|| {
                Error::OptionInvalidValue(format!("database to include '{name}' does not exist"))
            })
    };

    let include: HashSet<u32> = cfg.db_include.iter().map(|n| resolve(n)).collect::<Result<_>>()?;
    let exclude: HashSet<u32> = cfg.db_exclude.iter().map(|n| resolve(n)).collect::<Result<_>>()?;

    for db in &manifest.databases {
        // System databases are always restored.
        if db.oid < PG_USER_OBJECT_MIN_ID {
            continue;
        }
        let excluded = if !cfg.db_include.is_empty() {
            !include.contains(&db.oid)
        } else {
            exclude.contains(&db.oid)
        };
        if !excluded {
            continue;
        }
        log::info!("database '{}' ({}) will be zeroed", db.name, db.oid);
        let base_prefix = format!("pg_data/base/{}/", db.oid);
        for entry in &manifest.files {
            let in_base = entry.name.starts_with(&base_prefix);
            let in_tablespace = entry.name.starts_with("pg_tblspc/")
                && entry
                    .name
                    .split('/')
                    .nth(3)
                    .map(|dir| dir == db.oid.to_string())
                    .unwrap_or(false);
            if in_base || in_tablespace {
                zero.insert(entry.name.clone());
            }
        }
    }
    Ok(zero)
}

// ----------------------------------------------------------------------------

/// Per-label decode data for the backup set and its references.
fn decode_map(
    cfg: &RestoreConfig,
    backup_cipher_pass: &Option<String>,
    manifest: &Manifest,
) -> Result<HashMap<String, BackupDecode>> {
    let mut decode = HashMap::new();
    decode.insert(
        manifest.backup.label.clone(),
        BackupDecode {
            cipher_pass: manifest.cipher_pass.clone(),
            compress_ext: manifest.options.compress_type.clone(),
        },
    );
    for label in manifest.reference_list() {
        let referenced =
            Manifest::load(&cfg.repo.storage, &label, backup_cipher_pass.as_deref())?;
        decode.insert(
            label,
            BackupDecode {
                cipher_pass: referenced.cipher_pass.clone(),
                compress_ext: referenced.options.compress_type.clone(),
            },
        );
    }
    Ok(decode)
}

/// One job queue per target, each sorted so the largest file pops first.
fn build_queues(
    manifest: &Manifest,
    zero_files: &HashSet<String>,
    label: &str,
) -> Vec<Vec<ProtoJob>> {
    let mut by_target: HashMap<&str, Vec<(u64, ProtoJob)>> = HashMap::new();
    for entry in &manifest.files {
        let target = match manifest.target_covering(&entry.name) {
            Some(target) => target.name.as_str(),
            None => continue,
        };
        let dest = match entry_destination(manifest, &entry.name) {
            Ok(dest) => dest,
            Err(_) => continue,
        };
        let zero = zero_files.contains(&entry.name);
        let owner_label = entry.reference.clone().unwrap_or_else(|| label.to_owned());
        let bundle = match (entry.bundle_id, entry.bundle_offset) {
            (Some(id), Some(offset)) => vec![
                ProtoValue::U64(id),
                ProtoValue::U64(offset),
                ProtoValue::U64(entry.size_repo),
            ],
            _ => vec![],
        };
        let job = ProtoJob {
            key: entry.name.clone(),
            command: ProtoCommand::new(
                "restore-file",
                vec![
                    ProtoValue::Str(entry.name.clone()),
                    ProtoValue::Str(dest),
                    ProtoValue::Str(owner_label),
                    ProtoValue::U64(entry.size),
                    ProtoValue::OptStr(entry.checksum.clone()),
                    ProtoValue::U64(u64::from(entry.mode)),
                    ProtoValue::OptStr(entry.user.clone()),
                    ProtoValue::OptStr(entry.group.clone()),
                    ProtoValue::List(bundle),
                    ProtoValue::Bool(zero),
                ],
            ),
        };
        by_target.entry(target).or_default().push((entry.size, job));
    }

    // Ascending size within each queue, so pop() yields the largest.
    let mut queues: Vec<Vec<ProtoJob>> = by_target
        .into_iter()
        .map(|(_, mut jobs)| {
            jobs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.key.cmp(&a.1.key)));
            jobs.into_iter().map(|(_, job)| job).collect()
        })
        .collect();
    queues.sort_by_key(Vec::len);
    queues
}

// ----------------------------------------------------------------------------

/// Write the version-appropriate recovery configuration.
fn write_recovery_config(cfg: &RestoreConfig, manifest: &Manifest) -> Result<()> {
    if matches!(cfg.restore_type, RestoreType::Preserve | RestoreType::None) {
        return Ok(());
    }
    let version: PgVersion = manifest.pg_version.parse()?;
    let pg_storage = Storage::posix(&cfg.pg_path);

    let mut restore_command_buf: Vec<u8> = Vec::new();
    restore_command_buf.push_quoted(Sh, &cfg.cmd);
    restore_command_buf.extend_from_slice(b" --stanza=");
    restore_command_buf.push_quoted(Sh, &cfg.stanza);
    restore_command_buf.extend_from_slice(b" --repo-path=");
    restore_command_buf.push_quoted(Sh, &cfg.repo_path_opt);
    restore_command_buf.extend_from_slice(b" archive-get %f \"%p\"");
    let restore_command = String::from_utf8(restore_command_buf)
        .map_err(|e| Error::Format(format!("invalid UTF-8 in restore command: {e}")))?;

    let mut settings = vec![format!("restore_command = '{restore_command}'")];
    match cfg.restore_type {
        RestoreType::Immediate => settings.push("recovery_target = 'immediate'".to_owned()),
        RestoreType::Time => settings.push(format!(
            "recovery_target_time = '{}'",
            cfg.target.as_deref().unwrap_or_default()
        )),
        RestoreType::Xid => settings.push(format!(
            "recovery_target_xid = '{}'",
            cfg.target.as_deref().unwrap_or_default()
        )),
        RestoreType::Name => settings.push(format!(
            "recovery_target_name = '{}'",
            cfg.target.as_deref().unwrap_or_default()
        )),
        RestoreType::Default | RestoreType::Standby => {}
        RestoreType::Preserve | RestoreType::None => unreachable!("handled above"),
    }
    if let Some(timeline) = &cfg.target_timeline {
        settings.push(format!("recovery_target_timeline = '{timeline}'"));
    }
    if let Some(action) = &cfg.target_action {
        settings.push(format!("recovery_target_action = '{action}'"));
    }
    if let Some(inclusive) = cfg.target_inclusive {
        settings.push(format!(
            "recovery_target_inclusive = '{}'",
            if inclusive { "true" } else { "false" }
        ));
    }

    if version >= PG_VERSION_12 {
        // Settings append to postgresql.auto.conf; recovery is requested
        // through signal files.
        let mut content = pg_storage
            .get("postgresql.auto.conf", true, FilterGroup::new())?
            .map(|data| String::from_utf8_lossy(&data).into_owned())
            .unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!(
            "\n# Recovery settings generated by pgvault restore\n{}\n",
            settings.join("\n")
        ));
        pg_storage.put("postgresql.auto.conf", content.as_bytes(), FilterGroup::new())?;

        let signal = if cfg.restore_type == RestoreType::Standby {
            "standby.signal"
        } else {
            "recovery.signal"
        };
        pg_storage.put(signal, b"", FilterGroup::new())?;
        let other = if signal == "standby.signal" { "recovery.signal" } else { "standby.signal" };
        pg_storage.remove(other, false)?;
    } else {
        if cfg.restore_type == RestoreType::Standby {
            settings.push("standby_mode = 'on'".to_owned());
        }
        let content = format!(
            "# Generated by pgvault restore\n{}\n",
            settings.join("\n")
        );
        let mut write = pg_storage.new_write(
            "recovery.conf",
            WriteParams { mode: Some(0o600), ..WriteParams::default() },
            FilterGroup::new(),
        )?;
        use std::io::Write as _;
        write
            .write_all(content.as_bytes())
            .map_err(|err| Error::FileWrite(format!("unable to write recovery.conf: {err}")))?;
        write.close()?;
    }
    Ok(())
}
