//! The backup file worker: copy one cluster file (or one bundle of small
//! files) into the repository through the filter pipeline.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::{
    CipherFilter, CipherMode, CompressFilter, CompressType, FilterGroup, HashFilter,
    PageChecksumFilter, SizeFilter,
};
use crate::protocol::{ProtoCommand, ProtoValue};
use crate::storage::{Storage, WriteParams};

lazy_static! {
    /// Relation segment files, whose pages carry checksums: `base/<db>/
    /// <relfilenode>[.<segment>]`, the same under `global/` and inside
    /// tablespace version directories.
    static ref RELATION_FILE_RE: Regex = Regex::new(
        "(^pg_data/(base/[0-9]+|global)/[0-9]+(\\.[0-9]+)?$)|\
         (^pg_tblspc/[0-9]+/[^/]+/[0-9]+/[0-9]+(\\.[0-9]+)?$)"
    )
    .expect("valid regex");
}

/// How one file left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCopyResult {
    /// Copied into the repository.
    Copy,
    /// Unchanged from the prior backup; not re-copied.
    Skip,
    /// Vanished from the cluster before it could be copied; drop it from
    /// the manifest.
    Noop,
    /// Changed size while being copied (still captured).
    Checksum,
}

impl BackupCopyResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCopyResult::Copy => "copy",
            BackupCopyResult::Skip => "skip",
            BackupCopyResult::Noop => "noop",
            BackupCopyResult::Checksum => "checksum",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "copy" => Ok(BackupCopyResult::Copy),
            "skip" => Ok(BackupCopyResult::Skip),
            "noop" => Ok(BackupCopyResult::Noop),
            "checksum" => Ok(BackupCopyResult::Checksum),
            other => Err(Error::Protocol(format!("invalid copy result '{other}'"))),
        }
    }
}

/// Everything the worker needs, shared across jobs.
pub struct BackupFileContext {
    pub pg_storage: Storage,
    pub repo_storage: Storage,
    pub label: String,
    pub compress_type: Option<CompressType>,
    pub compress_level: Option<i32>,
    /// Manifest sub-passphrase for backup data files.
    pub cipher_pass: Option<String>,
    pub page_checksum: bool,
    /// Backup start LSN; pages at or past it may be torn and are not
    /// checked.
    pub lsn_limit: u64,
    /// Pages per relation segment (1 GiB / page size).
    pub segment_page_total: u32,
}

/// Result for one file within a job.
#[derive(Debug, Clone)]
pub struct BackupFileResult {
    pub name: String,
    pub result: BackupCopyResult,
    pub copy_size: u64,
    pub repo_size: u64,
    pub checksum: Option<String>,
    pub page_checksum: Option<Value>,
    pub bundle_offset: Option<u64>,
}

impl BackupFileContext {
    /// The repository object for a manifest file name.
    pub fn repo_file(&self, manifest_name: &str) -> String {
        let ext = self
            .compress_type
            .map(|t| format!(".{}", t.extension()))
            .unwrap_or_default();
        format!("<REPO:BACKUP>/{}/{manifest_name}{ext}", self.label)
    }

    /// Source path (relative to the data directory) for a manifest name.
    /// `pg_data/...` strips its prefix; tablespace names traverse the
    /// `pg_tblspc` link.
    pub fn source_path(manifest_name: &str) -> &str {
        manifest_name.strip_prefix("pg_data/").unwrap_or(manifest_name)
    }

    fn read_filters(&self, manifest_name: &str) -> Result<(FilterGroup, bool)> {
        let mut filters = FilterGroup::new().add(Box::new(SizeFilter::new()));
        let mut page_checked = false;
        if self.page_checksum && RELATION_FILE_RE.is_match(manifest_name) {
            let segment_no: u32 = manifest_name
                .rsplit_once('.')
                .and_then(|(_, seg)| seg.parse().ok())
                .unwrap_or(0);
            filters = filters.add(Box::new(PageChecksumFilter::new(
                segment_no,
                self.segment_page_total,
                self.lsn_limit,
            )));
            page_checked = true;
        }
        filters = filters.add(Box::new(HashFilter::sha1()));
        Ok((filters, page_checked))
    }

    fn write_filters(&self) -> Result<FilterGroup> {
        let mut filters = FilterGroup::new();
        if let Some(compress_type) = self.compress_type {
            let level = self
                .compress_level
                .unwrap_or_else(|| compress_type.default_level());
            filters = filters.add(Box::new(CompressFilter::new(compress_type, level)));
        }
        if let Some(pass) = &self.cipher_pass {
            filters = filters.add(Box::new(CipherFilter::new(CipherMode::Encrypt, pass)?));
        }
        filters = filters.add(Box::new(SizeFilter::new()));
        Ok(filters)
    }

    /// Copy one file to its own repository object.
    pub fn copy_file(&self, manifest_name: &str, expected_size: u64) -> Result<BackupFileResult> {
        let source = Self::source_path(manifest_name);
        let (read_filters, page_checked) = self.read_filters(manifest_name)?;
        let read = match self.pg_storage.new_read(source, true, read_filters)? {
            Some(read) => read,
            // Dropped while the backup ran (a vacuumed relation, say).
            None => {
                return Ok(BackupFileResult {
                    name: manifest_name.to_owned(),
                    result: BackupCopyResult::Noop,
                    copy_size: 0,
                    repo_size: 0,
                    checksum: None,
                    page_checksum: None,
                    bundle_offset: None,
                })
            }
        };
        let write = self.repo_storage.new_write(
            &self.repo_file(manifest_name),
            WriteParams::default(),
            self.write_filters()?,
        )?;
        let (read_results, write_results) = self.repo_storage.copy(read, write)?;

        let copy_size = read_results["size"].as_u64().unwrap_or(0);
        let result = if copy_size == expected_size {
            BackupCopyResult::Copy
        } else {
            BackupCopyResult::Checksum
        };
        Ok(BackupFileResult {
            name: manifest_name.to_owned(),
            result,
            copy_size,
            repo_size: write_results["size"].as_u64().unwrap_or(0),
            checksum: read_results["hash"].as_str().map(str::to_owned),
            page_checksum: page_checked.then(|| read_results["page-checksum"].clone()),
            bundle_offset: None,
        })
    }

    /// Copy a list of small files into one bundle object. Each file is
    /// individually compressed/encrypted and concatenated; offsets land
    /// in the manifest.
    pub fn copy_bundle(
        &self,
        bundle_id: u64,
        names_sizes: &[(String, u64)],
    ) -> Result<Vec<BackupFileResult>> {
        use std::io::Write as _;

        let mut results = Vec::with_capacity(names_sizes.len());
        let mut bundle = Vec::new();
        for (manifest_name, expected_size) in names_sizes {
            let source = Self::source_path(manifest_name);
            let (read_filters, page_checked) = self.read_filters(manifest_name)?;
            let mut read = match self.pg_storage.new_read(source, true, read_filters)? {
                Some(read) => read,
                None => {
                    results.push(BackupFileResult {
                        name: manifest_name.clone(),
                        result: BackupCopyResult::Noop,
                        copy_size: 0,
                        repo_size: 0,
                        checksum: None,
                        page_checksum: None,
                        bundle_offset: None,
                    });
                    continue;
                }
            };
            let offset = bundle.len() as u64;
            let mut encoded = Vec::new();
            let mut filters = self.write_filters()?;
            let mut chunk = vec![0u8; crate::filter::BUFFER_SIZE];
            loop {
                let n = std::io::Read::read(&mut read, &mut chunk).map_err(|err| {
                    Error::FileRead(format!("unable to read '{source}': {err}"))
                })?;
                if n == 0 {
                    break;
                }
                filters.process(&chunk[..n], &mut encoded)?;
            }
            filters.flush(&mut encoded)?;
            bundle
                .write_all(&encoded)
                .expect("writing to a Vec cannot fail");

            let read_results = read.results()?;
            let copy_size = read_results["size"].as_u64().unwrap_or(0);
            results.push(BackupFileResult {
                name: manifest_name.clone(),
                result: if copy_size == *expected_size {
                    BackupCopyResult::Copy
                } else {
                    BackupCopyResult::Checksum
                },
                copy_size,
                repo_size: encoded.len() as u64,
                checksum: read_results["hash"].as_str().map(str::to_owned),
                page_checksum: page_checked.then(|| read_results["page-checksum"].clone()),
                bundle_offset: Some(offset),
            });
        }

        if !bundle.is_empty() {
            self.repo_storage.put(
                &format!("<REPO:BACKUP>/{}/bundle/{bundle_id}", self.label),
                &bundle,
                FilterGroup::new(),
            )?;
        }
        Ok(results)
    }
}

// ----------------------------------------------------------------------------
// Protocol framing

fn result_to_proto(result: &BackupFileResult) -> ProtoValue {
    ProtoValue::List(vec![
        ProtoValue::Str(result.name.clone()),
        ProtoValue::Str(result.result.as_str().to_owned()),
        ProtoValue::U64(result.copy_size),
        ProtoValue::U64(result.repo_size),
        ProtoValue::OptStr(result.checksum.clone()),
        ProtoValue::OptStr(result.page_checksum.as_ref().map(|v| v.to_string())),
        ProtoValue::OptStr(result.bundle_offset.map(|o| o.to_string())),
    ])
}

pub fn result_from_proto(value: &ProtoValue) -> Result<BackupFileResult> {
    let fields = value.as_list()?;
    if fields.len() != 7 {
        return Err(Error::Protocol("malformed backup file result".into()));
    }
    Ok(BackupFileResult {
        name: fields[0].as_str()?.to_owned(),
        result: BackupCopyResult::parse(fields[1].as_str()?)?,
        copy_size: fields[2].as_u64()?,
        repo_size: fields[3].as_u64()?,
        checksum: fields[4].as_opt_str()?.map(str::to_owned),
        page_checksum: fields[5]
            .as_opt_str()?
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .transpose()?,
        bundle_offset: fields[6]
            .as_opt_str()?
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| Error::Protocol("invalid bundle offset".into()))
            })
            .transpose()?,
    })
}

/// Execute one `backup-file` or `backup-bundle` command.
pub fn execute(context: &BackupFileContext, command: &ProtoCommand) -> Result<Vec<ProtoValue>> {
    match command.name {
        "backup-file" => {
            let name = command.param(0)?.as_str()?;
            let size = command.param(1)?.as_u64()?;
            let result = context.copy_file(name, size)?;
            Ok(vec![result_to_proto(&result)])
        }
        "backup-bundle" => {
            let bundle_id = command.param(0)?.as_u64()?;
            let names = command.param(1)?.as_str_list()?;
            let sizes = command.param(2)?.as_list()?;
            let names_sizes: Vec<(String, u64)> = names
                .iter()
                .zip(sizes)
                .map(|(name, size)| Ok((name.clone(), size.as_u64()?)))
                .collect::<Result<_>>()?;
            let results = context.copy_bundle(bundle_id, &names_sizes)?;
            Ok(results.iter().map(result_to_proto).collect())
        }
        other => Err(Error::Protocol(format!("unknown backup command '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_files_are_recognized() {
        assert!(RELATION_FILE_RE.is_match("pg_data/base/16384/2608"));
        assert!(RELATION_FILE_RE.is_match("pg_data/base/16384/2608.1"));
        assert!(RELATION_FILE_RE.is_match("pg_data/global/1213"));
        assert!(RELATION_FILE_RE.is_match("pg_tblspc/16400/PG_16_202307071/16401/3000"));
        assert!(!RELATION_FILE_RE.is_match("pg_data/base/16384/PG_VERSION"));
        assert!(!RELATION_FILE_RE.is_match("pg_data/pg_xact/0000"));
        assert!(!RELATION_FILE_RE.is_match("pg_data/global/pg_control"));
    }

    #[test]
    fn source_paths_strip_pg_data_only() {
        assert_eq!(BackupFileContext::source_path("pg_data/base/1/112"), "base/1/112");
        assert_eq!(
            BackupFileContext::source_path("pg_tblspc/16400/PG_16/1/1"),
            "pg_tblspc/16400/PG_16/1/1"
        );
    }

    #[test]
    fn proto_round_trip() {
        let result = BackupFileResult {
            name: "pg_data/base/1/112".into(),
            result: BackupCopyResult::Copy,
            copy_size: 8192,
            repo_size: 120,
            checksum: Some("ab".repeat(20)),
            page_checksum: Some(serde_json::json!({"valid": true, "align": true})),
            bundle_offset: Some(77),
        };
        let decoded = result_from_proto(&result_to_proto(&result)).unwrap();
        assert_eq!(decoded.name, result.name);
        assert_eq!(decoded.result, result.result);
        assert_eq!(decoded.copy_size, 8192);
        assert_eq!(decoded.checksum, result.checksum);
        assert_eq!(decoded.page_checksum, result.page_checksum);
        assert_eq!(decoded.bundle_offset, Some(77));
    }
}
