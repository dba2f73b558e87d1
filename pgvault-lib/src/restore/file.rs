//! The restore file worker: materialize one manifest file at its
//! destination, from the repository or as zeros (selective restore).

use std::collections::HashMap;
use std::io::Write as _;

use crate::error::{Error, Result};
use crate::filter::hash::sha1_hex;
use crate::filter::{
    CipherFilter, CipherMode, CompressType, DecompressFilter, FilterGroup, HashFilter,
};
use crate::protocol::{ProtoCommand, ProtoValue};
use crate::storage::{Storage, WriteParams};

/// Where a referenced file's bytes live and how to decode them.
#[derive(Debug, Clone)]
pub struct BackupDecode {
    pub cipher_pass: Option<String>,
    pub compress_ext: Option<String>,
}

pub struct RestoreFileContext {
    pub repo_storage: Storage,
    /// Destination storage rooted at the (possibly remapped) target base;
    /// workers receive absolute destination paths.
    pub dest_storage: Storage,
    /// Per-label decode data for the backup set and everything it
    /// references.
    pub decode: HashMap<String, BackupDecode>,
    /// Reconcile content when the destination already exists.
    pub delta: bool,
    /// Apply ownership (only meaningful when running as root).
    pub set_owner: bool,
}

/// How one file was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreFileResult {
    Restored,
    /// Delta found the destination already correct.
    Preserved,
    Zeroed,
}

impl RestoreFileContext {
    fn decode_for(&self, label: &str) -> Result<&BackupDecode> {
        self.decode.get(label).ok_or_else(|| {
            Error::Assert(format!("no decode data for referenced backup '{label}'"))
        })
    }

    /// Locate the repository object for `name` within `label`, probing
    /// the compression extensions in use.
    fn repo_object(&self, label: &str, name: &str) -> Result<String> {
        let decode = self.decode_for(label)?;
        let mut candidates: Vec<String> = Vec::new();
        if let Some(ext) = &decode.compress_ext {
            candidates.push(format!("<REPO:BACKUP>/{label}/{name}.{ext}"));
        }
        candidates.push(format!("<REPO:BACKUP>/{label}/{name}"));
        for ext in ["gz", "zst"] {
            let candidate = format!("<REPO:BACKUP>/{label}/{name}.{ext}");
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        for candidate in &candidates {
            if self.repo_storage.exists(candidate)? {
                return Ok(candidate.clone());
            }
        }
        Err(Error::FileMissing(format!(
            "unable to find '{name}' in backup '{label}'"
        )))
    }

    fn decode_filters(&self, label: &str, object: &str) -> Result<FilterGroup> {
        let decode = self.decode_for(label)?;
        let mut filters = FilterGroup::new();
        if let Some(pass) = &decode.cipher_pass {
            filters = filters.add(Box::new(CipherFilter::new(CipherMode::Decrypt, pass)?));
        }
        if let Some(compress_type) = CompressType::from_name(object) {
            filters = filters.add(Box::new(DecompressFilter::new(compress_type)));
        }
        filters = filters.add(Box::new(HashFilter::sha1()));
        Ok(filters)
    }

    /// Restore one file to `dest` (absolute), verifying its checksum.
    #[allow(clippy::too_many_arguments)]
    pub fn restore_file(
        &self,
        name: &str,
        dest: &str,
        label: &str,
        size: u64,
        checksum: Option<&str>,
        mode: u32,
        user: Option<&str>,
        group: Option<&str>,
        bundle: Option<(u64, u64, u64)>,
        zero: bool,
    ) -> Result<RestoreFileResult> {
        if zero {
            self.write_dest(dest, &vec![0u8; size as usize], mode, user, group)?;
            return Ok(RestoreFileResult::Zeroed);
        }

        // Delta: an existing destination with the right size and digest
        // is left alone (ownership and mode were reconciled during the
        // clean).
        if self.delta {
            if let Some(existing) = self
                .dest_storage
                .get(dest, true, FilterGroup::new())?
            {
                if existing.len() as u64 == size
                    && checksum.map(|c| c == sha1_hex(&existing)).unwrap_or(false)
                {
                    return Ok(RestoreFileResult::Preserved);
                }
            }
        }

        let data = match bundle {
            Some((bundle_id, offset, repo_size)) => {
                // Bundled: slice this file's span out of the bundle
                // object, then decode it alone.
                let object = format!("<REPO:BACKUP>/{label}/bundle/{bundle_id}");
                let bundle_data = self
                    .repo_storage
                    .get(&object, false, FilterGroup::new())?
                    .expect("missing file errors");
                let end = (offset + repo_size) as usize;
                if end > bundle_data.len() {
                    return Err(Error::Format(format!(
                        "bundle '{object}' is too short for '{name}'"
                    )));
                }
                let slice = &bundle_data[offset as usize..end];
                // Bundled spans carry no extension of their own; decode
                // with the owning backup's compression type.
                let pseudo_name = match &self.decode_for(label)?.compress_ext {
                    Some(ext) => format!("span.{ext}"),
                    None => String::new(),
                };
                let mut filters = self.decode_filters(label, &pseudo_name)?;
                let mut out = Vec::new();
                filters.process(slice, &mut out)?;
                filters.flush(&mut out)?;
                let digest = filters.results()["hash"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                verify_checksum(name, checksum, &digest)?;
                out
            }
            None => {
                let object = self.repo_object(label, name)?;
                let mut read = self
                    .repo_storage
                    .new_read(&object, false, self.decode_filters(label, &object)?)?
                    .expect("missing file errors");
                let mut data = Vec::new();
                std::io::Read::read_to_end(&mut read, &mut data).map_err(|err| {
                    Error::FileRead(format!("unable to read '{object}': {err}"))
                })?;
                let digest = read.results()?["hash"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                verify_checksum(name, checksum, &digest)?;
                data
            }
        };

        self.write_dest(dest, &data, mode, user, group)?;
        Ok(RestoreFileResult::Restored)
    }

    fn write_dest(
        &self,
        dest: &str,
        data: &[u8],
        mode: u32,
        user: Option<&str>,
        group: Option<&str>,
    ) -> Result<()> {
        let params = WriteParams {
            mode: Some(mode),
            // Paths were created during the clean; the final sync pass
            // happens once per target.
            no_sync_path: true,
            ..WriteParams::default()
        };
        let mut write = self.dest_storage.new_write(dest, params, FilterGroup::new())?;
        write
            .write_all(data)
            .map_err(|err| Error::FileWrite(format!("unable to write '{dest}': {err}")))?;
        write.close()?;
        if self.set_owner {
            self.dest_storage.owner_set(dest, user, group)?;
        }
        Ok(())
    }
}

fn verify_checksum(name: &str, expected: Option<&str>, actual: &str) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(Error::Checksum(format!(
            "error restoring '{name}': actual checksum '{actual}' does not match expected \
             checksum '{expected}'"
        ))),
        _ => Ok(()),
    }
}

// ----------------------------------------------------------------------------
// Protocol framing

/// Execute one `restore-file` command:
/// `[name, dest, label, size, checksum?, mode, user?, group?, bundle?, zero]`.
pub fn execute(context: &RestoreFileContext, command: &ProtoCommand) -> Result<Vec<ProtoValue>> {
    if command.name != "restore-file" {
        return Err(Error::Protocol(format!("unknown restore command '{}'", command.name)));
    }
    let name = command.param(0)?.as_str()?;
    let dest = command.param(1)?.as_str()?;
    let label = command.param(2)?.as_str()?;
    let size = command.param(3)?.as_u64()?;
    let checksum = command.param(4)?.as_opt_str()?;
    let mode = command.param(5)?.as_u64()? as u32;
    let user = command.param(6)?.as_opt_str()?;
    let group = command.param(7)?.as_opt_str()?;
    let bundle = match command.param(8)?.as_list()? {
        [] => None,
        [id, offset, repo_size] => Some((id.as_u64()?, offset.as_u64()?, repo_size.as_u64()?)),
        _ => return Err(Error::Protocol("malformed bundle parameter".into())),
    };
    let zero = command.param(9)?.as_bool()?;

    let result =
        context.restore_file(name, dest, label, size, checksum, mode, user, group, bundle, zero)?;
    let tag = match result {
        RestoreFileResult::Restored => "restored",
        RestoreFileResult::Preserved => "preserved",
        RestoreFileResult::Zeroed => "zeroed",
    };
    Ok(vec![ProtoValue::Str(tag.to_owned()), ProtoValue::U64(size)])
}
