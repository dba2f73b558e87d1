//! The `repo-ls`, `repo-get`, `repo-put`, and `repo-rm` file utilities.
//!
//! These operate on raw repository paths, below the stanza layer.

use std::io::{Read, Write};
use std::path::PathBuf;

use globset::Glob;
use serde_json::json;

use pgvault::error::Error;
use pgvault::filter::FilterGroup;
use pgvault::storage::{SortOrder, Storage};

use super::ExitResult;
use crate::runner;

#[derive(clap::Args, Debug, Clone)]
pub struct RepoPathArgs {
    /// Path of the backup repository.
    #[clap(
        long = "repo-path",
        env = "PGVAULT_REPO_PATH",
        value_name = "PATH",
        display_order = 10
    )]
    pub repo_path: PathBuf,
}

impl RepoPathArgs {
    fn storage(&self) -> Storage {
        Storage::posix(&self.repo_path)
    }
}

/// List repository files.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for repo-ls"))]
pub struct RepoLs {
    #[clap(flatten)]
    pub repo: RepoPathArgs,

    /// Path to list, relative to the repository root.
    #[clap(value_name = "PATH", default_value = "")]
    pub path: String,

    /// Only list names matching this glob.
    #[clap(long = "filter", value_name = "GLOB", display_order = 100)]
    pub filter: Option<String>,

    /// Recurse into subdirectories.
    #[clap(long = "recurse", display_order = 101)]
    pub recurse: bool,

    /// Sort order: asc or desc.
    #[clap(long = "sort", default_value = "asc", value_name = "ORDER", display_order = 102)]
    pub sort: String,

    /// Output format: text or json.
    #[clap(long = "output", default_value = "text", value_name = "FORMAT", display_order = 103)]
    pub output: String,
}

impl RepoLs {
    pub fn invoke(self) -> ExitResult {
        let sort = match self.sort.as_str() {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            other => {
                return Err(Error::OptionInvalidValue(format!(
                    "'{other}' is not a valid sort order (expected asc or desc)"
                )))
            }
        };
        let matcher = self
            .filter
            .as_deref()
            .map(|pattern| {
                Glob::new(pattern)
                    .map(|glob| glob.compile_matcher())
                    .map_err(|err| {
                        Error::OptionInvalidValue(format!("invalid filter '{pattern}': {err}"))
                    })
            })
            .transpose()?;

        let entries = self
            .repo
            .storage()
            .info_list(&self.path, self.recurse, sort)?
            .into_iter()
            .filter(|info| {
                matcher
                    .as_ref()
                    .map(|matcher| matcher.is_match(&info.name))
                    .unwrap_or(true)
            });

        if self.output == "json" {
            let values: Vec<_> = entries
                .map(|info| {
                    json!({
                        "name": info.name,
                        "type": format!("{:?}", info.file_type).to_lowercase(),
                        "size": info.size,
                        "time": info.modified,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&values).expect("valid json"));
        } else {
            let mut stdout = std::io::stdout().lock();
            for info in entries {
                let _ = writeln!(stdout, "{}", info.name);
            }
        }
        runner::success()
    }
}

/// Write a repository file to stdout.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for repo-get"))]
pub struct RepoGet {
    #[clap(flatten)]
    pub repo: RepoPathArgs,

    /// File to read, relative to the repository root.
    #[clap(value_name = "PATH")]
    pub path: String,
}

impl RepoGet {
    pub fn invoke(self) -> ExitResult {
        let data = self
            .repo
            .storage()
            .get(&self.path, false, FilterGroup::new())?
            .expect("missing file errors");
        std::io::stdout()
            .write_all(&data)
            .map_err(|err| Error::FileWrite(format!("unable to write to stdout: {err}")))?;
        runner::success()
    }
}

/// Write stdin to a repository file.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for repo-put"))]
pub struct RepoPut {
    #[clap(flatten)]
    pub repo: RepoPathArgs,

    /// File to write, relative to the repository root.
    #[clap(value_name = "PATH")]
    pub path: String,
}

impl RepoPut {
    pub fn invoke(self) -> ExitResult {
        let mut data = Vec::new();
        std::io::stdin()
            .read_to_end(&mut data)
            .map_err(|err| Error::FileRead(format!("unable to read from stdin: {err}")))?;
        self.repo.storage().put(&self.path, &data, FilterGroup::new())?;
        runner::success()
    }
}

/// Remove a repository file or path.
#[derive(clap::Args)]
#[clap(next_help_heading = Some("Options for repo-rm"))]
pub struct RepoRm {
    #[clap(flatten)]
    pub repo: RepoPathArgs,

    /// File or path to remove, relative to the repository root.
    #[clap(value_name = "PATH")]
    pub path: String,

    /// Remove paths recursively.
    #[clap(long = "recurse", display_order = 100)]
    pub recurse: bool,
}

impl RepoRm {
    pub fn invoke(self) -> ExitResult {
        let storage = self.repo.storage();
        if storage.path_exists(&self.path)? {
            storage.path_remove(&self.path, self.recurse)?;
        } else {
            storage.remove(&self.path, true)?;
        }
        runner::success()
    }
}
