mod archive;
mod backup;
mod check;
mod control;
mod info;
mod repo;
mod restore;
mod stanza;
mod verify;

pub(crate) use crate::runner::ExitResult;

#[derive(clap::Subcommand)]
pub(crate) enum Command {
    #[clap(name = "archive-push", display_order = 1)]
    ArchivePush(archive::ArchivePush),

    #[clap(name = "archive-get", display_order = 2)]
    ArchiveGet(archive::ArchiveGet),

    #[clap(display_order = 3)]
    Backup(backup::Backup),

    #[clap(display_order = 4)]
    Restore(restore::Restore),

    #[clap(name = "stanza-create", display_order = 5)]
    StanzaCreate(stanza::StanzaCreate),

    #[clap(name = "stanza-upgrade", display_order = 6)]
    StanzaUpgrade(stanza::StanzaUpgrade),

    #[clap(name = "stanza-delete", display_order = 7)]
    StanzaDelete(stanza::StanzaDelete),

    #[clap(display_order = 8)]
    Expire(verify::Expire),

    #[clap(display_order = 9)]
    Verify(verify::Verify),

    #[clap(display_order = 10)]
    Check(check::Check),

    #[clap(display_order = 11)]
    Info(info::Info),

    #[clap(name = "repo-ls", display_order = 12)]
    RepoLs(repo::RepoLs),

    #[clap(name = "repo-get", display_order = 13)]
    RepoGet(repo::RepoGet),

    #[clap(name = "repo-put", display_order = 14)]
    RepoPut(repo::RepoPut),

    #[clap(name = "repo-rm", display_order = 15)]
    RepoRm(repo::RepoRm),

    #[clap(display_order = 16)]
    Start(control::Start),

    #[clap(display_order = 17)]
    Stop(control::Stop),
}

impl Command {
    pub(crate) fn invoke(self) -> ExitResult {
        match self {
            Self::ArchivePush(command) => command.invoke(),
            Self::ArchiveGet(command) => command.invoke(),
            Self::Backup(command) => command.invoke(),
            Self::Restore(command) => command.invoke(),
            Self::StanzaCreate(command) => command.invoke(),
            Self::StanzaUpgrade(command) => command.invoke(),
            Self::StanzaDelete(command) => command.invoke(),
            Self::Expire(command) => command.invoke(),
            Self::Verify(command) => command.invoke(),
            Self::Check(command) => command.invoke(),
            Self::Info(command) => command.invoke(),
            Self::RepoLs(command) => command.invoke(),
            Self::RepoGet(command) => command.invoke(),
            Self::RepoPut(command) => command.invoke(),
            Self::RepoRm(command) => command.invoke(),
            Self::Start(command) => command.invoke(),
            Self::Stop(command) => command.invoke(),
        }
    }
}
