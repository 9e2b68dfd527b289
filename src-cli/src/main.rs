mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use nested_set::{
    Author, Comment, CommentDraft, LockBackend, LockManager, MemoryLockManager, Settings,
    SqliteStore, ThreadTree, sweep,
};
use serde::Serialize;
use threadtree_types::{CommentId, TreeId};

#[derive(Parser)]
#[command(name = "ttc", about = "Threaded comment trees on a nested-set encoding")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true, default_value = "threadtree.sqlite3")]
    db: PathBuf,

    /// Settings file (defaults to <config dir>/threadtree/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Post a new root comment or a reply
    Post {
        #[arg(long)]
        target: String,
        #[arg(long)]
        author_id: String,
        #[arg(long)]
        author_name: String,
        #[arg(long)]
        body: String,
        /// Reply to this comment instead of starting a new tree
        #[arg(long)]
        parent: Option<CommentId>,
        #[arg(long)]
        anonymous: bool,
        #[arg(long)]
        ip: Option<String>,
    },
    /// Ancestors of a comment
    Ancestors {
        id: CommentId,
        #[arg(long)]
        include_self: bool,
        /// Walk upwards from the comment instead of down from the root
        #[arg(long)]
        ascending: bool,
    },
    /// Descendants of a comment in document order
    Descendants {
        id: CommentId,
        #[arg(long)]
        include_self: bool,
    },
    /// A single comment
    Show { id: CommentId },
    /// Every node of a tree, with an invariant check
    Tree { tree_id: TreeId },
    /// Comments attached to a target, newest first
    Target {
        target: String,
        #[arg(long)]
        include_moderated: bool,
    },
    /// Change moderation flags
    Moderate {
        id: CommentId,
        #[arg(long)]
        public: Option<bool>,
        #[arg(long)]
        removed: Option<bool>,
    },
    /// Replace the body of a comment
    Edit {
        id: CommentId,
        #[arg(long)]
        body: String,
    },
    /// Inspect and clear tree locks
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
}

#[derive(Subcommand)]
enum LocksCommand {
    /// Locks currently held
    List {
        /// Only locks older than the configured stale age
        #[arg(long)]
        stale: bool,
    },
    /// Force-release every stale lock
    Sweep,
    /// Force-release the lock of one tree
    Release { tree_id: TreeId },
}

/// A comment as shown to readers, with the author to display.
#[derive(Serialize)]
struct CommentView<'a> {
    #[serde(flatten)]
    comment: &'a Comment,
    display_author: &'a Author,
}

#[derive(Serialize)]
struct TreeView<'a> {
    tree_id: TreeId,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    violation: Option<String>,
    comments: Vec<CommentView<'a>>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp_millis()
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn views<'a, S, L>(tree: &'a ThreadTree<'_, S, L>, comments: &'a [Comment]) -> Vec<CommentView<'a>>
where
    S: nested_set::CommentStore,
    L: LockManager + ?Sized,
{
    comments
        .iter()
        .map(|comment| CommentView {
            comment,
            display_author: tree.author_of(comment),
        })
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = config::load_settings(cli.config.as_deref())?;
    let store = SqliteStore::open(&cli.db, &settings)
        .with_context(|| format!("failed to open database {}", cli.db.display()))?;
    let memory_locks = MemoryLockManager::new();
    let locks: &dyn LockManager = match settings.lock.backend {
        LockBackend::Storage => &store,
        LockBackend::Memory => {
            log::warn!("memory lock backend only excludes writers inside this ttc process");
            &memory_locks
        }
    };

    run(cli.command, &store, locks, &settings)
}

fn run(
    command: Command,
    store: &SqliteStore,
    locks: &dyn LockManager,
    settings: &Settings,
) -> Result<()> {
    let tree = ThreadTree::new(store, locks, settings);

    match command {
        Command::Post {
            target,
            author_id,
            author_name,
            body,
            parent,
            anonymous,
            ip,
        } => {
            let mut draft = CommentDraft::new(target, Author::new(author_id, author_name), body);
            if anonymous {
                draft = draft.anonymous();
            }
            if let Some(ip) = ip {
                draft = draft.with_ip_address(ip);
            }
            let comment = tree
                .insert_with_retry(&draft, parent)
                .context("failed to post comment, try again")?;
            print_json(&views(&tree, std::slice::from_ref(&comment)))
        }
        Command::Ancestors {
            id,
            include_self,
            ascending,
        } => {
            let comments = tree.get_ancestors(id, include_self, ascending)?;
            print_json(&views(&tree, &comments))
        }
        Command::Descendants { id, include_self } => {
            let comments = tree.get_descendants(id, include_self)?;
            print_json(&views(&tree, &comments))
        }
        Command::Show { id } => {
            let comment = tree.get(id)?;
            print_json(&CommentView {
                comment: &comment,
                display_author: tree.author_of(&comment),
            })
        }
        Command::Tree { tree_id } => {
            let comments = tree.tree(tree_id)?;
            let violation = nested_set::check_tree(&comments).err().map(|e| e.to_string());
            print_json(&TreeView {
                tree_id,
                valid: violation.is_none(),
                violation,
                comments: views(&tree, &comments),
            })
        }
        Command::Target {
            target,
            include_moderated,
        } => {
            let comments = tree.comments_for_target(&target, include_moderated)?;
            print_json(&views(&tree, &comments))
        }
        Command::Moderate {
            id,
            public,
            removed,
        } => {
            let comment = tree.update(
                id,
                nested_set::CommentUpdate {
                    is_public: public,
                    is_removed: removed,
                    body: None,
                },
            )?;
            print_json(&views(&tree, std::slice::from_ref(&comment)))
        }
        Command::Edit { id, body } => {
            let comment = tree.edit_body(id, body)?;
            print_json(&views(&tree, std::slice::from_ref(&comment)))
        }
        Command::Locks { command } => run_locks(command, locks, settings),
    }
}

fn run_locks(command: LocksCommand, locks: &dyn LockManager, settings: &Settings) -> Result<()> {
    if settings.lock.backend == LockBackend::Memory {
        anyhow::bail!(
            "memory locks live only inside one process; set lock.backend to \"storage\" to inspect locks"
        );
    }
    let stale_after = settings.lock.stale_after();
    match command {
        LocksCommand::List { stale } => {
            let held = if stale {
                sweep::find_orphaned(locks, stale_after, chrono::Utc::now())?
            } else {
                locks.held()?
            };
            print_json(&held)
        }
        LocksCommand::Sweep => {
            let released = sweep::release_orphaned(locks, stale_after, chrono::Utc::now())?;
            print_json(&released)
        }
        LocksCommand::Release { tree_id } => {
            let released = locks.force_release(tree_id)?;
            if released {
                log::warn!("force-released lock on tree {}", tree_id);
            }
            print_json(&serde_json::json!({ "treeId": tree_id, "released": released }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_post_reply() {
        let cli = Cli::parse_from([
            "ttc",
            "--db",
            "x.sqlite3",
            "post",
            "--target",
            "article:1",
            "--author-id",
            "u1",
            "--author-name",
            "alice",
            "--body",
            "hi",
            "--parent",
            "3",
        ]);
        match cli.command {
            Command::Post { parent, .. } => assert_eq!(parent, Some(CommentId::from(3))),
            _ => panic!("expected post"),
        }
    }

    #[test]
    fn test_run_post_and_ancestors() {
        let db = test_db::TestDb::new().unwrap();
        let settings = Settings::default();
        let store = SqliteStore::open(db.path(), &settings).unwrap();
        let post = |parent: Option<CommentId>| Command::Post {
            target: "article:1".to_string(),
            author_id: "u1".to_string(),
            author_name: "alice".to_string(),
            body: "hello".to_string(),
            parent,
            anonymous: false,
            ip: None,
        };

        run(post(None), &store, &store, &settings).unwrap();
        run(post(Some(CommentId::from(1))), &store, &store, &settings).unwrap();
        run(
            Command::Ancestors {
                id: CommentId::from(2),
                include_self: true,
                ascending: false,
            },
            &store,
            &store,
            &settings,
        )
        .unwrap();

        let err = run(post(Some(CommentId::from(99))), &store, &store, &settings).unwrap_err();
        assert!(format!("{err:#}").contains("try again"));
    }

    #[test]
    fn test_locks_commands_need_storage_backend() {
        let mut settings = Settings::default();
        settings.lock.backend = LockBackend::Memory;
        let store = SqliteStore::open_in_memory().unwrap();
        let locks = MemoryLockManager::new();

        let err = run(
            Command::Locks {
                command: LocksCommand::Sweep,
            },
            &store,
            &locks,
            &settings,
        )
        .unwrap_err();
        assert!(err.to_string().contains("storage"));

        settings.lock.backend = LockBackend::Storage;
        run(
            Command::Locks {
                command: LocksCommand::List { stale: false },
            },
            &store,
            &store,
            &settings,
        )
        .unwrap();
    }
}
