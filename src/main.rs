//! hoard - content-addressed storage for large data directories

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hoard::{
    build_tree, compare_indexed, expand_wanted, transfer, verify, Checkout, CountingProgress,
    HashAlgorithm, HashInfo, LinkType, ObjectDb, Repo, Tree, TreeArena, TransferOptions, WorkerPool,
};

#[derive(Parser)]
#[command(name = "hoard")]
#[command(about = "content-addressed storage, transfer and checkout of data directories")]
#[command(version)]
struct Cli {
    /// project root
    #[arg(short, long, env = "HOARD_REPO", default_value = ".")]
    repo: PathBuf,

    /// worker threads, overrides core.jobs
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// more logging, repeatable
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new repository
    Init {
        /// digest for every object: sha256 or blake3
        #[arg(long, default_value = "sha256")]
        hash: HashAlgorithm,
    },

    /// store a directory and print its tree hash
    Add {
        /// directory to store
        source: PathBuf,
    },

    /// show what a remote lacks
    Status {
        remote: String,

        /// tree or file hash
        hash: String,

        /// compare the other way round, remote to local
        #[arg(long)]
        pull: bool,
    },

    /// copy objects to a remote
    Push {
        remote: String,
        hash: String,

        /// re-hash objects as they arrive
        #[arg(long)]
        verify: bool,
    },

    /// copy objects from a remote into the local cache
    Pull {
        remote: String,
        hash: String,

        /// re-hash objects as they arrive
        #[arg(long)]
        verify: bool,
    },

    /// materialize a tree into a directory
    Checkout {
        /// tree hash
        hash: String,

        /// destination directory
        destination: PathBuf,

        /// strategies to try in order, overrides checkout.link_types
        #[arg(long, value_delimiter = ',')]
        link: Vec<LinkType>,
    },

    /// manage remotes
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },

    /// print an object
    Cat {
        hash: String,

        /// treat the hash as a tree and list it
        #[arg(long)]
        dir: bool,
    },

    /// re-hash every stored object
    Verify {
        /// check a remote instead of the local cache
        #[arg(long)]
        remote: Option<String>,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// add a remote store
    Add { name: String, url: String },
    /// remove a remote and its index
    Remove { name: String },
    /// list remotes
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("HOARD_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> hoard::Result<()> {
    match cli.command {
        Commands::Init { hash } => {
            Repo::init(&cli.repo, hash)?;
            println!("initialized hoard repository at {}", cli.repo.display());
        }

        Commands::Add { source } => {
            let repo = Repo::open(&cli.repo)?;
            let _lock = repo.lock()?;
            let odb = repo.odb()?;
            let state = repo.state()?;
            let jobs = cli.jobs.unwrap_or_else(|| repo.jobs());

            let hash = build_tree(&odb, &state, &source, jobs)?;
            println!("{}", hash);
        }

        Commands::Status { remote, hash, pull } => {
            let repo = Repo::open(&cli.repo)?;
            let local = repo.odb()?;
            let other = repo.remote_odb(&remote)?;
            let index = repo.remote_index(&remote)?;
            let pool = WorkerPool::new(cli.jobs.unwrap_or_else(|| repo.jobs()))?;
            let hash = parse_hash(&repo, &hash)?;

            let (src, dest) = if pull { (&other, &local) } else { (&local, &other) };
            let mut arena = TreeArena::new();
            let wanted = expand_wanted(&[&local, &other], &BTreeSet::from([hash]), &mut arena)?;
            let status = if pull {
                hoard::compare(src, dest, &wanted, true, &pool)
            } else {
                compare_indexed(src, dest, &wanted, true, &pool, &index)
            };

            println!(
                "{} new, {} missing, {} up to date",
                status.new.len(),
                status.missing.len(),
                status.ok.len()
            );
            for h in &status.new {
                println!("new      {}", h);
            }
            for h in &status.missing {
                println!("missing  {}", h);
            }
        }

        Commands::Push {
            remote,
            hash,
            verify,
        } => {
            let repo = Repo::open(&cli.repo)?;
            let _lock = repo.lock()?;
            let local = repo.odb()?;
            let dest = repo.remote_odb(&remote)?;
            let index = repo.remote_index(&remote)?;
            let hash = parse_hash(&repo, &hash)?;

            let progress = CountingProgress::new();
            let options = TransferOptions {
                jobs: cli.jobs.unwrap_or_else(|| repo.jobs()),
                verify,
                index: Some(&index),
                progress: &progress,
                ..Default::default()
            };
            let copied = transfer(&local, &dest, &BTreeSet::from([hash]), &options)?;
            println!(
                "pushed {} object(s) to {} ({} attempted)",
                copied,
                remote,
                progress.count()
            );
        }

        Commands::Pull {
            remote,
            hash,
            verify,
        } => {
            let repo = Repo::open(&cli.repo)?;
            let _lock = repo.lock()?;
            let local = repo.odb()?;
            let src = repo.remote_odb(&remote)?;
            let hash = parse_hash(&repo, &hash)?;

            let progress = CountingProgress::new();
            let options = TransferOptions {
                jobs: cli.jobs.unwrap_or_else(|| repo.jobs()),
                verify,
                hardlink: true,
                cache: Some(&local),
                progress: &progress,
                ..Default::default()
            };
            let copied = transfer(&src, &local, &BTreeSet::from([hash]), &options)?;
            println!(
                "pulled {} object(s) from {} ({} attempted)",
                copied,
                remote,
                progress.count()
            );
        }

        Commands::Checkout {
            hash,
            destination,
            link,
        } => {
            let repo = Repo::open(&cli.repo)?;
            let _lock = repo.lock()?;
            let odb = repo.odb()?;
            let state = repo.state()?;
            let hash = parse_hash(&repo, &hash)?;

            let mut options = repo.checkout_options();
            if !link.is_empty() {
                options.link_types = link;
            }
            if let Some(jobs) = cli.jobs {
                options.jobs = jobs;
            }

            let stats = Checkout::new(&odb, &state, options).checkout(&destination, &hash)?;
            println!(
                "checked out {} to {}: {} reflinked, {} hardlinked, {} symlinked, {} copied, {} unchanged",
                hash,
                destination.display(),
                stats.reflinked,
                stats.hardlinked,
                stats.symlinked,
                stats.copied,
                stats.skipped
            );
        }

        Commands::Remote { command } => {
            let mut repo = Repo::open(&cli.repo)?;
            match command {
                RemoteCommands::Add { name, url } => {
                    repo.config_mut().add_remote(&name, &url)?;
                    repo.save_config()?;
                    println!("added remote {} -> {}", name, url);
                }
                RemoteCommands::Remove { name } => {
                    repo.remove_remote(&name)?;
                    println!("removed remote {}", name);
                }
                RemoteCommands::List => {
                    for remote in &repo.config().remotes {
                        println!("{}\t{}", remote.name, remote.url);
                    }
                }
            }
        }

        Commands::Cat { hash, dir } => {
            let repo = Repo::open(&cli.repo)?;
            let odb = repo.odb()?;
            let mut hash = parse_hash(&repo, &hash)?;
            hash.is_dir |= dir;

            if hash.is_dir {
                print_tree(&odb, &hash)?;
            } else {
                let mut stdout = io::stdout().lock();
                odb.get(&hash)?.read_to(&mut stdout)?;
                stdout.flush().map_err(|e| hoard::Error::io("<stdout>", e))?;
            }
        }

        Commands::Verify { remote } => {
            let repo = Repo::open(&cli.repo)?;
            let odb = match &remote {
                Some(name) => repo.remote_odb(name)?,
                None => repo.odb()?,
            };
            let report = verify(&odb, cli.jobs.unwrap_or_else(|| repo.jobs()))?;

            println!("objects checked: {}", report.checked);
            if !report.corrupt.is_empty() {
                println!("\ncorrupt objects:");
                for obj in &report.corrupt {
                    println!("  {}: {}", obj.hash, obj.message);
                }
                return Err(hoard::Error::Corrupt(report.corrupt.len()));
            }
            println!("store is healthy");
        }
    }

    Ok(())
}

fn parse_hash(repo: &Repo, s: &str) -> hoard::Result<HashInfo> {
    HashInfo::parse_display(repo.config().core.hash, s)
}

fn print_tree(odb: &ObjectDb, hash: &HashInfo) -> hoard::Result<()> {
    let tree = Tree::load(odb, hash)?;
    for entry in tree.entries() {
        let mode = entry
            .mode
            .map(|m| format!("{:06o}", m))
            .unwrap_or_else(|| "-".to_string());
        let kind = if entry.hash.is_dir { "tree" } else { "file" };
        println!("{} {} {}\t{}", mode, kind, entry.hash.value, entry.path);
    }
    Ok(())
}
