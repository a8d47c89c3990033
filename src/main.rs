use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use macblock::blocklist::UpdateOptions;
use macblock::error::{MacblockError, Result};
use macblock::logs::{Component, LogStream};
use macblock::paths::{Paths, REEXEC_ENV};
use macblock::{control, daemon, dns_test, install, logs, status};

/// Local DNS sinkhole for macOS: blocklisted domains answer NXDOMAIN,
/// everything else is forwarded to the right upstream.
#[derive(Parser, Debug)]
#[command(name = "macblock", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show current state and component health
    Status,
    /// Run read-only diagnostics
    Doctor,
    /// Install system integration (root)
    Install {
        #[arg(long)]
        force: bool,
        /// Skip the initial blocklist download
        #[arg(long)]
        skip_update: bool,
    },
    /// Remove system integration (root)
    Uninstall {
        #[arg(long)]
        force: bool,
    },
    /// Turn blocking on (root)
    Enable,
    /// Turn blocking off and restore DNS (root)
    Disable,
    /// Suspend blocking for a duration like 30s, 10m, 2h, 1d (root)
    Pause { duration: String },
    /// End a pause immediately (root)
    Resume,
    /// Download and apply the blocklist (root)
    Update {
        /// Catalog name or custom https URL
        #[arg(long)]
        source: Option<String>,
        /// Expected SHA-256 of the download
        #[arg(long)]
        sha256: Option<String>,
        /// Safety-floor override, custom https sources only
        #[arg(long)]
        floor: Option<usize>,
    },
    /// Manage blocklist sources
    Sources {
        #[command(subcommand)]
        cmd: SourcesCmd,
    },
    /// Manage the never-block list (root for add/remove)
    Allow {
        #[command(subcommand)]
        cmd: ListCmd,
    },
    /// Manage the always-block list (root for add/remove)
    Deny {
        #[command(subcommand)]
        cmd: ListCmd,
    },
    /// Manage fallback upstream servers
    Upstreams {
        #[command(subcommand)]
        cmd: UpstreamsCmd,
    },
    /// Query a domain against the loopback resolver
    Test { domain: String },
    /// Show component logs
    Logs {
        /// Which component's log to read
        #[arg(value_enum, default_value = "daemon")]
        component: ComponentArg,
        #[arg(long)]
        follow: bool,
        #[arg(long, value_enum, default_value = "auto")]
        stream: StreamArg,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Run the reconcile daemon (launchd entry point)
    #[command(hide = true)]
    Daemon,
}

#[derive(Subcommand, Debug)]
enum SourcesCmd {
    /// List available sources
    List,
    /// Select a source; takes effect on the next update (root)
    Set { source: String },
}

#[derive(Subcommand, Debug)]
enum ListCmd {
    Add { domain: String },
    Remove { domain: String },
    List,
}

#[derive(Subcommand, Debug)]
enum UpstreamsCmd {
    /// Show the fallback upstream IPs
    List,
    /// Replace the fallback upstream IPs (root)
    Set { ips: Vec<String> },
    /// Restore the built-in fallback upstreams (root)
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ComponentArg {
    Daemon,
    Dnsmasq,
}

impl From<ComponentArg> for Component {
    fn from(c: ComponentArg) -> Self {
        match c {
            ComponentArg::Daemon => Self::Daemon,
            ComponentArg::Dnsmasq => Self::Dnsmasq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StreamArg {
    Stdout,
    Stderr,
    Auto,
}

impl From<StreamArg> for LogStream {
    fn from(s: StreamArg) -> Self {
        match s {
            StreamArg::Stdout => Self::Stdout,
            StreamArg::Stderr => Self::Stderr,
            StreamArg::Auto => Self::Auto,
        }
    }
}

fn requires_root(cmd: &Cmd) -> bool {
    match cmd {
        Cmd::Install { .. }
        | Cmd::Uninstall { .. }
        | Cmd::Enable
        | Cmd::Disable
        | Cmd::Pause { .. }
        | Cmd::Resume
        | Cmd::Update { .. }
        | Cmd::Daemon => true,
        Cmd::Sources { cmd } => matches!(cmd, SourcesCmd::Set { .. }),
        Cmd::Allow { cmd } | Cmd::Deny { cmd } => {
            matches!(cmd, ListCmd::Add { .. } | ListCmd::Remove { .. })
        }
        Cmd::Upstreams { cmd } => {
            matches!(cmd, UpstreamsCmd::Set { .. } | UpstreamsCmd::Reset)
        }
        Cmd::Status | Cmd::Doctor | Cmd::Test { .. } | Cmd::Logs { .. } => false,
    }
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn stdin_is_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal()
}

/// Re-execs under sudo with a scrubbed environment: only the marker, TERM,
/// LANG and LC_* cross the privilege boundary. Anything that could steer
/// binary discovery (MACBLOCK_BIN, MACBLOCK_DNSMASQ_BIN, PATH tricks) is
/// deliberately dropped.
fn reexec_with_sudo() -> Result<ExitCode> {
    if std::env::var_os(REEXEC_ENV).is_some() {
        return Err(MacblockError::Privilege(
            "still unprivileged after sudo re-exec; run the command as root".to_string(),
        ));
    }
    if !stdin_is_tty() {
        return Err(MacblockError::Privilege(
            "this command requires root; re-run with sudo".to_string(),
        ));
    }

    let exe = std::env::current_exe()
        .map_err(|e| MacblockError::Platform(format!("cannot locate own binary: {e}")))?;

    let mut cmd = std::process::Command::new("/usr/bin/sudo");
    cmd.env_clear();
    for (key, value) in std::env::vars_os() {
        let k = key.to_string_lossy();
        if k == "TERM" || k == "LANG" || k.starts_with("LC_") {
            cmd.env(&key, &value);
        }
    }
    cmd.arg(format!("{REEXEC_ENV}=1"));
    cmd.arg(exe);
    cmd.args(std::env::args_os().skip(1));

    let code = cmd
        .status()
        .map_err(|e| MacblockError::Platform(format!("cannot run sudo: {e}")))?
        .code()
        .unwrap_or(1);
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

async fn dispatch(cmd: Cmd, paths: &Paths) -> Result<i32> {
    match cmd {
        Cmd::Status => status::show_status(paths).await,
        Cmd::Doctor => status::run_doctor(paths).await,
        Cmd::Install { force, skip_update } => {
            install::do_install(paths, force, skip_update).await.map(|()| 0)
        }
        Cmd::Uninstall { force } => install::do_uninstall(paths, force).await,
        Cmd::Enable => control::do_enable(paths).await.map(|()| 0),
        Cmd::Disable => control::do_disable(paths).await.map(|()| 0),
        Cmd::Pause { duration } => control::do_pause(paths, &duration).await.map(|()| 0),
        Cmd::Resume => control::do_resume(paths).await.map(|()| 0),
        Cmd::Update { source, sha256, floor } => {
            let opts = UpdateOptions { source, sha256, floor };
            control::do_update(paths, &opts).await.map(|()| 0)
        }
        Cmd::Sources { cmd } => match cmd {
            SourcesCmd::List => control::sources_list(paths).map(|()| 0),
            SourcesCmd::Set { source } => control::sources_set(paths, &source).map(|()| 0),
        },
        Cmd::Allow { cmd } => {
            let file = paths.whitelist_file();
            match cmd {
                ListCmd::Add { domain } => control::list_add(paths, &file, &domain).await.map(|()| 0),
                ListCmd::Remove { domain } => {
                    control::list_remove(paths, &file, &domain).await.map(|()| 0)
                }
                ListCmd::List => control::list_show(&file).map(|()| 0),
            }
        }
        Cmd::Deny { cmd } => {
            let file = paths.blacklist_file();
            match cmd {
                ListCmd::Add { domain } => control::list_add(paths, &file, &domain).await.map(|()| 0),
                ListCmd::Remove { domain } => {
                    control::list_remove(paths, &file, &domain).await.map(|()| 0)
                }
                ListCmd::List => control::list_show(&file).map(|()| 0),
            }
        }
        Cmd::Upstreams { cmd } => match cmd {
            UpstreamsCmd::List => control::upstreams_list(paths).map(|()| 0),
            UpstreamsCmd::Set { ips } => control::upstreams_set(paths, &ips).await.map(|()| 0),
            UpstreamsCmd::Reset => control::upstreams_reset(paths).await.map(|()| 0),
        },
        Cmd::Test { domain } => dns_test::run_test(&domain).await,
        Cmd::Logs { component, follow, stream, lines } => {
            logs::show_logs(paths, component.into(), lines, follow, stream.into()).await
        }
        Cmd::Daemon => daemon::run_daemon(paths).await,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if matches!(cli.cmd, Cmd::Daemon) { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !cfg!(target_os = "macos") {
        eprintln!("error: macblock only runs on macOS");
        return ExitCode::from(2);
    }

    if requires_root(&cli.cmd) && !is_root() {
        return match reexec_with_sudo() {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(e.exit_code().clamp(0, 255) as u8)
            }
        };
    }

    let paths = Paths::system();
    match dispatch(cli.cmd, &paths).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}
