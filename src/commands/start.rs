use std::{
    env, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use clap::Args;
use serde::{Deserialize, Serialize};

use fleetlink::{
    config::{Config, ConfigUpdate, load_or_default},
    logging, server,
};

use super::process;

#[derive(Args, Clone, Default)]
pub struct StartArgs {
    /// Override the configured server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the configured data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Run the server in the foreground instead of daemonizing
    #[arg(long)]
    pub foreground: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

pub async fn execute(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    if args.foreground {
        start_foreground(config_path, args).await
    } else {
        start_daemon(config_path, args)?;
        Ok(())
    }
}

pub async fn run_internal(config_path: Option<PathBuf>) -> Result<()> {
    start_foreground(config_path, StartArgs::default()).await
}

pub fn stop(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let pid_path = config.pid_file_path();

    let Some(record) = read_pid_record(&pid_path)? else {
        println!("No running FleetLink server found.");
        return Ok(());
    };
    let pid = record.pid;

    if !process::is_alive(pid) {
        remove_pid_file(&pid_path)?;
        println!("Removed stale FleetLink server pid file.");
        return Ok(());
    }

    process::request_stop(pid)?;
    if !process::await_exit(pid, Duration::from_secs(5)) {
        #[cfg(unix)]
        {
            process::force_kill(pid)?;
            if !process::await_exit(pid, Duration::from_secs(2)) {
                return Err(anyhow!(
                    "failed to stop FleetLink server (pid {pid}); process is still running"
                ));
            }
        }
        #[cfg(not(unix))]
        {
            return Err(anyhow!(
                "failed to stop FleetLink server (pid {pid}); process is still running"
            ));
        }
    }

    remove_pid_file(&pid_path)?;
    if let Some(started_at) = record.started_at {
        println!(
            "FleetLink server stopped (pid {}) after {} (started {})",
            pid,
            describe_uptime(started_at),
            started_at.to_rfc3339()
        );
    } else {
        println!("FleetLink server stopped (pid {})", pid);
    }
    Ok(())
}

pub fn status(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let pid_path = config.pid_file_path();

    match read_pid_record(&pid_path)? {
        Some(record) => {
            let pid = record.pid;
            if process::is_alive(pid) {
                if let Some(started_at) = record.started_at {
                    println!(
                        "FleetLink server is running on port {} (pid {}) - up for {} (since {})",
                        config.port,
                        pid,
                        describe_uptime(started_at),
                        started_at.to_rfc3339()
                    );
                } else {
                    println!(
                        "FleetLink server is running on port {} (pid {})",
                        config.port, pid
                    );
                }
            } else {
                let _ = fs::remove_file(&pid_path);
                println!("FleetLink server is not running (removed stale pid file).");
            }
        }
        None => {
            println!("FleetLink server is not running.");
        }
    }

    Ok(())
}

pub fn destroy(config_path: Option<PathBuf>, args: DestroyArgs) -> Result<()> {
    let (config, path) = load_or_default(config_path)?;

    if !args.yes {
        eprint!(
            "This will permanently delete all FleetLink data under {} and remove the config file at {}.\nType \"destroy\" to continue: ",
            config.data_dir.display(),
            path.display()
        );
        io::stderr().flush()?;
        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim() != "destroy" {
            println!("Destroy command cancelled.");
            return Ok(());
        }
    }

    if let Err(err) = stop(Some(path.clone())) {
        eprintln!("warning: failed to stop running server before destroy: {err}");
    }

    if config.data_dir.exists() {
        fs::remove_dir_all(&config.data_dir)?;
    }

    if path.exists() {
        fs::remove_file(&path)?;
    }

    println!(
        "All FleetLink data and configuration removed from {}",
        config.data_dir.display()
    );
    Ok(())
}

async fn start_foreground(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (config, _path) = load_and_update_config(config_path, &args)?;
    logging::init()?;
    let pid_path = config.pid_file_path();
    ensure_pid_slot(&pid_path)?;
    let _pid_guard = PidFileGuard::new(&pid_path)?;
    eprintln!(
        "configuration loaded; starting server (pid={})",
        std::process::id()
    );
    server::run(config).await?;
    Ok(())
}

fn start_daemon(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (config, path) = load_and_update_config(config_path, &args)?;
    let pid_path = config.pid_file_path();

    ensure_pid_slot(&pid_path)?;

    let mut command = Command::new(env::current_exe()?);
    command.arg("--config").arg(&path);
    command.arg("__internal:server");
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    let mut child = command.spawn()?;
    let pid = child.id();

    let wait_deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(status) = child.try_wait()? {
            let message = if let Some(code) = status.code() {
                format!(
                    "FleetLink server failed to start (process exited with status {code}). \
                     Re-run with `fleetlink start --foreground` for details."
                )
            } else {
                "FleetLink server failed to start (process terminated unexpectedly). \
                 Re-run with `fleetlink start --foreground` for details."
                    .to_string()
            };
            return Err(anyhow!(message));
        }

        if Instant::now() >= wait_deadline {
            break;
        }

        thread::sleep(Duration::from_millis(100));
    }

    let started_at = chrono::Utc::now();
    let record = PidRecord {
        pid,
        started_at: Some(started_at),
    };
    write_pid_record(&pid_path, &record)?;

    drop(child);

    println!(
        "FleetLink server is running on port {} (pid {}) since {}",
        config.port,
        pid,
        started_at.to_rfc3339()
    );
    Ok(())
}

fn load_and_update_config(
    config_path: Option<PathBuf>,
    args: &StartArgs,
) -> Result<(Config, PathBuf)> {
    let (mut config, path) = load_or_default(config_path)?;
    config.apply_update(ConfigUpdate {
        port: args.port,
        data_dir: args.data_dir.clone(),
        ..ConfigUpdate::default()
    });
    config.ensure_data_dir()?;
    config.save(&path)?;
    Ok((config, path))
}

fn remove_pid_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PidRecord {
    pid: u32,
    #[serde(default)]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    fn new(path: &Path) -> Result<Self> {
        let record = PidRecord {
            pid: std::process::id(),
            started_at: Some(chrono::Utc::now()),
        };
        write_pid_record(path, &record)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn write_pid_record(path: &Path, record: &PidRecord) -> Result<()> {
    let contents = serde_json::to_string(record)?;
    fs::write(path, contents)?;
    Ok(())
}

fn ensure_pid_slot(pid_path: &Path) -> Result<()> {
    if let Some(existing) = read_pid_record(pid_path)? {
        if process::is_alive(existing.pid) {
            return Err(anyhow!(
                "FleetLink server already running (pid {})",
                existing.pid
            ));
        }
        fs::remove_file(pid_path)?;
    }

    Ok(())
}

fn read_pid_record(path: &Path) -> Result<Option<PidRecord>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    if let Ok(record) = serde_json::from_str::<PidRecord>(trimmed) {
        return Ok(Some(record));
    }

    if let Ok(pid) = trimmed.parse::<u32>() {
        return Ok(Some(PidRecord {
            pid,
            started_at: None,
        }));
    }

    Err(anyhow!("invalid pid file at {}", path.display()))
}

fn describe_uptime(started_at: chrono::DateTime<chrono::Utc>) -> String {
    match chrono::Utc::now()
        .signed_duration_since(started_at)
        .to_std()
    {
        Ok(elapsed) => format_uptime(elapsed),
        Err(_) => "unknown duration".to_string(),
    }
}

/// Largest-first rendering ("2d 3h 4m"), capped at three components.
fn format_uptime(duration: Duration) -> String {
    const UNITS: [(u64, &str); 4] = [(86_400, "d"), (3_600, "h"), (60, "m"), (1, "s")];

    let total = duration.as_secs();
    if total == 0 {
        return "under 1s".to_string();
    }

    let mut remaining = total;
    let mut parts = Vec::new();
    for (size, suffix) in UNITS {
        let count = remaining / size;
        remaining %= size;
        if count > 0 {
            parts.push(format!("{count}{suffix}"));
        }
        if parts.len() == 3 {
            break;
        }
    }
    parts.join(" ")
}
